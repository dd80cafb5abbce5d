use std::collections::BTreeMap;
use std::ffi::OsString;
#[cfg(target_os = "linux")]
use std::os::unix::io::RawFd;

#[cfg(target_os = "freebsd")]
use nix::mount::Nmount;
#[cfg(target_os = "linux")]
use nix::unistd;

use crate::abi::{
    DEFAULT_CONGESTION_THRESHOLD, DEFAULT_MAX_BACKGROUND, FUSE_ASYNC_READ, FUSE_ATOMIC_O_TRUNC,
    FUSE_AUTO_INVAL_DATA, FUSE_BIG_WRITES, FUSE_CACHE_SYMLINKS, FUSE_DONT_MASK,
    FUSE_DO_READDIRPLUS, FUSE_EXPORT_SUPPORT, FUSE_FILE_OPS, FUSE_HANDLE_KILLPRIV,
    FUSE_MAX_PAGES, FUSE_NO_OPENDIR_SUPPORT, FUSE_NO_OPEN_SUPPORT, FUSE_PARALLEL_DIROPS,
    FUSE_READDIRPLUS_AUTO, FUSE_WRITEBACK_CACHE,
};
#[cfg(feature = "file-lock")]
use crate::abi::{FUSE_FLOCK_LOCKS, FUSE_POSIX_LOCKS};
use crate::CancelToken;

/// mount options.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MountConfig {
    /// the parent cancellation context every in-flight request's
    /// [`CancelToken`][crate::CancelToken] is descended from; cancelling it
    /// (from outside the mount, e.g. to fold FUSE shutdown into a larger
    /// application shutdown signal) marks every request still in flight as
    /// cancelled, the same as a kernel `FUSE_INTERRUPT` would for one.
    pub(crate) op_context: CancelToken,

    // Options implemented within fuse3
    pub(crate) nonempty: bool,

    // mount options
    pub(crate) allow_other: bool,
    pub(crate) allow_root: bool,
    pub(crate) custom_options: Option<OsString>,
    #[cfg(target_os = "linux")]
    pub(crate) dirsync: bool,
    pub(crate) default_permissions: bool,
    pub(crate) fs_name: Option<String>,
    /// the `fstype` reported to the kernel; distinct from `fs_name`, which is
    /// the `subtype=` mount option most tools display as the device name.
    pub(crate) fs_type: Option<String>,
    /// alias for the `subtype=` mount option value; when unset, `fs_name` is
    /// reused as the subtype (matching the pre-existing single-field
    /// behavior).
    pub(crate) subtype: Option<String>,
    #[cfg(target_os = "macos")]
    pub(crate) volume_name: Option<String>,
    pub(crate) gid: Option<u32>,
    #[cfg(target_os = "freebsd")]
    pub(crate) intr: bool,
    #[cfg(target_os = "linux")]
    pub(crate) nodiratime: bool,
    pub(crate) noatime: bool,
    #[cfg(target_os = "linux")]
    pub(crate) nodev: bool,
    pub(crate) noexec: bool,
    pub(crate) nosuid: bool,
    pub(crate) read_only: bool,
    #[cfg(target_os = "freebsd")]
    pub(crate) suiddir: bool,
    pub(crate) sync: bool,
    pub(crate) uid: Option<u32>,

    // Optional FUSE features
    pub(crate) dont_mask: bool,
    pub(crate) no_open_support: bool,
    pub(crate) no_open_dir_support: bool,
    pub(crate) handle_killpriv: bool,
    pub(crate) write_back: bool,
    pub(crate) force_readdir_plus: bool,
    pub(crate) vnode_caching: bool,
    pub(crate) symlink_caching: bool,
    pub(crate) atomic_trunc: bool,
    pub(crate) async_reads: bool,
    pub(crate) readdirplus: bool,
    pub(crate) parallel_dir_ops: bool,
    pub(crate) auto_inval_data: bool,

    // INIT negotiation overrides; `None` keeps the library default.
    pub(crate) max_readahead: Option<u32>,
    pub(crate) max_background: Option<u16>,
    pub(crate) congestion_threshold: Option<u16>,

    /// free-form mount options folded into the built option string verbatim,
    /// as `key=value` (or bare `key` when `value` is empty).
    pub(crate) options: BTreeMap<String, String>,

    // Other FUSE mount options
    // default 40000
    #[cfg(target_os = "linux")]
    pub(crate) rootmode: Option<u32>,
}

impl MountConfig {
    /// set the parent [`CancelToken`] every request dispatched on this mount
    /// descends from, default is a fresh, never-cancelled token. Cancelling
    /// the token passed here cancels every request still in flight at the
    /// time, the same way a kernel `FUSE_INTERRUPT` cancels one.
    pub fn op_context(&mut self, op_context: CancelToken) -> &mut Self {
        self.op_context = op_context;

        self
    }

    /// set fuse filesystem mount `user_id`, default is current uid.
    pub fn uid(&mut self, uid: u32) -> &mut Self {
        self.uid.replace(uid);

        self
    }

    /// set fuse filesystem mount `group_id`, default is current gid.
    pub fn gid(&mut self, gid: u32) -> &mut Self {
        self.gid.replace(gid);

        self
    }

    /// set fuse filesystem name, default is **fuse**.
    pub fn fs_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.fs_name.replace(name.into());

        self
    }

    /// set fuse filesystem `rootmode`, default is 40000.
    #[cfg(target_os = "linux")]
    pub fn rootmode(&mut self, rootmode: u32) -> &mut Self {
        self.rootmode.replace(rootmode);

        self
    }

    /// set fuse filesystem `allow_root` mount option, default is disable.
    pub fn allow_root(&mut self, allow_root: bool) -> &mut Self {
        self.allow_root = allow_root;

        self
    }

    /// set fuse filesystem `allow_other` mount option, default is disable.
    pub fn allow_other(&mut self, allow_other: bool) -> &mut Self {
        self.allow_other = allow_other;

        self
    }

    /// set fuse filesystem `ro` mount option, default is disable.
    pub fn read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;

        self
    }

    /// allow fuse filesystem mount on a non-empty directory, default is not allowed.
    pub fn nonempty(&mut self, nonempty: bool) -> &mut Self {
        self.nonempty = nonempty;

        self
    }

    /// set fuse filesystem `default_permissions` mount option, default is disable.
    ///
    /// When `default_permissions` is set, the kernel checks permissions
    /// itself and a host's `access`/`open` mode checks become redundant.
    pub fn default_permissions(&mut self, default_permissions: bool) -> &mut Self {
        self.default_permissions = default_permissions;

        self
    }

    /// don't apply umask to file mode on create operations, default is disable.
    pub fn dont_mask(&mut self, dont_mask: bool) -> &mut Self {
        self.dont_mask = dont_mask;

        self
    }

    /// make kernel support zero-message opens, default is disable
    pub fn no_open_support(&mut self, no_open_support: bool) -> &mut Self {
        self.no_open_support = no_open_support;

        self
    }

    /// make kernel support zero-message opendir, default is disable
    pub fn no_open_dir_support(&mut self, no_open_dir_support: bool) -> &mut Self {
        self.no_open_dir_support = no_open_dir_support;

        self
    }

    /// fs handle killing `suid`/`sgid`/`cap` on `write`/`chown`/`trunc`, default is disable.
    pub fn handle_killpriv(&mut self, handle_killpriv: bool) -> &mut Self {
        self.handle_killpriv = handle_killpriv;

        self
    }

    /// enable write back cache for buffered writes, default is disable.
    ///
    /// # Notes:
    ///
    /// if enable this feature, when write flags has `FUSE_WRITE_CACHE`, file handle is guessed.
    pub fn write_back(&mut self, write_back: bool) -> &mut Self {
        self.write_back = write_back;

        self
    }

    /// force filesystem use readdirplus only, when kernel use readdir will return `ENOSYS`,
    /// default is disable.
    ///
    /// # Notes:
    /// this may don't work with some old Linux Kernel.
    pub fn force_readdir_plus(&mut self, force_readdir_plus: bool) -> &mut Self {
        self.force_readdir_plus = force_readdir_plus;

        self
    }

    /// let the kernel cache vnodes across file handle reopens (`FUSE_FILE_OPS`),
    /// default is disable.
    pub fn enable_vnode_caching(&mut self, vnode_caching: bool) -> &mut Self {
        self.vnode_caching = vnode_caching;

        self
    }

    /// let the kernel cache `readlink` responses, default is disable.
    pub fn enable_symlink_caching(&mut self, symlink_caching: bool) -> &mut Self {
        self.symlink_caching = symlink_caching;

        self
    }

    /// let the kernel rely on the filesystem to handle the `O_TRUNC` open
    /// flag atomically, default is disable.
    pub fn enable_atomic_trunc(&mut self, atomic_trunc: bool) -> &mut Self {
        self.atomic_trunc = atomic_trunc;

        self
    }

    /// allow the kernel to issue asynchronous read requests, default is disable.
    pub fn enable_async_reads(&mut self, async_reads: bool) -> &mut Self {
        self.async_reads = async_reads;

        self
    }

    /// let the kernel fold `readdir` and per-entry `lookup` into `readdirplus`,
    /// default is disable.
    pub fn enable_readdirplus(&mut self, readdirplus: bool) -> &mut Self {
        self.readdirplus = readdirplus;

        self
    }

    /// allow the kernel to issue lookups and readdir concurrently against the
    /// same directory, default is disable.
    pub fn enable_parallel_dir_ops(&mut self, parallel_dir_ops: bool) -> &mut Self {
        self.parallel_dir_ops = parallel_dir_ops;

        self
    }

    /// let the kernel automatically invalidate cached pages when a file's
    /// size or mtime changes, default is disable.
    pub fn enable_auto_inval_data(&mut self, auto_inval_data: bool) -> &mut Self {
        self.auto_inval_data = auto_inval_data;

        self
    }

    /// set custom options for fuse filesystem, the custom options will be used in mount
    pub fn custom_options(&mut self, custom_options: impl Into<OsString>) -> &mut Self {
        self.custom_options = Some(custom_options.into());

        self
    }

    /// set the `fstype` the kernel reports for this mount, default is `fuse`.
    pub fn fs_type(&mut self, fs_type: impl Into<String>) -> &mut Self {
        self.fs_type.replace(fs_type.into());

        self
    }

    /// set the `subtype=` mount option, default is `fs_name`'s value.
    pub fn subtype(&mut self, subtype: impl Into<String>) -> &mut Self {
        self.subtype.replace(subtype.into());

        self
    }

    /// set the volume name shown by Finder, macOS only.
    #[cfg(target_os = "macos")]
    pub fn volume_name(&mut self, volume_name: impl Into<String>) -> &mut Self {
        self.volume_name.replace(volume_name.into());

        self
    }

    /// cap the `max_readahead` the kernel negotiates down to, default is the
    /// kernel's own requested value.
    pub fn max_readahead(&mut self, max_readahead: u32) -> &mut Self {
        self.max_readahead.replace(max_readahead);

        self
    }

    /// override the number of background requests the kernel queues before
    /// applying congestion back-pressure, default is [`DEFAULT_MAX_BACKGROUND`].
    pub fn max_background(&mut self, max_background: u16) -> &mut Self {
        self.max_background.replace(max_background);

        self
    }

    /// override the background queue depth at which the kernel marks the
    /// connection congested, default is [`DEFAULT_CONGESTION_THRESHOLD`].
    pub fn congestion_threshold(&mut self, congestion_threshold: u16) -> &mut Self {
        self.congestion_threshold.replace(congestion_threshold);

        self
    }

    /// add a free-form mount option, folded into the built option string as
    /// `key=value` (or bare `key` if `value` is empty).
    pub fn option(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.insert(key.into(), value.into());

        self
    }

    /// the `max_readahead` to report to the kernel: the lesser of what the
    /// kernel requested in `FUSE_INIT` and any cap set via
    /// [`Self::max_readahead`].
    pub(crate) fn negotiated_max_readahead(&self, kernel_requested: u32) -> u32 {
        match self.max_readahead {
            Some(cap) => kernel_requested.min(cap),
            None => kernel_requested,
        }
    }

    pub(crate) fn max_background_value(&self) -> u16 {
        self.max_background.unwrap_or(DEFAULT_MAX_BACKGROUND)
    }

    pub(crate) fn congestion_threshold_value(&self) -> u16 {
        self.congestion_threshold
            .unwrap_or(DEFAULT_CONGESTION_THRESHOLD)
    }

    /// reduce the kernel's requested `FUSE_INIT` flags down to the subset
    /// this library actually implements, additionally gated on whichever
    /// optional features this config turned on. Flags the kernel didn't ask
    /// for are never added back.
    pub(crate) fn negotiate_init_flags(&self, kernel_flags: u32) -> u32 {
        let mut supported = FUSE_BIG_WRITES | FUSE_EXPORT_SUPPORT | FUSE_MAX_PAGES;

        if !self.force_readdir_plus {
            supported |= FUSE_READDIRPLUS_AUTO;
        }

        if self.dont_mask {
            supported |= FUSE_DONT_MASK;
        }

        if self.no_open_support {
            supported |= FUSE_NO_OPEN_SUPPORT;
        }

        if self.no_open_dir_support {
            supported |= FUSE_NO_OPENDIR_SUPPORT;
        }

        if self.handle_killpriv {
            supported |= FUSE_HANDLE_KILLPRIV;
        }

        if self.write_back {
            supported |= FUSE_WRITEBACK_CACHE;
        }

        if self.vnode_caching {
            supported |= FUSE_FILE_OPS;
        }

        if self.symlink_caching {
            supported |= FUSE_CACHE_SYMLINKS;
        }

        if self.atomic_trunc {
            supported |= FUSE_ATOMIC_O_TRUNC;
        }

        if self.async_reads {
            supported |= FUSE_ASYNC_READ;
        }

        if self.readdirplus || self.force_readdir_plus {
            supported |= FUSE_DO_READDIRPLUS;
        }

        if self.parallel_dir_ops {
            supported |= FUSE_PARALLEL_DIROPS;
        }

        if self.auto_inval_data {
            supported |= FUSE_AUTO_INVAL_DATA;
        }

        #[cfg(feature = "file-lock")]
        {
            supported |= FUSE_POSIX_LOCKS | FUSE_FLOCK_LOCKS;
        }

        kernel_flags & supported
    }

    #[cfg(target_os = "freebsd")]
    pub(crate) fn build(&self) -> Nmount {
        use cstr::cstr;

        let mut nmount = Nmount::new();
        nmount
            .str_opt(cstr!("fstype"), cstr!("fusefs"))
            .str_opt(cstr!("from"), cstr!("/dev/fuse"));
        if self.allow_other {
            nmount.null_opt(cstr!("allow_other"));
        }
        if self.allow_root {
            nmount.null_opt(cstr!("allow_root"));
        }
        if self.default_permissions {
            nmount.null_opt(cstr!("default_permissions"));
        }
        if let Some(fs_name) = &self.fs_name {
            nmount.str_opt_owned(cstr!("subtype="), fs_name.as_str());
        }
        if self.intr {
            nmount.null_opt(cstr!("intr"));
        }
        if let Some(custom_options) = self.custom_options.as_ref() {
            nmount.null_opt_owned(custom_options.as_os_str());
        }
        // TODO: additional options: push_symlinks_in, max_read=, timeout=
        nmount
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn build(&self, fd: RawFd) -> OsString {
        let mut opts = vec![
            format!("fd={}", fd),
            format!(
                "user_id={}",
                self.uid.unwrap_or_else(|| unistd::getuid().as_raw())
            ),
            format!(
                "group_id={}",
                self.gid.unwrap_or_else(|| unistd::getgid().as_raw())
            ),
            format!("rootmode={}", self.rootmode.unwrap_or(40000)),
        ];

        if self.allow_root {
            opts.push("allow_root".to_string());
        }

        if self.allow_other {
            opts.push("allow_other".to_string());
        }

        if self.default_permissions {
            opts.push("default_permissions".to_string());
        }

        if let Some(subtype) = self.subtype.as_ref().or(self.fs_name.as_ref()) {
            opts.push(format!("subtype={subtype}"));
        }

        for (key, value) in &self.options {
            opts.push(if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            });
        }

        let mut options = OsString::from(opts.join(","));

        if let Some(custom_options) = &self.custom_options {
            options.push(",");
            options.push(custom_options);
        }

        options
    }

    #[cfg(all(target_os = "linux", feature = "unprivileged"))]
    pub(crate) fn build_with_unprivileged(&self) -> OsString {
        let mut opts = vec![
            format!(
                "user_id={}",
                self.uid.unwrap_or_else(|| unistd::getuid().as_raw())
            ),
            format!(
                "group_id={}",
                self.gid.unwrap_or_else(|| unistd::getgid().as_raw())
            ),
            format!("rootmode={}", self.rootmode.unwrap_or(40000)),
            format!(
                "fsname={}",
                self.fs_name.as_ref().unwrap_or(&"fuse".to_string())
            ),
        ];

        if self.allow_root {
            opts.push("allow_root".to_string());
        }

        if self.allow_other {
            opts.push("allow_other".to_string());
        }

        if matches!(self.read_only, true) {
            opts.push("ro".to_string());
        }

        if self.default_permissions {
            opts.push("default_permissions".to_string());
        }

        for (key, value) in &self.options {
            opts.push(if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            });
        }

        let mut options = OsString::from(opts.join(","));

        if let Some(custom_options) = &self.custom_options {
            options.push(",");
            options.push(custom_options);
        }

        options
    }

    #[cfg(target_os = "freebsd")]
    pub(crate) fn flags(&self) -> nix::mount::MntFlags {
        use nix::mount::MntFlags;

        let mut flags = MntFlags::empty();
        if self.noatime {
            flags.insert(MntFlags::MNT_NOATIME);
        }
        if self.noexec {
            flags.insert(MntFlags::MNT_NOEXEC);
        }
        if self.nosuid {
            flags.insert(MntFlags::MNT_NOSUID);
        }
        if self.read_only {
            flags.insert(MntFlags::MNT_RDONLY);
        }
        if self.suiddir {
            flags.insert(MntFlags::MNT_SUIDDIR);
        }
        if self.sync {
            flags.insert(MntFlags::MNT_SYNCHRONOUS);
        }
        flags
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn flags(&self) -> nix::mount::MsFlags {
        use nix::mount::MsFlags;

        let mut flags = MsFlags::empty();
        if self.dirsync {
            flags.insert(MsFlags::MS_DIRSYNC);
        }
        if self.noatime {
            flags.insert(MsFlags::MS_NOATIME);
        }
        if self.nodev {
            flags.insert(MsFlags::MS_NODEV);
        }
        if self.nodiratime {
            flags.insert(MsFlags::MS_NODIRATIME);
        }
        if self.noexec {
            flags.insert(MsFlags::MS_NOEXEC);
        }
        if self.nosuid {
            flags.insert(MsFlags::MS_NOSUID);
        }
        if self.read_only {
            flags.insert(MsFlags::MS_RDONLY);
        }
        if self.sync {
            flags.insert(MsFlags::MS_SYNCHRONOUS);
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_never_grants_flags_the_kernel_did_not_offer() {
        let config = MountConfig::default();
        assert_eq!(config.negotiate_init_flags(0), 0);
    }

    #[test]
    fn negotiate_masks_to_kernel_offer() {
        let mut config = MountConfig::default();
        config.async_reads = true;
        let kernel_flags = FUSE_ASYNC_READ | FUSE_WRITEBACK_CACHE;

        // writeback caching isn't turned on in this config, so even though
        // the kernel offered it, it should not come back.
        assert_eq!(config.negotiate_init_flags(kernel_flags), FUSE_ASYNC_READ);
    }

    #[test]
    fn enable_toggles_default_off() {
        let config = MountConfig::default();
        let kernel_flags = FUSE_ASYNC_READ
            | FUSE_ATOMIC_O_TRUNC
            | FUSE_DO_READDIRPLUS
            | FUSE_PARALLEL_DIROPS
            | FUSE_AUTO_INVAL_DATA
            | FUSE_CACHE_SYMLINKS
            | FUSE_FILE_OPS;

        // none of the Enable* toggles were flipped, so none of the flags
        // the kernel offered should be granted back.
        assert_eq!(config.negotiate_init_flags(kernel_flags), 0);
    }

    #[test]
    fn enable_toggles_gate_their_own_flag() {
        let mut config = MountConfig::default();
        config.vnode_caching = true;
        config.symlink_caching = true;
        config.atomic_trunc = true;
        config.readdirplus = true;
        config.parallel_dir_ops = true;
        config.auto_inval_data = true;

        let kernel_flags = FUSE_FILE_OPS
            | FUSE_CACHE_SYMLINKS
            | FUSE_ATOMIC_O_TRUNC
            | FUSE_DO_READDIRPLUS
            | FUSE_PARALLEL_DIROPS
            | FUSE_AUTO_INVAL_DATA;

        assert_eq!(config.negotiate_init_flags(kernel_flags), kernel_flags);
    }

    #[test]
    fn write_back_flag_gates_writeback_caching() {
        let mut config = MountConfig::default();
        config.write_back = true;
        let kernel_flags = FUSE_WRITEBACK_CACHE;

        assert_eq!(config.negotiate_init_flags(kernel_flags), FUSE_WRITEBACK_CACHE);
    }

    #[test]
    fn force_readdir_plus_withholds_the_auto_flag() {
        let mut always = MountConfig::default();
        always.force_readdir_plus = true;
        let mut auto = MountConfig::default();
        auto.force_readdir_plus = false;

        let kernel_flags = FUSE_READDIRPLUS_AUTO;
        assert_eq!(always.negotiate_init_flags(kernel_flags), 0);
        assert_eq!(auto.negotiate_init_flags(kernel_flags), FUSE_READDIRPLUS_AUTO);
    }

    #[test]
    fn max_background_and_congestion_threshold_fall_back_to_defaults() {
        let config = MountConfig::default();
        assert_eq!(config.max_background_value(), DEFAULT_MAX_BACKGROUND);
        assert_eq!(
            config.congestion_threshold_value(),
            DEFAULT_CONGESTION_THRESHOLD
        );
    }
}
