//! mount a [`Filesystem`] onto a directory and drive it until unmount.
use std::error::Error as StdError;
use std::ffi::OsString;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::io::{self, Error as IoError, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_notify::Notify as UnmountNotify;

use crate::connection::device::FuseConnection;
use crate::connection::Connection;
use crate::filesystem::Filesystem;
use crate::spawn::{spawn_connection, ConnectionHandle};

pub use crate::mount_options::MountConfig;

/// the `max_write` this library advertises to the kernel. Large enough that
/// hosts rarely need to override it; [`Pool`][crate::buffer::Pool] sizes its
/// buffers off it.
const DEFAULT_MAX_WRITE: u32 = 128 * 1024;

/// a filesystem mounted on a directory. A future that resolves once the
/// kernel connection closes, whether from an explicit `umount`/`fusermount3
/// -u` or the host filesystem returning from `destroy`.
pub struct MountedFileSystem {
    mount_path: PathBuf,
    handle: ConnectionHandle,
}

impl MountedFileSystem {
    /// the directory this filesystem is mounted on.
    pub fn mount_point(&self) -> &Path {
        &self.mount_path
    }
}

impl Future for MountedFileSystem {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

async fn mount_empty_check(config: &MountConfig, mount_path: &Path) -> io::Result<()> {
    if config.nonempty {
        return Ok(());
    }

    #[cfg(feature = "tokio-runtime")]
    {
        let mut entries = tokio::fs::read_dir(mount_path).await?;
        if entries.next_entry().await?.is_some() {
            return Err(IoError::new(
                ErrorKind::AlreadyExists,
                "mount point is not empty",
            ));
        }
    }

    #[cfg(all(not(feature = "tokio-runtime"), feature = "async-io-runtime"))]
    {
        use futures_util::stream::StreamExt;

        let mut entries = async_fs::read_dir(mount_path).await?;
        if entries.next().await.is_some() {
            return Err(IoError::new(
                ErrorKind::AlreadyExists,
                "mount point is not empty",
            ));
        }
    }

    Ok(())
}

/// returned in place of the underlying `fusermount3`-lookup error when
/// [`mount_with_unprivileged`] is asked to mount onto a path shaped like
/// `/dev/fd/N`: that shape means some external mechanism (a systemd/launchd
/// socket-activation unit, a supervisor process) already holds the FUSE
/// channel open and is managing the mount itself, so this library has no
/// mount point to hand `fusermount3` in the first place. The host is
/// expected to unmount through whatever mechanism set the mount up.
#[derive(Debug)]
pub struct ExternallyManagedMountPoint {
    mount_path: PathBuf,
}

impl Display for ExternallyManagedMountPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} looks like an externally-managed /dev/fd/N mount point; \
             the fusermount helper cannot mount or unmount it, the host \
             must do so through other means",
            self.mount_path
        )
    }
}

impl StdError for ExternallyManagedMountPoint {}

impl From<ExternallyManagedMountPoint> for IoError {
    fn from(err: ExternallyManagedMountPoint) -> Self {
        IoError::new(ErrorKind::Unsupported, err)
    }
}

/// whether `mount_path` has the `/dev/fd/<digits>` shape used to hand this
/// library an already-open FUSE channel fd instead of a real directory to
/// mount onto.
fn looks_like_dev_fd_mount_source(mount_path: &Path) -> bool {
    match mount_path.strip_prefix("/dev/fd") {
        Ok(rest) => {
            let rest = rest.as_os_str().as_bytes();
            !rest.is_empty() && rest.iter().all(u8::is_ascii_digit)
        }
        Err(_) => false,
    }
}

/// locate the `fusermount3` helper binary (falling back to `fusermount`, for
/// distributions that haven't renamed it) used to obtain the `/dev/fuse` fd
/// without the calling process needing `CAP_SYS_ADMIN`.
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
pub(crate) fn find_fusermount3() -> io::Result<OsString> {
    which::which("fusermount3")
        .or_else(|_| which::which("fusermount"))
        .map(|path| path.into_os_string())
        .map_err(|err| IoError::new(ErrorKind::NotFound, err))
}

/// mount `filesystem` at `mount_path`. Requires root or `CAP_SYS_ADMIN`; see
/// [`mount_with_unprivileged`] for mounting via the `fusermount3` helper
/// instead.
#[cfg(target_os = "linux")]
pub async fn mount<FS>(
    filesystem: FS,
    mount_path: impl AsRef<Path>,
    config: MountConfig,
) -> io::Result<MountedFileSystem>
where
    FS: Filesystem + Send + Sync + 'static,
{
    let mount_path = mount_path.as_ref();
    mount_empty_check(&config, mount_path).await?;

    let unmount_notify = Arc::new(UnmountNotify::new());
    let device = FuseConnection::new(unmount_notify)?;
    let fd = device.as_raw_fd();

    let options = config.build(fd);
    let fs_name = config.fs_name.clone().unwrap_or_else(|| "fuse".to_string());

    tracing::debug!("mount options {:?}", options);

    nix::mount::mount(
        Some(fs_name.as_str()),
        mount_path,
        Some("fuse"),
        config.flags(),
        Some(options.as_os_str()),
    )
    .map_err(|err| {
        tracing::error!("mount {:?} failed: {err}", mount_path);
        io::Error::from(err)
    })?;

    tracing::debug!("mount {:?} success", mount_path);

    let connection = Connection::new(device, filesystem, DEFAULT_MAX_WRITE, config);
    let handle = spawn_connection(connection.run());

    Ok(MountedFileSystem {
        mount_path: mount_path.to_path_buf(),
        handle,
    })
}

/// mount `filesystem` at `mount_path` without root permission, via the
/// `fusermount3` helper binary.
#[cfg(all(target_os = "linux", feature = "unprivileged"))]
pub async fn mount_with_unprivileged<FS>(
    filesystem: FS,
    mount_path: impl AsRef<Path>,
    config: MountConfig,
) -> io::Result<MountedFileSystem>
where
    FS: Filesystem + Send + Sync + 'static,
{
    let mount_path = mount_path.as_ref();

    if looks_like_dev_fd_mount_source(mount_path) {
        if let Err(err) = find_fusermount3() {
            tracing::error!("{mount_path:?} looks externally-managed and fusermount3 isn't available: {err}");
            return Err(ExternallyManagedMountPoint {
                mount_path: mount_path.to_path_buf(),
            }
            .into());
        }
    } else {
        mount_empty_check(&config, mount_path).await?;
    }

    let unmount_notify = Arc::new(UnmountNotify::new());
    let device =
        FuseConnection::new_with_unprivileged(config.clone(), mount_path, unmount_notify).await?;

    tracing::debug!("mount {:?} success", mount_path);

    let connection = Connection::new(device, filesystem, DEFAULT_MAX_WRITE, config);
    let handle = spawn_connection(connection.run());

    Ok(MountedFileSystem {
        mount_path: mount_path.to_path_buf(),
        handle,
    })
}

/// on FreeBSD no special helper is required to mount unprivileged: if
/// `vfs.usermount=1` and the caller owns `mount_path`, a normal `nmount(2)`
/// just works.
#[cfg(all(target_os = "freebsd", feature = "unprivileged"))]
pub async fn mount_with_unprivileged<FS>(
    filesystem: FS,
    mount_path: impl AsRef<Path>,
    config: MountConfig,
) -> io::Result<MountedFileSystem>
where
    FS: Filesystem + Send + Sync + 'static,
{
    mount(filesystem, mount_path, config).await
}

#[cfg(target_os = "freebsd")]
pub async fn mount<FS>(
    filesystem: FS,
    mount_path: impl AsRef<Path>,
    config: MountConfig,
) -> io::Result<MountedFileSystem>
where
    FS: Filesystem + Send + Sync + 'static,
{
    use cstr::cstr;

    let mount_path = mount_path.as_ref();
    mount_empty_check(&config, mount_path).await?;

    let unmount_notify = Arc::new(UnmountNotify::new());
    let device = FuseConnection::new(unmount_notify)?;
    let fd = device.as_raw_fd();

    let mut nmount = config.build();
    nmount
        .str_opt_owned(cstr!("fspath"), mount_path)
        .str_opt_owned(cstr!("fd"), format!("{fd}").as_str());

    tracing::debug!("mount options {:?}", &nmount);

    nmount.nmount(config.flags()).map_err(|err| {
        tracing::error!("mount {} failed: {err}", mount_path.display());
        io::Error::from(err)
    })?;

    tracing::debug!("mount {:?} success", mount_path);

    let connection = Connection::new(device, filesystem, DEFAULT_MAX_WRITE, config);
    let handle = spawn_connection(connection.run());

    Ok(MountedFileSystem {
        mount_path: mount_path.to_path_buf(),
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_dev_fd_mount_sources() {
        assert!(looks_like_dev_fd_mount_source(Path::new("/dev/fd/3")));
        assert!(looks_like_dev_fd_mount_source(Path::new("/dev/fd/42")));
    }

    #[test]
    fn rejects_non_dev_fd_paths() {
        assert!(!looks_like_dev_fd_mount_source(Path::new("/mnt/myfs")));
        assert!(!looks_like_dev_fd_mount_source(Path::new("/dev/fd")));
        assert!(!looks_like_dev_fd_mount_source(Path::new("/dev/fdx/3")));
        assert!(!looks_like_dev_fd_mount_source(Path::new("/dev/fd/not-a-number")));
    }
}
