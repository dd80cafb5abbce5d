//! async FUSE user-space bridge.
//!
//! Speaks the kernel FUSE wire protocol over `/dev/fuse` and dispatches
//! decoded requests to a host-provided [`Filesystem`] implementation. Buffers
//! are pooled and recycled per connection; decoding borrows names and data
//! straight out of the buffer that was read.
//!
//! This library doesn't depend on `libfuse`, unless the `unprivileged`
//! feature is enabled, in which case mounting without root permission is
//! supported through the `fusermount3` helper binary.
//!
//! # Features:
//!
//! - `file-lock`: enable POSIX file lock operations (`getlk`/`setlk`).
//! - `async-io-runtime`: use the [async-io](https://docs.rs/async-io) runtime.
//! - `tokio-runtime`: use the [tokio](https://docs.rs/tokio) runtime.
//! - `unprivileged`: allow mounting without root permission via `fusermount3`.
//!
//! # Notes:
//!
//! You must enable either `async-io-runtime` or `tokio-runtime`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use errno::Errno;
pub use filesystem::Filesystem;
pub use helper::perm_from_mode_and_kind;
pub use mount::{mount, MountConfig, MountedFileSystem};
pub use request::Request;

use crate::abi::{
    fuse_setattr_in, FATTR_ATIME, FATTR_ATIME_NOW, FATTR_CTIME, FATTR_GID, FATTR_LOCKOWNER,
    FATTR_MODE, FATTR_MTIME, FATTR_MTIME_NOW, FATTR_SIZE, FATTR_UID,
};
pub use crate::abi::{ProtocolVersion, Timestamp};

mod abi;
pub mod buffer;
pub mod codec;
pub mod connection;
mod errno;
pub mod filesystem;
mod helper;
mod mount;
mod mount_options;
pub mod notify;
pub mod op;
pub mod reply;
mod request;
mod spawn;

/// the bridge's `Result`, threaded through every `Filesystem` method.
pub type Result<T> = std::result::Result<T, Errno>;

/// an inode number as the kernel addresses it. `Inode(1)` is always the
/// mount root; the bridge never assigns or interprets numbers itself, it
/// only carries them between kernel and host.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Inode(pub u64);

impl Inode {
    /// the inode number FUSE reserves for the mount root.
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// an open file/directory handle, opaque to the bridge. Whatever a host
/// returns from `open`/`opendir` is echoed back unchanged on every
/// subsequent operation against that handle.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FileHandle(pub u64);

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (S_IFIFO)
    NamedPipe,
    /// Character device (S_IFCHR)
    CharDevice,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Directory (S_IFDIR)
    Directory,
    /// Regular file (S_IFREG)
    RegularFile,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Unix domain socket (S_IFSOCK)
    Socket,
}

impl From<FileType> for nix::sys::stat::mode_t {
    fn from(kind: FileType) -> Self {
        match kind {
            FileType::NamedPipe => libc::S_IFIFO,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
            FileType::Directory => libc::S_IFDIR,
            FileType::RegularFile => libc::S_IFREG,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Socket => libc::S_IFSOCK,
        }
    }
}

/// the setattr argument.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SetAttr {
    /// set file or directory mode.
    pub mode: Option<u32>,
    /// set file or directory uid.
    pub uid: Option<u32>,
    /// set file or directory gid.
    pub gid: Option<u32>,
    /// set file or directory size.
    pub size: Option<u64>,
    /// the lock_owner argument.
    pub lock_owner: Option<u64>,
    /// set file or directory atime.
    pub atime: Option<Timestamp>,
    /// set file or directory mtime.
    pub mtime: Option<Timestamp>,
    /// set file or directory ctime.
    pub ctime: Option<Timestamp>,
    #[cfg(target_os = "macos")]
    pub crtime: Option<Timestamp>,
    #[cfg(target_os = "macos")]
    pub chgtime: Option<Timestamp>,
    #[cfg(target_os = "macos")]
    pub bkuptime: Option<Timestamp>,
    #[cfg(target_os = "macos")]
    pub flags: Option<u32>,
}

impl From<&fuse_setattr_in> for SetAttr {
    fn from(setattr_in: &fuse_setattr_in) -> Self {
        let mut set_attr = Self::default();

        if setattr_in.valid & FATTR_MODE > 0 {
            set_attr.mode = Some(setattr_in.mode);
        }

        if setattr_in.valid & FATTR_UID > 0 {
            set_attr.uid = Some(setattr_in.uid);
        }

        if setattr_in.valid & FATTR_GID > 0 {
            set_attr.gid = Some(setattr_in.gid);
        }

        if setattr_in.valid & FATTR_SIZE > 0 {
            set_attr.size = Some(setattr_in.size);
        }

        if setattr_in.valid & FATTR_ATIME > 0 {
            set_attr.atime = Some(Timestamp {
                sec: setattr_in.atime as i64,
                nsec: setattr_in.atimensec,
            });
        }

        if setattr_in.valid & FATTR_ATIME_NOW > 0 {
            set_attr.atime = Some(now());
        }

        if setattr_in.valid & FATTR_MTIME > 0 {
            set_attr.mtime = Some(Timestamp {
                sec: setattr_in.mtime as i64,
                nsec: setattr_in.mtimensec,
            });
        }

        if setattr_in.valid & FATTR_MTIME_NOW > 0 {
            set_attr.mtime = Some(now());
        }

        if setattr_in.valid & FATTR_LOCKOWNER > 0 {
            set_attr.lock_owner = Some(setattr_in.lock_owner);
        }

        if setattr_in.valid & FATTR_CTIME > 0 {
            set_attr.ctime = Some(Timestamp {
                sec: setattr_in.ctime as i64,
                nsec: setattr_in.ctimensec,
            });
        }

        set_attr
    }
}

fn now() -> Timestamp {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        sec: duration.as_secs() as i64,
        nsec: duration.subsec_nanos(),
    }
}

/// a request-scoped flag a `Connection` flips when an `INTERRUPT` for that
/// request's unique id arrives. Host operations that run long (`read` from a
/// slow backend, `write` through a network store) can poll it between
/// await points and bail out early instead of running to completion after
/// the kernel has stopped waiting on the reply.
///
/// Tokens form a tree: every per-request token handed to a [`Request`] is a
/// [`child`][Self::child] of [`MountConfig`]'s `op_context`, so a host that
/// cancels the parent context (to tear down a mount alongside some larger
/// shutdown signal) observes every in-flight request as cancelled too,
/// without the connection needing to track them itself.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    /// a fresh, uncancelled, parentless token; the root of a cancellation tree.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: None,
        }
    }

    /// a fresh token that also reports cancelled once `self` does.
    pub(crate) fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// mark this token (and every token descended from it) as cancelled.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// whether this token or an ancestor of it has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.parent.as_deref().is_some_and(CancelToken::is_cancelled)
    }
}

impl PartialEq for CancelToken {
    /// two tokens are equal iff they're the same token, not merely in the
    /// same cancellation state.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

impl Eq for CancelToken {}

pub mod prelude {
    //! convenience re-export of the types most `Filesystem` impls need.

    pub use crate::reply::*;
    pub use crate::CancelToken;
    pub use crate::Errno;
    pub use crate::FileHandle;
    pub use crate::FileType;
    pub use crate::Filesystem;
    pub use crate::Inode;
    pub use crate::MountConfig;
    pub use crate::Request;
    pub use crate::Result;
    pub use crate::SetAttr;
    pub use crate::Timestamp;
}
