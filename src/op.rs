//! the closed set of decoded kernel requests.
//!
//! [`codec::decode`][crate::codec::decode] turns one [`InMessage`][crate::buffer::InMessage]
//! into a `Header` plus an [`Op`], borrowing names/payloads straight out of
//! the buffer instead of copying them. `Connection` matches on `Op` only to
//! route the request to the right [`Filesystem`][crate::filesystem::Filesystem]
//! method and to key its cancellation table and `tracing` spans; the typed
//! arguments a host actually implements against live on the trait methods.

use std::ffi::OsStr;

use crate::{FileHandle, Inode, SetAttr};

/// fields common to every request, lifted out of `fuse_in_header`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Header {
    pub unique: u64,
    pub opcode: u32,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// one decoded kernel request. Borrows names and payload bytes from the
/// `InMessage` that produced it, so it cannot outlive the read that filled
/// that buffer.
#[derive(Debug)]
pub enum Op<'a> {
    Init {
        major: u32,
        minor: u32,
        max_readahead: u32,
        flags: u32,
    },
    Destroy,
    Lookup {
        parent: Inode,
        name: &'a OsStr,
    },
    Forget {
        inode: Inode,
        nlookup: u64,
    },
    BatchForget {
        forgets: Vec<(Inode, u64)>,
    },
    Getattr {
        inode: Inode,
        fh: Option<FileHandle>,
        flags: u32,
    },
    Setattr {
        inode: Inode,
        fh: Option<FileHandle>,
        set_attr: SetAttr,
    },
    Readlink {
        inode: Inode,
    },
    Symlink {
        parent: Inode,
        name: &'a OsStr,
        link: &'a OsStr,
    },
    Mknod {
        parent: Inode,
        name: &'a OsStr,
        mode: u32,
        rdev: u32,
    },
    Mkdir {
        parent: Inode,
        name: &'a OsStr,
        mode: u32,
        umask: u32,
    },
    Unlink {
        parent: Inode,
        name: &'a OsStr,
    },
    Rmdir {
        parent: Inode,
        name: &'a OsStr,
    },
    Rename {
        parent: Inode,
        name: &'a OsStr,
        new_parent: Inode,
        new_name: &'a OsStr,
    },
    Rename2 {
        parent: Inode,
        name: &'a OsStr,
        new_parent: Inode,
        new_name: &'a OsStr,
        flags: u32,
    },
    Link {
        inode: Inode,
        new_parent: Inode,
        new_name: &'a OsStr,
    },
    Open {
        inode: Inode,
        flags: u32,
    },
    Read {
        inode: Inode,
        fh: FileHandle,
        offset: u64,
        size: u32,
    },
    Write {
        inode: Inode,
        fh: FileHandle,
        offset: u64,
        data: &'a [u8],
        write_flags: u32,
        flags: u32,
    },
    Statfs {
        inode: Inode,
    },
    Release {
        inode: Inode,
        fh: FileHandle,
        flags: u32,
        lock_owner: u64,
        flush: bool,
    },
    Fsync {
        inode: Inode,
        fh: FileHandle,
        datasync: bool,
    },
    SetXattr {
        inode: Inode,
        name: &'a OsStr,
        value: &'a [u8],
        flags: u32,
        position: u32,
    },
    GetXattr {
        inode: Inode,
        name: &'a OsStr,
        size: u32,
    },
    ListXattr {
        inode: Inode,
        size: u32,
    },
    RemoveXattr {
        inode: Inode,
        name: &'a OsStr,
    },
    Flush {
        inode: Inode,
        fh: FileHandle,
        lock_owner: u64,
    },
    Opendir {
        inode: Inode,
        flags: u32,
    },
    Readdir {
        inode: Inode,
        fh: FileHandle,
        offset: i64,
        plus: bool,
    },
    Releasedir {
        inode: Inode,
        fh: FileHandle,
        flags: u32,
    },
    Fsyncdir {
        inode: Inode,
        fh: FileHandle,
        datasync: bool,
    },
    #[cfg(feature = "file-lock")]
    Getlk {
        inode: Inode,
        fh: FileHandle,
        lock_owner: u64,
        start: u64,
        end: u64,
        r#type: u32,
        pid: u32,
    },
    #[cfg(feature = "file-lock")]
    Setlk {
        inode: Inode,
        fh: FileHandle,
        lock_owner: u64,
        start: u64,
        end: u64,
        r#type: u32,
        pid: u32,
        block: bool,
    },
    Access {
        inode: Inode,
        mask: u32,
    },
    Create {
        parent: Inode,
        name: &'a OsStr,
        mode: u32,
        flags: u32,
    },
    Interrupt {
        unique: u64,
    },
    Bmap {
        inode: Inode,
        blocksize: u32,
        idx: u64,
    },
    Poll {
        inode: Inode,
        fh: FileHandle,
        kh: Option<u64>,
        flags: u32,
        events: u32,
    },
    NotifyReply {
        inode: Inode,
        offset: u64,
        data: &'a [u8],
    },
    Fallocate {
        inode: Inode,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: u32,
    },
    Readdirplus {
        inode: Inode,
        fh: FileHandle,
        offset: u64,
        lock_owner: u64,
    },
}

impl<'a> Op<'a> {
    /// short name for `tracing` spans and warn logs; never the numeric
    /// opcode, which is already on `Header`.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Init { .. } => "init",
            Op::Destroy => "destroy",
            Op::Lookup { .. } => "lookup",
            Op::Forget { .. } => "forget",
            Op::BatchForget { .. } => "batch_forget",
            Op::Getattr { .. } => "getattr",
            Op::Setattr { .. } => "setattr",
            Op::Readlink { .. } => "readlink",
            Op::Symlink { .. } => "symlink",
            Op::Mknod { .. } => "mknod",
            Op::Mkdir { .. } => "mkdir",
            Op::Unlink { .. } => "unlink",
            Op::Rmdir { .. } => "rmdir",
            Op::Rename { .. } => "rename",
            Op::Rename2 { .. } => "rename2",
            Op::Link { .. } => "link",
            Op::Open { .. } => "open",
            Op::Read { .. } => "read",
            Op::Write { .. } => "write",
            Op::Statfs { .. } => "statfs",
            Op::Release { .. } => "release",
            Op::Fsync { .. } => "fsync",
            Op::SetXattr { .. } => "setxattr",
            Op::GetXattr { .. } => "getxattr",
            Op::ListXattr { .. } => "listxattr",
            Op::RemoveXattr { .. } => "removexattr",
            Op::Flush { .. } => "flush",
            Op::Opendir { .. } => "opendir",
            Op::Readdir { .. } => "readdir",
            Op::Releasedir { .. } => "releasedir",
            Op::Fsyncdir { .. } => "fsyncdir",
            #[cfg(feature = "file-lock")]
            Op::Getlk { .. } => "getlk",
            #[cfg(feature = "file-lock")]
            Op::Setlk { .. } => "setlk",
            Op::Access { .. } => "access",
            Op::Create { .. } => "create",
            Op::Interrupt { .. } => "interrupt",
            Op::Bmap { .. } => "bmap",
            Op::Poll { .. } => "poll",
            Op::NotifyReply { .. } => "notify_reply",
            Op::Fallocate { .. } => "fallocate",
            Op::Readdirplus { .. } => "readdirplus",
        }
    }

    /// whether this op still makes a reply, vs. fire-and-forget ops
    /// (`forget`, `batch_forget`, `destroy`) that the kernel never expects
    /// an answer to.
    pub fn expects_reply(&self) -> bool {
        !matches!(
            self,
            Op::Forget { .. } | Op::BatchForget { .. } | Op::Destroy
        )
    }
}
