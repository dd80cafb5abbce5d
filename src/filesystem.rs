use std::ffi::OsStr;

use bytes::Bytes;
use futures_util::stream::Stream;

use crate::notify::Notify;
use crate::reply::*;
use crate::request::Request;
use crate::{FileHandle, Inode, Result, SetAttr};

#[allow(unused_variables)]
#[trait_make::make(Send)]
/// host-implemented filesystem. The bridge calls every method on the same
/// task budget as the wire request that triggered it; a method need not
/// return quickly, but it should respect `req` being abandoned if the
/// kernel later sends a matching `FUSE_INTERRUPT`.
pub trait Filesystem {
    /// initialize filesystem. Called before any other filesystem method.
    async fn init(&self, req: Request) -> Result<ReplyInit>;

    /// clean up filesystem. Called on filesystem exit; in a normal (not
    /// fuseblk) mount the kernel may also send a `forget` for the root
    /// inode around the same time.
    async fn destroy(&self, req: Request);

    /// look up a directory entry by name and get its attributes.
    async fn lookup(&self, req: Request, parent: Inode, name: &OsStr) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// forget an inode. `nlookup` is the number of lookups previously
    /// performed on this inode; a filesystem with unbounded inode lifetime
    /// may ignore this entirely.
    async fn forget(&self, req: Request, inode: Inode, nlookup: u64) {}

    /// get file attributes. `fh` is the handle from a prior `open`, or
    /// `None` if `open` didn't set one.
    async fn getattr(
        &self,
        req: Request,
        inode: Inode,
        fh: Option<FileHandle>,
        flags: u32,
    ) -> Result<ReplyAttr> {
        Err(libc::ENOSYS.into())
    }

    /// set file attributes.
    async fn setattr(
        &self,
        req: Request,
        inode: Inode,
        fh: Option<FileHandle>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr> {
        Err(libc::ENOSYS.into())
    }

    /// read symbolic link.
    async fn readlink(&self, req: Request, inode: Inode) -> Result<ReplyData> {
        Err(libc::ENOSYS.into())
    }

    /// create a symbolic link.
    async fn symlink(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        link: &OsStr,
    ) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// create a file node: a regular file, device, fifo or socket. Most
    /// filesystems implementing regular files only need [`create`][Self::create].
    async fn mknod(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// create a directory.
    async fn mkdir(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// remove a file.
    async fn unlink(&self, req: Request, parent: Inode, name: &OsStr) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// remove a directory.
    async fn rmdir(&self, req: Request, parent: Inode, name: &OsStr) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// rename a file or directory.
    async fn rename(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// create a hard link.
    async fn link(
        &self,
        req: Request,
        inode: Inode,
        new_parent: Inode,
        new_name: &OsStr,
    ) -> Result<ReplyEntry> {
        Err(libc::ENOSYS.into())
    }

    /// open a file. The filesystem may store an arbitrary handle in `fh`
    /// and receive it back on every later call for this open file
    /// (`read`/`write`/`flush`/`release`/`fsync`), or leave it at 0 for
    /// stateless I/O.
    async fn open(&self, req: Request, inode: Inode, flags: u32) -> Result<ReplyOpen> {
        Err(libc::ENOSYS.into())
    }

    /// read data. Should return exactly `size` bytes except at EOF or on
    /// error; the kernel zero-fills the remainder unless the file was
    /// opened with `direct_io`.
    async fn read(
        &self,
        req: Request,
        inode: Inode,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData> {
        Err(libc::ENOSYS.into())
    }

    /// write data. Should return exactly the number of bytes written except
    /// on error, mirroring [`read`][Self::read]'s `direct_io` exception.
    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        req: Request,
        inode: Inode,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        write_flags: u32,
        flags: u32,
    ) -> Result<ReplyWrite> {
        Err(libc::ENOSYS.into())
    }

    /// get filesystem statistics.
    async fn statfs(&self, req: Request, inode: Inode) -> Result<ReplyStatFs> {
        Err(libc::ENOSYS.into())
    }

    /// release an open file: called once all descriptors/mappings for it
    /// are gone. Errors here are not surfaced to the `close()`/`munmap()`
    /// call that triggered it.
    async fn release(
        &self,
        req: Request,
        inode: Inode,
        fh: FileHandle,
        flags: u32,
        lock_owner: u64,
        flush: bool,
    ) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// synchronize file contents. If `datasync` is set, only user data
    /// needs flushing, not metadata.
    async fn fsync(&self, req: Request, inode: Inode, fh: FileHandle, datasync: bool) -> Result<()> {
        Ok(())
    }

    /// set an extended attribute.
    async fn setxattr(
        &self,
        req: Request,
        inode: Inode,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        position: u32,
    ) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// get an extended attribute. Return `Err(ERANGE)` if `size` is too
    /// small for the value.
    async fn getxattr(
        &self,
        req: Request,
        inode: Inode,
        name: &OsStr,
        size: u32,
    ) -> Result<ReplyXAttr> {
        Err(libc::ENOSYS.into())
    }

    /// list extended attribute names. Return `Err(ERANGE)` if `size` is too
    /// small for the list.
    async fn listxattr(&self, req: Request, inode: Inode, size: u32) -> Result<ReplyXAttr> {
        Err(libc::ENOSYS.into())
    }

    /// remove an extended attribute.
    async fn removexattr(&self, req: Request, inode: Inode, name: &OsStr) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// called on each `close()` of the opened file; may be called many
    /// times per `open()` (`dup`, `dup2`, `fork`). Not a guarantee that
    /// pending writes are flushed — see `fsync` for that.
    async fn flush(&self, req: Request, inode: Inode, fh: FileHandle, lock_owner: u64) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// open a directory; same handle conventions as [`open`][Self::open].
    async fn opendir(&self, req: Request, inode: Inode, flags: u32) -> Result<ReplyOpen> {
        Err(libc::ENOSYS.into())
    }

    /// dir entry stream given by [`readdir`][Self::readdir].
    type DirEntryStream<'a>: Stream<Item = Result<DirectoryEntry>> + Send + 'a
    where
        Self: 'a;

    /// read directory entries. `offset` tracks position across calls.
    async fn readdir<'a>(
        &'a self,
        req: Request,
        parent: Inode,
        fh: FileHandle,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
        Err(libc::ENOSYS.into())
    }

    /// release an open directory; exactly one call per [`opendir`][Self::opendir].
    async fn releasedir(&self, req: Request, inode: Inode, fh: FileHandle, flags: u32) -> Result<()> {
        Ok(())
    }

    /// synchronize directory contents.
    async fn fsyncdir(&self, req: Request, inode: Inode, fh: FileHandle, datasync: bool) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    #[cfg(feature = "file-lock")]
    /// test for a POSIX file lock. Only available with the `file-lock` feature.
    #[allow(clippy::too_many_arguments)]
    async fn getlk(
        &self,
        req: Request,
        inode: Inode,
        fh: FileHandle,
        lock_owner: u64,
        start: u64,
        end: u64,
        r#type: u32,
        pid: u32,
    ) -> Result<ReplyLock>;

    #[cfg(feature = "file-lock")]
    /// acquire, modify or release a POSIX file lock. Only available with
    /// the `file-lock` feature.
    #[allow(clippy::too_many_arguments)]
    async fn setlk(
        &self,
        req: Request,
        inode: Inode,
        fh: FileHandle,
        lock_owner: u64,
        start: u64,
        end: u64,
        r#type: u32,
        pid: u32,
        block: bool,
    ) -> Result<()>;

    /// check file access permissions for `access()`. Not called if the
    /// `default_permissions` mount option is set.
    async fn access(&self, req: Request, inode: Inode, mask: u32) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// create and open a file in one round trip. A default `ENOSYS` reply
    /// here makes the kernel retry as a [`mknod`][Self::mknod] followed by
    /// [`open`][Self::open] on its own, so only override this when a
    /// combined create+open is cheaper for the host to implement.
    async fn create(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> Result<ReplyCreated> {
        Err(libc::ENOSYS.into())
    }

    /// handle an interrupt for the request with unique id `unique`.
    async fn interrupt(&self, req: Request, unique: u64) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// map a block index within the file to a block index within the
    /// underlying device (fuseblk mode only).
    async fn bmap(&self, req: Request, inode: Inode, blocksize: u32, idx: u64) -> Result<ReplyBmap> {
        Err(libc::ENOSYS.into())
    }

    /// poll for IO readiness events.
    #[allow(clippy::too_many_arguments)]
    async fn poll(
        &self,
        req: Request,
        inode: Inode,
        fh: FileHandle,
        kh: Option<u64>,
        flags: u32,
        events: u32,
        notify: &Notify,
    ) -> Result<ReplyPoll> {
        Err(libc::ENOSYS.into())
    }

    /// receive a notify-retrieve reply from the kernel.
    async fn notify_reply(&self, req: Request, inode: Inode, offset: u64, data: Bytes) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// forget more than one inode in one call.
    async fn batch_forget(&self, req: Request, inodes: &[Inode]) {}

    /// allocate space for an open file (see `man 2 fallocate`).
    async fn fallocate(
        &self,
        req: Request,
        inode: Inode,
        fh: FileHandle,
        offset: u64,
        length: u64,
        mode: u32,
    ) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

    /// dir entry plus stream given by [`readdirplus`][Self::readdirplus].
    type DirEntryPlusStream<'a>: Stream<Item = Result<DirectoryEntryPlus>> + Send + 'a
    where
        Self: 'a;

    /// read directory entries together with their attributes, combining
    /// [`readdir`][Self::readdir] and [`lookup`][Self::lookup].
    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        parent: Inode,
        fh: FileHandle,
        offset: u64,
        lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        Err(libc::ENOSYS.into())
    }

    /// rename a file or directory with flags (`RENAME_EXCHANGE`/`RENAME_NOREPLACE`).
    async fn rename2(
        &self,
        req: Request,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        Err(libc::ENOSYS.into())
    }

}
