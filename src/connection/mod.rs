//! the dispatch engine: turns a decoded [`Op`] into a call against a host
//! [`Filesystem`] and a reply frame written back to the kernel.
pub mod device;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_notify::Notify as IdleNotify;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::stream::StreamExt;
use tracing::{debug, debug_span, error, warn, Instrument};

use crate::buffer::{InMessage, MessageProvider, OutMessage, Pool};
use crate::codec;
use crate::filesystem::Filesystem;
use crate::notify::Notify;
use crate::op::Op;
use crate::reply::ReplyXAttr;
use crate::request::Request;
use crate::spawn::{spawn_connection, spawn_without_return};
use crate::{CancelToken, Inode, MountConfig, ProtocolVersion};

use device::FuseConnection;

/// request-scoped bookkeeping a `Connection` keeps per in-flight unique id,
/// just enough to let a later `INTERRUPT` reach the task still running it.
type CancelTable = RwLock<HashMap<u64, CancelToken>>;

/// a reply body assembled off the connection's pool, capped at the same
/// size every pooled read buffer gets; readdir/readdirplus entries stop
/// being appended once this is exceeded, matching the kernel's own
/// short-read-on-overflow convention.
const DIRENT_BODY_CAP: usize = 4096;

/// owns the kernel fd, the buffer pool, and the cancellation table; drives
/// the read loop that feeds each request to a host [`Filesystem`].
pub struct Connection<FS> {
    device: Arc<FuseConnection>,
    filesystem: Arc<FS>,
    pool: Arc<Pool>,
    config: Arc<MountConfig>,
    cancel_table: Arc<CancelTable>,
    response_sender: UnboundedSender<Box<OutMessage>>,
    response_receiver: Option<UnboundedReceiver<Box<OutMessage>>>,
    next_op_id: AtomicU64,
    version: ProtocolVersion,
    /// number of `dispatch_and_reply` tasks currently running; `run` waits
    /// for this to drain to zero after the read loop exits so in-flight
    /// replies aren't dropped mid-write when the kernel fd goes away.
    in_flight: Arc<AtomicUsize>,
    idle: Arc<IdleNotify>,
}

impl<FS> Connection<FS>
where
    FS: Filesystem + Send + Sync + 'static,
{
    pub(crate) fn new(
        device: FuseConnection,
        filesystem: FS,
        max_write: u32,
        config: MountConfig,
    ) -> Self {
        let (response_sender, response_receiver) = unbounded();

        Self {
            device: Arc::new(device),
            filesystem: Arc::new(filesystem),
            pool: Arc::new(Pool::new(max_write)),
            config: Arc::new(config),
            cancel_table: Arc::new(RwLock::new(HashMap::new())),
            response_sender,
            response_receiver: Some(response_receiver),
            next_op_id: AtomicU64::new(0),
            version: ProtocolVersion::LATEST,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(IdleNotify::new()),
        }
    }

    /// a handle a host can use to push cache invalidations/wakeups back to
    /// the kernel outside the request/reply cycle.
    pub fn notify(&self) -> Notify {
        Notify::new(self.response_sender.clone())
    }

    pub(crate) async fn run(mut self) -> std::io::Result<()> {
        let receiver = self.response_receiver.take().unwrap();
        let device = self.device.clone();

        let write_handle = spawn_connection(Self::drain_responses(device, receiver));

        let read_result = self.read_loop().await;

        // let every task already dispatched finish writing its reply before
        // closing the response channel out from under it.
        while self.in_flight.load(Ordering::Acquire) > 0 {
            self.idle.notified().await;
        }

        drop(self.response_sender);
        let write_result = write_handle.await;

        read_result.and(write_result)
    }

    async fn drain_responses(
        device: Arc<FuseConnection>,
        mut receiver: UnboundedReceiver<Box<OutMessage>>,
    ) -> std::io::Result<()> {
        while let Some(msg) = receiver.next().await {
            if let Err(err) = device.write(msg.bytes()).await {
                if err.kind() == ErrorKind::NotFound {
                    warn!("reply for an abandoned request, ignoring: {err}");
                    continue;
                }

                error!("write to /dev/fuse failed: {err}");
                return Err(err);
            }
        }

        Ok(())
    }

    async fn read_loop(&mut self) -> std::io::Result<()> {
        loop {
            let mut in_msg = self.pool.acquire_in();

            let n = match self.device.read(in_msg.as_mut_slice()).await {
                Ok(None) => return Ok(()),
                Ok(Some(0)) => {
                    debug!("/dev/fuse returned EOF, tearing down");
                    self.filesystem
                        .destroy(Request::new(&Default::default(), CancelToken::new()))
                        .await;
                    return Ok(());
                }
                Ok(Some(n)) => n,
                Err(err) => {
                    if err.raw_os_error() == Some(libc::ENODEV) {
                        debug!("/dev/fuse returned ENODEV, tearing down");
                        self.filesystem
                            .destroy(Request::new(&Default::default(), CancelToken::new()))
                            .await;
                        return Ok(());
                    }

                    error!("read from /dev/fuse failed: {err}");
                    return Err(err);
                }
            };

            in_msg.consume(n);

            let (header, op) = match codec::decode(&in_msg, self.version) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!("failed to decode request: {err:?}");
                    continue;
                }
            };

            if let Op::Init { major, minor, .. } = &op {
                self.version = ProtocolVersion::negotiate(*major, *minor);
            }

            let unique = header.unique;
            let expects_reply = op.expects_reply();
            let inode = Inode(header.nodeid);

            let cancel = self.config.op_context.child();
            if expects_reply {
                self.cancel_table
                    .write()
                    .unwrap()
                    .insert(unique, cancel.clone());
            }

            if let Op::Interrupt { unique: target } = &op {
                signal_interrupt(&self.cancel_table, *target);
            }

            let request = Request {
                unique: header.unique,
                uid: header.uid,
                gid: header.gid,
                pid: header.pid,
                cancel: cancel.clone(),
            };

            let span = debug_span!("fuse_op", op = op.name(), unique, inode = inode.0);
            let fs = self.filesystem.clone();
            let pool = self.pool.clone();
            let config = self.config.clone();
            let cancel_table = self.cancel_table.clone();
            let response_sender = self.response_sender.clone();
            let notify = self.notify();
            let in_flight = self.in_flight.clone();
            let idle = self.idle.clone();
            let _op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);

            in_flight.fetch_add(1, Ordering::Release);

            // `op` borrows from `in_msg`; move both into the task so the
            // buffer outlives every borrow the decode produced, then return
            // it to the pool once the reply has been built.
            spawn_without_return(
                dispatch_and_reply(
                    fs,
                    pool,
                    config,
                    in_msg,
                    request,
                    op,
                    unique,
                    expects_reply,
                    cancel_table,
                    response_sender,
                    notify,
                    in_flight,
                    idle,
                )
                .instrument(span),
            );
        }
    }
}

/// cancel the in-flight op `target` belongs to, if it's still in the table.
/// A target already removed (the op completed, or no such unique was ever
/// seen) is silently ignored, per spec.
fn signal_interrupt(cancel_table: &CancelTable, target: u64) {
    if let Some(token) = cancel_table.read().unwrap().get(&target) {
        token.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_and_reply<FS>(
    fs: Arc<FS>,
    pool: Arc<Pool>,
    config: Arc<MountConfig>,
    in_msg: Box<InMessage>,
    request: Request,
    op: Op<'_>,
    unique: u64,
    expects_reply: bool,
    cancel_table: Arc<CancelTable>,
    response_sender: UnboundedSender<Box<OutMessage>>,
    notify: Notify,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<IdleNotify>,
) {
    let mut out = pool.acquire_out();

    run_op(&fs, &config, &mut out, request, op, unique, &notify).await;

    // `op` (and its borrow of `in_msg`) is dead by the time `run_op` returns.
    pool.release_in(in_msg);

    cancel_table.write().unwrap().remove(&unique);

    if expects_reply {
        let _ = response_sender.unbounded_send(out);
    } else {
        pool.release_out(out);
    }

    in_flight.fetch_sub(1, Ordering::Release);
    idle.notify();
}

/// encode one op's reply into `out`, calling the matching `Filesystem`
/// method. `Ok`/`Err` from the host become a typed encode call or a bare
/// errno reply respectively.
async fn run_op<FS>(
    fs: &FS,
    config: &MountConfig,
    out: &mut OutMessage,
    req: Request,
    op: Op<'_>,
    unique: u64,
    notify: &Notify,
) where
    FS: Filesystem + Send + Sync,
{
    macro_rules! reply {
        ($result:expr, $encode:expr) => {
            match $result {
                Ok(reply) => $encode(out, unique, reply),
                Err(err) => codec::encode_error(out, unique, err.0),
            }
        };
    }

    macro_rules! reply_unit {
        ($result:expr) => {
            match $result {
                Ok(()) => codec::encode_ok(out, unique),
                Err(err) => codec::encode_error(out, unique, err.0),
            }
        };
    }

    match op {
        Op::Init {
            flags,
            max_readahead,
            ..
        } => match fs.init(req).await {
            Ok(reply) => codec::encode_init(
                out,
                unique,
                reply,
                config.negotiate_init_flags(flags),
                config.negotiated_max_readahead(max_readahead),
                config.max_background_value(),
                config.congestion_threshold_value(),
            ),
            Err(err) => codec::encode_error(out, unique, err.0),
        },

        Op::Destroy => fs.destroy(req).await,

        Op::Lookup { parent, name } => reply!(fs.lookup(req, parent, name).await, codec::encode_entry),

        Op::Forget { inode, nlookup } => fs.forget(req, inode, nlookup).await,

        Op::BatchForget { forgets } => {
            let inodes: Vec<Inode> = forgets.into_iter().map(|(inode, _)| inode).collect();
            fs.batch_forget(req, &inodes).await;
        }

        Op::Getattr { inode, fh, flags } => {
            reply!(fs.getattr(req, inode, fh, flags).await, codec::encode_attr)
        }

        Op::Setattr { inode, fh, set_attr } => {
            reply!(fs.setattr(req, inode, fh, set_attr).await, codec::encode_attr)
        }

        Op::Readlink { inode } => match fs.readlink(req, inode).await {
            Ok(reply) => codec::encode_data(out, unique, &reply.data),
            Err(err) => codec::encode_error(out, unique, err.0),
        },

        Op::Symlink { parent, name, link } => {
            reply!(fs.symlink(req, parent, name, link).await, codec::encode_entry)
        }

        Op::Mknod {
            parent,
            name,
            mode,
            rdev,
        } => reply!(fs.mknod(req, parent, name, mode, rdev).await, codec::encode_entry),

        Op::Mkdir {
            parent,
            name,
            mode,
            umask,
        } => reply!(fs.mkdir(req, parent, name, mode, umask).await, codec::encode_entry),

        Op::Unlink { parent, name } => reply_unit!(fs.unlink(req, parent, name).await),

        Op::Rmdir { parent, name } => reply_unit!(fs.rmdir(req, parent, name).await),

        Op::Rename {
            parent,
            name,
            new_parent,
            new_name,
        } => reply_unit!(fs.rename(req, parent, name, new_parent, new_name).await),

        Op::Rename2 {
            parent,
            name,
            new_parent,
            new_name,
            flags,
        } => reply_unit!(
            fs.rename2(req, parent, name, new_parent, new_name, flags)
                .await
        ),

        Op::Link {
            inode,
            new_parent,
            new_name,
        } => reply!(fs.link(req, inode, new_parent, new_name).await, codec::encode_entry),

        Op::Open { inode, flags } => reply!(fs.open(req, inode, flags).await, codec::encode_open),

        Op::Read {
            inode,
            fh,
            offset,
            size,
        } => match fs.read(req, inode, fh, offset, size).await {
            Ok(reply) => {
                let data = reply.data;
                let n = (data.len() as u32).min(size) as usize;
                codec::encode_data(out, unique, &data[..n]);
            }
            Err(err) => codec::encode_error(out, unique, err.0),
        },

        Op::Write {
            inode,
            fh,
            offset,
            data,
            write_flags,
            flags,
        } => reply!(
            fs.write(req, inode, fh, offset, data, write_flags, flags).await,
            codec::encode_write
        ),

        // macOS mount completion waits on a `FUSE_STATFS` reply, so a host
        // that hasn't implemented `statfs` still gets an (all-zero) answer
        // instead of the usual `ENOSYS` passthrough.
        Op::Statfs { inode } => match fs.statfs(req, inode).await {
            Ok(reply) => codec::encode_statfs(out, unique, reply),
            Err(crate::Errno(libc::ENOSYS)) => {
                codec::encode_statfs(out, unique, crate::reply::ReplyStatFs::default())
            }
            Err(err) => codec::encode_error(out, unique, err.0),
        },

        Op::Release {
            inode,
            fh,
            flags,
            lock_owner,
            flush,
        } => reply_unit!(fs.release(req, inode, fh, flags, lock_owner, flush).await),

        Op::Fsync { inode, fh, datasync } => reply_unit!(fs.fsync(req, inode, fh, datasync).await),

        Op::SetXattr {
            inode,
            name,
            value,
            flags,
            position,
        } => reply_unit!(fs.setxattr(req, inode, name, value, flags, position).await),

        Op::GetXattr { inode, name, size } => match fs.getxattr(req, inode, name, size).await {
            Ok(ReplyXAttr::Size(size)) => codec::encode_xattr_size(out, unique, size),
            Ok(ReplyXAttr::Data(data)) => codec::encode_data(out, unique, &data),
            Err(err) => codec::encode_error(out, unique, err.0),
        },

        Op::ListXattr { inode, size } => match fs.listxattr(req, inode, size).await {
            Ok(ReplyXAttr::Size(size)) => codec::encode_xattr_size(out, unique, size),
            Ok(ReplyXAttr::Data(data)) => codec::encode_data(out, unique, &data),
            Err(err) => codec::encode_error(out, unique, err.0),
        },

        Op::RemoveXattr { inode, name } => reply_unit!(fs.removexattr(req, inode, name).await),

        Op::Flush {
            inode,
            fh,
            lock_owner,
        } => reply_unit!(fs.flush(req, inode, fh, lock_owner).await),

        Op::Opendir { inode, flags } => reply!(fs.opendir(req, inode, flags).await, codec::encode_open),

        Op::Readdir {
            inode, fh, offset, ..
        } => match fs.readdir(req, inode, fh, offset).await {
            Ok(reply) => encode_readdir(out, unique, reply.entries).await,
            Err(err) => codec::encode_error(out, unique, err.0),
        },

        Op::Releasedir { inode, fh, flags } => {
            reply_unit!(fs.releasedir(req, inode, fh, flags).await)
        }

        Op::Fsyncdir { inode, fh, datasync } => {
            reply_unit!(fs.fsyncdir(req, inode, fh, datasync).await)
        }

        #[cfg(feature = "file-lock")]
        Op::Getlk {
            inode,
            fh,
            lock_owner,
            start,
            end,
            r#type,
            pid,
        } => reply!(
            fs.getlk(req, inode, fh, lock_owner, start, end, r#type, pid).await,
            codec::encode_lock
        ),

        #[cfg(feature = "file-lock")]
        Op::Setlk {
            inode,
            fh,
            lock_owner,
            start,
            end,
            r#type,
            pid,
            block,
        } => reply_unit!(
            fs.setlk(req, inode, fh, lock_owner, start, end, r#type, pid, block)
                .await
        ),

        Op::Access { inode, mask } => reply_unit!(fs.access(req, inode, mask).await),

        Op::Create {
            parent,
            name,
            mode,
            flags,
        } => match fs.create(req, parent, name, mode, flags).await {
            Ok(reply) => codec::encode_created(out, unique, reply),
            Err(err) => codec::encode_error(out, unique, err.0),
        },

        Op::Interrupt { unique: target } => {
            // the signal was already delivered to the cancel table in the
            // read loop; just acknowledge it to the host too.
            let _ = fs.interrupt(req, target).await;
            codec::encode_ok(out, unique);
        }

        Op::Bmap {
            inode,
            blocksize,
            idx,
        } => reply!(fs.bmap(req, inode, blocksize, idx).await, codec::encode_bmap),

        Op::Poll {
            inode,
            fh,
            kh,
            flags,
            events,
        } => reply!(
            fs.poll(req, inode, fh, kh, flags, events, notify).await,
            codec::encode_poll
        ),

        Op::NotifyReply {
            inode,
            offset,
            data,
        } => {
            let _ = fs
                .notify_reply(req, inode, offset, bytes::Bytes::copy_from_slice(data))
                .await;
        }

        Op::Fallocate {
            inode,
            fh,
            offset,
            length,
            mode,
        } => reply_unit!(fs.fallocate(req, inode, fh, offset, length, mode).await),

        Op::Readdirplus {
            inode,
            fh,
            offset,
            lock_owner,
        } => match fs.readdirplus(req, inode, fh, offset, lock_owner).await {
            Ok(reply) => encode_readdirplus(out, unique, reply.entries).await,
            Err(err) => codec::encode_error(out, unique, err.0),
        },
    }
}

async fn encode_readdir<S>(out: &mut OutMessage, unique: u64, entries: S)
where
    S: futures_util::stream::Stream<Item = crate::Result<crate::reply::DirectoryEntry>>,
{
    use std::pin::pin;

    let mut entries = pin!(entries);
    let mut body = OutMessage::with_capacity(DIRENT_BODY_CAP);

    while let Some(entry) = entries.next().await {
        match entry {
            Ok(entry) => {
                let remaining = DIRENT_BODY_CAP.saturating_sub(body.len());
                if codec::write_dirent(&mut body, remaining, &entry) == 0 {
                    break;
                }
            }
            Err(err) => {
                codec::encode_error(out, unique, err.0);
                return;
            }
        }
    }

    codec::encode_data(out, unique, body.bytes());
}

async fn encode_readdirplus<S>(out: &mut OutMessage, unique: u64, entries: S)
where
    S: futures_util::stream::Stream<Item = crate::Result<crate::reply::DirectoryEntryPlus>>,
{
    use std::pin::pin;

    let mut entries = pin!(entries);
    let mut body = OutMessage::with_capacity(DIRENT_BODY_CAP);

    while let Some(entry) = entries.next().await {
        match entry {
            Ok(entry) => {
                let remaining = DIRENT_BODY_CAP.saturating_sub(body.len());
                if codec::write_direntplus(&mut body, remaining, &entry) == 0 {
                    break;
                }
            }
            Err(err) => {
                codec::encode_error(out, unique, err.0);
                return;
            }
        }
    }

    codec::encode_data(out, unique, body.bytes());
}

/// scenario tests for `run_op`/the in-flight drain, covering §8's six
/// concrete scenarios without a live `/dev/fuse`: a stub [`Filesystem`]
/// stands in for the host, and a loopback `Notify` sender stands in for the
/// kernel-write channel `Connection::run` would otherwise drain.
#[cfg(test)]
mod dispatch_tests {
    use std::ffi::OsStr;
    use std::num::NonZeroU32;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::stream;

    use super::*;
    use crate::reply::*;
    use crate::{FileType, Timestamp};

    struct StubFs;

    impl Filesystem for StubFs {
        async fn init(&self, _req: Request) -> crate::Result<ReplyInit> {
            Ok(ReplyInit {
                max_write: NonZeroU32::new(1_048_576).unwrap(),
            })
        }

        async fn destroy(&self, _req: Request) {}

        async fn lookup(
            &self,
            _req: Request,
            _parent: Inode,
            name: &OsStr,
        ) -> crate::Result<ReplyEntry> {
            assert_eq!(name, "foo");
            Ok(ReplyEntry {
                ttl: Duration::ZERO,
                generation: 0,
                attr: FileAttr {
                    ino: 7,
                    size: 123,
                    blocks: 1,
                    atime: Timestamp::ZERO,
                    mtime: Timestamp::ZERO,
                    ctime: Timestamp::ZERO,
                    #[cfg(target_os = "macos")]
                    crtime: Timestamp::ZERO,
                    kind: FileType::RegularFile,
                    perm: 0o644,
                    nlink: 1,
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    #[cfg(target_os = "macos")]
                    flags: 0,
                    blksize: 512,
                },
            })
        }

        async fn read(
            &self,
            _req: Request,
            _inode: Inode,
            _fh: FileHandle,
            offset: u64,
            _size: u32,
        ) -> crate::Result<ReplyData> {
            assert_eq!(offset, 2);
            Ok(ReplyData {
                data: bytes::Bytes::from_static(b"co"),
            })
        }

        #[allow(clippy::too_many_arguments)]
        async fn write(
            &self,
            _req: Request,
            _inode: Inode,
            _fh: FileHandle,
            _offset: u64,
            data: &[u8],
            _write_flags: u32,
            _flags: u32,
        ) -> crate::Result<ReplyWrite> {
            assert_eq!(data, b"taco");
            Ok(ReplyWrite {
                written: data.len() as u32,
            })
        }

        type DirEntryStream<'a> = stream::Empty<crate::Result<DirectoryEntry>>;
        type DirEntryPlusStream<'a> = stream::Empty<crate::Result<DirectoryEntryPlus>>;
    }

    fn fake_request(unique: u64) -> Request {
        Request {
            unique,
            uid: 0,
            gid: 0,
            pid: 0,
            cancel: CancelToken::new(),
        }
    }

    fn loopback_notify() -> Notify {
        Notify::new(futures_channel::mpsc::unbounded().0)
    }

    fn out_header(bytes: &[u8]) -> (u32, i32, u64) {
        (
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        )
    }

    /// scenario 1: the kernel's FUSE_INIT is answered inline with the
    /// negotiated version/flags/max_write, no host callback beyond `init`.
    #[tokio::test]
    async fn init_handshake_answers_with_negotiated_values() {
        let fs = StubFs;
        let config = MountConfig::default();
        let mut out = OutMessage::with_capacity(256);

        run_op(
            &fs,
            &config,
            &mut out,
            fake_request(1),
            Op::Init {
                major: 7,
                minor: 31,
                max_readahead: 131_072,
                flags: 0,
            },
            1,
            &loopback_notify(),
        )
        .await;

        let (len, error, unique) = out_header(out.bytes());
        assert_eq!(error, 0);
        assert_eq!(unique, 1);
        assert_eq!(len as usize, out.len());
    }

    /// scenario 2: a lookup reaches the host and its `ReplyEntry` comes back
    /// as an `EntryOut` keyed to the child inode the host minted.
    #[tokio::test]
    async fn lookup_reaches_host_and_replies_with_entry() {
        let fs = StubFs;
        let config = MountConfig::default();
        let mut out = OutMessage::with_capacity(256);

        run_op(
            &fs,
            &config,
            &mut out,
            fake_request(42),
            Op::Lookup {
                parent: Inode(1),
                name: OsStr::new("foo"),
            },
            42,
            &loopback_notify(),
        )
        .await;

        let (_, error, unique) = out_header(out.bytes());
        assert_eq!(error, 0);
        assert_eq!(unique, 42);
        let nodeid = u64::from_le_bytes(out.bytes()[16..24].try_into().unwrap());
        assert_eq!(nodeid, 7);
    }

    /// scenario 3: a short host read (EOF) is forwarded verbatim, not
    /// padded or turned into an error.
    #[tokio::test]
    async fn short_read_is_forwarded_without_error() {
        let fs = StubFs;
        let config = MountConfig::default();
        let mut out = OutMessage::with_capacity(256);

        run_op(
            &fs,
            &config,
            &mut out,
            fake_request(5),
            Op::Read {
                inode: Inode(7),
                fh: FileHandle(1),
                offset: 2,
                size: 1024,
            },
            5,
            &loopback_notify(),
        )
        .await;

        let (len, error, _) = out_header(out.bytes());
        assert_eq!(error, 0);
        assert_eq!(len as usize, crate::abi::FUSE_OUT_HEADER_SIZE + 2);
        assert_eq!(&out.bytes()[crate::abi::FUSE_OUT_HEADER_SIZE..], b"co");
    }

    /// scenario 4: a write's echoed byte count comes back as `WriteOut`.
    #[tokio::test]
    async fn write_replies_with_bytes_written() {
        let fs = StubFs;
        let config = MountConfig::default();
        let mut out = OutMessage::with_capacity(256);

        run_op(
            &fs,
            &config,
            &mut out,
            fake_request(6),
            Op::Write {
                inode: Inode(7),
                fh: FileHandle(1),
                offset: 0,
                data: b"taco",
                write_flags: 0,
                flags: 0,
            },
            6,
            &loopback_notify(),
        )
        .await;

        let (_, error, _) = out_header(out.bytes());
        assert_eq!(error, 0);
        let written = u32::from_le_bytes(out.bytes()[16..20].try_into().unwrap());
        assert_eq!(written, 4);
    }

    /// scenario 5: an `INTERRUPT` for a still in-flight unique id flips
    /// that op's cancel token; one for an already-completed (or unknown)
    /// unique id is silently dropped.
    #[test]
    fn interrupt_cancels_only_the_tracked_unique() {
        let table: CancelTable = RwLock::new(HashMap::new());
        let token = CancelToken::new();
        table.write().unwrap().insert(100, token.clone());

        signal_interrupt(&table, 999);
        assert!(!token.is_cancelled(), "unrelated unique must not cancel it");

        signal_interrupt(&table, 100);
        assert!(token.is_cancelled());
    }

    /// scenario 6: `Connection::run` waits for the in-flight counter to
    /// drain to zero (signaled through the same `idle` notify it uses)
    /// before it would close the kernel fd.
    #[tokio::test]
    async fn drain_waits_for_in_flight_to_reach_zero() {
        let in_flight = Arc::new(AtomicUsize::new(1));
        let idle = Arc::new(IdleNotify::new());

        let waiter = {
            let in_flight = in_flight.clone();
            let idle = idle.clone();
            tokio::spawn(async move {
                while in_flight.load(Ordering::Acquire) > 0 {
                    idle.notified().await;
                }
            })
        };

        // give the waiter a chance to park on the first `notified()` before
        // the "in-flight op" finishes, matching the race `Connection::run`
        // itself has to tolerate.
        tokio::task::yield_now().await;

        in_flight.fetch_sub(1, Ordering::Release);
        idle.notify();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain should not hang")
            .unwrap();
    }
}
