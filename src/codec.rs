//! wire codec: [`InMessage`] -> [`Op`] on the way in, typed replies -> [`OutMessage`] on the way out.
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use bincode::Options;

use crate::abi::*;
use crate::buffer::{InMessage, OutMessage};
use crate::helper::{get_bincode_config, index_first_null};
use crate::op::{Header, Op};
use crate::reply::{DirectoryEntry, DirectoryEntryPlus, FileAttr};
use crate::{FileHandle, Inode};

/// errors that abort decoding a single request. Always mapped to `EINVAL`
/// (or `ENOSYS` for an opcode we don't recognize) at the connection
/// boundary; a `DecodeError` never reaches host code.
#[derive(Debug)]
pub enum DecodeError {
    Truncated {
        op: &'static str,
        needed: usize,
        got: usize,
    },
    BadName {
        op: &'static str,
    },
    UnknownOpcode(u32),
}

impl DecodeError {
    pub fn errno(&self) -> i32 {
        match self {
            DecodeError::UnknownOpcode(_) => libc::ENOSYS,
            _ => libc::EINVAL,
        }
    }
}

fn deserialize<'a, T: serde::Deserialize<'a>>(
    op: &'static str,
    needed: usize,
    data: &'a [u8],
) -> Result<T, DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::Truncated {
            op,
            needed,
            got: data.len(),
        });
    }

    get_bincode_config()
        .deserialize(data)
        .map_err(|_| DecodeError::Truncated {
            op,
            needed,
            got: data.len(),
        })
}

fn take_name(op: &'static str, data: &[u8]) -> Result<&OsStr, DecodeError> {
    let end = index_first_null(data).ok_or(DecodeError::BadName { op })?;
    Ok(OsStr::from_bytes(&data[..end]))
}

fn take_two_names(op: &'static str, data: &[u8]) -> Result<(&OsStr, &OsStr), DecodeError> {
    let first_end = index_first_null(data).ok_or(DecodeError::BadName { op })?;
    let rest = &data[first_end + 1..];
    let second_end = index_first_null(rest).ok_or(DecodeError::BadName { op })?;
    Ok((
        OsStr::from_bytes(&data[..first_end]),
        OsStr::from_bytes(&rest[..second_end]),
    ))
}

/// decode one request out of the bytes a read filled into `msg`.
pub fn decode(msg: &InMessage, version: ProtocolVersion) -> Result<(Header, Op<'_>), DecodeError> {
    let raw = msg.bytes();
    let in_header: fuse_in_header = deserialize("header", FUSE_IN_HEADER_SIZE, raw)?;
    let body = &raw[FUSE_IN_HEADER_SIZE..];

    let header = Header {
        unique: in_header.unique,
        opcode: in_header.opcode,
        nodeid: in_header.nodeid,
        uid: in_header.uid,
        gid: in_header.gid,
        pid: in_header.pid,
    };

    let opcode = fuse_opcode::try_from(in_header.opcode)
        .map_err(|e| DecodeError::UnknownOpcode(e.0))?;
    let inode = Inode(in_header.nodeid);

    let op = match opcode {
        fuse_opcode::FUSE_INIT => {
            let init_in: fuse_init_in = deserialize("init", FUSE_INIT_IN_SIZE, body)?;
            Op::Init {
                major: FUSE_KERNEL_VERSION,
                minor: FUSE_KERNEL_MINOR_VERSION,
                max_readahead: init_in.max_readahead,
                flags: init_in.flags,
            }
        }

        fuse_opcode::FUSE_DESTROY => Op::Destroy,

        fuse_opcode::FUSE_LOOKUP => Op::Lookup {
            parent: inode,
            name: take_name("lookup", body)?,
        },

        fuse_opcode::FUSE_FORGET => {
            let forget_in: fuse_forget_in = deserialize("forget", mem::size_of::<fuse_forget_in>(), body)?;
            Op::Forget {
                inode,
                nlookup: forget_in.nlookup,
            }
        }

        fuse_opcode::FUSE_BATCH_FORGET => {
            let batch: fuse_batch_forget_in =
                deserialize("batch_forget", FUSE_BATCH_FORGET_IN_SIZE, body)?;
            let mut forgets = Vec::with_capacity(batch.count as usize);
            let mut rest = &body[FUSE_BATCH_FORGET_IN_SIZE..];

            for _ in 0..batch.count {
                let one: fuse_forget_one =
                    deserialize("batch_forget_one", FUSE_FORGET_ONE_SIZE, rest)?;
                forgets.push((Inode(one.nodeid), one._nlookup));
                rest = &rest[FUSE_FORGET_ONE_SIZE..];
            }

            Op::BatchForget { forgets }
        }

        fuse_opcode::FUSE_GETATTR => {
            let getattr_in: fuse_getattr_in =
                deserialize("getattr", mem::size_of::<fuse_getattr_in>(), body)?;
            Op::Getattr {
                inode,
                fh: (getattr_in.getattr_flags & FUSE_GETATTR_FH > 0)
                    .then_some(FileHandle(getattr_in.fh)),
                flags: getattr_in.getattr_flags,
            }
        }

        fuse_opcode::FUSE_SETATTR => {
            let setattr_in: fuse_setattr_in =
                deserialize("setattr", mem::size_of::<fuse_setattr_in>(), body)?;
            Op::Setattr {
                inode,
                fh: (setattr_in.valid & FATTR_FH > 0).then_some(FileHandle(setattr_in.fh)),
                set_attr: (&setattr_in).into(),
            }
        }

        fuse_opcode::FUSE_READLINK => Op::Readlink { inode },

        fuse_opcode::FUSE_SYMLINK => {
            let (name, link) = take_two_names("symlink", body)?;
            Op::Symlink {
                parent: inode,
                name,
                link,
            }
        }

        fuse_opcode::FUSE_MKNOD => {
            let mknod_in: fuse_mknod_in = deserialize("mknod", FUSE_MKNOD_IN_SIZE, body)?;
            Op::Mknod {
                parent: inode,
                name: take_name("mknod", &body[FUSE_MKNOD_IN_SIZE..])?,
                mode: mknod_in.mode,
                rdev: mknod_in.rdev,
            }
        }

        fuse_opcode::FUSE_MKDIR => {
            let mkdir_in: fuse_mkdir_in = deserialize("mkdir", FUSE_MKDIR_IN_SIZE, body)?;
            Op::Mkdir {
                parent: inode,
                name: take_name("mkdir", &body[FUSE_MKDIR_IN_SIZE..])?,
                mode: mkdir_in.mode,
                umask: mkdir_in.umask,
            }
        }

        fuse_opcode::FUSE_UNLINK => Op::Unlink {
            parent: inode,
            name: take_name("unlink", body)?,
        },

        fuse_opcode::FUSE_RMDIR => Op::Rmdir {
            parent: inode,
            name: take_name("rmdir", body)?,
        },

        fuse_opcode::FUSE_RENAME => {
            let rename_in: fuse_rename_in = deserialize("rename", FUSE_RENAME_IN_SIZE, body)?;
            let (name, new_name) = take_two_names("rename", &body[FUSE_RENAME_IN_SIZE..])?;
            Op::Rename {
                parent: inode,
                name,
                new_parent: Inode(rename_in.newdir),
                new_name,
            }
        }

        fuse_opcode::FUSE_RENAME2 => {
            let rename_in: fuse_rename2_in =
                deserialize("rename2", FUSE_RENAME2_IN_SIZE, body)?;
            let (name, new_name) = take_two_names("rename2", &body[FUSE_RENAME2_IN_SIZE..])?;
            Op::Rename2 {
                parent: inode,
                name,
                new_parent: Inode(rename_in.newdir),
                new_name,
                flags: rename_in.flags,
            }
        }

        fuse_opcode::FUSE_LINK => {
            let link_in: fuse_link_in = deserialize("link", FUSE_LINK_IN_SIZE, body)?;
            Op::Link {
                inode: Inode(link_in.oldnodeid),
                new_parent: inode,
                new_name: take_name("link", &body[FUSE_LINK_IN_SIZE..])?,
            }
        }

        fuse_opcode::FUSE_OPEN => {
            let open_in: fuse_open_in = deserialize("open", mem::size_of::<fuse_open_in>(), body)?;
            Op::Open {
                inode,
                flags: open_in.flags,
            }
        }

        fuse_opcode::FUSE_READ => {
            let size = read_in_size(version);
            let read_in: fuse_read_in = deserialize("read", size, body)?;
            Op::Read {
                inode,
                fh: FileHandle(read_in.fh),
                offset: read_in.offset,
                size: read_in.size,
            }
        }

        fuse_opcode::FUSE_WRITE => {
            let size = write_in_size(version);
            if size == FUSE_WRITE_IN_V7P1_SIZE {
                let write_in: fuse_write_in_v7p1 = deserialize("write", size, body)?;
                let data_len = write_in.size as usize;
                let data = body
                    .get(size..size + data_len)
                    .ok_or(DecodeError::Truncated {
                        op: "write",
                        needed: size + data_len,
                        got: body.len(),
                    })?;
                Op::Write {
                    inode,
                    fh: FileHandle(write_in.fh),
                    offset: write_in.offset,
                    data,
                    write_flags: write_in.write_flags,
                    flags: 0,
                }
            } else {
                let write_in: fuse_write_in = deserialize("write", size, body)?;
                let data_len = write_in.size as usize;
                let data = body
                    .get(size..size + data_len)
                    .ok_or(DecodeError::Truncated {
                        op: "write",
                        needed: size + data_len,
                        got: body.len(),
                    })?;
                Op::Write {
                    inode,
                    fh: FileHandle(write_in.fh),
                    offset: write_in.offset,
                    data,
                    write_flags: write_in.write_flags,
                    flags: write_in.flags,
                }
            }
        }

        fuse_opcode::FUSE_STATFS => Op::Statfs { inode },

        fuse_opcode::FUSE_RELEASE => {
            let release_in: fuse_release_in =
                deserialize("release", mem::size_of::<fuse_release_in>(), body)?;
            Op::Release {
                inode,
                fh: FileHandle(release_in.fh),
                flags: release_in.flags,
                lock_owner: release_in.lock_owner,
                flush: release_in.release_flags & FUSE_RELEASE_FLUSH > 0,
            }
        }

        fuse_opcode::FUSE_FSYNC => {
            let fsync_in: fuse_fsync_in =
                deserialize("fsync", mem::size_of::<fuse_fsync_in>(), body)?;
            Op::Fsync {
                inode,
                fh: FileHandle(fsync_in.fh),
                datasync: fsync_in.fsync_flags & 1 > 0,
            }
        }

        fuse_opcode::FUSE_SETXATTR => {
            let setxattr_in: fuse_setxattr_in =
                deserialize("setxattr", mem::size_of::<fuse_setxattr_in>(), body)?;
            let rest = &body[mem::size_of::<fuse_setxattr_in>()..];
            let name_end = index_first_null(rest).ok_or(DecodeError::BadName { op: "setxattr" })?;
            let name = OsStr::from_bytes(&rest[..name_end]);
            let value_start = name_end + 1;
            let value_len = setxattr_in.size as usize;
            let value = rest
                .get(value_start..value_start + value_len)
                .ok_or(DecodeError::Truncated {
                    op: "setxattr",
                    needed: value_start + value_len,
                    got: rest.len(),
                })?;
            #[cfg(target_os = "macos")]
            let position = setxattr_in.position;
            #[cfg(not(target_os = "macos"))]
            let position = 0;
            Op::SetXattr {
                inode,
                name,
                value,
                flags: setxattr_in.flags,
                position,
            }
        }

        fuse_opcode::FUSE_GETXATTR => {
            let getxattr_in: fuse_getxattr_in =
                deserialize("getxattr", FUSE_GETXATTR_IN_SIZE, body)?;
            Op::GetXattr {
                inode,
                name: take_name("getxattr", &body[FUSE_GETXATTR_IN_SIZE..])?,
                size: getxattr_in.size,
            }
        }

        fuse_opcode::FUSE_LISTXATTR => {
            let getxattr_in: fuse_getxattr_in =
                deserialize("listxattr", FUSE_GETXATTR_IN_SIZE, body)?;
            Op::ListXattr {
                inode,
                size: getxattr_in.size,
            }
        }

        fuse_opcode::FUSE_REMOVEXATTR => Op::RemoveXattr {
            inode,
            name: take_name("removexattr", body)?,
        },

        fuse_opcode::FUSE_FLUSH => {
            let flush_in: fuse_flush_in =
                deserialize("flush", mem::size_of::<fuse_flush_in>(), body)?;
            Op::Flush {
                inode,
                fh: FileHandle(flush_in.fh),
                lock_owner: flush_in.lock_owner,
            }
        }

        fuse_opcode::FUSE_OPENDIR => {
            let open_in: fuse_open_in = deserialize("opendir", mem::size_of::<fuse_open_in>(), body)?;
            Op::Opendir {
                inode,
                flags: open_in.flags,
            }
        }

        fuse_opcode::FUSE_READDIR => {
            let read_in: fuse_read_in = deserialize("readdir", read_in_size(version), body)?;
            Op::Readdir {
                inode,
                fh: FileHandle(read_in.fh),
                offset: read_in.offset as i64,
                plus: false,
            }
        }

        fuse_opcode::FUSE_READDIRPLUS => {
            let read_in: fuse_read_in =
                deserialize("readdirplus", read_in_size(version), body)?;
            Op::Readdirplus {
                inode,
                fh: FileHandle(read_in.fh),
                offset: read_in.offset,
                lock_owner: read_in.lock_owner,
            }
        }

        fuse_opcode::FUSE_RELEASEDIR => {
            let release_in: fuse_release_in =
                deserialize("releasedir", mem::size_of::<fuse_release_in>(), body)?;
            Op::Releasedir {
                inode,
                fh: FileHandle(release_in.fh),
                flags: release_in.flags,
            }
        }

        fuse_opcode::FUSE_FSYNCDIR => {
            let fsync_in: fuse_fsync_in =
                deserialize("fsyncdir", mem::size_of::<fuse_fsync_in>(), body)?;
            Op::Fsyncdir {
                inode,
                fh: FileHandle(fsync_in.fh),
                datasync: fsync_in.fsync_flags & 1 > 0,
            }
        }

        #[cfg(feature = "file-lock")]
        fuse_opcode::FUSE_GETLK => {
            let lk_in: fuse_lk_in = deserialize("getlk", mem::size_of::<fuse_lk_in>(), body)?;
            Op::Getlk {
                inode,
                fh: FileHandle(lk_in.fh),
                lock_owner: lk_in.owner,
                start: lk_in.lk.start,
                end: lk_in.lk.end,
                r#type: lk_in.lk.r#type,
                pid: lk_in.lk.pid,
            }
        }

        #[cfg(feature = "file-lock")]
        fuse_opcode::FUSE_SETLK | fuse_opcode::FUSE_SETLKW => {
            let lk_in: fuse_lk_in = deserialize("setlk", mem::size_of::<fuse_lk_in>(), body)?;
            Op::Setlk {
                inode,
                fh: FileHandle(lk_in.fh),
                lock_owner: lk_in.owner,
                start: lk_in.lk.start,
                end: lk_in.lk.end,
                r#type: lk_in.lk.r#type,
                pid: lk_in.lk.pid,
                block: opcode == fuse_opcode::FUSE_SETLKW,
            }
        }

        fuse_opcode::FUSE_ACCESS => {
            let access_in: fuse_access_in =
                deserialize("access", mem::size_of::<fuse_access_in>(), body)?;
            Op::Access {
                inode,
                mask: access_in.mask,
            }
        }

        fuse_opcode::FUSE_CREATE => {
            let create_in: fuse_create_in = deserialize("create", FUSE_CREATE_IN_SIZE, body)?;
            Op::Create {
                parent: inode,
                name: take_name("create", &body[FUSE_CREATE_IN_SIZE..])?,
                mode: create_in.mode,
                flags: create_in.flags,
            }
        }

        fuse_opcode::FUSE_INTERRUPT => {
            let interrupt_in: fuse_interrupt_in =
                deserialize("interrupt", mem::size_of::<fuse_interrupt_in>(), body)?;
            Op::Interrupt {
                unique: interrupt_in.unique,
            }
        }

        fuse_opcode::FUSE_BMAP => {
            let bmap_in: fuse_bmap_in =
                deserialize("bmap", mem::size_of::<fuse_bmap_in>(), body)?;
            Op::Bmap {
                inode,
                blocksize: bmap_in.blocksize,
                idx: bmap_in.block,
            }
        }

        fuse_opcode::FUSE_POLL => {
            let poll_in: fuse_poll_in =
                deserialize("poll", mem::size_of::<fuse_poll_in>(), body)?;
            Op::Poll {
                inode,
                fh: FileHandle(poll_in.fh),
                kh: (poll_in.flags & FUSE_POLL_SCHEDULE_NOTIFY > 0).then_some(poll_in.kh),
                flags: poll_in.flags,
                events: poll_in.events,
            }
        }

        fuse_opcode::FUSE_NOTIFY_REPLY => {
            let retrieve_in: fuse_notify_retrieve_in = deserialize(
                "notify_reply",
                FUSE_NOTIFY_RETRIEVE_IN_SIZE,
                body,
            )?;
            Op::NotifyReply {
                inode,
                offset: retrieve_in.offset,
                data: &body[FUSE_NOTIFY_RETRIEVE_IN_SIZE..],
            }
        }

        fuse_opcode::FUSE_FALLOCATE => {
            let fallocate_in: fuse_fallocate_in =
                deserialize("fallocate", mem::size_of::<fuse_fallocate_in>(), body)?;
            Op::Fallocate {
                inode,
                fh: FileHandle(fallocate_in.fh),
                offset: fallocate_in.offset,
                length: fallocate_in.length,
                mode: fallocate_in.mode,
            }
        }

        #[cfg(target_os = "macos")]
        _ => return Err(DecodeError::UnknownOpcode(in_header.opcode)),
    };

    Ok((header, op))
}

use std::mem;

const FUSE_INIT_IN_SIZE: usize = mem::size_of::<fuse_init_in>();

/// overwrite `out`'s reserved header region (see
/// [`OutMessage::reset`][crate::buffer::OutMessage::reset]) with `header`.
fn write_out_header(out: &mut OutMessage, header: &fuse_out_header) {
    let mut buf = [0u8; FUSE_OUT_HEADER_SIZE];
    get_bincode_config()
        .serialize_into(&mut buf[..], header)
        .expect("fixed-size header write is infallible");
    out.fill_header(&buf);
}

/// write the version-appropriate `fuse_out_header` + payload into `out`.
/// `out` must have just come from [`OutMessage::reset`][crate::buffer::OutMessage::reset]
/// (or be freshly acquired from a [`crate::buffer::Pool`], which resets it).
pub(crate) fn write_header_and<T: serde::Serialize>(out: &mut OutMessage, unique: u64, payload: &T) {
    let payload_size = get_bincode_config()
        .serialized_size(payload)
        .unwrap_or(0) as usize;

    write_out_header(
        out,
        &fuse_out_header {
            len: (FUSE_OUT_HEADER_SIZE + payload_size) as u32,
            error: 0,
            unique,
        },
    );
    get_bincode_config()
        .serialize_into(&mut OutMessageWriter(out), payload)
        .expect("pooled buffer write is infallible");
}

/// adapter so `bincode::Options::serialize_into` can append into an
/// [`OutMessage`] the same way it would write into a `Vec<u8>`.
struct OutMessageWriter<'a>(&'a mut OutMessage);

impl<'a> std::io::Write for OutMessageWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// write a bare error reply: header only, no payload.
pub fn encode_error(out: &mut OutMessage, unique: u64, errno: i32) {
    write_out_header(
        out,
        &fuse_out_header {
            len: FUSE_OUT_HEADER_SIZE as u32,
            error: -errno.abs(),
            unique,
        },
    );
}

#[allow(clippy::too_many_arguments)]
pub fn encode_init(
    out: &mut OutMessage,
    unique: u64,
    reply: crate::reply::ReplyInit,
    flags: u32,
    max_readahead: u32,
    max_background: u16,
    congestion_threshold: u16,
) {
    let init_out = fuse_init_out {
        major: FUSE_KERNEL_VERSION,
        minor: FUSE_KERNEL_MINOR_VERSION,
        max_readahead,
        flags,
        max_background,
        congestion_threshold,
        max_write: reply.max_write.get(),
        time_gran: DEFAULT_TIME_GRAN,
        max_pages: DEFAULT_MAX_PAGES,
        map_alignment: DEFAULT_MAP_ALIGNMENT,
        unused: [0; 8],
    };

    write_header_and(out, unique, &init_out);
}

pub fn encode_entry(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyEntry) {
    let entry_out: fuse_entry_out = reply.into();
    write_header_and(out, unique, &entry_out);
}

pub fn encode_attr(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyAttr) {
    let attr_out: fuse_attr_out = reply.into();
    write_header_and(out, unique, &attr_out);
}

pub fn encode_open(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyOpen) {
    let open_out: fuse_open_out = reply.into();
    write_header_and(out, unique, &open_out);
}

pub fn encode_write(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyWrite) {
    let write_out: fuse_write_out = reply.into();
    write_header_and(out, unique, &write_out);
}

pub fn encode_data(out: &mut OutMessage, unique: u64, data: &[u8]) {
    write_out_header(
        out,
        &fuse_out_header {
            len: (FUSE_OUT_HEADER_SIZE + data.len()) as u32,
            error: 0,
            unique,
        },
    );
    out.append(data);
}

pub fn encode_statfs(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyStatFs) {
    let statfs_out: fuse_statfs_out = reply.into();
    write_header_and(out, unique, &statfs_out);
}

pub fn encode_ok(out: &mut OutMessage, unique: u64) {
    write_out_header(
        out,
        &fuse_out_header {
            len: FUSE_OUT_HEADER_SIZE as u32,
            error: 0,
            unique,
        },
    );
}

pub fn encode_xattr_size(out: &mut OutMessage, unique: u64, size: u32) {
    let getxattr_out = fuse_getxattr_out { size, _padding: 0 };
    write_header_and(out, unique, &getxattr_out);
}

pub fn encode_created(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyCreated) {
    let (entry_out, open_out): (fuse_entry_out, fuse_open_out) = reply.into();

    let payload_size = get_bincode_config().serialized_size(&entry_out).unwrap_or(0) as usize
        + get_bincode_config().serialized_size(&open_out).unwrap_or(0) as usize;

    write_out_header(
        out,
        &fuse_out_header {
            len: (FUSE_OUT_HEADER_SIZE + payload_size) as u32,
            error: 0,
            unique,
        },
    );
    get_bincode_config()
        .serialize_into(&mut OutMessageWriter(out), &entry_out)
        .expect("pooled buffer write is infallible");
    get_bincode_config()
        .serialize_into(&mut OutMessageWriter(out), &open_out)
        .expect("pooled buffer write is infallible");
}

pub fn encode_bmap(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyBmap) {
    let bmap_out: fuse_bmap_out = reply.into();
    write_header_and(out, unique, &bmap_out);
}

pub fn encode_poll(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyPoll) {
    let poll_out: fuse_poll_out = reply.into();
    write_header_and(out, unique, &poll_out);
}

#[cfg(feature = "file-lock")]
pub fn encode_lock(out: &mut OutMessage, unique: u64, reply: crate::reply::ReplyLock) {
    let lk_out: fuse_lk_out = reply.into();
    write_header_and(out, unique, &lk_out);
}

/// write one `fuse_dirent` + name into `out`, 8-byte aligning the entry.
/// Returns `0` without writing anything if the entry would not fit in
/// `remaining` bytes, matching the kernel's own short-read-on-overflow
/// convention for `readdir`.
pub fn write_dirent(out: &mut OutMessage, remaining: usize, entry: &DirectoryEntry) -> usize {
    let name = entry.name.as_os_str().as_bytes();
    let entry_len = FUSE_DIRENT_SIZE + name.len();
    let padded_len = (entry_len + 7) & !7;

    if padded_len > remaining {
        return 0;
    }

    let dirent = fuse_dirent {
        ino: entry.inode,
        off: entry.offset as u64,
        namelen: name.len() as u32,
        r#type: (mode_for_kind(entry.kind) >> 12) as u32,
    };

    get_bincode_config()
        .serialize_into(&mut OutMessageWriter(out), &dirent)
        .expect("pooled buffer write is infallible");
    out.append(name);
    for _ in 0..(padded_len - entry_len) {
        out.append(&[0u8]);
    }

    padded_len
}

/// like [`write_dirent`] but for `FUSE_READDIRPLUS`, which interleaves a
/// full `fuse_entry_out` ahead of each `fuse_dirent`.
pub fn write_direntplus(out: &mut OutMessage, remaining: usize, entry: &DirectoryEntryPlus) -> usize {
    let name = entry.name.as_os_str().as_bytes();
    let entry_len = FUSE_DIRENTPLUS_SIZE + name.len();
    let padded_len = (entry_len + 7) & !7;

    if padded_len > remaining {
        return 0;
    }

    let attr: FileAttr = entry.attr;
    let (entry_valid, entry_valid_nsec) = ttl_to_kernel_duration(entry.entry_ttl);
    let (attr_valid, attr_valid_nsec) = ttl_to_kernel_duration(entry.attr_ttl);
    let entry_out = fuse_entry_out {
        nodeid: entry.inode,
        generation: entry.generation,
        entry_valid,
        attr_valid,
        entry_valid_nsec,
        attr_valid_nsec,
        attr: attr.into(),
    };

    let direntplus = fuse_direntplus {
        entry_out,
        dirent: fuse_dirent {
            ino: entry.inode,
            off: entry.offset as u64,
            namelen: name.len() as u32,
            r#type: (mode_for_kind(entry.kind) >> 12) as u32,
        },
    };

    get_bincode_config()
        .serialize_into(&mut OutMessageWriter(out), &direntplus)
        .expect("pooled buffer write is infallible");
    out.append(name);
    for _ in 0..(padded_len - entry_len) {
        out.append(&[0u8]);
    }

    padded_len
}

fn mode_for_kind(kind: crate::FileType) -> u32 {
    crate::helper::mode_from_kind_and_perm(kind, 0)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::time::Duration;

    use super::*;
    use crate::reply::FileAttr;
    use crate::FileType;

    /// build a raw `fuse_in_header` + payload, matching the field order
    /// `bincode`'s fixint encoding writes them in - no struct padding.
    fn in_message(opcode: u32, unique: u64, nodeid: u64, payload: &[u8]) -> InMessage {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(FUSE_IN_HEADER_SIZE as u32 + payload.len() as u32).to_le_bytes());
        raw.extend_from_slice(&opcode.to_le_bytes());
        raw.extend_from_slice(&unique.to_le_bytes());
        raw.extend_from_slice(&nodeid.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes()); // uid
        raw.extend_from_slice(&0u32.to_le_bytes()); // gid
        raw.extend_from_slice(&0u32.to_le_bytes()); // pid
        raw.extend_from_slice(&0u32.to_le_bytes()); // _padding
        raw.extend_from_slice(payload);

        let mut msg = InMessage::with_capacity(raw.len().max(64));
        msg.as_mut_slice()[..raw.len()].copy_from_slice(&raw);
        msg.consume(raw.len());
        msg
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn read_u64(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    fn out_header(bytes: &[u8]) -> (u32, i32, u64) {
        (
            read_u32(bytes, 0),
            read_u32(bytes, 4) as i32,
            read_u64(bytes, 8),
        )
    }

    fn sample_attr(ino: u64) -> FileAttr {
        FileAttr {
            ino,
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
        }
    }

    #[test]
    fn decode_init_reads_kernel_offer() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_le_bytes()); // major
        payload.extend_from_slice(&31u32.to_le_bytes()); // minor
        payload.extend_from_slice(&131072u32.to_le_bytes()); // max_readahead
        payload.extend_from_slice(&0x1234u32.to_le_bytes()); // flags

        let msg = in_message(fuse_opcode::FUSE_INIT as u32, 1, 1, &payload);
        let (header, op) = decode(&msg, ProtocolVersion::LATEST).unwrap();

        assert_eq!(header.unique, 1);
        match op {
            Op::Init {
                max_readahead,
                flags,
                ..
            } => {
                assert_eq!(max_readahead, 131072);
                assert_eq!(flags, 0x1234);
            }
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[test]
    fn decode_lookup_splits_name_at_nul() {
        let msg = in_message(fuse_opcode::FUSE_LOOKUP as u32, 42, 1, b"foo\0");
        let (header, op) = decode(&msg, ProtocolVersion::LATEST).unwrap();

        assert_eq!(header.unique, 42);
        match op {
            Op::Lookup { parent, name } => {
                assert_eq!(parent, Inode(1));
                assert_eq!(name, OsString::from("foo"));
            }
            other => panic!("expected Lookup, got {other:?}"),
        }
    }

    #[test]
    fn decode_lookup_missing_nul_is_bad_name() {
        let msg = in_message(fuse_opcode::FUSE_LOOKUP as u32, 1, 1, b"nonul");
        let err = decode(&msg, ProtocolVersion::LATEST).unwrap_err();
        assert!(matches!(err, DecodeError::BadName { op: "lookup" }));
    }

    #[test]
    fn decode_rename_splits_two_names() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u64.to_le_bytes()); // newdir
        payload.extend_from_slice(b"old\0new\0");

        let msg = in_message(fuse_opcode::FUSE_RENAME as u32, 5, 1, &payload);
        let (_, op) = decode(&msg, ProtocolVersion::LATEST).unwrap();

        match op {
            Op::Rename {
                name,
                new_parent,
                new_name,
                ..
            } => {
                assert_eq!(name, OsString::from("old"));
                assert_eq!(new_parent, Inode(7));
                assert_eq!(new_name, OsString::from("new"));
            }
            other => panic!("expected Rename, got {other:?}"),
        }
    }

    #[test]
    fn decode_truncated_header_is_rejected() {
        // one byte short of a full `fuse_in_header`.
        let msg = in_message(fuse_opcode::FUSE_GETATTR as u32, 1, 1, &[]);
        let mut bytes = msg.bytes().to_vec();
        bytes.truncate(FUSE_IN_HEADER_SIZE - 1);

        let mut short = InMessage::with_capacity(64);
        short.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
        short.consume(bytes.len());

        let err = decode(&short, ProtocolVersion::LATEST).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { op: "header", .. }));
    }

    #[test]
    fn decode_truncated_body_reports_needed_and_got() {
        // a Getattr body one byte short of `fuse_getattr_in` (16 bytes).
        let msg = in_message(fuse_opcode::FUSE_GETATTR as u32, 1, 1, &[0u8; 15]);
        let err = decode(&msg, ProtocolVersion::LATEST).unwrap_err();
        match err {
            DecodeError::Truncated { op, needed, got } => {
                assert_eq!(op, "getattr");
                assert_eq!(needed, 16);
                assert_eq!(got, 15);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn decode_write_rejects_payload_shorter_than_declared_size() {
        let size = write_in_size(ProtocolVersion::LATEST);
        let mut payload = vec![0u8; size];
        // size field lives right after fh(8)+offset(8).
        payload[16..20].copy_from_slice(&8u32.to_le_bytes());
        payload.extend_from_slice(b"abc"); // only 3 of the declared 8 bytes

        let msg = in_message(fuse_opcode::FUSE_WRITE as u32, 1, 7, &payload);
        let err = decode(&msg, ProtocolVersion::LATEST).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { op: "write", .. }));
    }

    #[test]
    fn decode_write_borrows_exact_data_region() {
        let size = write_in_size(ProtocolVersion::LATEST);
        let mut payload = vec![0u8; size];
        payload[16..20].copy_from_slice(&4u32.to_le_bytes());
        payload.extend_from_slice(b"taco");

        let msg = in_message(fuse_opcode::FUSE_WRITE as u32, 1, 7, &payload);
        let (_, op) = decode(&msg, ProtocolVersion::LATEST).unwrap();
        match op {
            Op::Write { data, inode, .. } => {
                assert_eq!(data, b"taco");
                assert_eq!(inode, Inode(7));
            }
            other => panic!("expected Write, got {other:?}"),
        }
    }

    #[test]
    fn decode_setxattr_splits_name_and_value() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u32.to_le_bytes()); // size
        payload.extend_from_slice(&0u32.to_le_bytes()); // flags
        payload.extend_from_slice(b"user.tag\0");
        payload.extend_from_slice(b"taco");

        let msg = in_message(fuse_opcode::FUSE_SETXATTR as u32, 1, 7, &payload);
        let (_, op) = decode(&msg, ProtocolVersion::LATEST).unwrap();
        match op {
            Op::SetXattr { name, value, .. } => {
                assert_eq!(name, "user.tag");
                assert_eq!(value, b"taco");
            }
            other => panic!("expected SetXattr, got {other:?}"),
        }
    }

    #[test]
    fn decode_setxattr_rejects_value_shorter_than_declared_size() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u32.to_le_bytes()); // size: claims 8 bytes
        payload.extend_from_slice(&0u32.to_le_bytes()); // flags
        payload.extend_from_slice(b"user.tag\0");
        payload.extend_from_slice(b"abc"); // only 3 of the declared 8 bytes

        let msg = in_message(fuse_opcode::FUSE_SETXATTR as u32, 1, 7, &payload);
        let err = decode(&msg, ProtocolVersion::LATEST).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { op: "setxattr", .. }));
    }

    #[test]
    fn decode_batch_forget_splits_into_pairs() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_le_bytes()); // count
        payload.extend_from_slice(&0u32.to_le_bytes()); // _dummy
        for (ino, nlookup) in [(10u64, 1u64), (11u64, 2u64)] {
            payload.extend_from_slice(&ino.to_le_bytes());
            payload.extend_from_slice(&nlookup.to_le_bytes());
        }

        let msg = in_message(fuse_opcode::FUSE_BATCH_FORGET as u32, 1, 1, &payload);
        let (_, op) = decode(&msg, ProtocolVersion::LATEST).unwrap();
        match op {
            Op::BatchForget { forgets } => {
                assert_eq!(forgets, vec![(Inode(10), 1), (Inode(11), 2)]);
            }
            other => panic!("expected BatchForget, got {other:?}"),
        }
    }

    #[test]
    fn decode_interrupt_carries_target_unique() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u64.to_le_bytes());

        let msg = in_message(fuse_opcode::FUSE_INTERRUPT as u32, 101, 0, &payload);
        let (_, op) = decode(&msg, ProtocolVersion::LATEST).unwrap();
        match op {
            Op::Interrupt { unique } => assert_eq!(unique, 100),
            other => panic!("expected Interrupt, got {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_opcode_is_rejected() {
        let msg = in_message(0xffff, 1, 1, &[]);
        let err = decode(&msg, ProtocolVersion::LATEST).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownOpcode(0xffff)));
        assert_eq!(err.errno(), libc::ENOSYS);
    }

    #[test]
    fn encode_error_writes_negative_errno_header_only() {
        let mut out = OutMessage::with_capacity(64);
        encode_error(&mut out, 7, libc::ENOENT);

        assert_eq!(out.len(), FUSE_OUT_HEADER_SIZE);
        let (len, error, unique) = out_header(out.bytes());
        assert_eq!(len, FUSE_OUT_HEADER_SIZE as u32);
        assert_eq!(error, -libc::ENOENT);
        assert_eq!(unique, 7);
    }

    #[test]
    fn encode_entry_round_trips_ttl_and_attr() {
        let mut out = OutMessage::with_capacity(256);
        let reply = crate::reply::ReplyEntry {
            ttl: Duration::from_secs(5),
            attr: sample_attr(7),
            generation: 0,
        };
        encode_entry(&mut out, 42, reply);

        let (len, error, unique) = out_header(out.bytes());
        assert_eq!(error, 0);
        assert_eq!(unique, 42);
        assert_eq!(len as usize, out.len());

        let payload = &out.bytes()[FUSE_OUT_HEADER_SIZE..];
        let nodeid = read_u64(payload, 0);
        let generation = read_u64(payload, 8);
        let entry_valid = read_u64(payload, 16);
        assert_eq!(nodeid, 7);
        assert_eq!(generation, 0);
        assert_eq!(entry_valid, 5);
    }

    #[test]
    fn encode_init_carries_negotiated_values() {
        let mut out = OutMessage::with_capacity(256);
        let reply = crate::reply::ReplyInit {
            max_write: std::num::NonZeroU32::new(1048576).unwrap(),
        };
        encode_init(&mut out, 1, reply, 0x7, 131072, 16, 12);

        let payload = &out.bytes()[FUSE_OUT_HEADER_SIZE..];
        let major = read_u32(payload, 0);
        let minor = read_u32(payload, 4);
        let max_readahead = read_u32(payload, 8);
        let flags = read_u32(payload, 12);
        assert_eq!(major, FUSE_KERNEL_VERSION);
        assert_eq!(minor, FUSE_KERNEL_MINOR_VERSION);
        assert_eq!(max_readahead, 131072);
        assert_eq!(flags, 0x7);
    }

    #[test]
    fn write_dirent_reports_zero_when_it_would_not_fit() {
        let mut out = OutMessage::with_capacity(64);
        let entry = DirectoryEntry {
            inode: 1,
            kind: FileType::RegularFile,
            name: OsString::from("a-name-too-long-for-the-remaining-space"),
            offset: 1,
        };

        let written = write_dirent(&mut out, 4, &entry);
        assert_eq!(written, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn write_dirent_pads_to_eight_byte_boundary() {
        let mut out = OutMessage::with_capacity(256);
        let entry = DirectoryEntry {
            inode: 5,
            kind: FileType::Directory,
            name: OsString::from("abc"), // FUSE_DIRENT_SIZE(24) + 3 = 27 -> pads to 32
            offset: 1,
        };

        let written = write_dirent(&mut out, 4096, &entry);
        let expected = (FUSE_DIRENT_SIZE + 3 + 7) & !7;
        assert_eq!(written, expected);
        assert_eq!(out.len(), expected);

        let ino = read_u64(out.bytes(), 0);
        assert_eq!(ino, 5);
    }

    #[test]
    fn write_dirent_exact_fit_boundary() {
        let entry = DirectoryEntry {
            inode: 1,
            kind: FileType::RegularFile,
            name: OsString::from("abc"),
            offset: 0,
        };
        let needed = (FUSE_DIRENT_SIZE + 3 + 7) & !7;

        let mut one_short = OutMessage::with_capacity(64);
        assert_eq!(write_dirent(&mut one_short, needed - 1, &entry), 0);

        let mut exact = OutMessage::with_capacity(64);
        assert_eq!(write_dirent(&mut exact, needed, &entry), needed);
    }
}
