//! push cache invalidations and wakeups to the kernel outside the normal
//! request/reply cycle.
//!
//! Every method here builds one [`OutMessage`] and sends it down the same
//! response channel a `Connection` drains for ordinary replies; from the
//! kernel's point of view a notification is indistinguishable from any
//! other write to `/dev/fuse`; the out header's `unique` field is always 0,
//! which is how it tells the two apart.

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;

use bytes::{Buf, Bytes};
use futures_channel::mpsc::UnboundedSender;
use futures_util::sink::SinkExt;

use crate::abi::{
    fuse_notify_code, fuse_notify_delete_out, fuse_notify_inval_entry_out,
    fuse_notify_inval_inode_out, fuse_notify_poll_wakeup_out, fuse_notify_retrieve_out,
    fuse_notify_store_out, fuse_out_header, FUSE_NOTIFY_DELETE_OUT_SIZE,
    FUSE_NOTIFY_INVAL_ENTRY_OUT_SIZE, FUSE_NOTIFY_INVAL_INODE_OUT_SIZE,
    FUSE_NOTIFY_POLL_WAKEUP_OUT_SIZE, FUSE_NOTIFY_RETRIEVE_OUT_SIZE, FUSE_NOTIFY_STORE_OUT_SIZE,
    FUSE_OUT_HEADER_SIZE,
};
use crate::buffer::OutMessage;
use crate::helper::get_bincode_config;
use crate::Inode;

use bincode::Options;

#[derive(Debug, Clone)]
/// handle a host uses to push change notifications to the kernel.
pub struct Notify {
    sender: UnboundedSender<Box<OutMessage>>,
}

impl Notify {
    pub(crate) fn new(sender: UnboundedSender<Box<OutMessage>>) -> Self {
        Self { sender }
    }

    /// notify kernel there is something to handle. If notify failed, the `kind` is
    /// returned in `Err`.
    async fn notify(&mut self, kind: NotifyKind) -> Result<(), NotifyKind> {
        let mut out = OutMessage::with_capacity(FUSE_OUT_HEADER_SIZE + 64);

        match &kind {
            NotifyKind::Wakeup { kh } => {
                let header = fuse_out_header {
                    len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_POLL_WAKEUP_OUT_SIZE) as u32,
                    error: fuse_notify_code::FUSE_POLL as i32,
                    unique: 0,
                };
                write_notify(&mut out, &header, &fuse_notify_poll_wakeup_out { kh: *kh });
            }

            NotifyKind::InvalidInode { inode, offset, len } => {
                let header = fuse_out_header {
                    len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_INVAL_INODE_OUT_SIZE) as u32,
                    error: fuse_notify_code::FUSE_NOTIFY_INVAL_INODE as i32,
                    unique: 0,
                };
                write_notify(
                    &mut out,
                    &header,
                    &fuse_notify_inval_inode_out {
                        ino: inode.0,
                        off: *offset,
                        len: *len,
                    },
                );
            }

            NotifyKind::InvalidEntry { parent, name } => {
                let header = fuse_out_header {
                    len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_INVAL_ENTRY_OUT_SIZE + name.len() + 1)
                        as u32,
                    error: fuse_notify_code::FUSE_NOTIFY_INVAL_ENTRY as i32,
                    unique: 0,
                };
                write_notify(
                    &mut out,
                    &header,
                    &fuse_notify_inval_entry_out {
                        parent: parent.0,
                        namelen: name.len() as u32,
                        _padding: 0,
                    },
                );
                out.append_string(name.as_bytes());
            }

            NotifyKind::Delete {
                parent,
                child,
                name,
            } => {
                let header = fuse_out_header {
                    len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_DELETE_OUT_SIZE + name.len() + 1)
                        as u32,
                    error: fuse_notify_code::FUSE_NOTIFY_DELETE as i32,
                    unique: 0,
                };
                write_notify(
                    &mut out,
                    &header,
                    &fuse_notify_delete_out {
                        parent: parent.0,
                        child: child.0,
                        namelen: name.len() as u32,
                        _padding: 0,
                    },
                );
                out.append_string(name.as_bytes());
            }

            NotifyKind::Store {
                inode,
                offset,
                data,
            } => {
                let header = fuse_out_header {
                    len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_STORE_OUT_SIZE + data.len()) as u32,
                    error: fuse_notify_code::FUSE_NOTIFY_STORE as i32,
                    unique: 0,
                };
                write_notify(
                    &mut out,
                    &header,
                    &fuse_notify_store_out {
                        nodeid: inode.0,
                        offset: *offset,
                        size: data.len() as u32,
                        _padding: 0,
                    },
                );
                out.append(data);
            }

            NotifyKind::Retrieve {
                notify_unique,
                inode,
                offset,
                size,
            } => {
                let header = fuse_out_header {
                    len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_RETRIEVE_OUT_SIZE) as u32,
                    error: fuse_notify_code::FUSE_NOTIFY_RETRIEVE as i32,
                    unique: 0,
                };
                write_notify(
                    &mut out,
                    &header,
                    &fuse_notify_retrieve_out {
                        notify_unique: *notify_unique,
                        nodeid: inode.0,
                        offset: *offset,
                        size: *size,
                        _padding: 0,
                    },
                );
            }
        }

        self.sender.send(Box::new(out)).await.or(Err(kind))
    }

    /// try to notify kernel the IO is ready, kernel can wakeup the waiting program.
    pub async fn wakeup(mut self, kh: u64) {
        let _ = self.notify(NotifyKind::Wakeup { kh }).await;
    }

    /// try to notify the cache invalidation about an inode.
    pub async fn invalid_inode(mut self, inode: Inode, offset: i64, len: i64) {
        let _ = self
            .notify(NotifyKind::InvalidInode { inode, offset, len })
            .await;
    }

    /// try to notify the invalidation about a directory entry.
    pub async fn invalid_entry(mut self, parent: Inode, name: OsString) {
        let _ = self.notify(NotifyKind::InvalidEntry { parent, name }).await;
    }

    /// try to notify a directory entry has been deleted.
    pub async fn delete(mut self, parent: Inode, child: Inode, name: OsString) {
        let _ = self
            .notify(NotifyKind::Delete {
                parent,
                child,
                name,
            })
            .await;
    }

    /// try to push the data in an inode for updating the kernel cache.
    pub async fn store(mut self, inode: Inode, offset: u64, mut data: impl Buf) {
        let _ = self
            .notify(NotifyKind::Store {
                inode,
                offset,
                data: data.copy_to_bytes(data.remaining()),
            })
            .await;
    }

    /// try to retrieve data in an inode from the kernel cache. The kernel
    /// answers with an `Op::NotifyReply` carrying `notify_unique` back.
    pub async fn retrieve(mut self, notify_unique: u64, inode: Inode, offset: u64, size: u32) {
        let _ = self
            .notify(NotifyKind::Retrieve {
                notify_unique,
                inode,
                offset,
                size,
            })
            .await;
    }
}

fn write_notify<T: serde::Serialize>(out: &mut OutMessage, header: &fuse_out_header, payload: &T) {
    let header_bytes = get_bincode_config()
        .serialize(header)
        .expect("fixed-size header");
    out.append(&header_bytes);

    let payload_bytes = get_bincode_config()
        .serialize(payload)
        .expect("fixed-size payload");
    out.append(&payload_bytes);
}

#[derive(Debug)]
/// the kind of notify.
enum NotifyKind {
    /// notify the IO is ready.
    Wakeup { kh: u64 },

    /// notify the cache invalidation about an inode.
    InvalidInode { inode: Inode, offset: i64, len: i64 },

    /// notify the invalidation about a directory entry.
    InvalidEntry { parent: Inode, name: OsString },

    /// notify a directory entry has been deleted.
    Delete {
        parent: Inode,
        child: Inode,
        name: OsString,
    },

    /// push the data in an inode for updating the kernel cache.
    Store {
        inode: Inode,
        offset: u64,
        data: Bytes,
    },

    /// retrieve data in an inode from the kernel cache.
    Retrieve {
        notify_unique: u64,
        inode: Inode,
        offset: u64,
        size: u32,
    },
}

#[cfg(test)]
mod tests {
    use futures_util::stream::StreamExt;

    use super::*;

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn read_u64(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    #[tokio::test]
    async fn invalid_entry_frames_as_a_zero_unique_notification() {
        let (tx, mut rx) = futures_channel::mpsc::unbounded();
        let notify = Notify::new(tx);

        notify
            .invalid_entry(Inode(1), OsString::from("foo"))
            .await;

        let sent = rx.next().await.expect("notify should have sent a frame");
        let bytes = sent.bytes();

        let unique = read_u64(bytes, 8);
        assert_eq!(unique, 0, "notifications are never tied to a request unique");

        let error = read_u32(bytes, 4) as i32;
        assert_eq!(error, fuse_notify_code::FUSE_NOTIFY_INVAL_ENTRY as i32);

        let payload = &bytes[FUSE_OUT_HEADER_SIZE..];
        let parent = read_u64(payload, 0);
        assert_eq!(parent, 1);
        let namelen = read_u32(payload, 8);
        assert_eq!(namelen, 3);
        let name_bytes = &payload[FUSE_NOTIFY_INVAL_ENTRY_OUT_SIZE..FUSE_NOTIFY_INVAL_ENTRY_OUT_SIZE + 3];
        assert_eq!(name_bytes, b"foo");
    }

    #[tokio::test]
    async fn store_frames_payload_after_the_fixed_header() {
        let (tx, mut rx) = futures_channel::mpsc::unbounded();
        let notify = Notify::new(tx);

        notify.store(Inode(7), 64, Bytes::from_static(b"hello")).await;

        let sent = rx.next().await.expect("notify should have sent a frame");
        let bytes = sent.bytes();
        let payload = &bytes[FUSE_OUT_HEADER_SIZE..];

        let nodeid = read_u64(payload, 0);
        let offset = read_u64(payload, 8);
        let size = read_u32(payload, 16);
        assert_eq!(nodeid, 7);
        assert_eq!(offset, 64);
        assert_eq!(size, 5);

        let data = &payload[FUSE_NOTIFY_STORE_OUT_SIZE..FUSE_NOTIFY_STORE_OUT_SIZE + 5];
        assert_eq!(data, b"hello");
    }
}
