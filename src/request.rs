use crate::abi::fuse_in_header;
use crate::CancelToken;

#[derive(Debug, Clone)]
/// Request data
pub struct Request {
    /// the unique identifier of this request.
    pub unique: u64,
    /// the uid of this request.
    pub uid: u32,
    /// the gid of this request.
    pub gid: u32,
    /// the pid of this request.
    pub pid: u32,
    /// flips to cancelled if the kernel sends a matching `FUSE_INTERRUPT`
    /// before this request's reply goes out.
    pub cancel: CancelToken,
}

impl Request {
    pub(crate) fn new(header: &fuse_in_header, cancel: CancelToken) -> Self {
        Self {
            unique: header.unique,
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
            cancel,
        }
    }
}
