//! pooled, fixed-capacity message buffers.
//!
//! Every request read from `/dev/fuse` and every reply written back to it
//! goes through an [`InMessage`] or [`OutMessage`] drawn from a [`Pool`].
//! Recycling these buffers instead of allocating a fresh `Vec<u8>` per
//! operation keeps the per-request cost down to the `memset`/`memcpy` the
//! kernel forces on us anyway.

use std::sync::Mutex;

use crate::abi::{FUSE_MIN_READ_BUFFER_SIZE, FUSE_OUT_HEADER_SIZE};

/// High-water mark for each free-list; buffers returned beyond this count
/// are dropped instead of retained, so a burst of concurrent requests can't
/// pin an unbounded amount of memory after it subsides.
const DEFAULT_POOL_CAP: usize = 64;

/// A buffer read from the kernel: one `fuse_in_header` plus its payload.
#[derive(Debug)]
pub struct InMessage {
    data: Box<[u8]>,
    len: usize,
}

impl InMessage {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Mark the first `len` bytes as holding a freshly-read request. `len`
    /// must not exceed the buffer's capacity.
    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.data.len(), "read past buffer capacity");
        self.len = len;
    }

    /// The bytes filled by the last read.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The full backing storage, for handing to a vectored read.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn reset(&mut self) {
        self.len = 0;
    }
}

/// A buffer being assembled into a reply before it is written to the kernel.
#[derive(Debug)]
pub struct OutMessage {
    data: Vec<u8>,
}

impl OutMessage {
    /// a standalone buffer not drawn from any [`Pool`], for callers (like
    /// [`crate::notify::Notify`]) that build one reply off the hot path and
    /// have no connection-scoped pool handy.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Drop all content but keep the allocation for reuse, leaving a
    /// zeroed [`FUSE_OUT_HEADER_SIZE`]-byte header region in place: callers
    /// build the payload first (its size feeds the header's `len` field),
    /// then patch the header in with [`fill_header`][Self::fill_header].
    pub fn reset(&mut self) {
        self.data.clear();
        self.data.resize(FUSE_OUT_HEADER_SIZE, 0);
    }

    /// overwrite the header region reserved by [`reset`][Self::reset] with
    /// an already-serialized `fuse_out_header`. Also usable on a buffer
    /// that never called `reset` (e.g. a bare [`with_capacity`][Self::with_capacity]
    /// buffer with nothing written yet): the region is grown on demand.
    pub(crate) fn fill_header(&mut self, header_bytes: &[u8]) {
        if self.data.len() < header_bytes.len() {
            self.data.resize(header_bytes.len(), 0);
        }
        self.data[..header_bytes.len()].copy_from_slice(header_bytes);
    }

    /// Grow the buffer by `n` zeroed bytes and return a mutable view of the
    /// newly-added region.
    pub fn grow(&mut self, n: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    /// Like [`grow`][Self::grow], but the new region is left uninitialized
    /// except for whatever was already there; callers must fully overwrite
    /// it before the buffer is sent. Used for the payload half of reads,
    /// where we're about to overwrite every byte anyway.
    pub fn grow_no_zero(&mut self, n: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.reserve(n);
        // SAFETY: capacity was just reserved; the caller contract is that
        // every byte of the returned slice is overwritten before the buffer
        // is read back (e.g. via a subsequent `read` into it).
        unsafe {
            self.data.set_len(start + n);
        }
        &mut self.data[start..]
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn append_string(&mut self, s: impl AsRef<[u8]>) {
        self.append(s.as_ref());
        self.data.push(0);
    }

    pub fn shrink_to(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Source of pooled [`InMessage`]/[`OutMessage`] buffers.
///
/// A host that wants accounting, a NUMA-aware allocator, or a different
/// high-water mark can implement this directly; [`Pool`] is the default.
pub trait MessageProvider: Send + Sync {
    fn acquire_in(&self) -> Box<InMessage>;
    fn release_in(&self, msg: Box<InMessage>);

    fn acquire_out(&self) -> Box<OutMessage>;
    fn release_out(&self, msg: Box<OutMessage>);
}

/// Default [`MessageProvider`]: two capped, mutex-guarded free-lists.
#[derive(Debug)]
pub struct Pool {
    buffer_size: usize,
    cap: usize,
    in_free: Mutex<Vec<Box<InMessage>>>,
    out_free: Mutex<Vec<Box<OutMessage>>>,
}

impl Pool {
    /// `max_write` sizes the read buffer so a full-size `FUSE_WRITE` always
    /// fits in one read, per the kernel's own minimum of
    /// [`FUSE_MIN_READ_BUFFER_SIZE`].
    pub fn new(max_write: u32) -> Self {
        let buffer_size = FUSE_MIN_READ_BUFFER_SIZE.max(max_write as usize + 4096);

        Self {
            buffer_size,
            cap: DEFAULT_POOL_CAP,
            in_free: Mutex::new(Vec::new()),
            out_free: Mutex::new(Vec::new()),
        }
    }

    pub fn with_cap(max_write: u32, cap: usize) -> Self {
        Self {
            cap,
            ..Self::new(max_write)
        }
    }

    /// the capacity every pooled buffer is allocated with.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl MessageProvider for Pool {
    fn acquire_in(&self) -> Box<InMessage> {
        if let Some(mut msg) = self.in_free.lock().unwrap().pop() {
            msg.reset();
            return msg;
        }

        Box::new(InMessage::with_capacity(self.buffer_size))
    }

    fn release_in(&self, msg: Box<InMessage>) {
        let mut free = self.in_free.lock().unwrap();
        if free.len() < self.cap {
            free.push(msg);
        }
    }

    fn acquire_out(&self) -> Box<OutMessage> {
        if let Some(mut msg) = self.out_free.lock().unwrap().pop() {
            msg.reset();
            return msg;
        }

        Box::new(OutMessage::with_capacity(self.buffer_size))
    }

    fn release_out(&self, msg: Box<OutMessage>) {
        let mut free = self.out_free.lock().unwrap();
        if free.len() < self.cap {
            free.push(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_buffers() {
        let pool = Pool::new(128 * 1024);

        let a = pool.acquire_in();
        let a_ptr = a.data.as_ptr();
        pool.release_in(a);

        let b = pool.acquire_in();
        assert_eq!(a_ptr, b.data.as_ptr(), "expected the freed buffer back");
        assert!(b.is_empty());
    }

    #[test]
    fn caps_the_free_list() {
        let pool = Pool::with_cap(4096, 2);

        for _ in 0..5 {
            let msg = pool.acquire_out();
            pool.release_out(msg);
        }

        assert!(pool.out_free.lock().unwrap().len() <= 2);
    }

    #[test]
    fn out_message_grow_and_append_round_trip() {
        let mut msg = OutMessage::with_capacity(64);
        msg.append(b"hello");
        {
            let region = msg.grow(3);
            region.copy_from_slice(b"xyz");
        }
        assert_eq!(msg.bytes(), b"helloxyz");

        msg.shrink_to(5);
        assert_eq!(msg.bytes(), b"hello");
    }

    #[test]
    fn out_message_reset_reserves_zeroed_header() {
        let mut msg = OutMessage::with_capacity(64);
        msg.append(b"stale reply");
        msg.reset();

        assert_eq!(msg.len(), FUSE_OUT_HEADER_SIZE);
        assert!(msg.bytes().iter().all(|&b| b == 0));

        msg.append(b"abc");
        assert_eq!(msg.len(), FUSE_OUT_HEADER_SIZE + 3);
        assert_eq!(&msg.bytes()[FUSE_OUT_HEADER_SIZE..], b"abc");
    }

    #[test]
    fn in_message_consume_bounds() {
        let mut msg = InMessage::with_capacity(16);
        msg.consume(10);
        assert_eq!(msg.len(), 10);
        assert_eq!(msg.bytes().len(), 10);
    }
}
