//! Resizable byte buffer with prepend headroom and scatter reads.
//!
//! The backing storage is split into three zones by two cursors:
//! `[0, r)` reclaimed prepend space, `[r, w)` readable payload,
//! `[w, capacity)` writable space. Invariant:
//! `0 <= CHEAP_PREPEND <= r <= w <= capacity` (except while the read cursor
//! is rewound by `prepend`).

use std::io;
use std::os::unix::io::RawFd;

/// Headroom reserved in front of the payload so a short framing prefix can
/// be prepended without moving payload bytes.
pub const CHEAP_PREPEND: usize = 8;

/// Initial payload capacity.
pub const INITIAL_SIZE: usize = 1024;

const CRLF: &[u8] = b"\r\n";

pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + capacity],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reader == self.writer
    }

    /// View of the readable payload.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Offset of the first CRLF in the readable region, or `None`.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Offset of the first CRLF at or after `start`, relative to the read
    /// cursor.
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(CRLF.len())
            .position(|window| window == CRLF)
            .map(|pos| start + pos)
    }

    /// Offset of the first newline in the readable region, or `None`.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Advance the read cursor by `min(len, readable)`. Consuming everything
    /// resets both cursors to the prepend floor.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Retrieve readable bytes up to the offset `end` (relative to the read
    /// cursor).
    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end <= self.readable_bytes());
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Consume up to `len` readable bytes into a string (lossy for non-UTF8
    /// payloads).
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Append bytes, growing or compacting the backing storage as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Write immediately before the read cursor and rewind it.
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds the prependable headroom.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend({}) exceeds headroom ({})",
            data.len(),
            self.prependable_bytes()
        );
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Grow the backing storage, or reclaim retrieved space by sliding the
    /// readable bytes down to the prepend floor when that suffices.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = CHEAP_PREPEND + readable;
            debug_assert_eq!(readable, self.readable_bytes());
        }
    }

    /// Scatter-read from `fd` into the writable window plus a 64 KiB stack
    /// scratch region, so a single syscall can pull in far more than the
    /// current writable window without growing capacity up front. Bytes that
    /// landed in the scratch region are appended afterwards.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer) } as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }
}
