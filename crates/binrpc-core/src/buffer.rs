//! Growable byte buffer with separate read/write cursors
//!
//! Connections read straight from the socket into the buffer's write
//! slot and the codec consumes frames from the read side. The buffer is
//! single-threaded; each connection owns two of them.

/// Growth factor applied to the required size when the buffer expands.
const GROWTH_NUM: usize = 3;
const GROWTH_DEN: usize = 2;

/// Byte buffer with a read cursor and a write cursor.
///
/// Invariant: `0 <= read_index <= write_index <= data.len()`.
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Buffer {
            data: vec![0u8; capacity.max(1)],
            read_index: 0,
            write_index: 0,
        }
    }

    /// Number of unread bytes.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Number of bytes that can be written without growing.
    #[inline]
    pub fn writable(&self) -> usize {
        self.data.len() - self.write_index
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The unread bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Append bytes, growing if needed.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.ensure_writable(bytes.len());
        self.data[self.write_index..self.write_index + bytes.len()].copy_from_slice(bytes);
        self.write_index += bytes.len();
    }

    /// Make sure at least `min` bytes can be written, growing to about
    /// 1.5x the required total when they can't.
    pub fn ensure_writable(&mut self, min: usize) {
        if self.writable() >= min {
            return;
        }
        let required = self.write_index + min;
        let new_cap = required * GROWTH_NUM / GROWTH_DEN;
        self.grow(new_cap.max(required));
    }

    /// Writable region starting at the write cursor. Pair with
    /// [`advance_write`](Self::advance_write) after a direct `read(2)`.
    #[inline]
    pub fn write_slot(&mut self) -> &mut [u8] {
        &mut self.data[self.write_index..]
    }

    /// Record `n` bytes written into the write slot.
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(n <= self.writable());
        self.write_index += n;
    }

    /// Consume `n` unread bytes.
    pub fn retrieve(&mut self, n: usize) {
        debug_assert!(n <= self.readable());
        self.read_index += n.min(self.readable());
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        } else {
            self.maybe_compact();
        }
    }

    /// Consume everything unread.
    pub fn retrieve_all(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    /// Big-endian i32 at the read cursor, non-consuming.
    pub fn peek_i32(&self) -> Option<i32> {
        self.peek_i32_at(0)
    }

    /// Big-endian u32 at the read cursor, non-consuming.
    pub fn peek_u32(&self) -> Option<u32> {
        self.peek_i32_at(0).map(|v| v as u32)
    }

    /// Big-endian i32 at `offset` bytes past the read cursor.
    pub fn peek_i32_at(&self, offset: usize) -> Option<i32> {
        let unread = self.as_slice();
        let bytes = unread.get(offset..offset + 4)?;
        Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Offset of the first `\r\n` within the first `maxlen` unread
    /// bytes, relative to the read cursor.
    pub fn find_crlf(&self, maxlen: usize) -> Option<usize> {
        let unread = self.as_slice();
        let window = &unread[..maxlen.min(unread.len())];
        window.windows(2).position(|w| w == b"\r\n")
    }

    /// Shift unread bytes to the front once the dead prefix exceeds a
    /// third of capacity.
    fn maybe_compact(&mut self) {
        if self.read_index > self.data.len() / 3 {
            self.data.copy_within(self.read_index..self.write_index, 0);
            self.write_index -= self.read_index;
            self.read_index = 0;
        }
    }

    fn grow(&mut self, new_cap: usize) {
        let mut next = vec![0u8; new_cap];
        let unread = self.readable();
        next[..unread].copy_from_slice(&self.data[self.read_index..self.write_index]);
        self.data = next;
        self.read_index = 0;
        self.write_index = unread;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("read_index", &self.read_index)
            .field("write_index", &self.write_index)
            .finish()
    }
}
