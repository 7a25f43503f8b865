use std::io::{self, Read};

/// A circular byte buffer of fixed capacity.
///
/// One byte of capacity is always kept free so that a full buffer can be told
/// apart from an empty one, i.e. at most `capacity - 1` bytes are resident.
///
/// A zero capacity buffer is legal and never holds anything.
#[derive(Debug, Clone, Default)]
pub struct RingBuffer {
    buf: Box<[u8]>,

    // Read cursor
    head: usize,

    // Write cursor
    tail: usize,
}

impl RingBuffer {
    /// A new empty buffer with the given total capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Total capacity, including the reserved byte.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes resident.
    pub fn used(&self) -> usize {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }

        (self.tail + capacity - self.head) % capacity
    }

    /// Bytes which may still be put.
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(1) - self.used()
    }

    /// True if nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn advance(&self, cursor: usize, by: usize) -> usize {
        match self.capacity() {
            0 => 0,
            capacity => (cursor + by) % capacity,
        }
    }

    /// Copy as much of `data` as fits.
    /// Returns how many bytes were taken, which is short if the buffer filled up.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available());
        let first = n.min(self.capacity() - self.tail);

        self.buf[self.tail..self.tail + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.tail = self.advance(self.tail, n);

        n
    }

    /// Copy resident bytes into `out` without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let (front, back) = self.as_slices();
        let n = out.len().min(front.len() + back.len());
        let first = n.min(front.len());

        out[..first].copy_from_slice(&front[..first]);
        out[first..n].copy_from_slice(&back[..n - first]);

        n
    }

    /// Move resident bytes into `out`.
    pub fn get(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.skip(n)
    }

    /// Drop up to `n` resident bytes without copying them anywhere.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.used());
        self.head = self.advance(self.head, n);

        n
    }

    /// Drop everything.
    pub fn flush(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Rewrite storage so the resident bytes start at offset zero.
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }

        let used = self.used();
        self.buf.rotate_left(self.head);
        self.head = 0;
        self.tail = used;
    }

    /// The resident bytes as a single slice, compacting first if needed.
    pub fn contiguous(&mut self) -> &[u8] {
        if self.head > self.tail {
            self.compact();
        }

        &self.buf[self.head..self.tail]
    }

    /// The resident bytes in order, as the part before the wrap and the part after it.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.head <= self.tail {
            (&self.buf[self.head..self.tail], &[])
        } else {
            (&self.buf[self.head..], &self.buf[..self.tail])
        }
    }

    /// Copy up to `n` resident bytes into `dst` without consuming them here.
    /// Returns how many bytes `dst` took.
    pub fn copy_to(&self, dst: &mut RingBuffer, n: usize) -> usize {
        let (front, back) = self.as_slices();
        let n = n.min(front.len() + back.len());
        let first = n.min(front.len());

        let mut copied = dst.put(&front[..first]);
        if copied == first {
            copied += dst.put(&back[..n - first]);
        }

        copied
    }

    /// Move up to `n` resident bytes into `dst`.
    /// Bytes `dst` had no room for stay here.
    pub fn move_to(&mut self, dst: &mut RingBuffer, n: usize) -> usize {
        let moved = self.copy_to(dst, n);
        self.skip(moved)
    }

    /// Perform a single read from `reader` into free space.
    ///
    /// At most one contiguous region is offered to the reader,
    /// so a wrapped buffer may need two calls to fill up.
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let available = self.available();
        if available == 0 {
            return Ok(0);
        }

        let end = (self.tail + available).min(self.capacity());
        let n = reader.read(&mut self.buf[self.tail..end])?;
        self.tail = self.advance(self.tail, n);

        Ok(n)
    }
}
