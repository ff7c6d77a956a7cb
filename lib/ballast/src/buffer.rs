use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Grow in page-sized steps, matching the read chunk size.
const BUF_SIZE_INCREMENT: usize = 4096;

/// A growable, contiguous FIFO byte queue. Data is appended at the tail and
/// drained from the head; the backing ring keeps both the data and the free
/// span addressable as single slices.
pub struct Buffer {
    data: ByteDeque,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer { data: ByteDeque::new() }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn data_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Drop `count` bytes from the front of the buffer.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.data.len());
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.data.len() as isize) }
    }

    /// Append raw bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.grow(bytes.len());
        unsafe {
            self.data.tail_head_slice()[..bytes.len()].copy_from_slice(bytes);
            self.data.move_tail(bytes.len() as isize);
        }
    }

    /// Read at most `max` bytes from the supplied reader into the tail.
    /// Returns the number of bytes transferred; 0 means end of stream.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        self.grow(max);
        let read_count = unsafe {
            let free = self.data.tail_head_slice();
            reader.read(&mut free[..max])?
        };
        unsafe { self.data.move_tail(read_count as isize) };
        Ok(read_count)
    }

    /// Write the buffered data to the supplied writer, advancing the head by
    /// the amount accepted. A single write call per invocation; the caller's
    /// readiness loop drives the drain.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.data.is_empty() {
            return Ok(0);
        }

        let write_count = writer.write(self.data.as_slice())?;
        unsafe { self.data.move_head(write_count as isize) };
        Ok(write_count)
    }

    #[inline]
    fn grow(&mut self, required: usize) {
        if self.data.capacity() - self.data.len() < required {
            let increments = (required + BUF_SIZE_INCREMENT - 1) / BUF_SIZE_INCREMENT;
            self.data.reserve(increments * BUF_SIZE_INCREMENT);
        }
    }
}
