//! Read-side scratch buffer for connections.
//!
//! Every connection owns one [`Buffer`]. Readers call [`Buffer::allocate`] to
//! obtain a destination slice for an OS read, then [`Buffer::eat`] to commit
//! the bytes actually read. Parsers inspect the committed window via
//! [`Buffer::as_slice`] and call [`Buffer::drop_front`] with the consumed
//! length once a handshake or frame has been handled.
//!
//! The buffer never shrinks; growth is amortised by at-least-doubling.

/// Contiguous append-only byte region with drop-from-front.
///
/// Three markers describe the region: the start of storage, the write head,
/// and the capacity end. The invariant `start <= head <= capacity` holds at
/// all times; `[start, head)` is the committed window visible to parsers.
#[derive(Debug, Default)]
pub struct Buffer {
    /// Backing storage; `data.len()` is the capacity end.
    data: Vec<u8>,
    /// Committed length (the write head).
    head: usize,
}

impl Buffer {
    /// Creates an empty buffer. No storage is reserved until the first
    /// [`allocate`](Self::allocate).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures at least `size` writable bytes exist past the write head and
    /// returns them as a mutable slice.
    ///
    /// Only the prefix actually filled (and then committed with
    /// [`eat`](Self::eat)) becomes part of the committed window.
    pub fn allocate(&mut self, size: usize) -> &mut [u8] {
        let spare = self.data.len() - self.head;
        if spare < size {
            let grown = usize::max(self.data.len() * 2, self.head + size);
            self.data.resize(grown, 0);
        }
        &mut self.data[self.head..self.head + size]
    }

    /// Advances the write head by `size` bytes, committing them.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the writable space reserved by the last
    /// [`allocate`](Self::allocate).
    pub fn eat(&mut self, size: usize) {
        assert!(
            self.head + size <= self.data.len(),
            "eat past allocated capacity"
        );
        self.head += size;
    }

    /// Removes `size` bytes from the front, shifting the remainder down.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the committed length.
    pub fn drop_front(&mut self, size: usize) {
        if size == 0 {
            return;
        }
        assert!(size <= self.head, "drop past committed window");
        if size == self.head {
            self.head = 0;
        } else {
            self.data.copy_within(size..self.head, 0);
            self.head -= size;
        }
    }

    /// Discards all contents and releases the storage.
    pub fn reset(&mut self) {
        self.data = Vec::new();
        self.head = 0;
    }

    /// The committed window `[start, head)`.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.head]
    }

    /// Committed length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.head
    }

    /// Returns true if no bytes are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    /// Current capacity end, in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}
