//! Growable byte container with sub-buffer attachments.
//!
//! A [`Buffer`] starts with a fixed inline block and moves to a heap
//! allocation once the payload outgrows it. Large binary blobs can be
//! attached as sub-buffers: the parent stream only holds a 4-byte length
//! placeholder at the attachment point, and the blob itself is kept as a
//! separate [`Buffer`] value until the message is flattened for the wire.
//!
//! # Layout
//!
//! ```text
//! parent:  [ bytes .. | len(u32) | bytes .. | len(u32) | bytes .. ]
//!                       ^ offset a            ^ offset b
//! subs:    [(a, Buffer), (b, Buffer)]
//! wire:    [ bytes .. | len | <sub a> | bytes .. | len | <sub b> | bytes .. ]
//! ```
//!
//! Buffers are values with copy-on-write storage: cloning is a reference
//! count increment, and the first mutation of a shared buffer copies it.

use std::fmt;
use std::sync::Arc;

/// Bytes kept inline before switching to a heap allocation.
pub const INLINE_CAPACITY: usize = 512;

/// Extra capacity added on every heap growth.
pub const BLOCK: usize = 4096;

/// Size of the length placeholder written for each sub-buffer.
pub const SUB_BUFFER_PLACEHOLDER: usize = std::mem::size_of::<u32>();

/// Errors reported by [`Buffer`] and [`BufferReader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// No sub-buffer is attached at the requested offset.
    #[error("no sub-buffer at offset {offset}")]
    NoSubBuffer {
        /// Offset that was looked up.
        offset: usize,
    },

    /// Growing the backing storage failed.
    #[error("cannot allocate {requested} bytes")]
    AllocationFailed {
        /// Capacity that was requested.
        requested: usize,
    },

    /// A seek went past the end of the buffer.
    #[error("offset {offset} is outside a buffer of {size} bytes")]
    OutOfRange {
        /// Requested position.
        offset: usize,
        /// Size of the buffer.
        size: usize,
    },
}

#[derive(Clone)]
enum Storage {
    Inline([u8; INLINE_CAPACITY]),
    Heap(Vec<u8>),
}

#[derive(Clone)]
struct BufferData {
    storage: Storage,
    used: usize,
    sub_buffers: Vec<(usize, Buffer)>,
    sub_buffers_total: usize,
}

impl Default for BufferData {
    fn default() -> Self {
        Self {
            storage: Storage::Inline([0; INLINE_CAPACITY]),
            used: 0,
            sub_buffers: Vec::new(),
            sub_buffers_total: 0,
        }
    }
}

impl BufferData {
    fn available(&self) -> usize {
        match &self.storage {
            Storage::Inline(_) => INLINE_CAPACITY,
            Storage::Heap(heap) => heap.len(),
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Inline(inline) => &inline[..self.used],
            Storage::Heap(heap) => &heap[..self.used],
        }
    }

    fn grow(&mut self, needed: usize) -> Result<(), BufferError> {
        let target = needed
            .checked_add(BLOCK)
            .ok_or(BufferError::AllocationFailed { requested: needed })?;
        tracing::trace!("Buffer::grow from {} to {}", self.available(), target);

        let promoted = match &mut self.storage {
            Storage::Inline(inline) => {
                let mut heap = Vec::new();
                heap.try_reserve_exact(target)
                    .map_err(|_| BufferError::AllocationFailed { requested: target })?;
                heap.extend_from_slice(&inline[..self.used]);
                heap.resize(target, 0);
                Some(heap)
            }
            Storage::Heap(heap) => {
                let additional = target.saturating_sub(heap.len());
                heap.try_reserve_exact(additional)
                    .map_err(|_| BufferError::AllocationFailed { requested: target })?;
                heap.resize(target, 0);
                None
            }
        };
        if let Some(heap) = promoted {
            self.storage = Storage::Heap(heap);
        }
        Ok(())
    }

    /// Claims `size` bytes at the write position, growing if needed.
    fn claim(&mut self, size: usize) -> Result<&mut [u8], BufferError> {
        let start = self.used;
        let end = start
            .checked_add(size)
            .ok_or(BufferError::AllocationFailed { requested: size })?;
        if end > self.available() {
            self.grow(end)?;
        }
        self.used = end;
        Ok(match &mut self.storage {
            Storage::Inline(inline) => &mut inline[start..end],
            Storage::Heap(heap) => &mut heap[start..end],
        })
    }
}

/// Growable byte container with copy-on-write storage and sub-buffers.
///
/// The invariant `size() <= capacity` always holds, and sub-buffer offsets
/// are strictly increasing positions in the logical stream.
#[derive(Clone, Default)]
pub struct Buffer {
    data: Arc<BufferData>,
}

impl Buffer {
    /// Create an empty buffer using inline storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes written to this buffer, sub-buffers excluded.
    pub fn size(&self) -> usize {
        self.data.used
    }

    /// True when nothing has been written and nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.data.used == 0 && self.data.sub_buffers.is_empty()
    }

    /// Size of this buffer plus the total size of every attached sub-buffer.
    ///
    /// This is the number of bytes the buffer occupies once flattened.
    pub fn total_size(&self) -> usize {
        self.data.used + self.data.sub_buffers_total
    }

    /// Bytes the current storage can hold before growing.
    pub fn capacity(&self) -> usize {
        self.data.available()
    }

    /// Written bytes of this buffer, sub-buffers excluded.
    pub fn as_slice(&self) -> &[u8] {
        self.data.bytes()
    }

    /// Append `bytes` at the end of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::AllocationFailed`] if the storage cannot grow.
    /// The buffer is left unchanged in that case.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let slot = Arc::make_mut(&mut self.data).claim(bytes.len())?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    /// Claim `size` fresh zeroed bytes at the write position and return them.
    ///
    /// The caller fills the slice in place; the framing layer uses this to
    /// read a network payload straight into the buffer.
    pub fn reserve(&mut self, size: usize) -> Result<&mut [u8], BufferError> {
        let slot = Arc::make_mut(&mut self.data).claim(size)?;
        slot.fill(0);
        Ok(slot)
    }

    /// Attach `buffer` at the current position.
    ///
    /// Writes a `u32` placeholder holding the attached buffer's total size and
    /// returns the offset of that placeholder.
    pub fn add_sub_buffer(&mut self, buffer: Buffer) -> Result<usize, BufferError> {
        let offset = self.data.used;
        let total = buffer.total_size();
        let length = u32::try_from(total)
            .map_err(|_| BufferError::AllocationFailed { requested: total })?;
        self.write(&length.to_le_bytes())?;

        let data = Arc::make_mut(&mut self.data);
        data.sub_buffers.push((offset, buffer));
        data.sub_buffers_total += total;
        Ok(offset)
    }

    /// True when a sub-buffer placeholder sits at `offset`.
    pub fn has_sub_buffer(&self, offset: usize) -> bool {
        self.index_of_sub_buffer(offset).is_some()
    }

    /// Sub-buffer attached at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::NoSubBuffer`] unless a sub-buffer sits exactly at `offset`.
    pub fn sub_buffer(&self, offset: usize) -> Result<&Buffer, BufferError> {
        self.index_of_sub_buffer(offset)
            .map(|index| &self.data.sub_buffers[index].1)
            .ok_or(BufferError::NoSubBuffer { offset })
    }

    /// Every attached sub-buffer with its placeholder offset, in stream order.
    pub fn sub_buffers(&self) -> &[(usize, Buffer)] {
        &self.data.sub_buffers
    }

    fn index_of_sub_buffer(&self, offset: usize) -> Option<usize> {
        self.data
            .sub_buffers
            .binary_search_by_key(&offset, |(at, _)| *at)
            .ok()
    }

    /// Drop the content and the attached sub-buffers.
    pub fn clear(&mut self) {
        let data = Arc::make_mut(&mut self.data);
        data.used = 0;
        data.sub_buffers.clear();
        data.sub_buffers_total = 0;
    }

    /// Copy up to `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// Returns the number of bytes actually copied, which is smaller than
    /// requested when the read crosses the end of the buffer.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> usize {
        let bytes = self.as_slice();
        if offset > bytes.len() {
            tracing::debug!(
                "Buffer::read at {} on a buffer of size {}",
                offset,
                bytes.len()
            );
            return 0;
        }
        let copied = dst.len().min(bytes.len() - offset);
        dst[..copied].copy_from_slice(&bytes[offset..offset + copied]);
        copied
    }

    /// Borrow exactly `len` bytes at `offset`, or `None` if they are not all there.
    pub fn read_slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.as_slice().get(offset..end)
    }

    /// Reader positioned at the start of this buffer.
    pub fn reader(&self) -> BufferReader<'_> {
        BufferReader::new(self)
    }

    /// Byte ranges making up the flattened buffer, in wire order.
    ///
    /// Each sub-buffer is inlined right after its length placeholder, then
    /// the parent continues. Nested sub-buffers are expanded recursively.
    pub fn segments(&self) -> Vec<&[u8]> {
        let mut segments = Vec::with_capacity(1 + 2 * self.data.sub_buffers.len());
        self.collect_segments(&mut segments);
        segments
    }

    fn collect_segments<'a>(&'a self, out: &mut Vec<&'a [u8]>) {
        let bytes = self.as_slice();
        let mut position = 0;
        for (offset, sub) in &self.data.sub_buffers {
            let split = offset + SUB_BUFFER_PLACEHOLDER;
            if split > position {
                out.push(&bytes[position..split]);
            }
            sub.collect_segments(out);
            position = split;
        }
        if position < bytes.len() {
            out.push(&bytes[position..]);
        }
    }

    /// Flatten the buffer into one contiguous vector, in wire order.
    pub fn to_flat_vec(&self) -> Vec<u8> {
        let mut flat = Vec::with_capacity(self.total_size());
        for segment in self.segments() {
            flat.extend_from_slice(segment);
        }
        flat
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        let storage = if bytes.len() <= INLINE_CAPACITY {
            let mut inline = [0; INLINE_CAPACITY];
            inline[..bytes.len()].copy_from_slice(bytes);
            Storage::Inline(inline)
        } else {
            Storage::Heap(bytes.to_vec())
        };
        Self {
            data: Arc::new(BufferData {
                storage,
                used: bytes.len(),
                sub_buffers: Vec::new(),
                sub_buffers_total: 0,
            }),
        }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        if bytes.len() <= INLINE_CAPACITY {
            return Self::from(bytes.as_slice());
        }
        let used = bytes.len();
        Self {
            data: Arc::new(BufferData {
                storage: Storage::Heap(bytes),
                used,
                sub_buffers: Vec::new(),
                sub_buffers_total: 0,
            }),
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
            || (self.as_slice() == other.as_slice()
                && self.data.sub_buffers == other.data.sub_buffers)
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("total_size", &self.total_size())
            .field("sub_buffers", &self.data.sub_buffers.len())
            .finish()
    }
}

/// Sequential reader over a [`Buffer`].
///
/// Tracks a byte cursor and a sub-buffer cursor so that a deserializer can
/// recognize a sub-buffer placeholder at the current position and take the
/// attached buffer without copying it.
#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    buffer: &'a Buffer,
    cursor: usize,
    sub_cursor: usize,
}

impl<'a> BufferReader<'a> {
    /// Create a reader at the start of `buffer`.
    pub fn new(buffer: &'a Buffer) -> Self {
        Self {
            buffer,
            cursor: 0,
            sub_cursor: 0,
        }
    }

    /// Current byte position.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Bytes left before the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.buffer.size().saturating_sub(self.cursor)
    }

    /// Copy up to `dst.len()` bytes and advance past them.
    ///
    /// Returns how many bytes were copied; short reads happen at the end.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let copied = self.buffer.read(self.cursor, dst);
        self.cursor += copied;
        copied
    }

    /// Borrow exactly `len` bytes and advance past them.
    pub fn read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.buffer.read_slice(self.cursor, len)?;
        self.cursor += len;
        Some(slice)
    }

    /// Borrow exactly `len` bytes without moving the cursor.
    pub fn peek(&self, len: usize) -> Option<&'a [u8]> {
        self.buffer.read_slice(self.cursor, len)
    }

    /// Move the cursor to `offset`.
    pub fn seek(&mut self, offset: usize) -> Result<(), BufferError> {
        if offset > self.buffer.size() {
            return Err(BufferError::OutOfRange {
                offset,
                size: self.buffer.size(),
            });
        }
        self.cursor = offset;
        self.sub_cursor = self
            .buffer
            .sub_buffers()
            .partition_point(|(at, _)| *at < offset);
        Ok(())
    }

    /// True when the next sub-buffer placeholder is at the cursor.
    pub fn has_sub_buffer(&self) -> bool {
        self.buffer
            .sub_buffers()
            .get(self.sub_cursor)
            .is_some_and(|(at, _)| *at == self.cursor)
    }

    /// Take the sub-buffer at the cursor and skip its placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::NoSubBuffer`] when [`has_sub_buffer`](Self::has_sub_buffer) is false.
    pub fn sub_buffer(&mut self) -> Result<&'a Buffer, BufferError> {
        if !self.has_sub_buffer() {
            return Err(BufferError::NoSubBuffer {
                offset: self.cursor,
            });
        }
        let buffer: &'a Buffer = self.buffer;
        let (_, sub) = &buffer.sub_buffers()[self.sub_cursor];
        self.sub_cursor += 1;
        self.cursor += SUB_BUFFER_PLACEHOLDER;
        Ok(sub)
    }
}
