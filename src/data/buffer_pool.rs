//! Fixed-depth pool of aligned image buffers.
//!
//! The camera writes frames into buffers the host queued beforehand. The pool owns
//! `depth` such buffers, all the same size and 16-byte aligned, and hands out slot
//! indices in circular order. The logical frame index grows without bound while the
//! slot index wraps: frame `i` always lands in slot `i % depth`.
#![allow(unsafe_code)] // Aligned allocation needs the raw allocator API.

use crate::error::{AppResult, DaqError};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Alignment the camera library requires for queued buffers.
pub const BUFFER_ALIGN: usize = 16;

/// One heap region with a fixed alignment.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedBuffer uniquely owns its allocation, like a Box<[u8]>.
unsafe impl Send for AlignedBuffer {}
// SAFETY: Shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `len` bytes.
    ///
    /// # Errors
    /// Returns [`DaqError::Allocation`] for a zero length, an impossible layout, or
    /// when the allocator returns null.
    pub fn zeroed(len: usize) -> AppResult<Self> {
        if len == 0 {
            return Err(DaqError::Allocation("zero-sized image buffer".into()));
        }
        let layout = Layout::from_size_align(len, BUFFER_ALIGN)
            .map_err(|e| DaqError::Allocation(format!("{len} bytes: {e}")))?;
        // SAFETY: layout has a non-zero size (checked above).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| DaqError::Allocation(format!("allocator refused {len} bytes")))?;
        Ok(Self { ptr, layout })
    }

    /// Buffer size in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; zero-sized buffers are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Read-only view of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised (zeroed) bytes for the
        // lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Writable view of the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated by alloc_zeroed with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len())
            .field("ptr", &format!("{:p}", self.ptr))
            .finish()
    }
}

/// Circular pool of equally sized image buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<AlignedBuffer>,
    buffer_len: usize,
}

impl BufferPool {
    /// Allocate `depth` buffers of `buffer_len` bytes each.
    ///
    /// # Errors
    /// Fails with [`DaqError::Allocation`] if `depth` is zero or any buffer cannot be
    /// allocated. Buffers allocated before the failure are released.
    pub fn allocate(depth: usize, buffer_len: usize) -> AppResult<Self> {
        if depth == 0 {
            return Err(DaqError::Allocation("pool depth must be at least 1".into()));
        }
        let buffers = (0..depth)
            .map(|_| AlignedBuffer::zeroed(buffer_len))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            buffers,
            buffer_len,
        })
    }

    /// Number of buffers.
    pub fn depth(&self) -> usize {
        self.buffers.len()
    }

    /// Size of every buffer in bytes.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Slot that logical frame `index` uses.
    pub fn slot_for(&self, index: usize) -> usize {
        index % self.buffers.len()
    }

    /// Slot sequence for `total` frames: `0, 1, .., depth-1, 0, 1, ..`.
    pub fn slot_sequence(&self, total: usize) -> impl Iterator<Item = usize> + '_ {
        (0..total).map(move |i| self.slot_for(i))
    }

    /// Read-only view of one slot.
    pub fn slot(&self, slot: usize) -> Option<&[u8]> {
        self.buffers.get(slot).map(AlignedBuffer::as_slice)
    }

    /// Writable view of one slot.
    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut [u8]> {
        self.buffers.get_mut(slot).map(AlignedBuffer::as_mut_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_aligned_and_zeroed() {
        let pool = BufferPool::allocate(4, 1000).unwrap();
        assert_eq!(pool.depth(), 4);
        for slot in 0..4 {
            let buf = pool.slot(slot).unwrap();
            assert_eq!(buf.len(), 1000);
            assert_eq!(buf.as_ptr() as usize % BUFFER_ALIGN, 0);
            assert!(buf.iter().all(|&b| b == 0));
        }
        assert!(pool.slot(4).is_none());
    }

    #[test]
    fn slots_wrap_independently_of_frame_index() {
        let pool = BufferPool::allocate(2, 64).unwrap();
        let slots: Vec<_> = pool.slot_sequence(5).collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn zero_depth_and_zero_size_are_allocation_errors() {
        assert!(matches!(
            BufferPool::allocate(0, 64),
            Err(DaqError::Allocation(_))
        ));
        assert!(matches!(
            BufferPool::allocate(2, 0),
            Err(DaqError::Allocation(_))
        ));
    }

    #[test]
    fn writes_are_visible_through_the_slot() {
        let mut pool = BufferPool::allocate(2, 8).unwrap();
        pool.slot_mut(1).unwrap()[3] = 0xAB;
        assert_eq!(pool.slot(1).unwrap()[3], 0xAB);
        assert_eq!(pool.slot(0).unwrap()[3], 0);
    }
}
