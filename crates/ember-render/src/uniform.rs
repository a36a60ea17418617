//! Per-frame uniform data pool.
//!
//! [`UniformBufferPool`] hands out fixed-size blocks of persistently
//! mapped, host-coherent memory; a [`UniformBufferAllocation`] bump-carves
//! aligned per-draw ranges out of one block. This is deliberately not a
//! general-purpose allocator: nothing inside a block is reclaimed
//! individually, the whole block goes back to the pool when the owning
//! command buffer's frame is known to be retired.

use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::debug;

use ember_rhi::buffer::{Buffer, BufferUsage};
use ember_rhi::device::Device;
use ember_rhi::{RhiError, RhiResult};

/// Block size the rendering core configures the pool with.
pub const UNIFORM_POOL_BLOCK_SIZE: u64 = 256 * 1024;
/// Sub-allocation alignment the rendering core configures the pool with.
/// The pool raises it to the device's dynamic-offset minimum if needed.
pub const UNIFORM_POOL_ALIGNMENT: u64 = 256;

/// Bump cursor over one fixed-size block.
///
/// Pure offset arithmetic: every returned offset is rounded up to the
/// alignment, and allocation fails once the block is exhausted - there is
/// no growth path.
#[derive(Clone, Copy, Debug)]
pub struct BlockCursor {
    block_size: u64,
    alignment: u64,
    offset: u64,
}

impl BlockCursor {
    /// Creates a cursor over `block_size` bytes with the given alignment.
    pub fn new(block_size: u64, alignment: u64) -> Self {
        debug_assert!(alignment > 0, "alignment must be non-zero");
        Self {
            block_size,
            alignment,
            offset: 0,
        }
    }

    /// Reserves `size` bytes; returns the aligned offset, or `None` once
    /// the block cannot hold the request.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let aligned = self.offset.div_ceil(self.alignment) * self.alignment;
        if aligned + size > self.block_size {
            return None;
        }
        self.offset = aligned + size;
        Some(aligned)
    }

    /// Rewinds the cursor; previously returned ranges become invalid.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// The block size this cursor covers.
    #[inline]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The configured alignment.
    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }
}

/// One pool block owned by a command buffer for the duration of a frame.
pub struct UniformBufferAllocation {
    buffer: Arc<Buffer>,
    cursor: BlockCursor,
}

impl UniformBufferAllocation {
    /// Carves an aligned `size`-byte range out of the block.
    ///
    /// Returns the byte offset of the range. Exhausting the block is a
    /// hard failure; callers must not request more per frame than one
    /// block holds.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        self.cursor.allocate(size)
    }

    /// Copies `data` into the mapped block at `offset`.
    ///
    /// The memory is host-coherent, so no flush is required.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.buffer.write_data(offset, data)
    }

    /// The Vulkan buffer handle backing the block.
    #[inline]
    pub fn buffer_handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// The block size.
    #[inline]
    pub fn block_size(&self) -> u64 {
        self.cursor.block_size()
    }
}

/// Frame-scoped pool of uniform blocks.
///
/// Blocks released by retired command buffers are recycled instead of
/// freed; the pool only ever grows to the peak number of simultaneously
/// recording command buffers.
pub struct UniformBufferPool {
    device: Arc<Device>,
    block_size: u64,
    alignment: u64,
    free_blocks: Mutex<Vec<Arc<Buffer>>>,
}

impl UniformBufferPool {
    /// Creates a pool of `block_size`-byte blocks.
    ///
    /// The effective alignment is the larger of `alignment` and the
    /// device's minimum dynamic uniform-buffer offset alignment, so every
    /// carved offset is valid as a dynamic offset.
    pub fn new(device: Arc<Device>, block_size: u64, alignment: u64) -> Self {
        let effective = alignment.max(device.min_uniform_offset_alignment());
        debug!(
            "Uniform pool: {} byte blocks, {} byte alignment",
            block_size, effective
        );
        Self {
            device,
            block_size,
            alignment: effective,
            free_blocks: Mutex::new(Vec::new()),
        }
    }

    /// Hands out one block as a fresh allocation.
    ///
    /// `min_size` must not exceed the block size; a request the pool can
    /// never satisfy is a contract violation.
    pub fn allocate(&self, min_size: u64) -> RhiResult<UniformBufferAllocation> {
        debug_assert!(
            min_size <= self.block_size,
            "uniform request of {} bytes exceeds the {} byte pool block",
            min_size,
            self.block_size
        );
        if min_size > self.block_size {
            return Err(RhiError::InvalidUsage(format!(
                "uniform request of {} bytes exceeds the {} byte pool block",
                min_size, self.block_size
            )));
        }

        let recycled = self
            .free_blocks
            .lock()
            .map_err(|_| RhiError::InvalidUsage("uniform pool mutex poisoned".to_string()))?
            .pop();

        let buffer = match recycled {
            Some(buffer) => buffer,
            None => {
                debug!("Uniform pool growing by one {} byte block", self.block_size);
                Arc::new(Buffer::new(
                    self.device.clone(),
                    BufferUsage::Uniform,
                    self.block_size,
                )?)
            }
        };

        Ok(UniformBufferAllocation {
            buffer,
            cursor: BlockCursor::new(self.block_size, self.alignment),
        })
    }

    /// Returns a block to the pool once its frame is known retired.
    pub fn release(&self, allocation: UniformBufferAllocation) {
        if let Ok(mut free_blocks) = self.free_blocks.lock() {
            free_blocks.push(allocation.buffer);
        }
    }

    /// The configured block size.
    #[inline]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The effective sub-allocation alignment.
    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_aligned_and_disjoint() {
        // blockSize = 1024, alignment = 256: [100, 100, 100] lands at
        // [0, 256, 512]; a fourth allocation of 300 no longer fits
        // (768 + 300 > 1024).
        let mut cursor = BlockCursor::new(1024, 256);
        assert_eq!(cursor.allocate(100), Some(0));
        assert_eq!(cursor.allocate(100), Some(256));
        assert_eq!(cursor.allocate(100), Some(512));
        assert_eq!(cursor.allocate(300), None);
    }

    #[test]
    fn full_block_allocation_succeeds_once() {
        let mut cursor = BlockCursor::new(1024, 256);
        assert_eq!(cursor.allocate(1024), Some(0));
        assert_eq!(cursor.allocate(1), None);
    }

    #[test]
    fn reset_reopens_the_block() {
        let mut cursor = BlockCursor::new(512, 64);
        assert_eq!(cursor.allocate(512), Some(0));
        assert_eq!(cursor.allocate(64), None);
        cursor.reset();
        assert_eq!(cursor.allocate(64), Some(0));
    }

    #[test]
    fn every_offset_is_a_multiple_of_the_alignment() {
        let mut cursor = BlockCursor::new(4096, 256);
        let sizes = [1u64, 100, 255, 256, 257, 13];
        let mut previous_end = 0u64;
        for size in sizes {
            let offset = cursor.allocate(size).unwrap();
            assert_eq!(offset % 256, 0);
            assert!(offset >= previous_end, "ranges must not overlap");
            previous_end = offset + size;
        }
    }

    #[test]
    fn unaligned_pool_alignment_still_rounds_up() {
        // Alignments that are not powers of two still produce multiples.
        let mut cursor = BlockCursor::new(1000, 48);
        assert_eq!(cursor.allocate(10), Some(0));
        assert_eq!(cursor.allocate(10), Some(48));
        assert_eq!(cursor.allocate(10), Some(96));
    }
}
