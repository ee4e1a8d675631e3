// src/core/buffer/rain.rs

//! One stripe unit of an erasure-coded file, backed by a pooled buffer.

use super::{Buffer, BufferManager};
use std::sync::Arc;
use tracing::error;

/// A fixed-capacity block holding the data of one stripe unit.
///
/// Writes are bounds-checked against the capacity. A write that leaves a gap
/// behind the previous end of data marks the block as holed; a holed block
/// refuses [`RainBlock::fill_with_zeros`] unless forced.
#[derive(Debug)]
pub struct RainBlock {
    capacity: u64,
    last_offset: u64,
    has_holes: bool,
    buffer: Option<Buffer>,
    pool: Arc<BufferManager>,
}

impl RainBlock {
    /// Builds a block of the given capacity backed by the given pool.
    /// Returns `None` when the pool refuses the allocation.
    pub fn new(capacity: u64, pool: Arc<BufferManager>) -> Option<Self> {
        let buffer = pool.get_buffer(capacity)?;

        Some(Self {
            capacity,
            last_offset: 0,
            has_holes: false,
            buffer: Some(buffer),
            pool,
        })
    }

    /// Max size of the current block.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Last written offset.
    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    /// Whether any write left a gap in the block.
    pub fn has_holes(&self) -> bool {
        self.has_holes
    }

    /// Save data in the current block at the given offset.
    pub fn write(&mut self, data: &[u8], offset: u64) -> bool {
        let length = data.len() as u64;

        if offset >= self.capacity || offset + length > self.capacity {
            error!(
                "msg=\"block can not hold so much data\" capacity={} data_off={} data_len={}",
                self.capacity, offset, length
            );
            return false;
        }

        if offset > self.last_offset {
            self.has_holes = true;
        }

        if offset + length > self.last_offset {
            self.last_offset = offset + length;
        }

        let buffer = self.buffer.as_mut().expect("block buffer present");
        buffer.as_mut_slice()[offset as usize..(offset + length) as usize].copy_from_slice(data);
        true
    }

    /// Fill the remaining part of the buffer with zeros and mark it as complete.
    ///
    /// A holed block refuses unless `force` is set, in which case the whole
    /// block is zeroed and the holes are forgotten.
    pub fn fill_with_zeros(&mut self, force: bool) -> bool {
        if self.has_holes && !force {
            return false;
        }

        let capacity = self.capacity;
        let last_offset = self.last_offset;
        let buffer = self.buffer.as_mut().expect("block buffer present");

        if force {
            buffer.as_mut_slice().fill(0);
            self.has_holes = false;
        } else if last_offset < capacity {
            buffer.as_mut_slice()[last_offset as usize..].fill(0);
        }

        self.last_offset = capacity;
        true
    }

    /// The block contents up to the capacity.
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref().expect("block buffer present").as_slice()
    }

    /// Transfers ownership of the backing buffer out of the block.
    /// The caller becomes responsible for recycling it.
    pub fn take_buffer(&mut self) -> Option<Buffer> {
        self.buffer.take()
    }
}

impl Drop for RainBlock {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.recycle(buffer);
        }
    }
}
