//! Per-frame staging memory.
//!
//! Each frame slot owns one host-visible buffer that is filled linearly while
//! the slot records and rewound when the slot's fence has signaled.

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer};
use ash::vk;
use gpu_allocator::MemoryLocation;
use kestrel_core::MemoryTag;

/// Linear bump cursor over a fixed-capacity region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingCursor {
    capacity: u64,
    cursor: u64,
}

impl StagingCursor {
    pub const fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes handed out since the last reset.
    pub fn used(&self) -> u64 {
        self.cursor
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.cursor
    }

    /// Reserve `size` bytes aligned to `align` and return their offset.
    ///
    /// On overflow nothing is reserved.
    pub fn reserve(&mut self, size: u64, align: u64) -> Result<u64> {
        if align == 0 || !align.is_power_of_two() {
            return Err(GpuError::InvalidUsage(format!(
                "staging alignment {align} is not a power of two"
            )));
        }

        let offset = (self.cursor + align - 1) & !(align - 1);
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= self.capacity)
            .ok_or_else(|| {
                GpuError::InvalidUsage(format!(
                    "staging overflow: {size} bytes at {offset}, capacity {}",
                    self.capacity
                ))
            })?;

        self.cursor = end;
        Ok(offset)
    }

    /// Rewind to the start.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Host-visible upload buffer with a bump cursor.
pub struct StagingRing {
    buffer: GpuBuffer,
    cursor: StagingCursor,
}

impl StagingRing {
    /// Allocate a staging buffer of `capacity` bytes.
    pub fn new(allocator: &mut GpuAllocator, capacity: u64, name: &str) -> Result<Self> {
        let buffer = allocator.create_tagged_buffer(
            capacity,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            MemoryTag::Staging,
            name,
        )?;

        Ok(Self {
            buffer,
            cursor: StagingCursor::new(capacity),
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    pub fn cursor(&self) -> &StagingCursor {
        &self.cursor
    }

    /// Copy `data` into the ring and return its byte offset.
    pub fn push<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<u64> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let align = std::mem::align_of::<T>().max(4) as u64;
        let offset = self.cursor.reserve(bytes.len() as u64, align)?;
        self.buffer.write_bytes(offset, bytes)?;
        Ok(offset)
    }

    /// Rewind; only valid once the owning slot's fence has signaled.
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    pub fn destroy(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        allocator.free_buffer(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_aligned_offsets() {
        let mut cursor = StagingCursor::new(256);
        assert_eq!(cursor.reserve(10, 4).unwrap(), 0);
        assert_eq!(cursor.reserve(16, 16).unwrap(), 16);
        assert_eq!(cursor.used(), 32);
        assert_eq!(cursor.remaining(), 224);
    }

    #[test]
    fn overflow_leaves_cursor_untouched() {
        let mut cursor = StagingCursor::new(64);
        cursor.reserve(60, 4).unwrap();
        let err = cursor.reserve(8, 4).unwrap_err();
        assert!(matches!(err, GpuError::InvalidUsage(_)));
        assert_eq!(cursor.used(), 60);
    }

    #[test]
    fn rejects_bad_alignment() {
        let mut cursor = StagingCursor::new(64);
        assert!(cursor.reserve(4, 3).is_err());
        assert!(cursor.reserve(4, 0).is_err());
    }

    #[test]
    fn reset_rewinds() {
        let mut cursor = StagingCursor::new(64);
        cursor.reserve(64, 1).unwrap();
        cursor.reset();
        assert_eq!(cursor.reserve(64, 1).unwrap(), 0);
    }
}
