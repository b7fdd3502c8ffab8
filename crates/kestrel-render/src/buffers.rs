//! Device buffers shared by every frame in flight.
//!
//! Each [`BufferRole`] maps to one device-local buffer. Buffers only grow;
//! a replaced buffer may still be read by frames in flight, so it is handed
//! back to the caller for deferred deletion instead of being freed here.

use crate::recorder::{BucketSet, BufferRole};
use crate::resources::ResourceAllocator;
use ash::vk;
use kestrel_gpu::{GpuBuffer, Result};
use std::collections::HashMap;

/// Smallest buffer ever created for a role.
pub const MIN_BUFFER_SIZE: u64 = 256;

/// Usage flags a role's buffer is created with.
pub fn usage_for(role: BufferRole) -> vk::BufferUsageFlags {
    let base = vk::BufferUsageFlags::TRANSFER_DST;
    match role {
        BufferRole::Vertices => {
            base | vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER
        }
        BufferRole::Indices => base | vk::BufferUsageFlags::INDEX_BUFFER,
        BufferRole::DrawCommands(_) | BufferRole::DrawCounts(_) => {
            base | vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER
        }
        BufferRole::Objects
        | BufferRole::Geometries
        | BufferRole::BindPose
        | BufferRole::Influences
        | BufferRole::Joints => base | vk::BufferUsageFlags::STORAGE_BUFFER,
    }
}

/// Size a buffer grows to when `required` bytes no longer fit in `current`.
pub fn grown_size(current: u64, required: u64) -> u64 {
    required.max(current.saturating_mul(2)).max(MIN_BUFFER_SIZE)
}

pub(crate) fn debug_name(role: BufferRole) -> &'static str {
    match role {
        BufferRole::Objects => "objects",
        BufferRole::Geometries => "geometries",
        BufferRole::Vertices => "vertices",
        BufferRole::Indices => "indices",
        BufferRole::BindPose => "bind_pose",
        BufferRole::Influences => "influences",
        BufferRole::Joints => "joints",
        BufferRole::DrawCommands(BucketSet::Main) => "main_draw_commands",
        BufferRole::DrawCommands(BucketSet::Shadow) => "shadow_draw_commands",
        BufferRole::DrawCounts(BucketSet::Main) => "main_draw_counts",
        BufferRole::DrawCounts(BucketSet::Shadow) => "shadow_draw_counts",
    }
}

/// Every role's buffer.
pub struct SharedBuffers<B> {
    buffers: HashMap<BufferRole, B>,
}

impl<B> Default for SharedBuffers<B> {
    fn default() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }
}

impl<B> SharedBuffers<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `role`'s buffer hold at least `size` bytes.
    ///
    /// Returns the buffer it replaced, which the caller must keep alive until
    /// the frames that may still read it have retired.
    pub fn ensure<A>(&mut self, allocator: &mut A, role: BufferRole, size: u64) -> Result<Option<B>>
    where
        A: ResourceAllocator<Buffer = B>,
    {
        let current = self.buffers.get(&role).map_or(0, A::buffer_size);
        if current >= size.max(1) {
            return Ok(None);
        }

        let new_size = grown_size(current, size);
        let buffer = allocator.allocate_buffer(role, new_size)?;
        tracing::debug!(?role, old = current, new = new_size, "grew shared buffer");
        Ok(self.buffers.insert(role, buffer))
    }

    pub fn get(&self, role: BufferRole) -> Option<&B> {
        self.buffers.get(&role)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Free every buffer. Nothing in flight may use them.
    pub fn destroy<A>(&mut self, allocator: &mut A) -> Result<()>
    where
        A: ResourceAllocator<Buffer = B>,
    {
        for (_, buffer) in self.buffers.drain() {
            allocator.release_buffer(buffer)?;
        }
        Ok(())
    }
}

impl SharedBuffers<GpuBuffer> {
    /// Vulkan handle of `role`'s buffer, null before the first `ensure`.
    pub fn handle(&self, role: BufferRole) -> vk::Buffer {
        self.buffers
            .get(&role)
            .map_or(vk::Buffer::null(), |b| b.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_doubles_with_a_floor() {
        assert_eq!(grown_size(0, 4), MIN_BUFFER_SIZE);
        assert_eq!(grown_size(256, 300), 512);
        assert_eq!(grown_size(512, 5000), 5000);
    }

    #[test]
    fn draw_buffers_are_indirect_sources() {
        let usage = usage_for(BufferRole::DrawCounts(BucketSet::Shadow));
        assert!(usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER));
        assert!(usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(usage_for(BufferRole::Vertices).contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(!usage_for(BufferRole::Indices).contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }
}
