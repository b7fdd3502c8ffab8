//! Pipeline barrier descriptions.
//!
//! Barriers are built as plain values first and recorded in batches with
//! `vkCmdPipelineBarrier2`, so the dependency each pass relies on can be
//! inspected and tested without a device.

use ash::vk;

/// Memory dependency on a byte range of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl BufferBarrier {
    /// Barrier over `[offset, offset + size)` with no stages set yet.
    pub fn new(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self {
            buffer,
            offset,
            size,
            src_stage: vk::PipelineStageFlags2::NONE,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::NONE,
            dst_access: vk::AccessFlags2::NONE,
        }
    }

    /// Barrier over the whole buffer.
    pub fn whole(buffer: vk::Buffer) -> Self {
        Self::new(buffer, 0, vk::WHOLE_SIZE)
    }

    /// Set the producing stage and access.
    pub fn from(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.src_stage = stage;
        self.src_access = access;
        self
    }

    /// Set the consuming stage and access.
    pub fn to(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.dst_stage = stage;
        self.dst_access = access;
        self
    }

    /// Compute-shader writes consumed as indirect draw arguments.
    pub fn compute_to_indirect(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self::new(buffer, offset, size)
            .from(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            )
            .to(
                vk::PipelineStageFlags2::DRAW_INDIRECT,
                vk::AccessFlags2::INDIRECT_COMMAND_READ,
            )
    }

    /// Compute-shader writes consumed by vertex fetch and vertex shaders.
    pub fn compute_to_vertex(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self::new(buffer, offset, size)
            .from(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            )
            .to(
                vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT
                    | vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ | vk::AccessFlags2::SHADER_STORAGE_READ,
            )
    }

    /// Transfer writes (copies, fills) consumed by compute shaders.
    pub fn transfer_to_compute(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self::new(buffer, offset, size)
            .from(
                vk::PipelineStageFlags2::ALL_TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            )
            .to(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            )
    }

    /// Transfer writes consumed by any shader stage reading storage data.
    pub fn transfer_to_shader_read(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self::new(buffer, offset, size)
            .from(
                vk::PipelineStageFlags2::ALL_TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            )
            .to(
                vk::PipelineStageFlags2::COMPUTE_SHADER
                    | vk::PipelineStageFlags2::VERTEX_SHADER
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_READ,
            )
    }

    /// Transfer writes consumed as vertex attributes or indices.
    pub fn transfer_to_vertex_input(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self::new(buffer, offset, size)
            .from(
                vk::PipelineStageFlags2::ALL_TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            )
            .to(
                vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT
                    | vk::PipelineStageFlags2::INDEX_INPUT
                    | vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags2::INDEX_READ
                    | vk::AccessFlags2::SHADER_STORAGE_READ,
            )
    }

    /// Reads by earlier work must finish before a compute shader overwrites the range.
    /// Write-after-read needs only the execution dependency.
    pub fn reads_to_compute(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self::new(buffer, offset, size)
            .from(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::NONE)
            .to(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            )
    }

    /// Reads by earlier submissions must finish before a transfer overwrites the range.
    pub fn reads_to_transfer(buffer: vk::Buffer, offset: u64, size: u64) -> Self {
        Self::new(buffer, offset, size)
            .from(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::NONE)
            .to(
                vk::PipelineStageFlags2::ALL_TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            )
    }

    /// Whether this barrier covers `[offset, offset + size)`.
    pub fn covers(&self, offset: u64, size: u64) -> bool {
        if self.size == vk::WHOLE_SIZE {
            return offset >= self.offset;
        }
        offset >= self.offset && offset + size <= self.offset + self.size
    }

    fn to_vk(self) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

/// Layout transition and memory dependency on an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl ImageBarrier {
    /// Transition `image` between layouts; stages default to none.
    pub fn transition(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        Self {
            image,
            aspect,
            old_layout,
            new_layout,
            src_stage: vk::PipelineStageFlags2::NONE,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::NONE,
            dst_access: vk::AccessFlags2::NONE,
        }
    }

    /// Set the producing stage and access.
    pub fn from(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.src_stage = stage;
        self.src_access = access;
        self
    }

    /// Set the consuming stage and access.
    pub fn to(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.dst_stage = stage;
        self.dst_access = access;
        self
    }

    /// Freshly acquired swapchain image to color attachment.
    ///
    /// The source stage chains with the image-acquired semaphore wait.
    pub fn acquire_to_color_attachment(image: vk::Image) -> Self {
        Self::transition(
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
        .from(
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::NONE,
        )
        .to(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        )
    }

    /// Color attachment to presentable.
    pub fn color_attachment_to_present(image: vk::Image) -> Self {
        Self::transition(
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .from(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        )
        .to(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
    }

    /// Depth image prepared for writing, discarding old contents.
    pub fn depth_attachment(image: vk::Image) -> Self {
        Self::transition(
            image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        )
        .from(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .to(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
    }

    /// Depth attachment to sampled in fragment shaders.
    pub fn depth_to_sampled(image: vk::Image) -> Self {
        Self::transition(
            image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .from(
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .to(
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        )
    }

    fn to_vk(self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            )
    }
}

/// Record a batch of barriers as one dependency.
///
/// # Safety
/// The command buffer must be recording and every handle must be valid.
pub unsafe fn record_barriers(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffers: &[BufferBarrier],
    images: &[ImageBarrier],
) {
    if buffers.is_empty() && images.is_empty() {
        return;
    }

    let buffer_barriers: Vec<_> = buffers.iter().map(|b| b.to_vk()).collect();
    let image_barriers: Vec<_> = images.iter().map(|b| b.to_vk()).collect();
    let dependency_info = vk::DependencyInfo::default()
        .buffer_memory_barriers(&buffer_barriers)
        .image_memory_barriers(&image_barriers);

    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn indirect_barrier_targets_indirect_read() {
        let buffer = vk::Buffer::from_raw(7);
        let barrier = BufferBarrier::compute_to_indirect(buffer, 64, 128);
        assert_eq!(barrier.src_access, vk::AccessFlags2::SHADER_STORAGE_WRITE);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags2::DRAW_INDIRECT);
        assert_eq!(barrier.dst_access, vk::AccessFlags2::INDIRECT_COMMAND_READ);
        assert!(barrier.covers(64, 128));
        assert!(barrier.covers(100, 8));
        assert!(!barrier.covers(0, 64));
        assert!(!barrier.covers(150, 64));
    }

    #[test]
    fn vertex_barrier_targets_vertex_reads() {
        let barrier = BufferBarrier::compute_to_vertex(vk::Buffer::from_raw(1), 0, 32);
        assert!(barrier
            .dst_access
            .contains(vk::AccessFlags2::VERTEX_ATTRIBUTE_READ));
        assert!(barrier
            .dst_stage
            .contains(vk::PipelineStageFlags2::VERTEX_SHADER));
    }

    #[test]
    fn write_after_read_barriers_are_execution_only() {
        let buffer = vk::Buffer::from_raw(5);
        for barrier in [
            BufferBarrier::reads_to_transfer(buffer, 0, 16),
            BufferBarrier::reads_to_compute(buffer, 0, 16),
        ] {
            assert_eq!(barrier.src_stage, vk::PipelineStageFlags2::ALL_COMMANDS);
            assert_eq!(barrier.src_access, vk::AccessFlags2::NONE);
            assert_ne!(barrier.dst_access, vk::AccessFlags2::NONE);
        }
        let upload = BufferBarrier::transfer_to_vertex_input(buffer, 0, 16);
        assert!(upload.dst_access.contains(vk::AccessFlags2::INDEX_READ));
    }

    #[test]
    fn whole_buffer_covers_any_range() {
        let barrier = BufferBarrier::whole(vk::Buffer::from_raw(3));
        assert!(barrier.covers(0, 1 << 20));
    }

    #[test]
    fn present_transition_layouts() {
        let barrier = ImageBarrier::color_attachment_to_present(vk::Image::from_raw(9));
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
