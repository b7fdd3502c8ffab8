//! Device resources the renderer owns across frames.
//!
//! [`FrameResources`] holds the shared buffers, one uniform buffer per frame
//! slot, the depth target and the shadow map. Anything replaced while frames
//! may still read it goes through a [`DeferredDeletionQueue`]. Allocation is
//! reached through [`ResourceAllocator`]; [`DeviceAllocator`] is the Vulkan
//! implementation.

use crate::buffers::{debug_name, usage_for, SharedBuffers};
use crate::pipelines::DEPTH_FORMAT;
use crate::plan::RenderPlan;
use crate::recorder::BufferRole;
use ash::vk;
use gpu_allocator::MemoryLocation;
use kestrel_core::{MemoryTag, MemoryTracker};
use kestrel_gpu::{
    DeferredDeletionQueue, FrameBackend, FramePipeline, GpuBuffer, GpuContext, GpuError, GpuImage,
    Result,
};
use std::sync::Arc;

/// Images the renderer allocates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageRole {
    /// Main pass depth target, sized like the swapchain.
    Depth,
    /// Depth written by the shadow pass and sampled by the main pass.
    ShadowMap,
}

impl ImageRole {
    pub fn usage(self) -> vk::ImageUsageFlags {
        match self {
            Self::Depth => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            Self::ShadowMap => {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
            }
        }
    }

    fn debug_name(self) -> &'static str {
        match self {
            Self::Depth => "depth",
            Self::ShadowMap => "shadow_map",
        }
    }
}

/// Creates and frees the renderer's buffers and images.
///
/// Each successful allocation must be matched by exactly one release.
pub trait ResourceAllocator {
    type Buffer;
    type Image;

    /// Device-local buffer for `role`.
    fn allocate_buffer(&mut self, role: BufferRole, size: u64) -> Result<Self::Buffer>;

    /// Host-visible uniform buffer of frame slot `slot`.
    fn allocate_uniforms(&mut self, slot: usize, size: u64) -> Result<Self::Buffer>;

    /// Depth image with a view.
    fn allocate_image(&mut self, role: ImageRole, extent: vk::Extent2D) -> Result<Self::Image>;

    fn buffer_size(buffer: &Self::Buffer) -> u64;

    fn image_extent(image: &Self::Image) -> vk::Extent2D;

    fn release_buffer(&mut self, buffer: Self::Buffer) -> Result<()>;

    fn release_image(&mut self, image: Self::Image) -> Result<()>;
}

/// [`ResourceAllocator`] over the device allocator, locked per call.
pub struct DeviceAllocator {
    gpu: Arc<GpuContext>,
}

impl DeviceAllocator {
    pub fn new(gpu: Arc<GpuContext>) -> Self {
        Self { gpu }
    }
}

impl ResourceAllocator for DeviceAllocator {
    type Buffer = GpuBuffer;
    type Image = GpuImage;

    fn allocate_buffer(&mut self, role: BufferRole, size: u64) -> Result<GpuBuffer> {
        self.gpu.allocator().lock().create_buffer(
            size,
            usage_for(role),
            MemoryLocation::GpuOnly,
            debug_name(role),
        )
    }

    fn allocate_uniforms(&mut self, slot: usize, size: u64) -> Result<GpuBuffer> {
        self.gpu.allocator().lock().create_buffer(
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            &format!("frame_uniforms_{slot}"),
        )
    }

    fn allocate_image(&mut self, role: ImageRole, extent: vk::Extent2D) -> Result<GpuImage> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(role.usage())
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut allocator = self.gpu.allocator().lock();
        let mut image = allocator.create_image(&info, MemoryLocation::GpuOnly, role.debug_name())?;
        // SAFETY: the image was created on this device.
        if let Err(e) = unsafe { image.create_view(self.gpu.device()) } {
            allocator.free_image(&mut image)?;
            return Err(e);
        }
        Ok(image)
    }

    fn buffer_size(buffer: &GpuBuffer) -> u64 {
        buffer.size
    }

    fn image_extent(image: &GpuImage) -> vk::Extent2D {
        image.extent_2d()
    }

    fn release_buffer(&mut self, mut buffer: GpuBuffer) -> Result<()> {
        self.gpu.allocator().lock().free_buffer(&mut buffer)
    }

    fn release_image(&mut self, mut image: GpuImage) -> Result<()> {
        self.gpu.allocator().lock().free_image(&mut image)
    }
}

/// Sizes of the resources created up front.
#[derive(Clone, Copy, Debug)]
pub struct ResourceLayout {
    pub frames_in_flight: usize,
    pub uniform_size: u64,
    pub extent: vk::Extent2D,
    pub shadow_map_size: u32,
}

enum Retired<B, I> {
    Buffer(B),
    Image(I),
}

fn release<A: ResourceAllocator>(
    allocator: &mut A,
    item: Retired<A::Buffer, A::Image>,
) -> Result<()> {
    match item {
        Retired::Buffer(buffer) => allocator.release_buffer(buffer),
        Retired::Image(image) => allocator.release_image(image),
    }
}

/// The renderer's cross-frame resources.
pub struct FrameResources<A: ResourceAllocator> {
    allocator: A,
    buffers: SharedBuffers<A::Buffer>,
    uniforms: Vec<A::Buffer>,
    depth: Option<A::Image>,
    shadow_map: Option<A::Image>,
    retired: DeferredDeletionQueue<Retired<A::Buffer, A::Image>>,
}

impl<A: ResourceAllocator> FrameResources<A> {
    /// Allocate per-slot uniforms, both depth images and the buffers in
    /// `initial`. Everything allocated so far is released on failure.
    pub fn new(
        allocator: A,
        layout: &ResourceLayout,
        initial: impl IntoIterator<Item = (BufferRole, u64)>,
    ) -> Result<Self> {
        let mut resources = Self {
            allocator,
            buffers: SharedBuffers::new(),
            uniforms: Vec::with_capacity(layout.frames_in_flight),
            depth: None,
            shadow_map: None,
            retired: DeferredDeletionQueue::new(layout.frames_in_flight),
        };
        if let Err(e) = resources.allocate(layout, initial) {
            if let Err(cleanup) = resources.destroy() {
                tracing::warn!("releasing partial frame resources failed: {cleanup}");
            }
            return Err(e);
        }
        Ok(resources)
    }

    fn allocate(
        &mut self,
        layout: &ResourceLayout,
        initial: impl IntoIterator<Item = (BufferRole, u64)>,
    ) -> Result<()> {
        for slot in 0..layout.frames_in_flight {
            let buffer = self.allocator.allocate_uniforms(slot, layout.uniform_size)?;
            self.uniforms.push(buffer);
        }
        self.depth = Some(self.allocator.allocate_image(ImageRole::Depth, layout.extent)?);
        let shadow_extent = vk::Extent2D {
            width: layout.shadow_map_size,
            height: layout.shadow_map_size,
        };
        self.shadow_map = Some(
            self.allocator
                .allocate_image(ImageRole::ShadowMap, shadow_extent)?,
        );
        for (role, size) in initial {
            self.buffers.ensure(&mut self.allocator, role, size)?;
        }
        Ok(())
    }

    /// Release everything retired at least `frames_in_flight` frames before
    /// `frame`. Returns how many resources were released.
    pub fn collect(&mut self, frame: u64) -> Result<usize> {
        let allocator = &mut self.allocator;
        self.retired.process(frame, |item| release(allocator, item))
    }

    /// Grow shared buffers to `required` and match the depth target to
    /// `extent`. Replaced resources are retired at `frame`; replacing a
    /// geometry buffer makes `plan` upload the mesh registry again.
    pub fn prepare(
        &mut self,
        frame: u64,
        required: impl IntoIterator<Item = (BufferRole, u64)>,
        extent: vk::Extent2D,
        plan: &mut RenderPlan,
    ) -> Result<()> {
        for (role, size) in required {
            if let Some(old) = self.buffers.ensure(&mut self.allocator, role, size)? {
                self.retired.retire(Retired::Buffer(old), frame);
                if !matches!(role, BufferRole::Objects | BufferRole::Joints) {
                    plan.invalidate_geometry();
                }
            }
        }

        let current = self.depth.as_ref().map(A::image_extent);
        if current != Some(extent) {
            let depth = self.allocator.allocate_image(ImageRole::Depth, extent)?;
            if let Some(old) = self.depth.replace(depth) {
                self.retired.retire(Retired::Image(old), frame);
            }
            tracing::debug!(
                width = extent.width,
                height = extent.height,
                "recreated depth buffer"
            );
        }
        Ok(())
    }

    pub fn buffers(&self) -> &SharedBuffers<A::Buffer> {
        &self.buffers
    }

    pub fn uniforms(&self, slot: usize) -> Result<&A::Buffer> {
        self.uniforms
            .get(slot)
            .ok_or_else(|| GpuError::InvalidState(format!("no uniform buffer for slot {slot}")))
    }

    pub fn depth(&self) -> Result<&A::Image> {
        self.depth
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("depth target released".into()))
    }

    pub fn shadow_map(&self) -> Result<&A::Image> {
        self.shadow_map
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("shadow map released".into()))
    }

    /// Resources waiting for their frames to retire.
    pub fn pending_release(&self) -> usize {
        self.retired.pending_count()
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Release every resource, retired ones first. Nothing in flight may use
    /// them. Calling it again does nothing.
    pub fn destroy(&mut self) -> Result<()> {
        let allocator = &mut self.allocator;
        self.retired.flush(|item| release(allocator, item))?;
        self.buffers.destroy(&mut self.allocator)?;
        for buffer in self.uniforms.drain(..) {
            self.allocator.release_buffer(buffer)?;
        }
        if let Some(depth) = self.depth.take() {
            self.allocator.release_image(depth)?;
        }
        if let Some(shadow_map) = self.shadow_map.take() {
            self.allocator.release_image(shadow_map)?;
        }
        Ok(())
    }
}

/// Tear down the frame loop: drain the device, release `resources`, then the
/// frame slots.
///
/// Fails with [`GpuError::InvalidState`] when `tracker` still holds tagged GPU
/// allocations afterwards.
pub fn shut_down_frame_loop<B, A>(
    frames: &mut FramePipeline<B>,
    resources: &mut FrameResources<A>,
    tracker: &MemoryTracker,
) -> Result<()>
where
    B: FrameBackend,
    A: ResourceAllocator,
{
    frames.shutdown()?;
    resources.destroy()?;
    frames.destroy()?;

    if !tracker.log_leaks(&MemoryTag::GPU) {
        tracing::error!("GPU resources leaked at renderer shutdown");
        return Err(GpuError::InvalidState(
            "tagged GPU allocations remain after shutdown".into(),
        ));
    }
    Ok(())
}
