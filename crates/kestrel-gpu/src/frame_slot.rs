//! Vulkan-backed frame slots.
//!
//! A [`FrameSlot`] owns everything one frame in flight touches exclusively:
//! command pool and buffer, the render fence, both semaphores, the staging
//! ring and a descriptor allocator. [`VulkanFrameBackend`] implements
//! [`FrameBackend`] over a set of slots and the window's swapchain.

use crate::command::{begin_one_time, end_command_buffer, submit_frame, CommandPool};
use crate::context::GpuContext;
use crate::descriptor_allocator::{
    DescriptorAllocator, DescriptorAllocatorConfig, VulkanDescriptorBackend,
};
use crate::error::{GpuError, Result};
use crate::frame::{AcquireOutcome, FenceWait, FrameBackend, PresentOutcome};
use crate::staging::StagingRing;
use crate::surface::SurfaceContext;
use crate::swapchain::Swapchain;
use crate::sync::{create_fence, create_semaphore, reset_fence, wait_for_fence};
use ash::vk;
use kestrel_core::MemoryTag;
use std::sync::Arc;

/// Resources owned by one frame in flight.
pub struct FrameSlot {
    pub command_pool: CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub render_fence: vk::Fence,
    pub image_acquired: vk::Semaphore,
    pub render_complete: vk::Semaphore,
    pub staging: StagingRing,
    pub descriptors: DescriptorAllocator<VulkanDescriptorBackend>,
}

impl FrameSlot {
    /// Create a slot with a signaled fence, so the first wait returns at once.
    pub fn new(
        gpu: &GpuContext,
        index: usize,
        staging_size: u64,
        descriptor_config: DescriptorAllocatorConfig,
    ) -> Result<Self> {
        let device = gpu.device();
        let tracker = gpu.tracker();

        // SAFETY: every object is created on, and destroyed with, this device.
        unsafe {
            let command_pool = CommandPool::transient(device, gpu.graphics_queue_family())?;
            tracker.record_alloc(MemoryTag::CommandPool, 0);
            let command_buffer = command_pool.allocate_primary(device)?;

            let render_fence = create_fence(device, true)?;
            let image_acquired = create_semaphore(device)?;
            let render_complete = create_semaphore(device)?;
            for _ in 0..3 {
                tracker.record_alloc(MemoryTag::SyncObject, 0);
            }

            let staging = StagingRing::new(
                &mut gpu.allocator().lock(),
                staging_size,
                &format!("frame {index} staging"),
            )?;
            let descriptors = DescriptorAllocator::new(
                VulkanDescriptorBackend::new(gpu.device_arc()),
                descriptor_config,
                Arc::clone(tracker),
            )?;

            Ok(Self {
                command_pool,
                command_buffer,
                render_fence,
                image_acquired,
                render_complete,
                staging,
                descriptors,
            })
        }
    }

    /// Replace the image-acquired semaphore.
    ///
    /// A suboptimal acquire signals the semaphore even though the frame is
    /// abandoned, so it is recreated on every surface rebuild.
    ///
    /// # Safety
    /// The device must be idle.
    unsafe fn recreate_image_acquired(&mut self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.destroy_semaphore(self.image_acquired, None);
            self.image_acquired = create_semaphore(device)?;
        }
        Ok(())
    }

    /// Release every resource of the slot.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        let device = gpu.device();
        let tracker = gpu.tracker();

        self.descriptors.destroy_all();
        self.staging.destroy(&mut gpu.allocator().lock())?;

        unsafe {
            device.destroy_semaphore(self.render_complete, None);
            device.destroy_semaphore(self.image_acquired, None);
            device.destroy_fence(self.render_fence, None);
            self.command_pool.destroy(device);
        }
        for _ in 0..3 {
            tracker.record_free(MemoryTag::SyncObject, 0);
        }
        tracker.record_free(MemoryTag::CommandPool, 0);
        Ok(())
    }
}

/// [`FrameBackend`] over real frame slots and a window swapchain.
pub struct VulkanFrameBackend {
    gpu: Arc<GpuContext>,
    surface: SurfaceContext,
    swapchain: Swapchain,
    slots: Vec<FrameSlot>,
    framebuffer_size: (u32, u32),
    vsync: bool,
    destroyed: bool,
}

impl VulkanFrameBackend {
    /// Create the swapchain and `frames_in_flight` slots.
    pub fn new(
        gpu: Arc<GpuContext>,
        surface: SurfaceContext,
        framebuffer_size: (u32, u32),
        vsync: bool,
        frames_in_flight: usize,
        staging_size: u64,
        descriptor_config: &DescriptorAllocatorConfig,
    ) -> Result<Self> {
        let (width, height) = framebuffer_size;
        // SAFETY: no previous swapchain exists.
        let swapchain = unsafe {
            surface.create_swapchain(&gpu, width, height, vsync, vk::SwapchainKHR::null())
        }?
        .ok_or_else(|| GpuError::SwapchainCreation("window has no area".into()))?;

        let mut slots = Vec::with_capacity(frames_in_flight);
        for index in 0..frames_in_flight {
            slots.push(FrameSlot::new(
                &gpu,
                index,
                staging_size,
                descriptor_config.clone(),
            )?);
        }

        tracing::info!(
            frames_in_flight,
            images = swapchain.image_count(),
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            "frame backend ready"
        );

        Ok(Self {
            gpu,
            surface,
            swapchain,
            slots,
            framebuffer_size,
            vsync,
            destroyed: false,
        })
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut FrameSlot {
        &mut self.slots[index]
    }

    /// Size the next surface rebuild should target.
    pub fn set_framebuffer_size(&mut self, width: u32, height: u32) {
        self.framebuffer_size = (width, height);
    }
}

impl FrameBackend for VulkanFrameBackend {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn wait_for_fence(&mut self, slot: usize, timeout_ns: u64) -> Result<FenceWait> {
        let fence = self.slots[slot].render_fence;
        // SAFETY: the fence belongs to this device.
        unsafe { wait_for_fence(self.gpu.device(), fence, timeout_ns) }
    }

    fn reset_fence(&mut self, slot: usize) -> Result<()> {
        // SAFETY: the fence is signaled and no submission references it.
        unsafe { reset_fence(self.gpu.device(), self.slots[slot].render_fence) }
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        // SAFETY: the slot's previous use of the semaphore has been waited on.
        unsafe {
            self.swapchain.acquire_next_image(
                &self.surface.swapchain_loader,
                self.slots[slot].image_acquired,
                u64::MAX,
            )
        }
    }

    fn begin_recording(&mut self, slot: usize) -> Result<()> {
        let device = self.gpu.device();
        let frame = &mut self.slots[slot];

        // SAFETY: the slot's fence has signaled, so none of these are in use.
        unsafe { frame.command_pool.reset(device)? };
        frame.staging.reset();
        frame.descriptors.reset_all()?;
        unsafe { begin_one_time(device, frame.command_buffer) }
    }

    fn end_recording(&mut self, slot: usize) -> Result<()> {
        // SAFETY: the command buffer is recording.
        unsafe { end_command_buffer(self.gpu.device(), self.slots[slot].command_buffer) }
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = &self.slots[slot];
        // SAFETY: all handles belong to this device and the fence is unsignaled.
        unsafe {
            submit_frame(
                self.gpu.device(),
                self.gpu.graphics_queue(),
                frame.command_buffer,
                frame.image_acquired,
                vk::PipelineStageFlags2::ALL_TRANSFER,
                frame.render_complete,
                vk::PipelineStageFlags2::ALL_GRAPHICS,
                frame.render_fence,
            )
        }
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        // SAFETY: the image was acquired this frame.
        unsafe {
            self.swapchain.present(
                &self.surface.swapchain_loader,
                self.gpu.graphics_queue(),
                image_index,
                &[self.slots[slot].render_complete],
            )
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.gpu.wait_idle()
    }

    fn rebuild_surface(&mut self) -> Result<bool> {
        let (width, height) = self.framebuffer_size;
        if width == 0 || height == 0 {
            return Ok(false);
        }

        // SAFETY: the device is idle; the old swapchain is retired below.
        let Some(new_swapchain) = (unsafe {
            self.surface.create_swapchain(
                &self.gpu,
                width,
                height,
                self.vsync,
                self.swapchain.swapchain,
            )
        }?) else {
            return Ok(false);
        };

        let mut old = std::mem::replace(&mut self.swapchain, new_swapchain);
        let device = self.gpu.device();
        unsafe {
            old.destroy(device, &self.surface.swapchain_loader);
            for slot in &mut self.slots {
                slot.recreate_image_acquired(device)?;
            }
        }
        Ok(true)
    }

    /// Destroy slots, swapchain and surface.
    fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.gpu.wait_idle()?;
        self.destroyed = true;

        for slot in &mut self.slots {
            // SAFETY: the device is idle.
            unsafe { slot.destroy(&self.gpu)? };
        }
        self.slots.clear();
        // SAFETY: no slot references the swapchain any more.
        unsafe {
            self.swapchain
                .destroy(self.gpu.device(), &self.surface.swapchain_loader);
            self.surface.destroy();
        }
        Ok(())
    }
}

impl Drop for VulkanFrameBackend {
    fn drop(&mut self) {
        if let Err(e) = FrameBackend::destroy(self) {
            tracing::error!("frame backend teardown failed: {e}");
        }
    }
}
