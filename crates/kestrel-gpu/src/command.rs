//! Command buffer management.

use crate::error::{GpuError, Result};
use ash::vk;

/// Per-slot command pool. The whole pool is reset once the slot's fence has
/// signalled, so its buffers are never reset individually.
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn transient(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&create_info, None)? };
        Ok(Self { pool })
    }

    /// Allocate one primary command buffer.
    ///
    /// # Safety
    /// The device must be the one the pool was created on.
    pub unsafe fn allocate_primary(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        buffers.first().copied().ok_or_else(|| {
            GpuError::InvalidState("command buffer allocation returned nothing".into())
        })
    }

    /// Return every buffer of the pool to the initial state.
    ///
    /// # Safety
    /// No buffer of this pool may be pending on the GPU.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    /// # Safety
    /// No buffer of this pool may be pending on the GPU.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin a one-time-submit recording.
///
/// # Safety
/// The command buffer must be in the initial state.
pub unsafe fn begin_one_time(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// Submit one command buffer with a single wait and a single signal semaphore.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
#[allow(clippy::too_many_arguments)]
pub unsafe fn submit_frame(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    wait: vk::Semaphore,
    wait_stage: vk::PipelineStageFlags2,
    signal: vk::Semaphore,
    signal_stage: vk::PipelineStageFlags2,
    fence: vk::Fence,
) -> Result<()> {
    let wait_infos = [vk::SemaphoreSubmitInfo::default()
        .semaphore(wait)
        .stage_mask(wait_stage)];
    let signal_infos = [vk::SemaphoreSubmitInfo::default()
        .semaphore(signal)
        .stage_mask(signal_stage)];
    let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];

    let submit_info = vk::SubmitInfo2::default()
        .wait_semaphore_infos(&wait_infos)
        .command_buffer_infos(&cmd_infos)
        .signal_semaphore_infos(&signal_infos);

    unsafe { device.queue_submit2(queue, &[submit_info], fence)? };
    Ok(())
}
