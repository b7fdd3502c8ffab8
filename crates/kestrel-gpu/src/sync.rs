//! Fences and semaphores of the frame slots.

use crate::error::Result;
use crate::frame::FenceWait;
use ash::vk;

/// Binary semaphore, unsignaled.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    Ok(unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? })
}

/// Frame fences start signaled so the first wait on a fresh slot returns at once.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    Ok(unsafe { device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None)? })
}

/// Block until `fence` signals or `timeout_ns` elapses.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<FenceWait> {
    match unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
        Ok(()) => Ok(FenceWait::Signaled),
        Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
        Err(e) => Err(e.into()),
    }
}

/// Return a signaled fence to the unsignaled state before resubmission.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}
