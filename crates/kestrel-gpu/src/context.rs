//! GPU context: instance, device, queue and allocator.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use kestrel_core::MemoryTracker;
use parking_lot::Mutex;
use raw_window_handle::HasDisplayHandle;
use std::ffi::{c_char, CStr};
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
///
/// All rendering work is recorded on one thread and submitted to a single
/// graphics queue, which also runs the compute passes so every dependency
/// is expressed with pipeline barriers rather than cross-queue semaphores.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: Mutex<GpuAllocator>,
    tracker: Arc<MemoryTracker>,
    graphics_queue_family: u32,
    graphics_queue: vk::Queue,
}

impl GpuContext {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the device, for objects that outlive a borrow.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Tracker that every GPU-side allocation of this context reports to.
    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// Block until the device has finished all submitted work.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is valid for the lifetime of the context.
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // SAFETY: owners of device objects are dropped before the context.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!("device_wait_idle during teardown failed: {e}");
            }

            // Memory must be released while the device is still alive.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    tracker: Option<Arc<MemoryTracker>>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Kestrel".to_string(),
            enable_validation: cfg!(debug_assertions),
            tracker: None,
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Report allocations to `tracker` instead of a fresh one.
    pub fn tracker(mut self, tracker: Arc<MemoryTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Build a context able to present to surfaces of `display`.
    pub fn build_for_display(self, display: &impl HasDisplayHandle) -> Result<GpuContext> {
        let handle = display
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("no display handle: {e}")))?;
        let extensions = ash_window::enumerate_required_extensions(handle.as_raw())
            .map_err(|e| GpuError::ExtensionNotSupported(e.to_string()))?;
        self.build_with_extensions(extensions)
    }

    /// Build a context without presentation support.
    pub fn build(self) -> Result<GpuContext> {
        self.build_with_extensions(&[])
    }

    fn build_with_extensions(self, surface_extensions: &[*const c_char]) -> Result<GpuContext> {
        // SAFETY: loading the system Vulkan library has no preconditions.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                surface_extensions,
                self.enable_validation,
            )
        }?;

        let (physical_device, capabilities) = match unsafe { select_physical_device(&instance) } {
            Ok(selected) => selected,
            Err(e) => {
                // SAFETY: nothing was created from the instance yet.
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let graphics_queue_family =
            unsafe { find_graphics_queue_family(&instance, physical_device) }?;
        let (device, graphics_queue) = unsafe {
            create_device(
                &instance,
                physical_device,
                graphics_queue_family,
                !surface_extensions.is_empty(),
            )?
        };
        let device = Arc::new(device);

        let tracker = self.tracker.unwrap_or_default();
        let allocator = unsafe {
            GpuAllocator::new(
                &instance,
                Arc::clone(&device),
                physical_device,
                Arc::clone(&tracker),
            )
        }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            tracker,
            graphics_queue_family,
            graphics_queue,
        })
    }
}

unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    pick_graphics_family(&families).ok_or(GpuError::NoSuitableDevice)
}

/// First family supporting both graphics and compute.
fn pick_graphics_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
}

fn required_device_extensions(presentable: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if presentable {
        extensions.push(ash::khr::swapchain::NAME);
    }
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_subset::NAME);
    extensions
}

unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    presentable: bool,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = [1.0_f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_family)
        .queue_priorities(&queue_priority)];

    let extension_names: Vec<*const c_char> = required_device_extensions(presentable)
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().draw_indirect_count(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .multi_draw_indirect(true)
        .depth_bias_clamp(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };
    let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };

    Ok((device, graphics_queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn picks_family_with_graphics_and_compute() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(pick_graphics_family(&families), Some(2));
        assert_eq!(pick_graphics_family(&families[..2]), None);
    }

    #[test]
    fn swapchain_extension_only_when_presenting() {
        assert!(required_device_extensions(true).contains(&ash::khr::swapchain::NAME));
        assert!(!required_device_extensions(false).contains(&ash::khr::swapchain::NAME));
    }
}
