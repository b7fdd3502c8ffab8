//! Vulkan instance creation and physical device selection.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan instance with the extensions a window surface needs.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    surface_extensions: &[*const std::ffi::c_char],
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidUsage("application name contains NUL".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Kestrel")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extension_names = surface_extensions.to_vec();
    #[cfg(target_os = "macos")]
    extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());

    let layer_names: Vec<*const std::ffi::c_char> =
        if enable_validation && unsafe { layer_available(entry, VALIDATION_LAYER)? } {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            if enable_validation {
                tracing::warn!("validation layer {VALIDATION_LAYER:?} not available");
            }
            Vec::new()
        };

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

unsafe fn layer_available(entry: &ash::Entry, layer: &CStr) -> Result<bool> {
    let available = unsafe { entry.enumerate_instance_layer_properties()? };
    Ok(has_layer(&available, layer))
}

fn has_layer(available: &[vk::LayerProperties], layer: &CStr) -> bool {
    available
        .iter()
        .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == layer))
}

/// Pick the highest scoring device that meets the renderer's requirements.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    let candidates: Vec<_> = devices
        .into_iter()
        .map(|device| (device, unsafe { GpuCapabilities::query(instance, device) }))
        .inspect(|(_, caps)| {
            let missing = caps.missing_requirements();
            if !missing.is_empty() {
                tracing::info!(device = %caps.device_name, ?missing, "skipping GPU");
            }
        })
        .collect();

    pick_best(candidates).ok_or(GpuError::NoSuitableDevice)
}

fn pick_best<D>(candidates: Vec<(D, GpuCapabilities)>) -> Option<(D, GpuCapabilities)> {
    candidates
        .into_iter()
        .filter(|(_, caps)| caps.score() >= 0)
        .max_by_key(|(_, caps)| caps.score())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::GpuVendor;

    fn caps(device_type: vk::PhysicalDeviceType, indirect_count: bool) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: format!("{device_type:?}"),
            device_type,
            api_version: vk::API_VERSION_1_3,
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_draw_indirect_count: indirect_count,
            supports_multi_draw_indirect: true,
            supports_depth_bias_clamp: true,
            device_local_memory_mb: 4096,
            max_draw_indirect_count: u32::MAX,
            max_compute_workgroup_size: [1024, 1024, 64],
            max_compute_workgroup_invocations: 1024,
            min_storage_buffer_offset_alignment: 16,
            timestamp_period_ns: 1.0,
        }
    }

    #[test]
    fn prefers_capable_discrete_device() {
        let picked = pick_best(vec![
            (0, caps(vk::PhysicalDeviceType::INTEGRATED_GPU, true)),
            (1, caps(vk::PhysicalDeviceType::DISCRETE_GPU, false)),
            (2, caps(vk::PhysicalDeviceType::DISCRETE_GPU, true)),
        ]);
        assert_eq!(picked.map(|(d, _)| d), Some(2));
    }

    #[test]
    fn finds_layers_by_name() {
        let validation = vk::LayerProperties::default()
            .layer_name(VALIDATION_LAYER)
            .unwrap();
        let monitor = vk::LayerProperties::default()
            .layer_name(c"VK_LAYER_LUNARG_monitor")
            .unwrap();
        assert!(has_layer(&[monitor, validation], VALIDATION_LAYER));
        assert!(!has_layer(&[monitor], VALIDATION_LAYER));
        assert!(!has_layer(&[], VALIDATION_LAYER));
    }

    #[test]
    fn no_capable_device() {
        let picked = pick_best(vec![(0, caps(vk::PhysicalDeviceType::DISCRETE_GPU, false))]);
        assert!(picked.is_none());
    }
}
