//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,

    pub supports_dynamic_rendering: bool,
    pub supports_synchronization2: bool,
    /// `vkCmdDrawIndexedIndirectCount` (Vulkan 1.2 core, optional feature).
    pub supports_draw_indirect_count: bool,
    /// More than one draw per indirect call.
    pub supports_multi_draw_indirect: bool,
    /// Depth bias clamp for the shadow pass.
    pub supports_depth_bias_clamp: bool,

    pub device_local_memory_mb: u64,
    pub max_draw_indirect_count: u32,
    pub max_compute_workgroup_size: [u32; 3],
    pub max_compute_workgroup_invocations: u32,
    pub min_storage_buffer_offset_alignment: u64,
    pub timestamp_period_ns: f32,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_1_2)
            .push_next(&mut vulkan_1_3);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        let base = features2.features;

        // SAFETY: the driver writes a NUL-terminated name.
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let limits = properties.limits;
        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,

            supports_dynamic_rendering: vulkan_1_3.dynamic_rendering == vk::TRUE,
            supports_synchronization2: vulkan_1_3.synchronization2 == vk::TRUE,
            supports_draw_indirect_count: vulkan_1_2.draw_indirect_count == vk::TRUE,
            supports_multi_draw_indirect: base.multi_draw_indirect == vk::TRUE,
            supports_depth_bias_clamp: base.depth_bias_clamp == vk::TRUE,

            device_local_memory_mb,
            max_draw_indirect_count: limits.max_draw_indirect_count,
            max_compute_workgroup_size: limits.max_compute_work_group_size,
            max_compute_workgroup_invocations: limits.max_compute_work_group_invocations,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            timestamp_period_ns: limits.timestamp_period,
        }
    }

    /// Features the renderer cannot run without that this device lacks.
    pub fn missing_requirements(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();

        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        if major < 1 || (major == 1 && minor < 3) {
            missing.push("Vulkan 1.3");
        }
        if !self.supports_dynamic_rendering {
            missing.push("dynamicRendering");
        }
        if !self.supports_synchronization2 {
            missing.push("synchronization2");
        }
        if !self.supports_draw_indirect_count {
            missing.push("drawIndirectCount");
        }
        if !self.supports_multi_draw_indirect {
            missing.push("multiDrawIndirect");
        }
        if self.max_compute_workgroup_size[0] < 64 {
            missing.push("64-wide compute work groups");
        }

        missing
    }

    /// Check if the GPU meets minimum requirements for the engine.
    pub fn meets_requirements(&self) -> bool {
        self.missing_requirements().is_empty()
    }

    /// Preference score for device selection; negative means unusable.
    pub fn score(&self) -> i64 {
        if !self.meets_requirements() {
            return -1;
        }

        let type_score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        type_score + (self.device_local_memory_mb / 1024) as i64
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "test".into(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_3,
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_draw_indirect_count: true,
            supports_multi_draw_indirect: true,
            supports_depth_bias_clamp: true,
            device_local_memory_mb: 8192,
            max_draw_indirect_count: u32::MAX,
            max_compute_workgroup_size: [1024, 1024, 64],
            max_compute_workgroup_invocations: 1024,
            min_storage_buffer_offset_alignment: 16,
            timestamp_period_ns: 1.0,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn indirect_count_is_required() {
        let mut caps = capable();
        assert!(caps.meets_requirements());

        caps.supports_draw_indirect_count = false;
        assert_eq!(caps.missing_requirements(), vec!["drawIndirectCount"]);
        assert_eq!(caps.score(), -1);
    }

    #[test]
    fn discrete_gpus_score_higher() {
        let discrete = capable();
        let mut integrated = capable();
        integrated.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        assert!(discrete.score() > integrated.score());
    }
}
