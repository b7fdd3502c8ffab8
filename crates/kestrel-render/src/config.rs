//! Renderer configuration.

use kestrel_core::constants::DEFAULT_FRAMES_IN_FLIGHT;
use kestrel_gpu::{DescriptorAllocatorConfig, GpuError, Result};
use kestrel_shaders::ShaderSource;

/// One material pipeline; mesh nodes select it by index.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialPipeline {
    pub name: String,
    pub base_color: [f32; 4],
    /// Disable back-face culling.
    pub double_sided: bool,
}

impl MaterialPipeline {
    pub fn new(name: impl Into<String>, base_color: [f32; 4]) -> Self {
        Self {
            name: name.into(),
            base_color,
            double_sided: false,
        }
    }

    pub fn double_sided(mut self) -> Self {
        self.double_sided = true;
        self
    }
}

/// Configuration for [`crate::Renderer::initialize`].
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Application name reported to the Vulkan instance.
    pub app_name: String,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Frame slots cycled by the frame pipeline.
    pub frames_in_flight: usize,
    /// Longest wait on a frame fence before the GPU is considered hung.
    pub fence_timeout_ns: u64,
    pub descriptors: DescriptorAllocatorConfig,
    /// Object table capacity reserved up front; the buffer grows past it.
    pub max_objects: u32,
    /// Draw commands each bucket can hold.
    pub max_draws_per_pipeline: u32,
    pub materials: Vec<MaterialPipeline>,
    pub shadow_map_size: u32,
    /// Bytes of staging memory per frame slot.
    pub staging_size: u64,
    pub vsync: bool,
    pub clear_color: [f32; 4],
    pub shaders: ShaderSource,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "Kestrel".to_string(),
            validation: cfg!(debug_assertions),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout_ns: 2_000_000_000,
            descriptors: DescriptorAllocatorConfig::default(),
            max_objects: 4096,
            max_draws_per_pipeline: 4096,
            materials: vec![MaterialPipeline::new("default", [0.8, 0.8, 0.8, 1.0])],
            shadow_map_size: 2048,
            staging_size: 16 * 1024 * 1024,
            vsync: true,
            clear_color: [0.05, 0.06, 0.08, 1.0],
            shaders: ShaderSource::default(),
        }
    }
}

impl RendererConfig {
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    pub fn with_descriptors(mut self, descriptors: DescriptorAllocatorConfig) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn with_max_objects(mut self, max_objects: u32) -> Self {
        self.max_objects = max_objects;
        self
    }

    pub fn with_max_draws_per_pipeline(mut self, max_draws: u32) -> Self {
        self.max_draws_per_pipeline = max_draws;
        self
    }

    pub fn with_materials(mut self, materials: Vec<MaterialPipeline>) -> Self {
        self.materials = materials;
        self
    }

    pub fn with_shadow_map_size(mut self, size: u32) -> Self {
        self.shadow_map_size = size;
        self
    }

    pub fn with_staging_size(mut self, bytes: u64) -> Self {
        self.staging_size = bytes;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_shaders(mut self, shaders: ShaderSource) -> Self {
        self.shaders = shaders;
        self
    }

    /// Number of material pipelines, and so of main-pass draw buckets.
    pub fn pipeline_count(&self) -> u32 {
        self.materials.len() as u32
    }

    /// Reject configurations the renderer cannot start with.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| {
            tracing::warn!("invalid renderer config: {message}");
            Err(GpuError::InvalidUsage(message))
        };

        if self.frames_in_flight == 0 {
            return fail("frames_in_flight must be at least 1".into());
        }
        if self.materials.is_empty() {
            return fail("at least one material pipeline is required".into());
        }
        if self.max_objects == 0 || self.max_draws_per_pipeline == 0 {
            return fail(format!(
                "max_objects ({}) and max_draws_per_pipeline ({}) must be non-zero",
                self.max_objects, self.max_draws_per_pipeline
            ));
        }
        if self.shadow_map_size == 0 {
            return fail("shadow_map_size must be non-zero".into());
        }
        if self.staging_size == 0 {
            return fail("staging_size must be non-zero".into());
        }
        if self.fence_timeout_ns == 0 {
            return fail("fence_timeout_ns must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.pipeline_count(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let err = RendererConfig::default()
            .with_frames_in_flight(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidUsage(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn empty_material_list_is_rejected() {
        assert!(RendererConfig::default()
            .with_materials(Vec::new())
            .validate()
            .is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = RendererConfig::default()
            .with_frames_in_flight(2)
            .with_max_draws_per_pipeline(16)
            .with_materials(vec![
                MaterialPipeline::new("a", [1.0; 4]),
                MaterialPipeline::new("b", [0.5; 4]).double_sided(),
            ]);
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.max_draws_per_pipeline, 16);
        assert_eq!(config.pipeline_count(), 2);
        assert!(config.materials[1].double_sided);
    }
}
