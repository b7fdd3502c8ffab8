//! Pipelines and descriptor set layouts of the renderer.

use crate::config::MaterialPipeline;
use crate::gpu_types::{CullParams, MaterialPush, SkinParams, Vertex};
use ash::vk;
use kestrel_gpu::{
    ComputePipeline, DepthBias, DescriptorSetLayoutBuilder, GraphicsPipeline,
    GraphicsPipelineConfig, Result,
};
use kestrel_shaders::{ShaderId, ShaderLibrary};

/// Depth format of the main depth buffer and the shadow map.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const SHADOW_BIAS: DepthBias = DepthBias {
    constant: 1.25,
    slope: 1.75,
    clamp: 0.0,
};

/// Descriptor set layouts, one per shader interface.
#[derive(Clone, Copy, Debug)]
pub struct SetLayouts {
    /// objects, geometries, draw commands, draw counts
    pub cull: vk::DescriptorSetLayout,
    /// bind pose, influences, joints, skinned vertices
    pub skin: vk::DescriptorSetLayout,
    /// objects, frame uniforms, shadow map
    pub mesh: vk::DescriptorSetLayout,
    /// objects, frame uniforms
    pub shadow: vk::DescriptorSetLayout,
}

impl SetLayouts {
    unsafe fn new(device: &ash::Device) -> Result<Self> {
        let compute = vk::ShaderStageFlags::COMPUTE;
        let four_buffers = || {
            DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, compute)
                .storage_buffer(1, compute)
                .storage_buffer(2, compute)
                .storage_buffer(3, compute)
        };

        unsafe {
            let cull = four_buffers().build(device)?;
            let skin = four_buffers().build(device)?;
            let mesh = DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, vk::ShaderStageFlags::VERTEX)
                .uniform_buffer(
                    1,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                )
                .sampled_image(2, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?;
            let shadow = DescriptorSetLayoutBuilder::new()
                .storage_buffer(0, vk::ShaderStageFlags::VERTEX)
                .uniform_buffer(1, vk::ShaderStageFlags::VERTEX)
                .build(device)?;
            Ok(Self {
                cull,
                skin,
                mesh,
                shadow,
            })
        }
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        for layout in [self.cull, self.skin, self.mesh, self.shadow] {
            unsafe { device.destroy_descriptor_set_layout(layout, None) };
        }
    }
}

/// Every pipeline the frame plan binds.
pub struct RenderPipelines {
    pub layouts: SetLayouts,
    pub cull: ComputePipeline,
    pub skin: ComputePipeline,
    /// Indexed by a mesh node's pipeline index.
    pub materials: Vec<GraphicsPipeline>,
    pub material_push: Vec<MaterialPush>,
    pub shadow: GraphicsPipeline,
}

impl RenderPipelines {
    /// Build all pipelines for rendering into `color_format`.
    ///
    /// # Safety
    /// The device must be valid and support dynamic rendering.
    pub unsafe fn new(
        device: &ash::Device,
        shaders: &ShaderLibrary,
        materials: &[MaterialPipeline],
        color_format: vk::Format,
    ) -> Result<Self> {
        let layouts = unsafe { SetLayouts::new(device)? };

        let compute_push = |size: u32| {
            vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .offset(0)
                .size(size)
        };

        unsafe {
            let cull = ComputePipeline::new(
                device,
                shaders.get(ShaderId::Cull),
                &[layouts.cull],
                &[compute_push(CullParams::SIZE)],
            )?;
            let skin = ComputePipeline::new(
                device,
                shaders.get(ShaderId::Skin),
                &[layouts.skin],
                &[compute_push(SkinParams::SIZE)],
            )?;

            let material_range = vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .offset(0)
                .size(MaterialPush::SIZE);
            let mut pipelines = Vec::with_capacity(materials.len());
            for material in materials {
                let config = GraphicsPipelineConfig {
                    vertex_shader: shaders.get(ShaderId::MeshVert).to_vec(),
                    fragment_shader: shaders.get(ShaderId::MeshFrag).to_vec(),
                    vertex_bindings: vec![Vertex::binding()],
                    vertex_attributes: Vertex::attributes().to_vec(),
                    cull_mode: if material.double_sided {
                        vk::CullModeFlags::NONE
                    } else {
                        vk::CullModeFlags::BACK
                    },
                    color_formats: vec![color_format],
                    depth_format: Some(DEPTH_FORMAT),
                    ..Default::default()
                };
                pipelines.push(GraphicsPipeline::new(
                    device,
                    &config,
                    &[layouts.mesh],
                    &[material_range],
                )?);
                tracing::debug!(material = %material.name, "created material pipeline");
            }

            let shadow_config = GraphicsPipelineConfig {
                vertex_shader: shaders.get(ShaderId::ShadowVert).to_vec(),
                fragment_shader: Vec::new(),
                vertex_bindings: vec![Vertex::binding()],
                vertex_attributes: vec![Vertex::attributes()[0]],
                cull_mode: vk::CullModeFlags::NONE,
                depth_bias: Some(SHADOW_BIAS),
                color_formats: Vec::new(),
                depth_format: Some(DEPTH_FORMAT),
                ..Default::default()
            };
            let shadow = GraphicsPipeline::new(device, &shadow_config, &[layouts.shadow], &[])?;

            Ok(Self {
                layouts,
                cull,
                skin,
                materials: pipelines,
                material_push: materials
                    .iter()
                    .map(|m| MaterialPush {
                        base_color: m.base_color,
                    })
                    .collect(),
                shadow,
            })
        }
    }

    /// Destroy every pipeline and layout.
    ///
    /// # Safety
    /// No submitted work may still use them.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            self.cull.destroy(device);
            self.skin.destroy(device);
            for pipeline in &self.materials {
                pipeline.destroy(device);
            }
            self.shadow.destroy(device);
            self.layouts.destroy(device);
        }
    }
}
