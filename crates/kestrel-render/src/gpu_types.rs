//! Data layouts shared with the shaders.
//!
//! Every struct here mirrors a declaration in `kestrel-shaders/shaders`
//! (`common.glsl` and the push constant blocks). Layout must match exactly.

use ash::vk;
use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3};

bitflags! {
    /// Per-object flags tested by the culling shader.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        /// Drawn by the main pass.
        const VISIBLE = 1;
        /// Drawn into the shadow map.
        const CASTS_SHADOW = 1 << 1;
        /// Geometry is rewritten by the skinning pass every frame.
        const SKINNED = 1 << 2;
    }
}

/// One drawable instance in the object table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuObject {
    /// Object-to-world transform, column major.
    pub transform: [[f32; 4]; 4],
    /// Local-space bounding sphere: center in xyz, radius in w.
    pub bounds: [f32; 4],
    pub geometry: u32,
    pub pipeline: u32,
    pub flags: u32,
    pub _pad: u32,
}

impl GpuObject {
    pub fn transform(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.transform)
    }

    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags)
    }
}

/// Index range of one mesh inside the shared vertex and index buffers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuGeometry {
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub _pad: u32,
}

/// Indexed indirect draw arguments, laid out as `VkDrawIndexedIndirectCommand`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    /// Index of the object in the object table.
    pub first_instance: u32,
}

impl DrawCommand {
    /// Byte stride between commands in a draw buffer.
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Mesh vertex. Texture coordinates ride in the `w` components.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 4],
    pub normal: [f32; 4],
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.extend(uv.x).to_array(),
            normal: normal.extend(uv.y).to_array(),
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.position[0], self.position[1], self.position[2])
    }

    pub fn normal(&self) -> Vec3 {
        Vec3::new(self.normal[0], self.normal[1], self.normal[2])
    }

    pub fn uv(&self) -> Vec2 {
        Vec2::new(self.position[3], self.normal[3])
    }

    /// Vertex buffer binding of the mesh and shadow pipelines.
    pub fn binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: Self::STRIDE,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attributes read by `mesh.vert`; `shadow.vert` uses only the first.
    pub fn attributes() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 16,
            },
        ]
    }
}

/// Up to four joint influences of one vertex.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SkinInfluence {
    pub joints: [u32; 4],
    pub weights: [f32; 4],
}

impl SkinInfluence {
    /// Fully bound to a single joint.
    pub fn single(joint: u32) -> Self {
        Self {
            joints: [joint, 0, 0, 0],
            weights: [1.0, 0.0, 0.0, 0.0],
        }
    }
}

/// Push constants of `cull.comp`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CullParams {
    pub planes: [[f32; 4]; 6],
    pub object_count: u32,
    pub max_draws: u32,
    pub bucket_count: u32,
    pub required_flags: u32,
    /// Non-zero routes every object to bucket 0 regardless of its pipeline.
    pub single_bucket: u32,
    pub _pad: [u32; 3],
}

impl CullParams {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Push constants of `skin.comp`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SkinParams {
    pub vertex_count: u32,
    /// First vertex in the bind-pose and influence buffers.
    pub src_offset: u32,
    /// First vertex written in the shared vertex buffer.
    pub dst_offset: u32,
    pub joint_offset: u32,
}

impl SkinParams {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Per-frame uniform block (std140).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub light_view_proj: [[f32; 4]; 4],
    pub light_dir: [f32; 4],
    pub camera_pos: [f32; 4],
}

/// Push constants of `mesh.frag`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MaterialPush {
    pub base_color: [f32; 4],
}

impl MaterialPush {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn layouts_match_shader_declarations() {
        assert_eq!(size_of::<GpuObject>(), 96);
        assert_eq!(size_of::<GpuGeometry>(), 16);
        assert_eq!(size_of::<Vertex>(), 32);
        assert_eq!(size_of::<SkinInfluence>(), 32);
        assert_eq!(size_of::<FrameUniforms>(), 160);
        assert_eq!(align_of::<GpuObject>(), 4);
    }

    #[test]
    fn draw_command_is_vulkan_indirect_layout() {
        assert_eq!(DrawCommand::STRIDE, 20);
        assert_eq!(
            size_of::<DrawCommand>(),
            size_of::<vk::DrawIndexedIndirectCommand>()
        );
    }

    #[test]
    fn push_constants_fit_minimum_limit() {
        assert!(CullParams::SIZE <= 128);
        assert_eq!(SkinParams::SIZE, 16);
        assert_eq!(MaterialPush::SIZE, 16);
    }

    #[test]
    fn vertex_packs_texcoords() {
        let v = Vertex::new(Vec3::new(1.0, 2.0, 3.0), Vec3::Y, Vec2::new(0.25, 0.75));
        assert_eq!(v.position(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(v.normal(), Vec3::Y);
        assert_eq!(v.uv(), Vec2::new(0.25, 0.75));
        assert_eq!(Vertex::attributes()[1].offset, 16);
    }

    #[test]
    fn unknown_flag_bits_are_dropped() {
        let object = GpuObject {
            flags: 0xff,
            ..Default::default()
        };
        assert_eq!(object.flags(), ObjectFlags::all());
    }
}
