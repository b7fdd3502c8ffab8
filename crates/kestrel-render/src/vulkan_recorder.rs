//! [`FrameRecorder`] writing into a frame slot's command buffer.

use crate::buffers::SharedBuffers;
use crate::gpu_types::{CullParams, DrawCommand, FrameUniforms, SkinParams};
use crate::pipelines::RenderPipelines;
use crate::recorder::{
    BarrierKind, BucketSet, BufferRange, BufferRole, FrameRecorder, IndirectDraw, PassKind,
    RangeBarrier,
};
use ash::vk;
use kestrel_gpu::{
    record_barriers, BufferBarrier, DescriptorAllocator, DescriptorWriter, FrameSlot, GpuBuffer,
    GpuError, ImageBarrier, Result, StagingRing, VulkanDescriptorBackend,
};

/// Images and per-frame resources the passes render with.
#[derive(Clone, Copy, Debug)]
pub struct FrameTargets {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub shadow_image: vk::Image,
    pub shadow_view: vk::ImageView,
    pub shadow_extent: vk::Extent2D,
    pub shadow_sampler: vk::Sampler,
    /// This slot's [`FrameUniforms`] buffer.
    pub uniforms: vk::Buffer,
    pub clear_color: [f32; 4],
}

fn buffer_barrier(barrier: &RangeBarrier, buffer: vk::Buffer) -> BufferBarrier {
    let BufferRange { offset, size } = barrier.range;
    match barrier.kind {
        BarrierKind::ReadsToTransfer => BufferBarrier::reads_to_transfer(buffer, offset, size),
        BarrierKind::ReadsToCompute => BufferBarrier::reads_to_compute(buffer, offset, size),
        BarrierKind::TransferToCompute => BufferBarrier::transfer_to_compute(buffer, offset, size),
        BarrierKind::TransferToShaderRead => {
            BufferBarrier::transfer_to_shader_read(buffer, offset, size)
        }
        BarrierKind::TransferToVertexInput => {
            BufferBarrier::transfer_to_vertex_input(buffer, offset, size)
        }
        BarrierKind::ComputeToIndirect => BufferBarrier::compute_to_indirect(buffer, offset, size),
        BarrierKind::ComputeToVertex => BufferBarrier::compute_to_vertex(buffer, offset, size),
    }
}

/// Records one frame's plan on a slot's command buffer.
///
/// Uploads are staged through the slot's staging ring and descriptor sets
/// come from the slot's allocator, so both must have been reset when the
/// slot's fence signaled.
pub struct VulkanRecorder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
    staging: &'a mut StagingRing,
    descriptors: &'a mut DescriptorAllocator<VulkanDescriptorBackend>,
    buffers: &'a SharedBuffers<GpuBuffer>,
    pipelines: &'a RenderPipelines,
    targets: FrameTargets,
    pass: Option<(PassKind, vk::DescriptorSet)>,
}

impl<'a> VulkanRecorder<'a> {
    /// # Safety
    /// The slot's command buffer must be recording and every handle in
    /// `targets`, `buffers` and `pipelines` must belong to `device`.
    pub unsafe fn new(
        device: &'a ash::Device,
        slot: &'a mut FrameSlot,
        buffers: &'a SharedBuffers<GpuBuffer>,
        pipelines: &'a RenderPipelines,
        targets: FrameTargets,
    ) -> Self {
        Self {
            device,
            cmd: slot.command_buffer,
            staging: &mut slot.staging,
            descriptors: &mut slot.descriptors,
            buffers,
            pipelines,
            targets,
            pass: None,
        }
    }

    fn buffer(&self, role: BufferRole) -> Result<vk::Buffer> {
        let handle = self.buffers.handle(role);
        if handle == vk::Buffer::null() {
            return Err(GpuError::InvalidState(format!(
                "no device buffer for {role:?}"
            )));
        }
        Ok(handle)
    }

    fn frame_uniforms_range() -> u64 {
        std::mem::size_of::<FrameUniforms>() as u64
    }

    fn set_viewport(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        // SAFETY: the command buffer is recording.
        unsafe {
            self.device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(self.cmd, 0, &[scissor]);
        }
    }

    fn geometry_buffers(&self) -> Result<(vk::Buffer, vk::Buffer)> {
        Ok((
            self.buffer(BufferRole::Vertices)?,
            self.buffer(BufferRole::Indices)?,
        ))
    }

    fn bind_geometry(&self, (vertices, indices): (vk::Buffer, vk::Buffer)) {
        // SAFETY: the command buffer is recording inside a render pass.
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.cmd, 0, &[vertices], &[0]);
            self.device
                .cmd_bind_index_buffer(self.cmd, indices, 0, vk::IndexType::UINT32);
        }
    }

    fn begin_shadow_pass(&mut self) -> Result<vk::DescriptorSet> {
        let targets = self.targets;
        let objects = self.buffer(BufferRole::Objects)?;
        let geometry = self.geometry_buffers()?;

        // The previous frame's main pass may still be sampling the map.
        let to_attachment = ImageBarrier::depth_attachment(targets.shadow_image).from(
            vk::PipelineStageFlags2::FRAGMENT_SHADER
                | vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );
        let depth = vk::RenderingAttachmentInfo::default()
            .image_view(targets.shadow_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: targets.shadow_extent,
            })
            .layer_count(1)
            .depth_attachment(&depth);

        let set = self.descriptors.allocate(self.pipelines.layouts.shadow)?;
        // SAFETY: the set is fresh and the command buffer is recording.
        unsafe {
            DescriptorWriter::new(set)
                .storage_buffer(0, objects)
                .buffer(
                    1,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    targets.uniforms,
                    0,
                    Self::frame_uniforms_range(),
                )
                .update(self.device);

            record_barriers(self.device, self.cmd, &[], &[to_attachment]);
            self.device.cmd_begin_rendering(self.cmd, &rendering);
        }
        self.set_viewport(targets.shadow_extent);

        let shadow = &self.pipelines.shadow;
        // SAFETY: recording inside the shadow pass.
        unsafe {
            self.device.cmd_bind_pipeline(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                shadow.pipeline,
            );
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                shadow.layout,
                0,
                &[set],
                &[],
            );
        }
        self.bind_geometry(geometry);
        Ok(set)
    }

    fn begin_main_pass(&mut self) -> Result<vk::DescriptorSet> {
        let targets = self.targets;
        let objects = self.buffer(BufferRole::Objects)?;
        let geometry = self.geometry_buffers()?;

        let color = vk::RenderingAttachmentInfo::default()
            .image_view(targets.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: targets.clear_color,
                },
            });
        let depth = vk::RenderingAttachmentInfo::default()
            .image_view(targets.depth_view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: targets.extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color))
            .depth_attachment(&depth);

        let set = self.descriptors.allocate(self.pipelines.layouts.mesh)?;
        // SAFETY: the set is fresh and the command buffer is recording.
        unsafe {
            DescriptorWriter::new(set)
                .storage_buffer(0, objects)
                .buffer(
                    1,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    targets.uniforms,
                    0,
                    Self::frame_uniforms_range(),
                )
                .combined_image_sampler(
                    2,
                    targets.shadow_view,
                    targets.shadow_sampler,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
                .update(self.device);

            record_barriers(
                self.device,
                self.cmd,
                &[],
                &[
                    ImageBarrier::acquire_to_color_attachment(targets.color_image),
                    ImageBarrier::depth_attachment(targets.depth_image),
                ],
            );
            self.device.cmd_begin_rendering(self.cmd, &rendering);
        }
        self.set_viewport(targets.extent);
        self.bind_geometry(geometry);
        Ok(set)
    }
}

impl FrameRecorder for VulkanRecorder<'_> {
    fn upload(&mut self, role: BufferRole, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let dst = self.buffer(role)?;
        let src_offset = self.staging.push(data)?;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset: offset,
            size: data.len() as u64,
        };
        // SAFETY: both buffers are live and the command buffer is recording.
        unsafe {
            self.device
                .cmd_copy_buffer(self.cmd, self.staging.buffer(), dst, &[region]);
        }
        Ok(())
    }

    fn fill(&mut self, role: BufferRole, range: BufferRange, value: u32) {
        if range.is_empty() {
            return;
        }
        let Ok(buffer) = self.buffer(role) else {
            tracing::warn!(?role, "fill of a missing buffer skipped");
            return;
        };
        // SAFETY: the buffer is live and the command buffer is recording.
        unsafe {
            self.device
                .cmd_fill_buffer(self.cmd, buffer, range.offset, range.size, value);
        }
    }

    fn barriers(&mut self, barriers: &[RangeBarrier]) {
        let recorded: Vec<_> = barriers
            .iter()
            .filter(|b| !b.range.is_empty())
            .filter_map(|b| {
                let buffer = self.buffers.handle(b.role);
                (buffer != vk::Buffer::null()).then(|| buffer_barrier(b, buffer))
            })
            .collect();
        // SAFETY: the command buffer is recording outside a render pass.
        unsafe { record_barriers(self.device, self.cmd, &recorded, &[]) };
    }

    fn dispatch_cull(&mut self, set: BucketSet, params: &CullParams, groups: u32) -> Result<()> {
        let objects = self.buffer(BufferRole::Objects)?;
        let geometries = self.buffer(BufferRole::Geometries)?;
        let commands = self.buffer(BufferRole::DrawCommands(set))?;
        let counts = self.buffer(BufferRole::DrawCounts(set))?;

        let descriptor_set = self.descriptors.allocate(self.pipelines.layouts.cull)?;
        // SAFETY: the set is fresh, the buffers are live and the command
        // buffer is recording outside a render pass.
        unsafe {
            DescriptorWriter::new(descriptor_set)
                .storage_buffer(0, objects)
                .storage_buffer(1, geometries)
                .storage_buffer(2, commands)
                .storage_buffer(3, counts)
                .update(self.device);
            self.pipelines.cull.dispatch(
                self.device,
                self.cmd,
                descriptor_set,
                bytemuck::bytes_of(params),
                groups,
            );
        }
        Ok(())
    }

    fn dispatch_skin(&mut self, params: &SkinParams, groups: u32) -> Result<()> {
        let bind_pose = self.buffer(BufferRole::BindPose)?;
        let influences = self.buffer(BufferRole::Influences)?;
        let joints = self.buffer(BufferRole::Joints)?;
        let vertices = self.buffer(BufferRole::Vertices)?;

        let descriptor_set = self.descriptors.allocate(self.pipelines.layouts.skin)?;
        // SAFETY: as in `dispatch_cull`.
        unsafe {
            DescriptorWriter::new(descriptor_set)
                .storage_buffer(0, bind_pose)
                .storage_buffer(1, influences)
                .storage_buffer(2, joints)
                .storage_buffer(3, vertices)
                .update(self.device);
            self.pipelines.skin.dispatch(
                self.device,
                self.cmd,
                descriptor_set,
                bytemuck::bytes_of(params),
                groups,
            );
        }
        Ok(())
    }

    fn begin_pass(&mut self, pass: PassKind) -> Result<()> {
        if let Some((open, _)) = self.pass {
            return Err(GpuError::InvalidState(format!(
                "cannot begin {pass:?} pass while {open:?} pass is open"
            )));
        }
        let set = match pass {
            PassKind::Shadow => self.begin_shadow_pass()?,
            PassKind::Main => self.begin_main_pass()?,
        };
        self.pass = Some((pass, set));
        Ok(())
    }

    fn draw_indirect_count(&mut self, draw: &IndirectDraw) {
        let Some((pass, set)) = self.pass else {
            tracing::warn!(bucket = draw.bucket, "indirect draw outside a render pass skipped");
            return;
        };
        let (Ok(commands), Ok(counts)) = (
            self.buffer(BufferRole::DrawCommands(draw.set)),
            self.buffer(BufferRole::DrawCounts(draw.set)),
        ) else {
            tracing::warn!(set = ?draw.set, "indirect draw without draw buffers skipped");
            return;
        };

        if pass == PassKind::Main {
            let bucket = draw.bucket as usize;
            let (Some(pipeline), Some(push)) = (
                self.pipelines.materials.get(bucket),
                self.pipelines.material_push.get(bucket),
            ) else {
                tracing::warn!(bucket, "no material pipeline for draw bucket");
                return;
            };
            // SAFETY: recording inside the main pass with a compatible set.
            unsafe {
                self.device.cmd_bind_pipeline(
                    self.cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.pipeline,
                );
                self.device.cmd_bind_descriptor_sets(
                    self.cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    &[set],
                    &[],
                );
                self.device.cmd_push_constants(
                    self.cmd,
                    pipeline.layout,
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(push),
                );
            }
        }

        // SAFETY: both buffers were written by the culling pass and made
        // visible to indirect reads before the pass began.
        unsafe {
            self.device.cmd_draw_indexed_indirect_count(
                self.cmd,
                commands,
                draw.commands.offset,
                counts,
                draw.count.offset,
                draw.max_draws,
                DrawCommand::STRIDE,
            );
        }
    }

    fn end_pass(&mut self) {
        let Some((pass, _)) = self.pass.take() else {
            return;
        };
        let after = match pass {
            PassKind::Shadow => ImageBarrier::depth_to_sampled(self.targets.shadow_image),
            PassKind::Main => ImageBarrier::color_attachment_to_present(self.targets.color_image),
        };
        // SAFETY: a pass begun by this recorder is open.
        unsafe {
            self.device.cmd_end_rendering(self.cmd);
            record_barriers(self.device, self.cmd, &[], &[after]);
        }
    }
}

impl Drop for VulkanRecorder<'_> {
    fn drop(&mut self) {
        if self.pass.is_some() {
            tracing::error!("frame recorder dropped with a render pass open");
            self.end_pass();
        }
    }
}
