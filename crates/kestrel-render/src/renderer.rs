//! The renderer context: device, frame pipeline and every GPU resource the
//! frame plan records against.
//!
//! The application drives it once per frame:
//!
//! ```text
//! if renderer.frame_begin()? {
//!     renderer.render(&mut scene, &camera, &light)?;
//!     renderer.frame_end()?;
//! }
//! ```
//!
//! `frame_begin` returning `false` means the swap surface was rebuilt and the
//! frame must be skipped.

use crate::camera::{Camera, DirectionalLight};
use crate::config::RendererConfig;
use crate::gpu_types::{FrameUniforms, GpuObject};
use crate::pipelines::RenderPipelines;
use crate::plan::{FrameInputs, GeometrySizes, PlanSummary, RenderPlan};
use crate::recorder::{BucketSet, BufferRole};
use crate::resources::{shut_down_frame_loop, DeviceAllocator, FrameResources, ResourceLayout};
use crate::scene::Scene;
use crate::vulkan_recorder::{FrameTargets, VulkanRecorder};
use ash::vk;
use kestrel_core::{GrowableArray, MemoryTag, MemoryTracker};
use kestrel_gpu::{
    record_barriers, FramePipeline, GpuContext, GpuContextBuilder, GpuError, ImageBarrier, Result,
    SurfaceContext, VulkanFrameBackend,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

unsafe fn create_shadow_sampler(device: &ash::Device) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::NEAREST)
        .min_filter(vk::Filter::NEAREST)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
        .max_lod(1.0);
    Ok(unsafe { device.create_sampler(&info, None)? })
}

/// Renderer state threaded through the frame loop.
pub struct Renderer {
    config: RendererConfig,
    gpu: Arc<GpuContext>,
    frames: FramePipeline<VulkanFrameBackend>,
    pipelines: RenderPipelines,
    resources: FrameResources<DeviceAllocator>,
    shadow_sampler: vk::Sampler,
    plan: RenderPlan,
    objects: GrowableArray<GpuObject>,
    rendered_this_frame: bool,
    last_summary: PlanSummary,
    shut_down: bool,
}

impl Renderer {
    /// Create the device, swap surface, frame slots and every pipeline.
    ///
    /// `framebuffer_size` is the window's size in physical pixels.
    pub fn initialize<W>(
        config: RendererConfig,
        window: &W,
        framebuffer_size: (u32, u32),
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        config.validate()?;
        let shaders = config.shaders.load().map_err(|e| {
            tracing::error!("failed to load shaders: {e}");
            GpuError::ShaderCompilation(e.to_string())
        })?;

        let gpu = Arc::new(
            GpuContextBuilder::new()
                .app_name(config.app_name.clone())
                .validation(config.validation)
                .tracker(Arc::new(MemoryTracker::new()))
                .build_for_display(window)?,
        );
        tracing::info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: the window outlives the renderer; the caller keeps it alive.
        let surface = unsafe { SurfaceContext::from_window(&gpu, window)? };
        let backend = VulkanFrameBackend::new(
            Arc::clone(&gpu),
            surface,
            framebuffer_size,
            config.vsync,
            config.frames_in_flight,
            config.staging_size,
            &config.descriptors,
        )?;
        let color_format = backend.swapchain().format;
        let extent = backend.swapchain().extent;
        let frames = FramePipeline::new(backend, config.fence_timeout_ns)?;

        let device = gpu.device();
        // SAFETY: the device supports dynamic rendering (required at creation).
        let pipelines =
            unsafe { RenderPipelines::new(device, &shaders, &config.materials, color_format)? };
        let plan = RenderPlan::new(config.pipeline_count(), config.max_draws_per_pipeline)?;

        let object_bytes =
            u64::from(config.max_objects) * std::mem::size_of::<GpuObject>() as u64;
        let resources = FrameResources::new(
            DeviceAllocator::new(Arc::clone(&gpu)),
            &ResourceLayout {
                frames_in_flight: config.frames_in_flight,
                uniform_size: std::mem::size_of::<FrameUniforms>() as u64,
                extent,
                shadow_map_size: config.shadow_map_size,
            },
            std::iter::once((BufferRole::Objects, object_bytes)).chain(plan.draw_buffer_sizes()),
        )?;
        // SAFETY: created on this device, destroyed in `shutdown`.
        let shadow_sampler = unsafe { create_shadow_sampler(device)? };

        tracing::info!(
            frames_in_flight = config.frames_in_flight,
            pipelines = config.pipeline_count(),
            max_draws = config.max_draws_per_pipeline,
            shadow_map = config.shadow_map_size,
            "renderer initialized"
        );

        Ok(Self {
            objects: GrowableArray::with_capacity(config.max_objects as usize, MemoryTag::Renderer),
            config,
            gpu,
            frames,
            pipelines,
            resources,
            shadow_sampler,
            plan,
            rendered_this_frame: false,
            last_summary: PlanSummary::default(),
            shut_down: false,
        })
    }

    fn ensure_running(&self, operation: &str) -> Result<()> {
        if self.shut_down {
            return Err(GpuError::InvalidState(format!(
                "{operation} after renderer shutdown"
            )));
        }
        Ok(())
    }

    /// Wait for the current slot's fence and acquire a swapchain image.
    ///
    /// Returns `false` when the surface was rebuilt instead; skip `render`
    /// and `frame_end` for this frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn frame_begin(&mut self) -> Result<bool> {
        self.ensure_running("frame_begin")?;
        if !self.frames.frame_begin()? {
            return Ok(false);
        }

        let released = self.resources.collect(self.frames.frame_number())?;
        if released > 0 {
            tracing::trace!(released, "freed retired resources");
        }
        self.rendered_this_frame = false;
        Ok(true)
    }

    /// Record the frame: object table upload, skinning, culling, shadow and
    /// main passes.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn render(
        &mut self,
        scene: &mut Scene,
        camera: &Camera,
        light: &DirectionalLight,
    ) -> Result<PlanSummary> {
        self.ensure_running("render")?;
        if !self.frames.is_recording() {
            return Err(GpuError::InvalidState(
                "render called outside frame_begin / frame_end".into(),
            ));
        }
        if self.rendered_this_frame {
            return Err(GpuError::InvalidUsage(
                "render called twice in one frame".into(),
            ));
        }
        if scene.pipeline_count() > self.config.pipeline_count() {
            tracing::warn!(
                scene = scene.pipeline_count(),
                renderer = self.config.pipeline_count(),
                "scene uses more pipelines than the renderer has"
            );
            return Err(GpuError::InvalidUsage(format!(
                "scene uses {} pipelines, renderer was configured with {}",
                scene.pipeline_count(),
                self.config.pipeline_count()
            )));
        }

        scene.update_transforms();
        scene.object_table(&mut self.objects);
        let skin_jobs = scene.skin_jobs();

        let object_bytes = std::mem::size_of_val(self.objects.as_slice()) as u64;
        let required = std::iter::once((BufferRole::Objects, object_bytes))
            .chain(GeometrySizes::of(scene.meshes()).by_role());
        let extent = self.frames.backend().swapchain().extent;
        self.resources
            .prepare(self.frames.frame_number(), required, extent, &mut self.plan)?;

        let slot_index = self.frames.current_slot();
        let uniforms = self.resources.uniforms(slot_index)?;
        uniforms.write(&[FrameUniforms::new(camera, light)])?;

        let image_index = self.frames.image_index() as usize;
        let swapchain = self.frames.backend().swapchain();
        let depth = self.resources.depth()?;
        let shadow_map = self.resources.shadow_map()?;
        let targets = FrameTargets {
            color_image: swapchain.images[image_index],
            color_view: swapchain.image_views[image_index],
            extent: swapchain.extent,
            depth_image: depth.image,
            depth_view: depth.view,
            shadow_image: shadow_map.image,
            shadow_view: shadow_map.view,
            shadow_extent: shadow_map.extent_2d(),
            shadow_sampler: self.shadow_sampler,
            uniforms: uniforms.buffer,
            clear_color: self.config.clear_color,
        };

        let device = self.gpu.device();
        let slot = self.frames.backend_mut().slot_mut(slot_index);
        // SAFETY: the slot is recording and every handle belongs to `device`.
        let mut recorder = unsafe {
            VulkanRecorder::new(
                device,
                slot,
                self.resources.buffers(),
                &self.pipelines,
                targets,
            )
        };
        let summary = self.plan.record(
            &mut recorder,
            &FrameInputs {
                objects: &self.objects,
                meshes: scene.meshes(),
                skin_jobs: &skin_jobs,
                camera: camera.frustum(),
                light: light.frustum(),
            },
        )?;
        drop(recorder);

        self.rendered_this_frame = true;
        self.last_summary = summary;
        tracing::trace!(
            frame = self.frames.frame_number(),
            objects = summary.objects,
            skin_jobs = summary.skin_jobs,
            "recorded frame"
        );
        Ok(summary)
    }

    /// Submit and present the frame.
    ///
    /// Returns `false` when presentation found the surface stale and it was
    /// rebuilt.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn frame_end(&mut self) -> Result<bool> {
        self.ensure_running("frame_end")?;
        if self.frames.is_recording() && !self.rendered_this_frame {
            self.record_present_only();
        }
        self.frames.frame_end()
    }

    /// Bring the acquired image into the present layout without drawing.
    fn record_present_only(&mut self) {
        let image_index = self.frames.image_index() as usize;
        let image = self.frames.backend().swapchain().images[image_index];
        let cmd = self
            .frames
            .backend()
            .slot(self.frames.current_slot())
            .command_buffer;
        // SAFETY: the slot's command buffer is recording.
        unsafe {
            record_barriers(
                self.gpu.device(),
                cmd,
                &[],
                &[
                    ImageBarrier::acquire_to_color_attachment(image),
                    ImageBarrier::color_attachment_to_present(image),
                ],
            );
        }
    }

    /// Rebuild the swap surface at the next `frame_begin`.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.frames.backend_mut().set_framebuffer_size(width, height);
        self.frames.request_rebuild();
        tracing::debug!(width, height, "resize requested");
    }

    /// Wait for the GPU and release every resource.
    ///
    /// Calling it again is a no-op. Fails with [`GpuError::InvalidState`]
    /// when tagged GPU allocations are still live afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        tracing::info!(frames = self.frames.frame_number(), "renderer shutting down");

        self.frames.shutdown()?;
        let device = self.gpu.device();
        // SAFETY: the device is idle.
        unsafe {
            device.destroy_sampler(self.shadow_sampler, None);
            self.pipelines.destroy(device);
        }
        self.objects.clear();

        shut_down_frame_loop(&mut self.frames, &mut self.resources, self.gpu.tracker())?;
        tracing::info!("renderer shut down cleanly");
        Ok(())
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    /// Tracker of the renderer's tagged GPU allocations.
    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        self.gpu.tracker()
    }

    /// Frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.frames_in_flight()
    }

    /// Submissions made from each frame slot.
    pub fn submissions_per_slot(&self) -> Vec<u64> {
        (0..self.frames.frames_in_flight())
            .map(|slot| self.frames.submissions(slot))
            .collect()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.frames.rebuild_count()
    }

    /// What the last recorded frame contained.
    pub fn last_summary(&self) -> PlanSummary {
        self.last_summary
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> (u32, u32) {
        let extent = self.frames.backend().swapchain().extent;
        (extent.width, extent.height)
    }

    /// Draw buffer capacity of `set`.
    pub fn max_draws(&self, set: BucketSet) -> u32 {
        match set {
            BucketSet::Main => self.plan.main().layout().max_draws(),
            BucketSet::Shadow => self.plan.shadow().layout().max_draws(),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("renderer shutdown failed: {e}");
        }
    }
}
