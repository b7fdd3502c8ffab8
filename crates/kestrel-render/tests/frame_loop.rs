//! End-to-end frame loop against a simulated device.
//!
//! Three frames in flight, ten frames of a static scene with five visible
//! draws on pipeline 0. The frame pipeline runs over a simulated backend
//! that models fences; the renderer's resources run over a simulated
//! allocator that tags exactly what it is asked to allocate; the frame plan
//! runs on the CPU reference recorder, which executes the culling shader and
//! checks barrier coverage.

use ash::vk;
use glam::{Vec2, Vec3};
use kestrel_core::{GrowableArray, MemoryTag, MemoryTracker};
use kestrel_gpu::{
    AcquireOutcome, FenceWait, FrameBackend, FramePipeline, GpuError, PresentOutcome, Result,
};
use kestrel_render::{
    shut_down_frame_loop, BucketSet, BufferRole, Camera, DirectionalLight, FrameInputs,
    FrameResources, GeometrySizes, GpuObject, ImageRole, MeshData, MeshInstance, PlanSummary,
    RecordedOp, ReferenceRecorder, RenderPlan, ResourceAllocator, ResourceLayout, Scene,
    Transform, Vertex,
};
use std::collections::HashMap;
use std::sync::Arc;

const FRAMES_IN_FLIGHT: usize = 3;
const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1280,
    height: 720,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fence {
    Signaled,
    Reset,
    Pending,
}

/// Device double whose submissions complete when their fence is waited on.
struct SimDevice {
    fences: Vec<Fence>,
    waited: Vec<bool>,
    max_outstanding: usize,
    next_image: u32,
    destroyed: bool,
}

impl SimDevice {
    fn new(slots: usize) -> Self {
        Self {
            fences: vec![Fence::Signaled; slots],
            waited: vec![false; slots],
            max_outstanding: 0,
            next_image: 0,
            destroyed: false,
        }
    }
}

impl FrameBackend for SimDevice {
    fn slot_count(&self) -> usize {
        self.fences.len()
    }

    fn wait_for_fence(&mut self, slot: usize, _timeout_ns: u64) -> Result<FenceWait> {
        assert_ne!(self.fences[slot], Fence::Reset, "waiting on a reset fence");
        self.fences[slot] = Fence::Signaled;
        self.waited[slot] = true;
        Ok(FenceWait::Signaled)
    }

    fn reset_fence(&mut self, slot: usize) -> Result<()> {
        assert_eq!(self.fences[slot], Fence::Signaled);
        self.fences[slot] = Fence::Reset;
        Ok(())
    }

    fn acquire_image(&mut self, _slot: usize) -> Result<AcquireOutcome> {
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % 3;
        Ok(AcquireOutcome::Acquired { image_index })
    }

    fn begin_recording(&mut self, slot: usize) -> Result<()> {
        assert!(self.waited[slot], "slot {slot} reused before its fence signaled");
        self.waited[slot] = false;
        Ok(())
    }

    fn end_recording(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        assert_eq!(self.fences[slot], Fence::Reset, "second outstanding submission");
        self.fences[slot] = Fence::Pending;
        let outstanding = self.fences.iter().filter(|f| **f == Fence::Pending).count();
        self.max_outstanding = self.max_outstanding.max(outstanding);
        Ok(())
    }

    fn present(&mut self, _slot: usize, _image_index: u32) -> Result<PresentOutcome> {
        Ok(PresentOutcome::Presented)
    }

    fn wait_idle(&mut self) -> Result<()> {
        for fence in &mut self.fences {
            if *fence == Fence::Pending {
                *fence = Fence::Signaled;
            }
        }
        Ok(())
    }

    fn rebuild_surface(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn destroy(&mut self) -> Result<()> {
        assert!(
            self.fences.iter().all(|f| *f != Fence::Pending),
            "slots destroyed with work in flight"
        );
        self.destroyed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct SimBuffer {
    id: u64,
    size: u64,
}

#[derive(Debug)]
struct SimImage {
    id: u64,
    extent: vk::Extent2D,
}

/// Allocator double: every allocation is tagged on the tracker and must be
/// released exactly once.
struct SimAllocator {
    tracker: Arc<MemoryTracker>,
    next_id: u64,
    live: HashMap<u64, (MemoryTag, u64)>,
}

impl SimAllocator {
    fn new(tracker: Arc<MemoryTracker>) -> Self {
        Self {
            tracker,
            next_id: 0,
            live: HashMap::new(),
        }
    }

    fn track(&mut self, tag: MemoryTag, bytes: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tracker.record_alloc(tag, bytes);
        self.live.insert(id, (tag, bytes));
        id
    }

    fn untrack(&mut self, id: u64) {
        let (tag, bytes) = self
            .live
            .remove(&id)
            .unwrap_or_else(|| panic!("allocation {id} released twice"));
        self.tracker.record_free(tag, bytes);
    }
}

impl ResourceAllocator for SimAllocator {
    type Buffer = SimBuffer;
    type Image = SimImage;

    fn allocate_buffer(&mut self, _role: BufferRole, size: u64) -> Result<SimBuffer> {
        let id = self.track(MemoryTag::GpuBuffer, size);
        Ok(SimBuffer { id, size })
    }

    fn allocate_uniforms(&mut self, _slot: usize, size: u64) -> Result<SimBuffer> {
        let id = self.track(MemoryTag::GpuBuffer, size);
        Ok(SimBuffer { id, size })
    }

    fn allocate_image(&mut self, _role: ImageRole, extent: vk::Extent2D) -> Result<SimImage> {
        let bytes = u64::from(extent.width) * u64::from(extent.height) * 4;
        let id = self.track(MemoryTag::GpuImage, bytes);
        Ok(SimImage { id, extent })
    }

    fn buffer_size(buffer: &SimBuffer) -> u64 {
        buffer.size
    }

    fn image_extent(image: &SimImage) -> vk::Extent2D {
        image.extent
    }

    fn release_buffer(&mut self, buffer: SimBuffer) -> Result<()> {
        self.untrack(buffer.id);
        Ok(())
    }

    fn release_image(&mut self, image: SimImage) -> Result<()> {
        self.untrack(image.id);
        Ok(())
    }
}

fn quad_strip(quads: u32) -> MeshData {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    for q in 0..quads {
        let x = q as f32;
        let base = vertices.len() as u32;
        vertices.extend([
            Vertex::new(Vec3::new(x - 0.5, -0.5, 0.0), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::new(x + 0.5, -0.5, 0.0), Vec3::Z, Vec2::X),
            Vertex::new(Vec3::new(x + 0.5, 0.5, 0.0), Vec3::Z, Vec2::ONE),
            Vertex::new(Vec3::new(x - 0.5, 0.5, 0.0), Vec3::Z, Vec2::Y),
        ]);
        indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    MeshData {
        vertices,
        indices,
        skin: None,
    }
}

fn static_scene() -> Scene {
    let mut scene = Scene::new(2);
    let mesh = scene.register_mesh(&quad_strip(1)).unwrap();
    for i in 0..5 {
        let x = i as f32 * 1.5 - 3.0;
        scene
            .add_mesh_node(
                None,
                &format!("quad_{i}"),
                Transform::from_translation(Vec3::new(x, 0.0, 0.0)),
                MeshInstance::new(mesh, 0),
            )
            .unwrap();
    }
    scene
}

/// The frame loop as the renderer drives it, with the reference recorder in
/// place of command buffers.
struct Harness {
    tracker: Arc<MemoryTracker>,
    frames: FramePipeline<SimDevice>,
    resources: FrameResources<SimAllocator>,
    plan: RenderPlan,
    recorder: ReferenceRecorder,
    objects: GrowableArray<GpuObject>,
    camera: Camera,
    light: DirectionalLight,
    extent: vk::Extent2D,
}

impl Harness {
    fn new(pipelines: u32, max_objects: u64) -> Self {
        let tracker = Arc::new(MemoryTracker::new());
        let frames = FramePipeline::new(SimDevice::new(FRAMES_IN_FLIGHT), 2_000_000_000).unwrap();
        let plan = RenderPlan::new(pipelines, 64).unwrap();
        let object_bytes = max_objects * std::mem::size_of::<GpuObject>() as u64;
        let resources = FrameResources::new(
            SimAllocator::new(Arc::clone(&tracker)),
            &ResourceLayout {
                frames_in_flight: FRAMES_IN_FLIGHT,
                uniform_size: 256,
                extent: EXTENT,
                shadow_map_size: 1024,
            },
            std::iter::once((BufferRole::Objects, object_bytes)).chain(plan.draw_buffer_sizes()),
        )
        .unwrap();
        Self {
            tracker,
            frames,
            resources,
            plan,
            recorder: ReferenceRecorder::new(),
            objects: GrowableArray::new(MemoryTag::Renderer),
            camera: Camera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO),
            light: DirectionalLight::default(),
            extent: EXTENT,
        }
    }

    /// One full frame. Returns the summary and how many retired resources
    /// were released at its start.
    fn frame(&mut self, scene: &mut Scene) -> (PlanSummary, usize) {
        assert!(self.frames.frame_begin().expect("fence wait within timeout"));
        let frame = self.frames.frame_number();
        let released = self.resources.collect(frame).unwrap();

        scene.update_transforms();
        scene.object_table(&mut self.objects);
        let jobs = scene.skin_jobs();

        let object_bytes = std::mem::size_of_val(self.objects.as_slice()) as u64;
        let required = std::iter::once((BufferRole::Objects, object_bytes))
            .chain(GeometrySizes::of(scene.meshes()).by_role());
        self.resources
            .prepare(frame, required, self.extent, &mut self.plan)
            .unwrap();

        self.recorder.begin_frame();
        let summary = self
            .plan
            .record(
                &mut self.recorder,
                &FrameInputs {
                    objects: &self.objects,
                    meshes: scene.meshes(),
                    skin_jobs: &jobs,
                    camera: self.camera.frustum(),
                    light: self.light.frustum(),
                },
            )
            .unwrap();

        // Every device buffer the plan wrote fits the one the resources hold.
        for role in [
            BufferRole::Objects,
            BufferRole::Geometries,
            BufferRole::Vertices,
            BufferRole::Indices,
            BufferRole::DrawCommands(BucketSet::Main),
            BufferRole::DrawCounts(BucketSet::Main),
            BufferRole::DrawCommands(BucketSet::Shadow),
            BufferRole::DrawCounts(BucketSet::Shadow),
        ] {
            let written = self.recorder.buffer(role).len() as u64;
            let held = self
                .resources
                .buffers()
                .get(role)
                .map_or(0, SimAllocator::buffer_size);
            assert!(held >= written, "{role:?}: {written} bytes into {held}");
        }
        assert!(
            self.recorder.hazards().is_empty(),
            "frame {frame}: {:?}",
            self.recorder.hazards()
        );

        assert!(self.frames.frame_end().unwrap());
        (summary, released)
    }

    fn live(&self, tag: MemoryTag) -> u64 {
        self.tracker.usage(tag).allocations
    }
}

#[test]
fn ten_frames_of_a_static_scene() {
    let mut harness = Harness::new(2, 5);
    let mut scene = static_scene();

    for frame in 0..10u64 {
        assert_eq!(
            harness.frames.current_slot(),
            (frame % FRAMES_IN_FLIGHT as u64) as usize
        );
        let (summary, released) = harness.frame(&mut scene);
        assert_eq!(summary.objects, 5);
        assert_eq!(summary.geometry_uploaded, frame == 0);
        assert_eq!(released, 0);

        // The main counters are zeroed, then culling raises bucket 0 to five.
        let recorder = &harness.recorder;
        let main_counts = BufferRole::DrawCounts(BucketSet::Main);
        let zeroed = recorder
            .ops()
            .iter()
            .position(|op| {
                matches!(op, RecordedOp::Fill { role, value: 0, .. } if *role == main_counts)
            })
            .expect("main counters are cleared every frame");
        let culled = recorder
            .ops()
            .iter()
            .position(|op| matches!(op, RecordedOp::Cull { set: BucketSet::Main, .. }))
            .expect("main culling runs every frame");
        assert!(zeroed < culled);
        let RecordedOp::Cull { counts_after, .. } = &recorder.ops()[culled] else {
            unreachable!();
        };
        assert_eq!(counts_after, &vec![5, 0]);

        assert_eq!(recorder.count(BucketSet::Main, 0), 5);
        assert_eq!(recorder.count(BucketSet::Main, 1), 0);
        assert_eq!(recorder.count(BucketSet::Shadow, 0), 5);
        let main_draw = recorder
            .draws()
            .iter()
            .find(|d| d.set == BucketSet::Main && d.bucket == 0)
            .unwrap();
        assert_eq!(main_draw.count, 5);
        assert_eq!(main_draw.index_total(), 30);
    }

    // A static scene never replaces anything.
    assert_eq!(harness.resources.pending_release(), 0);

    let frames = &harness.frames;
    assert_eq!(frames.frame_number(), 10);
    assert_eq!(frames.submissions(0), 4);
    assert_eq!(frames.submissions(1), 3);
    assert_eq!(frames.submissions(2), 3);
    assert!(frames.backend().max_outstanding <= FRAMES_IN_FLIGHT);
    assert!(harness.live(MemoryTag::GpuBuffer) > 0);
    assert_eq!(harness.live(MemoryTag::GpuImage), 2);

    shut_down_frame_loop(
        &mut harness.frames,
        &mut harness.resources,
        &harness.tracker,
    )
    .unwrap();
    assert!(harness.frames.backend().destroyed);
    assert!(harness.resources.allocator().live.is_empty());
    assert!(harness.tracker.is_clear(&MemoryTag::GPU));

    // A second teardown finds nothing left to release.
    shut_down_frame_loop(
        &mut harness.frames,
        &mut harness.resources,
        &harness.tracker,
    )
    .unwrap();
}

#[test]
fn replaced_buffers_outlive_the_frames_that_read_them() {
    let mut harness = Harness::new(2, 8);
    let mut scene = static_scene();
    for _ in 0..3 {
        harness.frame(&mut scene);
    }
    let buffers_before = harness.live(MemoryTag::GpuBuffer);

    // A much larger mesh outgrows the vertex and index buffers.
    let strip = scene.register_mesh(&quad_strip(64)).unwrap();
    scene
        .add_mesh_node(None, "strip", Transform::IDENTITY, MeshInstance::new(strip, 1))
        .unwrap();
    let (summary, _) = harness.frame(&mut scene);
    assert!(summary.geometry_uploaded);
    let retired = harness.resources.pending_release();
    assert!(retired >= 2, "vertex and index buffers were replaced");
    assert_eq!(
        harness.live(MemoryTag::GpuBuffer),
        buffers_before + retired as u64
    );

    // Frames 4 and 5 may still be reading them; frame 6 starts after the
    // frame that replaced them has retired.
    for _ in 4..6 {
        let (summary, released) = harness.frame(&mut scene);
        assert_eq!(released, 0);
        assert!(!summary.geometry_uploaded);
    }
    let (_, released) = harness.frame(&mut scene);
    assert_eq!(released, retired);
    assert_eq!(harness.resources.pending_release(), 0);
    assert_eq!(harness.live(MemoryTag::GpuBuffer), buffers_before);

    shut_down_frame_loop(
        &mut harness.frames,
        &mut harness.resources,
        &harness.tracker,
    )
    .unwrap();
    assert!(harness.tracker.is_clear(&MemoryTag::GPU));
}

#[test]
fn resizing_retires_the_old_depth_target() {
    let mut harness = Harness::new(2, 8);
    let mut scene = static_scene();
    harness.frame(&mut scene);

    harness.extent = vk::Extent2D {
        width: 800,
        height: 600,
    };
    harness.frame(&mut scene);
    assert_eq!(harness.resources.pending_release(), 1);
    assert_eq!(harness.live(MemoryTag::GpuImage), 3);
    assert_eq!(
        SimAllocator::image_extent(harness.resources.depth().unwrap()),
        harness.extent
    );

    // Teardown releases what is still waiting for its frame.
    shut_down_frame_loop(
        &mut harness.frames,
        &mut harness.resources,
        &harness.tracker,
    )
    .unwrap();
    assert_eq!(harness.live(MemoryTag::GpuImage), 0);
    assert!(harness.tracker.is_clear(&MemoryTag::GPU));
}

#[test]
fn growing_geometry_buffers_forces_a_new_upload() {
    let mut harness = Harness::new(2, 8);
    let mut scene = static_scene();
    harness.frame(&mut scene);
    assert!(!harness.plan.needs_geometry_upload(scene.meshes()));

    // More objects than the object table was sized for: no geometry upload.
    let frame = harness.frames.frame_number();
    let objects = 64 * std::mem::size_of::<GpuObject>() as u64;
    harness
        .resources
        .prepare(frame, [(BufferRole::Objects, objects)], EXTENT, &mut harness.plan)
        .unwrap();
    assert!(!harness.plan.needs_geometry_upload(scene.meshes()));

    harness
        .resources
        .prepare(frame, [(BufferRole::Vertices, 1 << 16)], EXTENT, &mut harness.plan)
        .unwrap();
    assert!(harness.plan.needs_geometry_upload(scene.meshes()));
    assert_eq!(harness.resources.pending_release(), 2);

    shut_down_frame_loop(
        &mut harness.frames,
        &mut harness.resources,
        &harness.tracker,
    )
    .unwrap();
}

#[test]
fn allocations_outside_the_renderer_fail_shutdown() {
    let mut harness = Harness::new(2, 8);
    let mut scene = static_scene();
    harness.frame(&mut scene);

    let mut stray_allocator = SimAllocator::new(Arc::clone(&harness.tracker));
    let stray = stray_allocator
        .allocate_buffer(BufferRole::Joints, 512)
        .unwrap();

    let result = shut_down_frame_loop(
        &mut harness.frames,
        &mut harness.resources,
        &harness.tracker,
    );
    assert!(matches!(result, Err(GpuError::InvalidState(_))));
    // Everything the renderer owned was still released.
    assert!(harness.resources.allocator().live.is_empty());

    stray_allocator.release_buffer(stray).unwrap();
    assert!(harness.tracker.is_clear(&MemoryTag::GPU));
}

#[test]
fn failed_setup_releases_what_it_allocated() {
    struct NoImages(SimAllocator);

    impl ResourceAllocator for NoImages {
        type Buffer = SimBuffer;
        type Image = SimImage;

        fn allocate_buffer(&mut self, role: BufferRole, size: u64) -> Result<SimBuffer> {
            self.0.allocate_buffer(role, size)
        }

        fn allocate_uniforms(&mut self, slot: usize, size: u64) -> Result<SimBuffer> {
            self.0.allocate_uniforms(slot, size)
        }

        fn allocate_image(&mut self, _role: ImageRole, _extent: vk::Extent2D) -> Result<SimImage> {
            Err(GpuError::AllocationFailed("out of device memory".into()))
        }

        fn buffer_size(buffer: &SimBuffer) -> u64 {
            buffer.size
        }

        fn image_extent(image: &SimImage) -> vk::Extent2D {
            image.extent
        }

        fn release_buffer(&mut self, buffer: SimBuffer) -> Result<()> {
            self.0.release_buffer(buffer)
        }

        fn release_image(&mut self, image: SimImage) -> Result<()> {
            self.0.release_image(image)
        }
    }

    let tracker = Arc::new(MemoryTracker::new());
    let result = FrameResources::new(
        NoImages(SimAllocator::new(Arc::clone(&tracker))),
        &ResourceLayout {
            frames_in_flight: FRAMES_IN_FLIGHT,
            uniform_size: 256,
            extent: EXTENT,
            shadow_map_size: 1024,
        },
        [(BufferRole::Objects, 1024)],
    );
    assert!(matches!(result, Err(GpuError::AllocationFailed(_))));
    assert!(tracker.is_clear(&MemoryTag::GPU));
}

#[test]
fn empty_scene_issues_no_indices() {
    let mut harness = Harness::new(3, 16);
    let mut scene = Scene::new(3);

    for _ in 0..4 {
        let (summary, _) = harness.frame(&mut scene);
        assert_eq!(summary.objects, 0);
        for bucket in 0..3 {
            assert_eq!(harness.recorder.count(BucketSet::Main, bucket), 0);
        }
        assert!(harness
            .recorder
            .draws()
            .iter()
            .all(|d| d.index_total() == 0));
    }
    shut_down_frame_loop(
        &mut harness.frames,
        &mut harness.resources,
        &harness.tracker,
    )
    .unwrap();
    assert!(harness.tracker.is_clear(&MemoryTag::GPU));
}
