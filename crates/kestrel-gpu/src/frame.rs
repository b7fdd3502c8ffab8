//! Frame pipeline: the per-slot acquire / record / submit / present protocol.
//!
//! Each of the N frame slots cycles `Idle -> Recording -> Submitted -> Idle`.
//! A slot's command buffer, staging memory and descriptor pools are only
//! reset after its fence has signaled, which lets the CPU record slot `i`
//! while the GPU is still retiring slots `i - 1 .. i - N + 1`.
//!
//! Device work is delegated to a [`FrameBackend`], so the protocol can be
//! driven against a simulated device in tests.

use crate::error::{GpuError, Result};
use kestrel_core::{GrowableArray, MemoryTag};

/// Result of waiting on a slot fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Result of acquiring a presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32 },
    /// The surface is out of date or suboptimal and must be rebuilt.
    Stale,
}

/// Result of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Stale,
}

/// Device operations the frame pipeline drives.
///
/// Every method addresses one frame slot by index. Errors returned from any
/// method other than the stale outcomes are fatal to the frame loop.
pub trait FrameBackend {
    /// Number of frame slots.
    fn slot_count(&self) -> usize;

    /// Block until the slot's fence signals or `timeout_ns` elapses.
    fn wait_for_fence(&mut self, slot: usize, timeout_ns: u64) -> Result<FenceWait>;

    fn reset_fence(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next image, signaling the slot's image-acquired semaphore.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Reset the slot's per-frame resources and begin its command buffer.
    fn begin_recording(&mut self, slot: usize) -> Result<()>;

    fn end_recording(&mut self, slot: usize) -> Result<()>;

    /// Submit the slot's command buffer, signaling its fence.
    fn submit(&mut self, slot: usize) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Recreate swap-surface resources. The device is idle when called.
    ///
    /// Returns `false` when the surface has no area and rebuilding must be
    /// retried later.
    fn rebuild_surface(&mut self) -> Result<bool>;

    /// Release every slot resource. Nothing is in flight when called; later
    /// calls do nothing.
    fn destroy(&mut self) -> Result<()>;
}

/// Lifecycle state of one frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    /// Submitted; its fence has not been observed signaled yet.
    Submitted,
}

#[derive(Debug, Clone, Copy)]
struct SlotRecord {
    state: SlotState,
    submissions: u64,
}

/// Drives frame slots through the frame protocol.
pub struct FramePipeline<B: FrameBackend> {
    backend: B,
    slots: GrowableArray<SlotRecord>,
    current: usize,
    frame_number: u64,
    image_index: u32,
    fence_timeout_ns: u64,
    rebuild_requested: bool,
    rebuilds: u64,
}

impl<B: FrameBackend> FramePipeline<B> {
    /// Wrap `backend`. Fence waits give up after `fence_timeout_ns`.
    pub fn new(backend: B, fence_timeout_ns: u64) -> Result<Self> {
        let count = backend.slot_count();
        if count == 0 {
            return Err(GpuError::InvalidUsage(
                "frame pipeline needs at least one frame slot".into(),
            ));
        }

        let mut slots = GrowableArray::with_capacity(count, MemoryTag::Renderer);
        slots.resize(
            count,
            SlotRecord {
                state: SlotState::Idle,
                submissions: 0,
            },
        );

        Ok(Self {
            backend,
            slots,
            current: 0,
            frame_number: 0,
            image_index: 0,
            fence_timeout_ns,
            rebuild_requested: false,
            rebuilds: 0,
        })
    }

    /// Begin a frame on the current slot.
    ///
    /// Returns `false` when the surface was rebuilt instead; the caller must
    /// skip this frame's draw work and not call [`Self::frame_end`].
    pub fn frame_begin(&mut self) -> Result<bool> {
        if self.rebuild_requested {
            self.rebuild()?;
            return Ok(false);
        }

        let slot = self.current;
        if self.slots[slot].state == SlotState::Recording {
            return Err(GpuError::InvalidState(format!(
                "frame slot {slot} is already recording"
            )));
        }

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.wait_fence", slot).entered();

            if self.backend.wait_for_fence(slot, self.fence_timeout_ns)? == FenceWait::TimedOut {
                tracing::error!(
                    slot,
                    frame = self.frame_number,
                    timeout_ns = self.fence_timeout_ns,
                    "frame fence wait timed out; the GPU appears hung"
                );
                return Err(GpuError::FenceTimeout {
                    slot,
                    timeout_ns: self.fence_timeout_ns,
                });
            }
        }
        self.slots[slot].state = SlotState::Idle;

        let outcome = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.acquire_image", slot).entered();
            self.backend.acquire_image(slot)?
        };
        match outcome {
            AcquireOutcome::Acquired { image_index } => self.image_index = image_index,
            AcquireOutcome::Stale => {
                tracing::debug!(slot, "surface stale on acquire");
                self.rebuild()?;
                return Ok(false);
            }
        }

        // Reset only after a successful acquire so an abandoned frame leaves
        // the fence signaled for the next wait.
        self.backend.reset_fence(slot)?;
        self.backend.begin_recording(slot)?;
        self.slots[slot].state = SlotState::Recording;
        Ok(true)
    }

    /// Finish the current frame: submit, present and advance the slot.
    ///
    /// Returns `false` when presentation reported a stale surface and it was
    /// rebuilt.
    pub fn frame_end(&mut self) -> Result<bool> {
        let slot = self.current;
        if self.slots[slot].state != SlotState::Recording {
            return Err(GpuError::InvalidState(format!(
                "frame_end on slot {slot} which is not recording"
            )));
        }

        self.backend.end_recording(slot)?;
        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.submit", slot).entered();
            self.backend.submit(slot)?;
        }
        let record = &mut self.slots[slot];
        record.state = SlotState::Submitted;
        record.submissions += 1;

        let outcome = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.present", slot).entered();
            self.backend.present(slot, self.image_index)?
        };

        self.frame_number += 1;
        self.current = (self.current + 1) % self.slots.len();

        if outcome == PresentOutcome::Stale {
            tracing::debug!(slot, "surface stale on present");
            self.rebuild()?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Ask for a surface rebuild at the next [`Self::frame_begin`].
    pub fn request_rebuild(&mut self) {
        self.rebuild_requested = true;
    }

    fn rebuild(&mut self) -> Result<()> {
        self.backend.wait_idle()?;
        for record in self.slots.iter_mut() {
            if record.state == SlotState::Submitted {
                record.state = SlotState::Idle;
            }
        }

        if self.backend.rebuild_surface()? {
            self.rebuild_requested = false;
            self.rebuilds += 1;
            tracing::info!(rebuilds = self.rebuilds, "rebuilt swap surface");
        } else {
            self.rebuild_requested = true;
            tracing::debug!("surface has no area; rebuild deferred");
        }
        Ok(())
    }

    /// Wait for all in-flight work. Call before tearing down resources.
    pub fn shutdown(&mut self) -> Result<()> {
        self.backend.wait_idle()?;
        for record in self.slots.iter_mut() {
            record.state = SlotState::Idle;
        }
        Ok(())
    }

    /// Wait for all in-flight work, then release the backend's slots.
    pub fn destroy(&mut self) -> Result<()> {
        self.shutdown()?;
        self.backend.destroy()
    }

    /// Index of the slot the next (or current) frame uses.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Image acquired by the current frame.
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    /// Submissions made from `slot` so far.
    pub fn submissions(&self, slot: usize) -> u64 {
        self.slots[slot].submissions
    }

    /// Surface rebuilds performed so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Whether the current slot is between `frame_begin` and `frame_end`.
    pub fn is_recording(&self) -> bool {
        self.slots[self.current].state == SlotState::Recording
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fence {
        Signaled,
        Reset,
        Pending,
    }

    /// Simulated device: submitted work completes when its fence is waited on.
    struct SimBackend {
        fences: Vec<Fence>,
        recording: Vec<bool>,
        waited: Vec<bool>,
        next_image: u32,
        stale_acquire_at: Option<u64>,
        stale_present_at: Option<u64>,
        hung: bool,
        zero_area: bool,
        acquires: u64,
        presents: u64,
        rebuilds: u32,
        destroyed: bool,
        log: Vec<String>,
    }

    impl SimBackend {
        fn new(slots: usize) -> Self {
            Self {
                fences: vec![Fence::Signaled; slots],
                recording: vec![false; slots],
                waited: vec![false; slots],
                next_image: 0,
                stale_acquire_at: None,
                stale_present_at: None,
                hung: false,
                zero_area: false,
                acquires: 0,
                presents: 0,
                rebuilds: 0,
                destroyed: false,
                log: Vec::new(),
            }
        }

        fn outstanding(&self, slot: usize) -> usize {
            usize::from(self.fences[slot] == Fence::Pending)
        }
    }

    impl FrameBackend for SimBackend {
        fn slot_count(&self) -> usize {
            self.fences.len()
        }

        fn wait_for_fence(&mut self, slot: usize, _timeout_ns: u64) -> Result<FenceWait> {
            if self.hung && self.fences[slot] == Fence::Pending {
                return Ok(FenceWait::TimedOut);
            }
            if self.fences[slot] == Fence::Pending {
                self.fences[slot] = Fence::Signaled;
            }
            assert_ne!(self.fences[slot], Fence::Reset, "waiting on a reset fence deadlocks");
            self.waited[slot] = true;
            Ok(FenceWait::Signaled)
        }

        fn reset_fence(&mut self, slot: usize) -> Result<()> {
            assert_eq!(self.fences[slot], Fence::Signaled);
            self.fences[slot] = Fence::Reset;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.acquires += 1;
            self.log.push(format!("acquire {slot}"));
            if self.stale_acquire_at == Some(self.acquires) {
                return Ok(AcquireOutcome::Stale);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % 4;
            Ok(AcquireOutcome::Acquired { image_index })
        }

        fn begin_recording(&mut self, slot: usize) -> Result<()> {
            assert!(self.waited[slot], "slot {slot} reused before its fence was observed");
            assert_eq!(self.fences[slot], Fence::Reset);
            self.recording[slot] = true;
            self.waited[slot] = false;
            Ok(())
        }

        fn end_recording(&mut self, slot: usize) -> Result<()> {
            assert!(self.recording[slot]);
            self.recording[slot] = false;
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            assert_eq!(self.outstanding(slot), 0, "second outstanding submission");
            self.fences[slot] = Fence::Pending;
            self.log.push(format!("submit {slot}"));
            Ok(())
        }

        fn present(&mut self, _slot: usize, _image_index: u32) -> Result<PresentOutcome> {
            self.presents += 1;
            if self.stale_present_at == Some(self.presents) {
                return Ok(PresentOutcome::Stale);
            }
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
            assert!(self.fences.iter().all(|f| *f != Fence::Pending));
            if self.zero_area {
                return Ok(false);
            }
            self.rebuilds += 1;
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

    fn run_frame(pipeline: &mut FramePipeline<SimBackend>) -> bool {
        if !pipeline.frame_begin().unwrap() {
            return false;
        }
        pipeline.frame_end().unwrap()
    }

    #[test]
    fn slots_rotate_and_fences_gate_reuse() {
        let mut pipeline = FramePipeline::new(SimBackend::new(3), 1_000_000).unwrap();
        for _ in 0..10 {
            assert!(run_frame(&mut pipeline));
        }

        assert_eq!(pipeline.frame_number(), 10);
        assert_eq!(pipeline.current_slot(), 1);
        assert_eq!(pipeline.submissions(0), 4);
        assert_eq!(pipeline.submissions(1), 3);
        assert_eq!(pipeline.submissions(2), 3);
        for slot in 0..3 {
            assert!(pipeline.backend().outstanding(slot) <= 1);
        }
    }

    #[test]
    fn slot_states_follow_the_protocol() {
        let mut pipeline = FramePipeline::new(SimBackend::new(2), 1_000).unwrap();
        assert_eq!(pipeline.slot_state(0), SlotState::Idle);

        assert!(pipeline.frame_begin().unwrap());
        assert_eq!(pipeline.slot_state(0), SlotState::Recording);
        assert!(pipeline.is_recording());

        assert!(pipeline.frame_end().unwrap());
        assert_eq!(pipeline.slot_state(0), SlotState::Submitted);
        assert_eq!(pipeline.current_slot(), 1);

        pipeline.shutdown().unwrap();
        assert_eq!(pipeline.slot_state(0), SlotState::Idle);
    }

    #[test]
    fn stale_acquire_skips_the_frame_and_keeps_the_fence() {
        let mut backend = SimBackend::new(3);
        backend.stale_acquire_at = Some(2);
        let mut pipeline = FramePipeline::new(backend, 1_000).unwrap();

        assert!(run_frame(&mut pipeline));
        assert!(!pipeline.frame_begin().unwrap());
        assert_eq!(pipeline.backend().rebuilds, 1);
        assert_eq!(pipeline.current_slot(), 1);
        assert_eq!(pipeline.frame_number(), 1);

        // The abandoned frame left the fence signaled, so the retry proceeds.
        assert!(run_frame(&mut pipeline));
        assert_eq!(pipeline.submissions(1), 1);
    }

    #[test]
    fn stale_present_rebuilds_after_submitting() {
        let mut backend = SimBackend::new(3);
        backend.stale_present_at = Some(1);
        let mut pipeline = FramePipeline::new(backend, 1_000).unwrap();

        assert!(pipeline.frame_begin().unwrap());
        assert!(!pipeline.frame_end().unwrap());
        assert_eq!(pipeline.rebuild_count(), 1);
        assert_eq!(pipeline.current_slot(), 1);
        assert!(run_frame(&mut pipeline));
    }

    #[test]
    fn zero_area_surface_defers_rebuild() {
        let mut backend = SimBackend::new(2);
        backend.zero_area = true;
        let mut pipeline = FramePipeline::new(backend, 1_000).unwrap();

        pipeline.request_rebuild();
        assert!(!pipeline.frame_begin().unwrap());
        assert!(!pipeline.frame_begin().unwrap());
        assert_eq!(pipeline.rebuild_count(), 0);

        pipeline.backend_mut().zero_area = false;
        assert!(!pipeline.frame_begin().unwrap());
        assert_eq!(pipeline.rebuild_count(), 1);
        assert!(run_frame(&mut pipeline));
    }

    #[test]
    fn fence_timeout_is_fatal() {
        let mut pipeline = FramePipeline::new(SimBackend::new(1), 10).unwrap();
        assert!(run_frame(&mut pipeline));

        pipeline.backend_mut().hung = true;
        let err = pipeline.frame_begin().unwrap_err();
        assert!(matches!(err, GpuError::FenceTimeout { slot: 0, timeout_ns: 10 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn frame_end_without_begin_is_rejected() {
        let mut pipeline = FramePipeline::new(SimBackend::new(2), 1_000).unwrap();
        assert!(matches!(
            pipeline.frame_end(),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn submission_precedes_reuse_of_a_slot() {
        let mut pipeline = FramePipeline::new(SimBackend::new(2), 1_000).unwrap();
        for _ in 0..4 {
            run_frame(&mut pipeline);
        }
        let log = &pipeline.backend().log;
        assert_eq!(
            log,
            &[
                "acquire 0", "submit 0", "acquire 1", "submit 1", "acquire 0", "submit 0",
                "acquire 1", "submit 1",
            ]
        );
    }

    #[test]
    fn destroy_drains_in_flight_work_first() {
        let mut pipeline = FramePipeline::new(SimBackend::new(3), 1_000).unwrap();
        for _ in 0..2 {
            run_frame(&mut pipeline);
        }
        assert_eq!(pipeline.backend().outstanding(0), 1);
        pipeline.destroy().unwrap();
        assert!(pipeline.backend().destroyed);
        assert_eq!(pipeline.slot_state(0), SlotState::Idle);
    }

    #[test]
    fn rejects_zero_slots() {
        assert!(FramePipeline::new(SimBackend::new(0), 1_000).is_err());
    }
}
