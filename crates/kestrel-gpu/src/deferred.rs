//! Deferred destruction of resources that in-flight frames may still read.
//!
//! A resource retired during frame `n` is released once frame
//! `n + frames_in_flight` begins. By then every slot that could have recorded
//! a reference to it has had its fence observed.

use crate::error::Result;
use std::collections::VecDeque;

/// FIFO of retired items tagged with the frame they were retired in.
pub struct DeferredDeletionQueue<T> {
    pending: VecDeque<(u64, T)>,
    frames_in_flight: u64,
}

impl<T> DeferredDeletionQueue<T> {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight: frames_in_flight as u64,
        }
    }

    /// Retire `item` during `frame_number`.
    pub fn retire(&mut self, item: T, frame_number: u64) {
        debug_assert!(
            self.pending.back().map_or(true, |(frame, _)| *frame <= frame_number),
            "frame numbers must not decrease"
        );
        self.pending.push_back((frame_number, item));
    }

    /// Release every item that no in-flight frame can still reference.
    ///
    /// Returns how many items were released.
    pub fn process(
        &mut self,
        current_frame_number: u64,
        mut release: impl FnMut(T) -> Result<()>,
    ) -> Result<usize> {
        let mut released = 0;
        while let Some((frame, _)) = self.pending.front() {
            if frame + self.frames_in_flight > current_frame_number {
                break;
            }
            if let Some((_, item)) = self.pending.pop_front() {
                release(item)?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Release everything. Only valid once the device is idle.
    pub fn flush(&mut self, mut release: impl FnMut(T) -> Result<()>) -> Result<()> {
        while let Some((_, item)) = self.pending.pop_front() {
            release(item)?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_after_frames_in_flight() {
        let mut queue = DeferredDeletionQueue::<u32>::new(3);
        queue.retire(1, 10);
        queue.retire(2, 11);

        let mut freed = Vec::new();
        assert_eq!(queue.process(12, |x| { freed.push(x); Ok(()) }).unwrap(), 0);
        assert_eq!(queue.process(13, |x| { freed.push(x); Ok(()) }).unwrap(), 1);
        assert_eq!(freed, vec![1]);
        assert_eq!(queue.pending_count(), 1);

        assert_eq!(queue.process(14, |x| { freed.push(x); Ok(()) }).unwrap(), 1);
        assert_eq!(freed, vec![1, 2]);
    }

    #[test]
    fn flush_releases_everything() {
        let mut queue = DeferredDeletionQueue::<u32>::new(2);
        for i in 0..5 {
            queue.retire(i, 100);
        }
        let mut count = 0;
        queue.flush(|_| { count += 1; Ok(()) }).unwrap();
        assert_eq!(count, 5);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn release_errors_propagate() {
        let mut queue = DeferredDeletionQueue::<u32>::new(1);
        queue.retire(7, 0);
        let result = queue.process(5, |_| {
            Err(crate::error::GpuError::InvalidState("already freed".into()))
        });
        assert!(result.is_err());
    }
}
