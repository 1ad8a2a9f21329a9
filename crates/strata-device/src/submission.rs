use std::hash::Hash;
use std::time::Duration;

use crate::error::{DeviceError, DeviceResult};

/// Bound on every fence wait. Hitting it is fatal.
pub const FENCE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    /// Command buffers ready for a new command list.
    pub free_buffers: usize,
    /// Submissions whose fence has not been observed yet.
    pub in_flight: usize,
    /// Released command buffers waiting on their fence.
    pub pending_buffers: usize,
    /// Released descriptor sets waiting on their fence.
    pub pending_sets: usize,
}

struct InFlight<B, F> {
    buffer: B,
    fence: F,
}

/// Fence bookkeeping for command buffers and the descriptor sets they hold.
///
/// Nothing is reclaimed in the background: released resources whose buffer
/// is still in flight stay pending until [`sync_with`](Self::sync_with).
pub struct SubmissionTracker<B, S, F> {
    free_buffers: Vec<B>,
    in_flight: Vec<InFlight<B, F>>,
    pending_buffers: Vec<B>,
    pending_sets: Vec<S>,
}

impl<B, S, F> Default for SubmissionTracker<B, S, F> {
    fn default() -> Self {
        Self {
            free_buffers: Vec::new(),
            in_flight: Vec::new(),
            pending_buffers: Vec::new(),
            pending_sets: Vec::new(),
        }
    }
}

impl<B: Copy + Eq + Hash + std::fmt::Debug, S, F> SubmissionTracker<B, S, F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuses a free command buffer or creates a new one.
    pub fn acquire_buffer(&mut self, create: impl FnOnce() -> B) -> B {
        self.free_buffers.pop().unwrap_or_else(create)
    }

    pub fn is_in_flight(&self, buffer: B) -> bool {
        self.in_flight.iter().any(|f| f.buffer == buffer)
    }

    pub fn mark_submitted(&mut self, buffer: B, fence: F) -> DeviceResult<()> {
        if self.is_in_flight(buffer) {
            return Err(DeviceError::precondition(format!(
                "command buffer {buffer:?} is already in flight"
            )));
        }
        self.in_flight.push(InFlight { buffer, fence });
        Ok(())
    }

    /// Hands a command buffer and its descriptor sets back.
    ///
    /// Returns the sets that may be recycled right away; sets of an in-flight
    /// buffer are held until the next sync.
    pub fn release(&mut self, buffer: B, sets: Vec<S>) -> Vec<S> {
        if self.is_in_flight(buffer) {
            self.pending_buffers.push(buffer);
            self.pending_sets.extend(sets);
            Vec::new()
        } else {
            self.free_buffers.push(buffer);
            sets
        }
    }

    /// Waits on every in-flight fence, then frees what was pending.
    ///
    /// Returns the descriptor sets that became reusable. On a failed wait
    /// nothing is reclaimed.
    pub fn sync_with(&mut self, mut wait: impl FnMut(&F) -> DeviceResult<()>) -> DeviceResult<Vec<S>> {
        for entry in &self.in_flight {
            wait(&entry.fence)?;
        }

        let fences = self.in_flight.len();
        self.in_flight.clear();
        self.free_buffers.append(&mut self.pending_buffers);
        let sets = std::mem::take(&mut self.pending_sets);

        if fences > 0 {
            log::trace!("reclaimed {fences} submissions, {} descriptor sets", sets.len());
        }
        Ok(sets)
    }

    pub fn stats(&self) -> SubmissionStats {
        SubmissionStats {
            free_buffers: self.free_buffers.len(),
            in_flight: self.in_flight.len(),
            pending_buffers: self.pending_buffers.len(),
            pending_sets: self.pending_sets.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Tracker = SubmissionTracker<u32, u32, u64>;

    fn submit_n(tracker: &mut Tracker, next: &mut u32, n: u32) -> Vec<u32> {
        (0..n)
            .map(|i| {
                let buf = tracker.acquire_buffer(|| {
                    *next += 1;
                    *next - 1
                });
                tracker.mark_submitted(buf, u64::from(i)).unwrap();
                let freed = tracker.release(buf, vec![100 + i]);
                assert!(freed.is_empty());
                buf
            })
            .collect()
    }

    // ── submission ────────────────────────────────────────────────────────

    #[test]
    fn sync_returns_every_buffer_and_set() {
        let mut tracker = Tracker::new();
        let mut next = 0;
        let bufs = submit_n(&mut tracker, &mut next, 5);

        let mut waited = Vec::new();
        let mut sets = tracker
            .sync_with(|fence| {
                waited.push(*fence);
                Ok(())
            })
            .unwrap();
        sets.sort();

        assert_eq!(waited, vec![0, 1, 2, 3, 4]);
        assert_eq!(sets, vec![100, 101, 102, 103, 104]);
        assert_eq!(
            tracker.stats(),
            SubmissionStats { free_buffers: bufs.len(), ..Default::default() }
        );
    }

    #[test]
    fn in_flight_buffers_are_not_reused_before_sync() {
        let mut tracker = Tracker::new();
        let mut next = 0;
        let bufs = submit_n(&mut tracker, &mut next, 3);

        let fresh = tracker.acquire_buffer(|| 77);
        assert!(!bufs.contains(&fresh));
        assert_eq!(tracker.stats().pending_sets, 3);

        tracker.sync_with(|_| Ok(())).unwrap();
        let reused = tracker.acquire_buffer(|| 78);
        assert!(bufs.contains(&reused));
    }

    #[test]
    fn released_idle_buffer_returns_its_sets_immediately() {
        let mut tracker = Tracker::new();
        let buf = tracker.acquire_buffer(|| 1);
        assert_eq!(tracker.release(buf, vec![5, 6]), vec![5, 6]);
        assert_eq!(tracker.stats().free_buffers, 1);
    }

    #[test]
    fn double_submission_is_rejected() {
        let mut tracker = Tracker::new();
        tracker.mark_submitted(1, 10).unwrap();
        assert!(tracker.mark_submitted(1, 11).unwrap_err().is_precondition());
    }

    // ── failure ───────────────────────────────────────────────────────────

    #[test]
    fn failed_wait_reclaims_nothing() {
        let mut tracker = Tracker::new();
        let mut next = 0;
        submit_n(&mut tracker, &mut next, 2);

        let err = tracker
            .sync_with(|fence| match fence {
                1 => Err(DeviceError::backend("timeout")),
                _ => Ok(()),
            })
            .unwrap_err();

        assert_eq!(err, DeviceError::backend("timeout"));
        let stats = tracker.stats();
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.pending_buffers, 2);
    }
}
