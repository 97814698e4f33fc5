//! GPU frame completion tracking.
//!
//! Each submitted frame carries a fence. [`GpuFrameTracker`] keeps the
//! fences of in-flight frames in submission order and reports completions to
//! the dispatcher, which releases the frame's held work.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::dispatcher::DispatchHandle;

/// A host-visible GPU completion signal.
pub trait FrameFence: Send {
    /// Non-blocking status query.
    fn is_signaled(&self) -> bool;

    /// Block until signalled or `timeout` elapses. Returns whether it signalled.
    fn wait(&self, timeout: Duration) -> bool;
}

/// In-flight frames and their fences, oldest first.
pub struct GpuFrameTracker<F> {
    in_flight: VecDeque<(u64, F)>,
}

impl<F> Default for GpuFrameTracker<F> {
    fn default() -> Self {
        Self {
            in_flight: VecDeque::new(),
        }
    }
}

impl<F: FrameFence> GpuFrameTracker<F> {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `frame`, whose last submission signals `fence`.
    pub fn track(&mut self, frame: u64, fence: F) {
        debug_assert!(
            self.in_flight.back().map_or(true, |(last, _)| *last < frame),
            "frame {frame} tracked out of order"
        );
        self.in_flight.push_back((frame, fence));
    }

    /// Retire every leading frame whose fence has signalled.
    ///
    /// Completion is reported strictly in submission order: a signalled
    /// fence behind an unsignalled one waits. Returns the newest frame
    /// retired by this call.
    pub fn poll(&mut self, dispatch: &DispatchHandle) -> Option<u64> {
        let mut newest = None;
        while let Some((frame, fence)) = self.in_flight.front() {
            if !fence.is_signaled() {
                break;
            }
            newest = Some(*frame);
            self.in_flight.pop_front();
        }
        if let Some(frame) = newest {
            dispatch.complete_gpu_frame(frame);
        }
        newest
    }

    /// Block until every frame up to and including `frame` has completed.
    ///
    /// Returns `false` if `timeout` ran out first; frames that did complete
    /// are still reported.
    pub fn wait_for(&mut self, frame: u64, timeout: Duration, dispatch: &DispatchHandle) -> bool {
        let deadline = Instant::now() + timeout;
        let mut newest = None;
        let mut finished = true;

        while let Some((tracked, fence)) = self.in_flight.front() {
            if *tracked > frame {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !fence.wait(remaining) {
                tracing::warn!(frame = *tracked, ?timeout, "Timed out waiting for GPU frame");
                finished = false;
                break;
            }
            newest = Some(*tracked);
            self.in_flight.pop_front();
        }

        if let Some(frame) = newest {
            dispatch.complete_gpu_frame(frame);
        }
        finished
    }

    /// Block until every tracked frame has completed.
    pub fn wait_all(&mut self, timeout: Duration, dispatch: &DispatchHandle) -> bool {
        match self.in_flight.back() {
            Some((last, _)) => {
                let last = *last;
                self.wait_for(last, timeout, dispatch)
            }
            None => true,
        }
    }

    /// Number of frames still in flight.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Oldest frame still in flight.
    #[must_use]
    pub fn oldest_outstanding(&self) -> Option<u64> {
        self.in_flight.front().map(|(frame, _)| *frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatchConfig, Dispatcher};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Flag(Arc<AtomicBool>);

    impl Flag {
        fn signal(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl FrameFence for Flag {
        fn is_signaled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn wait(&self, _timeout: Duration) -> bool {
            self.is_signaled()
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&DispatchConfig::default().with_background_workers(0)).unwrap()
    }

    #[test]
    fn poll_reports_completions_in_order() {
        let dispatch = dispatcher();
        let mut tracker = GpuFrameTracker::new();
        let fences: Vec<Flag> = (0..3).map(|_| Flag::default()).collect();
        for (frame, fence) in (1..=3).zip(&fences) {
            dispatch.end_cpu_frame(frame);
            tracker.track(frame, fence.clone());
        }

        fences[1].signal();
        assert_eq!(tracker.poll(&dispatch), None);
        assert_eq!(dispatch.completed_gpu_frame(), 0);

        fences[0].signal();
        assert_eq!(tracker.poll(&dispatch), Some(2));
        assert_eq!(dispatch.completed_gpu_frame(), 2);
        assert_eq!(tracker.oldest_outstanding(), Some(3));
    }

    #[test]
    fn wait_for_stops_at_unsignalled_fence() {
        let dispatch = dispatcher();
        let mut tracker = GpuFrameTracker::new();
        let first = Flag::default();
        first.signal();
        dispatch.end_cpu_frame(1);
        dispatch.end_cpu_frame(2);
        tracker.track(1, first);
        tracker.track(2, Flag::default());

        assert!(!tracker.wait_all(Duration::ZERO, &dispatch));
        assert_eq!(dispatch.completed_gpu_frame(), 1);
        assert_eq!(tracker.outstanding(), 1);
    }
}
