//! Frame-lifecycle destruction driven through the public dispatch API.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cinder_core::ThreadIndex;
use cinder_dispatch::{
    DestroyHorizon, Destroyable, DispatchConfig, DispatchHandle, Dispatcher, FrameFence,
    GpuFrameTracker,
};
use parking_lot::Mutex;
use proptest::prelude::*;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Records the thread it was destroyed on.
struct Probe {
    id: u32,
    log: Arc<Mutex<Vec<(u32, ThreadIndex)>>>,
    registry: Arc<cinder_core::ThreadRegistry>,
}

impl Destroyable for Probe {
    fn destroy(self) {
        let index = self.registry.current_thread_index();
        self.log.lock().push((self.id, index));
    }
}

struct Harness {
    dispatch: Dispatcher,
    log: Arc<Mutex<Vec<(u32, ThreadIndex)>>>,
}

impl Harness {
    fn new(workers: u32) -> Self {
        let config = DispatchConfig::default()
            .with_background_workers(workers)
            .with_thread_name_prefix("lifecycle");
        Self {
            dispatch: Dispatcher::new(&config).unwrap(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn probe(&self, id: u32) -> Probe {
        Probe {
            id,
            log: Arc::clone(&self.log),
            registry: Arc::clone(self.dispatch.registry()),
        }
    }

    fn handle(&self) -> &DispatchHandle {
        self.dispatch.handle()
    }

    /// Wait for the cleanup thread to run everything queued so far.
    fn settle(&self) {
        assert!(self.handle().cleanup_barrier().join_timeout(TIMEOUT));
    }

    fn destroyed(&self) -> Vec<u32> {
        self.log.lock().iter().map(|(id, _)| *id).collect()
    }
}

#[derive(Clone, Default)]
struct TestFence(Arc<AtomicBool>);

impl TestFence {
    fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl FrameFence for TestFence {
    fn is_signaled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn wait(&self, _timeout: Duration) -> bool {
        self.is_signaled()
    }
}

#[test]
fn end_of_frame_destruction_waits_for_present() {
    let h = Harness::new(1);
    h.handle().destroy_end_of_frame(h.probe(1));
    h.settle();
    assert!(h.destroyed().is_empty());

    h.handle().end_cpu_frame(1);
    h.settle();
    assert_eq!(h.destroyed(), vec![1]);

    h.handle().end_cpu_frame(2);
    h.settle();
    assert_eq!(h.destroyed(), vec![1]);
}

#[test]
fn gpu_frame_destruction_waits_for_that_frame() {
    let h = Harness::new(1);
    for frame in 1..=5 {
        h.handle().end_cpu_frame(frame);
    }
    h.handle().destroy_after_gpu_frame(h.probe(5), 5);

    h.handle().complete_gpu_frame(4);
    h.settle();
    assert!(h.destroyed().is_empty());

    h.handle().complete_gpu_frame(5);
    h.settle();
    let log = h.log.lock().clone();
    assert_eq!(log, vec![(5, h.handle().cleanup_thread_index())]);
}

#[test]
fn already_completed_gpu_frame_destroys_promptly() {
    let h = Harness::new(0);
    h.handle().end_cpu_frame(1);
    h.handle().complete_gpu_frame(1);
    h.handle().destroy_after_gpu_frame(h.probe(9), 1);
    h.settle();
    assert_eq!(h.destroyed(), vec![9]);
}

#[test]
fn gpu_buckets_release_in_frame_order() {
    let h = Harness::new(2);
    for frame in 1..=3 {
        h.handle().end_cpu_frame(frame);
    }
    h.handle().destroy_after_gpu_frame(h.probe(3), 3);
    h.handle().destroy_after_gpu_frame(h.probe(1), 1);
    h.handle().destroy_after_gpu_frame(h.probe(2), 2);

    h.handle().complete_gpu_frame(3);
    h.settle();
    assert_eq!(h.destroyed(), vec![1, 2, 3]);
}

#[test]
fn tracker_drives_destruction_from_fences() {
    let h = Harness::new(1);
    let mut tracker = GpuFrameTracker::new();
    let fences: Vec<TestFence> = (0..3).map(|_| TestFence::default()).collect();

    for (frame, fence) in (1..=3).zip(&fences) {
        h.handle().destroy_after_gpu_frame(h.probe(u32::try_from(frame).unwrap()), frame);
        h.handle().end_cpu_frame(frame);
        tracker.track(frame, fence.clone());
    }

    fences[0].signal();
    fences[2].signal();
    assert_eq!(tracker.poll(h.handle()), Some(1));
    h.settle();
    assert_eq!(h.destroyed(), vec![1]);

    fences[1].signal();
    assert!(tracker.wait_all(TIMEOUT, h.handle()));
    h.settle();
    assert_eq!(h.destroyed(), vec![1, 2, 3]);
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn frame_events_follow_frame_boundaries() {
    let h = Harness::new(0);
    let cpu = h.handle().cpu_frame_event(1);
    let gpu = h.handle().gpu_frame_event(1);
    assert!(!cpu.is_triggered());

    h.handle().end_cpu_frame(1);
    assert!(cpu.is_triggered());
    assert!(!gpu.is_triggered());

    h.handle().complete_gpu_frame(1);
    assert!(gpu.join_timeout(TIMEOUT));
}

#[test]
fn shutdown_destroys_everything_still_held() {
    let h = Harness::new(1);
    h.handle().destroy_end_of_frame(h.probe(1));
    h.handle().destroy_after_gpu_frame(h.probe(2), 10);
    h.handle().destroy_on_shutdown(h.probe(3));
    h.handle().schedule_destroy(h.probe(4), DestroyHorizon::OnShutdown);
    let pending_gpu = h.handle().gpu_frame_event(10);

    let Harness { dispatch, log } = h;
    let handle = dispatch.handle().clone();
    dispatch.shutdown();

    let ids: Vec<u32> = log.lock().iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![1, 2, 4, 3]);
    assert!(pending_gpu.is_triggered());
    assert!(handle.is_shut_down());
}

#[test]
fn destruction_after_shutdown_runs_inline() {
    let h = Harness::new(0);
    let handle = h.handle().clone();
    let probe = h.probe(7);
    let Harness { dispatch, log } = h;
    dispatch.shutdown();

    handle.destroy_after_gpu_frame(probe, 100);
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn producers_on_many_threads_each_run_once() {
    let h = Harness::new(2);
    let count = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let handle = h.handle().clone();
            let count = Arc::clone(&count);
            scope.spawn(move || {
                for _ in 0..50 {
                    let count = Arc::clone(&count);
                    handle.spawn_background(move |_| {
                        count.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }
    });

    let Harness { dispatch, .. } = h;
    dispatch.shutdown();
    assert_eq!(count.load(Ordering::SeqCst), 200);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// However completions are batched, each object is destroyed exactly
    /// once and never before its frame.
    #[test]
    fn objects_never_outlive_or_precede_their_frame(
        targets in proptest::collection::vec(1u64..8, 1..16),
        completions in proptest::collection::btree_set(1u64..=8, 1..8),
    ) {
        let h = Harness::new(1);
        for frame in 1..=8 {
            h.handle().end_cpu_frame(frame);
        }
        for (id, frame) in targets.iter().enumerate() {
            h.handle().destroy_after_gpu_frame(h.probe(u32::try_from(id).unwrap()), *frame);
        }

        let mut completed = 0;
        for frame in completions {
            h.handle().complete_gpu_frame(frame);
            completed = completed.max(frame);
            h.settle();
            for (id, _) in h.log.lock().iter() {
                prop_assert!(targets[*id as usize] <= completed);
            }
        }

        let Harness { dispatch, log } = h;
        dispatch.shutdown();
        let mut ids: Vec<u32> = log.lock().iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        let expected: Vec<u32> = (0..u32::try_from(targets.len()).unwrap()).collect();
        prop_assert_eq!(ids, expected);
    }
}
