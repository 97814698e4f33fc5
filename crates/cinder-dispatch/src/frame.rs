//! Frame boundary bookkeeping.
//!
//! Tracks the last frame finished on the CPU (presented) and on the GPU
//! (fence signalled), the work held back until those boundaries, and the
//! events handed out to threads waiting on a particular frame.

use std::collections::BTreeMap;

use cinder_core::Event;

use crate::queue::Job;

/// Work and waiters released by a frame boundary.
#[derive(Default)]
pub(crate) struct Released {
    pub jobs: Vec<Job>,
    pub events: Vec<Event>,
}

#[derive(Default)]
pub(crate) struct FrameLedger {
    cpu_frame: u64,
    gpu_frame: u64,
    end_of_cpu: Vec<Job>,
    end_of_gpu: BTreeMap<u64, Vec<Job>>,
    cpu_waiters: BTreeMap<u64, Event>,
    gpu_waiters: BTreeMap<u64, Event>,
}

impl FrameLedger {
    /// Last frame whose CPU work finished.
    pub(crate) const fn cpu_frame(&self) -> u64 {
        self.cpu_frame
    }

    /// Last frame whose GPU work finished.
    pub(crate) const fn gpu_frame(&self) -> u64 {
        self.gpu_frame
    }

    pub(crate) fn hold_for_cpu(&mut self, job: Job) {
        self.end_of_cpu.push(job);
    }

    /// Hold `job` until `frame` completes on the GPU.
    ///
    /// Hands the job back if that frame already completed.
    pub(crate) fn hold_for_gpu(&mut self, frame: u64, job: Job) -> Option<Job> {
        if frame <= self.gpu_frame {
            return Some(job);
        }
        self.end_of_gpu.entry(frame).or_default().push(job);
        None
    }

    pub(crate) fn end_cpu_frame(&mut self, frame: u64) -> Released {
        debug_assert!(
            frame > self.cpu_frame,
            "CPU frame {frame} ended after frame {}",
            self.cpu_frame
        );
        self.cpu_frame = self.cpu_frame.max(frame);

        Released {
            jobs: std::mem::take(&mut self.end_of_cpu),
            events: take_through(&mut self.cpu_waiters, self.cpu_frame)
                .into_iter()
                .map(|(_, event)| event)
                .collect(),
        }
    }

    pub(crate) fn complete_gpu_frame(&mut self, frame: u64) -> Released {
        debug_assert!(
            frame <= self.cpu_frame,
            "GPU frame {frame} completed before its CPU frame ended"
        );
        debug_assert!(
            frame > self.gpu_frame,
            "GPU frame {frame} completed after frame {}",
            self.gpu_frame
        );
        // Release builds drop the stale report.
        let frame = frame.min(self.cpu_frame);
        if frame <= self.gpu_frame {
            return Released::default();
        }
        self.gpu_frame = frame;

        let mut jobs = Vec::new();
        for (_, bucket) in take_through(&mut self.end_of_gpu, frame) {
            jobs.extend(bucket);
        }

        Released {
            jobs,
            events: take_through(&mut self.gpu_waiters, frame)
                .into_iter()
                .map(|(_, event)| event)
                .collect(),
        }
    }

    pub(crate) fn cpu_event(&mut self, frame: u64) -> Event {
        waiter(&mut self.cpu_waiters, self.cpu_frame, frame)
    }

    pub(crate) fn gpu_event(&mut self, frame: u64) -> Event {
        waiter(&mut self.gpu_waiters, self.gpu_frame, frame)
    }

    /// Everything still held, in the order it must run, plus every waiter.
    pub(crate) fn drain_all(&mut self) -> Released {
        let mut jobs = std::mem::take(&mut self.end_of_cpu);
        for (_, bucket) in std::mem::take(&mut self.end_of_gpu) {
            jobs.extend(bucket);
        }

        let mut events: Vec<Event> = std::mem::take(&mut self.cpu_waiters).into_values().collect();
        events.extend(std::mem::take(&mut self.gpu_waiters).into_values());

        Released { jobs, events }
    }

    pub(crate) fn held_for_cpu(&self) -> usize {
        self.end_of_cpu.len()
    }

    pub(crate) fn held_for_gpu(&self) -> usize {
        self.end_of_gpu.values().map(Vec::len).sum()
    }
}

fn waiter(waiters: &mut BTreeMap<u64, Event>, completed: u64, frame: u64) -> Event {
    if frame <= completed {
        return Event::completed();
    }
    waiters.entry(frame).or_default().clone()
}

/// Remove and return every entry with a key `<= frame`, in key order.
fn take_through<V>(map: &mut BTreeMap<u64, V>, frame: u64) -> Vec<(u64, V)> {
    let later = map.split_off(&frame.saturating_add(1));
    std::mem::replace(map, later).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::ThreadIndex;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn tagged(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Job {
        let log = Arc::clone(log);
        Box::new(move |_| log.lock().push(tag))
    }

    fn run(released: Released) {
        for job in released.jobs {
            job(ThreadIndex::INVALID);
        }
        for event in released.events {
            event.trigger();
        }
    }

    #[test]
    fn cpu_frame_releases_jobs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = FrameLedger::default();
        ledger.hold_for_cpu(tagged(&log, 1));
        ledger.hold_for_cpu(tagged(&log, 2));

        run(ledger.end_cpu_frame(1));
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(ledger.held_for_cpu(), 0);
    }

    #[test]
    fn gpu_buckets_release_through_completed_frame() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = FrameLedger::default();
        for frame in 1..=4 {
            ledger.end_cpu_frame(frame);
        }
        assert!(ledger.hold_for_gpu(3, tagged(&log, 3)).is_none());
        assert!(ledger.hold_for_gpu(2, tagged(&log, 2)).is_none());
        assert!(ledger.hold_for_gpu(4, tagged(&log, 4)).is_none());

        run(ledger.complete_gpu_frame(3));
        assert_eq!(*log.lock(), vec![2, 3]);
        assert_eq!(ledger.held_for_gpu(), 1);
        assert_eq!(ledger.gpu_frame(), 3);
    }

    #[test]
    fn completed_gpu_frame_hands_job_back() {
        let mut ledger = FrameLedger::default();
        ledger.end_cpu_frame(1);
        ledger.complete_gpu_frame(1);
        assert!(ledger.hold_for_gpu(1, Box::new(|_| {})).is_some());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "completed after frame 2"))]
    fn repeated_gpu_completion_is_a_programmer_error() {
        let mut ledger = FrameLedger::default();
        ledger.end_cpu_frame(1);
        ledger.end_cpu_frame(2);
        ledger.complete_gpu_frame(2);
        let released = ledger.complete_gpu_frame(2);
        assert!(released.jobs.is_empty());
        assert_eq!(ledger.gpu_frame(), 2);
    }

    #[test]
    fn frame_events_trigger_on_completion() {
        let mut ledger = FrameLedger::default();
        let cpu = ledger.cpu_event(2);
        let gpu = ledger.gpu_event(1);

        run(ledger.end_cpu_frame(1));
        assert!(!cpu.is_triggered());
        run(ledger.end_cpu_frame(2));
        assert!(cpu.is_triggered());
        assert!(!gpu.is_triggered());

        run(ledger.complete_gpu_frame(1));
        assert!(gpu.is_triggered());
        assert!(ledger.gpu_event(1).ptr_eq(&Event::completed()));
        assert_eq!(ledger.cpu_frame(), 2);
    }
}
