//! The work dispatch system.
//!
//! [`Dispatcher`] owns the cleanup thread and the background pool and must
//! live on the main/render thread. Producers on any thread use a cloned
//! [`DispatchHandle`] to enqueue work; enqueueing never blocks beyond a short
//! lock.
//!
//! Routing:
//! - `MainThread` items wait in a channel until the main thread calls
//!   [`DispatchHandle::drain_main`].
//! - `BackgroundPool` and `Cleanup` items go straight to their threads.
//! - `EndOfCpuFrame` items are held until [`DispatchHandle::end_cpu_frame`]
//!   and `EndOfGpuFrame(n)` items until [`DispatchHandle::complete_gpu_frame`]
//!   reports frame `n`; both are then moved, in order, onto the cleanup thread.
//!
//! Once shut down, enqueued work runs inline on the calling thread so that
//! nothing is ever dropped without running.

use std::sync::Arc;

use cinder_core::{Event, ThreadBudget, ThreadIndex, ThreadRegistry};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::frame::{FrameLedger, Released};
use crate::queue::{Job, QueueKind, QueueSizes, WorkItem};
use crate::worker::{run_job, Message, Worker};

/// Dispatch configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of background pool threads.
    pub background_workers: u32,
    /// Prefix for spawned thread names.
    pub thread_name_prefix: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            background_workers: ThreadBudget::detect().background_workers,
            thread_name_prefix: "cinder".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Set the background pool size.
    #[must_use]
    pub const fn with_background_workers(mut self, workers: u32) -> Self {
        self.background_workers = workers;
        self
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

/// Senders for the thread-backed queues. Absent once shut down.
struct Lanes {
    main: Sender<Job>,
    background: Sender<Message>,
    cleanup: Sender<Message>,
}

struct Shared {
    registry: Arc<ThreadRegistry>,
    main_index: ThreadIndex,
    cleanup_index: ThreadIndex,
    lanes: RwLock<Option<Lanes>>,
    main_rx: Receiver<Job>,
    background_rx: Receiver<Message>,
    cleanup_rx: Receiver<Message>,
    frames: Mutex<FrameLedger>,
    on_shutdown: Mutex<Vec<Job>>,
    background_workers: u32,
}

/// Cloneable producer-side handle to the dispatch system.
#[derive(Clone)]
pub struct DispatchHandle {
    shared: Arc<Shared>,
}

/// Owner of the dispatch threads. Lives on the main thread.
pub struct Dispatcher {
    handle: DispatchHandle,
    cleanup: Option<Worker>,
    pool: Vec<Worker>,
}

impl Dispatcher {
    /// Register the calling thread as the main thread and start the cleanup
    /// thread and background pool.
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let budget = ThreadBudget {
            background_workers: config.background_workers,
        };
        let registry = Arc::new(ThreadRegistry::with_budget(budget));
        let main_index = registry.register_current_thread()?;

        let (main_tx, main_rx) = channel::unbounded();
        let (background_tx, background_rx) = channel::unbounded();
        let (cleanup_tx, cleanup_rx) = channel::unbounded();

        let cleanup = Worker::spawn(
            format!("{}-cleanup", config.thread_name_prefix),
            Arc::clone(&registry),
            cleanup_rx.clone(),
        )?;

        let mut pool = Vec::with_capacity(config.background_workers as usize);
        for i in 0..config.background_workers {
            pool.push(Worker::spawn(
                format!("{}-worker-{i}", config.thread_name_prefix),
                Arc::clone(&registry),
                background_rx.clone(),
            )?);
        }

        tracing::info!(
            background_workers = config.background_workers,
            cleanup = %cleanup.index(),
            "Dispatcher started"
        );

        let shared = Arc::new(Shared {
            registry,
            main_index,
            cleanup_index: cleanup.index(),
            lanes: RwLock::new(Some(Lanes {
                main: main_tx,
                background: background_tx,
                cleanup: cleanup_tx,
            })),
            main_rx,
            background_rx,
            cleanup_rx,
            frames: Mutex::new(FrameLedger::default()),
            on_shutdown: Mutex::new(Vec::new()),
            background_workers: config.background_workers,
        });

        Ok(Self {
            handle: DispatchHandle { shared },
            cleanup: Some(cleanup),
            pool,
        })
    }

    /// Producer handle; clone it freely.
    #[must_use]
    pub const fn handle(&self) -> &DispatchHandle {
        &self.handle
    }

    /// Drain every queue, run the shutdown list and stop all threads.
    ///
    /// GPU-bound work is released regardless of fence state, so the caller
    /// must have waited for the device first.
    pub fn shutdown(mut self) {
        self.shutdown_threads();
    }

    fn shutdown_threads(&mut self) {
        let Some(mut cleanup) = self.cleanup.take() else {
            return;
        };
        let shared = &self.handle.shared;

        if shared.registry.current_thread_index() != shared.main_index {
            tracing::warn!("Dispatcher shut down off the main thread");
        }

        // From here on, enqueue runs inline on the caller.
        let Some(lanes) = shared.lanes.write().take() else {
            return;
        };

        while self.handle.drain_main() > 0 {}

        let Released { jobs, events } = shared.frames.lock().drain_all();
        let mut on_shutdown = std::mem::take(&mut *shared.on_shutdown.lock());
        on_shutdown.reverse();
        tracing::info!(
            held = jobs.len(),
            on_shutdown = on_shutdown.len(),
            "Draining deferred work"
        );

        for job in jobs.into_iter().chain(on_shutdown) {
            send_or_run(&lanes.cleanup, job, shared.cleanup_index);
        }

        for _ in &self.pool {
            let _ = lanes.background.send(Message::Shutdown);
        }
        let _ = lanes.cleanup.send(Message::Shutdown);
        drop(lanes);

        for worker in &mut self.pool {
            worker.join();
        }
        cleanup.join();

        // Anything a dying worker left behind still runs exactly once.
        for message in shared.background_rx.try_iter().chain(shared.cleanup_rx.try_iter()) {
            if let Message::Run(job) = message {
                run_job(job, shared.registry.current_thread_index());
            }
        }
        while self.handle.drain_main() > 0 {}

        for event in events {
            event.trigger();
        }
        tracing::info!("Dispatcher stopped");
    }
}

impl std::ops::Deref for Dispatcher {
    type Target = DispatchHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown_threads();
    }
}

impl DispatchHandle {
    /// Enqueue `job` on `target`.
    pub fn enqueue(&self, target: QueueKind, job: impl FnOnce(ThreadIndex) + Send + 'static) {
        self.submit(WorkItem::new(target, job));
    }

    /// Enqueue a prepared work item.
    pub fn submit(&self, item: WorkItem) {
        let WorkItem { job, target } = item;
        let shared = &*self.shared;

        let inline = {
            let lanes = shared.lanes.read();
            match lanes.as_ref() {
                None => Some(job),
                Some(lanes) => match target {
                    QueueKind::MainThread => lanes.main.send(job).err().map(|e| e.0),
                    QueueKind::BackgroundPool => {
                        // A zero-sized pool hands its work to the cleanup thread.
                        let lane = if shared.background_workers > 0 {
                            &lanes.background
                        } else {
                            &lanes.cleanup
                        };
                        reclaim(lane.send(Message::Run(job)))
                    }
                    QueueKind::Cleanup => reclaim(lanes.cleanup.send(Message::Run(job))),
                    QueueKind::EndOfCpuFrame => {
                        shared.frames.lock().hold_for_cpu(job);
                        None
                    }
                    QueueKind::EndOfGpuFrame(frame) => {
                        let ready = shared.frames.lock().hold_for_gpu(frame, job);
                        ready.and_then(|job| reclaim(lanes.cleanup.send(Message::Run(job))))
                    }
                },
            }
        };

        if let Some(job) = inline {
            tracing::debug!(?target, "Dispatch closed, running work inline");
            run_job(job, shared.registry.current_thread_index());
        }
    }

    /// Run `job` on the main thread at its next drain.
    pub fn run_on_main(&self, job: impl FnOnce(ThreadIndex) + Send + 'static) {
        self.enqueue(QueueKind::MainThread, job);
    }

    /// Run `job` on some background pool thread.
    pub fn spawn_background(&self, job: impl FnOnce(ThreadIndex) + Send + 'static) {
        self.enqueue(QueueKind::BackgroundPool, job);
    }

    /// Run `job` on the cleanup thread.
    pub fn run_on_cleanup(&self, job: impl FnOnce(ThreadIndex) + Send + 'static) {
        self.enqueue(QueueKind::Cleanup, job);
    }

    /// Run `job` on the cleanup thread once the current frame is presented.
    pub fn at_end_of_cpu_frame(&self, job: impl FnOnce(ThreadIndex) + Send + 'static) {
        self.enqueue(QueueKind::EndOfCpuFrame, job);
    }

    /// Run `job` on the cleanup thread once the GPU has finished `frame`.
    pub fn after_gpu_frame(&self, frame: u64, job: impl FnOnce(ThreadIndex) + Send + 'static) {
        self.enqueue(QueueKind::EndOfGpuFrame(frame), job);
    }

    /// Hold `job` until shutdown. Shutdown runs these in reverse order of
    /// registration, after every other queue has drained.
    pub fn at_shutdown(&self, job: impl FnOnce(ThreadIndex) + Send + 'static) {
        let job: Job = Box::new(job);
        let inline = {
            let lanes = self.shared.lanes.read();
            if lanes.is_some() {
                self.shared.on_shutdown.lock().push(job);
                None
            } else {
                Some(job)
            }
        };
        if let Some(job) = inline {
            run_job(job, self.shared.registry.current_thread_index());
        }
    }

    /// Run every main-thread item queued so far, in order. Returns how many ran.
    ///
    /// Items enqueued while draining wait for the next call.
    pub fn drain_main(&self) -> usize {
        let shared = &*self.shared;
        let index = shared.registry.current_thread_index();
        debug_assert!(
            index == shared.main_index || shared.lanes.read().is_none(),
            "main queue drained from thread {index}"
        );

        let pending = shared.main_rx.len();
        let mut ran = 0;
        while ran < pending {
            let Ok(job) = shared.main_rx.try_recv() else {
                break;
            };
            run_job(job, index);
            ran += 1;
        }
        ran
    }

    /// Mark `frame` as presented: move its end-of-frame work onto the cleanup
    /// thread and trigger its CPU frame event.
    pub fn end_cpu_frame(&self, frame: u64) {
        let released = self.shared.frames.lock().end_cpu_frame(frame);
        tracing::trace!(frame, jobs = released.jobs.len(), "End of CPU frame");
        self.release(released);
    }

    /// Report that the GPU finished `frame` (and therefore every earlier
    /// frame): release their held work onto the cleanup thread in frame
    /// order and trigger their GPU frame events.
    ///
    /// Each call must name a later frame than the one before it.
    pub fn complete_gpu_frame(&self, frame: u64) {
        let released = self.shared.frames.lock().complete_gpu_frame(frame);
        if !released.jobs.is_empty() {
            tracing::trace!(frame, jobs = released.jobs.len(), "End of GPU frame");
        }
        self.release(released);
    }

    fn release(&self, released: Released) {
        let Released { jobs, events } = released;
        let shared = &*self.shared;

        let leftovers = {
            let lanes = shared.lanes.read();
            match lanes.as_ref() {
                Some(lanes) => {
                    for job in jobs {
                        send_or_run(&lanes.cleanup, job, shared.cleanup_index);
                    }
                    Vec::new()
                }
                None => jobs,
            }
        };
        for job in leftovers {
            run_job(job, shared.registry.current_thread_index());
        }

        for event in events {
            event.trigger();
        }
    }

    /// Event triggered once `frame` has been presented.
    #[must_use]
    pub fn cpu_frame_event(&self, frame: u64) -> Event {
        self.shared.frames.lock().cpu_event(frame)
    }

    /// Event triggered once the GPU has finished `frame`.
    #[must_use]
    pub fn gpu_frame_event(&self, frame: u64) -> Event {
        self.shared.frames.lock().gpu_event(frame)
    }

    /// Event triggered once everything queued on the cleanup thread so far has run.
    #[must_use]
    pub fn cleanup_barrier(&self) -> Event {
        let event = Event::new();
        let guard = event.guard();
        self.run_on_cleanup(move |_| drop(guard));
        event
    }

    /// Last frame reported by [`Self::end_cpu_frame`].
    #[must_use]
    pub fn completed_cpu_frame(&self) -> u64 {
        self.shared.frames.lock().cpu_frame()
    }

    /// Last frame reported by [`Self::complete_gpu_frame`].
    #[must_use]
    pub fn completed_gpu_frame(&self) -> u64 {
        self.shared.frames.lock().gpu_frame()
    }

    /// The registry every dispatch thread is registered with.
    #[must_use]
    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.shared.registry
    }

    /// Index of the main/render thread.
    #[must_use]
    pub fn main_thread_index(&self) -> ThreadIndex {
        self.shared.main_index
    }

    /// Index of the cleanup thread.
    #[must_use]
    pub fn cleanup_thread_index(&self) -> ThreadIndex {
        self.shared.cleanup_index
    }

    /// Whether the calling thread is the main thread.
    #[must_use]
    pub fn is_main_thread(&self) -> bool {
        self.shared.registry.current_thread_index() == self.shared.main_index
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.lanes.read().is_none()
    }

    /// Pending work per queue.
    #[must_use]
    pub fn queue_sizes(&self) -> QueueSizes {
        let shared = &*self.shared;
        let frames = shared.frames.lock();
        QueueSizes {
            main_thread: shared.main_rx.len(),
            background: shared.background_rx.len(),
            cleanup: shared.cleanup_rx.len(),
            end_of_cpu_frame: frames.held_for_cpu(),
            end_of_gpu_frame: frames.held_for_gpu(),
            on_shutdown: shared.on_shutdown.lock().len(),
        }
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("main", &self.shared.main_index)
            .field("cleanup", &self.shared.cleanup_index)
            .field("queues", &self.queue_sizes())
            .finish()
    }
}

fn reclaim(result: std::result::Result<(), channel::SendError<Message>>) -> Option<Job> {
    match result {
        Ok(()) | Err(channel::SendError(Message::Shutdown)) => None,
        Err(channel::SendError(Message::Run(job))) => Some(job),
    }
}

fn send_or_run(lane: &Sender<Message>, job: Job, index: ThreadIndex) {
    if let Some(job) = reclaim(lane.send(Message::Run(job))) {
        tracing::warn!("Cleanup thread gone, running work on the caller");
        run_job(job, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn dispatcher(workers: u32) -> Dispatcher {
        Dispatcher::new(&DispatchConfig::default().with_background_workers(workers)).unwrap()
    }

    #[test]
    fn creator_is_main_thread() {
        let dispatch = dispatcher(1);
        assert!(dispatch.is_main_thread());
        assert_eq!(dispatch.main_thread_index().get(), 0);
        assert_ne!(dispatch.cleanup_thread_index(), dispatch.main_thread_index());
        assert_eq!(dispatch.registry().registered(), 3);
    }

    #[test]
    fn main_queue_runs_in_order_on_drain() {
        let dispatch = dispatcher(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            dispatch.run_on_main(move |index| log.lock().push((i, index)));
        }
        assert!(log.lock().is_empty());

        assert_eq!(dispatch.drain_main(), 5);
        let log = log.lock();
        assert_eq!(log.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert!(log.iter().all(|(_, index)| *index == dispatch.main_thread_index()));
    }

    #[test]
    fn work_enqueued_during_drain_waits_for_next_drain() {
        let dispatch = dispatcher(0);
        let handle = dispatch.handle().clone();
        let ran = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&ran);
        dispatch.run_on_main(move |_| {
            let inner = Arc::clone(&inner);
            handle.run_on_main(move |_| {
                inner.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(dispatch.drain_main(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(dispatch.drain_main(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_queue_is_fifo_on_cleanup_thread() {
        let dispatch = dispatcher(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let log = Arc::clone(&log);
            dispatch.run_on_cleanup(move |index| log.lock().push((i, index)));
        }
        assert!(dispatch.cleanup_barrier().join_timeout(TIMEOUT));

        let log = log.lock();
        assert_eq!(log.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..32).collect::<Vec<_>>());
        assert!(log.iter().all(|(_, index)| *index == dispatch.cleanup_thread_index()));
    }

    #[test]
    fn background_items_each_run_once() {
        let dispatch = dispatcher(3);
        let count = Arc::new(AtomicUsize::new(0));
        let done: Vec<Option<Event>> = (0..64)
            .map(|_| {
                let event = Event::new();
                let guard = event.guard();
                let count = Arc::clone(&count);
                let main = dispatch.main_thread_index();
                let cleanup = dispatch.cleanup_thread_index();
                dispatch.spawn_background(move |index| {
                    assert!(index.is_valid());
                    assert_ne!(index, main);
                    assert_ne!(index, cleanup);
                    count.fetch_add(1, Ordering::SeqCst);
                    drop(guard);
                });
                Some(event)
            })
            .collect();

        assert!(Event::aggregate(&done).join_timeout(TIMEOUT));
        assert_eq!(count.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn empty_pool_routes_background_work_to_cleanup() {
        let dispatch = dispatcher(0);
        let event = Event::new();
        let guard = event.guard();
        let cleanup = dispatch.cleanup_thread_index();
        dispatch.spawn_background(move |index| {
            assert_eq!(index, cleanup);
            drop(guard);
        });
        assert!(event.join_timeout(TIMEOUT));
    }

    #[test]
    fn shutdown_drains_every_queue() {
        let dispatch = dispatcher(2);
        let count = Arc::new(AtomicUsize::new(0));
        let bump = |count: &Arc<AtomicUsize>| {
            let count = Arc::clone(count);
            move |_: ThreadIndex| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };

        dispatch.run_on_main(bump(&count));
        dispatch.spawn_background(bump(&count));
        dispatch.run_on_cleanup(bump(&count));
        dispatch.at_end_of_cpu_frame(bump(&count));
        dispatch.after_gpu_frame(40, bump(&count));
        dispatch.at_shutdown(bump(&count));

        let handle = dispatch.handle().clone();
        dispatch.shutdown();

        assert_eq!(count.load(Ordering::SeqCst), 6);
        assert!(handle.is_shut_down());

        // Late work still runs, inline.
        handle.run_on_cleanup(bump(&count));
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn shutdown_list_runs_in_reverse_registration_order() {
        let dispatch = dispatcher(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = Arc::clone(&log);
            dispatch.at_shutdown(move |_| log.lock().push(i));
        }
        dispatch.shutdown();
        assert_eq!(*log.lock(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn queue_sizes_reflect_held_work() {
        let dispatch = dispatcher(0);
        dispatch.run_on_main(|_| {});
        dispatch.at_end_of_cpu_frame(|_| {});
        dispatch.after_gpu_frame(3, |_| {});
        dispatch.after_gpu_frame(4, |_| {});
        dispatch.at_shutdown(|_| {});

        let sizes = dispatch.queue_sizes();
        assert_eq!(sizes.main_thread, 1);
        assert_eq!(sizes.end_of_cpu_frame, 1);
        assert_eq!(sizes.end_of_gpu_frame, 2);
        assert_eq!(sizes.on_shutdown, 1);
    }
}
