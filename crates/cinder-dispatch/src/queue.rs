//! Queue kinds and work items.

use cinder_core::ThreadIndex;

/// A unit of work. Receives the index of the thread that runs it.
pub type Job = Box<dyn FnOnce(ThreadIndex) + Send + 'static>;

/// Execution context a work item must run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// The main/render thread, FIFO, drained once per loop iteration.
    MainThread,
    /// Any background pool worker; no ordering between items.
    BackgroundPool,
    /// The dedicated cleanup thread, FIFO.
    Cleanup,
    /// Held until the current frame has been presented, then moved to cleanup.
    EndOfCpuFrame,
    /// Held until the GPU has finished the given frame, then moved to cleanup.
    EndOfGpuFrame(u64),
}

/// A job together with the queue it targets.
pub struct WorkItem {
    pub job: Job,
    pub target: QueueKind,
}

impl WorkItem {
    /// Wrap a closure for `target`.
    pub fn new(target: QueueKind, job: impl FnOnce(ThreadIndex) + Send + 'static) -> Self {
        Self {
            job: Box::new(job),
            target,
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("target", &self.target)
            .field("job", &"<closure>")
            .finish()
    }
}

/// Snapshot of pending work per queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSizes {
    pub main_thread: usize,
    pub background: usize,
    pub cleanup: usize,
    pub end_of_cpu_frame: usize,
    pub end_of_gpu_frame: usize,
    pub on_shutdown: usize,
}
