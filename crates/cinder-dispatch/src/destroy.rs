//! Frame-lifecycle destruction.
//!
//! GPU objects cannot be freed while a frame that uses them is still in
//! flight. Instead of a per-renderer deletion queue, owners hand objects to
//! the dispatch system together with a horizon, and the cleanup thread
//! destroys them once that horizon has passed.

use crate::dispatcher::DispatchHandle;

/// An object with an explicit, consuming teardown.
///
/// `destroy` takes `self`, so an object can only be destroyed once.
pub trait Destroyable: Send + 'static {
    /// Release every resource the object owns.
    fn destroy(self);
}

impl<D: Destroyable> Destroyable for Vec<D> {
    fn destroy(self) {
        for item in self {
            item.destroy();
        }
    }
}

impl<D: Destroyable> Destroyable for Option<D> {
    fn destroy(self) {
        if let Some(item) = self {
            item.destroy();
        }
    }
}

/// Earliest point at which a scheduled object may be destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyHorizon {
    /// Once the current frame has been presented.
    EndOfCurrentCpuFrame,
    /// Once the GPU has finished the given frame.
    AfterGpuFrameCompletes(u64),
    /// At dispatcher shutdown, in reverse order of scheduling.
    OnShutdown,
}

impl DispatchHandle {
    /// Destroy `object` on the cleanup thread once `horizon` has passed.
    pub fn schedule_destroy<D: Destroyable>(&self, object: D, horizon: DestroyHorizon) {
        match horizon {
            DestroyHorizon::EndOfCurrentCpuFrame => {
                self.at_end_of_cpu_frame(move |_| object.destroy());
            }
            DestroyHorizon::AfterGpuFrameCompletes(frame) => {
                self.after_gpu_frame(frame, move |_| object.destroy());
            }
            DestroyHorizon::OnShutdown => self.at_shutdown(move |_| object.destroy()),
        }
    }

    /// Destroy `object` once the current frame has been presented.
    pub fn destroy_end_of_frame<D: Destroyable>(&self, object: D) {
        self.schedule_destroy(object, DestroyHorizon::EndOfCurrentCpuFrame);
    }

    /// Destroy `object` once the GPU has finished `frame`.
    pub fn destroy_after_gpu_frame<D: Destroyable>(&self, object: D, frame: u64) {
        self.schedule_destroy(object, DestroyHorizon::AfterGpuFrameCompletes(frame));
    }

    /// Destroy `object` at shutdown.
    pub fn destroy_on_shutdown<D: Destroyable>(&self, object: D) {
        self.schedule_destroy(object, DestroyHorizon::OnShutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl Destroyable for Counted {
        fn destroy(self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn containers_destroy_every_element() {
        let count = Arc::new(AtomicUsize::new(0));
        vec![Counted(Arc::clone(&count)), Counted(Arc::clone(&count))].destroy();
        Some(Counted(Arc::clone(&count))).destroy();
        None::<Counted>.destroy();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
