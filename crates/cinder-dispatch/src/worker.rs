//! Registered worker threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cinder_core::{ThreadIndex, ThreadRegistry};
use crossbeam::channel::{self, Receiver};

use crate::error::{DispatchError, Result};
use crate::queue::Job;

/// Message sent to a worker thread.
pub(crate) enum Message {
    /// Run a job.
    Run(Job),
    /// Exit after everything queued before this message.
    Shutdown,
}

/// Handle to one worker thread.
pub(crate) struct Worker {
    name: String,
    index: ThreadIndex,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a thread that registers itself with `registry` and then runs
    /// jobs from `messages` until it receives [`Message::Shutdown`].
    ///
    /// Returns once the thread has its index, so registration failures
    /// surface here rather than on the worker.
    pub(crate) fn spawn(
        name: String,
        registry: Arc<ThreadRegistry>,
        messages: Receiver<Message>,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = channel::bounded(1);

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let index = match registry.register_current_thread() {
                    Ok(index) => index,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(index));
                drop(ready_tx);
                Self::worker_loop(index, &messages);
            })
            .map_err(|source| DispatchError::Spawn {
                name: name.clone(),
                source,
            })?;

        let index = match ready_rx.recv() {
            Ok(Ok(index)) => index,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e.into());
            }
            Err(_) => {
                let _ = thread.join();
                return Err(DispatchError::WorkerLost(name));
            }
        };

        Ok(Self {
            name,
            index,
            thread: Some(thread),
        })
    }

    /// Main worker loop - blocks waiting for messages and runs jobs in order.
    fn worker_loop(index: ThreadIndex, messages: &Receiver<Message>) {
        for message in messages {
            match message {
                Message::Run(job) => run_job(job, index),
                Message::Shutdown => break,
            }
        }
        tracing::trace!(%index, "Worker exiting");
    }

    /// Index the worker registered under.
    pub(crate) const fn index(&self) -> ThreadIndex {
        self.index
    }

    /// Wait for the thread to exit. The caller must already have sent
    /// [`Message::Shutdown`].
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Worker thread {} panicked", self.name);
            }
        }
    }
}

/// Run a job, containing any panic so the thread keeps serving its queue.
pub(crate) fn run_job(job: Job, index: ThreadIndex) {
    if catch_unwind(AssertUnwindSafe(|| job(index))).is_err() {
        tracing::error!(%index, "Work item panicked");
    }
}
