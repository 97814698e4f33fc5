//! Dispatch error types.

use thiserror::Error;

/// Errors raised while starting the dispatch threads.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Thread registration or another core primitive failed.
    #[error(transparent)]
    Core(#[from] cinder_core::Error),

    /// The OS refused to spawn a thread.
    #[error("Failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker exited before reporting its thread index.
    #[error("Worker thread {0} exited during startup")]
    WorkerLost(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, DispatchError>;
