//! Work dispatch for the Cinder graphics runtime.
//!
//! Routes closures to the main thread, a background pool, a dedicated
//! cleanup thread, or holds them until a CPU or GPU frame boundary. Frame
//! boundaries drive deferred destruction of GPU objects.

pub mod destroy;
pub mod dispatcher;
pub mod error;
pub mod fence;
mod frame;
pub mod queue;
mod worker;

pub use destroy::{DestroyHorizon, Destroyable};
pub use dispatcher::{DispatchConfig, DispatchHandle, Dispatcher};
pub use error::{DispatchError, Result};
pub use fence::{FrameFence, GpuFrameTracker};
pub use queue::{Job, QueueKind, QueueSizes, WorkItem};
