//! Application framework for the Cinder runtime.
//!
//! This crate provides a trait-based application framework that handles:
//! - Window creation and logging setup
//! - GPU context and dispatch thread initialization
//! - Swapchain creation and recreation through the presenter
//! - Frame synchronization and frame-lifecycle destruction
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use cinder_app::{run_app, AppContext, CinderApp, FrameContext, RuntimeConfig};
//!
//! struct MyApp {
//!     // Application state
//! }
//!
//! impl CinderApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp {})
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, dt: f32) {
//!         // Update logic
//!     }
//!
//!     fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
//!         // Render logic
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(RuntimeConfig::default())
//! }
//! ```

mod app;
mod config;
mod context;
mod frame;
mod runner;

pub use app::CinderApp;
pub use config::RuntimeConfig;
pub use context::{AppContext, AppWindow};
pub use frame::FrameContext;
pub use runner::run_app;

// Re-export commonly used types for convenience
pub use cinder_dispatch::{Destroyable, DispatchHandle};
pub use cinder_gpu::{ColorLoad, GpuContext, RenderPass, RenderPassDesc, RenderTarget};
pub use winit::event::WindowEvent;
