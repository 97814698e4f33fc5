//! `CinderApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// Trait for Cinder applications.
///
/// The runner owns the window, the GPU context, the dispatch threads and the
/// presentation state machine. An application records commands for the
/// swapchain image it is handed each frame.
pub trait CinderApp: Sized {
    /// Initialize the application.
    ///
    /// Called once on the main thread, after the GPU context, dispatch
    /// threads and first swapchain have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering, after main-thread work queued
    /// through the dispatch system has run.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record the frame.
    ///
    /// The swapchain image starts in an undefined layout. The application
    /// must run at least one render pass that leaves it in
    /// `PRESENT_SRC_KHR`, such as one from [`cinder_gpu::RenderPassDesc::present`].
    ///
    /// Objects the recorded commands use must outlive the frame: release them
    /// with [`cinder_dispatch::DispatchHandle::destroy_after_gpu_frame`] and
    /// the frame number, never by destroying them directly.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, ctx: &mut AppContext, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// Called with the GPU idle and before the dispatch threads stop, so
    /// objects may be destroyed directly or handed to the dispatch system.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
