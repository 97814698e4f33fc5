//! Application context.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use cinder_core::constants::MAX_FRAMES_IN_FLIGHT;
use cinder_dispatch::{Destroyable, DispatchHandle, Dispatcher, GpuFrameTracker};
use cinder_gpu::{
    FrameSyncManager, GpuContext, PresentWindow, Presenter, ResourceFactory, VulkanFence,
    VulkanPresentBackend,
};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use winit::window::{Fullscreen, Window};

use crate::config::RuntimeConfig;

/// How long to wait on a frame fence before giving up.
pub(crate) const FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// The winit window as a presentation target.
#[derive(Clone)]
pub struct AppWindow(pub Arc<Window>);

impl HasWindowHandle for AppWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.0.window_handle()
    }
}

impl HasDisplayHandle for AppWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.0.display_handle()
    }
}

impl PresentWindow for AppWindow {
    fn inner_extent(&self) -> vk::Extent2D {
        let size = self.0.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn is_fullscreen(&self) -> bool {
        self.0.fullscreen().is_some()
    }

    fn set_fullscreen(&self, fullscreen: bool) {
        self.0
            .set_fullscreen(fullscreen.then_some(Fullscreen::Borderless(None)));
    }
}

pub(crate) type WindowPresenter = Presenter<VulkanPresentBackend<AppWindow>>;

/// Application context shared across all app methods.
///
/// Fields are dropped in declaration order; [`AppContext::shutdown`] makes
/// the teardown explicit. The GPU context goes last.
pub struct AppContext {
    pub(crate) presenter: WindowPresenter,
    pub(crate) factory: ResourceFactory,
    pub(crate) sync: Option<FrameSyncManager>,
    pub(crate) tracker: GpuFrameTracker<VulkanFence>,
    pub(crate) dispatcher: Option<Dispatcher>,
    dispatch: DispatchHandle,
    window: Arc<Window>,
    gpu: GpuContext,
    /// Frames submitted so far.
    pub frame_count: u64,
}

impl AppContext {
    /// Create the dispatch threads, resource factory and presenter for `window`.
    ///
    /// Must be called on the thread that runs the event loop; it becomes the
    /// dispatch main thread.
    pub(crate) fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        config: &RuntimeConfig,
    ) -> anyhow::Result<Self> {
        let dispatcher = Dispatcher::new(&config.dispatch_config())?;
        let dispatch = dispatcher.handle().clone();
        let factory = ResourceFactory::new(&gpu, Arc::clone(dispatch.registry()))?;

        let backend = VulkanPresentBackend::new(&gpu, AppWindow(Arc::clone(&window)))?;
        let mut presenter = Presenter::new(backend, dispatch.clone());
        let size = window.inner_size();
        presenter.attach(config.vsync, size.width, size.height)?;
        presenter.set_fullscreen(config.fullscreen);

        let sync = unsafe { FrameSyncManager::new(Arc::clone(gpu.device()), MAX_FRAMES_IN_FLIGHT)? };

        if let Some(extent) = presenter.extent() {
            tracing::info!(
                width = extent.width,
                height = extent.height,
                present_mode = ?presenter.present_mode(),
                "Presentation ready"
            );
        }

        Ok(Self {
            presenter,
            factory,
            sync: Some(sync),
            tracker: GpuFrameTracker::new(),
            dispatcher: Some(dispatcher),
            dispatch,
            window,
            gpu,
            frame_count: 0,
        })
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// GPU context with device and queues.
    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    /// Factory for buffers, textures, encoders and render passes.
    pub fn factory(&self) -> &ResourceFactory {
        &self.factory
    }

    /// Handle to the dispatch system.
    pub fn dispatch(&self) -> &DispatchHandle {
        &self.dispatch
    }

    /// Current swapchain extent. Zero before the first swapchain exists.
    pub fn extent(&self) -> vk::Extent2D {
        self.presenter.extent().unwrap_or_default()
    }

    /// Swapchain image format, once a swapchain exists.
    pub fn surface_format(&self) -> Option<vk::Format> {
        self.presenter.swapchain().map(cinder_gpu::Swapchain::format)
    }

    /// Get the aspect ratio (width / height).
    #[allow(clippy::cast_precision_loss)]
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    pub fn vsync(&self) -> bool {
        self.presenter.requested().vsync
    }

    /// Request vsync on or off. Takes effect at the start of the next frame.
    pub fn set_vsync(&mut self, vsync: bool) {
        self.presenter.set_vsync(vsync);
    }

    pub fn fullscreen(&self) -> bool {
        self.presenter.requested().fullscreen
    }

    /// Request fullscreen on or off. Takes effect at the start of the next frame.
    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        self.presenter.set_fullscreen(fullscreen);
    }

    /// Wait for every submitted frame, retiring their deferred work.
    pub(crate) fn wait_for_gpu(&mut self) {
        if !self.tracker.wait_all(FENCE_TIMEOUT, &self.dispatch) {
            tracing::warn!(
                outstanding = self.tracker.outstanding(),
                "Timed out waiting for in-flight frames"
            );
        }
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }
    }

    /// Tear everything down. The GPU must be idle.
    pub(crate) fn shutdown(self) {
        let Self {
            mut presenter,
            factory,
            sync,
            tracker,
            dispatcher,
            dispatch,
            window,
            gpu,
            frame_count,
        } = self;

        // Runs every deferred destruction, including retired swapchains.
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown();
        }
        presenter.detach();
        if let Some(sync) = sync {
            sync.destroy();
        }
        drop(tracker);
        drop(factory);
        drop(presenter);
        drop(dispatch);
        drop(window);
        drop(gpu);

        tracing::info!(frames = frame_count, "Cleanup complete");
    }
}
