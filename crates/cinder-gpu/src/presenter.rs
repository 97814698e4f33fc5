//! Presentation state machine.
//!
//! `Uninitialized -> Attached -> (Presenting <-> Recreating) -> Detached`.
//!
//! [`Presenter`] owns the active swapchain on the render thread. A swapchain
//! is never mutated: when the window extent, vsync or fullscreen state
//! drifts from what it was built for, or presentation reports it stale, a
//! new one is built with the old one as the recreation hint, and the old one
//! is handed to the dispatch system for destruction once the last frame that
//! used it has finished on the GPU.
//!
//! The swapchain always holds an acquired image between frames: one is
//! acquired right after attach, after each successful present and after
//! each recreation.

use ash::vk;
use cinder_dispatch::{Destroyable, DispatchHandle};

use crate::error::{GpuError, Result};
use crate::swapchain::select_present_mode;

/// Observable window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub extent: vk::Extent2D,
    pub fullscreen: bool,
}

impl WindowState {
    /// Whether the window has no drawable area, e.g. while minimised.
    #[must_use]
    pub const fn is_minimized(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// What a swapchain is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainRequest {
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub vsync: bool,
}

/// Result of an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready to be rendered into.
    Acquired { index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface; nothing was acquired.
    OutOfDate,
}

/// Device, surface and window operations the presenter drives.
pub trait PresentBackend {
    type Swapchain: Destroyable;

    /// Present modes the surface supports.
    fn supported_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>>;

    /// Current window extent and fullscreen state.
    fn window_state(&self) -> WindowState;

    /// Ask the window system for a fullscreen change. May apply later.
    fn set_fullscreen(&mut self, fullscreen: bool);

    /// Build a swapchain. `old` is the one being replaced, if any.
    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        old: Option<&Self::Swapchain>,
    ) -> Result<Self::Swapchain>;

    /// Extent the swapchain was actually built with.
    fn swapchain_extent(&self, swapchain: &Self::Swapchain) -> vk::Extent2D;

    fn acquire(&mut self, swapchain: &mut Self::Swapchain) -> Result<AcquireOutcome>;

    /// Present `image`. Returns whether the swapchain is still valid.
    fn present(&mut self, swapchain: &mut Self::Swapchain, image: u32) -> Result<bool>;

    /// An acquired image will never be presented because `swapchain` is
    /// being replaced.
    fn abandon_acquire(&mut self, _swapchain: &mut Self::Swapchain) -> Result<()> {
        Ok(())
    }

    /// Destroy the surface. Every swapchain is already gone.
    fn destroy_surface(&mut self);
}

/// Presentation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterState {
    Uninitialized,
    Attached,
    Presenting,
    Recreating,
    Detached,
}

/// Requested presentation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresentSettings {
    pub vsync: bool,
    pub fullscreen: bool,
}

/// Presentation state machine over a [`PresentBackend`].
pub struct Presenter<B: PresentBackend> {
    backend: B,
    dispatch: DispatchHandle,
    state: PresenterState,
    swapchain: Option<B::Swapchain>,
    built_for: Option<SwapchainRequest>,
    acquired: Option<u32>,
    requested: PresentSettings,
    // Last fullscreen request passed to the window system.
    fullscreen_applied: Option<bool>,
    stale: bool,
    last_frame: u64,
    recreations: u64,
}

impl<B: PresentBackend> Presenter<B> {
    /// A presenter with no swapchain yet.
    pub fn new(backend: B, dispatch: DispatchHandle) -> Self {
        Self {
            backend,
            dispatch,
            state: PresenterState::Uninitialized,
            swapchain: None,
            built_for: None,
            acquired: None,
            requested: PresentSettings::default(),
            fullscreen_applied: None,
            stale: false,
            last_frame: 0,
            recreations: 0,
        }
    }

    /// Build the first swapchain and acquire its first image.
    ///
    /// A minimised window leaves the presenter attached without a swapchain
    /// until [`Self::maintain`] sees a drawable extent.
    pub fn attach(&mut self, vsync: bool, width: u32, height: u32) -> Result<()> {
        if self.state != PresenterState::Uninitialized {
            return Err(GpuError::InvalidState(format!(
                "Cannot attach a presenter in state {:?}",
                self.state
            )));
        }
        self.requested.vsync = vsync;
        self.requested.fullscreen = self.backend.window_state().fullscreen;
        self.state = PresenterState::Attached;

        let extent = vk::Extent2D { width, height };
        if extent.width == 0 || extent.height == 0 {
            tracing::debug!("Window minimised at attach, deferring swapchain");
            return Ok(());
        }
        self.rebuild(extent)
    }

    /// Image acquired for the next frame, acquiring one if needed.
    ///
    /// `None` while the swapchain is stale or the window is minimised.
    pub fn acquire(&mut self) -> Result<Option<u32>> {
        if self.acquired.is_some() {
            return Ok(self.acquired);
        }
        let Some(swapchain) = self.swapchain.as_mut() else {
            return Ok(None);
        };
        if self.stale {
            return Ok(None);
        }

        match self.backend.acquire(swapchain)? {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    tracing::debug!("Acquired image from suboptimal swapchain");
                    self.stale = true;
                }
                self.acquired = Some(index);
            }
            AcquireOutcome::OutOfDate => {
                tracing::debug!("Swapchain out of date on acquire");
                self.stale = true;
            }
        }
        Ok(self.acquired)
    }

    /// Present the acquired image for `frame`, then acquire the next one.
    ///
    /// Returns `false` when the swapchain has gone stale and must be rebuilt
    /// by [`Self::maintain`] before the next acquire.
    pub fn present(&mut self, frame: u64) -> Result<bool> {
        let (Some(swapchain), Some(image)) = (self.swapchain.as_mut(), self.acquired.take()) else {
            return Err(GpuError::InvalidState(
                "Present without an acquired image".to_string(),
            ));
        };
        self.last_frame = self.last_frame.max(frame);

        let valid = match self.backend.present(swapchain, image) {
            Ok(valid) => valid,
            Err(GpuError::SurfaceOutOfDate) => false,
            Err(e) => return Err(e),
        };
        if !valid {
            tracing::debug!(frame, "Swapchain stale after present");
            self.stale = true;
            return Ok(false);
        }

        self.acquire()?;
        Ok(!self.stale)
    }

    /// Per-frame policy: compare the window and the requested settings with
    /// what the swapchain was built for, and rebuild it on any drift.
    ///
    /// Returns whether a new swapchain was built.
    pub fn maintain(&mut self) -> Result<bool> {
        if !matches!(
            self.state,
            PresenterState::Attached | PresenterState::Presenting
        ) {
            return Ok(false);
        }

        let mut window = self.backend.window_state();
        if window.fullscreen != self.requested.fullscreen
            && self.fullscreen_applied != Some(self.requested.fullscreen)
        {
            tracing::info!(fullscreen = self.requested.fullscreen, "Switching fullscreen");
            self.backend.set_fullscreen(self.requested.fullscreen);
            self.fullscreen_applied = Some(self.requested.fullscreen);
            self.stale = true;
            window = self.backend.window_state();
        }

        if let Some(built) = self.built_for {
            if built.vsync != self.requested.vsync {
                tracing::info!(vsync = self.requested.vsync, "Vsync changed");
                self.stale = true;
            }
            if built.extent != window.extent {
                self.stale = true;
            }
        }

        if window.is_minimized() {
            return Ok(false);
        }

        if self.stale || self.swapchain.is_none() {
            self.rebuild(window.extent)?;
            return Ok(true);
        }

        self.acquire()?;
        Ok(false)
    }

    fn rebuild(&mut self, extent: vk::Extent2D) -> Result<()> {
        let previous = self.state;
        self.state = PresenterState::Recreating;

        let result = self.build_replacement(extent);
        match result {
            Ok(()) => {
                self.state = PresenterState::Presenting;
                self.acquire()?;
                Ok(())
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    fn build_replacement(&mut self, extent: vk::Extent2D) -> Result<()> {
        let modes = self.backend.supported_present_modes()?;
        let present_mode = select_present_mode(&modes, self.requested.vsync)?;
        let mut request = SwapchainRequest {
            extent,
            present_mode,
            vsync: self.requested.vsync,
        };

        if let (Some(old), Some(_)) = (self.swapchain.as_mut(), self.acquired) {
            self.backend.abandon_acquire(old)?;
            self.acquired = None;
        }

        let new = self
            .backend
            .create_swapchain(&request, self.swapchain.as_ref())?;
        request.extent = self.backend.swapchain_extent(&new);

        if let Some(old) = self.swapchain.replace(new) {
            // The last frame's fence covers its rendering but not the present
            // that waits on `render_finished`, nor the signal of a retired
            // acquire semaphore. The next frame's fence is queued behind
            // both on the same queue. That is still not a formal guarantee;
            // only present fences (VK_EXT_swapchain_maintenance1) give one.
            self.dispatch
                .destroy_after_gpu_frame(old, self.last_frame + 1);
        }
        self.built_for = Some(request);
        self.stale = false;
        self.recreations += 1;
        tracing::debug!(
            extent = ?request.extent,
            present_mode = ?request.present_mode,
            recreations = self.recreations,
            "Swapchain rebuilt"
        );
        Ok(())
    }

    /// Destroy the swapchain and the surface.
    ///
    /// The caller must have waited for all GPU work.
    pub fn detach(&mut self) {
        if self.state == PresenterState::Detached {
            return;
        }
        self.acquired = None;
        if let Some(swapchain) = self.swapchain.take() {
            swapchain.destroy();
        }
        self.built_for = None;
        self.backend.destroy_surface();
        self.state = PresenterState::Detached;
        tracing::debug!("Presenter detached");
    }

    /// Request a vsync setting; applied by the next [`Self::maintain`].
    pub fn set_vsync(&mut self, vsync: bool) {
        self.requested.vsync = vsync;
    }

    /// Request a fullscreen setting; applied by the next [`Self::maintain`].
    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        self.requested.fullscreen = fullscreen;
        self.fullscreen_applied = None;
    }

    pub fn requested(&self) -> PresentSettings {
        self.requested
    }

    pub fn state(&self) -> PresenterState {
        self.state
    }

    /// Extent of the active swapchain.
    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.built_for.map(|built| built.extent)
    }

    /// Present mode of the active swapchain.
    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        self.built_for.map(|built| built.present_mode)
    }

    /// Image acquired for the next frame, if any.
    pub fn acquired_image(&self) -> Option<u32> {
        self.acquired
    }

    pub fn swapchain(&self) -> Option<&B::Swapchain> {
        self.swapchain.as_ref()
    }

    /// Whether the swapchain must be rebuilt before the next acquire.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Number of swapchains built so far.
    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: PresentBackend> Drop for Presenter<B> {
    fn drop(&mut self) {
        if self.state != PresenterState::Detached && self.state != PresenterState::Uninitialized {
            tracing::warn!(state = ?self.state, "Presenter dropped without detach");
        }
    }
}
