//! Vulkan presentation backend for a window.

use std::sync::Arc;

use ash::vk;
use cinder_core::constants::MAX_FRAMES_IN_FLIGHT;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::context::GpuContext;
use crate::error::Result;
use crate::presenter::{AcquireOutcome, PresentBackend, SwapchainRequest, WindowState};
use crate::surface::SurfaceContext;
use crate::swapchain::{calculate_extent, select_surface_format, Swapchain, SwapchainConfig};
use crate::sync::create_semaphore;

/// A window the renderer can present to.
pub trait PresentWindow: HasWindowHandle + HasDisplayHandle {
    /// Drawable size in pixels. Zero while minimised.
    fn inner_extent(&self) -> vk::Extent2D;

    fn is_fullscreen(&self) -> bool;

    fn set_fullscreen(&self, fullscreen: bool);
}

/// [`PresentBackend`] over a Vulkan surface.
///
/// Acquire semaphores form a ring one longer than the number of frames in
/// flight, so the semaphore for an acquire issued right after a present is
/// never one a queued submission still waits on.
pub struct VulkanPresentBackend<W: PresentWindow> {
    surface: SurfaceContext,
    device: Arc<ash::Device>,
    present_queue: vk::Queue,
    acquire_semaphores: Vec<vk::Semaphore>,
    next_semaphore: usize,
    last_acquire: Option<usize>,
    destroyed: bool,
    window: W,
}

impl<W: PresentWindow> VulkanPresentBackend<W> {
    /// Create the window surface and the acquire semaphores.
    pub fn new(gpu: &GpuContext, window: W) -> Result<Self> {
        // The window is owned by the backend and outlives the surface.
        let surface = unsafe { SurfaceContext::from_window(gpu, &window)? };
        let device = Arc::clone(gpu.device());

        let mut acquire_semaphores = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT + 1);
        for _ in 0..=MAX_FRAMES_IN_FLIGHT {
            match unsafe { create_semaphore(&device) } {
                Ok(semaphore) => acquire_semaphores.push(semaphore),
                Err(e) => {
                    unsafe {
                        for semaphore in acquire_semaphores {
                            device.destroy_semaphore(semaphore, None);
                        }
                        surface.destroy();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            surface,
            device,
            present_queue: gpu.graphics_queue(),
            acquire_semaphores,
            next_semaphore: 0,
            last_acquire: None,
            destroyed: false,
            window,
        })
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    pub fn surface(&self) -> &SurfaceContext {
        &self.surface
    }

    /// Semaphore signalled by the most recent acquire. A frame rendering into
    /// the acquired image waits on it.
    pub fn acquire_semaphore(&self) -> Option<vk::Semaphore> {
        self.last_acquire
            .and_then(|slot| self.acquire_semaphores.get(slot).copied())
    }
}

impl<W: PresentWindow> PresentBackend for VulkanPresentBackend<W> {
    type Swapchain = Swapchain;

    fn supported_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(self.surface.capabilities()?.present_modes)
    }

    fn window_state(&self) -> WindowState {
        WindowState {
            extent: self.window.inner_extent(),
            fullscreen: self.window.is_fullscreen(),
        }
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.window.set_fullscreen(fullscreen);
    }

    fn create_swapchain(
        &mut self,
        request: &SwapchainRequest,
        old: Option<&Swapchain>,
    ) -> Result<Swapchain> {
        let caps = self.surface.capabilities()?;
        let config = SwapchainConfig {
            surface_format: select_surface_format(&caps.formats)?,
            present_mode: request.present_mode,
            extent: calculate_extent(
                &caps.capabilities,
                request.extent.width,
                request.extent.height,
            ),
            vsync: request.vsync,
        };
        unsafe {
            Swapchain::new(
                Arc::clone(&self.device),
                self.surface.swapchain_loader.clone(),
                self.surface.surface,
                &caps.capabilities,
                config,
                old,
            )
        }
    }

    fn swapchain_extent(&self, swapchain: &Swapchain) -> vk::Extent2D {
        swapchain.extent()
    }

    fn acquire(&mut self, swapchain: &mut Swapchain) -> Result<AcquireOutcome> {
        let slot = self.next_semaphore;
        let semaphore = self.acquire_semaphores[slot];
        match unsafe { swapchain.acquire_next_image(semaphore, u64::MAX)? } {
            Some((index, suboptimal)) => {
                self.last_acquire = Some(slot);
                self.next_semaphore = (slot + 1) % self.acquire_semaphores.len();
                Ok(AcquireOutcome::Acquired { index, suboptimal })
            }
            None => Ok(AcquireOutcome::OutOfDate),
        }
    }

    fn present(&mut self, swapchain: &mut Swapchain, image: u32) -> Result<bool> {
        self.last_acquire = None;
        unsafe { swapchain.present(self.present_queue, image) }
    }

    fn abandon_acquire(&mut self, swapchain: &mut Swapchain) -> Result<()> {
        let Some(slot) = self.last_acquire.take() else {
            return Ok(());
        };
        // The signal is never waited on, so the semaphore cannot be reused.
        let fresh = unsafe { create_semaphore(&self.device)? };
        let signalled = std::mem::replace(&mut self.acquire_semaphores[slot], fresh);
        swapchain.retire_semaphore(signalled);
        Ok(())
    }

    fn destroy_surface(&mut self) {
        if self.destroyed {
            return;
        }
        unsafe {
            for semaphore in self.acquire_semaphores.drain(..) {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.surface.destroy();
        }
        self.destroyed = true;
    }
}

impl<W: PresentWindow> Drop for VulkanPresentBackend<W> {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!("Presentation surface dropped without being destroyed");
        }
    }
}
