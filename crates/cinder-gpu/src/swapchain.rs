//! Swapchain management.

use crate::encoder::RenderTarget;
use crate::error::{GpuError, Result};
use crate::resources::color_subresource_range;
use crate::sync::create_semaphore;
use ash::vk;
use cinder_dispatch::Destroyable;
use std::sync::Arc;

/// Present modes tried with vsync on, best first.
pub const VSYNC_PRESENT_MODES: [vk::PresentModeKHR; 3] = [
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::FIFO_RELAXED,
    vk::PresentModeKHR::FIFO,
];

/// Present modes tried with vsync off, best first.
pub const NO_VSYNC_PRESENT_MODES: [vk::PresentModeKHR; 2] =
    [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];

/// Parameters for building a swapchain.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub vsync: bool,
}

/// Swapchain wrapper.
///
/// Owns one render-finished semaphore per image, so a semaphore is never
/// re-signalled while a present of the same image may still wait on it.
pub struct Swapchain {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
    pub(crate) handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    render_finished: Vec<vk::Semaphore>,
    // Acquire semaphores retired with an unpresented image.
    retired: Vec<vk::Semaphore>,
    config: SwapchainConfig,
}

impl Swapchain {
    /// Create a new swapchain.
    ///
    /// # Safety
    /// All handles must be valid, and `old` must belong to the same surface.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        loader: ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        surface_capabilities: &vk::SurfaceCapabilitiesKHR,
        config: SwapchainConfig,
        old: Option<&Self>,
    ) -> Result<Self> {
        let image_count = select_image_count(surface_capabilities);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.handle));

        let handle = loader.create_swapchain(&create_info, None)?;

        let mut swapchain = Self {
            device,
            loader,
            handle,
            images: Vec::new(),
            image_views: Vec::new(),
            render_finished: Vec::new(),
            retired: Vec::new(),
            config,
        };

        // On failure the partially built swapchain tears itself down.
        if let Err(e) = swapchain.create_image_resources() {
            swapchain.release();
            return Err(e);
        }

        tracing::info!(
            extent = ?config.extent,
            present_mode = ?config.present_mode,
            images = swapchain.images.len(),
            "Created swapchain"
        );
        Ok(swapchain)
    }

    unsafe fn create_image_resources(&mut self) -> Result<()> {
        self.images = self.loader.get_swapchain_images(self.handle)?;
        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.config.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(color_subresource_range());
            self.image_views
                .push(self.device.create_image_view(&view_info, None)?);
            self.render_finished.push(create_semaphore(&self.device)?);
        }
        Ok(())
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    pub fn format(&self) -> vk::Format {
        self.config.surface_format.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.config.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Image `index` as a render target.
    pub fn render_target(&self, index: u32) -> Option<RenderTarget> {
        let i = index as usize;
        Some(RenderTarget {
            image: *self.images.get(i)?,
            view: *self.image_views.get(i)?,
            format: self.format(),
            extent: self.extent(),
        })
    }

    /// Semaphore the frame rendering into image `index` must signal before present.
    pub fn render_finished(&self, index: u32) -> vk::Semaphore {
        self.render_finished
            .get(index as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Take ownership of an acquire semaphore that is left signalled.
    pub(crate) fn retire_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.retired.push(semaphore);
    }

    /// Acquire the next image. `Ok(None)` means the swapchain is out of date.
    ///
    /// # Safety
    /// `semaphore` must be unsignalled with no pending operations.
    pub unsafe fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<Option<(u32, bool)>> {
        match self
            .loader
            .acquire_next_image(self.handle, timeout_ns, semaphore, vk::Fence::null())
        {
            Ok((index, suboptimal)) => Ok(Some((index, suboptimal))),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present image `index`. Returns whether the swapchain still matches its
    /// surface.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn present(&self, queue: vk::Queue, index: u32) -> Result<bool> {
        let wait = [self.render_finished(index)];
        let swapchains = [self.handle];
        let image_indices = [index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(!suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(false),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    fn release(&mut self) {
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            for semaphore in self.render_finished.drain(..).chain(self.retired.drain(..)) {
                self.device.destroy_semaphore(semaphore, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.handle, None);
                self.handle = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }
}

impl Destroyable for Swapchain {
    fn destroy(mut self) {
        tracing::debug!(extent = ?self.config.extent, "Destroying swapchain");
        self.release();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if self.handle != vk::SwapchainKHR::null() {
            tracing::warn!("Swapchain dropped without being destroyed");
        }
    }
}

/// `min + 1` images, clamped to the surface maximum when it has one.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Select the best surface format: sRGB BGRA if offered, else the first.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SurfaceCreation("Surface reports no formats".to_string()))
}

/// First supported mode from the preference list for `vsync`.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    vsync: bool,
) -> Result<vk::PresentModeKHR> {
    let preferred: &[vk::PresentModeKHR] = if vsync {
        &VSYNC_PRESENT_MODES
    } else {
        &NO_VSYNC_PRESENT_MODES
    };
    preferred
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .ok_or(GpuError::NoSupportedPresentMode { vsync })
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    } else {
        capabilities.current_extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_prefers_mailbox_then_relaxed_then_fifo() {
        use vk::PresentModeKHR as M;
        let all = [M::FIFO, M::IMMEDIATE, M::FIFO_RELAXED, M::MAILBOX];
        assert_eq!(select_present_mode(&all, true).unwrap(), M::MAILBOX);
        assert_eq!(select_present_mode(&all[..3], true).unwrap(), M::FIFO_RELAXED);
        assert_eq!(select_present_mode(&[M::FIFO, M::IMMEDIATE], true).unwrap(), M::FIFO);
    }

    #[test]
    fn no_vsync_prefers_immediate_and_never_mailbox() {
        use vk::PresentModeKHR as M;
        assert_eq!(select_present_mode(&[M::FIFO, M::IMMEDIATE], false).unwrap(), M::IMMEDIATE);
        assert_eq!(select_present_mode(&[M::MAILBOX, M::FIFO], false).unwrap(), M::FIFO);
    }

    #[test]
    fn missing_fifo_is_reported() {
        assert!(matches!(
            select_present_mode(&[vk::PresentModeKHR::MAILBOX], false),
            Err(GpuError::NoSupportedPresentMode { vsync: false })
        ));
        assert!(select_present_mode(&[], true).is_err());
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            ..unorm
        };
        assert_eq!(select_surface_format(&[unorm, srgb]).unwrap().format, srgb.format);
        assert_eq!(select_surface_format(&[unorm]).unwrap().format, unorm.format);
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn extent_follows_surface_or_clamps_request() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        assert_eq!(calculate_extent(&caps, 10, 10), caps.current_extent);

        caps.current_extent.width = u32::MAX;
        assert_eq!(
            calculate_extent(&caps, 4000, 0),
            vk::Extent2D {
                width: 1024,
                height: 1
            }
        );
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(select_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(select_image_count(&caps), 2);
    }
}
