//! Resource factory.
//!
//! Every object created here implements [`Destroyable`] and is meant to be
//! released through the dispatch system's frame-lifecycle helpers rather
//! than dropped. Dropping one without destroying it leaks the GPU object and
//! logs a warning.

use std::sync::Arc;

use ash::vk;
use cinder_core::ThreadRegistry;
use cinder_dispatch::Destroyable;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::command::ThreadCommandPools;
use crate::context::GpuContext;
use crate::encoder::{CommandEncoder, RenderPass, RenderPassDesc, RenderTarget};
use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};

/// Buffer creation parameters.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub name: String,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
}

/// A device buffer.
pub struct Buffer {
    name: String,
    allocator: Arc<Mutex<GpuAllocator>>,
    inner: Option<GpuBuffer>,
}

impl Buffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> vk::Buffer {
        self.inner.as_ref().map_or(vk::Buffer::null(), |b| b.buffer)
    }

    pub fn size(&self) -> u64 {
        self.inner.as_ref().map_or(0, |b| b.size)
    }

    /// Write plain data at `offset`. Only for host-visible buffers.
    pub fn write<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        match self.inner.as_mut() {
            Some(buffer) => buffer.write(offset, data),
            None => Ok(()),
        }
    }
}

impl Destroyable for Buffer {
    fn destroy(mut self) {
        if let Some(buffer) = self.inner.take() {
            if let Err(e) = self.allocator.lock().free_buffer(buffer) {
                tracing::error!(name = %self.name, error = %e, "Failed to free buffer");
            }
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::warn!(name = %self.name, "Buffer dropped without being destroyed");
        }
    }
}

/// A 2D device image with a default view.
pub struct Texture {
    name: String,
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    inner: Option<(GpuImage, vk::ImageView)>,
}

impl Texture {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn view(&self) -> vk::ImageView {
        self.inner.as_ref().map_or(vk::ImageView::null(), |(_, view)| *view)
    }

    /// The texture as a render target. `None` once destroyed.
    pub fn render_target(&self) -> Option<RenderTarget> {
        self.inner.as_ref().map(|(image, view)| RenderTarget {
            image: image.image,
            view: *view,
            format: image.format,
            extent: vk::Extent2D {
                width: image.extent.width,
                height: image.extent.height,
            },
        })
    }
}

impl Destroyable for Texture {
    fn destroy(mut self) {
        if let Some((image, view)) = self.inner.take() {
            unsafe { self.device.destroy_image_view(view, None) };
            if let Err(e) = self.allocator.lock().free_image(image) {
                tracing::error!(name = %self.name, error = %e, "Failed to free texture");
            }
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::warn!(name = %self.name, "Texture dropped without being destroyed");
        }
    }
}

/// Creates GPU objects for any registered thread.
#[derive(Clone)]
pub struct ResourceFactory {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    pools: Arc<ThreadCommandPools>,
}

impl ResourceFactory {
    /// Create a factory with one command pool per thread of `registry`.
    pub fn new(gpu: &GpuContext, registry: Arc<ThreadRegistry>) -> Result<Self> {
        let pools = unsafe {
            ThreadCommandPools::new(
                Arc::clone(gpu.device()),
                registry,
                gpu.graphics_queue_family(),
            )?
        };
        Ok(Self {
            device: Arc::clone(gpu.device()),
            allocator: Arc::clone(gpu.allocator()),
            pools: Arc::new(pools),
        })
    }

    /// Create a buffer.
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer> {
        let inner =
            self.allocator
                .lock()
                .create_buffer(desc.size, desc.usage, desc.location, &desc.name)?;
        tracing::trace!(name = %desc.name, size = desc.size, "Created buffer");
        Ok(Buffer {
            name: desc.name.clone(),
            allocator: Arc::clone(&self.allocator),
            inner: Some(inner),
        })
    }

    /// Create a device-local 2D texture.
    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Texture> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut allocator = self.allocator.lock();
        let image = allocator.create_image(&create_info, MemoryLocation::GpuOnly, &desc.name)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(color_subresource_range());
        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                if let Err(free) = allocator.free_image(image) {
                    tracing::error!(name = %desc.name, error = %free, "Failed to free texture");
                }
                return Err(e.into());
            }
        };
        drop(allocator);

        tracing::trace!(name = %desc.name, extent = ?desc.extent, "Created texture");
        Ok(Texture {
            name: desc.name.clone(),
            device: Arc::clone(&self.device),
            allocator: Arc::clone(&self.allocator),
            inner: Some((image, view)),
        })
    }

    /// Begin recording a command buffer from the calling thread's pool.
    pub fn create_command_encoder(&self) -> Result<CommandEncoder> {
        unsafe { CommandEncoder::new(Arc::clone(&self.pools)) }
    }

    /// Create a render pass.
    pub fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPass> {
        unsafe { RenderPass::new(Arc::clone(&self.device), *desc) }
    }
}

/// Single mip, single layer colour range.
pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}
