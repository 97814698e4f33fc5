//! Vulkan layer of the Cinder runtime.
//!
//! This crate provides:
//! - Instance, device and validation setup
//! - Memory allocation via gpu-allocator
//! - Per-thread command pools and command encoders
//! - GPU resources released through the frame lifecycle
//! - Swapchain handling and the presentation state machine

pub mod capabilities;
pub mod command;
pub mod context;
pub mod debug;
pub mod encoder;
pub mod error;
pub mod instance;
pub mod memory;
pub mod present_backend;
pub mod presenter;
pub mod resources;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use debug::{MessageSeverity, ValidationPolicy};
pub use encoder::{
    ColorLoad, CommandEncoder, FramebufferState, RenderPass, RenderPassDesc, RenderTarget,
};
pub use error::{GpuError, Result, Severity};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use present_backend::{PresentWindow, VulkanPresentBackend};
pub use presenter::{
    AcquireOutcome, PresentBackend, PresentSettings, Presenter, PresenterState, SwapchainRequest,
    WindowState,
};
pub use resources::{Buffer, BufferDesc, ResourceFactory, Texture, TextureDesc};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{Swapchain, SwapchainConfig};
pub use sync::{create_fence, create_semaphore, FrameSyncManager, VulkanFence};
