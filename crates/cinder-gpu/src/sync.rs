//! Synchronization primitives.

use crate::error::{GpuError, Result};
use ash::vk;
use cinder_dispatch::{Destroyable, FrameFence};
use std::sync::Arc;
use std::time::Duration;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid and the fence must not be pending.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Host view of a submission fence, tracked per frame.
#[derive(Clone)]
pub struct VulkanFence {
    device: Arc<ash::Device>,
    fence: vk::Fence,
}

impl VulkanFence {
    pub fn new(device: Arc<ash::Device>, fence: vk::Fence) -> Self {
        Self { device, fence }
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    fn report(result: vk::Result) -> bool {
        let error = GpuError::from(result);
        if error.is_fatal() {
            tracing::error!(%error, "Fence wait failed, aborting");
            std::process::abort();
        }
        tracing::warn!(%error, "Fence query failed");
        false
    }
}

impl FrameFence for VulkanFence {
    fn is_signaled(&self) -> bool {
        match unsafe { self.device.get_fence_status(self.fence) } {
            Ok(signaled) => signaled,
            Err(e) => Self::report(e),
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) } {
            Ok(()) => true,
            Err(vk::Result::TIMEOUT) => false,
            Err(e) => Self::report(e),
        }
    }
}

/// One submission fence per frame-in-flight slot.
pub struct FrameSyncManager {
    device: Arc<ash::Device>,
    fences: Vec<vk::Fence>,
}

impl FrameSyncManager {
    /// Create `frames_in_flight` unsignalled fences.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: Arc<ash::Device>, frames_in_flight: usize) -> Result<Self> {
        let mut manager = Self {
            device,
            fences: Vec::with_capacity(frames_in_flight),
        };
        for _ in 0..frames_in_flight {
            let fence = create_fence(&manager.device, false)?;
            manager.fences.push(fence);
        }
        Ok(manager)
    }

    /// Slot used by `frame`.
    pub fn slot(&self, frame: u64) -> usize {
        // Bounded by the slot count, which is a small usize.
        (frame % self.fences.len() as u64) as usize
    }

    /// Reset the fence of `frame`'s slot and return it for submission.
    ///
    /// # Safety
    /// The previous submission on this slot must have completed.
    pub unsafe fn begin(&self, frame: u64) -> Result<VulkanFence> {
        let fence = self.fences[self.slot(frame)];
        reset_fence(&self.device, fence)?;
        Ok(VulkanFence::new(Arc::clone(&self.device), fence))
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

impl Destroyable for FrameSyncManager {
    fn destroy(self) {
        for fence in &self.fences {
            unsafe { self.device.destroy_fence(*fence, None) };
        }
    }
}
