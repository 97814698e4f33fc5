//! GPU error types.
//!
//! Raw `vk::Result` codes are translated here, once. Nothing above this
//! crate matches on Vulkan result codes.

use ash::vk;
use thiserror::Error;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The device can no longer be trusted. Log and terminate.
    Fatal,
    /// Reported to the caller, who may retry or degrade.
    Recoverable,
    /// An expected signal, such as a stale swapchain.
    Transient,
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// The logical device was lost.
    #[error("Device lost")]
    DeviceLost,

    /// Host or device memory is exhausted.
    #[error("Out of {0} memory")]
    OutOfMemory(&'static str),

    /// Instance, device or loader setup failed.
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// An implementation object limit was hit.
    #[error("Too many objects")]
    TooManyObjects,

    /// The swapchain no longer matches its surface.
    #[error("Swapchain is out of date")]
    SurfaceOutOfDate,

    /// The surface was destroyed underneath the swapchain.
    #[error("Surface lost")]
    SurfaceLost,

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// The surface advertises none of the acceptable present modes.
    #[error("No supported present mode for vsync={vsync}")]
    NoSupportedPresentMode { vsync: bool },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Per-thread resources were requested from an unregistered thread.
    #[error("Calling thread is not registered for GPU work")]
    UnregisteredThread,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Any other Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfMemory("host"),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_POOL_MEMORY => {
                Self::OutOfMemory("device")
            }
            vk::Result::ERROR_INITIALIZATION_FAILED
            | vk::Result::ERROR_INCOMPATIBLE_DRIVER
            | vk::Result::ERROR_LAYER_NOT_PRESENT
            | vk::Result::ERROR_EXTENSION_NOT_PRESENT
            | vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::InitializationFailed(result.to_string()),
            vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SurfaceOutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            other => Self::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for GpuError {
    fn from(error: gpu_allocator::AllocationError) -> Self {
        match error {
            gpu_allocator::AllocationError::OutOfMemory => Self::OutOfMemory("device"),
            other => Self::AllocationFailed(other.to_string()),
        }
    }
}

impl GpuError {
    /// Classify this error.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::DeviceLost
            | Self::OutOfMemory(_)
            | Self::InitializationFailed(_)
            | Self::TooManyObjects
            | Self::NoSuitableDevice => Severity::Fatal,
            Self::SurfaceOutOfDate => Severity::Transient,
            _ => Severity::Recoverable,
        }
    }

    /// Whether the device state can no longer be trusted.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.severity(), Severity::Fatal)
    }
}

/// Pass non-fatal results through; log and abort the process on fatal ones.
pub fn abort_on_fatal<T>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "Fatal GPU error, aborting");
            std::process::abort();
        }
        other => other,
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_codes_translate_into_taxonomy() {
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            GpuError::SurfaceOutOfDate
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_FRAGMENTATION),
            GpuError::Vulkan(vk::Result::ERROR_FRAGMENTATION)
        ));
    }

    #[test]
    fn severities() {
        assert_eq!(GpuError::DeviceLost.severity(), Severity::Fatal);
        assert_eq!(GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).severity(), Severity::Fatal);
        assert_eq!(GpuError::TooManyObjects.severity(), Severity::Fatal);
        assert_eq!(GpuError::SurfaceOutOfDate.severity(), Severity::Transient);
        assert_eq!(GpuError::SurfaceLost.severity(), Severity::Recoverable);
        assert_eq!(
            GpuError::NoSupportedPresentMode { vsync: false }.severity(),
            Severity::Recoverable
        );
    }

    #[test]
    fn non_fatal_results_pass_through() {
        assert!(abort_on_fatal(Ok::<_, GpuError>(3)).is_ok());
        assert!(matches!(
            abort_on_fatal::<()>(Err(GpuError::SurfaceOutOfDate)),
            Err(GpuError::SurfaceOutOfDate)
        ));
    }
}
