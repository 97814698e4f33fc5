//! Runtime configuration.

use cinder_dispatch::DispatchConfig;
use cinder_gpu::{MessageSeverity, ValidationPolicy};
use serde::Deserialize;

/// Runtime configuration.
///
/// Deserializable so a loader outside this crate can hand over plain values;
/// missing fields take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Enable vsync.
    pub vsync: bool,
    /// Start in borderless fullscreen.
    pub fullscreen: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Abort on error-severity validation messages.
    pub validation_fatal: bool,
    /// Lowest validation message severity forwarded to the log.
    pub min_message_severity: MessageSeverity,
    /// Background pool size. `None` sizes it from the available cores.
    pub background_workers: Option<usize>,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            title: "Cinder".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            fullscreen: false,
            validation: cfg!(debug_assertions),
            validation_fatal: cfg!(debug_assertions),
            min_message_severity: MessageSeverity::Warning,
            background_workers: None,
            target_fps: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable vsync.
    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Start fullscreen or windowed.
    #[must_use]
    pub const fn with_fullscreen(mut self, fullscreen: bool) -> Self {
        self.fullscreen = fullscreen;
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Make error-severity validation messages fatal.
    #[must_use]
    pub const fn with_validation_fatal(mut self, fatal: bool) -> Self {
        self.validation_fatal = fatal;
        self
    }

    #[must_use]
    pub const fn with_min_message_severity(mut self, severity: MessageSeverity) -> Self {
        self.min_message_severity = severity;
        self
    }

    /// Set the background pool size.
    #[must_use]
    pub const fn with_background_workers(mut self, workers: usize) -> Self {
        self.background_workers = Some(workers);
        self
    }

    /// Set the target FPS.
    #[must_use]
    pub const fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Validation policy, or `None` with validation disabled.
    pub fn validation_policy(&self) -> Option<ValidationPolicy> {
        self.validation.then_some(ValidationPolicy {
            fatal_errors: self.validation_fatal,
            min_severity: self.min_message_severity,
        })
    }

    /// Dispatch configuration derived from this config.
    pub fn dispatch_config(&self) -> DispatchConfig {
        let config = DispatchConfig::default();
        match self.background_workers {
            Some(workers) => {
                config.with_background_workers(u32::try_from(workers).unwrap_or(u32::MAX))
            }
            None => config,
        }
    }
}
