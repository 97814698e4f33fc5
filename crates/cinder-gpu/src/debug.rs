//! Validation-layer message routing.
//!
//! Messages from `VK_EXT_debug_utils` are forwarded to `tracing` at the
//! matching level. A [`ValidationPolicy`] decides whether an error-severity
//! message terminates the process.

use std::ffi::{c_void, CStr};

use ash::vk;
use serde::Deserialize;

use crate::error::Result;

/// Lowest message severity that is forwarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    Verbose,
    Info,
    #[default]
    Warning,
    Error,
}

impl MessageSeverity {
    fn flags(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as F;
        match self {
            Self::Verbose => F::VERBOSE | F::INFO | F::WARNING | F::ERROR,
            Self::Info => F::INFO | F::WARNING | F::ERROR,
            Self::Warning => F::WARNING | F::ERROR,
            Self::Error => F::ERROR,
        }
    }
}

/// What to do with validation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Abort the process on an error-severity message.
    pub fatal_errors: bool,
    /// Lowest severity forwarded to the log.
    pub min_severity: MessageSeverity,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            fatal_errors: cfg!(debug_assertions),
            min_severity: MessageSeverity::Warning,
        }
    }
}

impl ValidationPolicy {
    /// Whether a message of this severity must terminate the process.
    #[must_use]
    pub fn is_fatal(&self, severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> bool {
        self.fatal_errors && severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
    }
}

/// An installed debug messenger. Must be destroyed before the instance.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
    // Read by the callback through the user-data pointer.
    policy: Box<ValidationPolicy>,
}

impl DebugMessenger {
    /// Install a messenger routing validation output through `policy`.
    ///
    /// # Safety
    /// The instance must be valid and created with the debug utils extension.
    pub unsafe fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        policy: ValidationPolicy,
    ) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let policy = Box::new(policy);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(policy.min_severity.flags())
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(std::ptr::from_ref::<ValidationPolicy>(&*policy).cast_mut().cast());

        let messenger = loader.create_debug_utils_messenger(&create_info, None)?;
        tracing::debug!(?policy, "Debug messenger installed");

        Ok(Self {
            loader,
            messenger,
            policy,
        })
    }

    /// Active policy.
    #[must_use]
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Remove the messenger.
    ///
    /// # Safety
    /// Must be called before the instance is destroyed.
    pub unsafe fn destroy(self) {
        self.loader.destroy_debug_utils_messenger(self.messenger, None);
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", ?message_type, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", ?message_type, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::debug!(target: "vulkan", ?message_type, "{message}");
    } else {
        tracing::trace!(target: "vulkan", ?message_type, "{message}");
    }

    let policy = user_data.cast::<ValidationPolicy>().as_ref();
    if policy.is_some_and(|policy| policy.is_fatal(severity)) {
        tracing::error!("Validation error is fatal, aborting");
        std::process::abort();
    }

    vk::FALSE
}
