//! Vulkan instance creation and physical device selection.

use crate::capabilities::supports_vulkan_1_3;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Instance extensions needed to present to the given display.
///
/// # Errors
/// Fails if the platform has no Vulkan surface support.
pub fn required_instance_extensions(
    display: raw_window_handle::RawDisplayHandle,
    enable_validation: bool,
) -> Result<Vec<*const std::ffi::c_char>> {
    let mut extensions = ash_window::enumerate_required_extensions(display)?.to_vec();
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
    Ok(extensions)
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan instance.
///
/// Validation is silently dropped if the layer is not installed.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: raw_window_handle::RawDisplayHandle,
    enable_validation: bool,
) -> Result<(ash::Instance, bool)> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::InitializationFailed(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Cinder")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let validation = enable_validation && layer_available(entry, VALIDATION_LAYER)?;
    if enable_validation && !validation {
        tracing::warn!(
            "Validation layer {} not available",
            VALIDATION_LAYER.to_string_lossy()
        );
    }

    let extension_names = required_instance_extensions(display, validation)?;
    let layer_names: Vec<*const std::ffi::c_char> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok((instance, validation))
}

unsafe fn layer_available(entry: &ash::Entry, layer: &CStr) -> Result<bool> {
    let available = entry.enumerate_instance_layer_properties()?;
    Ok(available
        .iter()
        .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == layer))
}

/// Select the best physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    devices
        .into_iter()
        .map(|device| (score_physical_device(instance, device), device))
        .filter(|(score, _)| *score > 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Non-positive scores are unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = instance.get_physical_device_properties(device);
    if !supports_vulkan_1_3(properties.api_version) {
        return -1;
    }

    let has_swapchain = instance
        .enumerate_device_extension_properties(device)
        .unwrap_or_default()
        .iter()
        .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == ash::khr::swapchain::NAME);
    if !has_swapchain {
        return -1;
    }

    let mut score = 1;

    // Prefer discrete GPUs
    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // +1 per GB of device-local memory
    let memory = instance.get_physical_device_memory_properties(device);
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size >> 30)
        .sum();
    score + i64::try_from(vram_gb).unwrap_or(0)
}
