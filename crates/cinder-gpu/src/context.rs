//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::debug::{DebugMessenger, ValidationPolicy};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Instance, device and queues. Dropped last, after every resource.
pub struct GpuContext {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) debug: Option<DebugMessenger>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Arc<Mutex<GpuAllocator>>,

    pub(crate) queue_families: QueueFamilyIndices,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) compute_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
}

impl GpuContext {
    /// Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Logical device.
    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Shared allocator used by the resource factory.
    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.queue_families.graphics
    }

    pub fn compute_queue_family(&self) -> u32 {
        self.queue_families.compute
    }

    pub fn transfer_queue_family(&self) -> u32 {
        self.queue_families.transfer
    }

    /// Whether validation layers are active.
    pub fn validation_enabled(&self) -> bool {
        self.debug.is_some()
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees every VkDeviceMemory block; must precede device destruction.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
        tracing::debug!("GPU context destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    validation: Option<ValidationPolicy>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Cinder".to_string(),
            validation: cfg!(debug_assertions).then(ValidationPolicy::default),
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable validation layers with `policy`, or disable them with `None`.
    #[must_use]
    pub fn validation(mut self, policy: Option<ValidationPolicy>) -> Self {
        self.validation = policy;
        self
    }

    /// Build the context for presenting to `display`.
    pub fn build(self, display: raw_window_handle::RawDisplayHandle) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let (instance, validation) = unsafe {
            create_instance(&entry, &self.app_name, display, self.validation.is_some())
        }?;

        let debug = match self.validation {
            Some(policy) if validation => {
                Some(unsafe { DebugMessenger::new(&entry, &instance, policy) }?)
            }
            _ => None,
        };

        let physical_device = unsafe { select_physical_device(&instance) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_families = unsafe { find_queue_families(&instance, physical_device) }?;
        let (device, graphics_queue, compute_queue, transfer_queue) =
            unsafe { create_device(&instance, physical_device, &queue_families)? };
        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, Arc::clone(&device), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            debug,
            physical_device,
            device,
            capabilities,
            allocator: Arc::new(Mutex::new(allocator)),
            queue_families,
            graphics_queue,
            compute_queue,
            transfer_queue,
        })
    }
}

/// Queue family indices.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
    transfer: u32,
}

/// Find queue families for graphics, compute, and transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics_family = None;
    let mut compute_family = None;
    let mut transfer_family = None;

    for (i, family) in (0u32..).zip(&queue_families) {
        let flags = family.queue_flags;

        // Dedicated compute queue (no graphics)
        if flags.contains(vk::QueueFlags::COMPUTE)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        // Dedicated transfer queue (no graphics or compute)
        if flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        if flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    let graphics = graphics_family.ok_or(GpuError::NoSuitableDevice)?;
    let compute = compute_family.unwrap_or(graphics);
    let transfer = transfer_family.unwrap_or(compute);

    Ok(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    })
}

/// Create the logical device and retrieve queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
) -> Result<(ash::Device, vk::Queue, vk::Queue, vk::Queue)> {
    let mut unique_families = vec![
        queue_families.graphics,
        queue_families.compute,
        queue_families.transfer,
    ];
    unique_families.sort_unstable();
    unique_families.dedup();

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names = [ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance.create_device(physical_device, &device_create_info, None)?;

    let graphics_queue = device.get_device_queue(queue_families.graphics, 0);
    let compute_queue = device.get_device_queue(queue_families.compute, 0);
    let transfer_queue = device.get_device_queue(queue_families.transfer, 0);

    Ok((device, graphics_queue, compute_queue, transfer_queue))
}
