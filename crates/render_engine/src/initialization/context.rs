//! Vulkan instance, device selection, and device context
//!
//! Owns the process-wide Vulkan handles: instance (plus debug messenger in
//! debug builds), the selected physical device, and the logical device with
//! its single unified graphics+present queue. Everything above this module
//! borrows handles from here; the context is destroyed last.

use std::ffi::{CStr, CString};

#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface as SurfaceLoader, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use thiserror::Error;

use crate::config::RendererConfig;

/// Engine error type
#[derive(Error, Debug)]
pub enum GpuError {
    /// Raw Vulkan API error
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Device memory allocation failed; fatal, never retried
    #[error("allocation of {requested} bytes failed: {cause:?}")]
    AllocationFailed {
        /// Number of bytes requested from the allocator
        requested: u64,
        /// Underlying Vulkan result
        cause: vk::Result,
    },

    /// The device was lost during a wait or submission
    #[error("device lost")]
    DeviceLost,

    /// Instance/device/surface bring-up failed
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Caller violated an API contract
    #[error("invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },
}

impl GpuError {
    /// Classify a raw Vulkan result, folding device loss into its own variant.
    pub fn from_vk(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
            other => GpuError::Api(other),
        }
    }
}

/// Result type for engine operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Vulkan instance wrapper with RAII cleanup
pub struct GpuInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (debug builds)
    #[cfg(debug_assertions)]
    debug_utils: Option<DebugUtils>,
    /// Debug messenger handle (debug builds)
    #[cfg(debug_assertions)]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl GpuInstance {
    /// Create a Vulkan instance with the surface extensions the display needs
    pub fn new(display: RawDisplayHandle, config: &RendererConfig) -> GpuResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            GpuError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e))
        })?;

        let app_name = CString::new(config.application_name.as_str()).unwrap_or_default();
        let (major, minor, patch) = config.application_version;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(&app_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            // Timeline semaphores are core in 1.2
            .api_version(vk::API_VERSION_1_2);

        let required_extensions =
            ash_window::enumerate_required_extensions(display).map_err(GpuError::Api)?;

        #[allow(unused_mut)] // Mutable in debug builds for adding debug extensions
        let mut extensions: Vec<*const i8> = required_extensions.to_vec();

        let enable_validation = config.validation_enabled();

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            vec![]
        };
        let layer_names_ptrs: Vec<*const i8> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(GpuError::Api)?
        };

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let debug_messenger = Self::setup_debug_messenger(&debug_utils)?;
            (Some(debug_utils), Some(debug_messenger))
        } else {
            (None, None)
        };

        log::info!("Vulkan instance created (validation: {})", enable_validation);

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> GpuResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(GpuError::Api)
        }
    }

    /// Get a reference to the Vulkan entry
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Get a reference to the raw instance
    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for GpuInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(debug_messenger)) =
                (&self.debug_utils, &self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Selected physical device and its unified queue family
pub struct AdapterInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// The single queue family used for both graphics and present
    pub queue_family: u32,
}

impl AdapterInfo {
    /// Select a physical device with a unified graphics+present queue family
    pub fn select(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &SurfaceLoader,
    ) -> GpuResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(GpuError::Api)?
        };

        for device in devices {
            if let Ok(adapter) = Self::evaluate(instance, device, surface, surface_loader) {
                log::info!("Selected GPU: {}", unsafe {
                    CStr::from_ptr(adapter.properties.device_name.as_ptr()).to_string_lossy()
                });
                return Ok(adapter);
            }
        }

        Err(GpuError::InitializationFailed(
            "No GPU with a unified graphics+present queue found".to_string(),
        ))
    }

    fn evaluate(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &SurfaceLoader,
    ) -> GpuResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        if properties.api_version < vk::API_VERSION_1_2 {
            return Err(GpuError::InitializationFailed(
                "Device does not support Vulkan 1.2".to_string(),
            ));
        }

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        // One family must do both graphics and present; separate-queue setups
        // are out of scope for this engine.
        let mut queue_family = None;
        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }

            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(GpuError::Api)?
            };

            if present_support {
                queue_family = Some(index);
                break;
            }
        }

        let queue_family = queue_family.ok_or_else(|| {
            GpuError::InitializationFailed(
                "No unified graphics+present queue family".to_string(),
            )
        })?;

        // Check swapchain extension support
        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(GpuError::Api)?
        };

        let has_swapchain = extensions.iter().any(|available| {
            let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
            name == SwapchainLoader::name()
        });

        if !has_swapchain {
            return Err(GpuError::InitializationFailed(
                "Swapchain extension not supported".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            queue_family,
        })
    }
}

/// Logical device, its unified queue, and the swapchain loader
///
/// Immutable after construction. The device is owned exclusively by this
/// struct and destroyed after everything that borrows from it.
pub struct DeviceContext {
    /// Vulkan logical device handle
    device: Device,
    /// The unified graphics+present queue
    queue: vk::Queue,
    /// Index of the unified queue family
    queue_family: u32,
    /// Swapchain extension loader
    swapchain_loader: SwapchainLoader,
    /// Selected physical device
    adapter: AdapterInfo,
}

impl DeviceContext {
    /// Create the logical device with timeline-semaphore support enabled
    pub fn new(instance: &Instance, adapter: AdapterInfo) -> GpuResult<Self> {
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(adapter.queue_family)
            .queue_priorities(&[1.0])
            .build()];

        let required_extensions = [SwapchainLoader::name().as_ptr()];

        // The frame-slot timeline requires the 1.2 timeline-semaphore feature.
        let mut vulkan12_features =
            vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .push_next(&mut vulkan12_features);

        let device = unsafe {
            instance
                .create_device(adapter.device, &create_info, None)
                .map_err(GpuError::Api)?
        };

        let queue = unsafe { device.get_device_queue(adapter.queue_family, 0) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);

        log::debug!(
            "Logical device created on queue family {}",
            adapter.queue_family
        );

        Ok(Self {
            device,
            queue,
            queue_family: adapter.queue_family,
            swapchain_loader,
            adapter,
        })
    }

    /// Get a clone of the raw device handle
    pub fn raw_device(&self) -> Device {
        self.device.clone()
    }

    /// Get a reference to the raw device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the unified graphics+present queue
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Get the unified queue family index
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get the swapchain loader
    pub fn swapchain_loader(&self) -> &SwapchainLoader {
        &self.swapchain_loader
    }

    /// Get the selected physical device
    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    /// Get the physical device handle
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.adapter.device
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle().map_err(GpuError::from_vk) }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            // Ensure device is idle before destruction
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_maps_to_its_own_variant() {
        assert!(matches!(
            GpuError::from_vk(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        ));
        assert!(matches!(
            GpuError::from_vk(vk::Result::ERROR_OUT_OF_DATE_KHR),
            GpuError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR)
        ));
    }

    #[test]
    fn error_messages_are_descriptive() {
        let err = GpuError::AllocationFailed {
            requested: 1024,
            cause: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        };
        let msg = err.to_string();
        assert!(msg.contains("1024"));
        assert!(msg.contains("ERROR_OUT_OF_DEVICE_MEMORY"));
    }
}
