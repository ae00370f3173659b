//! Vulkan surface management
//!
//! Handles window surface creation and capability queries for presentation.
//! The window itself lives in the platform layer; this wrapper only needs the
//! raw display/window handles.

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::initialization::context::{GpuError, GpuInstance, GpuResult};

/// Vulkan surface wrapper for presentation
pub struct Surface {
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Create a new surface from raw platform handles
    pub fn new(
        gpu: &GpuInstance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> GpuResult<Self> {
        let surface_loader = khr::Surface::new(gpu.entry(), gpu.instance());

        let surface = unsafe {
            ash_window::create_surface(gpu.entry(), gpu.instance(), display, window, None)
                .map_err(|e| {
                    GpuError::InitializationFailed(format!("Failed to create surface: {:?}", e))
                })?
        };

        Ok(Self {
            surface_loader,
            surface,
        })
    }

    /// Get the underlying surface handle
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Get the surface loader
    pub fn loader(&self) -> &khr::Surface {
        &self.surface_loader
    }

    /// Get surface capabilities for a physical device
    pub fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> GpuResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .map_err(GpuError::Api)
        }
    }

    /// Get surface formats for a physical device
    pub fn formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> GpuResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .map_err(GpuError::Api)
        }
    }

    /// Get surface present modes for a physical device
    pub fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> GpuResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .map_err(GpuError::Api)
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
