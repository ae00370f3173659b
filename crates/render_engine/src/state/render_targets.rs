//! Swapchain-dependent render targets
//!
//! The depth target and the intermediate linear color target live and die
//! with the presentation surface's extent: both are destroyed and rebuilt on
//! every resize, strictly after the surface itself has finished recreating
//! so the new extent is authoritative. Formats are derived once: depth from
//! a descending preference list of device-supported formats, color as the
//! non-sRGB twin of the swapchain format (a linear write target).

use ash::{vk, Device, Instance};

use crate::initialization::context::{GpuError, GpuResult};
use crate::resources::allocator::{Allocator, Image};
use crate::state::layout::{ImageId, ResourceStateTracker};

/// Depth formats in preference order
const DEPTH_FORMAT_PREFERENCE: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Pick the first depth format the device supports for optimal-tiling
/// depth attachments
pub fn select_depth_format(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> GpuResult<vk::Format> {
    for format in DEPTH_FORMAT_PREFERENCE {
        let props = unsafe {
            instance.get_physical_device_format_properties(physical_device, format)
        };
        if props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return Ok(format);
        }
    }

    Err(GpuError::InitializationFailed(
        "No supported depth format".to_string(),
    ))
}

/// Derive the non-sRGB twin of a swapchain format for linear write targets
pub fn linear_color_format(swapchain_format: vk::Format) -> vk::Format {
    match swapchain_format {
        vk::Format::B8G8R8A8_SRGB => vk::Format::B8G8R8A8_UNORM,
        vk::Format::R8G8B8A8_SRGB => vk::Format::R8G8B8A8_UNORM,
        other => other,
    }
}

/// Image aspect for a depth format
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// One owned target: image + memory, view, and its tracker id
pub struct TargetImage {
    image: Image,
    view: vk::ImageView,
    id: ImageId,
}

impl TargetImage {
    /// Get the image handle
    pub fn image(&self) -> vk::Image {
        self.image.handle()
    }

    /// Get the image view
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Get the target's format
    pub fn format(&self) -> vk::Format {
        self.image.format()
    }

    /// Get the tracker id for layout transitions
    pub fn id(&self) -> ImageId {
        self.id
    }
}

/// Swapchain-independent render targets tied to the surface extent
pub struct RenderTargets {
    device: Device,
    color: TargetImage,
    depth: TargetImage,
    color_format: vk::Format,
    depth_format: vk::Format,
    extent: vk::Extent2D,
}

impl RenderTargets {
    /// Create both targets at the given extent
    pub fn new(
        device: Device,
        allocator: &Allocator,
        tracker: &mut ResourceStateTracker,
        swapchain_format: vk::Format,
        depth_format: vk::Format,
        extent: vk::Extent2D,
    ) -> GpuResult<Self> {
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::InvalidOperation {
                reason: "render target extent must be non-zero".to_string(),
            });
        }

        let color_format = linear_color_format(swapchain_format);

        let color = Self::build_target(
            &device,
            allocator,
            tracker,
            extent,
            color_format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;

        let depth = Self::build_target(
            &device,
            allocator,
            tracker,
            extent,
            depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect(depth_format),
        )?;

        log::debug!(
            "Render targets created: color {:?}, depth {:?}, {}x{}",
            color_format,
            depth_format,
            extent.width,
            extent.height
        );

        Ok(Self {
            device,
            color,
            depth,
            color_format,
            depth_format,
            extent,
        })
    }

    fn build_target(
        device: &Device,
        allocator: &Allocator,
        tracker: &mut ResourceStateTracker,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> GpuResult<TargetImage> {
        let image = allocator.create_image(extent, format, usage)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image.handle())
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(GpuError::Api)?
        };

        let id = tracker.register(image.handle(), aspect);

        Ok(TargetImage { image, view, id })
    }

    /// Destroy and rebuild both targets at a new extent
    ///
    /// Must run strictly after the presentation surface has finished its own
    /// recreation (and after the caller's wait-idle); the extent passed in
    /// is the surface's new authoritative extent.
    pub fn recreate(
        &mut self,
        allocator: &Allocator,
        tracker: &mut ResourceStateTracker,
        extent: vk::Extent2D,
    ) -> GpuResult<()> {
        self.destroy_targets(tracker);

        self.color = Self::build_target(
            &self.device,
            allocator,
            tracker,
            extent,
            self.color_format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;
        self.depth = Self::build_target(
            &self.device,
            allocator,
            tracker,
            extent,
            self.depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect(self.depth_format),
        )?;
        self.extent = extent;

        log::debug!("Render targets recreated at {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn destroy_targets(&mut self, tracker: &mut ResourceStateTracker) {
        tracker.release(self.color.id);
        tracker.release(self.depth.id);
        unsafe {
            self.device.destroy_image_view(self.color.view, None);
            self.device.destroy_image_view(self.depth.view, None);
        }
        // Image memory is released when the old TargetImages are replaced.
        self.color.view = vk::ImageView::null();
        self.depth.view = vk::ImageView::null();
    }

    /// The intermediate color target
    pub fn color(&self) -> &TargetImage {
        &self.color
    }

    /// The depth target
    pub fn depth(&self) -> &TargetImage {
        &self.depth
    }

    /// The linear color format
    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    /// The chosen depth format
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Current target extent (always equals the surface extent)
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for RenderTargets {
    fn drop(&mut self) {
        unsafe {
            if self.color.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.color.view, None);
            }
            if self.depth.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.depth.view, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_formats_map_to_their_linear_twin() {
        assert_eq!(
            linear_color_format(vk::Format::B8G8R8A8_SRGB),
            vk::Format::B8G8R8A8_UNORM
        );
        assert_eq!(
            linear_color_format(vk::Format::R8G8B8A8_SRGB),
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn non_srgb_formats_pass_through() {
        assert_eq!(
            linear_color_format(vk::Format::B8G8R8A8_UNORM),
            vk::Format::B8G8R8A8_UNORM
        );
        assert_eq!(
            linear_color_format(vk::Format::R16G16B16A16_SFLOAT),
            vk::Format::R16G16B16A16_SFLOAT
        );
    }

    #[test]
    fn depth_aspect_includes_stencil_for_combined_formats() {
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            depth_aspect(vk::Format::D32_SFLOAT_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn depth_preference_starts_with_d32() {
        assert_eq!(DEPTH_FORMAT_PREFERENCE[0], vk::Format::D32_SFLOAT);
    }
}
