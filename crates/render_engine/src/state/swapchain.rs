//! Presentation surface (swapchain) management
//!
//! Owns the rotating set of presentable images and their views, and the
//! resize/invalidation lifecycle: `Uninitialized -> Ready -> (Stale ->
//! Ready)*`. Out-of-date and suboptimal results from the driver are not
//! errors; they are requests to run the recreation cycle before submitting
//! again. A zero-area extent (minimized window) never attempts image-set
//! construction: the surface parks in `Stale` until a real extent arrives.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use crate::config::{PresentPreference, RendererConfig};
use crate::initialization::context::{DeviceContext, GpuError, GpuResult};
use crate::initialization::surface::Surface;

/// Lifecycle phase of the presentation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfacePhase {
    /// No image set has ever been built
    Uninitialized,
    /// Image set is valid; acquire/present may proceed
    Ready,
    /// Image set is invalid (resize, out-of-date, zero extent); recreate
    /// before submitting again
    Stale,
}

/// Result of acquiring the next presentable image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready for rendering
    Acquired {
        /// Index into the swapchain image set; always `< image_count`
        index: u32,
        /// The chain still works but no longer matches the surface; finish
        /// the frame, then recreate
        suboptimal: bool,
    },
    /// The chain is out of date; recreate before rendering
    OutOfDate,
}

/// Result of presenting an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Image queued for display
    Presented,
    /// Image was queued (or dropped) but the chain needs recreation
    RecreateNeeded,
}

/// Pick the surface format: prefer 8-bit sRGB, else the first supported
pub fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|sf| {
            (sf.format == vk::Format::B8G8R8A8_SRGB || sf.format == vk::Format::R8G8B8A8_SRGB)
                && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .copied()
        .unwrap_or(formats[0])
}

/// Pick the present mode
///
/// `LowLatency` prefers MAILBOX (non-blocking, replaces queued frames) and
/// falls back to FIFO, which every conformant device supports. `Vsync`
/// always selects FIFO.
pub fn select_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentPreference,
) -> vk::PresentModeKHR {
    match preference {
        PresentPreference::Vsync => vk::PresentModeKHR::FIFO,
        PresentPreference::LowLatency => modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO),
    }
}

/// Clamp the desired extent into the surface capabilities
///
/// Returns `None` for a zero-area result (minimized window); the swapchain
/// must not be built in that case.
pub fn clamp_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    desired: vk::Extent2D,
) -> Option<vk::Extent2D> {
    let extent = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: desired
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: desired
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    };

    if extent.width == 0 || extent.height == 0 {
        None
    } else {
        Some(extent)
    }
}

/// Pick the image count: one more than the minimum, capped by the maximum
pub fn select_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

/// The rotating presentation surface
pub struct PresentationSurface {
    device: Device,
    swapchain_loader: SwapchainLoader,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    phase: SurfacePhase,
}

impl PresentationSurface {
    /// Create the presentation surface and build its first image set
    ///
    /// With a zero-area extent the surface comes up `Stale` and the image
    /// set is deferred until [`recreate`](Self::recreate) sees a real size.
    pub fn new(
        context: &DeviceContext,
        surface: &Surface,
        config: &RendererConfig,
        desired_extent: vk::Extent2D,
    ) -> GpuResult<Self> {
        let mut this = Self {
            device: context.raw_device(),
            swapchain_loader: context.swapchain_loader().clone(),
            physical_device: context.physical_device(),
            surface: surface.handle(),
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            phase: SurfacePhase::Uninitialized,
        };
        this.recreate(surface, config, desired_extent)?;
        Ok(this)
    }

    /// Rebuild the image set against the current surface state
    ///
    /// The old chain handle is passed as `old_swapchain` so the driver can
    /// hand over in-flight images; the image set is replaced wholesale,
    /// never mutated in place. Callers must have waited the device idle.
    pub fn recreate(
        &mut self,
        surface: &Surface,
        config: &RendererConfig,
        desired_extent: vk::Extent2D,
    ) -> GpuResult<()> {
        let caps = surface.capabilities(self.physical_device)?;
        let formats = surface.formats(self.physical_device)?;
        let present_modes = surface.present_modes(self.physical_device)?;

        if formats.is_empty() {
            return Err(GpuError::InitializationFailed(
                "Surface reports no formats".to_string(),
            ));
        }

        let Some(extent) = clamp_extent(&caps, desired_extent) else {
            // Minimized; tear down the views but keep the surface parked
            // until a real extent shows up.
            log::debug!("Zero-area extent, presentation surface stays stale");
            self.destroy_image_set();
            self.phase = SurfacePhase::Stale;
            return Ok(());
        };

        let format = select_surface_format(&formats);
        let present_mode = select_present_mode(&present_modes, config.present_preference);
        let image_count = select_image_count(&caps);

        let old_swapchain = self.swapchain;

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&swapchain_create_info, None)
                .map_err(GpuError::from_vk)?
        };

        // The new chain has taken over; drop the previous image set and
        // handle.
        self.destroy_image_set();
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader.destroy_swapchain(old_swapchain, None);
            }
        }

        let images = unsafe {
            self.swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(GpuError::Api)?
        };

        let image_views: Result<Vec<_>, _> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe { self.device.create_image_view(&create_info, None) }
            })
            .collect();

        self.swapchain = swapchain;
        self.images = images;
        self.image_views = image_views.map_err(GpuError::Api)?;
        self.format = format;
        self.extent = extent;
        self.phase = SurfacePhase::Ready;

        log::info!(
            "Swapchain built: {} images, {:?}, {:?}, {}x{}",
            self.images.len(),
            format.format,
            present_mode,
            extent.width,
            extent.height
        );

        Ok(())
    }

    /// Block until an image is available and return its index
    ///
    /// The acquire signals `semaphore` when the image may be written. On a
    /// stale surface (including out-of-date reported by the driver) no index
    /// is produced and the caller must recreate first.
    pub fn acquire_next_image(&mut self, semaphore: vk::Semaphore) -> GpuResult<AcquireOutcome> {
        if self.phase != SurfacePhase::Ready {
            return Ok(AcquireOutcome::OutOfDate);
        }

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                debug_assert!((index as usize) < self.images.len());
                Ok(AcquireOutcome::Acquired { index, suboptimal })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date during acquire");
                self.phase = SurfacePhase::Stale;
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(e) => Err(GpuError::from_vk(e)),
        }
    }

    /// Queue the image at `index` for display
    pub fn present(
        &mut self,
        queue: vk::Queue,
        index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> GpuResult<PresentOutcome> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader.queue_present(queue, &present_info)
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => {
                log::warn!("Swapchain suboptimal during present");
                self.phase = SurfacePhase::Stale;
                Ok(PresentOutcome::RecreateNeeded)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain out of date during present");
                self.phase = SurfacePhase::Stale;
                Ok(PresentOutcome::RecreateNeeded)
            }
            Err(e) => Err(GpuError::from_vk(e)),
        }
    }

    /// Mark the surface stale (e.g. the platform reported a resize)
    pub fn invalidate(&mut self) {
        if self.phase == SurfacePhase::Ready {
            self.phase = SurfacePhase::Stale;
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SurfacePhase {
        self.phase
    }

    /// Whether acquire/present may proceed
    pub fn is_ready(&self) -> bool {
        self.phase == SurfacePhase::Ready
    }

    /// Number of presentable images in the current set
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// The presentable images
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Per-image views
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// The chosen surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Current image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn destroy_image_set(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
        }
        self.image_views.clear();
        self.images.clear();
    }
}

impl Drop for PresentationSurface {
    fn drop(&mut self) {
        self.destroy_image_set();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(f: vk::Format, cs: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: f,
            color_space: cs,
        }
    }

    #[test]
    fn prefers_srgb_surface_format() {
        let formats = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = select_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_supported_format() {
        let formats = [
            format(vk::Format::R5G6B5_UNORM_PACK16, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = select_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::R5G6B5_UNORM_PACK16);
    }

    #[test]
    fn low_latency_prefers_mailbox() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            select_present_mode(&modes, PresentPreference::LowLatency),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn low_latency_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&modes, PresentPreference::LowLatency),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn vsync_always_selects_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&modes, PresentPreference::Vsync),
            vk::PresentModeKHR::FIFO
        );
    }

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn fixed_current_extent_wins() {
        let caps = caps((800, 600), (1, 1), (4096, 4096));
        let extent = clamp_extent(&caps, vk::Extent2D { width: 100, height: 100 }).unwrap();
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn desired_extent_is_clamped_into_bounds() {
        // current_extent == u32::MAX means the surface follows the window
        let caps = caps((u32::MAX, u32::MAX), (200, 200), (1000, 1000));
        let extent = clamp_extent(&caps, vk::Extent2D { width: 5000, height: 50 }).unwrap();
        assert_eq!((extent.width, extent.height), (1000, 200));
    }

    #[test]
    fn zero_area_extent_yields_none() {
        let minimized = caps((0, 0), (0, 0), (4096, 4096));
        assert!(clamp_extent(&minimized, vk::Extent2D { width: 800, height: 600 }).is_none());

        let window_driven = caps((u32::MAX, u32::MAX), (0, 0), (4096, 4096));
        assert!(clamp_extent(&window_driven, vk::Extent2D { width: 0, height: 600 }).is_none());
    }

    #[test]
    fn image_count_is_min_plus_one_capped_by_max() {
        let mut c = caps((800, 600), (1, 1), (4096, 4096));
        c.min_image_count = 2;
        c.max_image_count = 0; // no upper bound
        assert_eq!(select_image_count(&c), 3);

        c.max_image_count = 2;
        assert_eq!(select_image_count(&c), 2);
    }
}
