//! Frame pipeline orchestration
//!
//! [`FramePipeline`] owns the whole core and drives the per-frame control
//! flow: advance a slot, wait its timeline value, acquire a presentable
//! image, record the frame's layout transitions, hand the open command
//! buffer to the caller, submit with a timeline signal, present. Surface
//! staleness (resize, out-of-date, minimize) is handled by one recreation
//! cycle: wait idle, rebuild the surface, rebuild the dependent targets,
//! reset the layout tracker, resize the slot ring to the new image count.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::config::RendererConfig;
use crate::initialization::context::{AdapterInfo, DeviceContext, GpuError, GpuInstance, GpuResult};
use crate::initialization::surface::Surface;
use crate::rendering::commands::{CommandPool, OneTimeCommands};
use crate::resources::allocator::{Allocator, Buffer, Image};
use crate::state::frame::FrameSlots;
use crate::state::layout::{ImageId, ImageUse, ResourceStateTracker};
use crate::state::render_targets::{select_depth_format, RenderTargets};
use crate::state::swapchain::{AcquireOutcome, PresentOutcome, PresentationSurface};

/// What happened to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was recorded, submitted, and queued for presentation
    Rendered,
    /// The surface was stale (or went stale during acquire); nothing was
    /// submitted this frame. Present again next loop iteration.
    SkippedStale,
}

/// Everything the shading layer needs to record a frame
///
/// Handed to the record callback between the pipeline's own transitions;
/// the command buffer is open and the attachment images are already in
/// their write states.
pub struct FrameView {
    /// Index of the acquired swapchain image
    pub image_index: u32,
    /// Current surface extent
    pub extent: vk::Extent2D,
    /// View of the acquired swapchain image
    pub swapchain_view: vk::ImageView,
    /// View of the intermediate linear color target
    pub color_view: vk::ImageView,
    /// View of the depth target
    pub depth_view: vk::ImageView,
    /// Swapchain color format
    pub swapchain_format: vk::Format,
    /// Depth target format
    pub depth_format: vk::Format,
    /// Configured clear color
    pub clear_color: [f32; 4],
}

/// The GPU frame pipeline
///
/// Field order is drop order: everything that borrows the device goes away
/// before the device context, and the surface before the instance.
pub struct FramePipeline {
    render_targets: Option<RenderTargets>,
    frame_slots: FrameSlots,
    tracker: ResourceStateTracker,
    swapchain_image_ids: Vec<ImageId>,
    presentation: PresentationSurface,
    upload_pool: CommandPool,
    allocator: Allocator,
    context: DeviceContext,
    surface: Surface,
    instance: GpuInstance,
    config: RendererConfig,
    depth_format: vk::Format,
    desired_extent: vk::Extent2D,
}

impl FramePipeline {
    /// Bring up the full pipeline against a platform window
    ///
    /// `desired_extent` is the window's framebuffer size in pixels. A
    /// zero-area extent is tolerated: the pipeline comes up with a stale
    /// surface and builds its image set on the first non-zero resize.
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        config: RendererConfig,
        desired_extent: vk::Extent2D,
    ) -> GpuResult<Self> {
        let instance = GpuInstance::new(display, &config)?;
        let surface = Surface::new(&instance, display, window)?;
        let adapter = AdapterInfo::select(instance.instance(), surface.handle(), surface.loader())?;
        let context = DeviceContext::new(instance.instance(), adapter)?;
        let allocator = Allocator::new(&instance, &context)?;
        let upload_pool = CommandPool::new(context.raw_device(), context.queue_family())?;

        let mut tracker = ResourceStateTracker::with_validation(
            context.raw_device(),
            config.validation_enabled(),
        );

        let presentation = PresentationSurface::new(&context, &surface, &config, desired_extent)?;
        let swapchain_image_ids = Self::register_swapchain_images(&mut tracker, &presentation);

        let depth_format = select_depth_format(instance.instance(), context.physical_device())?;

        // The slot ring follows the image count the device actually handed
        // back; fall back to the configured depth while the surface is stale.
        let slot_count = if presentation.image_count() > 0 {
            presentation.image_count()
        } else {
            config.frames_in_flight
        };
        let frame_slots =
            FrameSlots::new(context.raw_device(), context.queue_family(), slot_count)?;

        let render_targets = if presentation.is_ready() {
            Some(RenderTargets::new(
                context.raw_device(),
                &allocator,
                &mut tracker,
                presentation.format().format,
                depth_format,
                presentation.extent(),
            )?)
        } else {
            None
        };

        log::info!(
            "Frame pipeline ready: {} slots, surface {:?}",
            frame_slots.slot_count(),
            presentation.phase()
        );

        Ok(Self {
            render_targets,
            frame_slots,
            tracker,
            swapchain_image_ids,
            presentation,
            upload_pool,
            allocator,
            context,
            surface,
            instance,
            config,
            depth_format,
            desired_extent,
        })
    }

    fn register_swapchain_images(
        tracker: &mut ResourceStateTracker,
        presentation: &PresentationSurface,
    ) -> Vec<ImageId> {
        presentation
            .images()
            .iter()
            .map(|&image| tracker.register(image, vk::ImageAspectFlags::COLOR))
            .collect()
    }

    /// Record, submit, and present one frame
    ///
    /// `record` runs with the command buffer open and the swapchain image,
    /// color target, and depth target already transitioned to their write
    /// states. A stale surface triggers one recreation cycle and the frame
    /// is skipped; the caller just loops.
    pub fn render_frame<F>(&mut self, record: F) -> GpuResult<FrameOutcome>
    where
        F: FnOnce(vk::CommandBuffer, &FrameView) -> GpuResult<()>,
    {
        if !self.presentation.is_ready() {
            self.recreate_surface()?;
            if !self.presentation.is_ready() {
                // Still zero-area; nothing to render into.
                return Ok(FrameOutcome::SkippedStale);
            }
        }

        self.frame_slots.advance()?;

        let acquire_semaphore = self.frame_slots.current().image_available().handle();
        let (image_index, suboptimal) =
            match self.presentation.acquire_next_image(acquire_semaphore)? {
                AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
                AcquireOutcome::OutOfDate => {
                    self.recreate_surface()?;
                    return Ok(FrameOutcome::SkippedStale);
                }
            };

        let cmd = self.frame_slots.begin_commands()?;

        // All per-frame attachment transitions go through the tracker before
        // the shading layer sees the command buffer.
        let targets = self
            .render_targets
            .as_ref()
            .ok_or_else(|| GpuError::InvalidOperation {
                reason: "render targets missing on a ready surface".to_string(),
            })?;
        let color_id = targets.color().id();
        let depth_id = targets.depth().id();
        let swapchain_id = self.swapchain_image_ids[image_index as usize];

        self.tracker
            .transition(cmd, swapchain_id, ImageUse::ColorAttachmentWrite)?;
        self.tracker
            .transition(cmd, color_id, ImageUse::ColorAttachmentWrite)?;
        self.tracker
            .transition(cmd, depth_id, ImageUse::DepthAttachmentWrite)?;

        let view = FrameView {
            image_index,
            extent: self.presentation.extent(),
            swapchain_view: self.presentation.image_views()[image_index as usize],
            color_view: targets.color().view(),
            depth_view: targets.depth().view(),
            swapchain_format: self.presentation.format().format,
            depth_format: self.depth_format,
            clear_color: self.config.clear_color,
        };

        record(cmd, &view)?;

        // The presentation engine needs the image in present layout; this is
        // the frame's final transition.
        self.tracker
            .transition(cmd, swapchain_id, ImageUse::Present)?;

        self.frame_slots.end_commands()?;
        self.frame_slots.submit(self.context.queue())?;

        let present_semaphore = self.frame_slots.current().render_finished().handle();
        let outcome =
            self.presentation
                .present(self.context.queue(), image_index, present_semaphore)?;

        if outcome == PresentOutcome::RecreateNeeded || suboptimal {
            self.recreate_surface()?;
        }

        Ok(FrameOutcome::Rendered)
    }

    /// Note a window resize; the next frame runs the recreation cycle
    pub fn resize(&mut self, extent: vk::Extent2D) {
        self.desired_extent = extent;
        self.presentation.invalidate();
    }

    /// Run the full surface recreation cycle
    ///
    /// wait idle -> rebuild surface -> reset tracker -> re-register the new
    /// image set -> rebuild render targets -> resize the slot ring to the
    /// new image count. With a zero-area extent the surface parks in the
    /// stale phase and dependent state stays torn down until a real size
    /// arrives. Externally registered images (uploaded textures) are
    /// dropped from the tracker by the reset and must be re-registered by
    /// their owner.
    pub fn recreate_surface(&mut self) -> GpuResult<()> {
        self.context.wait_idle()?;

        self.presentation
            .recreate(&self.surface, &self.config, self.desired_extent)?;

        self.tracker.reset();
        self.swapchain_image_ids =
            Self::register_swapchain_images(&mut self.tracker, &self.presentation);

        if !self.presentation.is_ready() {
            self.render_targets = None;
            return Ok(());
        }

        let extent = self.presentation.extent();
        match self.render_targets.as_mut() {
            Some(targets) => {
                // Targets re-register themselves; their old ids died with
                // the tracker reset.
                targets.recreate(&self.allocator, &mut self.tracker, extent)?;
            }
            None => {
                self.render_targets = Some(RenderTargets::new(
                    self.context.raw_device(),
                    &self.allocator,
                    &mut self.tracker,
                    self.presentation.format().format,
                    self.depth_format,
                    extent,
                )?);
            }
        }

        self.frame_slots.rebuild(self.presentation.image_count())?;

        Ok(())
    }

    /// Upload a vertex/index/uniform payload into a device-local buffer
    ///
    /// One-shot: records the copy, submits, blocks until it retires, then
    /// frees the staging buffer.
    pub fn upload_buffer<T: bytemuck::Pod>(
        &mut self,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> GpuResult<Buffer> {
        let commands = OneTimeCommands::begin(self.context.raw_device(), &self.upload_pool)?;
        let buffer = self
            .allocator
            .create_buffer_with_data(commands.handle(), data, usage)?;
        commands.submit_and_wait(self.context.queue())?;
        self.allocator.free_staging_buffers();
        Ok(buffer)
    }

    /// Upload pixel data into a sampled texture
    ///
    /// The image ends in the shader-sampled state, tracked by the layout
    /// tracker under the returned id.
    pub fn upload_texture(
        &mut self,
        data: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> GpuResult<(Image, ImageId)> {
        let commands = OneTimeCommands::begin(self.context.raw_device(), &self.upload_pool)?;
        let (image, id) = self.allocator.create_image_with_data(
            commands.handle(),
            &mut self.tracker,
            data,
            extent,
            format,
            vk::ImageUsageFlags::SAMPLED,
        )?;
        self.tracker
            .transition(commands.handle(), id, ImageUse::ShaderSampledRead)?;
        commands.submit_and_wait(self.context.queue())?;
        self.allocator.free_staging_buffers();
        Ok((image, id))
    }

    /// Block until the GPU has finished all submitted work
    pub fn wait_idle(&self) -> GpuResult<()> {
        self.context.wait_idle()
    }

    /// The device context
    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// The presentation surface
    pub fn presentation(&self) -> &PresentationSurface {
        &self.presentation
    }

    /// The frame slot ring
    pub fn frame_slots(&self) -> &FrameSlots {
        &self.frame_slots
    }

    /// The layout tracker
    pub fn tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    /// Mutable access to the layout tracker (single recording thread only)
    pub fn tracker_mut(&mut self) -> &mut ResourceStateTracker {
        &mut self.tracker
    }

    /// The allocator
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Mutable access to the allocator
    pub fn allocator_mut(&mut self) -> &mut Allocator {
        &mut self.allocator
    }

    /// The render targets; `None` while the surface is stale
    pub fn render_targets(&self) -> Option<&RenderTargets> {
        self.render_targets.as_ref()
    }

    /// The active configuration
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        // Nothing here may still be executing when the members tear down.
        let _ = self.context.wait_idle();
    }
}
