//! GPU frame pipeline and resource-lifecycle synchronization engine
//!
//! The core of a real-time Vulkan renderer: swapchain lifecycle, bounded
//! frames-in-flight via a timeline semaphore, authoritative per-image
//! layout/access tracking with automatic barriers, and device memory
//! management with a transient staging pool. Scene interpretation, shading,
//! and windowing live in other layers; this crate exposes the chosen
//! formats and live command buffers at those boundaries.
//!
//! Organized into initialization, resources, rendering, and state modules,
//! tied together by [`FramePipeline`].

/// Renderer configuration
pub mod config;

/// Vulkan initialization types (instance, adapter, device, surface)
pub mod initialization;

/// Command recording operations
pub mod rendering;

/// GPU resource management (buffers, images, staging uploads)
pub mod resources;

/// Frame pipeline state management
pub mod state;

/// Main frame pipeline implementation
pub mod renderer;

// Re-export main pipeline types
pub use renderer::{FrameOutcome, FramePipeline, FrameView};

// Re-export core initialization types
pub use initialization::context::{AdapterInfo, DeviceContext, GpuError, GpuInstance, GpuResult};
pub use initialization::surface::Surface;

// Re-export configuration
pub use config::{PresentPreference, RendererConfig};

// Re-export resource types
pub use resources::allocator::{Allocator, Buffer, Image};

// Re-export command recording types
pub use rendering::commands::{CommandPool, CommandRecorder, OneTimeCommands};

// Re-export state types
pub use state::frame::{FrameSlot, FrameSlots, Semaphore, SlotSchedule, Timeline};
pub use state::layout::{
    plan_transition, BarrierSpec, ImageId, ImageUse, ResourceStateTracker, TransitionRecord,
};
pub use state::render_targets::{
    depth_aspect, linear_color_format, select_depth_format, RenderTargets, TargetImage,
};
pub use state::swapchain::{
    clamp_extent, select_image_count, select_present_mode, select_surface_format, AcquireOutcome,
    PresentOutcome, PresentationSurface, SurfacePhase,
};
