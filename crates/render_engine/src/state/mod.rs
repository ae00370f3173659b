//! Frame pipeline state management

pub mod frame;
pub mod layout;
pub mod render_targets;
pub mod swapchain;

pub use frame::{FrameSlot, FrameSlots, Semaphore, SlotSchedule, Timeline};
pub use layout::{
    plan_transition, BarrierSpec, ImageId, ImageUse, ResourceStateTracker, TransitionRecord,
};
pub use render_targets::{RenderTargets, TargetImage};
pub use swapchain::{
    clamp_extent, select_image_count, select_present_mode, select_surface_format, AcquireOutcome,
    PresentOutcome, PresentationSurface, SurfacePhase,
};
