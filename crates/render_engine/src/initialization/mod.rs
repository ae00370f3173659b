//! Vulkan initialization types (instance, adapter, device, surface)

pub mod context;
pub mod surface;

pub use context::{AdapterInfo, DeviceContext, GpuError, GpuInstance, GpuResult};
pub use surface::Surface;
