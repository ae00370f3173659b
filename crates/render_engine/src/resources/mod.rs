//! GPU resource management (buffers, images, staging uploads)

pub mod allocator;

pub use allocator::{Allocator, Buffer, Image};
