//! Device memory management
//!
//! Wraps the vk-mem allocator behind RAII types that keep a buffer/image
//! handle and its allocation token together for their whole lifetime: the
//! pair is created atomically and destroyed atomically, never one without
//! the other. Also owns the transient staging-buffer pool used by the
//! one-shot upload protocol; pooled staging buffers are only freed after the
//! command buffer that reads them has been confirmed complete.
//!
//! Buffers and images are exclusively owned by whichever component requested
//! them and must be dropped before the device context they were allocated
//! from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::{vk, Device};
use vk_mem::Alloc;

use crate::initialization::context::{DeviceContext, GpuError, GpuInstance, GpuResult};
use crate::state::layout::{ImageId, ImageUse, ResourceStateTracker};

/// GPU buffer owning its memory allocation
///
/// Dropping the buffer releases handle and allocation together.
pub struct Buffer {
    allocator: Arc<vk_mem::Allocator>,
    live: Arc<AtomicUsize>,
    buffer: vk::Buffer,
    allocation: Option<vk_mem::Allocation>,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Get the buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the buffer size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(mut allocation) = self.allocation.take() {
            unsafe {
                self.allocator.destroy_buffer(self.buffer, &mut allocation);
            }
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// GPU image owning its memory allocation
pub struct Image {
    allocator: Arc<vk_mem::Allocator>,
    live: Arc<AtomicUsize>,
    image: vk::Image,
    allocation: Option<vk_mem::Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Image {
    /// Get the image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Get the image format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Get the image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(mut allocation) = self.allocation.take() {
            unsafe {
                self.allocator.destroy_image(self.image, &mut allocation);
            }
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Full-image copy region for a tightly packed staging buffer
pub fn image_copy_region(extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .build()
}

/// Device memory allocator and staging pool
pub struct Allocator {
    device: Device,
    inner: Arc<vk_mem::Allocator>,
    live: Arc<AtomicUsize>,
    staging: Vec<Buffer>,
}

impl Allocator {
    /// Create an allocator for the given device
    pub fn new(gpu: &GpuInstance, context: &DeviceContext) -> GpuResult<Self> {
        let create_info = vk_mem::AllocatorCreateInfo::new(
            gpu.instance(),
            context.device(),
            context.physical_device(),
        );
        let inner = vk_mem::Allocator::new(create_info).map_err(GpuError::Api)?;

        log::debug!("Device memory allocator created");

        Ok(Self {
            device: context.raw_device(),
            inner: Arc::new(inner),
            live: Arc::new(AtomicUsize::new(0)),
            staging: Vec::new(),
        })
    }

    /// Allocate a buffer and its backing memory atomically
    ///
    /// Allocation failure is fatal to the frame; there is no reclamation
    /// path and the error is never retried. On failure nothing is leaked:
    /// either both handle and allocation exist, or neither does.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_usage: vk_mem::MemoryUsage,
        flags: vk_mem::AllocationCreateFlags,
    ) -> GpuResult<Buffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let alloc_info = vk_mem::AllocationCreateInfo {
            usage: memory_usage,
            flags,
            ..Default::default()
        };

        let (buffer, allocation) = unsafe { self.inner.create_buffer(&buffer_info, &alloc_info) }
            .map_err(|e| GpuError::AllocationFailed {
                requested: size,
                cause: e,
            })?;

        self.live.fetch_add(1, Ordering::Relaxed);

        Ok(Buffer {
            allocator: self.inner.clone(),
            live: self.live.clone(),
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Allocate a device-local 2D image and its backing memory atomically
    pub fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> GpuResult<Image> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let alloc_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, allocation) = unsafe { self.inner.create_image(&image_info, &alloc_info) }
            .map_err(|e| GpuError::AllocationFailed {
                requested: u64::from(extent.width) * u64::from(extent.height) * 4,
                cause: e,
            })?;

        self.live.fetch_add(1, Ordering::Relaxed);

        Ok(Image {
            allocator: self.inner.clone(),
            live: self.live.clone(),
            image,
            allocation: Some(allocation),
            format,
            extent,
        })
    }

    /// Create a device-local buffer and record an upload of `data` into it
    ///
    /// Two-step protocol: the data lands in a host-visible staging buffer
    /// now; the copy into the destination is recorded into `cmd`, which must
    /// be open for recording and submitted by the caller. The staging buffer
    /// joins the internal pool and stays alive until
    /// [`free_staging_buffers`](Self::free_staging_buffers).
    pub fn create_buffer_with_data<T: bytemuck::Pod>(
        &mut self,
        cmd: vk::CommandBuffer,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> GpuResult<Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;

        let dst = self.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk_mem::MemoryUsage::AutoPreferDevice,
            vk_mem::AllocationCreateFlags::empty(),
        )?;

        let staging = self.create_staging(bytes)?;

        let region = vk::BufferCopy::builder()
            .src_offset(0)
            .dst_offset(0)
            .size(size);

        unsafe {
            self.device
                .cmd_copy_buffer(cmd, staging.handle(), dst.handle(), &[region.build()]);
        }

        self.staging.push(staging);
        Ok(dst)
    }

    /// Create a device-local image and record an upload of `data` into it
    ///
    /// Same staging protocol as [`create_buffer_with_data`]. The image is
    /// registered with the tracker and transitioned (from undefined) to
    /// transfer-destination through it, so the tracker stays the single
    /// source of truth for the image's state. The image is LEFT in the
    /// transfer-destination state; transition it to its read use when
    /// binding.
    pub fn create_image_with_data(
        &mut self,
        cmd: vk::CommandBuffer,
        tracker: &mut ResourceStateTracker,
        data: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> GpuResult<(Image, ImageId)> {
        let image = self.create_image(
            extent,
            format,
            usage | vk::ImageUsageFlags::TRANSFER_DST,
        )?;

        let id = tracker.register(image.handle(), vk::ImageAspectFlags::COLOR);
        tracker.transition(cmd, id, ImageUse::TransferDstWrite)?;

        let staging = self.create_staging(data)?;

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[image_copy_region(extent)],
            );
        }

        self.staging.push(staging);
        Ok((image, id))
    }

    /// Create a host-visible staging buffer filled with `bytes`
    fn create_staging(&self, bytes: &[u8]) -> GpuResult<Buffer> {
        let mut staging = self.create_buffer(
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk_mem::MemoryUsage::AutoPreferHost,
            vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
        )?;

        let allocation = staging
            .allocation
            .as_mut()
            .ok_or_else(|| GpuError::InvalidOperation {
                reason: "staging buffer has no allocation".to_string(),
            })?;

        unsafe {
            let ptr = self
                .inner
                .map_memory(allocation)
                .map_err(GpuError::Api)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            self.inner.unmap_memory(allocation);
        }

        Ok(staging)
    }

    /// Destroy every pooled staging buffer
    ///
    /// Only call after the command buffer carrying the copies has completed
    /// on the GPU (fence or timeline wait). Clears the whole pool; there is
    /// no partial free.
    pub fn free_staging_buffers(&mut self) {
        if !self.staging.is_empty() {
            log::debug!("Freeing {} staging buffers", self.staging.len());
        }
        self.staging.clear();
    }

    /// Number of staging buffers currently pooled
    pub fn staging_count(&self) -> usize {
        self.staging.len()
    }

    /// Number of live buffer/image allocations
    pub fn live_allocation_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_region_covers_whole_image() {
        let region = image_copy_region(vk::Extent2D {
            width: 640,
            height: 480,
        });
        assert_eq!(region.buffer_offset, 0);
        assert_eq!(region.buffer_row_length, 0); // tightly packed
        assert_eq!(region.image_extent.width, 640);
        assert_eq!(region.image_extent.height, 480);
        assert_eq!(region.image_extent.depth, 1);
        assert_eq!(region.image_subresource.layer_count, 1);
    }

    #[test]
    fn copy_region_depth_is_one_for_2d_images() {
        let region = image_copy_region(vk::Extent2D { width: 1, height: 1 });
        assert_eq!(region.image_extent.depth, 1);
        assert_eq!(region.image_subresource.mip_level, 0);
    }
}
