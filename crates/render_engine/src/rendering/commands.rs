//! Command buffer management
//!
//! Type-safe command buffer recording following RAII patterns. Frame slots
//! reuse their pool/buffer pair across frames via [`CommandPool::reset`];
//! one-shot upload batches go through [`OneTimeCommands`], which gives the
//! caller a precise point at which the GPU has retired the copy commands.

use ash::{vk, Device};

use crate::initialization::context::{GpuError, GpuResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool for the given queue family
    pub fn new(device: Device, queue_family_index: u32) -> GpuResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_create_info, None)
                .map_err(GpuError::Api)?
        };

        Ok(Self {
            device,
            command_pool,
        })
    }

    /// Allocate primary command buffers
    pub fn allocate_primary(&self, count: u32) -> GpuResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let command_buffers = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(GpuError::Api)?
        };

        Ok(command_buffers)
    }

    /// Reset the pool, recycling all command buffers allocated from it
    ///
    /// The caller must have confirmed (fence or timeline wait) that no
    /// buffer from this pool is still executing.
    pub fn reset(&self) -> GpuResult<()> {
        unsafe {
            self.device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
                .map_err(GpuError::from_vk)
        }
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // All buffers from this pool must be out of flight before the
            // pool goes away.
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Type-safe command buffer recorder
pub struct CommandRecorder {
    command_buffer: vk::CommandBuffer,
    device: Device,
    recording: bool,
}

impl CommandRecorder {
    /// Create a new command recorder over an allocated buffer
    pub fn new(command_buffer: vk::CommandBuffer, device: Device) -> Self {
        Self {
            command_buffer,
            device,
            recording: false,
        }
    }

    /// Begin command recording (one-time-submit usage)
    pub fn begin(&mut self) -> GpuResult<&mut Self> {
        if self.recording {
            return Err(GpuError::InvalidOperation {
                reason: "Command buffer already recording".to_string(),
            });
        }

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(GpuError::Api)?;
        }

        self.recording = true;
        Ok(self)
    }

    /// End command recording
    pub fn end(&mut self) -> GpuResult<()> {
        if !self.recording {
            return Err(GpuError::InvalidOperation {
                reason: "Command buffer not recording".to_string(),
            });
        }

        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(GpuError::Api)?;
        }

        self.recording = false;
        Ok(())
    }

    /// Whether the buffer is currently recording
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Get the command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

/// One-shot command batch for uploads
///
/// Allocates a buffer from the supplied pool, records, then submits and
/// blocks on a fence. Once [`submit_and_wait`](Self::submit_and_wait)
/// returns, every command in the batch has retired and transient resources
/// referenced by it (e.g. staging buffers) may be freed.
pub struct OneTimeCommands {
    device: Device,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl OneTimeCommands {
    /// Allocate and begin a one-shot command buffer
    pub fn begin(device: Device, pool: &CommandPool) -> GpuResult<Self> {
        let command_buffer = pool.allocate_primary(1)?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(GpuError::Api)?;
        }

        Ok(Self {
            device,
            pool: pool.handle(),
            command_buffer,
        })
    }

    /// Get the open command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// End, submit, and block until the batch has executed
    pub fn submit_and_wait(self, queue: vk::Queue) -> GpuResult<()> {
        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(GpuError::Api)?;
        }

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe {
            self.device
                .create_fence(&fence_info, None)
                .map_err(GpuError::Api)?
        };

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        let result = unsafe {
            self.device
                .queue_submit(queue, &[submit_info.build()], fence)
                .map_err(GpuError::from_vk)
                .and_then(|_| {
                    self.device
                        .wait_for_fences(&[fence], true, u64::MAX)
                        .map_err(GpuError::from_vk)
                })
        };

        unsafe {
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(self.pool, &command_buffers);
        }

        result
    }
}
