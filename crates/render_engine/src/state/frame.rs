//! Frame slots and timeline synchronization
//!
//! Bounds how far the CPU may run ahead of the GPU. A fixed ring of
//! [`FrameSlot`]s (sized to the swapchain image count) each own one command
//! pool/buffer pair and the binary semaphores for acquire/present. A single
//! timeline semaphore plays the role of one fence per slot: every submission
//! of slot K signals `previous + N`, and before reusing slot K the CPU waits
//! until the counter reaches the value most recently signaled for it. One
//! counter, an implicit per-slot schedule, no N separate fences.

use ash::{vk, Device};

use crate::initialization::context::{GpuError, GpuResult};
use crate::rendering::commands::{CommandPool, CommandRecorder};

/// How long a blocking timeline wait runs before probing for device loss
const DEVICE_LOSS_PROBE_NS: u64 = 1_000_000_000;

/// Binary semaphore with RAII cleanup
///
/// Used for the two GPU-GPU edges the presentation engine requires:
/// image acquisition and present.
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: Device) -> GpuResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(GpuError::Api)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Timeline semaphore wrapper
///
/// The authoritative mechanism for "has the GPU finished consuming slot K's
/// resources". The counter only ever increases.
pub struct Timeline {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Timeline {
    /// Create a timeline semaphore with an initial value of 0
    pub fn new(device: Device) -> GpuResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);

        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(GpuError::Api)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Read the current counter value
    pub fn counter_value(&self) -> GpuResult<u64> {
        unsafe {
            self.device
                .get_semaphore_counter_value(self.semaphore)
                .map_err(GpuError::from_vk)
        }
    }

    /// Block until the counter reaches `value`
    ///
    /// The wait itself has no deadline; a stalled GPU would otherwise turn
    /// into a silent hang, so the wait is chopped into bounded intervals and
    /// the counter is re-queried between them. A lost device surfaces as
    /// [`GpuError::DeviceLost`].
    pub fn wait(&self, value: u64) -> GpuResult<()> {
        if value == 0 {
            return Ok(());
        }

        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        loop {
            match unsafe { self.device.wait_semaphores(&wait_info, DEVICE_LOSS_PROBE_NS) } {
                Ok(()) => return Ok(()),
                Err(vk::Result::TIMEOUT) => {
                    // Querying the counter is how we find out the device died
                    // while we were waiting.
                    self.counter_value()?;
                    log::warn!("Timeline wait for value {} exceeded 1s, still waiting", value);
                }
                Err(e) => return Err(GpuError::from_vk(e)),
            }
        }
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Per-slot timeline bookkeeping (pure)
///
/// Tracks the value most recently signaled for each slot. The first
/// submission of slot K signals `K + 1` (timeline signals must be globally
/// increasing under round-robin submission); every later submission of the
/// same slot signals exactly `slot_count` more than the previous one.
#[derive(Debug, Clone)]
pub struct SlotSchedule {
    slot_count: u64,
    last_signaled: Vec<u64>,
}

impl SlotSchedule {
    /// Create a schedule for `slot_count` slots, nothing signaled yet
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot_count: slot_count as u64,
            last_signaled: vec![0; slot_count],
        }
    }

    /// Number of slots
    pub fn slot_count(&self) -> usize {
        self.last_signaled.len()
    }

    /// The value the CPU must wait for before reusing `slot`
    ///
    /// Zero before the slot's first submission, which every timeline
    /// trivially satisfies.
    pub fn pending(&self, slot: usize) -> u64 {
        self.last_signaled[slot]
    }

    /// The value the next submission of `slot` will signal
    pub fn next_signal(&self, slot: usize) -> u64 {
        match self.last_signaled[slot] {
            0 => slot as u64 + 1,
            last => last + self.slot_count,
        }
    }

    /// Record a submission of `slot`; returns the signaled value
    pub fn commit(&mut self, slot: usize) -> u64 {
        let value = self.next_signal(slot);
        self.last_signaled[slot] = value;
        value
    }

    /// The highest value signaled so far across all slots
    pub fn high_water_mark(&self) -> u64 {
        self.last_signaled.iter().copied().max().unwrap_or(0)
    }
}

/// Per-slot frame resources
///
/// Each slot owns exactly one command pool/buffer pair, reset (not
/// reallocated) between uses, plus the binary semaphores tied to the
/// swapchain image this slot acquires and presents.
pub struct FrameSlot {
    /// Slot index in the ring
    index: usize,
    /// Signaled when the acquired swapchain image is ready
    image_available: Semaphore,
    /// Signaled when this slot's rendering is complete; present waits on it
    render_finished: Semaphore,
    pool: CommandPool,
    recorder: CommandRecorder,
}

impl FrameSlot {
    fn new(device: Device, queue_family: u32, index: usize) -> GpuResult<Self> {
        let image_available = Semaphore::new(device.clone())?;
        let render_finished = Semaphore::new(device.clone())?;
        let pool = CommandPool::new(device.clone(), queue_family)?;
        let command_buffer = pool.allocate_primary(1)?[0];
        let recorder = CommandRecorder::new(command_buffer, device);

        Ok(Self {
            index,
            image_available,
            render_finished,
            pool,
            recorder,
        })
    }

    /// Slot index in the ring
    pub fn index(&self) -> usize {
        self.index
    }

    /// Semaphore the swapchain acquire signals
    pub fn image_available(&self) -> &Semaphore {
        &self.image_available
    }

    /// Semaphore the present operation waits on
    pub fn render_finished(&self) -> &Semaphore {
        &self.render_finished
    }

    /// This slot's command buffer
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.recorder.handle()
    }
}

/// Ring of frame slots driven by one timeline semaphore
///
/// Slot count equals the swapchain image count and the whole ring is rebuilt
/// whenever the swapchain is replaced.
pub struct FrameSlots {
    device: Device,
    queue_family: u32,
    slots: Vec<FrameSlot>,
    schedule: SlotSchedule,
    timeline: Timeline,
    current: usize,
}

impl FrameSlots {
    /// Create `slot_count` slots with a fresh timeline
    pub fn new(device: Device, queue_family: u32, slot_count: usize) -> GpuResult<Self> {
        if slot_count == 0 {
            return Err(GpuError::InvalidOperation {
                reason: "frame slot count must be at least 1".to_string(),
            });
        }

        let mut slots = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            slots.push(FrameSlot::new(device.clone(), queue_family, index)?);
        }

        let timeline = Timeline::new(device.clone())?;

        log::info!("Created {} frame slots", slot_count);

        Ok(Self {
            device,
            queue_family,
            slots,
            schedule: SlotSchedule::new(slot_count),
            // Start just before slot 0 so the first advance lands on it.
            current: slot_count - 1,
            timeline,
        })
    }

    /// Number of slots in the ring
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The slot currently being recorded
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// The timeline backing this ring
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Move to the next slot and make it safe to reuse
    ///
    /// Blocks until the GPU has finished the slot's previous submission,
    /// then resets its command pool. A lost device propagates as fatal.
    pub fn advance(&mut self) -> GpuResult<&FrameSlot> {
        self.current = (self.current + 1) % self.slots.len();
        self.timeline.wait(self.schedule.pending(self.current))?;
        self.slots[self.current].pool.reset()?;
        Ok(&self.slots[self.current])
    }

    /// Begin recording into the current slot's command buffer
    pub fn begin_commands(&mut self) -> GpuResult<vk::CommandBuffer> {
        let slot = &mut self.slots[self.current];
        slot.recorder.begin()?;
        Ok(slot.recorder.handle())
    }

    /// Finish recording the current slot's command buffer
    pub fn end_commands(&mut self) -> GpuResult<()> {
        self.slots[self.current].recorder.end()
    }

    /// Submit the current slot's commands
    ///
    /// Waits on the slot's image-available semaphore at color-attachment
    /// output, signals the slot's render-finished semaphore for present, and
    /// signals the timeline with the slot's next scheduled value. Returns
    /// that value.
    pub fn submit(&mut self, queue: vk::Queue) -> GpuResult<u64> {
        let slot = &self.slots[self.current];
        let signal_value = self.schedule.next_signal(self.current);

        let wait_semaphores = [slot.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let wait_values = [0u64];
        let command_buffers = [slot.recorder.handle()];
        let signal_semaphores = [slot.render_finished.handle(), self.timeline.handle()];
        // Values for binary semaphores are ignored; only the slot order
        // matters.
        let signal_values = [0u64, signal_value];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                .map_err(GpuError::from_vk)?;
        }

        let committed = self.schedule.commit(self.current);
        debug_assert_eq!(committed, signal_value);

        log::trace!(
            "Submitted slot {} signaling timeline value {}",
            self.current,
            signal_value
        );

        Ok(signal_value)
    }

    /// Block until every submitted slot has retired
    pub fn wait_all(&self) -> GpuResult<()> {
        self.timeline.wait(self.schedule.high_water_mark())
    }

    /// Rebuild the ring for a new swapchain image count
    ///
    /// Callers must have waited the device idle first (part of the surface
    /// recreation cycle). The old timeline goes away with the old slots; the
    /// new images have no history to wait on.
    pub fn rebuild(&mut self, slot_count: usize) -> GpuResult<()> {
        if slot_count == 0 {
            return Err(GpuError::InvalidOperation {
                reason: "frame slot count must be at least 1".to_string(),
            });
        }

        self.slots.clear();
        for index in 0..slot_count {
            self.slots
                .push(FrameSlot::new(self.device.clone(), self.queue_family, index)?);
        }
        self.timeline = Timeline::new(self.device.clone())?;
        self.schedule = SlotSchedule::new(slot_count);
        self.current = slot_count - 1;

        log::info!("Rebuilt frame slots ({} slots)", slot_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_zero_before_first_submission() {
        let schedule = SlotSchedule::new(3);
        for slot in 0..3 {
            assert_eq!(schedule.pending(slot), 0);
        }
    }

    #[test]
    fn first_signals_are_globally_increasing() {
        let mut schedule = SlotSchedule::new(3);
        assert_eq!(schedule.commit(0), 1);
        assert_eq!(schedule.commit(1), 2);
        assert_eq!(schedule.commit(2), 3);
    }

    #[test]
    fn per_slot_step_is_exactly_slot_count() {
        let n = 3;
        let mut schedule = SlotSchedule::new(n);

        // Round-robin submission, ten full cycles
        let mut per_slot: Vec<Vec<u64>> = vec![Vec::new(); n];
        for frame in 0..n * 10 {
            let slot = frame % n;
            per_slot[slot].push(schedule.commit(slot));
        }

        for values in &per_slot {
            for pair in values.windows(2) {
                assert_eq!(pair[1], pair[0] + n as u64);
            }
        }
    }

    #[test]
    fn pending_tracks_last_commit() {
        let mut schedule = SlotSchedule::new(2);
        let v0 = schedule.commit(0);
        assert_eq!(schedule.pending(0), v0);
        assert_eq!(schedule.pending(1), 0);

        let v0b = schedule.commit(0);
        assert!(v0b > v0);
        assert_eq!(schedule.pending(0), v0b);
    }

    #[test]
    fn high_water_mark_is_max_signal() {
        let mut schedule = SlotSchedule::new(2);
        assert_eq!(schedule.high_water_mark(), 0);
        schedule.commit(0);
        schedule.commit(1);
        let top = schedule.commit(0);
        assert_eq!(schedule.high_water_mark(), top);
    }

    #[test]
    fn schedule_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<SlotSchedule>();
    }
}
