//! Image layout and access state tracking
//!
//! Every image the GPU touches goes through exactly one state machine: the
//! [`ResourceStateTracker`]. Callers declare *what* an image is about to be
//! used for ([`ImageUse`]) and the tracker derives and records the minimal
//! correct pipeline barrier, or none at all when the image is already in the
//! requested state. No other component may assume a layout without consulting
//! or updating the tracker.
//!
//! State is tracked per whole image, not per mip/array slice. Splitting an
//! image's subresources across different layouts would require a set of
//! non-overlapping ranges per entry; nothing in the engine needs that today.

use ash::{vk, Device};
use slotmap::SlotMap;

use crate::initialization::context::{GpuError, GpuResult};

slotmap::new_key_type! {
    /// Generational id for a tracked image
    ///
    /// Ids are handed out at registration and invalidated by
    /// [`ResourceStateTracker::release`], so a stale id never aliases a
    /// recycled `vk::Image` handle.
    pub struct ImageId;
}

/// What an image is about to be used for
///
/// Each use maps to a fixed (layout, pipeline stage, access mask) triple.
/// The mapping is a pure, total function with no hidden state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageUse {
    /// Written as a color attachment
    ColorAttachmentWrite,
    /// Written as a depth(-stencil) attachment
    DepthAttachmentWrite,
    /// Sampled from a fragment shader
    ShaderSampledRead,
    /// Written by a transfer (copy) command
    TransferDstWrite,
    /// Handed to the presentation engine
    Present,
}

impl ImageUse {
    /// The image layout this use requires
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            ImageUse::ColorAttachmentWrite => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageUse::DepthAttachmentWrite => {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            }
            ImageUse::ShaderSampledRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageUse::TransferDstWrite => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageUse::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// The pipeline stage that performs this use
    pub fn stage(self) -> vk::PipelineStageFlags {
        match self {
            ImageUse::ColorAttachmentWrite => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ImageUse::DepthAttachmentWrite => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            ImageUse::ShaderSampledRead => vk::PipelineStageFlags::FRAGMENT_SHADER,
            ImageUse::TransferDstWrite => vk::PipelineStageFlags::TRANSFER,
            // The presentation engine reads outside the pipeline; no stage
            // needs to observe the memory.
            ImageUse::Present => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    /// The access mask for this use
    pub fn access(self) -> vk::AccessFlags {
        match self {
            ImageUse::ColorAttachmentWrite => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ImageUse::DepthAttachmentWrite => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            ImageUse::ShaderSampledRead => vk::AccessFlags::SHADER_READ,
            ImageUse::TransferDstWrite => vk::AccessFlags::TRANSFER_WRITE,
            ImageUse::Present => vk::AccessFlags::empty(),
        }
    }

    /// All uses, in declaration order
    pub const ALL: [ImageUse; 5] = [
        ImageUse::ColorAttachmentWrite,
        ImageUse::DepthAttachmentWrite,
        ImageUse::ShaderSampledRead,
        ImageUse::TransferDstWrite,
        ImageUse::Present,
    ];
}

/// A planned layout transition, before it is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSpec {
    /// Layout the image is currently in
    pub old_layout: vk::ImageLayout,
    /// Layout the image transitions to
    pub new_layout: vk::ImageLayout,
    /// Stage whose writes must complete first
    pub src_stage: vk::PipelineStageFlags,
    /// Stage that waits on the transition
    pub dst_stage: vk::PipelineStageFlags,
    /// Access mask being made available
    pub src_access: vk::AccessFlags,
    /// Access mask being made visible
    pub dst_access: vk::AccessFlags,
}

/// Plan the barrier for a use change
///
/// Returns `None` when no barrier is needed: repeated requests for the same
/// use are an explicit no-op, both as an optimization and a correctness rule
/// (a second barrier between identical uses would be a double transition).
/// An absent prior use means the image has never been seen: the only legal
/// source state is an undefined layout, matching the driver contract for
/// freshly created images.
pub fn plan_transition(prev: Option<ImageUse>, next: ImageUse) -> Option<BarrierSpec> {
    match prev {
        Some(current) if current == next => None,
        Some(current) => Some(BarrierSpec {
            old_layout: current.layout(),
            new_layout: next.layout(),
            src_stage: current.stage(),
            dst_stage: next.stage(),
            src_access: current.access(),
            dst_access: next.access(),
        }),
        None => Some(BarrierSpec {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: next.layout(),
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: next.stage(),
            src_access: vk::AccessFlags::empty(),
            dst_access: next.access(),
        }),
    }
}

/// Data handed to the transition observer
#[derive(Debug, Clone, Copy)]
pub struct TransitionRecord {
    /// Image being transitioned
    pub image: vk::Image,
    /// Use the image is leaving, if any
    pub from: Option<ImageUse>,
    /// Use the image is entering
    pub to: ImageUse,
}

/// Observer hook invoked once per recorded barrier
pub type TransitionObserver = Box<dyn FnMut(&TransitionRecord) + Send>;

struct TrackedImage {
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    state: Option<ImageUse>,
}

/// Per-image GPU state machine and barrier recorder
///
/// The tracker is the single mutator of per-image layout state and must be
/// driven from the one recording thread. Entries are keyed by [`ImageId`],
/// assigned at registration; release entries explicitly when the image is
/// destroyed rather than relying on handle identity.
pub struct ResourceStateTracker {
    device: Device,
    entries: SlotMap<ImageId, TrackedImage>,
    validate: bool,
    observer: Option<TransitionObserver>,
    transitions_recorded: u64,
}

impl ResourceStateTracker {
    /// Create a tracker in permissive mode
    pub fn new(device: Device) -> Self {
        Self::with_validation(device, false)
    }

    /// Create a tracker; `validate` additionally checks caller-asserted
    /// prior states in [`transition_checked`](Self::transition_checked)
    pub fn with_validation(device: Device, validate: bool) -> Self {
        Self {
            device,
            entries: SlotMap::with_key(),
            validate,
            observer: None,
            transitions_recorded: 0,
        }
    }

    /// Install an observer called once per recorded barrier
    pub fn set_observer(&mut self, observer: TransitionObserver) {
        self.observer = Some(observer);
    }

    /// Start tracking an image; its state begins as undefined (first use)
    pub fn register(&mut self, image: vk::Image, aspect: vk::ImageAspectFlags) -> ImageId {
        let id = self.entries.insert(TrackedImage {
            image,
            aspect,
            state: None,
        });
        log::trace!("Tracking image {:?} as {:?}", image, id);
        id
    }

    /// Stop tracking an image; call when the image is destroyed
    pub fn release(&mut self, id: ImageId) {
        if self.entries.remove(id).is_none() {
            log::warn!("Released untracked image id {:?}", id);
        }
    }

    /// The last-known use of a tracked image, `None` if never transitioned
    pub fn state_of(&self, id: ImageId) -> Option<ImageUse> {
        self.entries.get(id).and_then(|entry| entry.state)
    }

    /// Number of tracked images
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of barriers recorded since creation or the last reset
    pub fn transitions_recorded(&self) -> u64 {
        self.transitions_recorded
    }

    /// Transition an image to a new use, recording a barrier if one is needed
    ///
    /// The command buffer must be open for recording. Requesting the use the
    /// image is already in records nothing.
    pub fn transition(
        &mut self,
        cmd: vk::CommandBuffer,
        id: ImageId,
        new_use: ImageUse,
    ) -> GpuResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| GpuError::InvalidOperation {
                reason: format!("transition on untracked image id {:?}", id),
            })?;

        let Some(spec) = plan_transition(entry.state, new_use) else {
            return Ok(());
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(spec.old_layout)
            .new_layout(spec.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(entry.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: entry.aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
            .src_access_mask(spec.src_access)
            .dst_access_mask(spec.dst_access);

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                spec.src_stage,
                spec.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier.build()],
            );
        }

        let record = TransitionRecord {
            image: entry.image,
            from: entry.state,
            to: new_use,
        };
        entry.state = Some(new_use);
        self.transitions_recorded += 1;

        if let Some(observer) = self.observer.as_mut() {
            observer(&record);
        }

        Ok(())
    }

    /// Transition with a caller-asserted prior state
    ///
    /// In validation mode a mismatch between `expected_prior` and the
    /// tracked state trips a debug assertion (release builds log an error
    /// and continue with the *tracked* state, which is authoritative).
    pub fn transition_checked(
        &mut self,
        cmd: vk::CommandBuffer,
        id: ImageId,
        expected_prior: Option<ImageUse>,
        new_use: ImageUse,
    ) -> GpuResult<()> {
        if self.validate {
            let actual = self
                .entries
                .get(id)
                .ok_or_else(|| GpuError::InvalidOperation {
                    reason: format!("transition on untracked image id {:?}", id),
                })?
                .state;
            if actual != expected_prior {
                debug_assert!(
                    false,
                    "image {:?}: caller expected prior use {:?}, tracker has {:?}",
                    id, expected_prior, actual
                );
                log::error!(
                    "Layout contract violation on {:?}: expected {:?}, tracked {:?}",
                    id,
                    expected_prior,
                    actual
                );
            }
        }

        self.transition(cmd, id, new_use)
    }

    /// Drop all tracked state
    ///
    /// Used when the swapchain is destroyed and replaced: the new images are
    /// unrelated resources in the driver's undefined state, even though new
    /// handles may alias old values.
    pub fn reset(&mut self) {
        log::debug!("Resetting layout tracker ({} entries)", self.entries.len());
        self.entries.clear();
        self.transitions_recorded = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_use_plans_no_barrier() {
        for use_ in ImageUse::ALL {
            assert_eq!(plan_transition(Some(use_), use_), None);
        }
    }

    #[test]
    fn first_use_comes_from_undefined() {
        for use_ in ImageUse::ALL {
            let spec = plan_transition(None, use_).expect("first use always needs a barrier");
            assert_eq!(spec.old_layout, vk::ImageLayout::UNDEFINED);
            assert_eq!(spec.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
            assert_eq!(spec.src_access, vk::AccessFlags::empty());
            assert_eq!(spec.new_layout, use_.layout());
        }
    }

    #[test]
    fn color_write_then_present_yields_two_barriers() {
        let mut state = None;
        let mut specs = Vec::new();
        for use_ in [ImageUse::ColorAttachmentWrite, ImageUse::Present] {
            if let Some(spec) = plan_transition(state, use_) {
                specs.push(spec);
            }
            state = Some(use_);
        }

        assert_eq!(specs.len(), 2);
        let present = specs[1];
        assert_eq!(present.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(present.src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(present.src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(present.dst_access, vk::AccessFlags::empty());
    }

    #[test]
    fn repeated_use_in_a_sequence_is_idempotent() {
        let uses = [
            ImageUse::TransferDstWrite,
            ImageUse::TransferDstWrite,
            ImageUse::ShaderSampledRead,
            ImageUse::ShaderSampledRead,
            ImageUse::ShaderSampledRead,
        ];

        let mut state = None;
        let mut barriers = 0;
        for use_ in uses {
            if plan_transition(state, use_).is_some() {
                barriers += 1;
            }
            state = Some(use_);
        }

        assert_eq!(barriers, 2);
    }

    #[test]
    fn use_triples_are_total() {
        // Every use must produce a concrete triple; a panic or an
        // unreachable arm here would mean a hole in the mapping.
        for use_ in ImageUse::ALL {
            let _ = use_.layout();
            let _ = use_.stage();
            let _ = use_.access();
        }
    }

    #[test]
    fn tracker_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ResourceStateTracker>();
    }
}
