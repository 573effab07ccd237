//! Frame pacing: N frames in flight over a presentation chain.
//!
//! [`FramePacer`] owns only the sequencing. Each step of a frame is a call
//! on a [`FrameBackend`], so the ordering rules (wait before reuse, no
//! fence reset on an abandoned frame, rebuild after present) are checked
//! against a recording fake in the tests below. [`FrameRenderer`] is the
//! Vulkan backend.
//!
//! A rebuild the framebuffer has no area for (a minimized window) is left
//! pending. Every later [`FramePacer::draw_frame`] retries it first and
//! touches no slot until it succeeds; the host keeps calling, or sleeps
//! until its window reports a size, in between.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use bytemuck::Pod;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::buffer::{CreateBufferError, GpuBuffer, HostCopyError};
use crate::command::{CommandBuffer, CommandError, CommandPool};
use crate::device::{Device, DynamicRenderingError};
use crate::image::{TransitionMasks, level_barrier};
use crate::swapchain::{
    AcquireOutcome, PresentOutcome, PresentationChain, PresentationError, RebuildOutcome,
};
use crate::sync::{CreateSyncObjectError, Fence, FenceWaitError, Semaphore};

pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Frames in flight must be 2 or 3, got {0}")]
pub struct InvalidSlotCountError(pub usize);

/// A flag the window layer raises on resize and the frame loop lowers.
///
/// Cheap to clone; every clone shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct ResizeSignal(Arc<AtomicBool>);

impl ResizeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Read and clear.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image(u32),
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, then the chain was rebuilt.
    Rebuilt,
    /// Abandoned at acquire; the chain was rebuilt and nothing was
    /// submitted.
    Skipped,
    /// The chain needs a rebuild but the framebuffer has zero area. If the
    /// frame got as far as present it was still presented; otherwise no
    /// slot was touched.
    Deferred,
}

/// The per-frame operations, in the order [`FramePacer`] calls them.
///
/// `slot` is always below the pacer's slot count.
pub trait FrameBackend {
    type Error;

    /// Block until the slot's last submission has finished on the GPU.
    fn wait_in_flight(&mut self, slot: usize) -> Result<(), Self::Error>;

    fn acquire_image(&mut self, slot: usize) -> Result<Acquire, Self::Error>;

    /// Reset the slot's fence and command buffer.
    fn reset_slot(&mut self, slot: usize) -> Result<(), Self::Error>;

    fn record(&mut self, slot: usize, image: u32) -> Result<(), Self::Error>;

    fn update_uniforms(&mut self, slot: usize) -> Result<(), Self::Error>;

    fn submit(&mut self, slot: usize) -> Result<(), Self::Error>;

    fn present(
        &mut self,
        slot: usize,
        image: u32,
    ) -> Result<PresentOutcome, Self::Error>;

    fn rebuild_chain(&mut self) -> Result<RebuildOutcome, Self::Error>;
}

/// Rotates through 2 or 3 frame slots.
#[derive(Debug)]
pub struct FramePacer {
    slot_count: usize,
    frame_index: usize,
    resize: ResizeSignal,
    rebuild_pending: bool,
}

impl FramePacer {
    pub fn new(
        slot_count: usize,
        resize: ResizeSignal,
    ) -> Result<Self, InvalidSlotCountError> {
        if !(2..=3).contains(&slot_count) {
            return Err(InvalidSlotCountError(slot_count));
        }
        Ok(Self {
            slot_count,
            frame_index: 0,
            resize,
            rebuild_pending: false,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// The slot the next frame will use.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// The flag this pacer reads after each present.
    pub fn resize_signal(&self) -> &ResizeSignal {
        &self.resize
    }

    /// A rebuild was deferred and will be retried by the next frame.
    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    fn rebuild<B: FrameBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<RebuildOutcome, B::Error> {
        let outcome = backend.rebuild_chain()?;
        self.rebuild_pending = outcome == RebuildOutcome::Deferred;
        Ok(outcome)
    }

    /// Run one frame on the current slot.
    ///
    /// A stale acquire abandons the frame before the fence is reset, so the
    /// next wait on this slot does not block, and the slot is retried on
    /// the next call.
    pub fn draw_frame<B: FrameBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<FrameOutcome, B::Error> {
        if self.rebuild_pending {
            if self.rebuild(backend)? == RebuildOutcome::Deferred {
                return Ok(FrameOutcome::Deferred);
            }
            // Built at the current size, which covers any resize seen
            // while waiting.
            self.resize.take();
        }

        let slot = self.frame_index;
        backend.wait_in_flight(slot)?;

        let image = match backend.acquire_image(slot)? {
            Acquire::Image(image) => image,
            Acquire::Stale => {
                return Ok(match self.rebuild(backend)? {
                    RebuildOutcome::Rebuilt => FrameOutcome::Skipped,
                    RebuildOutcome::Deferred => FrameOutcome::Deferred,
                });
            }
        };

        backend.reset_slot(slot)?;
        backend.record(slot, image)?;
        backend.update_uniforms(slot)?;
        backend.submit(slot)?;
        let presented = backend.present(slot, image)?;

        let resized = self.resize.take();
        let outcome = if presented == PresentOutcome::Stale || resized {
            match self.rebuild(backend)? {
                RebuildOutcome::Rebuilt => FrameOutcome::Rebuilt,
                RebuildOutcome::Deferred => FrameOutcome::Deferred,
            }
        } else {
            FrameOutcome::Presented
        };

        self.frame_index = (self.frame_index + 1) % self.slot_count;
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Vulkan backend
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateFrameSlotsError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Sync(#[from] CreateSyncObjectError),
    #[error("Uniform buffer: {0}")]
    Uniform(#[from] CreateBufferError),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Waiting for frame slot: {0}")]
    Wait(#[from] FenceWaitError),
    #[error(transparent)]
    Presentation(#[from] PresentationError),
    #[error("Vulkan error resetting frame slot: {0}")]
    Reset(vk::Result),
    #[error("Vulkan error recording frame: {0}")]
    Record(vk::Result),
    #[error(transparent)]
    DynamicRendering(#[from] DynamicRenderingError),
    #[error("Vulkan error submitting frame: {0}")]
    Submit(vk::Result),
    #[error("Writing uniforms: {0}")]
    Uniform(#[from] HostCopyError),
}

/// Everything one in-flight frame needs for itself.
pub struct FrameSlot {
    command_buffer: CommandBuffer,
    image_acquired: Semaphore,
    render_complete: Semaphore,
    in_flight: Fence,
    uniform: GpuBuffer,
}

impl std::fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlot")
            .field("command_buffer", &self.command_buffer)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl FrameSlot {
    pub fn uniform_buffer(&self) -> &GpuBuffer {
        &self.uniform
    }
}

/// The frame slots, created and destroyed together.
///
/// Slots are independent of the presentation chain and survive rebuilds.
#[derive(Debug)]
pub struct FrameSlots {
    slots: Vec<FrameSlot>,
    // Last so it is destroyed after the command buffers.
    _pool: CommandPool,
}

impl FrameSlots {
    /// Create `count` slots, each with a host-visible uniform buffer sized
    /// for `U`.
    pub fn new<U: Pod>(
        device: &Arc<Device>,
        count: usize,
    ) -> Result<Self, CreateFrameSlotsError> {
        let pool = CommandPool::new(
            device,
            device.graphics_queue_family(),
            Some("frame command pool"),
        )?;
        let command_buffers = pool.allocate(count as u32)?;
        let mut slots = Vec::with_capacity(count);
        for (index, command_buffer) in command_buffers.into_iter().enumerate() {
            slots.push(FrameSlot {
                command_buffer,
                image_acquired: Semaphore::new(
                    device,
                    Some(&format!("frame {index} image acquired")),
                )?,
                render_complete: Semaphore::new(
                    device,
                    Some(&format!("frame {index} render complete")),
                )?,
                in_flight: Fence::new(
                    device,
                    true,
                    Some(&format!("frame {index} in flight")),
                )?,
                uniform: GpuBuffer::new(
                    device,
                    std::mem::size_of::<U>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    Some(&format!("frame {index} uniforms")),
                )?,
            });
        }
        tracing::debug!("Created {count} frame slots");
        Ok(Self { slots, _pool: pool })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameSlot> {
        self.slots.iter()
    }
}

/// Draws into an open rendering scope and supplies per-slot uniforms.
pub trait FrameRecorder {
    type Uniform: Pod;

    fn clear_color(&self) -> [f32; 4] {
        [0.0, 0.0, 0.0, 1.0]
    }

    /// Record draws for `slot`. Viewport and scissor are already set.
    ///
    /// # Safety
    /// `cmd` is inside a rendering scope targeting a colour attachment of
    /// the format the recorder's pipelines were built for.
    unsafe fn record_draws(&self, cmd: &mut CommandBuffer, slot: usize);

    /// The uniform block for the frame about to be submitted on `slot`.
    fn uniforms(&mut self, slot: usize, extent: vk::Extent2D) -> Self::Uniform;
}

/// Barrier moving a presentation image into or out of the colour
/// attachment layout.
fn present_image_barrier(
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;

    let masks = if new == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
        TransitionMasks {
            src_stage: S::COLOR_ATTACHMENT_OUTPUT,
            src_access: A::NONE,
            dst_stage: S::COLOR_ATTACHMENT_OUTPUT,
            dst_access: A::COLOR_ATTACHMENT_WRITE,
        }
    } else {
        TransitionMasks {
            src_stage: S::COLOR_ATTACHMENT_OUTPUT,
            src_access: A::COLOR_ATTACHMENT_WRITE,
            dst_stage: S::NONE,
            dst_access: A::NONE,
        }
    };
    level_barrier(image, vk::ImageAspectFlags::COLOR, 0..1, (old, new), masks)
}

/// The Vulkan [`FrameBackend`]: a presentation chain, its frame slots and
/// whatever records into them.
pub struct FrameRenderer<T: HasDisplayHandle + HasWindowHandle, R: FrameRecorder> {
    device: Arc<Device>,
    chain: PresentationChain<T>,
    slots: FrameSlots,
    recorder: R,
    framebuffer_size: vk::Extent2D,
}

impl<T: HasDisplayHandle + HasWindowHandle, R: FrameRecorder> std::fmt::Debug
    for FrameRenderer<T, R>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRenderer")
            .field("chain", &self.chain)
            .field("slots", &self.slots)
            .field("framebuffer_size", &self.framebuffer_size)
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle, R: FrameRecorder> FrameRenderer<T, R> {
    /// `slots` must have as many entries as the [`FramePacer`] driving this
    /// renderer has slots.
    pub fn new(
        chain: PresentationChain<T>,
        slots: FrameSlots,
        recorder: R,
    ) -> Self {
        let framebuffer_size = chain.extent();
        Self {
            device: Arc::clone(chain.device()),
            chain,
            slots,
            recorder,
            framebuffer_size,
        }
    }

    /// Size to rebuild the chain at next time it goes stale.
    pub fn set_framebuffer_size(&mut self, size: vk::Extent2D) {
        self.framebuffer_size = size;
    }

    pub fn chain(&self) -> &PresentationChain<T> {
        &self.chain
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut R {
        &mut self.recorder
    }

    pub fn slots(&self) -> &FrameSlots {
        &self.slots
    }
}

impl<T: HasDisplayHandle + HasWindowHandle, R: FrameRecorder> FrameBackend
    for FrameRenderer<T, R>
{
    type Error = FrameError;

    fn wait_in_flight(&mut self, slot: usize) -> Result<(), FrameError> {
        let _span = tracing::trace_span!("wait_in_flight", slot).entered();
        self.slots.slots[slot].in_flight.wait(u64::MAX)?;
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> Result<Acquire, FrameError> {
        let semaphore = &self.slots.slots[slot].image_acquired;
        Ok(match self.chain.acquire_next_image(semaphore)? {
            AcquireOutcome::Acquired { index, .. } => Acquire::Image(index),
            AcquireOutcome::Stale => Acquire::Stale,
        })
    }

    fn reset_slot(&mut self, slot: usize) -> Result<(), FrameError> {
        let slot = &mut self.slots.slots[slot];
        // SAFETY: wait_in_flight returned for this slot, so neither the
        // fence nor the command buffer is pending.
        unsafe {
            slot.in_flight.reset().map_err(FrameError::Reset)?;
            slot.command_buffer.reset().map_err(FrameError::Reset)?;
        }
        Ok(())
    }

    fn record(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
        let index = image as usize;
        let raw_image = self.chain.images()[index];
        let view = self.chain.views()[index].raw_image_view();
        let extent = self.chain.extent();
        let clear = self.recorder.clear_color();
        let cmd = &mut self.slots.slots[slot].command_buffer;

        let to_attachment = present_image_barrier(
            raw_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let to_present = present_image_barrier(
            raw_image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: clear },
            });
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));

        // SAFETY: the slot was reset after its fence signaled; the image was
        // acquired for this frame and the view belongs to it.
        unsafe {
            cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .map_err(FrameError::Record)?;
            cmd.pipeline_barrier2(
                &vk::DependencyInfo::default()
                    .image_memory_barriers(std::slice::from_ref(&to_attachment)),
            );
            cmd.begin_rendering(&rendering_info)?;
            cmd.set_full_viewport(extent);
            self.recorder.record_draws(cmd, slot);
            cmd.end_rendering()?;
            cmd.pipeline_barrier2(
                &vk::DependencyInfo::default()
                    .image_memory_barriers(std::slice::from_ref(&to_present)),
            );
            cmd.end().map_err(FrameError::Record)?;
        }
        Ok(())
    }

    fn update_uniforms(&mut self, slot: usize) -> Result<(), FrameError> {
        let uniforms = self.recorder.uniforms(slot, self.chain.extent());
        self.slots.slots[slot]
            .uniform
            .write_pod(std::slice::from_ref(&uniforms))?;
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<(), FrameError> {
        let slot = &mut self.slots.slots[slot];
        let wait = vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.image_acquired.raw_semaphore())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let signal = vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.render_complete.raw_semaphore())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        let cmd_info = vk::CommandBufferSubmitInfo::default()
            .command_buffer(slot.command_buffer.raw_command_buffer());
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(std::slice::from_ref(&wait))
            .command_buffer_infos(std::slice::from_ref(&cmd_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal));
        // SAFETY: the command buffer was just ended, image_acquired has a
        // pending signal from this frame's acquire and the fence was reset.
        unsafe {
            self.device
                .graphics_queue_submit2(&[submit], slot.in_flight.raw_fence())
                .map_err(FrameError::Submit)?;
            slot.in_flight.mark_submitted();
        }
        Ok(())
    }

    fn present(
        &mut self,
        slot: usize,
        image: u32,
    ) -> Result<PresentOutcome, FrameError> {
        let render_complete = &self.slots.slots[slot].render_complete;
        let outcome = self.chain.present(render_complete, image)?;
        // A suboptimal acquire earlier in the frame also asks for a rebuild.
        if self.chain.is_stale() {
            Ok(PresentOutcome::Stale)
        } else {
            Ok(outcome)
        }
    }

    fn rebuild_chain(&mut self) -> Result<RebuildOutcome, FrameError> {
        Ok(self.chain.rebuild(self.framebuffer_size)?)
    }
}

impl<T: HasDisplayHandle + HasWindowHandle, R: FrameRecorder> Drop
    for FrameRenderer<T, R>
{
    fn drop(&mut self) {
        tracing::debug!("Dropping frame renderer");
        // Slots and the chain may still be in use by the last frames.
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Uniforms(usize),
        Submit(usize),
        Present(usize, u32),
        Rebuild,
    }

    /// Records calls and plays back scripted acquire/present results.
    #[derive(Default)]
    struct FakeBackend {
        calls: Vec<Call>,
        stale_acquires: Vec<bool>,
        stale_presents: Vec<bool>,
        /// Rebuilds to report as deferred before the window is restored.
        zero_area_rebuilds: usize,
        next_image: u32,
        image_count: u32,
        /// Per slot: true between submit and the next wait.
        pending: [bool; 3],
        /// Per slot: fence signaled (created signaled).
        signaled: [bool; 3],
    }

    impl FakeBackend {
        fn new(image_count: u32) -> Self {
            Self {
                image_count,
                signaled: [true; 3],
                ..Default::default()
            }
        }
    }

    impl FrameBackend for FakeBackend {
        type Error = String;

        fn wait_in_flight(&mut self, slot: usize) -> Result<(), String> {
            self.calls.push(Call::Wait(slot));
            if self.pending[slot] {
                // GPU finishes the slot's work.
                self.pending[slot] = false;
                self.signaled[slot] = true;
            }
            if !self.signaled[slot] {
                return Err(format!("slot {slot} would wait forever"));
            }
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<Acquire, String> {
            self.calls.push(Call::Acquire(slot));
            if !self.stale_acquires.is_empty() && self.stale_acquires.remove(0) {
                return Ok(Acquire::Stale);
            }
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(Acquire::Image(image))
        }

        fn reset_slot(&mut self, slot: usize) -> Result<(), String> {
            self.calls.push(Call::Reset(slot));
            if self.pending[slot] {
                return Err(format!("slot {slot} reset while pending"));
            }
            self.signaled[slot] = false;
            Ok(())
        }

        fn record(&mut self, slot: usize, image: u32) -> Result<(), String> {
            self.calls.push(Call::Record(slot, image));
            Ok(())
        }

        fn update_uniforms(&mut self, slot: usize) -> Result<(), String> {
            self.calls.push(Call::Uniforms(slot));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<(), String> {
            self.calls.push(Call::Submit(slot));
            self.pending[slot] = true;
            Ok(())
        }

        fn present(
            &mut self,
            slot: usize,
            image: u32,
        ) -> Result<PresentOutcome, String> {
            self.calls.push(Call::Present(slot, image));
            if !self.stale_presents.is_empty() && self.stale_presents.remove(0) {
                Ok(PresentOutcome::Stale)
            } else {
                Ok(PresentOutcome::Presented)
            }
        }

        fn rebuild_chain(&mut self) -> Result<RebuildOutcome, String> {
            self.calls.push(Call::Rebuild);
            if self.zero_area_rebuilds > 0 {
                self.zero_area_rebuilds -= 1;
                return Ok(RebuildOutcome::Deferred);
            }
            Ok(RebuildOutcome::Rebuilt)
        }
    }

    #[test]
    fn slot_count_must_be_two_or_three() {
        assert_eq!(
            FramePacer::new(1, ResizeSignal::new()).unwrap_err(),
            InvalidSlotCountError(1)
        );
        assert_eq!(
            FramePacer::new(4, ResizeSignal::new()).unwrap_err(),
            InvalidSlotCountError(4)
        );
        assert!(FramePacer::new(2, ResizeSignal::new()).is_ok());
        assert!(FramePacer::new(3, ResizeSignal::new()).is_ok());
    }

    #[test]
    fn frame_steps_run_in_order() {
        let mut pacer = FramePacer::new(2, ResizeSignal::new()).unwrap();
        let mut backend = FakeBackend::new(3);
        assert_eq!(
            pacer.draw_frame(&mut backend),
            Ok(FrameOutcome::Presented)
        );
        assert_eq!(
            backend.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Record(0, 0),
                Call::Uniforms(0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(pacer.frame_index(), 1);
    }

    #[test]
    fn slots_rotate_modulo_count() {
        let mut pacer = FramePacer::new(3, ResizeSignal::new()).unwrap();
        let mut backend = FakeBackend::new(4);
        let mut used = Vec::new();
        for _ in 0..7 {
            used.push(pacer.frame_index());
            pacer.draw_frame(&mut backend).unwrap();
        }
        assert_eq!(used, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn stale_acquire_skips_reset_and_record() {
        let mut pacer = FramePacer::new(2, ResizeSignal::new()).unwrap();
        let mut backend = FakeBackend::new(3);
        backend.stale_acquires = vec![true];

        assert_eq!(pacer.draw_frame(&mut backend), Ok(FrameOutcome::Skipped));
        assert_eq!(
            backend.calls,
            vec![Call::Wait(0), Call::Acquire(0), Call::Rebuild]
        );
        // Same slot is retried.
        assert_eq!(pacer.frame_index(), 0);

        // The fence was never reset, so the retry's wait does not hang.
        backend.calls.clear();
        assert_eq!(
            pacer.draw_frame(&mut backend),
            Ok(FrameOutcome::Presented)
        );
        assert_eq!(backend.calls[0], Call::Wait(0));
        assert!(backend.calls.contains(&Call::Submit(0)));
    }

    #[test]
    fn stale_present_rebuilds_after_presenting() {
        let mut pacer = FramePacer::new(2, ResizeSignal::new()).unwrap();
        let mut backend = FakeBackend::new(3);
        backend.stale_presents = vec![true];

        assert_eq!(pacer.draw_frame(&mut backend), Ok(FrameOutcome::Rebuilt));
        assert_eq!(
            &backend.calls[backend.calls.len() - 2..],
            &[Call::Present(0, 0), Call::Rebuild]
        );
        assert_eq!(pacer.frame_index(), 1);
    }

    #[test]
    fn resize_signal_is_consumed_once() {
        let resize = ResizeSignal::new();
        let mut pacer = FramePacer::new(2, resize.clone()).unwrap();
        let mut backend = FakeBackend::new(3);

        resize.signal();
        assert_eq!(pacer.draw_frame(&mut backend), Ok(FrameOutcome::Rebuilt));
        assert_eq!(
            pacer.draw_frame(&mut backend),
            Ok(FrameOutcome::Presented)
        );
        assert_eq!(
            backend.calls.iter().filter(|c| **c == Call::Rebuild).count(),
            1
        );
    }

    #[test]
    fn zero_area_rebuild_holds_slots_until_restored() {
        let mut pacer = FramePacer::new(2, ResizeSignal::new()).unwrap();
        let mut backend = FakeBackend::new(3);
        backend.zero_area_rebuilds = 3;

        // Minimized: the resize lands after a present.
        pacer.resize_signal().signal();
        assert_eq!(pacer.draw_frame(&mut backend), Ok(FrameOutcome::Deferred));
        assert!(pacer.rebuild_pending());
        assert_eq!(pacer.frame_index(), 1);

        let fences = (backend.pending, backend.signaled);
        for _ in 0..2 {
            backend.calls.clear();
            assert_eq!(pacer.draw_frame(&mut backend), Ok(FrameOutcome::Deferred));
            assert_eq!(backend.calls, vec![Call::Rebuild]);
        }
        assert_eq!(pacer.frame_index(), 1);
        assert_eq!((backend.pending, backend.signaled), fences);

        // Restored: the window layer reports the new size again.
        pacer.resize_signal().signal();
        backend.calls.clear();
        assert_eq!(
            pacer.draw_frame(&mut backend),
            Ok(FrameOutcome::Presented)
        );
        assert!(!pacer.rebuild_pending());
        assert_eq!(
            backend.calls,
            vec![
                Call::Rebuild,
                Call::Wait(1),
                Call::Acquire(1),
                Call::Reset(1),
                Call::Record(1, 1),
                Call::Uniforms(1),
                Call::Submit(1),
                Call::Present(1, 1),
            ]
        );
        assert_eq!(pacer.frame_index(), 0);
    }

    #[test]
    fn stale_acquire_at_zero_area_retries_the_same_slot() {
        let mut pacer = FramePacer::new(2, ResizeSignal::new()).unwrap();
        let mut backend = FakeBackend::new(3);
        backend.stale_acquires = vec![true];
        backend.zero_area_rebuilds = 1;

        assert_eq!(pacer.draw_frame(&mut backend), Ok(FrameOutcome::Deferred));
        assert_eq!(
            backend.calls,
            vec![Call::Wait(0), Call::Acquire(0), Call::Rebuild]
        );
        assert_eq!(pacer.frame_index(), 0);

        backend.calls.clear();
        assert_eq!(
            pacer.draw_frame(&mut backend),
            Ok(FrameOutcome::Presented)
        );
        assert_eq!(&backend.calls[..3], &[Call::Rebuild, Call::Wait(0), Call::Acquire(0)]);
        assert_eq!(pacer.frame_index(), 1);
    }

    #[test]
    fn every_reset_follows_a_wait_on_the_same_slot() {
        let mut pacer = FramePacer::new(2, ResizeSignal::new()).unwrap();
        let mut backend = FakeBackend::new(3);
        backend.stale_acquires = vec![false, true, false, false, true];
        backend.stale_presents = vec![false, false, true];
        for _ in 0..8 {
            pacer.draw_frame(&mut backend).unwrap();
        }

        let mut last_wait = None;
        for call in &backend.calls {
            match *call {
                Call::Wait(slot) => last_wait = Some(slot),
                Call::Reset(slot) | Call::Record(slot, _) => {
                    assert_eq!(last_wait, Some(slot))
                }
                _ => {}
            }
        }
    }

    #[test]
    fn resize_signal_reads_and_clears() {
        let signal = ResizeSignal::new();
        assert!(!signal.take());
        signal.clone().signal();
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn present_barriers_bracket_the_attachment_layout() {
        let image = vk::Image::null();
        let to_attachment = present_image_barrier(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(
            to_attachment.dst_access_mask,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(
            to_attachment.dst_stage_mask,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );

        let to_present = present_image_barrier(
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert_eq!(
            to_present.src_access_mask,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(to_present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(to_present.subresource_range.level_count, 1);
    }
}
