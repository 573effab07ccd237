//! Command pools, recordable command buffers and one-shot submission.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::{Device, DynamicRenderingError};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Vulkan error creating command pool: {0}")]
    CreatePool(vk::Result),
    #[error("Vulkan error allocating command buffers: {0}")]
    Allocate(vk::Result),
    #[error("Vulkan error recording commands: {0}")]
    Record(vk::Result),
    #[error("Vulkan error submitting commands: {0}")]
    Submit(vk::Result),
    #[error("Vulkan error waiting for the queue: {0}")]
    Wait(vk::Result),
    #[error(transparent)]
    DynamicRendering(#[from] DynamicRenderingError),
}

/// Owns the raw pool. Buffers keep it alive so none outlive their pool.
struct PoolInner {
    parent: Arc<Device>,
    handle: vk::CommandPool,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.handle);
        // SAFETY: every CommandBuffer from this pool holds an Arc to it, so
        // none are alive; destroying the pool frees them all.
        unsafe { self.parent.destroy_raw_command_pool(self.handle) };
    }
}

/// A command pool whose buffers can be reset one at a time.
///
/// `!Sync`: allocation needs external synchronisation, so a pool stays on
/// the thread that records with it.
pub struct CommandPool {
    inner: Arc<PoolInner>,
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("handle", &self.inner.handle)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CommandError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: queue_family is one the device was created with.
        let handle = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CommandError::CreatePool)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };
        Ok(Self {
            inner: Arc::new(PoolInner {
                parent: Arc::clone(device),
                handle,
            }),
            _not_sync: std::marker::PhantomData,
        })
    }

    /// Allocate `count` primary command buffers.
    pub fn allocate(&self, count: u32) -> Result<Vec<CommandBuffer>, CommandError> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.inner.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        // SAFETY: the pool is live and `!Sync`, so no other thread allocates
        // from it concurrently.
        let handles = unsafe {
            self.inner.parent.allocate_raw_command_buffers(&allocate_info)
        }
        .map_err(CommandError::Allocate)?;
        Ok(handles
            .into_iter()
            .map(|handle| CommandBuffer {
                pool: Arc::clone(&self.inner),
                handle,
            })
            .collect())
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.inner.parent
    }
}

/// A primary command buffer.
///
/// Recording methods mirror the `vkCmd*` calls and are `unsafe`: the
/// caller keeps Vulkan's state machine (initial, recording, executable,
/// pending) straight.
pub struct CommandBuffer {
    pool: Arc<PoolInner>,
    handle: vk::CommandBuffer,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // SAFETY: owners only drop buffers that are not pending. The pool is
        // alive because we hold an Arc to it.
        unsafe {
            self.pool
                .parent
                .free_raw_command_buffers(self.pool.handle, &[self.handle])
        };
    }
}

impl CommandBuffer {
    fn device(&self) -> &Device {
        &self.pool.parent
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees the buffer is not pending.
        unsafe { self.device().reset_raw_command_buffer(self.handle) }
    }

    /// # Safety
    /// The buffer must be in the initial state.
    pub unsafe fn begin(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: caller guarantees the initial state.
        unsafe { self.device().begin_raw_command_buffer(self.handle, &begin_info) }
    }

    /// # Safety
    /// The buffer must be recording, outside any rendering scope.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees the recording state.
        unsafe { self.device().end_raw_command_buffer(self.handle) }
    }

    /// # Safety
    /// The buffer must be recording; every barrier must name live
    /// resources in the stated layouts.
    pub unsafe fn pipeline_barrier2(
        &mut self,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        // SAFETY: forwarded caller contract.
        unsafe { self.device().cmd_pipeline_barrier2(self.handle, dependency_info) }
    }

    /// # Safety
    /// The buffer must be recording and the attachments in the declared
    /// layouts.
    pub unsafe fn begin_rendering(
        &mut self,
        rendering_info: &vk::RenderingInfo<'_>,
    ) -> Result<(), DynamicRenderingError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.device().cmd_begin_raw_rendering(self.handle, rendering_info) }
    }

    /// # Safety
    /// The buffer must be inside a rendering scope.
    pub unsafe fn end_rendering(&mut self) -> Result<(), DynamicRenderingError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.device().cmd_end_raw_rendering(self.handle) }
    }

    /// # Safety
    /// The buffer must be recording; `pipeline` must outlive execution.
    pub unsafe fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline) {
        // SAFETY: forwarded caller contract.
        unsafe { self.device().cmd_bind_graphics_pipeline(self.handle, pipeline) }
    }

    /// # Safety
    /// The buffer must be recording; `buffer` must have vertex usage and
    /// outlive execution.
    pub unsafe fn bind_vertex_buffer(&mut self, binding: u32, buffer: vk::Buffer) {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.device()
                .cmd_bind_vertex_buffers(self.handle, binding, &[buffer], &[0])
        }
    }

    /// # Safety
    /// The buffer must be recording; `buffer` must have index usage and
    /// outlive execution.
    pub unsafe fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    ) {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.device()
                .cmd_bind_index_buffer(self.handle, buffer, 0, index_type)
        }
    }

    /// # Safety
    /// The buffer must be recording; sets must match `layout` and outlive
    /// execution.
    pub unsafe fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.device()
                .cmd_bind_descriptor_sets(self.handle, layout, first_set, sets)
        }
    }

    /// # Safety
    /// The buffer must be recording; regions must be in bounds for both
    /// buffers.
    pub unsafe fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: forwarded caller contract.
        unsafe { self.device().cmd_copy_buffer(self.handle, src, dst, regions) }
    }

    /// # Safety
    /// The buffer must be recording; `dst` must be in
    /// `TRANSFER_DST_OPTIMAL`.
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.handle,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    /// Blit within one image, `TRANSFER_SRC_OPTIMAL` to
    /// `TRANSFER_DST_OPTIMAL`.
    ///
    /// # Safety
    /// The buffer must be recording and the source and destination
    /// subresources in those layouts.
    pub unsafe fn blit_image_levels(
        &mut self,
        image: vk::Image,
        region: vk::ImageBlit,
        filter: vk::Filter,
    ) {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.device().cmd_blit_image(
                self.handle,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                filter,
            )
        }
    }

    /// Viewport and scissor covering `extent`.
    ///
    /// # Safety
    /// The buffer must be recording.
    pub unsafe fn set_full_viewport(&mut self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        // SAFETY: caller guarantees the recording state.
        unsafe {
            self.device().cmd_set_viewport(self.handle, viewport);
            self.device().cmd_set_scissor(self.handle, scissor);
        }
    }

    /// # Safety
    /// The buffer must be inside a rendering scope with pipeline, vertex
    /// buffer and index buffer bound.
    pub unsafe fn draw_indexed(&mut self, index_count: u32) {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.device()
                .cmd_draw_indexed(self.handle, index_count, 1, 0, 0, 0)
        }
    }
}

/// Record `record` into a fresh buffer, submit it on the graphics queue and
/// block until the queue is idle.
///
/// Used for uploads and layout changes outside the frame loop. The buffer
/// is freed before returning.
pub fn submit_one_shot<F>(pool: &CommandPool, record: F) -> Result<(), CommandError>
where
    F: FnOnce(&mut CommandBuffer),
{
    let device = Arc::clone(pool.parent());
    let mut buffers = pool.allocate(1)?;
    let Some(mut cmd) = buffers.pop() else {
        return Err(CommandError::Allocate(vk::Result::ERROR_UNKNOWN));
    };

    // SAFETY: freshly allocated, so in the initial state.
    unsafe { cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT) }
        .map_err(CommandError::Record)?;
    record(&mut cmd);
    // SAFETY: begun above; the closure leaves no rendering scope open.
    unsafe { cmd.end() }.map_err(CommandError::Record)?;

    let cmd_info =
        vk::CommandBufferSubmitInfo::default().command_buffer(cmd.raw_command_buffer());
    let submit = vk::SubmitInfo2::default()
        .command_buffer_infos(std::slice::from_ref(&cmd_info));
    // SAFETY: the buffer is executable and waits on nothing.
    unsafe { device.graphics_queue_submit2(&[submit], vk::Fence::null()) }
        .map_err(CommandError::Submit)?;
    device.graphics_queue_wait_idle().map_err(CommandError::Wait)?;
    Ok(())
}
