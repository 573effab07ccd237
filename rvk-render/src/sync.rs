//! Owned fences and binary semaphores.
//!
//! A [`Fence`] tracks on the CPU side whether it has been handed to a
//! queue since its last reset. That bookkeeping is what lets the frame
//! loop skip the reset when a frame is abandoned after the wait: a fence
//! that was waited on but never reset stays signaled, so the next wait on
//! the same slot returns immediately instead of deadlocking.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateSyncObjectError {
    #[error("Vulkan error creating fence: {0}")]
    Fence(vk::Result),
    #[error("Vulkan error creating semaphore: {0}")]
    Semaphore(vk::Result),
}

#[derive(Debug, Error)]
pub enum FenceWaitError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Fence was never submitted and would block forever")]
    NeverSubmitted,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
}

/// Where the fence is in its submit/wait/reset cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    /// Unsignaled, may be passed to a submission.
    Armed,
    /// Handed to a queue (or created signaled); a wait will return.
    InFlight,
}

/// An owned binary `VkFence`.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    state: FenceState,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence, optionally already signaled.
    ///
    /// Frame slots create theirs signaled so the first wait on each slot
    /// returns at once.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: Option<&str>,
    ) -> Result<Self, CreateSyncObjectError> {
        let create_info = vk::FenceCreateInfo::default().flags(if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        });
        // SAFETY: create_info borrows nothing.
        let handle = unsafe { device.create_raw_fence(&create_info) }
            .map_err(CreateSyncObjectError::Fence)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            state: if signaled {
                FenceState::InFlight
            } else {
                FenceState::Armed
            },
        })
    }

    /// Block until signaled or `timeout_ns` elapses (`u64::MAX` for no
    /// limit).
    pub fn wait(&self, timeout_ns: u64) -> Result<(), FenceWaitError> {
        if self.state == FenceState::Armed {
            return Err(FenceWaitError::NeverSubmitted);
        }
        // SAFETY: handle belongs to parent.
        unsafe { self.parent.wait_for_raw_fences(&[self.handle], true, timeout_ns) }
            .map_err(|e| match e {
                vk::Result::TIMEOUT => FenceWaitError::Timeout,
                e => FenceWaitError::Vulkan(e),
            })
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> Result<bool, vk::Result> {
        // SAFETY: handle belongs to parent.
        unsafe { self.parent.get_raw_fence_status(self.handle) }
    }

    /// Return the fence to the unsignaled state.
    ///
    /// A no-op when it is already unsignaled.
    ///
    /// # Safety
    /// The fence must not be pending on a queue, i.e. a [`wait`](Self::wait)
    /// has returned `Ok` since the last submission.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        if self.state == FenceState::Armed {
            return Ok(());
        }
        // SAFETY: caller guarantees the fence is not pending.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }?;
        self.state = FenceState::Armed;
        Ok(())
    }

    /// Record that the fence was passed to a queue submission.
    ///
    /// # Safety
    /// The raw fence must really have been submitted; marking an unsubmitted
    /// fence makes the next [`wait`](Self::wait) block forever.
    pub unsafe fn mark_submitted(&mut self) {
        debug_assert_eq!(self.state, FenceState::Armed);
        self.state = FenceState::InFlight;
    }

    /// Whether the fence may be passed to a submission.
    pub fn is_armed(&self) -> bool {
        self.state == FenceState::Armed
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: owners wait for the device to go idle before tearing down
        // frame slots, so the fence is not pending.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

/// An owned binary `VkSemaphore`, used to order acquire, render and
/// present on the GPU.
pub struct Semaphore {
    parent: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(
        device: &Arc<Device>,
        name: Option<&str>,
    ) -> Result<Self, CreateSyncObjectError> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: create_info borrows nothing.
        let handle = unsafe { device.create_raw_semaphore(&create_info) }
            .map_err(CreateSyncObjectError::Semaphore)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_semaphore(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        // SAFETY: no queue operation references the semaphore once its owner
        // has waited for idle.
        unsafe { self.parent.destroy_raw_semaphore(self.handle) };
    }
}
