//! [`GpuBuffer`]: a `VkBuffer` bound to memory it owns.
//!
//! Memory is chosen by property flags rather than by usage presets, so
//! the same type covers staging buffers, per-frame uniforms and
//! device-local geometry. Host access goes through
//! [`copy_to_host_visible`](GpuBuffer::copy_to_host_visible) and
//! [`read_host_visible`](GpuBuffer::read_host_visible). Host-visible
//! memory is always coherent (see [`Device::allocate_memory`]), so neither
//! flushes nor invalidates.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use thiserror::Error;

use crate::device::{Device, MemoryAllocationError};

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Buffer size must be non-zero")]
    ZeroSize,
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),
    #[error("Failed to allocate buffer memory: {0}")]
    Memory(#[from] MemoryAllocationError),
    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostCopyError {
    #[error("Buffer memory is not host-visible")]
    NotHostVisible,
    #[error(
        "Range of {len} bytes at offset {offset} exceeds buffer size {size}"
    )]
    OutOfBounds {
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    #[error("Allocation is not mapped")]
    NotMapped,
}

/// Reject host accesses that fall outside the buffer.
fn check_host_range(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    size: vk::DeviceSize,
) -> Result<(), HostCopyError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(HostCopyError::OutOfBounds { offset, len, size }),
    }
}

/// A buffer and the memory backing it.
///
/// Dropping destroys the buffer before releasing its memory. The owner
/// must make sure no pending GPU work still reads it.
pub struct GpuBuffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

impl GpuBuffer {
    /// Create a buffer of `size` bytes with memory that has at least
    /// `memory_properties`.
    ///
    /// Host-visible buffers come back persistently mapped.
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        if size == 0 {
            return Err(CreateBufferError::ZeroSize);
        }
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: create_info borrows nothing.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        // SAFETY: handle is live.
        let requirements =
            unsafe { device.get_raw_buffer_memory_requirements(handle) };
        let allocation = match device.allocate_memory(
            name.unwrap_or("buffer"),
            requirements,
            memory_properties,
            true,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: handle is unbound and unused.
                unsafe { device.destroy_raw_buffer(handle) };
                return Err(e.into());
            }
        };

        // SAFETY: the allocation satisfies the buffer's requirements.
        let bound = unsafe {
            device.bind_raw_buffer_memory(
                handle,
                allocation.memory(),
                allocation.offset(),
            )
        };
        if let Err(e) = bound {
            // SAFETY: handle is unused.
            unsafe { device.destroy_raw_buffer(handle) };
            if let Err(e) = device.free_memory(allocation) {
                tracing::error!("Failed to free buffer memory: {e}");
            }
            return Err(CreateBufferError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            size,
            usage,
        })
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    fn allocation(&self) -> &Allocation {
        self.allocation
            .as_ref()
            .expect("allocation is only None during drop")
    }

    /// Property flags of the memory type actually chosen.
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.allocation().memory_properties()
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn mapped_bytes(&self) -> Result<*mut u8, HostCopyError> {
        if !self.is_host_visible() {
            return Err(HostCopyError::NotHostVisible);
        }
        self.allocation()
            .mapped_ptr()
            .map(|ptr| ptr.as_ptr().cast::<u8>())
            .ok_or(HostCopyError::NotMapped)
    }

    /// Copy `bytes` into the mapped memory at `offset`.
    ///
    /// The write is visible to work submitted after this returns.
    pub fn copy_to_host_visible(
        &mut self,
        bytes: &[u8],
        offset: vk::DeviceSize,
    ) -> Result<(), HostCopyError> {
        let len = bytes.len() as vk::DeviceSize;
        check_host_range(offset, len, self.size)?;
        let mapped = self.mapped_bytes()?;
        // SAFETY: mapped covers the whole buffer and the range was checked
        // above. &mut self rules out overlapping host reads.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped.add(offset as usize),
                bytes.len(),
            )
        };
        Ok(())
    }

    /// Typed convenience over [`copy_to_host_visible`](Self::copy_to_host_visible).
    pub fn write_pod<T: Pod>(&mut self, data: &[T]) -> Result<(), HostCopyError> {
        self.copy_to_host_visible(bytemuck::cast_slice(data), 0)
    }

    /// Read `len` bytes at `offset` back from mapped memory.
    ///
    /// The caller must have waited for any GPU write to finish first.
    pub fn read_host_visible(
        &self,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> Result<Vec<u8>, HostCopyError> {
        check_host_range(offset, len, self.size)?;
        let mapped = self.mapped_bytes()?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: range checked above; GPU writes are complete per the
        // documented contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped.add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        Ok(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        // SAFETY: the owner guarantees no pending work uses the buffer.
        unsafe { self.parent.destroy_raw_buffer(self.handle) };
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free buffer memory: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_range_must_fit() {
        assert!(check_host_range(0, 16, 16).is_ok());
        assert!(check_host_range(8, 8, 16).is_ok());
        assert!(check_host_range(16, 0, 16).is_ok());
        assert_eq!(
            check_host_range(8, 9, 16),
            Err(HostCopyError::OutOfBounds {
                offset: 8,
                len: 9,
                size: 16
            })
        );
        assert!(check_host_range(u64::MAX, 2, 16).is_err());
    }
}
