//! [`ResourceAllocator`]: creation of GPU resources and the staged upload
//! path.
//!
//! Uploads are synchronous. Each one records into a one-shot command
//! buffer, submits on the graphics queue and waits for that queue to go
//! idle, so the transient staging buffer can be dropped as soon as the
//! call returns.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::{CreateBufferError, GpuBuffer, HostCopyError};
use crate::command::{CommandError, CommandPool, submit_one_shot};
use crate::device::Device;
use crate::image::{
    CreateImageError, GpuImage, ImageDesc, LayoutTransitionError, MipmapError,
    mip_level_count, record_layout_transition, record_mipmap_generation,
};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Refusing to upload zero bytes")]
    Empty,
    #[error("Upload of {len} bytes does not fit in {capacity} byte destination")]
    TooLarge {
        len: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },
    #[error("Staging buffer: {0}")]
    Staging(#[from] CreateBufferError),
    #[error("Writing staging memory: {0}")]
    HostCopy(#[from] HostCopyError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Transition(#[from] LayoutTransitionError),
    #[error(transparent)]
    Mipmap(#[from] MipmapError),
}

#[derive(Debug, Error)]
pub enum CreateTextureError {
    #[error("Pixel data has {actual} bytes, a {width}x{height} RGBA8 image needs {expected}")]
    PixelCount {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Image(#[from] CreateImageError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Bounds check shared by buffer and image uploads.
fn check_upload_size(
    len: vk::DeviceSize,
    capacity: vk::DeviceSize,
) -> Result<(), UploadError> {
    if len == 0 {
        Err(UploadError::Empty)
    } else if len > capacity {
        Err(UploadError::TooLarge { len, capacity })
    } else {
        Ok(())
    }
}

/// Expected byte length of tightly packed RGBA8 pixels.
pub fn rgba8_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Creates buffers and images and fills them from host memory.
///
/// Owns the command pool used for one-shot transfer work. `!Sync` through
/// that pool: uploads happen on the thread that owns the allocator.
pub struct ResourceAllocator {
    device: Arc<Device>,
    pool: CommandPool,
}

impl std::fmt::Debug for ResourceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAllocator")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ResourceAllocator {
    pub fn new(device: &Arc<Device>) -> Result<Self, CommandError> {
        Ok(Self {
            device: Arc::clone(device),
            pool: CommandPool::new(
                device,
                device.graphics_queue_family(),
                Some("upload command pool"),
            )?,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// A buffer of exactly `size` bytes in memory with at least
    /// `memory_properties`. Zero is rejected.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        name: Option<&str>,
    ) -> Result<GpuBuffer, CreateBufferError> {
        GpuBuffer::new(&self.device, size, usage, memory_properties, name)
    }

    /// Host-visible, coherent `TRANSFER_SRC` buffer holding `bytes`.
    fn staging_buffer(&self, bytes: &[u8]) -> Result<GpuBuffer, UploadError> {
        let mut staging = self.create_buffer(
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some("staging buffer"),
        )?;
        staging.copy_to_host_visible(bytes, 0)?;
        Ok(staging)
    }

    /// Copy `bytes` into `buffer`'s mapped memory at `offset`.
    pub fn copy_to_host_visible(
        &self,
        buffer: &mut GpuBuffer,
        bytes: &[u8],
        offset: vk::DeviceSize,
    ) -> Result<(), HostCopyError> {
        buffer.copy_to_host_visible(bytes, offset)
    }

    /// Copy `dest.len()` bytes at `offset` out of `buffer`'s mapped memory.
    pub fn read_host_visible(
        &self,
        buffer: &GpuBuffer,
        offset: vk::DeviceSize,
        dest: &mut [u8],
    ) -> Result<(), HostCopyError> {
        let bytes = buffer.read_host_visible(offset, dest.len() as vk::DeviceSize)?;
        dest.copy_from_slice(&bytes);
        Ok(())
    }

    /// Fill the front of `destination` with `data` through a transient
    /// staging buffer.
    ///
    /// `destination` needs `TRANSFER_DST` usage. Blocks until the copy has
    /// executed.
    pub fn upload_via_staging(
        &self,
        destination: &GpuBuffer,
        data: &[u8],
    ) -> Result<(), UploadError> {
        let len = data.len() as vk::DeviceSize;
        check_upload_size(len, destination.size())?;
        let _span = tracing::debug_span!("upload_via_staging", len).entered();

        let staging = self.staging_buffer(data)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: len,
        };
        submit_one_shot(&self.pool, |cmd| {
            // SAFETY: cmd is recording; both buffers outlive the blocking
            // submit and the region was bounds-checked above.
            unsafe {
                cmd.copy_buffer(
                    staging.raw_buffer(),
                    destination.raw_buffer(),
                    &[region],
                )
            };
        })?;
        Ok(())
    }

    /// A device-local buffer holding `data`, with `usage | TRANSFER_DST`.
    pub fn create_device_local_buffer_with_data(
        &self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<GpuBuffer, UploadError> {
        if data.is_empty() {
            return Err(UploadError::Empty);
        }
        let buffer = self.create_buffer(
            data.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            name,
        )?;
        self.upload_via_staging(&buffer, data)?;
        Ok(buffer)
    }

    pub fn create_image(
        &self,
        desc: ImageDesc,
        name: Option<&str>,
    ) -> Result<GpuImage, CreateImageError> {
        GpuImage::new(&self.device, desc, name)
    }

    /// Move every mip level of `image` from `old` to `new`.
    ///
    /// Only the transitions the upload path needs are supported; others
    /// fail without submitting anything.
    pub fn transition_image_layout(
        &self,
        image: &GpuImage,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<(), UploadError> {
        // Validate up front so a bad pair never reaches the queue.
        crate::image::transition_barrier_masks(old, new)?;
        let mut result = Ok(());
        submit_one_shot(&self.pool, |cmd| {
            // SAFETY: cmd is recording and the image outlives the blocking
            // submit.
            result = unsafe {
                record_layout_transition(
                    cmd,
                    image.raw_image(),
                    image.format(),
                    image.mip_levels(),
                    old,
                    new,
                )
            };
        })?;
        Ok(result?)
    }

    /// Copy `data` into level 0 of `image`, which must be in
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_image(
        &self,
        data: &[u8],
        image: &GpuImage,
    ) -> Result<(), UploadError> {
        let extent = image.extent();
        check_upload_size(
            data.len() as vk::DeviceSize,
            rgba8_len(extent.width, extent.height) as vk::DeviceSize,
        )?;
        let staging = self.staging_buffer(data)?;
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        submit_one_shot(&self.pool, |cmd| {
            // SAFETY: cmd is recording; the image is in TRANSFER_DST per the
            // documented contract and both resources outlive the submit.
            unsafe {
                cmd.copy_buffer_to_image(
                    staging.raw_buffer(),
                    image.raw_image(),
                    &[region],
                )
            };
        })?;
        Ok(())
    }

    /// Fill levels `1..` of `image` from level 0 and leave every level in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// All levels must be in `TRANSFER_DST_OPTIMAL`.
    pub fn generate_mipmaps(&self, image: &GpuImage) -> Result<(), UploadError> {
        if image.mip_levels() > 1 && !self.device.supports_linear_blit(image.format())
        {
            return Err(MipmapError::UnsupportedBlit(image.format()).into());
        }
        let extent = image.extent();
        submit_one_shot(&self.pool, |cmd| {
            // SAFETY: cmd is recording, linear blit support was checked and
            // the image outlives the blocking submit.
            unsafe {
                record_mipmap_generation(
                    cmd,
                    image.raw_image(),
                    extent.width,
                    extent.height,
                    image.mip_levels(),
                )
            };
        })?;
        Ok(())
    }

    /// A sampled, fully mipmapped `R8G8B8A8_SRGB` texture from RGBA8
    /// pixels.
    pub fn create_texture(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        name: Option<&str>,
    ) -> Result<GpuImage, CreateTextureError> {
        let expected = rgba8_len(width, height);
        if pixels.len() != expected {
            return Err(CreateTextureError::PixelCount {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        let desc = ImageDesc::color_2d(
            width,
            height,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
        )
        .with_mip_levels(mip_level_count(width, height));
        let image = self.create_image(desc, name)?;

        self.transition_image_layout(
            &image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        self.copy_buffer_to_image(pixels, &image)?;
        self.generate_mipmaps(&image)?;
        tracing::debug!(
            "Uploaded {width}x{height} texture with {} mip levels",
            image.mip_levels()
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_uploads_are_rejected() {
        assert!(matches!(check_upload_size(0, 64), Err(UploadError::Empty)));
    }

    #[test]
    fn oversized_uploads_are_rejected() {
        assert!(matches!(
            check_upload_size(65, 64),
            Err(UploadError::TooLarge {
                len: 65,
                capacity: 64
            })
        ));
        assert!(check_upload_size(64, 64).is_ok());
        assert!(check_upload_size(1, 64).is_ok());
    }

    #[test]
    fn rgba8_length_is_four_bytes_per_pixel() {
        assert_eq!(rgba8_len(1, 1), 4);
        assert_eq!(rgba8_len(256, 128), 131_072);
        assert_eq!(rgba8_len(0, 10), 0);
    }
}
