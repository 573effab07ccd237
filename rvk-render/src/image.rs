//! Images, image views, layout transitions and mip chains.
//!
//! The barrier tables here are plain functions of the old and new layout
//! so they can be checked without a device. Recording goes through
//! [`CommandBuffer`], which the resource allocator and the frame recorder
//! both hand in.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use thiserror::Error;

use crate::command::CommandBuffer;
use crate::device::{Device, MemoryAllocationError};

#[derive(Debug, Error)]
pub enum CreateImageError {
    #[error("Image extent must be non-zero, got {0}x{1}")]
    ZeroExtent(u32, u32),
    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),
    #[error("Failed to allocate image memory: {0}")]
    Memory(#[from] MemoryAllocationError),
    #[error("Vulkan error binding image memory: {0}")]
    BindMemory(vk::Result),
    #[error("Vulkan error creating image view: {0}")]
    CreateView(vk::Result),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LayoutTransitionError {
    #[error("Unsupported layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MipmapError {
    #[error("Format {0:?} does not support linear-filtered blits")]
    UnsupportedBlit(vk::Format),
}

// ---------------------------------------------------------------------------
// Mip chain arithmetic
// ---------------------------------------------------------------------------

/// Levels in a full chain down to 1x1: `floor(log2(max(w, h))) + 1`.
///
/// A zero-sized image still has its one base level.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height);
    if largest == 0 {
        1
    } else {
        u32::BITS - largest.leading_zeros()
    }
}

/// Size of one dimension at `level`, never below 1.
pub fn mip_extent(base: u32, level: u32) -> u32 {
    base.checked_shr(level).unwrap_or(0).max(1)
}

/// One step of mip generation: blit `src_level` into `src_level + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipBlit {
    pub src_level: u32,
    pub src_extent: (u32, u32),
    pub dst_extent: (u32, u32),
}

impl MipBlit {
    pub fn dst_level(&self) -> u32 {
        self.src_level + 1
    }

    fn region(&self, aspect: vk::ImageAspectFlags) -> vk::ImageBlit {
        let corner = |(w, h): (u32, u32)| vk::Offset3D {
            x: w as i32,
            y: h as i32,
            z: 1,
        };
        let layer = |level| vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: level,
            base_array_layer: 0,
            layer_count: 1,
        };
        vk::ImageBlit {
            src_subresource: layer(self.src_level),
            src_offsets: [vk::Offset3D::default(), corner(self.src_extent)],
            dst_subresource: layer(self.dst_level()),
            dst_offsets: [vk::Offset3D::default(), corner(self.dst_extent)],
        }
    }
}

/// The blits that fill levels `1..levels` from level 0.
pub fn mip_blit_plan(width: u32, height: u32, levels: u32) -> Vec<MipBlit> {
    (1..levels)
        .map(|dst| MipBlit {
            src_level: dst - 1,
            src_extent: (mip_extent(width, dst - 1), mip_extent(height, dst - 1)),
            dst_extent: (mip_extent(width, dst), mip_extent(height, dst)),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Layout transitions
// ---------------------------------------------------------------------------

/// Stage and access scopes on both sides of a layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// Barrier scopes for the transitions the upload path performs.
///
/// Anything outside the table is rejected rather than guessed at.
pub fn transition_barrier_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks, LayoutTransitionError> {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_stage: S::TOP_OF_PIPE,
            src_access: A::NONE,
            dst_stage: S::TRANSFER,
            dst_access: A::TRANSFER_WRITE,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            TransitionMasks {
                src_stage: S::TRANSFER,
                src_access: A::TRANSFER_WRITE,
                dst_stage: S::FRAGMENT_SHADER,
                dst_access: A::SHADER_READ,
            }
        }
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => TransitionMasks {
            src_stage: S::TOP_OF_PIPE,
            src_access: A::NONE,
            dst_stage: S::EARLY_FRAGMENT_TESTS,
            dst_access: A::DEPTH_STENCIL_ATTACHMENT_READ
                | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        },
        _ => {
            return Err(LayoutTransitionError::UnsupportedTransition {
                old,
                new,
            });
        }
    };
    Ok(masks)
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
    )
}

/// Aspect a barrier into `new_layout` must name for `format`.
pub fn transition_aspect(
    format: vk::Format,
    new_layout: vk::ImageLayout,
) -> vk::ImageAspectFlags {
    if new_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        if has_stencil_component(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub(crate) fn level_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    levels: std::ops::Range<u32>,
    (old, new): (vk::ImageLayout, vk::ImageLayout),
    masks: TransitionMasks,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(masks.src_stage)
        .src_access_mask(masks.src_access)
        .dst_stage_mask(masks.dst_stage)
        .dst_access_mask(masks.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: levels.start,
            level_count: levels.end - levels.start,
            base_array_layer: 0,
            layer_count: 1,
        })
}

/// Record a transition of all `mip_levels` of `image`.
///
/// The table is checked before anything is recorded, so an unsupported
/// pair leaves the command buffer untouched.
///
/// # Safety
/// `cmd` must be recording and `image` must currently be in `old` (or
/// `old` is `UNDEFINED`).
pub unsafe fn record_layout_transition(
    cmd: &mut CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<(), LayoutTransitionError> {
    let masks = transition_barrier_masks(old, new)?;
    let barrier = level_barrier(
        image,
        transition_aspect(format, new),
        0..mip_levels,
        (old, new),
        masks,
    );
    let dependency = vk::DependencyInfo::default()
        .image_memory_barriers(std::slice::from_ref(&barrier));
    // SAFETY: forwarded caller contract.
    unsafe { cmd.pipeline_barrier2(&dependency) };
    Ok(())
}

/// Record blits that fill every level below 0 and leave the whole chain
/// in `SHADER_READ_ONLY_OPTIMAL`.
///
/// Expects every level in `TRANSFER_DST_OPTIMAL` with level 0 holding the
/// base image. With a single level this is just the final transition.
///
/// # Safety
/// `cmd` must be recording; the caller has checked the format supports
/// linear-filtered blits.
pub unsafe fn record_mipmap_generation(
    cmd: &mut CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    let aspect = vk::ImageAspectFlags::COLOR;
    let to_src = TransitionMasks {
        src_stage: S::TRANSFER,
        src_access: A::TRANSFER_WRITE,
        dst_stage: S::TRANSFER,
        dst_access: A::TRANSFER_READ,
    };
    let src_to_shader = TransitionMasks {
        src_stage: S::TRANSFER,
        src_access: A::TRANSFER_READ,
        dst_stage: S::FRAGMENT_SHADER,
        dst_access: A::SHADER_READ,
    };
    let dst_to_shader = TransitionMasks {
        src_stage: S::TRANSFER,
        src_access: A::TRANSFER_WRITE,
        dst_stage: S::FRAGMENT_SHADER,
        dst_access: A::SHADER_READ,
    };

    let barrier = |cmd: &mut CommandBuffer, level: u32, layouts, masks| {
        let barrier =
            level_barrier(image, aspect, level..level + 1, layouts, masks);
        let dependency = vk::DependencyInfo::default()
            .image_memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: forwarded caller contract.
        unsafe { cmd.pipeline_barrier2(&dependency) };
    };

    for blit in mip_blit_plan(width, height, mip_levels) {
        let src = blit.src_level;
        barrier(cmd, src, (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL), to_src);
        // SAFETY: src is now TRANSFER_SRC and dst is still TRANSFER_DST.
        unsafe { cmd.blit_image_levels(image, blit.region(aspect), vk::Filter::LINEAR) };
        barrier(
            cmd,
            src,
            (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            src_to_shader,
        );
    }
    barrier(
        cmd,
        mip_levels.max(1) - 1,
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
        dst_to_shader,
    );
}

// ---------------------------------------------------------------------------
// Image views
// ---------------------------------------------------------------------------

/// An owned `VkImageView`.
///
/// Does not own the image: the swapchain owns its images, and
/// [`GpuImage`] drops its view before its image.
pub struct ImageView {
    parent: Arc<Device>,
    handle: vk::ImageView,
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ImageView {
    /// 2D view over `mip_levels` levels of `image`.
    ///
    /// # Safety
    /// `image` must be a live image from `device` and must outlive the view.
    pub unsafe fn new(
        device: &Arc<Device>,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        // SAFETY: caller guarantees image validity.
        let handle = unsafe { device.create_raw_image_view(&create_info) }?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.handle
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        tracing::debug!("Dropping image view {:?}", self.handle);
        // SAFETY: owners wait for idle before dropping views.
        unsafe { self.parent.destroy_raw_image_view(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// GpuImage
// ---------------------------------------------------------------------------

/// Parameters for [`GpuImage::new`].
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageDesc {
    /// A single-sampled, optimally tiled, device-local colour image.
    pub fn color_2d(
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }
}

/// An image, the memory it is bound to and a view over all its levels.
pub struct GpuImage {
    parent: Arc<Device>,
    /// Taken in `Drop` before the image is destroyed.
    view: Option<ImageView>,
    handle: vk::Image,
    allocation: Option<Allocation>,
    desc: ImageDesc,
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("handle", &self.handle)
            .field("extent", &(self.desc.width, self.desc.height))
            .field("format", &self.desc.format)
            .field("mip_levels", &self.desc.mip_levels)
            .finish_non_exhaustive()
    }
}

impl GpuImage {
    pub fn new(
        device: &Arc<Device>,
        desc: ImageDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(CreateImageError::ZeroExtent(desc.width, desc.height));
        }
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        // SAFETY: create_info borrows nothing.
        let handle = unsafe { device.create_raw_image(&create_info) }
            .map_err(CreateImageError::CreateImage)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        // SAFETY: handle is live.
        let requirements =
            unsafe { device.get_raw_image_memory_requirements(handle) };
        let allocation = match device.allocate_memory(
            name.unwrap_or("image"),
            requirements,
            desc.memory_properties,
            desc.tiling == vk::ImageTiling::LINEAR,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: handle is unbound and unused.
                unsafe { device.destroy_raw_image(handle) };
                return Err(e.into());
            }
        };

        let release = |allocation| {
            // SAFETY: handle has no views and no pending work.
            unsafe { device.destroy_raw_image(handle) };
            if let Err(e) = device.free_memory(allocation) {
                tracing::error!("Failed to free image memory: {e}");
            }
        };

        // SAFETY: the allocation satisfies the image's requirements.
        if let Err(e) = unsafe {
            device.bind_raw_image_memory(
                handle,
                allocation.memory(),
                allocation.offset(),
            )
        } {
            release(allocation);
            return Err(CreateImageError::BindMemory(e));
        }

        // SAFETY: handle is live and bound; the view is dropped first.
        let view = match unsafe {
            ImageView::new(device, handle, desc.format, desc.aspect, desc.mip_levels, name)
        } {
            Ok(view) => view,
            Err(e) => {
                release(allocation);
                return Err(CreateImageError::CreateView(e));
            }
        };

        Ok(Self {
            parent: Arc::clone(device),
            view: Some(view),
            handle,
            allocation: Some(allocation),
            desc,
        })
    }

    pub fn raw_image(&self) -> vk::Image {
        self.handle
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.view
            .as_ref()
            .map(ImageView::raw_image_view)
            .unwrap_or_default()
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.width,
            height: self.desc.height,
        }
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        self.view = None;
        tracing::debug!("Dropping image {:?}", self.handle);
        // SAFETY: the view is gone and owners wait for idle before dropping.
        unsafe { self.parent.destroy_raw_image(self.handle) };
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free image memory: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[test]
    fn mip_count_follows_largest_dimension() {
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(512, 256), 10);
        assert_eq!(mip_level_count(300, 20), 9);
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn mip_extents_halve_and_clamp_at_one() {
        assert_eq!(mip_extent(256, 0), 256);
        assert_eq!(mip_extent(256, 1), 128);
        assert_eq!(mip_extent(5, 1), 2);
        assert_eq!(mip_extent(5, 2), 1);
        assert_eq!(mip_extent(5, 7), 1);
        assert_eq!(mip_extent(1, 40), 1);
    }

    #[test]
    fn blit_plan_walks_down_the_chain() {
        let plan = mip_blit_plan(4, 2, mip_level_count(4, 2));
        assert_eq!(
            plan,
            vec![
                MipBlit {
                    src_level: 0,
                    src_extent: (4, 2),
                    dst_extent: (2, 1)
                },
                MipBlit {
                    src_level: 1,
                    src_extent: (2, 1),
                    dst_extent: (1, 1)
                },
            ]
        );
        assert!(mip_blit_plan(64, 64, 1).is_empty());
    }

    #[test]
    fn blit_region_spans_both_levels() {
        let blit = mip_blit_plan(8, 8, 2)[0];
        let region = blit.region(vk::ImageAspectFlags::COLOR);
        assert_eq!(region.src_subresource.mip_level, 0);
        assert_eq!(region.dst_subresource.mip_level, 1);
        assert_eq!(region.src_offsets[1], vk::Offset3D { x: 8, y: 8, z: 1 });
        assert_eq!(region.dst_offsets[1], vk::Offset3D { x: 4, y: 4, z: 1 });
    }

    #[test]
    fn upload_transitions_use_transfer_then_fragment_scopes() {
        let to_dst =
            transition_barrier_masks(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL)
                .unwrap();
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(to_dst.src_access, vk::AccessFlags2::NONE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(to_dst.dst_access, vk::AccessFlags2::TRANSFER_WRITE);

        let to_read = transition_barrier_masks(
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!(to_read.dst_access, vk::AccessFlags2::SHADER_READ);
    }

    #[test]
    fn depth_transition_targets_early_fragment_tests() {
        let masks = transition_barrier_masks(
            L::UNDEFINED,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(
            masks.dst_stage,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
        );
        assert!(masks.dst_access.contains(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
        ));
    }

    #[test]
    fn unlisted_transitions_are_rejected() {
        for (old, new) in [
            (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
            (L::UNDEFINED, L::PRESENT_SRC_KHR),
            (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
        ] {
            assert_eq!(
                transition_barrier_masks(old, new),
                Err(LayoutTransitionError::UnsupportedTransition { old, new })
            );
        }
    }

    #[test]
    fn depth_aspect_includes_stencil_only_when_present() {
        let depth = L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        assert_eq!(
            transition_aspect(vk::Format::D32_SFLOAT, depth),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            transition_aspect(vk::Format::D24_UNORM_S8_UINT, depth),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            transition_aspect(vk::Format::R8G8B8A8_SRGB, L::TRANSFER_DST_OPTIMAL),
            vk::ImageAspectFlags::COLOR
        );
    }
}
