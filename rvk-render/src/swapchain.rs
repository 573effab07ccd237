//! The presentation chain: swapchain images for one surface, and their
//! rebuild when the surface changes underneath us.
//!
//! A chain moves between three states. It starts `Uninitialized`, becomes
//! `Built` once a swapchain with non-zero extent exists, and drops to
//! `Stale` whenever acquire or present report out-of-date or suboptimal, or
//! the host signals a resize. A stale chain is only ever fixed by
//! [`PresentationChain::rebuild`]; staleness is never an error.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::device::{Device, QueueFamilyIndices};
use crate::image::ImageView;
use crate::surface::{PresentTarget, Surface, SurfaceQueryError, SurfaceSupport};
use crate::sync::Semaphore;

#[derive(Debug, Error)]
pub enum PresentationError {
    #[error(
        "Mismatched parameters to PresentationChain::new. Device and \
         surface must be derived from the same instance"
    )]
    MismatchedParams,

    #[error("Swapchain support was not enabled on this device")]
    SwapchainNotEnabled,

    #[error("Surface reports no formats or no present modes")]
    InadequateSurface,

    #[error("Failed while querying surface support details: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("Vulkan error waiting for the device before a rebuild: {0}")]
    WaitIdle(vk::Result),

    #[error("Vulkan error creating swapchain: {0}")]
    Create(vk::Result),

    #[error("Vulkan error fetching swapchain images: {0}")]
    GetImages(vk::Result),

    #[error("Vulkan error creating swapchain image view: {0}")]
    CreateImageView(vk::Result),

    #[error("Vulkan error acquiring swapchain image: {0}")]
    Acquire(vk::Result),

    #[error("Vulkan error presenting: {0}")]
    Present(vk::Result),
}

/// Preferred surface format, colour space and present mode.
///
/// Each falls back when the surface does not offer it: the format pair to
/// the first reported format, the present mode to FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfacePreferences {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SurfacePreferences {
    fn default() -> Self {
        Self {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_mode: vk::PresentModeKHR::MAILBOX,
        }
    }
}

impl SurfacePreferences {
    /// Default preferences, with FIFO when `vsync` is on.
    pub fn with_vsync(vsync: bool) -> Self {
        let mut prefs = Self::default();
        if vsync {
            prefs.present_mode = vk::PresentModeKHR::FIFO;
        }
        prefs
    }
}

pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferences: &SurfacePreferences,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == preferences.format
                && f.color_space == preferences.color_space
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferences: &SurfacePreferences,
) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|m| *m == preferences.present_mode)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, or `framebuffer_size` clamped to the
/// surface limits when the surface leaves it to us (`u32::MAX`).
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_size: vk::Extent2D,
) -> vk::Extent2D {
    let current = capabilities.current_extent;
    if current.width != u32::MAX && current.height != u32::MAX {
        return current;
    }
    // Not `clamp`: a driver reporting min > max must not panic us. The
    // maximum wins in that case.
    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    vk::Extent2D {
        width: framebuffer_size.width.max(min.width).min(max.width),
        height: framebuffer_size.height.max(min.height).min(max.height),
    }
}

/// One more than the minimum, capped at the maximum when there is one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }
    image_count
}

pub fn choose_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|mode| capabilities.supported_composite_alpha.contains(*mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT)
}

/// Exclusive when one family does both, concurrent across both otherwise.
pub fn choose_sharing(
    families: QueueFamilyIndices,
) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

pub fn has_area(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Uninitialized,
    Built,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    Rebuilt,
    /// The drawable area is zero; the chain was left as it was.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Stale,
}

fn classify_acquire(
    result: Result<(u32, bool), vk::Result>,
) -> Result<AcquireOutcome, vk::Result> {
    match result {
        Ok((index, suboptimal)) => {
            Ok(AcquireOutcome::Acquired { index, suboptimal })
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
        Err(e) => Err(e),
    }
}

fn classify_present(
    result: Result<bool, vk::Result>,
) -> Result<PresentOutcome, vk::Result> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            Ok(PresentOutcome::Stale)
        }
        Err(e) => Err(e),
    }
}

/// Everything picked from one [`SurfaceSupport`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChainParams {
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    image_count: u32,
    composite_alpha: vk::CompositeAlphaFlagsKHR,
    pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl ChainParams {
    fn choose(
        support: &SurfaceSupport,
        preferences: &SurfacePreferences,
        framebuffer_size: vk::Extent2D,
    ) -> Result<Self, PresentationError> {
        if !support.is_adequate() {
            return Err(PresentationError::InadequateSurface);
        }
        let surface_format =
            choose_surface_format(&support.formats, preferences)
                .ok_or(PresentationError::InadequateSurface)?;
        Ok(Self {
            surface_format,
            present_mode: choose_present_mode(
                &support.present_modes,
                preferences,
            ),
            extent: choose_extent(&support.capabilities, framebuffer_size),
            image_count: choose_image_count(&support.capabilities),
            composite_alpha: choose_composite_alpha(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        })
    }
}

/// A swapchain for one surface together with a view per image.
///
/// The chain does not own its images (the swapchain does) but owns the
/// views. Views are the only objects whose count depends on the image
/// count, so they are the only thing rebuilt alongside the swapchain.
pub struct PresentationChain<T: HasDisplayHandle + HasWindowHandle> {
    device: Arc<Device>,
    surface: Arc<Surface<T>>,
    preferences: SurfacePreferences,
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<ImageView>,
    state: ChainState,
    generation: u64,
}

impl<T: HasDisplayHandle + HasWindowHandle> std::fmt::Debug
    for PresentationChain<T>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationChain")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("surface_format", &self.surface_format)
            .field("present_mode", &self.present_mode)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> PresentationChain<T> {
    /// Create a chain for `surface` and build it at `framebuffer_size`.
    ///
    /// A zero-sized framebuffer is not an error: the chain comes back
    /// `Uninitialized` and is built by the first successful
    /// [`rebuild`](Self::rebuild).
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        preferences: SurfacePreferences,
        framebuffer_size: vk::Extent2D,
    ) -> Result<Self, PresentationError> {
        if !device.has_swapchain_support() {
            return Err(PresentationError::SwapchainNotEnabled);
        }
        if !Arc::ptr_eq(surface.get_parent(), device.parent()) {
            return Err(PresentationError::MismatchedParams);
        }

        let mut chain = Self {
            device: Arc::clone(device),
            surface: Arc::clone(surface),
            preferences,
            handle: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            state: ChainState::Uninitialized,
            generation: 0,
        };
        chain.rebuild(framebuffer_size)?;
        Ok(chain)
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn is_stale(&self) -> bool {
        self.state != ChainState::Built
    }

    /// Flag the chain for rebuild. A no-op before the first build.
    pub fn mark_stale(&mut self) {
        if self.state == ChainState::Built {
            tracing::debug!("Presentation chain {:?} marked stale", self.handle);
            self.state = ChainState::Stale;
        }
    }

    /// Replace the swapchain with one matching the surface as it is now.
    ///
    /// Waits for the device to go idle, so nothing in flight can still
    /// reference the old images. While either `framebuffer_size` or the
    /// extent the surface insists on has zero area, nothing is created:
    /// the old swapchain stays alive, a built chain is marked stale and
    /// [`RebuildOutcome::Deferred`] is returned. Callers retry once the
    /// window has an area again.
    pub fn rebuild(
        &mut self,
        framebuffer_size: vk::Extent2D,
    ) -> Result<RebuildOutcome, PresentationError> {
        if !has_area(framebuffer_size) {
            tracing::debug!("Deferring chain rebuild: framebuffer has zero area");
            self.mark_stale();
            return Ok(RebuildOutcome::Deferred);
        }

        let physical_device = self.device.physical_device();
        // SAFETY: the surface and the device share an instance (checked in
        // new), so the physical device belongs to the surface's instance.
        let support = unsafe { self.surface.query_support(physical_device) }?;
        let params =
            ChainParams::choose(&support, &self.preferences, framebuffer_size)?;
        if !has_area(params.extent) {
            tracing::debug!("Deferring chain rebuild: surface extent is zero");
            self.mark_stale();
            return Ok(RebuildOutcome::Deferred);
        }

        self.device.wait_idle().map_err(PresentationError::WaitIdle)?;
        self.views.clear();
        self.images.clear();
        // Not usable again until new images and views exist.
        self.state = ChainState::Stale;

        let (sharing_mode, family_indices) =
            choose_sharing(self.device.queue_families());
        let old_handle = self.handle;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.raw_handle())
            .min_image_count(params.image_count)
            .image_format(params.surface_format.format)
            .image_color_space(params.surface_format.color_space)
            .image_extent(params.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(params.pre_transform)
            .composite_alpha(params.composite_alpha)
            .present_mode(params.present_mode)
            .clipped(true)
            .old_swapchain(old_handle);

        // SAFETY: every handle in create_info comes from this device or its
        // instance; the old swapchain's views are gone and the device is
        // idle.
        let new_handle = unsafe { self.device.create_raw_swapchain(&create_info) }
            .map_err(PresentationError::Create)?;
        if old_handle != vk::SwapchainKHR::null() {
            // SAFETY: the old chain is retired, idle and has no views left.
            unsafe { self.device.destroy_raw_swapchain(old_handle) };
        }
        self.handle = new_handle;
        self.generation += 1;

        let chain_name = format!("presentation chain {}", self.generation);
        // SAFETY: new_handle was just created from this device.
        unsafe { self.device.name_or_warn(new_handle, Some(&chain_name)) };

        // SAFETY: new_handle is live.
        let images = unsafe { self.device.get_raw_swapchain_images(new_handle) }
            .map_err(PresentationError::GetImages)?;
        let mut views = Vec::with_capacity(images.len());
        for (index, image) in images.iter().copied().enumerate() {
            // SAFETY: image belongs to new_handle, which outlives the views
            // (they are dropped first in rebuild and in Drop).
            let view = unsafe {
                self.device.name_or_warn(
                    image,
                    Some(&format!("{chain_name} image {index}")),
                );
                ImageView::new(
                    &self.device,
                    image,
                    params.surface_format.format,
                    vk::ImageAspectFlags::COLOR,
                    1,
                    Some(&format!("{chain_name} view {index}")),
                )
            }
            .map_err(PresentationError::CreateImageView)?;
            views.push(view);
        }

        self.images = images;
        self.views = views;
        self.surface_format = params.surface_format;
        self.present_mode = params.present_mode;
        self.extent = params.extent;
        self.state = ChainState::Built;
        tracing::info!(
            "Built presentation chain {}: {}x{}, {} images, {:?}, {:?}",
            self.generation,
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.surface_format.format,
            self.present_mode,
        );
        Ok(RebuildOutcome::Rebuilt)
    }

    /// Acquire the next image, signalling `image_acquired` when it is ready.
    ///
    /// A suboptimal image is still returned, and the chain is marked stale
    /// so it is rebuilt after this frame presents. Out-of-date, or a chain
    /// that is not built, returns [`AcquireOutcome::Stale`] without
    /// touching the semaphore.
    pub fn acquire_next_image(
        &mut self,
        image_acquired: &Semaphore,
    ) -> Result<AcquireOutcome, PresentationError> {
        if self.state == ChainState::Uninitialized
            || self.handle == vk::SwapchainKHR::null()
            || self.views.is_empty()
        {
            return Ok(AcquireOutcome::Stale);
        }
        // SAFETY: the swapchain is live. The semaphore is unsignaled: the
        // frame loop only reuses it after the fence of its last frame.
        let result = unsafe {
            self.device.acquire_next_swapchain_image(
                self.handle,
                u64::MAX,
                image_acquired.raw_semaphore(),
            )
        };
        let outcome = classify_acquire(result).map_err(PresentationError::Acquire)?;
        match outcome {
            AcquireOutcome::Acquired { suboptimal: true, .. } => self.mark_stale(),
            AcquireOutcome::Stale => {
                self.state = ChainState::Stale;
            }
            AcquireOutcome::Acquired { .. } => {}
        }
        Ok(outcome)
    }

    /// Queue image `index` for presentation once `render_complete` signals.
    pub fn present(
        &mut self,
        render_complete: &Semaphore,
        index: u32,
    ) -> Result<PresentOutcome, PresentationError> {
        let wait_semaphores = [render_complete.raw_semaphore()];
        let swapchains = [self.handle];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // SAFETY: the image was acquired from this chain and the submit that
        // signals render_complete leaves it in PRESENT_SRC_KHR.
        let result = unsafe { self.device.queue_present(&present_info) };
        let outcome = classify_present(result).map_err(PresentationError::Present)?;
        if outcome == PresentOutcome::Stale {
            self.mark_stale();
        }
        Ok(outcome)
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[ImageView] {
        &self.views
    }

    pub fn surface(&self) -> &Arc<Surface<T>> {
        &self.surface
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for PresentationChain<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping presentation chain {:?}", self.handle);
        // Callers wait for the device to go idle before dropping the chain.
        self.views.clear();
        if self.handle != vk::SwapchainKHR::null() {
            // SAFETY: the views are gone and nothing in flight references
            // the images.
            unsafe { self.device.destroy_raw_swapchain(self.handle) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable_extent_caps() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn undefined_current_extent_uses_framebuffer_size() {
        let chosen = choose_extent(
            &variable_extent_caps(),
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!(
            chosen,
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
    }

    #[test]
    fn framebuffer_size_is_clamped_to_limits() {
        let chosen = choose_extent(
            &variable_extent_caps(),
            vk::Extent2D {
                width: 8000,
                height: 0,
            },
        );
        assert_eq!(chosen.width, 4096);
        assert_eq!(chosen.height, 1);
    }

    #[test]
    fn defined_current_extent_wins() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let chosen = choose_extent(
            &caps,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!(chosen.width, 800);
        assert_eq!(chosen.height, 600);
    }

    #[test]
    fn undefined_height_alone_still_uses_framebuffer_size() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: u32::MAX,
            },
            ..variable_extent_caps()
        };
        let chosen = choose_extent(
            &caps,
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!((chosen.width, chosen.height), (1280, 720));
    }

    #[test]
    fn inverted_limits_do_not_panic() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_extent: vk::Extent2D {
                width: 512,
                height: 512,
            },
            max_image_extent: vk::Extent2D {
                width: 256,
                height: 1024,
            },
            ..variable_extent_caps()
        };
        let chosen = choose_extent(
            &caps,
            vk::Extent2D {
                width: 100,
                height: 100,
            },
        );
        assert_eq!((chosen.width, chosen.height), (256, 512));
    }

    #[test]
    fn area_needs_both_dimensions() {
        assert!(has_area(vk::Extent2D {
            width: 1,
            height: 1
        }));
        assert!(!has_area(vk::Extent2D {
            width: 640,
            height: 0
        }));
        assert!(!has_area(vk::Extent2D::default()));
    }

    #[test]
    fn image_count_is_one_above_minimum_when_unbounded() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn image_count_respects_maximum() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn preferred_format_pair_is_chosen() {
        let prefs = SurfacePreferences::default();
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb], &prefs), Some(srgb));
    }

    #[test]
    fn format_falls_back_to_first_reported() {
        let prefs = SurfacePreferences::default();
        let first = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        // Right format, wrong colour space does not count.
        let near_miss = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
        };
        assert_eq!(
            choose_surface_format(&[first, near_miss], &prefs),
            Some(first)
        );
        assert_eq!(choose_surface_format(&[], &prefs), None);
    }

    #[test]
    fn present_mode_prefers_mailbox_then_fifo() {
        let prefs = SurfacePreferences::default();
        assert_eq!(
            choose_present_mode(
                &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                &prefs
            ),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE], &prefs),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn vsync_forces_fifo() {
        let prefs = SurfacePreferences::with_vsync(true);
        assert_eq!(
            choose_present_mode(
                &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
                &prefs
            ),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn composite_alpha_prefers_opaque() {
        let caps = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
                | vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        };
        assert_eq!(
            choose_composite_alpha(&caps),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
        let caps = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::INHERIT,
            ..Default::default()
        };
        assert_eq!(
            choose_composite_alpha(&caps),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }

    #[test]
    fn sharing_mode_follows_queue_families() {
        let (mode, indices) = choose_sharing(QueueFamilyIndices {
            graphics: 0,
            present: 0,
        });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(indices.is_empty());

        let (mode, indices) = choose_sharing(QueueFamilyIndices {
            graphics: 0,
            present: 2,
        });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn inadequate_support_is_rejected() {
        let support = SurfaceSupport {
            capabilities: variable_extent_caps(),
            formats: Vec::new(),
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(matches!(
            ChainParams::choose(
                &support,
                &SurfacePreferences::default(),
                vk::Extent2D {
                    width: 10,
                    height: 10
                }
            ),
            Err(PresentationError::InadequateSurface)
        ));
    }

    #[test]
    fn only_out_of_date_and_suboptimal_are_stale() {
        assert_eq!(
            classify_acquire(Ok((2, false))),
            Ok(AcquireOutcome::Acquired {
                index: 2,
                suboptimal: false
            })
        );
        assert_eq!(
            classify_acquire(Ok((1, true))),
            Ok(AcquireOutcome::Acquired {
                index: 1,
                suboptimal: true
            })
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(AcquireOutcome::Stale)
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );

        assert_eq!(classify_present(Ok(false)), Ok(PresentOutcome::Presented));
        assert_eq!(classify_present(Ok(true)), Ok(PresentOutcome::Stale));
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(PresentOutcome::Stale)
        );
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR)
        );
    }
}
