//! Window surfaces and the capability snapshot used to build a
//! presentation chain.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::Instance;

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Couldn't get display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Couldn't get window handle: {0}")]
    InvalidWindowHandle(raw_window_handle::HandleError),
    #[error("Vulkan surface creation failed: {0}")]
    VulkanError(vk::Result),
    #[error(
        "Parent instance did not have the surface extensions \
         for this platform loaded"
    )]
    MissingExtension,
}

#[derive(Debug, Error)]
pub enum SurfaceSupportError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error checking surface support: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error querying surface: {0}")]
    Vulkan(vk::Result),
}

/// Capability snapshot of a surface for one adapter.
///
/// Never cached: the chain queries a fresh one on every build because the
/// numbers change when the window is resized or moved between displays.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// At least one format and one present mode.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Something an adapter can present to.
///
/// Lets adapter selection work with any `Surface<T>` without being generic
/// over the window type.
pub trait PresentTarget {
    fn instance(&self) -> &Arc<Instance>;

    fn raw_surface(&self) -> vk::SurfaceKHR;

    /// # Safety
    /// `physical_device` must be derived from the same instance as the
    /// target.
    unsafe fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool, SurfaceSupportError>;

    /// # Safety
    /// `physical_device` must be derived from the same instance as the
    /// target.
    unsafe fn query_support(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<SurfaceSupport, SurfaceQueryError>;
}

/// An owned `VkSurfaceKHR` tied to the window it was created for.
///
/// Holds the window source alive for as long as the surface exists.
pub struct Surface<T: HasWindowHandle + HasDisplayHandle> {
    parent_instance: Arc<Instance>,
    handle: vk::SurfaceKHR,
    _surface_source: Arc<T>,
}

impl<T: HasWindowHandle + HasDisplayHandle> std::fmt::Debug for Surface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("parent", &self.parent_instance)
            .finish_non_exhaustive()
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Surface<T> {
    /// Create a surface for `source`.
    ///
    /// # Safety
    /// The surface must be dropped when the platform invalidates the
    /// window (winit's `suspended`), and no in-flight GPU work may
    /// reference objects derived from it when it is dropped.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        source: Arc<T>,
    ) -> Result<Self, CreateSurfaceError> {
        // SAFETY: the Arcs held below keep both the instance and the source
        // alive for the surface's lifetime.
        let handle = unsafe { instance.create_raw_surface(&*source) }?;
        Ok(Self {
            parent_instance: Arc::clone(instance),
            handle,
            _surface_source: source,
        })
    }

    pub fn get_parent(&self) -> &Arc<Instance> {
        &self.parent_instance
    }

    pub fn raw_handle(&self) -> vk::SurfaceKHR {
        self.handle
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> PresentTarget for Surface<T> {
    fn instance(&self) -> &Arc<Instance> {
        &self.parent_instance
    }

    fn raw_surface(&self) -> vk::SurfaceKHR {
        self.handle
    }

    unsafe fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool, SurfaceSupportError> {
        // SAFETY: caller guarantees physical_device provenance; the surface
        // handle is live.
        unsafe {
            self.parent_instance.get_raw_physical_device_surface_support(
                physical_device,
                queue_family_index,
                self.handle,
            )
        }
    }

    unsafe fn query_support(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<SurfaceSupport, SurfaceQueryError> {
        let instance = &self.parent_instance;
        // SAFETY: caller guarantees physical_device provenance; the surface
        // handle is live.
        unsafe {
            Ok(SurfaceSupport {
                capabilities: instance
                    .get_surface_capabilities(physical_device, self.handle)?,
                formats: instance
                    .get_surface_formats(physical_device, self.handle)?,
                present_modes: instance
                    .get_surface_present_modes(physical_device, self.handle)?,
            })
        }
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Drop for Surface<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.handle);
        // SAFETY: children (the chain) hold an Arc to this surface, so none
        // remain when drop runs.
        let _ = unsafe { self.parent_instance.destroy_raw_surface(self.handle) }
            .inspect_err(|e| {
                tracing::error!(
                    "Error while dropping surface {:?}: {e}",
                    self.handle
                )
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn support(formats: usize, modes: usize) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default(); formats],
            present_modes: vec![vk::PresentModeKHR::FIFO; modes],
        }
    }

    #[test]
    fn adequacy_needs_both_formats_and_present_modes() {
        assert!(support(1, 1).is_adequate());
        assert!(!support(0, 2).is_adequate());
        assert!(!support(3, 0).is_adequate());
    }
}
