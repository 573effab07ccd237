//! Vulkan instance creation and physical device queries.
//!
//! [`Instance`] wraps an `ash::Instance` together with the entry loader,
//! the optional validation messenger and the optional surface loader.
//! Everything the device selection logic needs to know about an adapter
//! is queried through it.

use std::ffi::{CStr, CString};
use std::fmt::Debug;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::log::{VulkanLogLevel, messenger_create_info};
use crate::surface::{
    CreateSurfaceError, SurfaceQueryError, SurfaceSupportError,
};

pub(crate) const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A packed Vulkan API version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(0, major, minor, patch))
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// Whether this version is `major.minor` or newer, ignoring patch.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major(), self.minor()) >= (major, minor)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// Optional instance-level extensions for [`Instance::new`].
///
/// Set `surface` to request the platform surface extensions. A display
/// handle source must be passed as well so `ash-window` can name them.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceExtensions {
    pub surface: bool,
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error("Couldn't get display handle from passed value: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("Missing mandatory instance extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("Unknown Vulkan error {0}")]
    UnknownVulkan(vk::Result),
    #[error("Application name contains an interior nul byte")]
    InvalidAppName,
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::UnknownVulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, unknown Vulkan error: {0}")]
    UnknownVulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum DestroyRawSurfaceError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
}

/// Extensions enabled opportunistically when the loader reports them.
///
/// Portability enumeration lets layered implementations (MoltenVK and
/// friends) show up in enumeration at all; properties2 is a prerequisite
/// of `VK_KHR_portability_subset` on 1.0 instances.
fn optional_instance_extensions(
    available: &[&CStr],
    api_version: VkVersion,
) -> (Vec<&'static CStr>, vk::InstanceCreateFlags) {
    let mut exts = Vec::new();
    let mut flags = vk::InstanceCreateFlags::empty();

    if available.contains(&ash::khr::portability_enumeration::NAME) {
        exts.push(ash::khr::portability_enumeration::NAME);
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }
    if !api_version.at_least(1, 1)
        && available.contains(&ash::khr::get_physical_device_properties2::NAME)
    {
        exts.push(ash::khr::get_physical_device_properties2::NAME);
    }
    (exts, flags)
}

/// The root Vulkan object.
///
/// All objects derived from an instance hold an `Arc<Instance>`.
/// Construct via [`Instance::new`], which is `unsafe` because it loads the
/// Vulkan shared library at runtime.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: Option<ash::khr::surface::Instance>,
    ver: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.ver)
            .field("validation", &self.debug_messenger.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((messenger, debug_utils)) = self.debug_messenger.take() {
            // SAFETY: the messenger was created from this instance and this
            // is its last use.
            unsafe { debug_utils.destroy_debug_utils_messenger(messenger, None) };
        }
        // SAFETY: every derived object holds an Arc<Instance>, so none are
        // alive by the time we get here.
        unsafe { self.handle.destroy_instance(None) };
    }
}

impl Instance {
    /// Load Vulkan and create an instance at the highest version the loader
    /// supports.
    ///
    /// `diagnostics` enables the Khronos validation layer and a messenger
    /// that forwards messages at or above the given level into `tracing`.
    /// When the layer or `VK_EXT_debug_utils` is missing, the instance is
    /// created without them and a warning is logged.
    ///
    /// # Safety
    /// This loads the Vulkan loader with `libloading`, which runs arbitrary
    /// initialisation code from that library.
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        diagnostics: Option<VulkanLogLevel>,
        display_handle_source: Option<&impl HasDisplayHandle>,
        enabled_exts: InstanceExtensions,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name = CString::new(app_name.as_ref())
            .map_err(|_| Error::InvalidAppName)?;

        // SAFETY: the caller accepts the cost of loading the library. The
        // entry outlives every object created from it because Instance owns
        // it and drops it last.
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        // SAFETY: entry is live and this query has no other preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .ok()
            .flatten()
            .unwrap_or(vk::API_VERSION_1_0);
        let api_version = VkVersion::from_raw(api_version);

        let mut mandatory_exts: Vec<&CStr> = Vec::new();
        let mut surface_ext_loaded = false;
        if let Some(source) = display_handle_source
            && enabled_exts.surface
        {
            surface_ext_loaded = true;
            let platform_exts = ash_window::enumerate_required_extensions(
                source
                    .display_handle()
                    .map_err(Error::InvalidDisplayHandle)?
                    .as_raw(),
            )?;
            mandatory_exts.extend(
                platform_exts
                    .iter()
                    // SAFETY: ash-window documents these as static null
                    // terminated extension names.
                    .map(|&name| unsafe { CStr::from_ptr(name) }),
            );
        }

        // SAFETY: entry is live; None queries the implementation's own
        // extensions.
        let available_exts =
            unsafe { entry.enumerate_instance_extension_properties(None) }?;
        let available_names: Vec<&CStr> = available_exts
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect();

        let missing_exts: Vec<String> = mandatory_exts
            .iter()
            .filter(|ext| !available_names.contains(ext))
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();
        if !missing_exts.is_empty() {
            return Err(Error::MissingExtensions(missing_exts));
        }

        let (portability_exts, create_flags) =
            optional_instance_extensions(&available_names, api_version);
        mandatory_exts.extend(portability_exts);

        let mut enabled_layers: Vec<*const std::ffi::c_char> = Vec::new();
        let mut messenger_info = None;
        if let Some(level) = diagnostics {
            // SAFETY: entry is live; this query has no other preconditions.
            let layer_available = unsafe {
                entry.enumerate_instance_layer_properties()
            }
            .map(|layers| {
                layers.iter().any(|layer| {
                    layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER_NAME)
                })
            })
            .unwrap_or(false);
            let debug_utils_available =
                available_names.contains(&ash::ext::debug_utils::NAME);

            if layer_available && debug_utils_available {
                enabled_layers.push(VALIDATION_LAYER_NAME.as_ptr());
                mandatory_exts.push(ash::ext::debug_utils::NAME);
                messenger_info = Some(messenger_create_info(level));
            } else {
                tracing::warn!(
                    "Diagnostics requested but validation layer \
                     ({layer_available}) or debug utils \
                     ({debug_utils_available}) is unavailable"
                );
            }
        }

        let ext_ptrs: Vec<_> =
            mandatory_exts.iter().map(|ext| ext.as_ptr()).collect();

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"rvk-render")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version.to_raw());

        let mut create_info = vk::InstanceCreateInfo::default()
            .flags(create_flags)
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&enabled_layers);
        // Chaining the messenger info also covers messages emitted during
        // vkCreateInstance itself.
        let mut instance_messenger_info = messenger_info;
        if let Some(info) = instance_messenger_info.as_mut() {
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info and everything it points to lives until the
        // end of this call.
        let handle = unsafe { entry.create_instance(&create_info, None) }?;

        let debug_messenger = messenger_info.map(|info| {
            let debug_utils =
                ash::ext::debug_utils::Instance::new(&entry, &handle);
            (debug_utils, info)
        });
        let debug_messenger = match debug_messenger {
            Some((debug_utils, info)) => {
                // SAFETY: info is a fresh create info with no p_next chain.
                match unsafe {
                    debug_utils.create_debug_utils_messenger(&info, None)
                } {
                    Ok(messenger) => Some((messenger, debug_utils)),
                    Err(e) => {
                        tracing::error!(
                            "Failed to create validation messenger, \
                             continuing without one: {e}"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let surface_instance = surface_ext_loaded
            .then(|| ash::khr::surface::Instance::new(&entry, &handle));

        tracing::info!(
            "Created Vulkan {} instance (validation: {})",
            api_version,
            debug_messenger.is_some()
        );

        Ok(Self {
            entry,
            handle,
            debug_messenger,
            surface_instance,
            ver: api_version,
        })
    }

    /// Whether the validation layer was enabled on this instance.
    pub fn validation_enabled(&self) -> bool {
        self.debug_messenger.is_some()
    }

    /// The Vulkan API version reported by the loader.
    pub fn supported_ver(&self) -> VkVersion {
        self.ver
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }

    /// Destroy a raw `VkSurfaceKHR`.
    ///
    /// # Safety
    /// `surf` must come from this instance and every object derived from it
    /// must already be destroyed.
    pub unsafe fn destroy_raw_surface(
        &self,
        surf: vk::SurfaceKHR,
    ) -> Result<(), DestroyRawSurfaceError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(DestroyRawSurfaceError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance and that nothing uses surf.
        unsafe { surface_instance.destroy_surface(surf, None) };
        Ok(())
    }

    /// Handles to every adapter the loader exposes, in enumeration order.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: the instance is live.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// Core 1.0 features plus whether synchronization2 and dynamic
    /// rendering are supported.
    ///
    /// The 1.3 feature struct is only chained when the adapter reports 1.3;
    /// older adapters get their extension feature structs chained instead.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_features(
        &self,
        physical_device: vk::PhysicalDevice,
        device_version: VkVersion,
    ) -> AdapterFeatures {
        if !self.ver.at_least(1, 1) {
            // SAFETY: caller guarantees provenance.
            let core = unsafe {
                self.handle.get_physical_device_features(physical_device)
            };
            return AdapterFeatures {
                core,
                synchronization2: false,
                dynamic_rendering: false,
            };
        }

        let mut vk13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut sync2 = vk::PhysicalDeviceSynchronization2Features::default();
        let mut dynamic =
            vk::PhysicalDeviceDynamicRenderingFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default();
        if device_version.at_least(1, 3) {
            features2 = features2.push_next(&mut vk13);
        } else {
            features2 = features2.push_next(&mut sync2).push_next(&mut dynamic);
        }
        // SAFETY: caller guarantees provenance; the chain only holds structs
        // that live on this stack frame.
        unsafe {
            self.handle
                .get_physical_device_features2(physical_device, &mut features2)
        };
        let core = features2.features;

        if device_version.at_least(1, 3) {
            AdapterFeatures {
                core,
                synchronization2: vk13.synchronization2 == vk::TRUE,
                dynamic_rendering: vk13.dynamic_rendering == vk::TRUE,
            }
        } else {
            AdapterFeatures {
                core,
                synchronization2: sync2.synchronization2 == vk::TRUE,
                dynamic_rendering: dynamic.dynamic_rendering == vk::TRUE,
            }
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> vk::FormatProperties {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_format_properties(physical_device, format)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn enumerate_raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance and
    /// `create_info` must be valid, including everything it points to.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: caller guarantees provenance and validity.
        unsafe {
            self.handle
                .create_device(physical_device, create_info, None)
        }
    }
}

/// Feature support relevant to adapter selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterFeatures {
    pub core: vk::PhysicalDeviceFeatures,
    pub synchronization2: bool,
    pub dynamic_rendering: bool,
}

// Surface queries
impl Instance {
    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceSupportError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .map_err(SurfaceSupportError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance
                .get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance
                .get_physical_device_surface_formats(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance.get_physical_device_surface_present_modes(
                physical_device,
                surface,
            )
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// Create a raw `VkSurfaceKHR` for a window.
    ///
    /// # Safety
    /// The surface must be destroyed through this instance before `source`
    /// is dropped, and before the platform invalidates the window (a winit
    /// suspend, for example).
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        use CreateSurfaceError as Error;
        if self.surface_instance.is_none() {
            return Err(Error::MissingExtension);
        }
        let display = source
            .display_handle()
            .map_err(Error::InvalidDisplayHandle)?
            .as_raw();
        let window = source
            .window_handle()
            .map_err(Error::InvalidWindowHandle)?
            .as_raw();
        // SAFETY: both handles come from a live source; the caller upholds
        // the lifetime contract above.
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display,
                window,
                None,
            )
        }
        .map_err(Error::VulkanError)
    }
}

// Device-level extension loaders
impl Instance {
    pub fn create_swapchain_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    pub fn create_dynamic_rendering_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::dynamic_rendering::Device {
        ash::khr::dynamic_rendering::Device::new(&self.handle, device)
    }

    pub fn create_synchronization2_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::synchronization2::Device {
        ash::khr::synchronization2::Device::new(&self.handle, device)
    }

    /// Only available when validation is on; naming is a no-op otherwise.
    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_messenger
            .is_some()
            .then(|| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison_ignores_patch() {
        let v = VkVersion::new(1, 2, 198);
        assert!(v.at_least(1, 2));
        assert!(v.at_least(1, 0));
        assert!(!v.at_least(1, 3));
        assert_eq!(v.to_string(), "1.2.198");
    }

    #[test]
    fn portability_enumeration_sets_create_flag() {
        let available = [
            ash::khr::surface::NAME,
            ash::khr::portability_enumeration::NAME,
        ];
        let (exts, flags) =
            optional_instance_extensions(&available, VkVersion::new(1, 3, 0));
        assert_eq!(exts, vec![ash::khr::portability_enumeration::NAME]);
        assert!(flags.contains(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR));
    }

    #[test]
    fn properties2_only_requested_on_1_0() {
        let available = [ash::khr::get_physical_device_properties2::NAME];

        let (exts, flags) =
            optional_instance_extensions(&available, VkVersion::new(1, 0, 0));
        assert_eq!(exts, vec![ash::khr::get_physical_device_properties2::NAME]);
        assert!(flags.is_empty());

        let (exts, _) =
            optional_instance_extensions(&available, VkVersion::new(1, 1, 0));
        assert!(exts.is_empty());
    }

    #[test]
    fn nothing_enabled_when_nothing_available() {
        let (exts, flags) =
            optional_instance_extensions(&[], VkVersion::new(1, 0, 0));
        assert!(exts.is_empty());
        assert!(flags.is_empty());
    }
}
