//! Adapter selection and the logical device wrapper ([`Device`]).
//!
//! Selection is split in two so the ranking can be exercised without a
//! GPU: every enumerated adapter is first described as an
//! [`AdapterCandidate`] (plain data), then [`pick_adapter`] filters and
//! ranks those descriptions. [`Device::select_adapter`] does the Vulkan
//! queries and [`Device::create_logical_device`] opens the chosen adapter.
//!
//! `Device` owns the `gpu-allocator` allocator (behind a `Mutex`), the
//! extension loaders for swapchain, dynamic rendering, synchronization2
//! and debug utils, plus the graphics and present queues. All raw Vulkan
//! operations on the device are surfaced as `unsafe fn` methods with a
//! `raw_` or `cmd_` prefix; the wrappers in sibling modules call these
//! rather than touching `ash::Device` directly.

use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use thiserror::Error;

use crate::instance::{
    AdapterFeatures, FetchPhysicalDeviceError, Instance, VALIDATION_LAYER_NAME,
    VkVersion,
};
use crate::surface::PresentTarget;

enum DynamicRenderingLoader {
    /// Vulkan 1.3+: core, dispatched through `ash::Device`.
    Core,
    /// Vulkan < 1.3: `VK_KHR_dynamic_rendering`.
    Extension(ash::khr::dynamic_rendering::Device),
}

enum Synchronization2Loader {
    /// Vulkan 1.3+: core, dispatched through `ash::Device`.
    Core,
    /// Vulkan < 1.3: `VK_KHR_synchronization2`.
    Extension(ash::khr::synchronization2::Device),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Optional device capabilities the caller needs.
///
/// Headless users (uploads only, tests) leave `swapchain` off; the viewer
/// turns both on.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceConfig {
    pub swapchain: bool,
    pub dynamic_rendering: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an adapter failed the hard compatibility filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterRejection {
    NoGraphicsQueue,
    NoPresentQueue,
    MissingExtensions(Vec<String>),
    MissingFeatures(Vec<&'static str>),
    NoSurfaceFormatsOrPresentModes,
    QueryFailed(vk::Result),
}

impl std::fmt::Display for AdapterRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoGraphicsQueue => write!(f, "no graphics queue family"),
            Self::NoPresentQueue => {
                write!(f, "no queue family can present to the surface")
            }
            Self::MissingExtensions(exts) => {
                write!(f, "missing extensions {exts:?}")
            }
            Self::MissingFeatures(features) => {
                write!(f, "missing features {features:?}")
            }
            Self::NoSurfaceFormatsOrPresentModes => {
                write!(f, "surface reports no formats or present modes")
            }
            Self::QueryFailed(e) => write!(f, "capability query failed: {e}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterSelectionError {
    #[error("Present target was created from a different instance")]
    MismatchedParams,
    #[error("Could not enumerate adapters: {0}")]
    Enumerate(#[from] FetchPhysicalDeviceError),
    #[error("No suitable adapter found ({} rejected)", .rejected.len())]
    NoSuitableDevice {
        /// Adapter name and the reason it was skipped.
        rejected: Vec<(String, AdapterRejection)>,
    },
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error(transparent)]
    AdapterSelection(#[from] AdapterSelectionError),
    #[error("vkCreateDevice failed: {0}")]
    DeviceCreation(vk::Result),
    #[error("Failed to create memory allocator: {0}")]
    AllocatorCreation(AllocationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No memory type in mask {type_bits:#b} has properties {required:?}")]
pub struct NoSuitableMemoryTypeError {
    pub type_bits: u32,
    pub required: vk::MemoryPropertyFlags,
}

#[derive(Debug, Error)]
pub enum MemoryAllocationError {
    #[error(transparent)]
    NoSuitableMemoryType(#[from] NoSuitableMemoryTypeError),
    #[error("Allocator failed: {0}")]
    Allocator(#[from] AllocationError),
}

#[derive(Debug, Error)]
#[error("None of the candidate formats {candidates:?} support {features:?} with {tiling:?} tiling")]
pub struct NoSupportedFormatError {
    pub candidates: Vec<vk::Format>,
    pub tiling: vk::ImageTiling,
    pub features: vk::FormatFeatureFlags,
}

#[derive(Debug, Error)]
pub enum DynamicRenderingError {
    #[error("Dynamic rendering is not enabled on this device")]
    NotEnabled,
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),
    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Adapter ranking (pure)
// ---------------------------------------------------------------------------

/// Queue family indices for the two operation classes the core needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Distinct families, graphics first. One entry when they coincide.
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Pick graphics and present families.
///
/// A family doing both is preferred so the common case needs a single
/// queue. Otherwise the first graphics family is paired with the first
/// present-capable family.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut can_present: impl FnMut(u32) -> bool,
) -> Result<QueueFamilyIndices, AdapterRejection> {
    let mut graphics = None;
    let mut present = None;
    for (idx, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let idx = idx as u32;
        let has_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let has_present = can_present(idx);
        if has_graphics && has_present {
            return Ok(QueueFamilyIndices {
                graphics: idx,
                present: idx,
            });
        }
        if has_graphics && graphics.is_none() {
            graphics = Some(idx);
        }
        if has_present && present.is_none() {
            present = Some(idx);
        }
    }
    match (graphics, present) {
        (Some(graphics), Some(present)) => {
            Ok(QueueFamilyIndices { graphics, present })
        }
        (None, _) => Err(AdapterRejection::NoGraphicsQueue),
        (Some(_), None) => Err(AdapterRejection::NoPresentQueue),
    }
}

/// Everything adapter ranking looks at, extracted from Vulkan queries.
#[derive(Debug, Clone)]
pub struct AdapterCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    /// `Err` when the candidate already failed the filter during querying.
    pub queue_families: Result<QueueFamilyIndices, AdapterRejection>,
    pub missing_extensions: Vec<String>,
    pub missing_features: Vec<&'static str>,
    pub surface_adequate: bool,
}

impl AdapterCandidate {
    /// `None` when the candidate passes the hard filter.
    pub fn rejection(&self) -> Option<AdapterRejection> {
        if let Err(reason) = &self.queue_families {
            return Some(reason.clone());
        }
        if !self.missing_extensions.is_empty() {
            return Some(AdapterRejection::MissingExtensions(
                self.missing_extensions.clone(),
            ));
        }
        if !self.missing_features.is_empty() {
            return Some(AdapterRejection::MissingFeatures(
                self.missing_features.clone(),
            ));
        }
        if !self.surface_adequate {
            return Some(AdapterRejection::NoSurfaceFormatsOrPresentModes);
        }
        None
    }

    /// Adapter class first, then the largest 2D image it can create.
    pub fn score(&self) -> (u32, u32) {
        (device_type_rank(self.device_type), self.max_image_dimension_2d)
    }
}

fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// Index of the best passing candidate.
///
/// Ties go to the earlier candidate so the result only depends on
/// enumeration order.
pub fn pick_adapter(
    candidates: &[AdapterCandidate],
) -> Result<usize, AdapterSelectionError> {
    let mut rejected = Vec::new();
    let mut best: Option<(usize, (u32, u32))> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        if let Some(reason) = candidate.rejection() {
            tracing::debug!("Skipping {}: {reason}", candidate.name);
            rejected.push((candidate.name.clone(), reason));
            continue;
        }
        let score = candidate.score();
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx)
        .ok_or(AdapterSelectionError::NoSuitableDevice { rejected })
}

/// First memory type allowed by `type_bits` whose flags contain
/// `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, NoSuitableMemoryTypeError> {
    compatible_memory_types(memory_properties, type_bits, required)
        .next()
        .ok_or(NoSuitableMemoryTypeError {
            type_bits,
            required,
        })
}

/// The gpu-allocator location serving `required`, and the flags its memory
/// type will really have.
///
/// gpu-allocator serves both host-visible locations from `HOST_COHERENT`
/// types only, so asking for host visibility implies coherence.
fn memory_request(
    required: vk::MemoryPropertyFlags,
) -> (MemoryLocation, vk::MemoryPropertyFlags) {
    use vk::MemoryPropertyFlags as F;
    if !required.contains(F::HOST_VISIBLE) {
        (MemoryLocation::GpuOnly, required)
    } else if required.contains(F::HOST_CACHED) {
        (MemoryLocation::GpuToCpu, required | F::HOST_COHERENT)
    } else {
        (MemoryLocation::CpuToGpu, required | F::HOST_COHERENT)
    }
}

fn compatible_memory_types(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> impl Iterator<Item = u32> + '_ {
    let count = (memory_properties.memory_type_count as usize)
        .min(vk::MAX_MEMORY_TYPES);
    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .filter(move |(i, ty)| {
            type_bits & (1 << i) != 0 && ty.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
}

/// Highest sample count usable for both colour and depth attachments.
pub fn max_usable_sample_count(
    limits: &vk::PhysicalDeviceLimits,
) -> vk::SampleCountFlags {
    let counts = limits.framebuffer_color_sample_counts
        & limits.framebuffer_depth_sample_counts;
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&count| counts.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

// ---------------------------------------------------------------------------
// Adapter selection (Vulkan queries)
// ---------------------------------------------------------------------------

/// An adapter that passed the filter, with what creation needs to know.
#[derive(Debug, Clone)]
pub struct SelectedAdapter {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: AdapterFeatures,
    pub queue_families: QueueFamilyIndices,
    api_version: VkVersion,
    portability_subset: bool,
}

impl SelectedAdapter {
    pub fn name(&self) -> String {
        adapter_name(&self.properties)
    }

    fn needs_extension_loaders(&self) -> bool {
        !self.api_version.at_least(1, 3)
    }
}

fn adapter_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .unwrap_or(c"unknown")
        .to_string_lossy()
        .into_owned()
}

struct QueriedAdapter {
    candidate: AdapterCandidate,
    selected: Option<SelectedAdapter>,
}

/// Run every capability query the filter needs for one adapter.
///
/// # Safety
/// `dev` must be derived from `instance`, and `target` (when present) must
/// share that instance.
unsafe fn query_adapter(
    instance: &Instance,
    dev: vk::PhysicalDevice,
    target: Option<&dyn PresentTarget>,
    config: &DeviceConfig,
) -> QueriedAdapter {
    // SAFETY: dev was derived from instance (caller contract).
    let properties = unsafe { instance.get_raw_physical_device_properties(dev) };
    let name = adapter_name(&properties);
    // Core entry points are only usable up to the version both the
    // instance and the adapter support.
    let api_version = VkVersion::from_raw(
        properties.api_version.min(instance.supported_ver().to_raw()),
    );

    let mut candidate = AdapterCandidate {
        name,
        device_type: properties.device_type,
        max_image_dimension_2d: properties.limits.max_image_dimension2_d,
        queue_families: Err(AdapterRejection::NoGraphicsQueue),
        missing_extensions: Vec::new(),
        missing_features: Vec::new(),
        surface_adequate: true,
    };

    // SAFETY: dev was derived from instance.
    let exts = match unsafe {
        instance.enumerate_raw_device_extension_properties(dev)
    } {
        Ok(exts) => exts,
        Err(e) => {
            candidate.queue_families = Err(AdapterRejection::QueryFailed(e));
            return QueriedAdapter {
                candidate,
                selected: None,
            };
        }
    };
    let has_ext = |name: &CStr| {
        exts.iter().any(|e| e.extension_name_as_c_str() == Ok(name))
    };

    let pre_1_3 = !api_version.at_least(1, 3);
    let mut required_exts: Vec<&CStr> = Vec::new();
    if config.swapchain {
        required_exts.push(ash::khr::swapchain::NAME);
    }
    if pre_1_3 {
        required_exts.push(ash::khr::synchronization2::NAME);
        if config.dynamic_rendering {
            required_exts.push(ash::khr::dynamic_rendering::NAME);
        }
    }
    candidate.missing_extensions = required_exts
        .iter()
        .filter(|ext| !has_ext(ext))
        .map(|ext| ext.to_string_lossy().into_owned())
        .collect();

    // SAFETY: dev was derived from instance.
    let features =
        unsafe { instance.get_raw_physical_device_features(dev, api_version) };
    if features.core.sampler_anisotropy != vk::TRUE {
        candidate.missing_features.push("samplerAnisotropy");
    }
    if !features.synchronization2 {
        candidate.missing_features.push("synchronization2");
    }
    if config.dynamic_rendering && !features.dynamic_rendering {
        candidate.missing_features.push("dynamicRendering");
    }

    // SAFETY: dev was derived from instance.
    let families = unsafe {
        instance.get_raw_physical_device_queue_family_properties(dev)
    };
    candidate.queue_families = find_queue_families(&families, |idx| {
        match target {
            // SAFETY: target shares the instance dev came from.
            Some(target) => unsafe { target.supports_queue_family(dev, idx) }
                .unwrap_or_else(|e| {
                    tracing::debug!(
                        "Present support query failed for family {idx}: {e}"
                    );
                    false
                }),
            // Headless: the graphics family stands in for present.
            None => families[idx as usize]
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS),
        }
    });

    if let Some(target) = target {
        // SAFETY: target shares the instance dev came from.
        candidate.surface_adequate = match unsafe { target.query_support(dev) }
        {
            Ok(support) => support.is_adequate(),
            Err(e) => {
                tracing::debug!("Surface query failed for {}: {e}", candidate.name);
                false
            }
        };
    }

    let selected = candidate.queue_families.clone().ok().map(|queue_families| {
        SelectedAdapter {
            physical_device: dev,
            properties,
            features,
            queue_families,
            api_version,
            portability_subset: has_ext(ash::khr::portability_subset::NAME),
        }
    });
    QueriedAdapter {
        candidate,
        selected,
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A logical Vulkan device and its per-device state.
///
/// Created once at startup and dropped last; every GPU object holds an
/// `Arc<Device>`.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    sampler_anisotropy: bool,
    swapchain_device: Option<ash::khr::swapchain::Device>,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    dynamic_rendering: Option<DynamicRenderingLoader>,
    synchronization2: Synchronization2Loader,
    queue_families: QueueFamilyIndices,
    /// Aliased when both roles share a family, so locking either role
    /// serialises on the same `VkQueue`.
    graphics_queue: Arc<Mutex<vk::Queue>>,
    present_queue: Arc<Mutex<vk::Queue>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("queue_families", &self.queue_families)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // The allocator frees its blocks through the device handle.
        self.allocator = None;
        // SAFETY: every object derived from this device holds an Arc to it,
        // so none are alive here.
        unsafe { self.handle.destroy_device(None) };
    }
}

impl Device {
    /// Select an adapter and open it.
    pub fn new(
        instance: &Arc<Instance>,
        target: Option<&dyn PresentTarget>,
        config: DeviceConfig,
    ) -> Result<Self, CreateDeviceError> {
        let adapter = Self::select_adapter(instance, target, &config)?;
        Self::create_logical_device(instance, adapter, config)
    }

    /// Enumerate adapters and pick the best one that passes the filter.
    ///
    /// Without a `target` no present support is checked and the graphics
    /// family is used for both roles.
    pub fn select_adapter(
        instance: &Arc<Instance>,
        target: Option<&dyn PresentTarget>,
        config: &DeviceConfig,
    ) -> Result<SelectedAdapter, AdapterSelectionError> {
        if let Some(target) = target
            && !Arc::ptr_eq(target.instance(), instance)
        {
            return Err(AdapterSelectionError::MismatchedParams);
        }

        let mut queried: Vec<QueriedAdapter> = instance
            .fetch_raw_physical_devices()?
            .into_iter()
            // SAFETY: dev was just enumerated from instance and target was
            // checked to share it.
            .map(|dev| unsafe { query_adapter(instance, dev, target, config) })
            .collect();

        let candidates: Vec<AdapterCandidate> =
            queried.iter().map(|q| q.candidate.clone()).collect();
        let best = pick_adapter(&candidates)?;
        let selected = queried
            .swap_remove(best)
            .selected
            .ok_or_else(|| AdapterSelectionError::NoSuitableDevice {
                rejected: Vec::new(),
            })?;

        tracing::info!(
            "Selected adapter {} ({:?}, Vulkan {}, queues graphics={} present={})",
            selected.name(),
            selected.properties.device_type,
            selected.api_version,
            selected.queue_families.graphics,
            selected.queue_families.present,
        );
        Ok(selected)
    }

    /// Open `adapter` with one queue per distinct family.
    pub fn create_logical_device(
        instance: &Arc<Instance>,
        adapter: SelectedAdapter,
        config: DeviceConfig,
    ) -> Result<Self, CreateDeviceError> {
        let families = adapter.queue_families.unique();
        let priorities = [1.0_f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let use_ext_loaders = adapter.needs_extension_loaders();
        let mut exts: Vec<&CStr> = Vec::new();
        if config.swapchain {
            exts.push(ash::khr::swapchain::NAME);
        }
        if use_ext_loaders {
            exts.push(ash::khr::synchronization2::NAME);
            if config.dynamic_rendering {
                exts.push(ash::khr::dynamic_rendering::NAME);
            }
        }
        if adapter.portability_subset {
            exts.push(ash::khr::portability_subset::NAME);
        }
        let ext_ptrs: Vec<_> = exts.iter().map(|e| e.as_ptr()).collect();
        // Device layers are ignored by current loaders but older ones
        // still expect them to match the instance.
        let layer_ptrs: Vec<_> = if instance.validation_enabled() {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let sampler_anisotropy =
            adapter.features.core.sampler_anisotropy == vk::TRUE;
        let core_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(sampler_anisotropy);
        let mut sync2_features =
            vk::PhysicalDeviceSynchronization2Features::default()
                .synchronization2(true);
        let mut dr_features =
            vk::PhysicalDeviceDynamicRenderingFeatures::default()
                .dynamic_rendering(true);

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs)
            .enabled_features(&core_features)
            .push_next(&mut sync2_features);
        if config.dynamic_rendering {
            create_info = create_info.push_next(&mut dr_features);
        }

        // SAFETY: the adapter came from this instance and create_info only
        // borrows locals that outlive the call.
        let device = unsafe {
            instance.create_ash_device(adapter.physical_device, &create_info)
        }
        .map_err(CreateDeviceError::DeviceCreation)?;

        let QueueFamilyIndices { graphics, present } = adapter.queue_families;
        // SAFETY: one queue was requested for each of these families.
        let graphics_queue = unsafe { device.get_device_queue(graphics, 0) };
        let graphics_queue = Arc::new(Mutex::new(graphics_queue));
        let present_queue = if adapter.queue_families.is_shared() {
            Arc::clone(&graphics_queue)
        } else {
            // SAFETY: as above.
            Arc::new(Mutex::new(unsafe { device.get_device_queue(present, 0) }))
        };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: device.clone(),
            physical_device: adapter.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been created from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(CreateDeviceError::AllocatorCreation(e));
            }
        };

        // SAFETY: the adapter came from this instance.
        let memory_properties = unsafe {
            instance
                .get_raw_physical_device_memory_properties(adapter.physical_device)
        };

        Ok(Self {
            parent: Arc::clone(instance),
            allocator: Some(Mutex::new(allocator)),
            physical_device: adapter.physical_device,
            properties: adapter.properties,
            memory_properties,
            sampler_anisotropy,
            swapchain_device: config
                .swapchain
                .then(|| instance.create_swapchain_loader(&device)),
            debug_utils_device: instance.create_debug_utils_device_loader(&device),
            dynamic_rendering: config.dynamic_rendering.then(|| {
                if use_ext_loaders {
                    DynamicRenderingLoader::Extension(
                        instance.create_dynamic_rendering_loader(&device),
                    )
                } else {
                    DynamicRenderingLoader::Core
                }
            }),
            synchronization2: if use_ext_loaders {
                Synchronization2Loader::Extension(
                    instance.create_synchronization2_loader(&device),
                )
            } else {
                Synchronization2Loader::Core
            },
            queue_families: adapter.queue_families,
            graphics_queue,
            present_queue,
            handle: device,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.queue_families.graphics
    }

    /// Largest anisotropy the sampler may request, `None` when the feature
    /// is off.
    pub fn max_sampler_anisotropy(&self) -> Option<f32> {
        self.sampler_anisotropy
            .then_some(self.properties.limits.max_sampler_anisotropy)
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    /// See [`find_memory_type`].
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32, NoSuitableMemoryTypeError> {
        find_memory_type(&self.memory_properties, type_bits, required)
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        // SAFETY: physical_device was enumerated from parent.
        unsafe {
            self.parent.get_raw_physical_device_format_properties(
                self.physical_device,
                format,
            )
        }
    }

    /// First candidate whose tiling supports `features`.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format, NoSupportedFormatError> {
        candidates
            .iter()
            .copied()
            .find(|&format| {
                let props = self.format_properties(format);
                let supported = match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features,
                    _ => props.optimal_tiling_features,
                };
                supported.contains(features)
            })
            .ok_or_else(|| NoSupportedFormatError {
                candidates: candidates.to_vec(),
                tiling,
                features,
            })
    }

    pub fn find_depth_format(&self) -> Result<vk::Format, NoSupportedFormatError> {
        self.find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    pub fn max_usable_sample_count(&self) -> vk::SampleCountFlags {
        max_usable_sample_count(&self.properties.limits)
    }

    /// Whether `format` can be the source of a linear-filtered blit in
    /// optimal tiling.
    pub fn supports_linear_blit(&self, format: vk::Format) -> bool {
        self.format_properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }

    /// Allocate memory satisfying both `requirements` and `required`.
    ///
    /// Fails early with [`NoSuitableMemoryTypeError`] when no memory type
    /// qualifies, and restricts the allocator to qualifying types.
    /// Host-visible memory is always `HOST_COHERENT` as well.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        required: vk::MemoryPropertyFlags,
        linear: bool,
    ) -> Result<Allocation, MemoryAllocationError> {
        let (location, required) = memory_request(required);
        self.find_memory_type(requirements.memory_type_bits, required)?;
        let compatible_bits = compatible_memory_types(
            &self.memory_properties,
            requirements.memory_type_bits,
            required,
        )
        .fold(0u32, |bits, idx| bits | (1 << idx));

        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        Ok(allocator.allocate(&AllocationCreateDesc {
            name,
            requirements: vk::MemoryRequirements {
                memory_type_bits: compatible_bits,
                ..requirements
            },
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    pub fn free_memory(
        &self,
        allocation: Allocation,
    ) -> Result<(), AllocationError> {
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        allocator.free(allocation)
    }

    /// Block until all submitted work on every queue has completed.
    ///
    /// For coarse transitions only: shutdown, suspend, chain rebuild.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: the device handle is valid for the lifetime of self.
        unsafe { self.handle.device_wait_idle() }
    }

    /// Block until the graphics queue is idle.
    pub fn graphics_queue_wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("graphics_queue_wait_idle").entered();
        let queue = self
            .graphics_queue
            .lock()
            .expect("graphics queue lock poisoned");
        // SAFETY: the queue belongs to this device; the lock gives us
        // external synchronisation.
        unsafe { self.handle.queue_wait_idle(*queue) }
    }
}

// Swapchain functionality
impl Device {
    pub fn has_swapchain_support(&self) -> bool {
        self.swapchain_device.is_some()
    }

    fn swapchain_loader(
        &self,
    ) -> Result<&ash::khr::swapchain::Device, vk::Result> {
        self.swapchain_device
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    /// # Safety
    /// `create_info` must reference valid objects derived from this device
    /// and its instance; `old_swapchain`, when set, must come from this
    /// device.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.swapchain_loader()?.create_swapchain(create_info, None) }
    }

    /// # Safety
    /// `swapchain` must be a live swapchain created from this device.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result> {
        // SAFETY: caller guarantees swapchain validity.
        unsafe { self.swapchain_loader()?.get_swapchain_images(swapchain) }
    }

    /// # Safety
    /// `swapchain` must come from this device, its views must already be
    /// destroyed, and no pending work may reference its images.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = self.swapchain_device.as_ref() {
            // SAFETY: caller guarantees provenance and ordering.
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    /// Acquire the next presentable image.
    ///
    /// Returns `(image_index, suboptimal)`; out-of-date comes back as
    /// `Err(ERROR_OUT_OF_DATE_KHR)`.
    ///
    /// # Safety
    /// `swapchain` must come from this device; `semaphore` must be
    /// unsignaled with no pending signal operation.
    pub unsafe fn acquire_next_swapchain_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        // SAFETY: caller guarantees handle validity.
        unsafe {
            self.swapchain_loader()?.acquire_next_image(
                swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Present on the present queue. `Ok(true)` means suboptimal.
    ///
    /// # Safety
    /// All handles in `present_info` must come from this device and the
    /// image must be in `PRESENT_SRC_KHR` once the wait semaphores signal.
    pub unsafe fn queue_present(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let loader = self.swapchain_loader()?;
        let queue = self
            .present_queue
            .lock()
            .expect("present queue lock poisoned");
        // SAFETY: caller guarantees handle validity; the lock provides
        // external queue synchronisation.
        unsafe { loader.queue_present(*queue, present_info) }
    }
}

// Debug naming functionality
impl Device {
    /// Set a debug name. A no-op when validation is off or `name` is `None`.
    ///
    /// # Safety
    /// `object` must be a live handle created from this device.
    pub unsafe fn set_object_name_str<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError> {
        let (Some(debug_utils), Some(name)) =
            (self.debug_utils_device.as_ref(), name)
        else {
            return Ok(());
        };
        let name = CString::new(name).map_err(NameObjectError::InvalidName)?;
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(&name);
        // SAFETY: caller guarantees object provenance.
        unsafe { debug_utils.set_debug_utils_object_name(&info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// Name `object`, logging instead of failing.
    ///
    /// # Safety
    /// Same contract as [`set_object_name_str`](Self::set_object_name_str).
    pub(crate) unsafe fn name_or_warn<H: vk::Handle + std::fmt::Debug + Copy>(
        &self,
        object: H,
        name: Option<&str>,
    ) {
        // SAFETY: forwarded caller contract.
        if let Err(e) = unsafe { self.set_object_name_str(object, name) } {
            tracing::warn!("Failed to name {:?}: {e}", object);
        }
    }
}

// Object creation and destruction
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `image_view` must come from this device and be unused by pending work.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// `image` must come from this device, its views must be destroyed, and
    /// no pending work may reference it.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must be a live image created from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: caller guarantees image validity.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` must not already be bound; `memory` and `offset` must satisfy
    /// its requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees binding validity.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must come from this device and be unused by pending work.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a live buffer created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` must not already be bound; `memory` and `offset` must
    /// satisfy its requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees binding validity.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_sampler(create_info, None) }
    }

    /// # Safety
    /// `sampler` must come from this device and be unused by pending work.
    pub unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_sampler(sampler, None) };
    }

    /// # Safety
    /// `create_info` must point at valid SPIR-V for the duration of the call.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `module` must come from this device.
    pub unsafe fn destroy_raw_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.destroy_shader_module(module, None) };
    }

    /// # Safety
    /// `create_info` must reference live set layouts from this device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device and be unused by pending work.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create one graphics pipeline.
    ///
    /// # Safety
    /// `create_info` and its whole pNext chain must be valid for the
    /// duration of the call.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        let result = unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((partial, e)) => {
                for pipeline in partial {
                    if pipeline != vk::Pipeline::null() {
                        // SAFETY: the pipeline was just created and never
                        // used.
                        unsafe { self.handle.destroy_pipeline(pipeline, None) };
                    }
                }
                Err(e)
            }
        }
    }

    /// # Safety
    /// `pipeline` must come from this device and be unused by pending work.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Command pools and command buffers
impl Device {
    /// # Safety
    /// `create_info` must name a queue family this device was created with.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// No buffer allocated from `pool` may be pending execution.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a live pool from this device that is
    /// not in use on another thread.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: caller guarantees allocate_info validity.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// The buffers must come from `pool` and not be pending execution.
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        buffers: &[vk::CommandBuffer],
    ) {
        // SAFETY: caller guarantees provenance and state.
        unsafe { self.handle.free_command_buffers(pool, buffers) };
    }

    /// # Safety
    /// `command_buffer` must be in the initial state.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees command buffer state.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees command buffer state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// The buffer's pool must allow individual resets and the buffer must
    /// not be pending execution.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees reset preconditions.
        unsafe {
            self.handle.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )
        }
    }

    /// Submit with synchronization2 on the graphics queue.
    ///
    /// # Safety
    /// Command buffers must be executable, wait semaphores must have a
    /// pending or completed signal, and `fence` (when not null) must be
    /// unsignaled.
    pub unsafe fn graphics_queue_submit2(
        &self,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self
            .graphics_queue
            .lock()
            .expect("graphics queue lock poisoned");
        match &self.synchronization2 {
            // SAFETY: caller guarantees submission validity.
            Synchronization2Loader::Core => unsafe {
                self.handle.queue_submit2(*queue, submits, fence)
            },
            // SAFETY: caller guarantees submission validity.
            Synchronization2Loader::Extension(loader) => unsafe {
                loader.queue_submit2(*queue, submits, fence)
            },
        }
    }
}

// Synchronisation objects
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must come from this device and not be pending.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: caller guarantees provenance and state.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// Every fence must come from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// No fence may be pending on a queue.
    pub unsafe fn reset_raw_fences(
        &self,
        fences: &[vk::Fence],
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees fence state.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// `Ok(true)` when signaled.
    ///
    /// # Safety
    /// `fence` must come from this device.
    pub unsafe fn get_raw_fence_status(
        &self,
        fence: vk::Fence,
    ) -> Result<bool, vk::Result> {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.get_fence_status(fence) }
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// `semaphore` must come from this device with no pending operation.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: caller guarantees provenance and state.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

// Descriptors
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device.
    pub unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// No set from `pool` may be used by pending work.
    pub unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a live pool and layouts from this
    /// device.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: caller guarantees allocate_info validity.
        unsafe { self.handle.allocate_descriptor_sets(allocate_info) }
    }

    /// # Safety
    /// Written sets must not be bound in pending command buffers, and every
    /// referenced resource must be live.
    pub unsafe fn update_raw_descriptor_sets(
        &self,
        writes: &[vk::WriteDescriptorSet<'_>],
    ) {
        // SAFETY: caller guarantees write validity.
        unsafe { self.handle.update_descriptor_sets(writes, &[]) };
    }
}

// Recording commands
impl Device {
    pub fn has_dynamic_rendering(&self) -> bool {
        self.dynamic_rendering.is_some()
    }

    /// # Safety
    /// `command_buffer` must be recording and every attachment in
    /// `rendering_info` must be in its stated layout.
    pub unsafe fn cmd_begin_raw_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
        rendering_info: &vk::RenderingInfo<'_>,
    ) -> Result<(), DynamicRenderingError> {
        match &self.dynamic_rendering {
            None => return Err(DynamicRenderingError::NotEnabled),
            // SAFETY: caller guarantees recording state and attachments.
            Some(DynamicRenderingLoader::Core) => unsafe {
                self.handle
                    .cmd_begin_rendering(command_buffer, rendering_info)
            },
            // SAFETY: caller guarantees recording state and attachments.
            Some(DynamicRenderingLoader::Extension(loader)) => unsafe {
                loader.cmd_begin_rendering(command_buffer, rendering_info)
            },
        }
        Ok(())
    }

    /// # Safety
    /// `command_buffer` must be inside a rendering scope begun with
    /// [`cmd_begin_raw_rendering`](Self::cmd_begin_raw_rendering).
    pub unsafe fn cmd_end_raw_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), DynamicRenderingError> {
        match &self.dynamic_rendering {
            None => return Err(DynamicRenderingError::NotEnabled),
            // SAFETY: caller guarantees rendering scope.
            Some(DynamicRenderingLoader::Core) => unsafe {
                self.handle.cmd_end_rendering(command_buffer)
            },
            // SAFETY: caller guarantees rendering scope.
            Some(DynamicRenderingLoader::Extension(loader)) => unsafe {
                loader.cmd_end_rendering(command_buffer)
            },
        }
        Ok(())
    }

    /// # Safety
    /// `command_buffer` must be recording; the barriers must describe
    /// resources from this device.
    pub unsafe fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        match &self.synchronization2 {
            // SAFETY: caller guarantees recording state and barrier validity.
            Synchronization2Loader::Core => unsafe {
                self.handle
                    .cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
            // SAFETY: caller guarantees recording state and barrier validity.
            Synchronization2Loader::Extension(loader) => unsafe {
                loader.cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `pipeline` must come from this
    /// device.
    pub unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: caller guarantees recording state and provenance.
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording; the buffers must have
    /// `VERTEX_BUFFER` usage and outlive execution.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: caller guarantees recording state and buffer validity.
        unsafe {
            self.handle.cmd_bind_vertex_buffers(
                command_buffer,
                first_binding,
                buffers,
                offsets,
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffer` must have
    /// `INDEX_BUFFER` usage and outlive execution.
    pub unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: caller guarantees recording state and buffer validity.
        unsafe {
            self.handle.cmd_bind_index_buffer(
                command_buffer,
                buffer,
                offset,
                index_type,
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording; the sets must be compatible with
    /// `layout` and outlive execution.
    pub unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: caller guarantees recording state and set validity.
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                &[],
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording; regions must be in bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: caller guarantees recording state and bounds.
        unsafe { self.handle.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    /// # Safety
    /// `command_buffer` must be recording; `dst` must be in `dst_layout`.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: caller guarantees recording state, layout and bounds.
        unsafe {
            self.handle.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                dst_layout,
                regions,
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording; both images must be in the
    /// given layouts and the format must support `filter` blits.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        // SAFETY: caller guarantees recording state, layouts and support.
        unsafe {
            self.handle.cmd_blit_image(
                command_buffer,
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
                filter,
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording.
    pub unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        viewport: vk::Viewport,
    ) {
        // SAFETY: caller guarantees recording state.
        unsafe {
            self.handle.cmd_set_viewport(
                command_buffer,
                0,
                std::slice::from_ref(&viewport),
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be recording.
    pub unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        scissor: vk::Rect2D,
    ) {
        // SAFETY: caller guarantees recording state.
        unsafe {
            self.handle.cmd_set_scissor(
                command_buffer,
                0,
                std::slice::from_ref(&scissor),
            )
        };
    }

    /// # Safety
    /// `command_buffer` must be inside a rendering scope with a pipeline,
    /// vertex buffers and an index buffer bound.
    pub unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: caller guarantees recording state and bindings.
        unsafe {
            self.handle.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        max_dim: u32,
    ) -> AdapterCandidate {
        AdapterCandidate {
            name: name.to_owned(),
            device_type,
            max_image_dimension_2d: max_dim,
            queue_families: Ok(QueueFamilyIndices {
                graphics: 0,
                present: 0,
            }),
            missing_extensions: Vec::new(),
            missing_features: Vec::new(),
            surface_adequate: true,
        }
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn memory_properties(
        types: &[vk::MemoryPropertyFlags],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    #[test]
    fn discrete_outranks_integrated_even_with_smaller_images() {
        let candidates = [
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 16384),
            candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            candidate("llvmpipe", vk::PhysicalDeviceType::CPU, 16384),
        ];
        assert_eq!(pick_adapter(&candidates).unwrap(), 1);
    }

    #[test]
    fn class_ordering_is_discrete_integrated_virtual_cpu() {
        let order = [
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::OTHER,
        ];
        for pair in order.windows(2) {
            assert!(device_type_rank(pair[0]) > device_type_rank(pair[1]));
        }
    }

    #[test]
    fn max_image_dimension_breaks_class_ties() {
        let candidates = [
            candidate("small", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            candidate("large", vk::PhysicalDeviceType::DISCRETE_GPU, 32768),
        ];
        assert_eq!(pick_adapter(&candidates).unwrap(), 1);
    }

    #[test]
    fn selection_is_deterministic_on_full_ties() {
        let candidates = [
            candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
            candidate("b", vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
        ];
        let first = pick_adapter(&candidates).unwrap();
        let second = pick_adapter(&candidates).unwrap();
        assert_eq!(first, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn filtered_adapters_are_never_picked() {
        let mut no_swapchain =
            candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 32768);
        no_swapchain.missing_extensions = vec!["VK_KHR_swapchain".to_owned()];
        let mut no_formats =
            candidate("vgpu", vk::PhysicalDeviceType::VIRTUAL_GPU, 32768);
        no_formats.surface_adequate = false;
        let fallback =
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 4096);

        let candidates = [no_swapchain, no_formats, fallback];
        assert_eq!(pick_adapter(&candidates).unwrap(), 2);
    }

    #[test]
    fn no_passing_adapter_reports_every_rejection() {
        let mut a = candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU, 1);
        a.queue_families = Err(AdapterRejection::NoPresentQueue);
        let mut b = candidate("b", vk::PhysicalDeviceType::CPU, 1);
        b.missing_features = vec!["samplerAnisotropy"];

        match pick_adapter(&[a, b]) {
            Err(AdapterSelectionError::NoSuitableDevice { rejected }) => {
                assert_eq!(rejected.len(), 2);
                assert_eq!(rejected[0].1, AdapterRejection::NoPresentQueue);
                assert_eq!(
                    rejected[1].1,
                    AdapterRejection::MissingFeatures(vec!["samplerAnisotropy"])
                );
            }
            other => panic!("expected NoSuitableDevice, got {other:?}"),
        }
    }

    #[test]
    fn queue_families_prefer_a_combined_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let indices = find_queue_families(&families, |idx| idx != 0).unwrap();
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: 2,
                present: 2
            }
        );
        assert_eq!(indices.unique(), vec![2]);
    }

    #[test]
    fn queue_families_fall_back_to_separate_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = find_queue_families(&families, |idx| idx == 1).unwrap();
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: 0,
                present: 1
            }
        );
        assert_eq!(indices.unique(), vec![0, 1]);
    }

    #[test]
    fn queue_families_report_what_is_missing() {
        let compute_only = [family(vk::QueueFlags::COMPUTE)];
        assert_eq!(
            find_queue_families(&compute_only, |_| true),
            Err(AdapterRejection::NoGraphicsQueue)
        );
        let graphics_only = [family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(
            find_queue_families(&graphics_only, |_| false),
            Err(AdapterRejection::NoPresentQueue)
        );
    }

    #[test]
    fn host_visible_requests_are_coherent() {
        use vk::MemoryPropertyFlags as F;
        assert_eq!(
            memory_request(F::DEVICE_LOCAL),
            (MemoryLocation::GpuOnly, F::DEVICE_LOCAL)
        );
        assert_eq!(
            memory_request(F::HOST_VISIBLE),
            (MemoryLocation::CpuToGpu, F::HOST_VISIBLE | F::HOST_COHERENT)
        );
        assert_eq!(
            memory_request(F::HOST_VISIBLE | F::HOST_CACHED),
            (
                MemoryLocation::GpuToCpu,
                F::HOST_VISIBLE | F::HOST_CACHED | F::HOST_COHERENT
            )
        );
    }

    #[test]
    fn memory_type_is_first_superset_match() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE,
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
        ]);
        let wanted = F::HOST_VISIBLE | F::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b1111, wanted), Ok(2));
        // Type 2 excluded by the requirement bits: next superset wins.
        assert_eq!(find_memory_type(&props, 0b1011, wanted), Ok(3));
        assert_eq!(find_memory_type(&props, 0b1111, F::empty()), Ok(0));
    }

    #[test]
    fn memory_type_lookup_is_idempotent() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[F::DEVICE_LOCAL, F::HOST_VISIBLE]);
        let first = find_memory_type(&props, 0b11, F::HOST_VISIBLE);
        let second = find_memory_type(&props, 0b11, F::HOST_VISIBLE);
        assert_eq!(first, second);
        assert_eq!(first, Ok(1));
    }

    #[test]
    fn memory_type_lookup_fails_without_match() {
        use vk::MemoryPropertyFlags as F;
        let props = memory_properties(&[F::DEVICE_LOCAL, F::HOST_VISIBLE]);
        let err = find_memory_type(&props, 0b01, F::HOST_VISIBLE).unwrap_err();
        assert_eq!(
            err,
            NoSuitableMemoryTypeError {
                type_bits: 0b01,
                required: F::HOST_VISIBLE
            }
        );
        // Bits beyond memory_type_count are ignored.
        assert!(find_memory_type(&props, 0b100, F::empty()).is_err());
    }

    #[test]
    fn sample_count_uses_colour_and_depth_intersection() {
        use vk::SampleCountFlags as S;
        let limits = vk::PhysicalDeviceLimits {
            framebuffer_color_sample_counts: S::TYPE_1 | S::TYPE_2 | S::TYPE_4 | S::TYPE_8,
            framebuffer_depth_sample_counts: S::TYPE_1 | S::TYPE_2 | S::TYPE_4,
            ..Default::default()
        };
        assert_eq!(max_usable_sample_count(&limits), S::TYPE_4);
        assert_eq!(
            max_usable_sample_count(&vk::PhysicalDeviceLimits::default()),
            S::TYPE_1
        );
    }
}
