//! Device-level objects against a real driver: fences, frame slots and
//! pipeline prerequisites.
//!
//! Run with `cargo test -p rvk-render -- --ignored`. No window is needed.

use std::sync::Arc;

use rvk_render::ash::vk;
use rvk_render::device::{DEPTH_FORMAT_CANDIDATES, Device, DeviceConfig};
use rvk_render::frame::FrameSlots;
use rvk_render::instance::{Instance, InstanceExtensions};
use rvk_render::log::VulkanLogLevel;
use rvk_render::pipeline::{
    CreatePipelineError, GraphicsPipeline, GraphicsPipelineDesc, PipelineLayout,
    VertexInput,
};
use rvk_render::renderable::Vertex;
use rvk_render::scene::UniformBufferObject;
use rvk_render::sync::{Fence, FenceWaitError};

fn headless_device() -> (Arc<Instance>, Arc<Device>) {
    // SAFETY: loading the system Vulkan loader is what this test is for.
    let instance = Arc::new(
        unsafe {
            Instance::new(
                "rvk-render-tests",
                Some(VulkanLogLevel::Warning),
                None::<&raw_window_handle::DisplayHandle<'static>>,
                InstanceExtensions { surface: false },
            )
        }
        .expect("Vulkan instance"),
    );
    let device = Arc::new(
        Device::new(
            &instance,
            None,
            DeviceConfig {
                swapchain: false,
                dynamic_rendering: false,
            },
        )
        .expect("Vulkan device"),
    );
    (instance, device)
}

#[test]
#[ignore = "requires a Vulkan device"]
fn fence_tracks_its_submit_cycle() {
    let (_instance, device) = headless_device();

    let signaled = Fence::new(&device, true, Some("signaled fence")).expect("fence");
    assert!(!signaled.is_armed());
    assert_eq!(signaled.is_signaled(), Ok(true));
    signaled.wait(0).expect("signaled fence wait");

    let mut fence = signaled;
    // SAFETY: the fence was never submitted, so it is not pending.
    unsafe { fence.reset() }.expect("reset");
    assert!(fence.is_armed());
    assert_eq!(fence.is_signaled(), Ok(false));
    // An armed fence was never handed to a queue; waiting would hang.
    assert!(matches!(fence.wait(u64::MAX), Err(FenceWaitError::NeverSubmitted)));
}

#[test]
#[ignore = "requires a Vulkan device"]
fn frame_slots_start_ready_with_host_visible_uniforms() {
    let (_instance, device) = headless_device();
    let slots = FrameSlots::new::<UniformBufferObject>(&device, 3).expect("frame slots");
    assert_eq!(slots.len(), 3);
    for slot in slots.iter() {
        let uniforms = slot.uniform_buffer();
        assert_eq!(
            uniforms.size(),
            std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize
        );
        assert!(uniforms.is_host_visible());
        assert!(
            uniforms
                .memory_properties()
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        );
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn pipelines_need_dynamic_rendering() {
    let (_instance, device) = headless_device();
    assert!(!device.has_dynamic_rendering());

    let layout = Arc::new(PipelineLayout::new(&device, &[]).expect("pipeline layout"));
    let attributes = Vertex::attribute_descriptions();
    let desc = GraphicsPipelineDesc::new::<Vertex>(
        &[],
        layout,
        &attributes,
        vk::Format::B8G8R8A8_SRGB,
    );
    assert!(matches!(
        GraphicsPipeline::new(&device, &desc, None),
        Err(CreatePipelineError::DynamicRenderingDisabled)
    ));
}

#[test]
#[ignore = "requires a Vulkan device"]
fn optional_attachment_helpers_report_supported_values() {
    let (instance, device) = headless_device();
    assert_ne!(instance.raw_instance(), vk::Instance::null());
    assert_eq!(device.ash_device().handle(), device.raw_device());

    let depth = device.find_depth_format().expect("a depth format");
    assert!(DEPTH_FORMAT_CANDIDATES.contains(&depth));
    // A single count, TYPE_1 at worst.
    assert!(device.max_usable_sample_count().as_raw().is_power_of_two());
}
