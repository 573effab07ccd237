//! Upload paths against a real driver.
//!
//! Run with `cargo test -p rvk-render -- --ignored` on a machine with a
//! Vulkan 1.1+ device. No window is needed.

use std::sync::Arc;

use rvk_render::ash::vk;
use rvk_render::buffer::{CreateBufferError, GpuBuffer};
use rvk_render::command::{CommandPool, submit_one_shot};
use rvk_render::device::{Device, DeviceConfig};
use rvk_render::image::{ImageDesc, LayoutTransitionError};
use rvk_render::instance::{Instance, InstanceExtensions};
use rvk_render::log::VulkanLogLevel;
use rvk_render::renderable::{MeshData, PixelData, Renderable, Vertex};
use rvk_render::resource::{ResourceAllocator, UploadError};

fn headless_allocator() -> ResourceAllocator {
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
    ResourceAllocator::new(&device).expect("upload command pool")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) + 7) as u8).collect()
}

/// Upload into device-local memory, copy back into a host-visible mirror
/// and read the mirror.
fn round_trip(allocator: &ResourceAllocator, data: &[u8]) -> Vec<u8> {
    let len = data.len() as vk::DeviceSize;
    let device_local = allocator
        .create_buffer(
            len,
            vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some("round trip target"),
        )
        .expect("device-local buffer");
    allocator
        .upload_via_staging(&device_local, data)
        .expect("staged upload");

    let mirror = allocator
        .create_buffer(
            len,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some("round trip mirror"),
        )
        .expect("mirror buffer");
    let device = allocator.device();
    let pool = CommandPool::new(device, device.graphics_queue_family(), None)
        .expect("readback pool");
    submit_one_shot(&pool, |cmd| {
        // SAFETY: both buffers are live for the blocking submit.
        unsafe {
            cmd.copy_buffer(
                device_local.raw_buffer(),
                mirror.raw_buffer(),
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: len,
                }],
            )
        };
    })
    .expect("readback copy");

    let mut out = vec![0u8; data.len()];
    allocator
        .read_host_visible(&mirror, 0, &mut out)
        .expect("mirror read");
    out
}

#[test]
#[ignore = "requires a Vulkan device"]
fn staged_uploads_round_trip() {
    let allocator = headless_allocator();
    for len in [1, 4096, 16 * 1024 * 1024] {
        let data = pattern(len);
        assert!(round_trip(&allocator, &data) == data, "mismatch at {len} bytes");
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn zero_sized_resources_are_rejected() {
    let allocator = headless_allocator();
    assert!(matches!(
        allocator.create_buffer(
            0,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            None,
        ),
        Err(CreateBufferError::ZeroSize)
    ));

    let target = allocator
        .create_buffer(
            16,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            None,
        )
        .expect("buffer");
    assert!(matches!(
        allocator.upload_via_staging(&target, &[]),
        Err(UploadError::Empty)
    ));
    assert!(matches!(
        allocator.upload_via_staging(&target, &[0; 17]),
        Err(UploadError::TooLarge {
            len: 17,
            capacity: 16
        })
    ));
}

#[test]
#[ignore = "requires a Vulkan device"]
fn host_visible_writes_are_bounds_checked() {
    let allocator = headless_allocator();
    let mut buffer = GpuBuffer::new(
        allocator.device(),
        64,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        vk::MemoryPropertyFlags::HOST_VISIBLE,
        None,
    )
    .expect("host-visible buffer");
    allocator
        .copy_to_host_visible(&mut buffer, &[1, 2, 3, 4], 60)
        .expect("in-range write");
    assert!(
        allocator
            .copy_to_host_visible(&mut buffer, &[1, 2, 3, 4], 61)
            .is_err()
    );

    let mut back = [0u8; 4];
    allocator
        .read_host_visible(&buffer, 60, &mut back)
        .expect("read back");
    assert_eq!(back, [1, 2, 3, 4]);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn textures_get_a_full_mip_chain() {
    let allocator = headless_allocator();
    let pixels = vec![128u8; 256 * 256 * 4];
    let texture = allocator
        .create_texture(&pixels, 256, 256, Some("test texture"))
        .expect("texture upload");
    assert_eq!(texture.mip_levels(), 9);
    assert_eq!(texture.format(), vk::Format::R8G8B8A8_SRGB);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn unsupported_transitions_fail_before_submission() {
    let allocator = headless_allocator();
    let image = allocator
        .create_image(
            ImageDesc::color_2d(
                4,
                4,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            ),
            None,
        )
        .expect("image");
    assert!(matches!(
        allocator.transition_image_layout(
            &image,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ),
        Err(UploadError::Transition(
            LayoutTransitionError::UnsupportedTransition { .. }
        ))
    ));
}

#[test]
#[ignore = "requires a Vulkan device"]
fn renderables_upload_geometry_into_device_local_buffers() {
    let allocator = headless_allocator();
    let vertex = |x: f32| Vertex {
        position: [x, 0.0, 0.0],
        color: [1.0, 1.0, 1.0],
        tex_coord: [0.0, 0.0],
    };
    let mesh = MeshData {
        vertices: vec![vertex(0.0), vertex(1.0), vertex(2.0)],
        indices: vec![0, 1, 2],
    };

    let plain = Renderable::new(&allocator, &mesh, None).expect("renderable");
    assert_eq!(plain.index_count(), 3);
    assert!(plain.texture().is_none());
    assert_eq!(plain.vertex_buffer().size(), 3 * 32);
    assert!(
        plain
            .vertex_buffer()
            .usage()
            .contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
    );
    assert_eq!(plain.index_buffer().size(), 3 * 4);
    assert!(
        plain
            .index_buffer()
            .usage()
            .contains(vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
    );
    assert!(
        plain
            .vertex_buffer()
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    );

    let pixels = PixelData::new(2, 2, vec![200; 16]).expect("pixels");
    let textured = Renderable::new(&allocator, &mesh, Some(&pixels)).expect("textured");
    let texture = textured.texture().expect("texture");
    assert_eq!(texture.image().mip_levels(), 2);
}
