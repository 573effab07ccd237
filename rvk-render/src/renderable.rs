//! Meshes resident on the GPU.

use std::mem::offset_of;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::buffer::GpuBuffer;
use crate::command::CommandBuffer;
use crate::image::GpuImage;
use crate::pipeline::VertexInput;
use crate::resource::{CreateTextureError, ResourceAllocator, UploadError, rgba8_len};
use crate::sampler::{Sampler, SamplerDesc};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl VertexInput for Vertex {
    fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, tex_coord) as u32,
            },
        ]
    }
}

/// Flat vertex and index arrays, as produced by a model loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Pixel data has {actual} bytes, a {width}x{height} RGBA8 image needs {expected}")]
pub struct PixelDataError {
    pub width: u32,
    pub height: u32,
    pub expected: usize,
    pub actual: usize,
}

/// Tightly packed RGBA8 pixels, row-major, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelData {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl PixelData {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, PixelDataError> {
        let expected = rgba8_len(width, height);
        if width == 0 || height == 0 || rgba.len() != expected {
            return Err(PixelDataError {
                width,
                height,
                expected,
                actual: rgba.len(),
            });
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    /// One opaque white pixel.
    pub fn white() -> Self {
        Self {
            width: 1,
            height: 1,
            rgba: vec![255; 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }
}

#[derive(Debug, Error)]
pub enum CreateRenderableError {
    #[error("Mesh has no vertices")]
    NoVertices,
    #[error("Mesh has no indices")]
    NoIndices,
    #[error("Index {index} is out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    #[error("Vertex buffer: {0}")]
    Vertices(UploadError),
    #[error("Index buffer: {0}")]
    Indices(UploadError),
    #[error(transparent)]
    Texture(#[from] CreateTextureError),
    #[error("Vulkan error creating sampler: {0}")]
    Sampler(vk::Result),
}

/// Rejects meshes that would draw nothing or read past the vertex buffer.
fn validate_mesh(mesh: &MeshData) -> Result<(), CreateRenderableError> {
    if mesh.vertices.is_empty() {
        return Err(CreateRenderableError::NoVertices);
    }
    if mesh.indices.is_empty() {
        return Err(CreateRenderableError::NoIndices);
    }
    let vertex_count = mesh.vertices.len();
    if let Some(&index) = mesh.indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(CreateRenderableError::IndexOutOfRange {
            index,
            vertex_count,
        });
    }
    Ok(())
}

/// A sampled texture and the sampler it is read through.
#[derive(Debug)]
pub struct Texture {
    image: GpuImage,
    sampler: Sampler,
}

impl Texture {
    /// Upload `pixels` with a full mip chain and a trilinear sampler.
    pub fn new(
        allocator: &ResourceAllocator,
        pixels: &PixelData,
        name: Option<&str>,
    ) -> Result<Self, CreateRenderableError> {
        let image = allocator.create_texture(
            pixels.rgba(),
            pixels.width(),
            pixels.height(),
            name,
        )?;
        let desc = SamplerDesc::textured(allocator.device(), image.mip_levels());
        let sampler = Sampler::new(allocator.device(), &desc, name)
            .map_err(CreateRenderableError::Sampler)?;
        Ok(Self { image, sampler })
    }

    pub fn image(&self) -> &GpuImage {
        &self.image
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.image.raw_image_view()
    }

    pub fn raw_sampler(&self) -> vk::Sampler {
        self.sampler.raw_sampler()
    }
}

/// Device-local vertex and index buffers, plus an optional texture.
///
/// The staging buffers used to fill them are gone by the time `new`
/// returns.
#[derive(Debug)]
pub struct Renderable {
    vertices: GpuBuffer,
    indices: GpuBuffer,
    index_count: u32,
    texture: Option<Texture>,
}

impl Renderable {
    pub fn new(
        allocator: &ResourceAllocator,
        mesh: &MeshData,
        texture: Option<&PixelData>,
    ) -> Result<Self, CreateRenderableError> {
        validate_mesh(mesh)?;

        let vertices = allocator
            .create_device_local_buffer_with_data(
                bytemuck::cast_slice(&mesh.vertices),
                vk::BufferUsageFlags::VERTEX_BUFFER,
                Some("vertex buffer"),
            )
            .map_err(CreateRenderableError::Vertices)?;
        let indices = allocator
            .create_device_local_buffer_with_data(
                bytemuck::cast_slice(&mesh.indices),
                vk::BufferUsageFlags::INDEX_BUFFER,
                Some("index buffer"),
            )
            .map_err(CreateRenderableError::Indices)?;
        let texture = texture
            .map(|pixels| Texture::new(allocator, pixels, Some("mesh texture")))
            .transpose()?;

        tracing::debug!(
            "Created renderable: {} vertices, {} indices, textured: {}",
            mesh.vertices.len(),
            mesh.indices.len(),
            texture.is_some()
        );
        Ok(Self {
            vertices,
            indices,
            index_count: mesh.indices.len() as u32,
            texture,
        })
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    pub fn vertex_buffer(&self) -> &GpuBuffer {
        &self.vertices
    }

    pub fn index_buffer(&self) -> &GpuBuffer {
        &self.indices
    }

    /// Bind this mesh's buffers and draw all of its indices.
    ///
    /// # Safety
    /// `cmd` must be inside a rendering scope with a pipeline whose vertex
    /// input is [`Vertex`] bound, plus any descriptor sets it needs. The
    /// renderable must outlive the command buffer's execution.
    pub unsafe fn record_draw(&self, cmd: &mut CommandBuffer) {
        // SAFETY: forwarded caller contract; the buffers have vertex and
        // index usage.
        unsafe {
            cmd.bind_vertex_buffer(0, self.vertices.raw_buffer());
            cmd.bind_index_buffer(self.indices.raw_buffer(), vk::IndexType::UINT32);
            cmd.draw_indexed(self.index_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32) -> Vertex {
        Vertex {
            position: [x, 0.0, 0.0],
            color: [1.0, 1.0, 1.0],
            tex_coord: [0.0, 0.0],
        }
    }

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 32);
        let offsets: Vec<_> = Vertex::attribute_descriptions()
            .iter()
            .map(|a| (a.location, a.offset))
            .collect();
        assert_eq!(offsets, vec![(0, 0), (1, 12), (2, 24)]);
    }

    #[test]
    fn empty_meshes_are_rejected() {
        let no_vertices = MeshData {
            vertices: Vec::new(),
            indices: vec![0],
        };
        assert!(matches!(
            validate_mesh(&no_vertices),
            Err(CreateRenderableError::NoVertices)
        ));
        let no_indices = MeshData {
            vertices: vec![vertex(0.0)],
            indices: Vec::new(),
        };
        assert!(matches!(
            validate_mesh(&no_indices),
            Err(CreateRenderableError::NoIndices)
        ));
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mesh = MeshData {
            vertices: vec![vertex(0.0), vertex(1.0), vertex(2.0)],
            indices: vec![0, 1, 3],
        };
        assert!(matches!(
            validate_mesh(&mesh),
            Err(CreateRenderableError::IndexOutOfRange {
                index: 3,
                vertex_count: 3
            })
        ));
        let ok = MeshData {
            indices: vec![0, 1, 2],
            ..mesh
        };
        assert!(validate_mesh(&ok).is_ok());
    }

    #[test]
    fn pixel_data_length_is_validated() {
        assert!(PixelData::new(2, 2, vec![0; 16]).is_ok());
        assert_eq!(
            PixelData::new(2, 2, vec![0; 15]),
            Err(PixelDataError {
                width: 2,
                height: 2,
                expected: 16,
                actual: 15
            })
        );
        assert!(PixelData::new(0, 4, Vec::new()).is_err());
    }

    #[test]
    fn white_pixel_is_one_opaque_texel() {
        let white = PixelData::white();
        assert_eq!((white.width(), white.height()), (1, 1));
        assert_eq!(white.rgba(), &[255, 255, 255, 255]);
    }
}
