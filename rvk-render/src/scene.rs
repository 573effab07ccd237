//! A fixed set of renderables drawn with one textured pipeline.
//!
//! Every (frame slot, renderable) pair gets its own descriptor set, so a
//! slot's uniform buffer can be rewritten while other slots are still
//! executing.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::command::CommandBuffer;
use crate::descriptor::{
    DescriptorPool, DescriptorSetLayout, SCENE_BINDINGS, write_scene_set,
};
use crate::frame::{FrameRecorder, FrameSlots};
use crate::pipeline::{
    CreatePipelineError, GraphicsPipeline, GraphicsPipelineDesc, PipelineLayout,
    VertexInput,
};
use crate::renderable::{CreateRenderableError, PixelData, Renderable, Texture, Vertex};
use crate::resource::ResourceAllocator;
use crate::shader::{ShaderModule, ShaderStage};

/// Column-major model, view and projection matrices, laid out for a
/// `std140` uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

impl Default for UniformBufferObject {
    fn default() -> Self {
        Self {
            model: IDENTITY,
            view: IDENTITY,
            proj: IDENTITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum CreateSceneError {
    #[error("A scene needs at least one renderable")]
    NoRenderables,
    #[error("A scene needs at least one frame slot")]
    NoFrameSlots,
    #[error("Vulkan error creating descriptor set layout: {0}")]
    DescriptorSetLayout(vk::Result),
    #[error("Vulkan error creating descriptor pool: {0}")]
    DescriptorPool(vk::Result),
    #[error("Vulkan error allocating descriptor sets: {0}")]
    DescriptorSets(vk::Result),
    #[error("Vulkan error creating pipeline layout: {0}")]
    PipelineLayout(vk::Result),
    #[error("Invalid shader entry point name: {0}")]
    EntryPoint(#[from] std::ffi::NulError),
    #[error(transparent)]
    Pipeline(#[from] CreatePipelineError),
    #[error("Fallback texture: {0}")]
    FallbackTexture(#[from] CreateRenderableError),
}

/// Position of the set for (`slot`, `renderable`) in the flat set list.
fn set_index(slot: usize, renderable: usize, renderable_count: usize) -> usize {
    slot * renderable_count + renderable
}

/// Renderables, their descriptor sets and the pipeline that draws them.
pub struct Scene {
    // Field order is drop order: pipeline and sets before the layout and
    // pool they were made from, meshes last.
    pipeline: GraphicsPipeline,
    descriptor_sets: Vec<vk::DescriptorSet>,
    _descriptor_pool: DescriptorPool,
    _set_layout: DescriptorSetLayout,
    renderables: Vec<Renderable>,
    _fallback_texture: Texture,
    uniforms: UniformBufferObject,
    clear_color: [f32; 4],
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("pipeline", &self.pipeline)
            .field("renderables", &self.renderables.len())
            .field("descriptor_sets", &self.descriptor_sets.len())
            .finish_non_exhaustive()
    }
}

impl Scene {
    /// Build the pipeline for `color_format` from the `main` entry points
    /// of the two modules, and point one descriptor set per (slot,
    /// renderable) at that slot's uniform buffer and the renderable's
    /// texture (a white texel when it has none).
    pub fn new(
        allocator: &ResourceAllocator,
        slots: &FrameSlots,
        renderables: Vec<Renderable>,
        vertex_shader: &ShaderModule,
        fragment_shader: &ShaderModule,
        color_format: vk::Format,
    ) -> Result<Self, CreateSceneError> {
        if renderables.is_empty() {
            return Err(CreateSceneError::NoRenderables);
        }
        if slots.is_empty() {
            return Err(CreateSceneError::NoFrameSlots);
        }
        let device = allocator.device();

        let set_layout = DescriptorSetLayout::new(device, &SCENE_BINDINGS)
            .map_err(CreateSceneError::DescriptorSetLayout)?;
        let set_count = slots.len() * renderables.len();
        let descriptor_pool =
            DescriptorPool::for_layout(device, &set_layout, set_count as u32)
                .map_err(CreateSceneError::DescriptorPool)?;
        let descriptor_sets = descriptor_pool
            .allocate(&set_layout, set_count)
            .map_err(CreateSceneError::DescriptorSets)?;

        let fallback_texture =
            Texture::new(allocator, &PixelData::white(), Some("fallback texture"))?;

        let uniform_range =
            std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize;
        for (slot_index, slot) in slots.iter().enumerate() {
            for (renderable_index, renderable) in renderables.iter().enumerate() {
                let texture = renderable.texture().unwrap_or(&fallback_texture);
                let set = descriptor_sets
                    [set_index(slot_index, renderable_index, renderables.len())];
                // SAFETY: the sets are fresh, and the buffer, view and sampler
                // are owned by the slots and by this scene, which the caller
                // drops only after the device is idle. Textures finish their
                // upload in SHADER_READ_ONLY_OPTIMAL.
                unsafe {
                    write_scene_set(
                        device,
                        set,
                        (slot.uniform_buffer().raw_buffer(), uniform_range),
                        (texture.raw_image_view(), texture.raw_sampler()),
                    )
                };
            }
        }

        let pipeline_layout = Arc::new(
            PipelineLayout::new(device, &[&set_layout])
                .map_err(CreateSceneError::PipelineLayout)?,
        );
        let stages = [
            vertex_shader.entry_point("main", ShaderStage::Vertex)?,
            fragment_shader.entry_point("main", ShaderStage::Fragment)?,
        ];
        let attributes = Vertex::attribute_descriptions();
        let desc = GraphicsPipelineDesc::new::<Vertex>(
            &stages,
            pipeline_layout,
            &attributes,
            color_format,
        );
        let pipeline = GraphicsPipeline::new(device, &desc, Some("scene pipeline"))?;

        tracing::info!(
            "Scene ready: {} renderables, {} descriptor sets, {:?}",
            renderables.len(),
            descriptor_sets.len(),
            color_format
        );
        Ok(Self {
            pipeline,
            descriptor_sets,
            _descriptor_pool: descriptor_pool,
            _set_layout: set_layout,
            renderables,
            _fallback_texture: fallback_texture,
            uniforms: UniformBufferObject::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        })
    }

    /// Uniforms written into the next frame's slot.
    pub fn set_uniforms(&mut self, uniforms: UniformBufferObject) {
        self.uniforms = uniforms;
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    pub fn renderables(&self) -> &[Renderable] {
        &self.renderables
    }

    pub fn pipeline(&self) -> &GraphicsPipeline {
        &self.pipeline
    }
}

impl FrameRecorder for Scene {
    type Uniform = UniformBufferObject;

    fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    unsafe fn record_draws(&self, cmd: &mut CommandBuffer, slot: usize) {
        let layout = self.pipeline.layout().raw_handle();
        let count = self.renderables.len();
        // SAFETY: the caller has opened a rendering scope for the format
        // this pipeline was built with; every bound object lives in self.
        unsafe {
            cmd.bind_graphics_pipeline(self.pipeline.raw_handle());
            for (index, renderable) in self.renderables.iter().enumerate() {
                cmd.bind_descriptor_sets(
                    layout,
                    0,
                    &[self.descriptor_sets[set_index(slot, index, count)]],
                );
                renderable.record_draw(cmd);
            }
        }
    }

    fn uniforms(&mut self, _slot: usize, _extent: vk::Extent2D) -> UniformBufferObject {
        self.uniforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_is_three_mat4() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 3 * 64);
        let ubo = UniformBufferObject::default();
        let bytes = bytemuck::bytes_of(&ubo);
        // model[0][0], first float of the block.
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn each_slot_and_renderable_gets_its_own_set() {
        let renderables = 3;
        let mut seen = Vec::new();
        for slot in 0..2 {
            for r in 0..renderables {
                seen.push(set_index(slot, r, renderables));
            }
        }
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
    }
}
