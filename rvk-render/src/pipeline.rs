//! Pipeline layouts and graphics pipelines for dynamic rendering.
//!
//! Pipelines are created against attachment formats rather than a render
//! pass. Viewport and scissor are dynamic, so a pipeline survives
//! presentation chain rebuilds as long as the surface format is unchanged.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::DescriptorSetLayout;
use crate::device::Device;
use crate::shader::EntryPoint;

/// Per-vertex layout of a vertex type, for pipeline vertex input.
pub trait VertexInput {
    fn binding_description() -> vk::VertexInputBindingDescription;
    fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription>;
}

/// An owned `VkPipelineLayout`, shareable between pipelines.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// A layout with the given set layouts, in set-number order, and no
    /// push constants.
    pub fn new(
        device: &Arc<Device>,
        set_layouts: &[&DescriptorSetLayout],
    ) -> Result<Self, vk::Result> {
        let raw_layouts: Vec<_> = set_layouts
            .iter()
            .map(|l| l.raw_descriptor_set_layout())
            .collect();
        let create_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_layouts);
        // SAFETY: the set layouts are live and from device.
        let handle = unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: pipelines hold an Arc to their layout, so none remain.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("Device was opened without dynamic rendering")]
    DynamicRenderingDisabled,
    #[error("A graphics pipeline needs a vertex and a fragment stage")]
    MissingStages,
    #[error("Vulkan error creating graphics pipeline: {0}")]
    Vulkan(vk::Result),
}

/// What a [`GraphicsPipeline`] is built from.
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [EntryPoint<'a>],
    pub layout: Arc<PipelineLayout>,
    pub vertex_binding: vk::VertexInputBindingDescription,
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub color_format: vk::Format,
    /// Enables depth test and write against this format.
    pub depth_format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
}

impl<'a> GraphicsPipelineDesc<'a> {
    /// Single-sampled, back-face culled, counter-clockwise front faces,
    /// no depth.
    pub fn new<V: VertexInput>(
        stages: &'a [EntryPoint<'a>],
        layout: Arc<PipelineLayout>,
        vertex_attributes: &'a [vk::VertexInputAttributeDescription],
        color_format: vk::Format,
    ) -> Self {
        Self {
            stages,
            layout,
            vertex_binding: V::binding_description(),
            vertex_attributes,
            color_format,
            depth_format: None,
            samples: vk::SampleCountFlags::TYPE_1,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

/// A graphics pipeline for dynamic rendering with one colour attachment.
pub struct GraphicsPipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    color_format: vk::Format,
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("handle", &self.handle)
            .field("color_format", &self.color_format)
            .finish_non_exhaustive()
    }
}

impl GraphicsPipeline {
    pub fn new(
        device: &Arc<Device>,
        desc: &GraphicsPipelineDesc<'_>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if !device.has_dynamic_rendering() {
            return Err(CreatePipelineError::DynamicRenderingDisabled);
        }
        let has = |stage| desc.stages.iter().any(|ep| ep.stage() == stage);
        if !has(crate::shader::ShaderStage::Vertex)
            || !has(crate::shader::ShaderStage::Fragment)
        {
            return Err(CreatePipelineError::MissingStages);
        }

        let stage_infos: Vec<_> =
            desc.stages.iter().map(EntryPoint::stage_create_info).collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(std::slice::from_ref(&desc.vertex_binding))
            .vertex_attribute_descriptions(desc.vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);
        // Counts are fixed, values come from dynamic state.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(desc.samples);
        let depth_enabled = desc.depth_format.is_some();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_enabled)
            .depth_write_enable(depth_enabled)
            .depth_compare_op(vk::CompareOp::LESS);
        let blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(std::slice::from_ref(&blend_attachment));
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [desc.color_format];
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(
                desc.depth_format.unwrap_or(vk::Format::UNDEFINED),
            );

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout.raw_handle())
            .push_next(&mut rendering);

        // SAFETY: every struct referenced by create_info lives on this stack
        // frame; modules and layout come from device.
        let handle = unsafe { device.create_raw_graphics_pipeline(&create_info) }
            .map_err(CreatePipelineError::Vulkan)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout: Arc::clone(&desc.layout),
            color_format: desc.color_format,
        })
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    /// The colour attachment format this pipeline renders to.
    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: owners wait for idle before dropping pipelines.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}
