//! Fixed-function graphics pipeline for drawing colored geometry.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::descriptor::DescriptorSetLayout;
use crate::device::Device;
use crate::render_pass::RenderPass;
use crate::shader::{EntryPoint, ShaderStage};

/// A vertex with a 2D position and an RGB color, matching the vertex shader
/// inputs at locations 0 and 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(pos: [f32; 2], color: [f32; 3]) -> Self {
        Self { pos, color }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2]
    {
        [
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, pos) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, color) as u32),
        ]
    }
}

#[derive(Debug, Error)]
pub enum CreatePipelineLayoutError {
    #[error("Vulkan error creating pipeline layout: {0}")]
    Vulkan(#[from] vk::Result),
}

/// An owned wrapper around a `VkPipelineLayout`.
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
    pub fn new(
        device: &Arc<Device>,
        set_layouts: &[&DescriptorSetLayout],
    ) -> Result<Self, CreatePipelineLayoutError> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> = set_layouts
            .iter()
            .map(|l| l.raw_descriptor_set_layout())
            .collect();
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&raw_layouts);
        // SAFETY: create_info references valid set layouts created from
        // device, live for the duration of the call.
        let handle =
            unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_pipeline_layout(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        //SAFETY: No pipeline using this layout may still be alive.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error(
        "Entry points have wrong stages (vertex: {vertex:?}, \
         fragment: {fragment:?})"
    )]
    WrongStages {
        vertex: ShaderStage,
        fragment: ShaderStage,
    },

    #[error("Vulkan error creating graphics pipeline: {0}")]
    Vulkan(#[from] vk::Result),
}

/// The fixed-function pipeline drawing the colored quad.
///
/// Viewport and scissor are baked in at creation time, so the pipeline must
/// be rebuilt whenever the swapchain extent changes.
pub struct QuadPipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl std::fmt::Debug for QuadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuadPipeline")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl QuadPipeline {
    /// Build the pipeline against `render_pass` subpass 0 with a static
    /// viewport covering `extent`.
    ///
    /// Input assembly is a triangle list; back faces are culled with
    /// counter-clockwise front winding; no blending, depth, or dynamic state.
    pub fn new(
        device: &Arc<Device>,
        vertex: &EntryPoint<'_>,
        fragment: &EntryPoint<'_>,
        render_pass: &RenderPass,
        extent: vk::Extent2D,
        layout: Arc<PipelineLayout>,
    ) -> Result<Self, CreatePipelineError> {
        if vertex.stage() != ShaderStage::Vertex
            || fragment.stage() != ShaderStage::Fragment
        {
            return Err(CreatePipelineError::WrongStages {
                vertex: vertex.stage(),
                fragment: fragment.stage(),
            });
        }

        let stages = [
            vertex.as_pipeline_stage_create_info(),
            fragment.as_pipeline_stage_create_info(),
        ];

        let binding_descriptions = [Vertex::binding_description()];
        let attribute_descriptions = Vertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
                .primitive_restart_enable(false);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization =
            vk::PipelineRasterizationStateCreateInfo::default()
                .depth_clamp_enable(false)
                .rasterizer_discard_enable(false)
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(vk::CullModeFlags::BACK)
                .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
                .depth_bias_enable(false)
                .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let color_blend_attachments =
            [vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .layout(layout.raw_pipeline_layout())
            .render_pass(render_pass.raw_render_pass())
            .subpass(0);

        // SAFETY: create_info references valid shader stages, layout, and
        // render pass, all derived from device; the borrowed state structs
        // outlive the call.
        let handle =
            unsafe { device.create_raw_graphics_pipeline(&create_info) }?;

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout,
        })
    }

    pub fn raw_pipeline(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl Drop for QuadPipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        //SAFETY: No in-flight GPU work may still reference this pipeline.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_stride_covers_position_and_color() {
        let binding = Vertex::binding_description();
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.stride, 20);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);
    }

    #[test]
    fn vertex_attributes_match_shader_locations() {
        let [pos, color] = Vertex::attribute_descriptions();

        assert_eq!(pos.location, 0);
        assert_eq!(pos.format, vk::Format::R32G32_SFLOAT);
        assert_eq!(pos.offset, 0);

        assert_eq!(color.location, 1);
        assert_eq!(color.format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(color.offset, 8);
    }
}
