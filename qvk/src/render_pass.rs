//! Render pass and framebuffer wrappers for presenting to a swapchain.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateRenderPassError {
    #[error("Vulkan error creating render pass: {0}")]
    Vulkan(#[from] vk::Result),
}

/// A single-subpass render pass with one color attachment that is cleared on
/// load and left in `PRESENT_SRC_KHR` layout for presentation.
///
/// An external subpass dependency on the color-attachment-output stage delays
/// the clear until the presentation engine has released the image, so the
/// acquire semaphore wait at that stage is sufficient synchronization.
pub struct RenderPass {
    parent: Arc<Device>,
    handle: vk::RenderPass,
    color_format: vk::Format,
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("color_format", &self.color_format)
            .finish_non_exhaustive()
    }
}

impl RenderPass {
    pub fn new(
        device: &Arc<Device>,
        color_format: vk::Format,
    ) -> Result<Self, CreateRenderPassError> {
        let color_attachment = vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let color_attachment_ref = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

        let subpass = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachment_ref)];

        let dependency = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )];

        let attachments = [color_attachment];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpass)
            .dependencies(&dependency);

        // SAFETY: create_info references only stack-local descriptions that
        // outlive the call.
        let handle = unsafe { device.create_raw_render_pass(&create_info) }?;

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            color_format,
        })
    }

    pub fn raw_render_pass(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        tracing::debug!("Dropping render pass {:?}", self.handle);
        //SAFETY: All framebuffers and pipelines created against this render
        //pass must already be dropped.
        unsafe { self.parent.destroy_raw_render_pass(self.handle) };
    }
}

#[derive(Debug, Error)]
pub enum CreateFramebufferError {
    #[error("Vulkan error creating framebuffer: {0}")]
    Vulkan(#[from] vk::Result),
}

/// A framebuffer binding one swapchain image view to a [`RenderPass`].
///
/// The image view is borrowed, not owned: the swapchain that owns it must
/// outlive this framebuffer.
pub struct Framebuffer {
    parent: Arc<Device>,
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    pub fn new(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        color_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<Self, CreateFramebufferError> {
        let attachments = [color_view];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.raw_render_pass())
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        // SAFETY: render_pass and color_view are valid objects derived from
        // device; the create info lives on the stack for the call.
        let handle = unsafe { device.create_raw_framebuffer(&create_info) }?;

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            extent,
        })
    }

    pub fn raw_framebuffer(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping framebuffer {:?}", self.handle);
        //SAFETY: No in-flight GPU work may still reference this framebuffer.
        unsafe { self.parent.destroy_raw_framebuffer(self.handle) };
    }
}
