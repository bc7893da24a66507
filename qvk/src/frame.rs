//! Frame orchestration: per-frame synchronization, uniform updates, command
//! recording, submission, and presentation.
//!
//! [`FrameEngine`] owns the whole rendering chain for the spinning quad:
//! swapchain, render pass, framebuffers, pipeline, geometry buffers, one
//! uniform slot and descriptor set per swapchain image, and
//! [`MAX_FRAMES_IN_FLIGHT`] frame slots that cycle round-robin. Swapchain
//! staleness reported by acquire or present (or an external resize
//! notification) triggers full recreation of the extent-dependent resources.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::buffer::{
    CreateBufferError, DeviceLocalBuffer, HostVisibleBuffer, UploadBufferError,
    WriteBufferError,
};
use crate::command::{
    AllocateCommandBufferError, CommandBuffer, CommandPool,
    CreateCommandPoolError,
};
use crate::descriptor::{DescriptorPool, DescriptorSet, DescriptorSetLayout};
use crate::device::Device;
use crate::pipeline::{
    CreatePipelineError, CreatePipelineLayoutError, PipelineLayout,
    QuadPipeline, Vertex,
};
use crate::render_pass::{
    CreateFramebufferError, CreateRenderPassError, Framebuffer, RenderPass,
};
use crate::shader::{CreateShaderModuleError, ShaderModule, ShaderStage};
use crate::surface::Surface;
use crate::swapchain::{CreateSwapchainError, Swapchain};
use crate::sync::{
    CreateFenceError, CreateSemaphoreError, Fence, Semaphore, WaitFenceError,
};
use crate::uniform::{Transforms, transforms_at};

/// Number of frames that may be recorded and submitted before the CPU blocks
/// on the oldest frame's fence.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Clear color for the render pass (opaque black).
const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

fn next_frame_index(current: usize) -> usize {
    (current + 1) % MAX_FRAMES_IN_FLIGHT
}

#[derive(Debug, Error)]
pub enum CreateFrameEngineError {
    #[error("Failed to create command pool: {0}")]
    CommandPool(#[from] CreateCommandPoolError),

    #[error("Failed to create swapchain: {0}")]
    Swapchain(#[from] CreateSwapchainError),

    #[error("Failed to create render pass: {0}")]
    RenderPass(#[from] CreateRenderPassError),

    #[error("Failed to create framebuffer: {0}")]
    Framebuffer(#[from] CreateFramebufferError),

    #[error("Failed to create shader module: {0}")]
    ShaderModule(#[from] CreateShaderModuleError),

    #[error("Shader entry point name contains a NUL byte")]
    InvalidEntryPointName,

    #[error("Failed to create pipeline layout: {0}")]
    PipelineLayout(#[from] CreatePipelineLayoutError),

    #[error("Failed to create pipeline: {0}")]
    Pipeline(#[from] CreatePipelineError),

    #[error("Failed to create buffer: {0}")]
    Buffer(#[from] CreateBufferError),

    #[error("Failed to upload geometry: {0}")]
    Upload(#[from] UploadBufferError),

    #[error("Vulkan error setting up descriptors: {0}")]
    Descriptors(vk::Result),

    #[error("Failed to create fence: {0}")]
    Fence(#[from] CreateFenceError),

    #[error("Failed to create semaphore: {0}")]
    Semaphore(#[from] CreateSemaphoreError),

    #[error("Failed to allocate command buffer: {0}")]
    CommandBuffer(#[from] AllocateCommandBufferError),

    #[error("Vulkan error waiting for device idle: {0}")]
    WaitIdle(vk::Result),
}

#[derive(Debug, Error)]
pub enum DrawFrameError {
    #[error("Failed waiting on frame fence: {0}")]
    WaitFence(#[from] WaitFenceError),

    #[error("Vulkan error acquiring swapchain image: {0}")]
    Acquire(vk::Result),

    #[error("Vulkan error resetting frame fence: {0}")]
    ResetFence(vk::Result),

    #[error("Failed to write uniform slot: {0}")]
    WriteUniform(#[from] WriteBufferError),

    #[error("Vulkan error recording frame commands: {0}")]
    Record(vk::Result),

    #[error("Vulkan error submitting frame: {0}")]
    Submit(vk::Result),

    #[error("Vulkan error presenting frame: {0}")]
    Present(vk::Result),

    #[error("Failed to recreate presentation resources: {0}")]
    Recreate(#[from] CreateFrameEngineError),
}

/// Synchronization and command state for one in-flight frame.
struct FrameSlot {
    image_available: Semaphore,
    render_finished: Semaphore,
    /// Created signaled so the first wait on each slot passes immediately.
    in_flight: Fence,
    command_buffer: CommandBuffer,
}

impl FrameSlot {
    fn new(
        device: &Arc<Device>,
        pool: &CommandPool,
    ) -> Result<Self, CreateFrameEngineError> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            in_flight: Fence::new(device, true)?,
            command_buffer: pool.allocate_command_buffer()?,
        })
    }
}

/// Drives the per-frame render loop for the spinning quad.
///
/// Field order follows Vulkan teardown requirements: descriptor sets and
/// uniform slots before their pool and layout, the pipeline before its
/// layout, framebuffers before the swapchain whose views they reference.
pub struct FrameEngine<T: HasDisplayHandle + HasWindowHandle> {
    frames: Vec<FrameSlot>,
    descriptor_sets: Vec<DescriptorSet>,
    descriptor_pool: DescriptorPool,
    uniform_slots: Vec<HostVisibleBuffer>,
    pipeline: QuadPipeline,
    set_layout: DescriptorSetLayout,
    framebuffers: Vec<Framebuffer>,
    render_pass: RenderPass,
    swapchain: Swapchain<T>,
    vertex_buffer: DeviceLocalBuffer,
    index_buffer: DeviceLocalBuffer,
    index_count: u32,
    command_pool: CommandPool,
    surface: Arc<Surface<T>>,
    device: Arc<Device>,
    /// Kept so the pipeline can be rebuilt on swapchain recreation.
    vert_spirv: Vec<u8>,
    frag_spirv: Vec<u8>,
    current_frame: usize,
    resized: bool,
    started: Instant,
}

impl<T: HasDisplayHandle + HasWindowHandle> FrameEngine<T> {
    /// Build the full rendering chain and upload the geometry.
    ///
    /// Blocks on the graphics queue while the vertex and index data are
    /// staged to device-local memory.
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        desired_extent: vk::Extent2D,
        vert_spirv: Vec<u8>,
        frag_spirv: Vec<u8>,
        vertices: &[Vertex],
        indices: &[u16],
    ) -> Result<Self, CreateFrameEngineError> {
        let command_pool =
            CommandPool::new(device, device.graphics_queue_family())?;

        let swapchain = Swapchain::new(device, surface, desired_extent)?;
        let render_pass = RenderPass::new(device, swapchain.format())?;
        let framebuffers =
            build_framebuffers(device, &render_pass, &swapchain)?;

        let set_layout = DescriptorSetLayout::single_vertex_uniform(device)
            .map_err(CreateFrameEngineError::Descriptors)?;
        let layout = Arc::new(PipelineLayout::new(device, &[&set_layout])?);
        let pipeline = build_pipeline(
            device,
            &vert_spirv,
            &frag_spirv,
            &render_pass,
            swapchain.extent(),
            Arc::clone(&layout),
        )?;

        let mut vertex_buffer = DeviceLocalBuffer::new(
            device,
            std::mem::size_of_val(vertices) as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            "quad vertices",
        )?;
        vertex_buffer
            .upload_bytes(&command_pool, bytemuck::cast_slice(vertices))?;

        let mut index_buffer = DeviceLocalBuffer::new(
            device,
            std::mem::size_of_val(indices) as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            "quad indices",
        )?;
        index_buffer
            .upload_bytes(&command_pool, bytemuck::cast_slice(indices))?;

        let (uniform_slots, descriptor_pool, descriptor_sets) =
            build_uniform_slots(device, &set_layout, swapchain.image_count())?;

        let frames = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSlot::new(device, &command_pool))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            frames,
            descriptor_sets,
            descriptor_pool,
            uniform_slots,
            pipeline,
            set_layout,
            framebuffers,
            render_pass,
            swapchain,
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            command_pool,
            surface: Arc::clone(surface),
            device: Arc::clone(device),
            vert_spirv,
            frag_spirv,
            current_frame: 0,
            resized: false,
            started: Instant::now(),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Mark the presentation chain stale because the window was resized.
    ///
    /// Recreation happens lazily at the end of the next presented frame.
    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    /// Render and present one frame.
    ///
    /// `window_extent` is the current window size, used when the swapchain
    /// has to be recreated. A frame may be skipped entirely when acquire
    /// reports the swapchain out of date; the caller should simply request
    /// the next redraw.
    pub fn draw_frame(
        &mut self,
        window_extent: vk::Extent2D,
    ) -> Result<(), DrawFrameError> {
        let slot_index = self.current_frame;
        let image_available =
            self.frames[slot_index].image_available.raw_semaphore();
        let render_finished =
            self.frames[slot_index].render_finished.raw_semaphore();
        let in_flight = self.frames[slot_index].in_flight.raw_fence();

        self.frames[slot_index].in_flight.wait(u64::MAX)?;

        // SAFETY: image_available is unsignaled. The fence wait above
        // guarantees the previous use of this slot's semaphore has completed.
        let acquired = unsafe {
            self.swapchain.acquire_next_image(
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };
        let (image_index, _acquire_suboptimal) = match acquired {
            Ok(pair) => pair,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // Nothing was submitted, so the fence stays signaled for the
                // next attempt on this slot.
                self.recreate(window_extent)?;
                return Ok(());
            }
            Err(e) => return Err(DrawFrameError::Acquire(e)),
        };

        // Only reset once we are committed to submitting work that will
        // re-signal it.
        // SAFETY: the wait above completed, so the fence is not pending.
        unsafe { self.frames[slot_index].in_flight.reset() }
            .map_err(DrawFrameError::ResetFence)?;

        let extent = self.swapchain.extent();
        let aspect = extent.width as f32 / extent.height as f32;
        let transforms =
            transforms_at(self.started.elapsed().as_secs_f32(), aspect);
        self.uniform_slots[image_index as usize].write_pod(&[transforms])?;

        self.record_frame_commands(slot_index, image_index)
            .map_err(DrawFrameError::Record)?;

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers =
            [self.frames[slot_index].command_buffer.raw_command_buffer()];
        let signal_semaphores = [render_finished];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // SAFETY: the command buffer is executable, image_available has a
        // pending signal from the acquire, render_finished is unsignaled,
        // and in_flight was reset above.
        unsafe {
            self.device
                .submit_graphics(std::slice::from_ref(&submit_info), in_flight)
        }
        .map_err(DrawFrameError::Submit)?;

        let swapchains = [self.swapchain.raw_handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: render_finished has a pending signal from the submit above
        // and the render pass leaves the image in PRESENT_SRC_KHR.
        let present_result =
            unsafe { self.device.queue_present(&present_info) };
        let stale = match present_result {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(DrawFrameError::Present(e)),
        };

        if stale || self.resized {
            self.resized = false;
            self.recreate(window_extent)?;
        }

        self.current_frame = next_frame_index(self.current_frame);
        Ok(())
    }

    fn record_frame_commands(
        &mut self,
        slot_index: usize,
        image_index: u32,
    ) -> Result<(), vk::Result> {
        let cmd = &mut self.frames[slot_index].command_buffer;
        let extent = self.swapchain.extent();

        // SAFETY: the in-flight fence wait in draw_frame guarantees this
        // slot's previous submission has completed, so the buffer is not
        // pending.
        unsafe { cmd.reset() }?;
        // SAFETY: the buffer was just reset to the initial state.
        unsafe { cmd.begin() }?;
        // SAFETY: the buffer is recording; the framebuffer was built against
        // this render pass at the current extent.
        unsafe {
            cmd.begin_render_pass(
                &self.render_pass,
                &self.framebuffers[image_index as usize],
                extent,
                CLEAR_COLOR,
            )
        };
        // SAFETY: recording inside a render pass; all bound objects derive
        // from self.device and outlive the submission.
        unsafe {
            cmd.bind_graphics_pipeline(self.pipeline.raw_pipeline());
            cmd.bind_vertex_buffer(0, &self.vertex_buffer, 0);
            cmd.bind_index_buffer(&self.index_buffer, 0, vk::IndexType::UINT16);
            cmd.bind_descriptor_set(
                self.pipeline.layout().raw_pipeline_layout(),
                self.descriptor_sets[image_index as usize]
                    .raw_descriptor_set(),
            );
            cmd.draw_indexed(self.index_count, 1, 0, 0, 0);
            cmd.end_render_pass();
        }
        // SAFETY: the buffer is in the recording state.
        unsafe { cmd.end() }?;
        Ok(())
    }

    /// Tear down and rebuild everything that depends on the swapchain
    /// extent: swapchain, render pass, framebuffers, pipeline, and (when the
    /// image count changes) the uniform slots and descriptor sets. Sync
    /// objects, geometry buffers, and the command pool are preserved.
    ///
    /// A zero-sized `window_extent` (minimized window) defers recreation:
    /// the stale flag stays set and the next frame with a real size retries.
    fn recreate(
        &mut self,
        window_extent: vk::Extent2D,
    ) -> Result<(), CreateFrameEngineError> {
        if window_extent.width == 0 || window_extent.height == 0 {
            self.resized = true;
            return Ok(());
        }

        self.device
            .wait_idle()
            .map_err(CreateFrameEngineError::WaitIdle)?;

        let new_swapchain = Swapchain::new_with_old(
            &self.device,
            &self.surface,
            window_extent,
            Some(&self.swapchain),
        )?;
        // Old framebuffers reference the old swapchain's views; drop them
        // before the old swapchain.
        self.framebuffers.clear();
        self.swapchain = new_swapchain;

        self.render_pass =
            RenderPass::new(&self.device, self.swapchain.format())?;
        self.framebuffers = build_framebuffers(
            &self.device,
            &self.render_pass,
            &self.swapchain,
        )?;
        self.pipeline = build_pipeline(
            &self.device,
            &self.vert_spirv,
            &self.frag_spirv,
            &self.render_pass,
            self.swapchain.extent(),
            Arc::clone(self.pipeline.layout()),
        )?;

        // The driver may hand back a different image count at the new
        // extent. Uniform slots and descriptor sets are keyed by image
        // index, so they must match.
        if self.uniform_slots.len() != self.swapchain.image_count() {
            let (uniform_slots, descriptor_pool, descriptor_sets) =
                build_uniform_slots(
                    &self.device,
                    &self.set_layout,
                    self.swapchain.image_count(),
                )?;
            self.descriptor_sets = descriptor_sets;
            self.uniform_slots = uniform_slots;
            self.descriptor_pool = descriptor_pool;
        }

        tracing::info!(
            "Recreated presentation chain at {}x{} ({} images)",
            self.swapchain.extent().width,
            self.swapchain.extent().height,
            self.swapchain.image_count(),
        );

        Ok(())
    }

    /// Block until the device has finished all work submitted by this
    /// engine. Must be called before dropping the engine while frames may
    /// still be in flight.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        self.device.wait_idle()
    }
}

fn build_framebuffers<T: HasDisplayHandle + HasWindowHandle>(
    device: &Arc<Device>,
    render_pass: &RenderPass,
    swapchain: &Swapchain<T>,
) -> Result<Vec<Framebuffer>, CreateFramebufferError> {
    swapchain
        .image_views()
        .iter()
        .map(|&view| {
            Framebuffer::new(device, render_pass, view, swapchain.extent())
        })
        .collect()
}

fn build_pipeline(
    device: &Arc<Device>,
    vert_spirv: &[u8],
    frag_spirv: &[u8],
    render_pass: &RenderPass,
    extent: vk::Extent2D,
    layout: Arc<PipelineLayout>,
) -> Result<QuadPipeline, CreateFrameEngineError> {
    let vert_module = ShaderModule::new(device, vert_spirv)?;
    let frag_module = ShaderModule::new(device, frag_spirv)?;
    let vert_entry = vert_module
        .entry_point("main", ShaderStage::Vertex)
        .map_err(|_| CreateFrameEngineError::InvalidEntryPointName)?;
    let frag_entry = frag_module
        .entry_point("main", ShaderStage::Fragment)
        .map_err(|_| CreateFrameEngineError::InvalidEntryPointName)?;
    // The modules are dropped at the end of this scope; the compiled
    // pipeline does not reference them afterwards.
    Ok(QuadPipeline::new(
        device,
        &vert_entry,
        &frag_entry,
        render_pass,
        extent,
        layout,
    )?)
}

fn build_uniform_slots(
    device: &Arc<Device>,
    set_layout: &DescriptorSetLayout,
    image_count: usize,
) -> Result<
    (Vec<HostVisibleBuffer>, DescriptorPool, Vec<DescriptorSet>),
    CreateFrameEngineError,
> {
    let uniform_size = std::mem::size_of::<Transforms>() as vk::DeviceSize;
    let uniform_slots = (0..image_count)
        .map(|_| {
            HostVisibleBuffer::new(
                device,
                uniform_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                "frame transforms",
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let descriptor_pool =
        DescriptorPool::for_uniform_buffers(device, image_count as u32)
            .map_err(CreateFrameEngineError::Descriptors)?;
    let layouts: Vec<&DescriptorSetLayout> =
        std::iter::repeat_n(set_layout, image_count).collect();
    let descriptor_sets = descriptor_pool
        .allocate_sets(&layouts)
        .map_err(CreateFrameEngineError::Descriptors)?;

    for (set, slot) in descriptor_sets.iter().zip(&uniform_slots) {
        // SAFETY: slot is a valid uniform buffer from this device, the range
        // equals its full size, and the slot outlives every submission that
        // binds the set.
        unsafe { set.write_uniform_buffer(device, 0, slot, uniform_size) };
    }

    Ok((uniform_slots, descriptor_pool, descriptor_sets))
}

impl<T: HasDisplayHandle + HasWindowHandle> Drop for FrameEngine<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping frame engine");
        // Frames may still be executing on the GPU; drain them before the
        // field drops destroy the resources they reference.
        if let Err(e) = self.device.wait_idle() {
            tracing::error!(
                "Error waiting for device idle during frame engine drop: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_cycles_round_robin() {
        let mut index = 0;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(index);
            index = next_frame_index(index);
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }
}
