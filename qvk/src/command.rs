use std::{
    marker::PhantomData,
    sync::{Arc, mpsc},
};

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::device::Device;
use crate::render_pass::{Framebuffer, RenderPass};

pub trait CommandBufferHandle {
    fn raw_command_buffer(&self) -> vk::CommandBuffer;
}

impl<T> CommandBufferHandle for &T
where
    T: CommandBufferHandle + ?Sized,
{
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        (*self).raw_command_buffer()
    }
}

impl<T> CommandBufferHandle for &mut T
where
    T: CommandBufferHandle + ?Sized,
{
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        (**self).raw_command_buffer()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// CommandPoolShared — private inner state co-owned by pool and its buffers
// ---------------------------------------------------------------------------

/// Shared ownership of the raw Vulkan pool handle.
///
/// Held via `Arc` by both [`CommandPool`] and every [`CommandBuffer`]
/// allocated from it. The Vulkan pool is not destroyed until all of those
/// `Arc` clones are dropped, which prevents a command buffer from holding a
/// handle into a destroyed pool.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: pool was created from parent and is being destroyed. This
        // runs only when both CommandPool and every CommandBuffer allocated
        // from it have been dropped. vkDestroyCommandPool implicitly frees
        // all allocated command buffers.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

// ---------------------------------------------------------------------------
// CommandPool
// ---------------------------------------------------------------------------

/// An owned command pool that allocates individually-resettable
/// command buffers.
///
/// The pool is created with `RESET_COMMAND_BUFFER`, allowing each allocated
/// command buffer to be reset individually via [`CommandBuffer::reset`].
///
/// `CommandPool` is `!Sync`: it cannot be shared across threads. The Vulkan
/// spec requires external synchronization for pool-level operations
/// (`vkAllocateCommandBuffers`); by being `!Sync` this is guaranteed
/// structurally rather than with a mutex. If cross-thread sharing is needed,
/// synchronize at a higher level.
///
/// The underlying Vulkan pool is not destroyed until both this wrapper and
/// every [`CommandBuffer`] allocated from it are dropped.
pub struct CommandPool {
    shared: Arc<CommandPoolShared>,
    /// Cloned into each newly allocated [`CommandBuffer`] so that dropping a
    /// buffer sends its handle back for recycling.
    sender: mpsc::Sender<vk::CommandBuffer>,
    /// Receives handles returned by dropped [`CommandBuffer`]s. Only drained
    /// by `allocate_command_buffer` on the pool-owning thread. `Receiver` is
    /// `!Sync`, making `CommandPool` structurally `!Sync` regardless of the
    /// `PhantomData` below.
    receiver: mpsc::Receiver<vk::CommandBuffer>,
    /// Explicit `!Sync` marker documenting the design intent. Redundant with
    /// `Receiver` but kept for clarity.
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    /// Create a resettable command pool for the given queue family.
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: create_info uses a valid queue family index for this device.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        let (sender, receiver) = mpsc::channel();

        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            sender,
            receiver,
            _not_sync: PhantomData,
        })
    }

    /// Allocate a single primary command buffer from this pool.
    ///
    /// All handles that were returned to the pool's channel (by previously
    /// dropped [`CommandBuffer`]s) are drained. One is recycled for the
    /// caller; any surplus handles are freed via `vkFreeCommandBuffers` to
    /// return their memory to the pool's allocator and bound peak usage. If
    /// no returned handles are available a new buffer is allocated from
    /// Vulkan.
    ///
    /// In all cases the returned buffer may not be in the initial state and
    /// **must be reset before recording**.
    ///
    /// The returned buffer holds a clone of the pool's shared inner `Arc`,
    /// so the underlying Vulkan pool is kept alive until both this pool and
    /// all its buffers are dropped.
    pub fn allocate_command_buffer(
        &self,
    ) -> Result<CommandBuffer, AllocateCommandBufferError> {
        // Drain all returned handles. Recycle one; free the rest to return
        // their memory to the pool's allocator and prevent runaway growth.
        let mut returned: Vec<vk::CommandBuffer> =
            std::iter::from_fn(|| self.receiver.try_recv().ok()).collect();

        let handle = if let Some(recycled) = returned.pop() {
            if !returned.is_empty() {
                // SAFETY: All handles in `returned` were allocated from
                // self.shared.pool. The drop→send contract requires callers
                // not to drop a CommandBuffer while its GPU work is still
                // executing, so every handle here is idle. External
                // synchronization on the pool is guaranteed by CommandPool
                // being !Sync — only the owning thread can reach this call
                // site.
                unsafe {
                    self.shared
                        .parent
                        .free_raw_command_buffers(self.shared.pool, &returned)
                };
            }
            recycled
        } else {
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.shared.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            // SAFETY: allocate_info references a valid pool created from
            // parent. CommandPool is !Sync so no concurrent pool access is
            // possible.
            unsafe {
                self.shared
                    .parent
                    .allocate_raw_command_buffers(&allocate_info)
            }
            .map(|mut bufs| {
                debug_assert_eq!(bufs.len(), 1);
                bufs.remove(0)
            })
            .map_err(AllocateCommandBufferError::Vulkan)?
        };

        Ok(CommandBuffer {
            _pool: Arc::clone(&self.shared),
            parent: Arc::clone(&self.shared.parent),
            handle,
            return_sender: self.sender.clone(),
        })
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.shared.pool
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.shared.parent
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// A primary command buffer allocated from a [`CommandPool`].
///
/// All recording operations (`reset`, `begin`, `end`) are `unsafe` — the
/// caller is responsible for correct Vulkan state sequencing.
///
/// On drop, the raw handle is sent back to the pool's return channel for
/// recycling. If the pool has already been dropped the send is silently
/// discarded; `vkDestroyCommandPool` handles cleanup via
/// [`CommandPoolShared`].
pub struct CommandBuffer {
    /// Keeps the pool alive until this buffer is dropped.
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    /// Returns the handle to the pool's channel on drop.
    return_sender: mpsc::Sender<vk::CommandBuffer>,
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // Send the handle back for recycling. If the receiver (pool) has been
        // dropped the error is intentionally ignored — the handle will be
        // freed implicitly when CommandPoolShared (and its
        // vkDestroyCommandPool) runs.
        let _ = self.return_sender.send(self.handle);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    /// Reset this buffer to the initial state.
    ///
    /// # Safety
    /// The buffer must not be pending execution on the GPU.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is not pending.
        unsafe {
            self.parent.reset_raw_command_buffer(
                self.handle,
                vk::CommandBufferResetFlags::empty(),
            )
        }
    }

    /// Begin recording.
    ///
    /// # Safety
    /// The buffer must be in the initial state (freshly allocated or reset).
    pub unsafe fn begin(&mut self) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default();
        // SAFETY: Caller guarantees the buffer is in the initial state.
        unsafe {
            self.parent
                .begin_raw_command_buffer(self.handle, &begin_info)
        }
    }

    /// Begin recording for a single submission. The buffer must be reset or
    /// re-recorded before it can be submitted again.
    ///
    /// # Safety
    /// The buffer must be in the initial state (freshly allocated or reset).
    pub unsafe fn begin_one_time(&mut self) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: Caller guarantees the buffer is in the initial state.
        unsafe {
            self.parent
                .begin_raw_command_buffer(self.handle, &begin_info)
        }
    }

    /// End recording.
    ///
    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is in the recording state.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
    }

    /// Begin a render pass instance over the full `extent`, clearing the
    /// color attachment to `clear_color`.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `framebuffer` must be
    /// compatible with `render_pass`, and both must be created from the same
    /// device as this command buffer. `extent` must not exceed the
    /// framebuffer's dimensions.
    pub unsafe fn begin_render_pass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.raw_render_pass())
            .framebuffer(framebuffer.raw_framebuffer())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);
        // SAFETY: Caller guarantees recording state, framebuffer
        // compatibility, and extent bounds.
        unsafe {
            self.parent
                .cmd_begin_raw_render_pass(self.handle, &begin_info)
        }
    }

    /// End the current render pass instance.
    ///
    /// # Safety
    /// The buffer must be inside a render pass begun with
    /// [`begin_render_pass`](Self::begin_render_pass).
    pub unsafe fn end_render_pass(&mut self) {
        // SAFETY: Caller guarantees active render pass state.
        unsafe { self.parent.cmd_end_raw_render_pass(self.handle) }
    }

    /// Bind a graphics pipeline for subsequent draw commands.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `pipeline` must be a valid
    /// graphics pipeline created from the same device as this buffer.
    pub unsafe fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees recording state and pipeline validity.
        unsafe {
            self.parent
                .cmd_bind_graphics_pipeline(self.handle, pipeline)
        }
    }

    /// Bind vertex buffers for subsequent draw commands.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `buffers` and `offsets`
    /// must have equal length. All buffers must be valid handles created from
    /// the same device as this command buffer.
    pub unsafe fn bind_raw_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: Caller guarantees recording state and buffer validity.
        unsafe {
            self.parent.cmd_bind_vertex_buffers(
                self.handle,
                first_binding,
                buffers,
                offsets,
            )
        }
    }

    /// Bind a single vertex buffer for subsequent draw commands.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `buffer` must be a valid
    /// handle created from the same device as this command buffer.
    pub unsafe fn bind_vertex_buffer<B>(
        &mut self,
        binding: u32,
        buffer: B,
        offset: vk::DeviceSize,
    ) where
        B: BufferHandle,
    {
        let buffers = [buffer.raw_buffer()];
        let offsets = [offset];
        // SAFETY: Caller guarantees recording state and buffer validity.
        unsafe { self.bind_raw_vertex_buffers(binding, &buffers, &offsets) }
    }

    /// Bind an index buffer for subsequent indexed draw commands.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `buffer` must be a
    /// valid index buffer created from the same device as this command
    /// buffer, with `INDEX_BUFFER` usage.
    pub unsafe fn bind_index_buffer<B>(
        &mut self,
        buffer: B,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) where
        B: BufferHandle,
    {
        // SAFETY: Caller guarantees recording state and buffer validity.
        unsafe {
            self.parent.cmd_bind_index_buffer(
                self.handle,
                buffer.raw_buffer(),
                offset,
                index_type,
            )
        }
    }

    /// Bind a single descriptor set at set index 0 for subsequent draw
    /// commands.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `layout` must be
    /// compatible with the bound pipeline and `set` must be a valid
    /// descriptor set derived from the same device as this command buffer.
    pub unsafe fn bind_descriptor_set(
        &mut self,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        // SAFETY: Caller guarantees recording state, layout compatibility,
        // and set validity.
        unsafe {
            self.parent
                .cmd_bind_descriptor_sets(self.handle, layout, 0, &[set], &[])
        }
    }

    /// Record a buffer-to-buffer copy.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `src_buffer` and
    /// `dst_buffer` must be valid handles created from the same device as
    /// this command buffer. Regions must be valid and in-bounds.
    pub unsafe fn copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees recording state and copy validity.
        unsafe {
            self.parent.cmd_copy_buffer(
                self.handle,
                src_buffer,
                dst_buffer,
                regions,
            )
        }
    }

    /// Record an indexed draw call.
    ///
    /// # Safety
    /// The buffer must be in the recording state inside an active render
    /// pass, with a compatible graphics pipeline bound and a valid index
    /// buffer bound.
    pub unsafe fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: Caller guarantees render pass, pipeline, and
        // index buffer state validity.
        unsafe {
            self.parent.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl CommandBufferHandle for CommandBuffer {
    fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }
}

// ---------------------------------------------------------------------------
// Auto-trait assertions
// ---------------------------------------------------------------------------

// Verified at compile time: both types are Send.
// CommandPool: Send + !Sync (Receiver/Sender/PhantomData<Cell<()>>)
// CommandBuffer: Send + !Sync (Sender<T>: !Sync)
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for CommandPool {}
impl AssertSend for CommandBuffer {}
