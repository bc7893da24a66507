//! CPU-GPU and GPU-GPU synchronization primitives.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(#[from] vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Timed out waiting on fence")]
    Timeout,
    #[error("Vulkan error waiting on fence: {0}")]
    Vulkan(vk::Result),
}

/// An owned `VkFence` for CPU-side waits on queue submissions.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Fence {
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
    ) -> Result<Self, CreateFenceError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: create_info is fully initialised above.
        let handle = unsafe { device.create_raw_fence(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Block until the fence is signaled or `timeout_ns` elapses.
    pub fn wait(&self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        // SAFETY: handle is a valid fence owned by parent.
        unsafe {
            self.parent
                .wait_for_raw_fences(&[self.handle], true, timeout_ns)
        }
        .map_err(|e| match e {
            vk::Result::TIMEOUT => WaitFenceError::Timeout,
            other => WaitFenceError::Vulkan(other),
        })
    }

    /// Return the fence to the unsignaled state.
    ///
    /// # Safety
    /// The fence must not be pending on any queue submission.
    pub unsafe fn reset(&self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the fence is not pending; the handle is
        // valid and owned by parent.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }
    }

    /// Wait for the fence, then reset it to the unsignaled state.
    pub fn wait_and_reset(
        &self,
        timeout_ns: u64,
    ) -> Result<(), WaitFenceError> {
        self.wait(timeout_ns)?;
        // SAFETY: The wait above just completed, so the fence cannot be
        // pending on any queue.
        unsafe { self.reset() }.map_err(WaitFenceError::Vulkan)
    }

    pub fn is_signaled(&self) -> Result<bool, vk::Result> {
        // SAFETY: handle is a valid fence owned by parent.
        unsafe { self.parent.get_raw_fence_status(self.handle) }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        //SAFETY: No GPU work may still reference this fence by the time it
        //is dropped.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

#[derive(Debug, Error)]
pub enum CreateSemaphoreError {
    #[error("Vulkan error creating semaphore: {0}")]
    Vulkan(#[from] vk::Result),
}

/// An owned binary `VkSemaphore` for queue-to-queue ordering.
pub struct Semaphore {
    parent: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(device: &Arc<Device>) -> Result<Self, CreateSemaphoreError> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: create_info is fully initialised above.
        let handle = unsafe { device.create_raw_semaphore(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_semaphore(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        //SAFETY: No GPU work may still be waiting on or signaling this
        //semaphore by the time it is dropped.
        unsafe { self.parent.destroy_raw_semaphore(self.handle) };
    }
}
