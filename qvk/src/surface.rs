use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::Instance;

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Couldn't get display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Couldn't get window handle: {0}")]
    InvalidWindowHandle(raw_window_handle::HandleError),
    #[error("Vulkan surface creation failed: {0}")]
    VulkanError(ash::vk::Result),
    #[error(
        "Parent instance did not have the surface extensions \
         for this platform loaded"
    )]
    MissingExtension,
}

#[derive(Debug, Error)]
pub enum SurfaceSupportError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error checking surface support: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error querying surface: {0}")]
    Vulkan(vk::Result),
}

/// An owned `VkSurfaceKHR` tied to its window/display handle source.
///
/// The source is held behind an `Arc` so the underlying window cannot be
/// dropped while the surface is alive.
pub struct Surface<T: HasWindowHandle + HasDisplayHandle> {
    parent_instance: Arc<Instance>,
    handle: ash::vk::SurfaceKHR,
    _surface_source: Arc<T>,
}

impl<T: HasWindowHandle + HasDisplayHandle> std::fmt::Debug for Surface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("parent", &self.parent_instance)
            .finish_non_exhaustive()
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Surface<T> {
    /// Creates a new surface associated with the source.
    ///
    /// # Safety
    /// This must be dropped on events like suspend in winit due to the
    /// surface being implicitly invalidated.
    ///
    /// Callers are responsible for ensuring no in-flight GPU work still
    /// references resources derived from this surface at destruction time.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        source: Arc<T>,
    ) -> Result<Self, CreateSurfaceError> {
        //SAFETY: We hold Arc references to the instance and source, ensuring
        //they outlive the surface
        let handle = unsafe { instance.create_raw_surface(&source) }.map_err(
            |e| match e {
                crate::instance::CreateRawSurfaceError::OnCreate(e) => {
                    CreateSurfaceError::VulkanError(e)
                }
                crate::instance::CreateRawSurfaceError::DisplayHandle(e) => {
                    CreateSurfaceError::InvalidDisplayHandle(e)
                }
                crate::instance::CreateRawSurfaceError::WindowHandle(e) => {
                    CreateSurfaceError::InvalidWindowHandle(e)
                }
                crate::instance::CreateRawSurfaceError::ExtensionNotLoaded => {
                    CreateSurfaceError::MissingExtension
                }
            },
        )?;

        Ok(Self {
            parent_instance: Arc::clone(instance),
            handle,
            _surface_source: source,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent_instance
    }

    pub fn raw_surface(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Check if a queue family on a physical device supports presenting to
    /// this surface.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from the same
    /// instance as this surface.
    pub unsafe fn supports_queue_family(
        &self,
        physical_device: ash::vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool, SurfaceSupportError> {
        //SAFETY: physical_device was derived from the same instance as this
        //surface (caller guarantees), self.handle is valid
        unsafe {
            self.parent_instance.get_raw_physical_device_surface_support(
                physical_device,
                queue_family_index,
                self.handle,
            )
        }
    }

    /// Query swapchain surface capabilities for this surface.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from the same
    /// instance as this surface.
    pub unsafe fn query_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        // SAFETY: Caller guarantees physical_device provenance for
        // this instance.
        unsafe {
            self.parent_instance
                .get_surface_capabilities(physical_device, self.handle)
        }
    }

    /// Query supported surface formats for this surface.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from the same
    /// instance as this surface.
    pub unsafe fn query_formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        // SAFETY: Caller guarantees physical_device provenance for
        // this instance.
        unsafe {
            self.parent_instance
                .get_surface_formats(physical_device, self.handle)
        }
    }

    /// Query supported present modes for this surface.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from the same
    /// instance as this surface.
    pub unsafe fn query_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        // SAFETY: Caller guarantees physical_device provenance for
        // this instance.
        unsafe {
            self.parent_instance
                .get_surface_present_modes(physical_device, self.handle)
        }
    }
}

impl<T: HasWindowHandle + HasDisplayHandle> Drop for Surface<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.handle);
        //SAFETY: This is being dropped which means all derived objects should
        //also be being dropped and no in-flight work may still reference it.
        let _ =
            unsafe { self.parent_instance.destroy_raw_surface(self.handle) }
                .inspect_err(|e| {
                    tracing::error!(
                        "Error while dropping surface {:?}: {e}",
                        self.handle
                    )
                });
    }
}
