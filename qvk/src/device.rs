//! Logical device wrapper ([`Device`]).
//!
//! `Device` wraps a `VkDevice` and centralises all per-device state:
//! a `gpu-allocator` allocator (behind a `Mutex`), the swapchain extension
//! loader, and the graphics and present queues with their family indices.
//!
//! Physical device selection is first-fit: devices are visited in the order
//! the driver enumerates them and the first one that satisfies every
//! requirement (a graphics queue family, a present-capable queue family for
//! the target surface, `VK_KHR_swapchain`, and at least one surface format
//! and present mode) is used. No scoring or ranking is performed.
//!
//! All raw Vulkan operations on the device handle are surfaced as
//! `unsafe fn` methods prefixed with `raw_` (e.g. `create_raw_buffer`).
//! Higher-level wrappers in sibling modules call these rather than
//! accessing `ash::Device` directly.

use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::{
    instance::{FetchPhysicalDeviceError, Instance},
    surface::{Surface, SurfaceSupportError},
};

/// Describes how an allocation will be accessed by CPU and GPU.
///
/// Passed to [`Device::allocate_memory`] to select the best-matching
/// Vulkan memory type and determine whether atom-size padding is
/// required for non-coherent flush alignment.
#[derive(Copy, Clone, Debug)]
pub enum MemoryUsage {
    /// GPU-only storage. Highest bandwidth; not CPU-mappable.
    GpuOnly,
    /// CPU-writable, GPU-readable. For staging buffers and
    /// per-frame uploads.
    CpuToGpu,
    /// GPU-writable, CPU-readable. For readback.
    GpuToCpu,
}

/// Queue family indices selected for a physical device.
///
/// `graphics` and `present` may name the same family; callers that build
/// `VkDeviceQueueCreateInfo` lists must deduplicate via
/// [`unique_queue_families`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyPick {
    pub graphics: u32,
    pub present: u32,
}

/// Find queue families for a device: the first family advertising
/// `GRAPHICS`, and the first family for which `supports_present` returns
/// `Ok(true)`. The two scans are independent, so a device whose only
/// present-capable family differs from its graphics family is still
/// accepted.
///
/// Returns `None` when either role has no family.
pub(crate) fn pick_queue_families<F>(
    queue_families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Option<QueueFamilyPick>
where
    F: FnMut(u32) -> bool,
{
    let graphics = queue_families.iter().position(|qf| {
        qf.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    })? as u32;
    let present = (0..queue_families.len() as u32)
        .find(|&idx| supports_present(idx))?;
    Some(QueueFamilyPick { graphics, present })
}

/// Deduplicated family indices for device creation, preserving order.
pub(crate) fn unique_queue_families(pick: QueueFamilyPick) -> Vec<u32> {
    if pick.graphics == pick.present {
        vec![pick.graphics]
    } else {
        vec![pick.graphics, pick.present]
    }
}

/// A logical Vulkan device and its associated per-device state.
///
/// Wraps an `ash::Device`, a `gpu-allocator` allocator (behind a `Mutex`),
/// the swapchain extension loader, and the graphics and present queues.
///
/// Constructed via [`Device::create_compatible`], which picks the first
/// physical device able to render to and present on the given surface. Raw
/// Vulkan operations are exposed as `unsafe fn` methods prefixed with
/// `raw_`.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
    swapchain_device: ash::khr::swapchain::Device,
    physical_device: vk::PhysicalDevice,
    /// When graphics and present share a family, both roles share the same
    /// `Arc<Mutex<vk::Queue>>` so locking either role serializes on the same
    /// underlying resource.
    graphics_queue: (Arc<Mutex<vk::Queue>>, u32),
    present_queue: (Arc<Mutex<vk::Queue>>, u32),
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // Ensure allocator is dropped before vkDestroyDevice.
        self.allocator = None;
        //SAFETY: All objects derived from this device should be dropped
        //before this device is dropped.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateCompatibleError {
    #[error(
        "Mismatched parameters to Device::create_compatible. All \
         parameters must be derived from the same instance"
    )]
    MismatchedParams,

    #[error("Host memory exhaustion while creating a compatible device")]
    MemoryExhaustion,

    #[error("Unknown Vulkan error while creating a compatible device: {0}")]
    UnknownVulkan(vk::Result),

    #[error("No suitable physical device found")]
    NoSuitableDevice,

    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),

    #[error("Error checking surface support: {0}")]
    SurfaceSupport(#[from] SurfaceSupportError),

    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

impl Device {
    /// Create a logical device compatible with `surf`.
    ///
    /// Takes the first enumerated physical device that has a graphics queue
    /// family, a queue family able to present to `surf`, the swapchain
    /// extension, and non-empty surface format and present mode lists.
    pub fn create_compatible<T: HasDisplayHandle + HasWindowHandle>(
        instance: &Arc<Instance>,
        surf: &Surface<T>,
    ) -> Result<Self, CreateCompatibleError> {
        if !std::sync::Arc::ptr_eq(surf.parent(), instance) {
            return Err(CreateCompatibleError::MismatchedParams);
        }

        let physical_devices = instance.fetch_raw_physical_devices()?;

        let mut selected: Option<(
            vk::PhysicalDevice,
            vk::PhysicalDeviceProperties,
            QueueFamilyPick,
        )> = None;

        'dev: for &dev in &physical_devices {
            // SAFETY: dev was derived from instance.
            let props =
                unsafe { instance.get_raw_physical_device_properties(dev) };
            // SAFETY: dev was derived from instance.
            let queue_families = unsafe {
                instance.get_raw_physical_device_queue_family_properties(dev)
            };

            // SAFETY: dev was derived from instance.
            let device_exts = match unsafe {
                instance.enumerate_raw_device_extension_properties(dev)
            } {
                Ok(exts) => exts,
                Err(e) => {
                    tracing::debug!(
                        "Skipping {:?}: failed to enumerate extensions: {e}",
                        props.device_name_as_c_str().unwrap_or(c"unknown"),
                    );
                    continue 'dev;
                }
            };

            let has_swapchain = device_exts.iter().any(|e| {
                e.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME)
            });
            if !has_swapchain {
                tracing::debug!(
                    "Skipping {:?}: missing VK_KHR_swapchain",
                    props.device_name_as_c_str().unwrap_or(c"unknown"),
                );
                continue 'dev;
            }

            let Some(pick) =
                pick_queue_families(&queue_families, |queue_family| {
                    // SAFETY: dev and surf are both derived from the same
                    // instance (validated at the top of this fn).
                    matches!(
                        unsafe {
                            surf.supports_queue_family(dev, queue_family)
                        },
                        Ok(true)
                    )
                })
            else {
                tracing::debug!(
                    "Skipping {:?}: no graphics or present queue family",
                    props.device_name_as_c_str().unwrap_or(c"unknown"),
                );
                continue 'dev;
            };

            // The swapchain cannot be configured later without at least one
            // format and one present mode; reject such devices now.
            // SAFETY: dev was derived from the same instance as surf.
            let formats = unsafe { surf.query_formats(dev) }
                .map_err(|e| {
                    tracing::debug!("Surface format query failed: {e}");
                })
                .unwrap_or_default();
            // SAFETY: dev was derived from the same instance as surf.
            let present_modes = unsafe { surf.query_present_modes(dev) }
                .map_err(|e| {
                    tracing::debug!("Present mode query failed: {e}");
                })
                .unwrap_or_default();
            if formats.is_empty() || present_modes.is_empty() {
                tracing::debug!(
                    "Skipping {:?}: no surface formats or present modes",
                    props.device_name_as_c_str().unwrap_or(c"unknown"),
                );
                continue 'dev;
            }

            selected = Some((dev, props, pick));
            break 'dev;
        }

        let (physical_device, properties, pick) =
            selected.ok_or(CreateCompatibleError::NoSuitableDevice)?;

        // SAFETY: physical_device was selected from this instance.
        let memory_properties = unsafe {
            instance.get_raw_physical_device_memory_properties(physical_device)
        };
        tracing::info!(
            "Selected physical device: {:?} (type: {:?}, graphics \
             family: {}, present family: {})",
            properties.device_name_as_c_str().unwrap_or(c"unknown"),
            properties.device_type,
            pick.graphics,
            pick.present,
        );

        let queue_priorities = [1.0f32];
        let families = unique_queue_families(pick);
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let ext_ptrs = [ash::khr::swapchain::NAME.as_ptr()];

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs);

        // SAFETY: physical_device was derived from instance;
        // device_create_info is fully initialised above.
        let device = unsafe {
            instance.create_ash_device(physical_device, &device_create_info)
        }
        .map_err(CreateCompatibleError::DeviceCreationFailed)?;

        // SAFETY: device was just created with both families requested.
        let graphics_queue_handle =
            unsafe { device.get_device_queue(pick.graphics, 0) };
        // SAFETY: same reasoning as above.
        let present_queue_handle =
            unsafe { device.get_device_queue(pick.present, 0) };

        // When both roles resolve to the same VkQueue they must share a
        // single Mutex so that locking either role serializes on the same
        // resource.
        let graphics_queue_arc = Arc::new(Mutex::new(graphics_queue_handle));
        let present_queue_arc =
            if present_queue_handle == graphics_queue_handle {
                Arc::clone(&graphics_queue_arc)
            } else {
                Arc::new(Mutex::new(present_queue_handle))
            };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(CreateCompatibleError::AllocatorCreation)?;

        let swapchain_device = instance.create_swapchain_loader(&device);

        Ok(Self {
            parent: instance.clone(),
            allocator: Some(Mutex::new(allocator)),
            memory_properties,
            properties,
            swapchain_device,
            handle: device,
            physical_device,
            graphics_queue: (graphics_queue_arc, pick.graphics),
            present_queue: (present_queue_arc, pick.present),
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue.1
    }

    pub fn present_queue_family(&self) -> u32 {
        self.present_queue.1
    }

    /// Score a memory type for a given usage; returns `None` if the
    /// type is incompatible. Higher scores are more preferred.
    fn score_memory_type(
        flags: vk::MemoryPropertyFlags,
        usage: MemoryUsage,
    ) -> Option<u32> {
        use vk::MemoryPropertyFlags as F;
        let device_local = flags.contains(F::DEVICE_LOCAL);
        let host_visible = flags.contains(F::HOST_VISIBLE);
        let host_cached = flags.contains(F::HOST_CACHED);
        match usage {
            MemoryUsage::GpuOnly => {
                // Prefer pure VRAM; penalise HOST_VISIBLE (unified).
                device_local.then_some(if host_visible { 1 } else { 2 })
            }
            MemoryUsage::CpuToGpu => {
                // Prefer DEVICE_LOCAL (ReBAR / unified memory).
                host_visible.then_some(if device_local { 2 } else { 1 })
            }
            MemoryUsage::GpuToCpu => {
                // Prefer HOST_CACHED for efficient CPU reads.
                host_visible.then_some(if host_cached { 2 } else { 1 })
            }
        }
    }

    /// Select the best Vulkan memory type index for `requirements`
    /// and `usage`. Among types with equal score the lowest index
    /// wins, matching Vulkan's convention that earlier types in the
    /// list are more preferred within the same heap.
    fn select_memory_type(
        &self,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
    ) -> Option<u32> {
        self.memory_properties.memory_types
            [..self.memory_properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .filter(|(i, _)| requirements.memory_type_bits & (1 << i) != 0)
            .filter_map(|(i, ty)| {
                Self::score_memory_type(ty.property_flags, usage)
                    .map(|s| (i as u32, s))
            })
            .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
            .map(|(i, _)| i)
    }

    /// Allocate device memory for the given requirements.
    ///
    /// Selects the best-matching Vulkan memory type for `usage`,
    /// narrows `requirements.memory_type_bits` to that type, then
    /// rounds `size` and `alignment` up to
    /// `VkPhysicalDeviceLimits::nonCoherentAtomSize` only when the
    /// chosen type is HOST_VISIBLE but not HOST_COHERENT.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let atom = self.properties.limits.non_coherent_atom_size;
        let requirements =
            if let Some(idx) = self.select_memory_type(requirements, usage) {
                use vk::MemoryPropertyFlags as F;
                let flags = self.memory_properties.memory_types[idx as usize]
                    .property_flags;
                let non_coherent_visible = flags.contains(F::HOST_VISIBLE)
                    && !flags.contains(F::HOST_COHERENT);
                let (size, alignment) = if non_coherent_visible {
                    (
                        requirements.size.div_ceil(atom) * atom,
                        requirements.alignment.max(atom),
                    )
                } else {
                    (requirements.size, requirements.alignment)
                };
                vk::MemoryRequirements {
                    size,
                    alignment,
                    memory_type_bits: 1 << idx,
                }
            } else {
                requirements
            };
        let location = match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        };
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
    }

    pub fn free_memory(
        &self,
        allocation: Allocation,
    ) -> Result<(), AllocationError> {
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        allocator.free(allocation)
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    /// Wait until all submitted work on this device has completed.
    ///
    /// This may block the calling thread and should generally be used for
    /// coarse-grained transitions (shutdown, suspend, swapchain teardown)
    /// rather than hot per-frame paths.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: `self.handle` is a valid logical device for the lifetime of
        // `self`, and this call has no additional pointer preconditions.
        unsafe { self.handle.device_wait_idle() }
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }
}

// Queue submit and present functionality
impl Device {
    /// Submit work to the graphics queue.
    ///
    /// # Safety
    /// All handles in `submits` must be valid and derived from this device.
    /// Command buffers must be in the executable state. Wait semaphores must
    /// be signaled or have a pending signal operation. Signal semaphores must
    /// be unsignaled. `fence`, when not null, must be an unsignaled fence
    /// created from this device.
    pub unsafe fn submit_graphics(
        &self,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self
            .graphics_queue
            .0
            .lock()
            .expect("graphics queue lock poisoned");
        // SAFETY: Caller guarantees all handle validity and
        // synchronization state.
        unsafe { self.handle.queue_submit(*queue, submits, fence) }
    }

    /// Block until the graphics queue has drained all submitted work.
    ///
    /// Used by the blocking upload path; per-frame code should rely on
    /// fences instead.
    pub fn graphics_queue_wait_idle(&self) -> Result<(), vk::Result> {
        let queue = self
            .graphics_queue
            .0
            .lock()
            .expect("graphics queue lock poisoned");
        // SAFETY: queue is a valid queue handle owned by this device.
        unsafe { self.handle.queue_wait_idle(*queue) }
    }

    /// Present a rendered swapchain image to the surface via the present
    /// queue.
    ///
    /// Returns `Ok(true)` when the swapchain is suboptimal and should be
    /// recreated at the next opportunity.
    ///
    /// Returns `Err(vk::Result::ERROR_OUT_OF_DATE_KHR)` when recreation is
    /// mandatory before the next present.
    ///
    /// # Safety
    /// All handles in `present_info` must be valid and derived from this
    /// device. Wait semaphores must be signaled or have a pending signal
    /// operation. The presented image must be in
    /// `VK_IMAGE_LAYOUT_PRESENT_SRC_KHR` and not referenced by any pending
    /// GPU work other than this presentation.
    pub unsafe fn queue_present(
        &self,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let queue = self
            .present_queue
            .0
            .lock()
            .expect("present queue lock poisoned");
        // SAFETY: Caller guarantees all handles and synchronization
        // requirements.
        unsafe { self.swapchain_device.queue_present(*queue, present_info) }
    }
}

// Swapchain functionality
impl Device {
    /// # Safety
    /// `create_info` must reference valid Vulkan objects derived from this
    /// device and its parent instance. Any referenced pointers must remain
    /// valid for the duration of the call.
    ///
    /// If `create_info.old_swapchain` is non-null, that handle must be a
    /// valid swapchain created from this device.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and handle
        // provenance.
        unsafe { self.swapchain_device.create_swapchain(create_info, None) }
    }

    /// # Safety
    /// `swapchain` must be a valid swapchain handle created from this device
    /// and not yet destroyed.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result> {
        // SAFETY: Caller guarantees swapchain validity and lifetime.
        unsafe { self.swapchain_device.get_swapchain_images(swapchain) }
    }

    /// # Safety
    /// `swapchain` must be a valid handle derived from this device, and all
    /// child resources derived from it must be destroyed first.
    ///
    /// No in-flight GPU work may still reference the swapchain.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        // SAFETY: Caller guarantees swapchain provenance and drop ordering.
        unsafe { self.swapchain_device.destroy_swapchain(swapchain, None) };
    }

    /// Acquire the next presentable swapchain image.
    ///
    /// Returns `(image_index, is_suboptimal)`. A suboptimal result means the
    /// image was acquired successfully but the swapchain no longer exactly
    /// matches the surface; recreation at the next opportunity is
    /// recommended.
    ///
    /// Returns `Err(vk::Result::ERROR_OUT_OF_DATE_KHR)` when the swapchain is
    /// incompatible with the surface and must be recreated before
    /// presentation can resume.
    ///
    /// # Safety
    /// `swapchain` must be a valid handle created from this device.
    /// `semaphore` and `fence`, when not null, must be valid unsignaled
    /// handles created from this device.
    pub unsafe fn acquire_next_swapchain_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        // SAFETY: Caller guarantees swapchain, semaphore, and fence validity.
        unsafe {
            self.swapchain_device.acquire_next_image(
                swapchain,
                timeout_ns,
                semaphore,
                fence,
            )
        }
    }

    /// # Safety
    /// `create_info` must reference valid Vulkan objects derived from this
    /// device. Any referenced pointers must remain valid for the duration of
    /// the call.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and provenance.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `image_view` must be a valid handle derived from this device, and all
    /// objects using it must be destroyed first.
    ///
    /// No in-flight GPU work may still reference the image view.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: Caller guarantees image_view provenance and drop ordering.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }
}

// Render pass and framebuffer functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid and reference only stack or owned data
    /// that remains live for the duration of the call.
    pub unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_render_pass(create_info, None) }
    }

    /// # Safety
    /// `render_pass` must be a valid handle created from this device and not
    /// yet destroyed. All framebuffers and pipelines created against it must
    /// be destroyed first.
    pub unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: Caller guarantees render_pass provenance and drop ordering.
        unsafe { self.handle.destroy_render_pass(render_pass, None) };
    }

    /// # Safety
    /// `create_info` must reference a valid render pass and image views, all
    /// created from this device, that remain valid for the lifetime of the
    /// framebuffer.
    pub unsafe fn create_raw_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and provenance.
        unsafe { self.handle.create_framebuffer(create_info, None) }
    }

    /// # Safety
    /// `framebuffer` must be a valid handle created from this device and not
    /// yet destroyed. No in-flight GPU work may still reference it.
    pub unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: Caller guarantees framebuffer provenance and drop ordering.
        unsafe { self.handle.destroy_framebuffer(framebuffer, None) };
    }
}

// Shader module functionality
impl Device {
    /// # Safety
    /// `create_info` must contain valid SPIR-V code. All referenced pointers
    /// must remain valid for the duration of the call.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `shader_module` must be a valid handle created from this device and
    /// not yet destroyed. All objects derived from it must be destroyed
    /// first.
    pub unsafe fn destroy_raw_shader_module(
        &self,
        shader_module: vk::ShaderModule,
    ) {
        // SAFETY: Caller guarantees shader_module provenance and drop
        // ordering.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }
}

// Pipeline functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid pipeline layout create info. All
    /// referenced descriptor set layouts must be valid handles created from
    /// this device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be a valid handle created from this device and not yet
    /// destroyed. No pipeline still using this layout may be in use.
    pub unsafe fn destroy_raw_pipeline_layout(
        &self,
        layout: vk::PipelineLayout,
    ) {
        // SAFETY: Caller guarantees layout provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create a single graphics pipeline.
    ///
    /// On partial batch failure ash returns any successfully-created pipeline
    /// handles alongside the error; this wrapper destroys them so callers
    /// never receive a mix of valid and invalid handles.
    ///
    /// # Safety
    /// `create_info` must reference valid shader stages, a valid pipeline
    /// layout, and a valid render pass, all derived from this device. All
    /// referenced pointers must remain valid for the duration of the call.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        }
        .map_err(|(partial, result)| {
            // Destroy any handles that were successfully created before the
            // failure so the caller receives nothing on error.
            for p in partial {
                if p != vk::Pipeline::null() {
                    // SAFETY: p was just created by this device.
                    unsafe { self.handle.destroy_pipeline(p, None) };
                }
            }
            result
        })
        .map(|mut pipelines| {
            debug_assert_eq!(pipelines.len(), 1);
            pipelines.remove(0)
        })
    }

    /// # Safety
    /// `pipeline` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference the pipeline.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees pipeline provenance and drop ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Recording commands
impl Device {
    /// Begin a render pass instance with inline subpass contents.
    ///
    /// # Safety
    /// `command_buffer` must be a valid handle in the recording state,
    /// derived from this device. All handles in `begin_info` must be valid
    /// and the framebuffer must be compatible with the render pass.
    pub unsafe fn cmd_begin_raw_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
    ) {
        // SAFETY: Caller guarantees command_buffer state and begin_info
        // validity.
        unsafe {
            self.handle.cmd_begin_render_pass(
                command_buffer,
                begin_info,
                vk::SubpassContents::INLINE,
            )
        }
    }

    /// End the current render pass instance.
    ///
    /// # Safety
    /// `command_buffer` must be inside a render pass begun with
    /// [`cmd_begin_raw_render_pass`](Self::cmd_begin_raw_render_pass).
    pub unsafe fn cmd_end_raw_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
    ) {
        // SAFETY: Caller guarantees active render pass state.
        unsafe { self.handle.cmd_end_render_pass(command_buffer) }
    }

    /// Bind a graphics pipeline for subsequent draw commands.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `pipeline` must be a
    /// valid graphics pipeline created from this device.
    pub unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: Caller guarantees command_buffer state and pipeline
        // validity.
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        }
    }

    /// Bind vertex buffers for subsequent draw commands.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `buffers` and
    /// `offsets` must have equal length. All buffers must be valid handles
    /// created from this device.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: Caller guarantees command_buffer state and
        // buffer/offset validity.
        unsafe {
            self.handle.cmd_bind_vertex_buffers(
                command_buffer,
                first_binding,
                buffers,
                offsets,
            )
        }
    }

    /// Bind an index buffer for subsequent indexed draw commands.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `buffer` must be a
    /// valid index buffer created from this device, bound with
    /// `INDEX_BUFFER` usage.
    pub unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: Caller guarantees command_buffer state and
        // buffer validity.
        unsafe {
            self.handle.cmd_bind_index_buffer(
                command_buffer,
                buffer,
                offset,
                index_type,
            )
        }
    }

    /// Record a buffer-to-buffer copy.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `src_buffer` and
    /// `dst_buffer` must be valid handles created from this device. Regions
    /// must be valid, non-overlapping within each buffer, and within bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees command buffer state and copy region
        // validity.
        unsafe {
            self.handle.cmd_copy_buffer(
                command_buffer,
                src_buffer,
                dst_buffer,
                regions,
            )
        }
    }

    /// Record an indexed draw call.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state inside an active
    /// render pass, with a compatible graphics pipeline bound and a valid
    /// index buffer bound.
    pub unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: Caller guarantees render pass, pipeline, and
        // index buffer state validity.
        unsafe {
            self.handle.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }
}

// Buffer and memory functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid and reference only objects derived from
    /// this device. All referenced pointers must remain valid for the
    /// duration of the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference `buffer`.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees buffer provenance and drop ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// Query memory requirements for a buffer.
    ///
    /// # Safety
    /// `buffer` must be a valid handle created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must both be valid handles created from this
    /// device. `offset` must satisfy alignment/size requirements from
    /// `vkGetBufferMemoryRequirements`.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// Every range in `memory_ranges` must reference memory allocations from
    /// this device and satisfy Vulkan flush requirements.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.flush_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// Every range in `memory_ranges` must reference memory allocations from
    /// this device and satisfy Vulkan invalidation requirements.
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.invalidate_mapped_memory_ranges(memory_ranges) }
    }
}

// Command pool functionality
impl Device {
    /// # Safety
    /// `create_info` must have a valid `queue_family_index` for this device.
    /// All referenced pointers must remain valid for the duration of the
    /// call.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and queue
        // family provenance.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be a valid handle created from this device and not yet
    /// destroyed. All command buffers allocated from it must have finished
    /// execution and must not be referenced by any pending GPU work.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Caller guarantees pool provenance and drop ordering.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info.command_pool` must be a valid pool created from this
    /// device. `command_buffer_count` must be non-zero.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity and pool
        // provenance.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// Free command buffers back to their source pool, returning memory to
    /// the pool's internal allocator.
    ///
    /// A no-op when `command_buffers` is empty.
    ///
    /// # Safety
    /// - All handles in `command_buffers` must have been allocated from
    ///   `pool`.
    /// - No buffer in `command_buffers` may be pending execution on the GPU.
    /// - The caller must externally synchronize access to `pool` (e.g. by
    ///   ensuring no other thread is allocating or resetting from it
    ///   concurrently).
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: Caller guarantees pool/buffer provenance, idle state, and
        // external synchronization on pool.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) }
    }

    /// # Safety
    /// `command_buffer` must be in the initial or executable state and must
    /// not be pending execution. All pointers in `begin_info` must remain
    /// valid for the duration of the call.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer state and
        // begin_info validity.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer is in the recording state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending execution on the GPU. The pool it
    /// was allocated from must have been created with
    /// `RESET_COMMAND_BUFFER`.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees command_buffer is not pending
        // and pool flag is set.
        unsafe { self.handle.reset_command_buffer(command_buffer, flags) }
    }
}

// Fence and semaphore functionality
impl Device {
    /// # Safety
    /// `create_info` must be a valid fence create info. All referenced
    /// pointers must remain valid for the duration of the call.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must be a valid handle created from this device and not yet
    /// destroyed. No GPU work may reference this fence at time of
    /// destruction.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees fence provenance and drop ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// All handles in `fences` must be valid fences created from this
    /// device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence handle validity.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// All handles in `fences` must be valid fences created from this device
    /// and must not be currently pending on any queue submission.
    pub unsafe fn reset_raw_fences(
        &self,
        fences: &[vk::Fence],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence handle validity and
        // non-pending state.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// Query whether a fence is signaled.
    ///
    /// Returns `Ok(true)` if signaled, `Ok(false)` if not yet signaled.
    ///
    /// # Safety
    /// `fence` must be a valid handle created from this device and not yet
    /// destroyed.
    pub unsafe fn get_raw_fence_status(
        &self,
        fence: vk::Fence,
    ) -> Result<bool, vk::Result> {
        // SAFETY: Caller guarantees fence provenance and validity.
        unsafe { self.handle.get_fence_status(fence) }
    }

    /// # Safety
    /// `create_info` must be a valid semaphore create info. All referenced
    /// pointers must remain valid for the duration of the call.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// `semaphore` must be a valid handle created from this device and not
    /// yet destroyed. No GPU work may be waiting on or about to signal it.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: Caller guarantees semaphore provenance and drop ordering.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

// Descriptor set functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid and reference only objects
    /// derived from this device.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be a valid handle created from this device
    /// and not yet destroyed. No descriptor pool that used this
    /// layout may still exist.
    pub unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        // SAFETY: Caller guarantees layout provenance and ordering.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be valid and reference only objects
    /// derived from this device.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be a valid handle created from this device and
    /// not yet destroyed. All descriptor sets allocated from it
    /// must not be referenced by any pending GPU work.
    pub unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: Caller guarantees pool provenance and ordering.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// `alloc_info.descriptor_pool` must be a valid pool created
    /// from this device with sufficient capacity. All layouts in
    /// `alloc_info` must be valid handles derived from this device.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        alloc_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: Caller guarantees alloc_info validity.
        unsafe { self.handle.allocate_descriptor_sets(alloc_info) }
    }

    /// Write or copy descriptor set updates.
    ///
    /// # Safety
    /// All handles in `descriptor_writes` and `descriptor_copies`
    /// must be valid and derived from this device. Buffer references in
    /// `descriptor_writes` must remain valid for as long as the descriptor
    /// set is bound in a submitted command buffer.
    pub unsafe fn update_raw_descriptor_sets(
        &self,
        descriptor_writes: &[vk::WriteDescriptorSet<'_>],
        descriptor_copies: &[vk::CopyDescriptorSet<'_>],
    ) {
        // SAFETY: Caller guarantees write/copy validity.
        unsafe {
            self.handle
                .update_descriptor_sets(descriptor_writes, descriptor_copies)
        }
    }

    /// Bind descriptor sets for subsequent draw commands.
    ///
    /// # Safety
    /// - `command_buffer` must be in the recording state.
    /// - `layout` must be compatible with the pipeline to be used.
    /// - All handles in `descriptor_sets` must be valid and derived
    ///   from this device.
    /// - `dynamic_offsets` must match the number of dynamic
    ///   descriptors in the bound sets.
    pub unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        // SAFETY: Caller guarantees command buffer state, layout
        // compatibility, and descriptor set validity.
        unsafe {
            self.handle.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                descriptor_sets,
                dynamic_offsets,
            )
        }
    }
}

impl From<FetchPhysicalDeviceError> for CreateCompatibleError {
    fn from(value: FetchPhysicalDeviceError) -> Self {
        match value {
            FetchPhysicalDeviceError::MemoryExhaustion => {
                Self::MemoryExhaustion
            }
            FetchPhysicalDeviceError::UnknownVulkan(e) => {
                Self::UnknownVulkan(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn pick_takes_first_graphics_family() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];

        let pick = pick_queue_families(&families, |_| true)
            .expect("graphics family exists");
        assert_eq!(pick.graphics, 1);
        assert_eq!(pick.present, 0);
    }

    #[test]
    fn pick_allows_split_graphics_and_present_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];

        // Only the transfer-only family can present.
        let pick = pick_queue_families(&families, |idx| idx == 1)
            .expect("both roles are covered");
        assert_eq!(pick.graphics, 0);
        assert_eq!(pick.present, 1);
    }

    #[test]
    fn pick_fails_without_present_support() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(pick_queue_families(&families, |_| false).is_none());
    }

    #[test]
    fn pick_fails_without_graphics_family() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert!(pick_queue_families(&families, |_| true).is_none());
    }

    #[test]
    fn unique_queue_families_deduplicates_shared_family() {
        let shared = QueueFamilyPick {
            graphics: 0,
            present: 0,
        };
        assert_eq!(unique_queue_families(shared), vec![0]);

        let split = QueueFamilyPick {
            graphics: 0,
            present: 2,
        };
        assert_eq!(unique_queue_families(split), vec![0, 2]);
    }
}
