//! Logical device seam ([`RawDevice`]) and its `ash` implementation
//! ([`Device`]).
//!
//! Every wrapper in this crate holds an `Arc<dyn RawDevice>` and talks to
//! Vulkan exclusively through it. The trait surfaces the raw operations as
//! `unsafe fn` methods prefixed with `raw_` / `cmd_`, mirroring the
//! underlying entry points one to one. Keeping the seam narrow lets tests
//! substitute a recording double for the real device.
//!
//! [`Device`] adopts a logical device created by the windowing layer. It
//! dispatches dynamic rendering, synchronization2 and the extended dynamic
//! state entry points either through Vulkan 1.3 core or through the
//! corresponding KHR/EXT loader, depending on the device's API version.

use std::ffi::{CStr, CString};

use ash::vk;
use thiserror::Error;

/// Entry points that became core in Vulkan 1.3.
enum Vulkan13Commands {
    Core,
    /// Loaded from `VK_KHR_dynamic_rendering`, `VK_KHR_synchronization2`
    /// and `VK_EXT_extended_dynamic_state` on older devices.
    Extensions {
        dynamic_rendering: ash::khr::dynamic_rendering::Device,
        synchronization2: ash::khr::synchronization2::Device,
        extended_dynamic_state: ash::ext::extended_dynamic_state::Device,
    },
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

/// Raw device operations used by the resource, descriptor, pipeline and
/// recording wrappers.
///
/// All methods are thin forwards to the matching Vulkan entry point and share
/// its validity rules; the `# Safety` sections only restate the ones callers
/// most often get wrong.
pub trait RawDevice: Send + Sync + std::fmt::Debug {
    /// Attach a debug name to a device child. A no-op when
    /// `VK_EXT_debug_utils` is unavailable.
    ///
    /// # Safety
    /// `raw_handle` must be a live object of `object_type` owned by this
    /// device.
    unsafe fn set_raw_object_name(
        &self,
        object_type: vk::ObjectType,
        raw_handle: u64,
        name: &CStr,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `create_info` must reference an image created from this device.
    unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result>;

    /// # Safety
    /// `image_view` must be owned by this device and unused by pending work.
    unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView);

    /// # Safety
    /// `create_info` must contain word-aligned SPIR-V.
    unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result>;

    /// # Safety
    /// `shader_module` must be owned by this device.
    unsafe fn destroy_raw_shader_module(&self, shader_module: vk::ShaderModule);

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result>;

    /// # Safety
    /// `layout` must be owned by this device; no pipeline layout still in use
    /// may reference it.
    unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    );

    /// # Safety
    /// Every set layout referenced by `create_info` must be owned by this
    /// device.
    unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result>;

    /// # Safety
    /// No pipeline created with `layout` may still be alive.
    unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout);

    /// Create a single graphics pipeline. Partially created pipelines are
    /// destroyed before an error is returned.
    ///
    /// # Safety
    /// Shader modules, layout and pNext chain in `create_info` must be valid
    /// for the duration of the call.
    unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result>;

    /// # Safety
    /// No pending GPU work may reference `pipeline`.
    unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline);

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result>;

    /// # Safety
    /// No pending GPU work may reference sets allocated from `pool`.
    unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// # Safety
    /// The pool and layouts in `alloc_info` must be owned by this device.
    unsafe fn allocate_raw_descriptor_sets(
        &self,
        alloc_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result>;

    /// # Safety
    /// Buffers referenced by `descriptor_writes` must outlive every
    /// submission that binds the written sets.
    unsafe fn update_raw_descriptor_sets(
        &self,
        descriptor_writes: &[vk::WriteDescriptorSet<'_>],
        descriptor_copies: &[vk::CopyDescriptorSet<'_>],
    );

    /// # Safety
    /// `command_buffer` must be in the initial state.
    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `command_buffer` must be in the recording state.
    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `command_buffer` must be recording; barrier layouts must match the
    /// images' current layouts.
    unsafe fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    );

    /// # Safety
    /// Attachments in `rendering_info` must already be in their declared
    /// layouts.
    unsafe fn cmd_begin_raw_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
        rendering_info: &vk::RenderingInfo<'_>,
    );

    /// # Safety
    /// `command_buffer` must be inside a dynamic render pass.
    unsafe fn cmd_end_raw_rendering(&self, command_buffer: vk::CommandBuffer);

    /// # Safety
    /// The bound pipeline must declare `VK_DYNAMIC_STATE_VIEWPORT`.
    unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        viewports: &[vk::Viewport],
    );

    /// # Safety
    /// The bound pipeline must declare `VK_DYNAMIC_STATE_SCISSOR`.
    unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        scissors: &[vk::Rect2D],
    );

    /// # Safety
    /// The bound pipeline must declare `VK_DYNAMIC_STATE_CULL_MODE`.
    unsafe fn cmd_set_cull_mode(
        &self,
        command_buffer: vk::CommandBuffer,
        cull_mode: vk::CullModeFlags,
    );

    /// # Safety
    /// `pipeline` must be a graphics pipeline owned by this device.
    unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    );

    /// # Safety
    /// `layout` must be compatible with the bound pipeline.
    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );

    /// # Safety
    /// `buffers` and `offsets` must have equal length.
    unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );

    /// # Safety
    /// `buffer` must have been created with `INDEX_BUFFER` usage.
    unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );

    /// # Safety
    /// Must be recorded inside a render pass with pipeline, dynamic state,
    /// vertex and index buffers bound.
    unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
}

impl dyn RawDevice {
    /// Convenience helper to set a debug name from UTF-8 text.
    ///
    /// Passing `None` as the name is treated as a no-op.
    ///
    /// # Safety
    /// `object` must be a valid Vulkan handle created from this device and
    /// must remain valid for the duration of the call.
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let Some(name) = name else {
            return Ok(());
        };
        let name = CString::new(name).map_err(NameObjectError::InvalidName)?;
        // SAFETY: Caller guarantees object provenance and validity.
        unsafe {
            self.set_raw_object_name(H::TYPE, object.as_raw(), &name)
        }
        .map_err(NameObjectError::Vulkan)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceConfig {
    /// Load `VK_EXT_debug_utils` device functions for object naming. The
    /// instance must have been created with the extension enabled.
    pub debug_utils: bool,
}

/// An adopted logical Vulkan device.
///
/// Owns the `ash::Device` and destroys it on drop, after every wrapper that
/// holds an `Arc` to it has been released.
pub struct Device {
    instance: ash::Instance,
    handle: ash::Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    vulkan13: Vulkan13Commands,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("physical_device", &self.physical_device)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        //SAFETY: All objects derived from this device hold an Arc to it, so
        //they have been dropped before this runs.
        unsafe { self.handle.destroy_device(None) };
    }
}

impl Device {
    /// Adopt a logical device created by the windowing layer.
    ///
    /// Entry points that became core in Vulkan 1.3 are loaded from their
    /// extensions when the physical device reports an older API version.
    ///
    /// # Safety
    /// - `device` must have been created from `instance` and
    ///   `physical_device`, and must not be destroyed by anyone else.
    /// - On devices older than 1.3, `VK_KHR_dynamic_rendering`,
    ///   `VK_KHR_synchronization2` and `VK_EXT_extended_dynamic_state` must
    ///   have been enabled together with their feature bits.
    pub unsafe fn from_raw_parts(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        config: DeviceConfig,
    ) -> Self {
        // SAFETY: physical_device was derived from instance.
        let properties =
            unsafe { instance.get_physical_device_properties(physical_device) };
        // SAFETY: physical_device was derived from instance.
        let memory_properties = unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        };
        let is_pre_1_3 = vk::api_version_major(properties.api_version) < 1
            || (vk::api_version_major(properties.api_version) == 1
                && vk::api_version_minor(properties.api_version) < 3);

        tracing::info!(
            "Adopted device {:?} (Vulkan {}.{}, extension loaders: {})",
            properties.device_name_as_c_str().unwrap_or(c"unknown"),
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            is_pre_1_3,
        );

        let vulkan13 = if is_pre_1_3 {
            Vulkan13Commands::Extensions {
                dynamic_rendering: ash::khr::dynamic_rendering::Device::new(
                    &instance, &device,
                ),
                synchronization2: ash::khr::synchronization2::Device::new(
                    &instance, &device,
                ),
                extended_dynamic_state:
                    ash::ext::extended_dynamic_state::Device::new(
                        &instance, &device,
                    ),
            }
        } else {
            Vulkan13Commands::Core
        };

        let debug_utils_device = config
            .debug_utils
            .then(|| ash::ext::debug_utils::Device::new(&instance, &device));

        Self {
            instance,
            handle: device,
            physical_device,
            properties,
            memory_properties,
            debug_utils_device,
            vulkan13,
        }
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    /// First format in `candidates` whose `tiling` features contain
    /// `features`.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        select_supported_format(candidates, tiling, features, |format| {
            // SAFETY: physical_device was derived from self.instance.
            unsafe {
                self.instance.get_physical_device_format_properties(
                    self.physical_device,
                    format,
                )
            }
        })
    }

    /// Pick a depth attachment format from `candidates` (see
    /// [`DEPTH_FORMAT_CANDIDATES`]).
    pub fn find_depth_format(
        &self,
        candidates: &[vk::Format],
    ) -> Option<vk::Format> {
        self.find_supported_format(
            candidates,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }
}

/// Depth formats tried in order when no explicit list is configured.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Returns true for formats that carry a stencil aspect.
pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

/// Aspects a depth attachment of `format` covers. Combined formats need
/// both aspects in barriers and attachment views.
pub fn depth_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil_component(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// Layout a depth attachment of `format` is rendered in.
/// `DEPTH_ATTACHMENT_OPTIMAL` is only valid for combined formats with
/// separate depth/stencil layouts enabled, so those use
/// `DEPTH_STENCIL_ATTACHMENT_OPTIMAL`.
pub fn depth_attachment_layout(format: vk::Format) -> vk::ImageLayout {
    if has_stencil_component(format) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
    }
}

fn select_supported_format<F>(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut query: F,
) -> Option<vk::Format>
where
    F: FnMut(vk::Format) -> vk::FormatProperties,
{
    candidates.iter().copied().find(|&format| {
        let props = query(format);
        let available = match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features,
            _ => props.optimal_tiling_features,
        };
        available.contains(features)
    })
}

// Buffer and image functionality, used by the allocator.
impl Device {
    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference `buffer`.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must both be valid handles created from this
    /// device. `offset` must satisfy the buffer's memory requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `create_info` must be valid for the duration of the call.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// `image` must be owned by this device; its views must already be
    /// destroyed and no in-flight GPU work may reference it.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must be a valid handle created from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` and `memory` must both be valid handles created from this
    /// device. `offset` must satisfy the image's memory requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }

    /// # Safety
    /// Every range must lie within currently mapped, non-coherent memory
    /// owned by this device, aligned to `non_coherent_atom_size`.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: per this method's `# Safety` section.
        unsafe { self.handle.flush_mapped_memory_ranges(ranges) }
    }
}

impl RawDevice for Device {
    unsafe fn set_raw_object_name(
        &self,
        object_type: vk::ObjectType,
        raw_handle: u64,
        name: &CStr,
    ) -> Result<(), vk::Result> {
        let Some(debug_utils) = self.debug_utils_device.as_ref() else {
            return Ok(());
        };
        let object_name_info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle: raw_handle,
            p_object_name: name.as_ptr(),
            ..Default::default()
        };
        // SAFETY: trait contract.
        unsafe { debug_utils.set_debug_utils_object_name(&object_name_info) }
    }

    unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: trait contract.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: trait contract.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }

    unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: trait contract.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    unsafe fn destroy_raw_shader_module(
        &self,
        shader_module: vk::ShaderModule,
    ) {
        // SAFETY: trait contract.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }

    unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: trait contract.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        // SAFETY: trait contract.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: trait contract.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: trait contract.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: trait contract.
        unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        }
        .map_err(|(partial, result)| {
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

    unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: trait contract.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }

    unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: trait contract.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: trait contract.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    unsafe fn allocate_raw_descriptor_sets(
        &self,
        alloc_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: trait contract.
        unsafe { self.handle.allocate_descriptor_sets(alloc_info) }
    }

    unsafe fn update_raw_descriptor_sets(
        &self,
        descriptor_writes: &[vk::WriteDescriptorSet<'_>],
        descriptor_copies: &[vk::CopyDescriptorSet<'_>],
    ) {
        // SAFETY: trait contract.
        unsafe {
            self.handle
                .update_descriptor_sets(descriptor_writes, descriptor_copies)
        }
    }

    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: trait contract.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: trait contract.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    unsafe fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        match &self.vulkan13 {
            // SAFETY: trait contract.
            Vulkan13Commands::Core => unsafe {
                self.handle
                    .cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
            // SAFETY: trait contract.
            Vulkan13Commands::Extensions {
                synchronization2, ..
            } => unsafe {
                synchronization2
                    .cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
        }
    }

    unsafe fn cmd_begin_raw_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
        rendering_info: &vk::RenderingInfo<'_>,
    ) {
        match &self.vulkan13 {
            // SAFETY: trait contract.
            Vulkan13Commands::Core => unsafe {
                self.handle
                    .cmd_begin_rendering(command_buffer, rendering_info)
            },
            // SAFETY: trait contract.
            Vulkan13Commands::Extensions {
                dynamic_rendering, ..
            } => unsafe {
                dynamic_rendering
                    .cmd_begin_rendering(command_buffer, rendering_info)
            },
        }
    }

    unsafe fn cmd_end_raw_rendering(&self, command_buffer: vk::CommandBuffer) {
        match &self.vulkan13 {
            // SAFETY: trait contract.
            Vulkan13Commands::Core => unsafe {
                self.handle.cmd_end_rendering(command_buffer)
            },
            // SAFETY: trait contract.
            Vulkan13Commands::Extensions {
                dynamic_rendering, ..
            } => unsafe { dynamic_rendering.cmd_end_rendering(command_buffer) },
        }
    }

    unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        viewports: &[vk::Viewport],
    ) {
        // SAFETY: trait contract.
        unsafe { self.handle.cmd_set_viewport(command_buffer, 0, viewports) }
    }

    unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        scissors: &[vk::Rect2D],
    ) {
        // SAFETY: trait contract.
        unsafe { self.handle.cmd_set_scissor(command_buffer, 0, scissors) }
    }

    unsafe fn cmd_set_cull_mode(
        &self,
        command_buffer: vk::CommandBuffer,
        cull_mode: vk::CullModeFlags,
    ) {
        match &self.vulkan13 {
            // SAFETY: trait contract.
            Vulkan13Commands::Core => unsafe {
                self.handle.cmd_set_cull_mode(command_buffer, cull_mode)
            },
            // SAFETY: trait contract.
            Vulkan13Commands::Extensions {
                extended_dynamic_state,
                ..
            } => unsafe {
                extended_dynamic_state.cmd_set_cull_mode(command_buffer, cull_mode)
            },
        }
    }

    unsafe fn cmd_bind_graphics_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: trait contract.
        unsafe {
            self.handle.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            )
        }
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        // SAFETY: trait contract.
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

    unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: trait contract.
        unsafe {
            self.handle.cmd_bind_vertex_buffers(
                command_buffer,
                first_binding,
                buffers,
                offsets,
            )
        }
    }

    unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: trait contract.
        unsafe {
            self.handle.cmd_bind_index_buffer(
                command_buffer,
                buffer,
                offset,
                index_type,
            )
        }
    }

    unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: trait contract.
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
