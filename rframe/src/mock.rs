//! Recording test doubles for [`RawDevice`] and [`MemoryAllocator`].
//!
//! Handles are fake (`vk::Handle::from_raw` on a counter) and every call is
//! captured in a decoded, comparable form so tests can assert on exact
//! command order and create-info contents without a GPU.

use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk::{self, Handle};

use crate::allocator::{
    AllocationError, AllocationToken, BufferRequest, ImageRequest, MapError,
    MemoryAllocator, validate_memory_flags,
};
use crate::command::ImageTransition;
use crate::device::RawDevice;

/// Operations a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fail {
    ShaderModule,
    DescriptorSetLayout,
    GraphicsPipeline,
    DescriptorPool,
    BeginCommandBuffer,
    EndCommandBuffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutBindingRecord {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRecord {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule, String)>,
    pub vertex_stride: u32,
    pub vertex_attributes: Vec<(u32, vk::Format, u32)>,
    pub topology: vk::PrimitiveTopology,
    pub viewport_count: u32,
    pub scissor_count: u32,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub samples: vk::SampleCountFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub logic_op_enable: bool,
    pub color_write_masks: Vec<vk::ColorComponentFlags>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: vk::Format,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub buffers: Vec<(vk::Buffer, vk::DeviceSize, vk::DeviceSize)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderingRecord {
    pub width: u32,
    pub height: u32,
    pub layer_count: u32,
    pub color_views: Vec<vk::ImageView>,
    pub color_clear: Vec<[f32; 4]>,
    pub color_load_ops: Vec<vk::AttachmentLoadOp>,
    pub color_store_ops: Vec<vk::AttachmentStoreOp>,
    pub depth_view: Option<vk::ImageView>,
    pub depth_layout: Option<vk::ImageLayout>,
    pub depth_clear: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetName(vk::ObjectType, u64, String),
    CreateImageView(vk::ImageView, vk::Image, vk::ImageAspectFlags),
    DestroyImageView(vk::ImageView),
    CreateShaderModule(vk::ShaderModule, usize),
    DestroyShaderModule(vk::ShaderModule),
    CreateDescriptorSetLayout(vk::DescriptorSetLayout, Vec<LayoutBindingRecord>),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreatePipelineLayout(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>),
    DestroyPipelineLayout(vk::PipelineLayout),
    CreateGraphicsPipeline(Box<PipelineRecord>),
    DestroyPipeline(vk::Pipeline),
    CreateDescriptorPool {
        pool: vk::DescriptorPool,
        max_sets: u32,
        flags: vk::DescriptorPoolCreateFlags,
        sizes: Vec<(vk::DescriptorType, u32)>,
    },
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSets {
        pool: vk::DescriptorPool,
        layouts: Vec<vk::DescriptorSetLayout>,
        sets: Vec<vk::DescriptorSet>,
    },
    UpdateDescriptorSets(Vec<WriteRecord>),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    PipelineBarrier(Vec<ImageTransition>),
    BeginRendering(RenderingRecord),
    EndRendering,
    SetViewport(Vec<[f32; 6]>),
    SetScissor(Vec<(i32, i32, u32, u32)>),
    SetCullMode(vk::CullModeFlags),
    BindPipeline(vk::Pipeline),
    BindDescriptorSets(vk::PipelineLayout, u32, Vec<vk::DescriptorSet>),
    BindVertexBuffers(u32, Vec<vk::Buffer>, Vec<vk::DeviceSize>),
    BindIndexBuffer(vk::Buffer, vk::DeviceSize, vk::IndexType),
    DrawIndexed(u32, u32, u32, i32, u32),
}

#[derive(Debug, Default)]
pub struct MockDevice {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<Fail>>,
    next_handle: AtomicU64,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(0x100),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_on(&self, op: Fail) {
        self.failing.lock().unwrap().insert(op);
    }

    /// Calls recorded after the last `BeginCommandBuffer`, names excluded.
    pub fn recorded_commands(&self) -> Vec<Call> {
        let calls = self.calls();
        let start = calls
            .iter()
            .rposition(|c| matches!(c, Call::BeginCommandBuffer(_)))
            .unwrap_or(0);
        calls[start..]
            .iter()
            .filter(|c| !matches!(c, Call::SetName(..)))
            .cloned()
            .collect()
    }

    pub fn update_calls(&self) -> Vec<Vec<WriteRecord>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::UpdateDescriptorSets(writes) => Some(writes),
                _ => None,
            })
            .collect()
    }

    pub fn pipelines(&self) -> Vec<PipelineRecord> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateGraphicsPipeline(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn fails(&self, op: Fail) -> bool {
        self.failing.lock().unwrap().contains(&op)
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

/// Slice view over a Vulkan count/pointer pair; empty for null pointers.
///
/// # Safety
/// `ptr` must be null or valid for `count` reads.
unsafe fn slice<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        // SAFETY: Caller guarantees ptr is valid for count elements.
        unsafe { std::slice::from_raw_parts(ptr, count as usize) }
    }
}

impl RawDevice for MockDevice {
    unsafe fn set_raw_object_name(
        &self,
        object_type: vk::ObjectType,
        raw_handle: u64,
        name: &CStr,
    ) -> Result<(), vk::Result> {
        self.record(Call::SetName(
            object_type,
            raw_handle,
            name.to_string_lossy().into_owned(),
        ));
        Ok(())
    }

    unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        let view = self.handle();
        self.record(Call::CreateImageView(
            view,
            create_info.image,
            create_info.subresource_range.aspect_mask,
        ));
        Ok(view)
    }

    unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        self.record(Call::DestroyImageView(image_view));
    }

    unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        if self.fails(Fail::ShaderModule) {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        let module = self.handle();
        self.record(Call::CreateShaderModule(module, create_info.code_size / 4));
        Ok(module)
    }

    unsafe fn destroy_raw_shader_module(&self, shader_module: vk::ShaderModule) {
        self.record(Call::DestroyShaderModule(shader_module));
    }

    unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        if self.fails(Fail::DescriptorSetLayout) {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let layout = self.handle();
        // SAFETY: create_info comes from the code under test and points at
        // live binding storage.
        let bindings =
            unsafe { slice(create_info.p_bindings, create_info.binding_count) };
        self.record(Call::CreateDescriptorSetLayout(
            layout,
            bindings
                .iter()
                .map(|b| LayoutBindingRecord {
                    binding: b.binding,
                    descriptor_type: b.descriptor_type,
                    count: b.descriptor_count,
                    stages: b.stage_flags,
                })
                .collect(),
        ));
        Ok(layout)
    }

    unsafe fn destroy_raw_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) {
        self.record(Call::DestroyDescriptorSetLayout(layout));
    }

    unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        let layout = self.handle();
        // SAFETY: create_info points at live set layout storage.
        let set_layouts = unsafe {
            slice(create_info.p_set_layouts, create_info.set_layout_count)
        };
        self.record(Call::CreatePipelineLayout(layout, set_layouts.to_vec()));
        Ok(layout)
    }

    unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.record(Call::DestroyPipelineLayout(layout));
    }

    unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        if self.fails(Fail::GraphicsPipeline) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let handle = self.handle();
        // SAFETY: every pointer in create_info was set by the pipeline
        // builder from storage alive for the duration of this call.
        let record = unsafe { decode_pipeline(handle, create_info) };
        self.record(Call::CreateGraphicsPipeline(Box::new(record)));
        Ok(handle)
    }

    unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        self.record(Call::DestroyPipeline(pipeline));
    }

    unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        if self.fails(Fail::DescriptorPool) {
            return Err(vk::Result::ERROR_FRAGMENTATION);
        }
        let pool = self.handle();
        // SAFETY: create_info points at live pool size storage.
        let sizes = unsafe {
            slice(create_info.p_pool_sizes, create_info.pool_size_count)
        };
        self.record(Call::CreateDescriptorPool {
            pool,
            max_sets: create_info.max_sets,
            flags: create_info.flags,
            sizes: sizes.iter().map(|s| (s.ty, s.descriptor_count)).collect(),
        });
        Ok(pool)
    }

    unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.record(Call::DestroyDescriptorPool(pool));
    }

    unsafe fn allocate_raw_descriptor_sets(
        &self,
        alloc_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: alloc_info points at live layout storage.
        let layouts = unsafe {
            slice(alloc_info.p_set_layouts, alloc_info.descriptor_set_count)
        };
        let sets: Vec<vk::DescriptorSet> =
            layouts.iter().map(|_| self.handle()).collect();
        self.record(Call::AllocateDescriptorSets {
            pool: alloc_info.descriptor_pool,
            layouts: layouts.to_vec(),
            sets: sets.clone(),
        });
        Ok(sets)
    }

    unsafe fn update_raw_descriptor_sets(
        &self,
        descriptor_writes: &[vk::WriteDescriptorSet<'_>],
        _descriptor_copies: &[vk::CopyDescriptorSet<'_>],
    ) {
        let writes = descriptor_writes
            .iter()
            .map(|w| {
                // SAFETY: buffer info storage outlives the update call.
                let infos =
                    unsafe { slice(w.p_buffer_info, w.descriptor_count) };
                WriteRecord {
                    set: w.dst_set,
                    binding: w.dst_binding,
                    array_element: w.dst_array_element,
                    descriptor_type: w.descriptor_type,
                    descriptor_count: w.descriptor_count,
                    buffers: infos
                        .iter()
                        .map(|i| (i.buffer, i.offset, i.range))
                        .collect(),
                }
            })
            .collect();
        self.record(Call::UpdateDescriptorSets(writes));
    }

    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        if self.fails(Fail::BeginCommandBuffer) {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        self.record(Call::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        if self.fails(Fail::EndCommandBuffer) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.record(Call::EndCommandBuffer(command_buffer));
        Ok(())
    }

    unsafe fn cmd_pipeline_barrier2(
        &self,
        _command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        // SAFETY: barrier storage outlives the call.
        let barriers = unsafe {
            slice(
                dependency_info.p_image_memory_barriers,
                dependency_info.image_memory_barrier_count,
            )
        };
        self.record(Call::PipelineBarrier(
            barriers
                .iter()
                .map(|b| ImageTransition {
                    image: b.image,
                    old_layout: b.old_layout,
                    new_layout: b.new_layout,
                    src_stage: b.src_stage_mask,
                    src_access: b.src_access_mask,
                    dst_stage: b.dst_stage_mask,
                    dst_access: b.dst_access_mask,
                    aspect: b.subresource_range.aspect_mask,
                })
                .collect(),
        ));
    }

    unsafe fn cmd_begin_raw_rendering(
        &self,
        _command_buffer: vk::CommandBuffer,
        rendering_info: &vk::RenderingInfo<'_>,
    ) {
        // SAFETY: attachment storage outlives the call.
        let colors = unsafe {
            slice(
                rendering_info.p_color_attachments,
                rendering_info.color_attachment_count,
            )
        };
        // SAFETY: as above.
        let depth = unsafe { rendering_info.p_depth_attachment.as_ref() };
        self.record(Call::BeginRendering(RenderingRecord {
            width: rendering_info.render_area.extent.width,
            height: rendering_info.render_area.extent.height,
            layer_count: rendering_info.layer_count,
            color_views: colors.iter().map(|c| c.image_view).collect(),
            // SAFETY: color attachments are cleared through the float
            // member of the union.
            color_clear: colors
                .iter()
                .map(|c| unsafe { c.clear_value.color.float32 })
                .collect(),
            color_load_ops: colors.iter().map(|c| c.load_op).collect(),
            color_store_ops: colors.iter().map(|c| c.store_op).collect(),
            depth_view: depth.map(|d| d.image_view),
            depth_layout: depth.map(|d| d.image_layout),
            // SAFETY: depth attachments are cleared through depth_stencil.
            depth_clear: depth
                .map(|d| unsafe { d.clear_value.depth_stencil.depth }),
        }));
    }

    unsafe fn cmd_end_raw_rendering(&self, _command_buffer: vk::CommandBuffer) {
        self.record(Call::EndRendering);
    }

    unsafe fn cmd_set_viewport(
        &self,
        _command_buffer: vk::CommandBuffer,
        viewports: &[vk::Viewport],
    ) {
        self.record(Call::SetViewport(
            viewports
                .iter()
                .map(|v| [v.x, v.y, v.width, v.height, v.min_depth, v.max_depth])
                .collect(),
        ));
    }

    unsafe fn cmd_set_scissor(
        &self,
        _command_buffer: vk::CommandBuffer,
        scissors: &[vk::Rect2D],
    ) {
        self.record(Call::SetScissor(
            scissors
                .iter()
                .map(|s| {
                    (s.offset.x, s.offset.y, s.extent.width, s.extent.height)
                })
                .collect(),
        ));
    }

    unsafe fn cmd_set_cull_mode(
        &self,
        _command_buffer: vk::CommandBuffer,
        cull_mode: vk::CullModeFlags,
    ) {
        self.record(Call::SetCullMode(cull_mode));
    }

    unsafe fn cmd_bind_graphics_pipeline(
        &self,
        _command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) {
        self.record(Call::BindPipeline(pipeline));
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        _command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        _dynamic_offsets: &[u32],
    ) {
        self.record(Call::BindDescriptorSets(
            layout,
            first_set,
            descriptor_sets.to_vec(),
        ));
    }

    unsafe fn cmd_bind_vertex_buffers(
        &self,
        _command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        self.record(Call::BindVertexBuffers(
            first_binding,
            buffers.to_vec(),
            offsets.to_vec(),
        ));
    }

    unsafe fn cmd_bind_index_buffer(
        &self,
        _command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.record(Call::BindIndexBuffer(buffer, offset, index_type));
    }

    unsafe fn cmd_draw_indexed(
        &self,
        _command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record(Call::DrawIndexed(
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        ));
    }
}

/// # Safety
/// Every pointer reachable from `ci` must be valid.
unsafe fn decode_pipeline(
    handle: vk::Pipeline,
    ci: &vk::GraphicsPipelineCreateInfo<'_>,
) -> PipelineRecord {
    // SAFETY: Caller guarantees pointer validity for everything below.
    unsafe {
        let stages: Vec<_> = slice(ci.p_stages, ci.stage_count)
            .iter()
            .map(|s| {
                let name = CStr::from_ptr(s.p_name).to_string_lossy().into_owned();
                (s.stage, s.module, name)
            })
            .collect();
        let vertex_input = &*ci.p_vertex_input_state;
        let vertex_bindings = slice(
            vertex_input.p_vertex_binding_descriptions,
            vertex_input.vertex_binding_description_count,
        );
        let vertex_attributes: Vec<_> = slice(
            vertex_input.p_vertex_attribute_descriptions,
            vertex_input.vertex_attribute_description_count,
        )
        .iter()
        .map(|a| (a.location, a.format, a.offset))
        .collect();
        let input_assembly = &*ci.p_input_assembly_state;
        let viewport = &*ci.p_viewport_state;
        let raster = &*ci.p_rasterization_state;
        let multisample = &*ci.p_multisample_state;
        let depth = &*ci.p_depth_stencil_state;
        let blend = &*ci.p_color_blend_state;
        let dynamic = &*ci.p_dynamic_state;

        let mut color_formats = Vec::new();
        let mut depth_format = vk::Format::UNDEFINED;
        let mut next = ci.p_next as *const vk::BaseInStructure<'_>;
        while let Some(header) = next.as_ref() {
            if header.s_type == vk::StructureType::PIPELINE_RENDERING_CREATE_INFO
            {
                let rendering =
                    &*(next as *const vk::PipelineRenderingCreateInfo<'_>);
                color_formats = slice(
                    rendering.p_color_attachment_formats,
                    rendering.color_attachment_count,
                )
                .to_vec();
                depth_format = rendering.depth_attachment_format;
            }
            next = header.p_next;
        }

        PipelineRecord {
            handle,
            layout: ci.layout,
            stages,
            vertex_stride: vertex_bindings.first().map_or(0, |b| b.stride),
            vertex_attributes,
            topology: input_assembly.topology,
            viewport_count: viewport.viewport_count,
            scissor_count: viewport.scissor_count,
            polygon_mode: raster.polygon_mode,
            cull_mode: raster.cull_mode,
            front_face: raster.front_face,
            line_width: raster.line_width,
            samples: multisample.rasterization_samples,
            depth_test: depth.depth_test_enable == vk::TRUE,
            depth_write: depth.depth_write_enable == vk::TRUE,
            depth_compare: depth.depth_compare_op,
            logic_op_enable: blend.logic_op_enable == vk::TRUE,
            color_write_masks: slice(blend.p_attachments, blend.attachment_count)
                .iter()
                .map(|a| a.color_write_mask)
                .collect(),
            dynamic_states: slice(
                dynamic.p_dynamic_states,
                dynamic.dynamic_state_count,
            )
            .to_vec(),
            color_formats,
            depth_format,
        }
    }
}

// ---------------------------------------------------------------------------
// MockAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockObject {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

#[derive(Debug)]
struct MockAllocation {
    object: MockObject,
    flags: vk::MemoryPropertyFlags,
    bytes: Box<[u8]>,
}

#[derive(Debug, Default)]
struct MockAllocatorState {
    next_id: u64,
    live: HashMap<AllocationToken, MockAllocation>,
    destroyed: Vec<(MockObject, AllocationToken)>,
    maps: usize,
    unmaps: usize,
    fail_next: bool,
}

/// Counting [`MemoryAllocator`] double. Host-visible allocations are backed
/// by heap memory so mapped writes can be read back.
#[derive(Debug, Default)]
pub struct MockAllocator {
    state: Mutex<MockAllocatorState>,
}

impl MockAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn destroyed(&self) -> Vec<(MockObject, AllocationToken)> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn map_count(&self) -> usize {
        self.state.lock().unwrap().maps
    }

    pub fn unmap_count(&self) -> usize {
        self.state.lock().unwrap().unmaps
    }

    pub fn contents(&self, token: AllocationToken) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .live
            .get(&token)
            .map(|a| a.bytes.to_vec())
    }

    /// Make the next create call fail with an out-of-memory error.
    pub fn fail_next_allocation(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    fn insert(
        &self,
        make_object: impl FnOnce(u64) -> MockObject,
        flags: vk::MemoryPropertyFlags,
        len: usize,
    ) -> Result<(MockObject, AllocationToken), AllocationError> {
        validate_memory_flags(flags)?;
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next) {
            return Err(AllocationError::AllocateMemory(
                gpu_allocator::AllocationError::OutOfMemory,
            ));
        }
        state.next_id += 1;
        let token = AllocationToken::from_raw(state.next_id);
        let object = make_object(0x1_0000 + state.next_id);
        let bytes = if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            vec![0u8; len].into_boxed_slice()
        } else {
            Box::default()
        };
        state.live.insert(
            token,
            MockAllocation {
                object,
                flags,
                bytes,
            },
        );
        Ok((object, token))
    }

    fn remove(
        &self,
        object: MockObject,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        let mut state = self.state.lock().unwrap();
        match state.live.remove(&token) {
            Some(live) if live.object == object => {
                state.destroyed.push((object, token));
                Ok(())
            }
            _ => Err(AllocationError::UnknownAllocation(token)),
        }
    }
}

impl MemoryAllocator for MockAllocator {
    fn create_buffer(
        &self,
        request: &BufferRequest,
        _name: &str,
    ) -> Result<(vk::Buffer, AllocationToken), AllocationError> {
        if request.size == 0 {
            return Err(AllocationError::ZeroSize);
        }
        let (object, token) = self.insert(
            |raw| MockObject::Buffer(vk::Buffer::from_raw(raw)),
            request.memory_flags,
            request.size as usize,
        )?;
        match object {
            MockObject::Buffer(buffer) => Ok((buffer, token)),
            MockObject::Image(_) => unreachable!(),
        }
    }

    fn create_image(
        &self,
        request: &ImageRequest,
        _name: &str,
    ) -> Result<(vk::Image, AllocationToken), AllocationError> {
        if request.extent.width == 0 || request.extent.height == 0 {
            return Err(AllocationError::ZeroSize);
        }
        let (object, token) = self.insert(
            |raw| MockObject::Image(vk::Image::from_raw(raw)),
            request.memory_flags,
            0,
        )?;
        match object {
            MockObject::Image(image) => Ok((image, token)),
            MockObject::Buffer(_) => unreachable!(),
        }
    }

    unsafe fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        self.remove(MockObject::Buffer(buffer), token)
    }

    unsafe fn destroy_image(
        &self,
        image: vk::Image,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        self.remove(MockObject::Image(image), token)
    }

    fn map(&self, token: AllocationToken) -> Result<NonNull<u8>, MapError> {
        let mut state = self.state.lock().unwrap();
        state.maps += 1;
        let live = state
            .live
            .get_mut(&token)
            .ok_or(MapError::UnknownAllocation(token))?;
        if !live.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(MapError::NotHostVisible);
        }
        NonNull::new(live.bytes.as_mut_ptr()).ok_or(MapError::NotMapped)
    }

    fn unmap(&self, _token: AllocationToken) {
        self.state.lock().unwrap().unmaps += 1;
    }

    fn flush(
        &self,
        token: AllocationToken,
        _offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> Result<(), MapError> {
        let state = self.state.lock().unwrap();
        if !state.live.contains_key(&token) {
            return Err(MapError::UnknownAllocation(token));
        }
        Ok(())
    }

    fn memory_properties(
        &self,
        token: AllocationToken,
    ) -> Option<vk::MemoryPropertyFlags> {
        self.state.lock().unwrap().live.get(&token).map(|a| a.flags)
    }
}
