//! Command recording over a caller-owned command buffer, and the image
//! layout transitions a frame needs.

use std::sync::Arc;

use ash::vk;

use crate::descriptor::DescriptorSet;
use crate::device::{RawDevice, depth_aspect_mask, depth_attachment_layout};
use crate::resource::BufferHandle;

// ---------------------------------------------------------------------------
// ImageTransition
// ---------------------------------------------------------------------------

/// One image layout transition, recorded as a synchronization2 image
/// barrier over mip 0 / layer 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageTransition {
    /// `UNDEFINED` to `COLOR_ATTACHMENT_OPTIMAL`, discarding previous
    /// contents.
    pub fn color_to_attachment(image: vk::Image) -> Self {
        Self {
            image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// `UNDEFINED` to the attachment layout of `format`. Combined
    /// depth/stencil formats transition both aspects to
    /// `DEPTH_STENCIL_ATTACHMENT_OPTIMAL`.
    pub fn depth_to_attachment(image: vk::Image, format: vk::Format) -> Self {
        let fragment_tests = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
        Self {
            image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: depth_attachment_layout(format),
            src_stage: fragment_tests,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: fragment_tests,
            dst_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            aspect: depth_aspect_mask(format),
        }
    }

    /// `COLOR_ATTACHMENT_OPTIMAL` to `PRESENT_SRC_KHR` after the last
    /// color write.
    pub fn color_to_present(image: vk::Image) -> Self {
        Self {
            image,
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            dst_access: vk::AccessFlags2::NONE,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    pub fn to_barrier(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            )
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// Recording wrapper over a primary command buffer owned elsewhere.
///
/// The buffer is neither allocated nor freed here; its pool belongs to the
/// caller. All recording operations are `unsafe`: the caller is
/// responsible for correct Vulkan state sequencing.
pub struct CommandBuffer {
    parent: Arc<dyn RawDevice>,
    handle: vk::CommandBuffer,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    /// Wrap a raw command buffer.
    ///
    /// # Safety
    /// `handle` must have been allocated from a pool of `device`, and must
    /// outlive this wrapper. Access to it must be externally synchronized.
    pub unsafe fn from_raw(
        device: &Arc<dyn RawDevice>,
        handle: vk::CommandBuffer,
    ) -> Self {
        Self {
            parent: Arc::clone(device),
            handle,
        }
    }

    /// Begin recording.
    ///
    /// # Safety
    /// The buffer must be in the initial state (freshly allocated or reset).
    pub unsafe fn begin(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: Caller guarantees the buffer is in the initial state.
        unsafe { self.parent.begin_raw_command_buffer(self.handle, &begin_info) }
    }

    /// End recording.
    ///
    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is in the recording state.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
    }

    /// Record all `transitions` as a single barrier batch. An empty slice
    /// records nothing.
    ///
    /// # Safety
    /// The buffer must be in the recording state and every image must be a
    /// valid handle whose current layout matches `old_layout` (or is being
    /// discarded through `UNDEFINED`).
    pub unsafe fn transition_images(&mut self, transitions: &[ImageTransition]) {
        if transitions.is_empty() {
            return;
        }
        let barriers: Vec<vk::ImageMemoryBarrier2<'_>> =
            transitions.iter().map(ImageTransition::to_barrier).collect();
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(&barriers);
        // SAFETY: Caller guarantees recording state and image validity.
        unsafe {
            self.parent
                .cmd_pipeline_barrier2(self.handle, &dependency_info)
        }
    }

    /// Begin a dynamic render pass.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `rendering_info` and all
    /// objects it references must be valid for the duration of the render pass.
    /// All images must already be in the layouts declared in `rendering_info`.
    pub unsafe fn begin_rendering(&mut self, rendering_info: &vk::RenderingInfo<'_>) {
        // SAFETY: Caller guarantees recording state and
        // rendering_info validity.
        unsafe {
            self.parent
                .cmd_begin_raw_rendering(self.handle, rendering_info)
        }
    }

    /// End the current dynamic render pass.
    ///
    /// # Safety
    /// The buffer must be inside a render pass begun with
    /// [`begin_rendering`](Self::begin_rendering).
    pub unsafe fn end_rendering(&mut self) {
        // SAFETY: Caller guarantees active render pass state.
        unsafe { self.parent.cmd_end_raw_rendering(self.handle) }
    }

    /// Set the viewport dynamically.
    ///
    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn set_viewport(&mut self, viewports: &[vk::Viewport]) {
        // SAFETY: Caller guarantees recording state.
        unsafe { self.parent.cmd_set_viewport(self.handle, viewports) }
    }

    /// Set the scissor rectangle dynamically.
    ///
    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn set_scissor(&mut self, scissors: &[vk::Rect2D]) {
        // SAFETY: Caller guarantees recording state.
        unsafe { self.parent.cmd_set_scissor(self.handle, scissors) }
    }

    /// Set the cull mode dynamically.
    ///
    /// # Safety
    /// The buffer must be in the recording state and extended dynamic state
    /// must be enabled on the device.
    pub unsafe fn set_cull_mode(&mut self, cull_mode: vk::CullModeFlags) {
        // SAFETY: Caller guarantees recording state and feature support.
        unsafe { self.parent.cmd_set_cull_mode(self.handle, cull_mode) }
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

    /// Bind descriptor sets to the graphics bind point.
    ///
    /// # Safety
    /// The buffer must be in the recording state. `sets` must be compatible
    /// with `layout` starting at `first_set`, and every descriptor they hold
    /// must stay valid until the buffer finishes executing.
    pub unsafe fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[DescriptorSet],
    ) {
        let raw_sets: Vec<vk::DescriptorSet> =
            sets.iter().map(DescriptorSet::raw_descriptor_set).collect();
        // SAFETY: Caller guarantees recording state and set validity.
        unsafe {
            self.parent.cmd_bind_descriptor_sets(
                self.handle,
                layout,
                first_set,
                &raw_sets,
                &[],
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
        // SAFETY: Caller guarantees recording state and buffer validity.
        unsafe {
            self.parent.cmd_bind_vertex_buffers(
                self.handle,
                binding,
                &[buffer.raw_buffer()],
                &[offset],
            )
        }
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

    /// Record an indexed draw call.
    ///
    /// # Safety
    /// The buffer must be in the recording state inside an active render
    /// pass, with a compatible graphics pipeline bound, all required
    /// dynamic state set, and a valid index buffer bound.
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, Fail, MockDevice};
    use ash::vk::Handle;

    fn command_buffer() -> (Arc<MockDevice>, CommandBuffer) {
        let mock = MockDevice::new();
        let device: Arc<dyn RawDevice> = mock.clone();
        // SAFETY: the mock device accepts any handle.
        let cmd =
            unsafe { CommandBuffer::from_raw(&device, vk::CommandBuffer::from_raw(7)) };
        (mock, cmd)
    }

    #[test]
    fn transitions_are_recorded_as_one_batch() {
        let (mock, mut cmd) = command_buffer();
        let color = vk::Image::from_raw(1);
        let depth = vk::Image::from_raw(2);
        // SAFETY: recording into a mock.
        unsafe {
            cmd.transition_images(&[
                ImageTransition::color_to_attachment(color),
                ImageTransition::depth_to_attachment(depth, vk::Format::D32_SFLOAT),
            ]);
        }
        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        let Call::PipelineBarrier(barriers) = &calls[0] else {
            panic!("expected a barrier, got {:?}", calls[0]);
        };
        assert_eq!(
            barriers[0],
            ImageTransition {
                image: color,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                src_access: vk::AccessFlags2::NONE,
                dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                aspect: vk::ImageAspectFlags::COLOR,
            }
        );
        assert_eq!(barriers[1].image, depth);
        assert_eq!(barriers[1].new_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        assert_eq!(barriers[1].aspect, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn stencil_depth_transition_covers_both_aspects() {
        let barrier = ImageTransition::depth_to_attachment(
            vk::Image::from_raw(4),
            vk::Format::D24_UNORM_S8_UINT,
        )
        .to_barrier();
        assert_eq!(
            barrier.new_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            barrier.subresource_range.aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn empty_transition_list_records_nothing() {
        let (mock, mut cmd) = command_buffer();
        // SAFETY: recording into a mock.
        unsafe { cmd.transition_images(&[]) };
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn present_transition_waits_for_color_writes() {
        let barrier = ImageTransition::color_to_present(vk::Image::from_raw(3))
            .to_barrier();
        assert_eq!(barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        assert_eq!(barrier.subresource_range.layer_count, 1);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn begin_failure_is_returned() {
        let (mock, mut cmd) = command_buffer();
        mock.fail_on(Fail::BeginCommandBuffer);
        // SAFETY: recording into a mock.
        let result = unsafe { cmd.begin(vk::CommandBufferUsageFlags::empty()) };
        assert_eq!(result, Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
    }
}
