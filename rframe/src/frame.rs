//! Per-frame command recording.
//!
//! [`FrameRecorder::record`] writes one complete frame into a command
//! buffer: layout transitions, a dynamic rendering pass over the target,
//! the bundle's pipeline and per-frame descriptor set, one indexed draw per
//! [`Drawable`], and the final transition to present. Submission,
//! presentation and CPU/GPU synchronisation stay with the caller;
//! [`FrameCounter`] only tracks which frame-in-flight slot is current.

use std::num::NonZeroU32;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::allocator::{AllocationError, BufferRequest, MemoryAllocator};
use crate::command::{CommandBuffer, ImageTransition};
use crate::device::depth_attachment_layout;
use crate::pipeline::PipelineBundle;
use crate::resource::{AllocatedBuffer, AllocatedImage, WriteBufferError};
use crate::vertex::Vertex;

#[derive(Debug, Error)]
pub enum RecordFrameError {
    #[error("Failed to begin command buffer: {0}")]
    Begin(vk::Result),

    #[error("Failed to end command buffer: {0}")]
    End(vk::Result),

    #[error(
        "No descriptor set for frame {frame_index} ({sets} sets allocated)"
    )]
    MissingDescriptorSet { frame_index: usize, sets: usize },
}

#[derive(Debug, Error)]
pub enum UploadMeshError {
    #[error("Mesh has no vertices")]
    NoVertices,

    #[error("Mesh has no indices")]
    NoIndices,

    #[error("Mesh has {0} indices, more than a u32 draw count can address")]
    TooManyIndices(usize),

    #[error("Failed to allocate mesh buffer: {0}")]
    Allocate(#[from] AllocationError),

    #[error("Failed to upload mesh data: {0}")]
    Write(#[from] WriteBufferError),
}

// ---------------------------------------------------------------------------
// FrameCounter
// ---------------------------------------------------------------------------

/// Cycles through frame-in-flight slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
    frames: NonZeroU32,
    counter: u64,
}

impl FrameCounter {
    pub fn new(frames: NonZeroU32) -> Self {
        Self { frames, counter: 0 }
    }

    pub fn frames(&self) -> u32 {
        self.frames.get()
    }

    /// Index of the current slot, in `0..frames`.
    pub fn current(&self) -> usize {
        (self.counter % u64::from(self.frames.get())) as usize
    }

    /// Frames advanced past so far.
    pub fn total(&self) -> u64 {
        self.counter
    }

    /// Move to the next slot. Call once per submitted frame.
    pub fn advance(&mut self) -> usize {
        self.counter = self.counter.wrapping_add(1);
        self.current()
    }
}

// ---------------------------------------------------------------------------
// FrameTarget
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DepthTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// Picks the barrier aspects and attachment layout.
    pub format: vk::Format,
}

/// The attachments one frame renders into.
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub depth: Option<DepthTarget>,
}

impl FrameTarget {
    /// A color-only target cleared to opaque black.
    pub fn new(
        color_image: vk::Image,
        color_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            color_image,
            color_view,
            extent,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            depth: None,
        }
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    pub fn with_depth(
        mut self,
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
    ) -> Self {
        self.depth = Some(DepthTarget {
            image,
            view,
            format,
        });
        self
    }

    /// Attach `image` and its view as the depth target. Images without a
    /// view are ignored.
    pub fn with_depth_image(self, image: &AllocatedImage) -> Self {
        match image.view() {
            Some(view) => {
                self.with_depth(image.raw(), view.raw_image_view(), image.format())
            }
            None => {
                tracing::warn!(
                    "Depth image {} has no view; rendering without depth",
                    image.name()
                );
                self
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Drawable / RenderMesh
// ---------------------------------------------------------------------------

/// Anything drawn with one vertex buffer at binding 0 and a `UINT32`
/// index buffer.
pub trait Drawable {
    fn vertex_buffer(&self) -> vk::Buffer;
    fn index_buffer(&self) -> vk::Buffer;
    fn index_count(&self) -> u32;
}

impl<T> Drawable for &T
where
    T: Drawable + ?Sized,
{
    fn vertex_buffer(&self) -> vk::Buffer {
        (*self).vertex_buffer()
    }

    fn index_buffer(&self) -> vk::Buffer {
        (*self).index_buffer()
    }

    fn index_count(&self) -> u32 {
        (*self).index_count()
    }
}

/// A vertex and index buffer pair.
#[derive(Debug)]
pub struct RenderMesh {
    vertex_buffer: AllocatedBuffer,
    index_buffer: AllocatedBuffer,
    index_count: u32,
}

impl RenderMesh {
    pub fn new(
        vertex_buffer: AllocatedBuffer,
        index_buffer: AllocatedBuffer,
        index_count: u32,
    ) -> Self {
        Self {
            vertex_buffer,
            index_buffer,
            index_count,
        }
    }

    /// Copy `vertices` and `indices` into new host-visible buffers.
    pub fn from_host(
        allocator: &Arc<dyn MemoryAllocator>,
        vertices: &[Vertex],
        indices: &[u32],
        name: &str,
    ) -> Result<Self, UploadMeshError> {
        if vertices.is_empty() {
            return Err(UploadMeshError::NoVertices);
        }
        if indices.is_empty() {
            return Err(UploadMeshError::NoIndices);
        }
        let index_count = draw_count(indices.len())?;

        let mut vertex_buffer = AllocatedBuffer::new(
            allocator,
            &BufferRequest::host_visible(
                size_of_val(vertices) as vk::DeviceSize,
                vk::BufferUsageFlags::VERTEX_BUFFER,
            ),
            &format!("{name} vertices"),
        )?;
        vertex_buffer.write_pod(vertices)?;

        let mut index_buffer = AllocatedBuffer::new(
            allocator,
            &BufferRequest::host_visible(
                size_of_val(indices) as vk::DeviceSize,
                vk::BufferUsageFlags::INDEX_BUFFER,
            ),
            &format!("{name} indices"),
        )?;
        index_buffer.write_pod(indices)?;

        tracing::debug!(
            "Uploaded mesh {name}: {} vertices, {} indices",
            vertices.len(),
            indices.len()
        );
        Ok(Self::new(vertex_buffer, index_buffer, index_count))
    }

    pub fn vertex_buffer_handle(&self) -> &AllocatedBuffer {
        &self.vertex_buffer
    }

    pub fn index_buffer_handle(&self) -> &AllocatedBuffer {
        &self.index_buffer
    }
}

fn draw_count(len: usize) -> Result<u32, UploadMeshError> {
    u32::try_from(len).map_err(|_| UploadMeshError::TooManyIndices(len))
}

impl Drawable for RenderMesh {
    fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex_buffer.raw()
    }

    fn index_buffer(&self) -> vk::Buffer {
        self.index_buffer.raw()
    }

    fn index_count(&self) -> u32 {
        self.index_count
    }
}

// ---------------------------------------------------------------------------
// FrameRecorder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRecorder {
    /// Passed to `vkBeginCommandBuffer`.
    pub usage: vk::CommandBufferUsageFlags,
}

impl FrameRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one frame of `drawables` into `cmd`.
    ///
    /// The descriptor set for `frame_index` is checked before anything is
    /// recorded.
    ///
    /// # Safety
    /// `cmd` must be in the initial state and not pending execution. The
    /// target images and views, the bundle's objects and every drawable's
    /// buffers must stay alive until the recorded work has finished.
    pub unsafe fn record(
        &self,
        cmd: &mut CommandBuffer,
        bundle: &PipelineBundle,
        target: &FrameTarget,
        drawables: &[&dyn Drawable],
        frame_index: usize,
    ) -> Result<(), RecordFrameError> {
        let descriptor_set = bundle.descriptor_set(frame_index).ok_or(
            RecordFrameError::MissingDescriptorSet {
                frame_index,
                sets: bundle.descriptor_sets().len(),
            },
        )?;
        let _span = tracing::debug_span!(
            "record_frame",
            pipeline = bundle.name(),
            frame_index,
            drawables = drawables.len()
        )
        .entered();

        let mut to_attachment =
            vec![ImageTransition::color_to_attachment(target.color_image)];
        if let Some(depth) = target.depth {
            to_attachment.push(ImageTransition::depth_to_attachment(
                depth.image,
                depth.format,
            ));
        }

        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(target.color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: target.clear_color,
                },
            })];
        let depth_attachment = target.depth.map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(depth_attachment_layout(depth.format))
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                })
        });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        // SAFETY: Caller guarantees cmd is in the initial state and that
        // every referenced object outlives execution. Commands are issued
        // in a valid order: transitions before the render pass, dynamic
        // state and binds before draws, and the present transition after
        // the render pass ends.
        unsafe {
            cmd.begin(self.usage).map_err(RecordFrameError::Begin)?;
            cmd.transition_images(&to_attachment);
            cmd.begin_rendering(&rendering_info);
            cmd.set_viewport(&[viewport]);
            cmd.set_scissor(&[render_area]);
            cmd.bind_graphics_pipeline(bundle.pipeline().raw_handle());
            cmd.set_cull_mode(bundle.rasterizer().cull_mode);
            cmd.bind_descriptor_sets(
                bundle.pipeline_layout().raw_handle(),
                0,
                &[descriptor_set],
            );
            for drawable in drawables {
                cmd.bind_vertex_buffer(0, drawable.vertex_buffer(), 0);
                cmd.bind_index_buffer(
                    drawable.index_buffer(),
                    0,
                    vk::IndexType::UINT32,
                );
                cmd.draw_indexed(drawable.index_count(), 1, 0, 0, 0);
            }
            cmd.end_rendering();
            cmd.transition_images(&[ImageTransition::color_to_present(
                target.color_image,
            )]);
            cmd.end().map_err(RecordFrameError::End)?;
        }
        Ok(())
    }
}
