//! The fixed vertex format shared by every pipeline.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Vertex layout consumed by every pipeline built by
/// [`PipelineBuilder`](crate::pipeline::PipelineBuilder).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(position: Vec3, normal: Vec3, color: Vec3) -> Self {
        Self {
            position,
            normal,
            color,
        }
    }

    /// Binding 0, one `Vertex` per vertex.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    /// Position, normal and color at locations 0, 1 and 2.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3]
    {
        let attribute = |location: u32, offset: usize| {
            vk::VertexInputAttributeDescription::default()
                .location(location)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset as u32)
        };
        [
            attribute(0, std::mem::offset_of!(Self, position)),
            attribute(1, std::mem::offset_of!(Self, normal)),
            attribute(2, std::mem::offset_of!(Self, color)),
        ]
    }
}
