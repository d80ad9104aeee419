//! GPU resource ownership and pipeline construction for a Vulkan renderer,
//! built on [`ash`] and `gpu-allocator`.
//!
//! The crate does not create instances, windows or swapchains. It adopts
//! a logical device and an allocator from the caller, and the caller
//! submits and presents what it records.
//!
//! # Object hierarchy
//!
//! ```text
//! Device (RawDevice)
//! ├── GpuAllocator (MemoryAllocator)
//! │   ├── AllocatedBuffer → MappedUniformSlot
//! │   └── AllocatedImage → ImageView
//! ├── ShaderModule
//! └── PipelineBundle
//!     ├── DescriptorSetLayout → PipelineLayout → Pipeline
//!     └── DescriptorPool → DescriptorSet (one per frame in flight)
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be
//! destroyed while children are alive. [`frame::FrameRecorder`] records a
//! complete dynamic-rendering frame into a caller-owned command buffer.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod allocator;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod pipeline;
pub mod resource;
pub mod shader;
pub mod uniform;
pub mod vertex;

#[cfg(test)]
mod mock;

pub use ash;
