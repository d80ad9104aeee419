//! Descriptor set layout, pool, and set wrappers, plus the per-frame
//! write step.
//!
//! [`DescriptorSetLayout`] describes the binding slots within a
//! descriptor set and remembers the [`DescriptorBindingSpec`] list it was
//! built from. [`create_descriptor_pool`] sizes a pool from that list and
//! [`create_descriptor_sets`] allocates one set per frame in flight, all
//! sharing the one layout. [`write_descriptor_sets`] then points every
//! binding of every frame's set at that frame's buffers.

use std::sync::Arc;

use ash::vk;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::RawDevice;
use crate::resource::DescriptorBuffer;

// ---------------------------------------------------------------------------
// DescriptorKind / DescriptorBindingSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    Sampler,
}

impl DescriptorKind {
    pub fn is_buffer(self) -> bool {
        matches!(self, Self::UniformBuffer | Self::StorageBuffer)
    }
}

impl From<DescriptorKind> for vk::DescriptorType {
    fn from(kind: DescriptorKind) -> Self {
        match kind {
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::CombinedImageSampler => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        }
    }
}

/// Describes a single binding within a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBindingSpec {
    /// Binding slot index used by the shader.
    pub binding: u32,
    /// Type of descriptor at this binding.
    pub kind: DescriptorKind,
    /// Number of descriptors in this binding (array length).
    pub count: u32,
    /// Shader stages that can access this binding.
    pub stages: vk::ShaderStageFlags,
}

impl DescriptorBindingSpec {
    pub fn uniform(
        binding: u32,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            kind: DescriptorKind::UniformBuffer,
            count,
            stages,
        }
    }
}

impl From<DescriptorBindingSpec> for vk::DescriptorSetLayoutBinding<'static> {
    fn from(b: DescriptorBindingSpec) -> Self {
        vk::DescriptorSetLayoutBinding::default()
            .binding(b.binding)
            .descriptor_type(b.kind.into())
            .descriptor_count(b.count)
            .stage_flags(b.stages)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PoolCreationError {
    #[error("No uniform or storage buffer bindings to size the pool from")]
    NoBufferBindings,

    #[error("Frames in flight must be at least 1")]
    ZeroFrames,

    #[error("Summed {0:?} descriptor count does not fit in a u32")]
    CountOverflow(DescriptorKind),

    #[error("Vulkan error creating descriptor pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateSetsError {
    #[error("Frames in flight must be at least 1")]
    ZeroFrames,

    #[error("Vulkan error allocating descriptor sets: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteDescriptorError {
    #[error("{resources} binding resources supplied for {bindings} bindings")]
    ResourceCountMismatch { bindings: usize, resources: usize },

    #[error("Binding {binding} has count 1 and expects per-frame buffers")]
    ExpectedSingle { binding: u32 },

    #[error(
        "Binding {binding} has count {count} and expects an array of \
         per-frame buffers"
    )]
    ExpectedArray { binding: u32, count: u32 },

    #[error(
        "Binding {binding} expects {expected} array elements, got {actual}"
    )]
    ArrayLengthMismatch {
        binding: u32,
        expected: u32,
        actual: usize,
    },

    #[error(
        "Binding {binding} (element {element}) covers {available} frames, \
         {frames} needed"
    )]
    MissingFrame {
        binding: u32,
        element: u32,
        available: usize,
        frames: usize,
    },

    #[error("{sets} descriptor sets available for {frames} frames")]
    NotEnoughSets { sets: usize, frames: usize },

    #[error("No descriptor sets have been allocated")]
    NoDescriptorSets,

    #[error("Binding {binding} has non-buffer kind {kind:?}")]
    UnsupportedKind { binding: u32, kind: DescriptorKind },
}

// ---------------------------------------------------------------------------
// DescriptorSetLayout
// ---------------------------------------------------------------------------

/// An owned wrapper around a `VkDescriptorSetLayout`.
pub struct DescriptorSetLayout {
    parent: Arc<dyn RawDevice>,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBindingSpec>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    /// Create a descriptor set layout from a slice of binding
    /// descriptions.
    pub fn new(
        device: &Arc<dyn RawDevice>,
        bindings: &[DescriptorBindingSpec],
    ) -> Result<Self, vk::Result> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> =
            bindings.iter().copied().map(Into::into).collect();
        let create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        // SAFETY: create_info references valid binding descriptions
        // for the duration of this call.
        let handle =
            unsafe { device.create_raw_descriptor_set_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
            bindings: bindings.to_vec(),
        })
    }

    pub fn raw_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn bindings(&self) -> &[DescriptorBindingSpec] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: handle was created from parent and is being
        // destroyed during teardown. No pipeline layout that used
        // this layout may still be alive.
        unsafe { self.parent.destroy_raw_descriptor_set_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorPool
// ---------------------------------------------------------------------------

/// An owned wrapper around a `VkDescriptorPool`.
///
/// All sets allocated from a pool are freed implicitly when the pool is
/// dropped.
pub struct DescriptorPool {
    parent: Arc<dyn RawDevice>,
    handle: vk::DescriptorPool,
    max_sets: u32,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .field("max_sets", &self.max_sets)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    /// Create a descriptor pool with `FREE_DESCRIPTOR_SET`.
    ///
    /// `max_sets` is the total number of descriptor sets that may be
    /// allocated from this pool. `pool_sizes` specifies the capacity
    /// per descriptor type.
    pub fn new(
        device: &Arc<dyn RawDevice>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self, vk::Result> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        // SAFETY: create_info is valid and references only stack data.
        let handle = unsafe { device.create_raw_descriptor_pool(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
            max_sets,
        })
    }

    pub fn raw_descriptor_pool(&self) -> vk::DescriptorPool {
        self.handle
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Allocate one descriptor set per provided layout.
    ///
    /// The returned sets are freed implicitly when this pool is
    /// dropped. The caller must not use them after the pool has been
    /// destroyed.
    pub fn allocate_sets(
        &self,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<Vec<DescriptorSet>, vk::Result> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> = layouts
            .iter()
            .map(|l| l.raw_descriptor_set_layout())
            .collect();
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&raw_layouts);
        // SAFETY: alloc_info references a valid pool and valid
        // layouts, all created from self.parent.
        let raw_sets =
            unsafe { self.parent.allocate_raw_descriptor_sets(&alloc_info) }?;
        Ok(raw_sets
            .into_iter()
            .map(|handle| DescriptorSet { handle })
            .collect())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        // SAFETY: handle was created from parent and is being
        // destroyed during teardown. All in-flight GPU work
        // referencing descriptor sets from this pool must be
        // complete before drop.
        unsafe { self.parent.destroy_raw_descriptor_pool(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorSet
// ---------------------------------------------------------------------------

/// A typed handle to a descriptor set allocated from a
/// [`DescriptorPool`].
///
/// Descriptor sets do not own their memory; they are freed implicitly
/// when their parent pool is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet {
    handle: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn raw_descriptor_set(&self) -> vk::DescriptorSet {
        self.handle
    }
}

// ---------------------------------------------------------------------------
// Pool and set creation
// ---------------------------------------------------------------------------

/// Pool capacity per descriptor type: the summed counts of uniform-buffer
/// bindings, then of storage-buffer bindings. Zero totals are omitted.
pub fn descriptor_pool_sizes(
    bindings: &[DescriptorBindingSpec],
) -> Result<Vec<vk::DescriptorPoolSize>, PoolCreationError> {
    let mut uniform = 0u32;
    let mut storage = 0u32;
    for b in bindings {
        let total = match b.kind {
            DescriptorKind::UniformBuffer => &mut uniform,
            DescriptorKind::StorageBuffer => &mut storage,
            kind => {
                tracing::warn!(
                    "Binding {} has kind {kind:?}; excluded from pool sizing",
                    b.binding
                );
                continue;
            }
        };
        *total = total
            .checked_add(b.count)
            .ok_or(PoolCreationError::CountOverflow(b.kind))?;
    }
    Ok([
        (vk::DescriptorType::UNIFORM_BUFFER, uniform),
        (vk::DescriptorType::STORAGE_BUFFER, storage),
    ]
    .into_iter()
    .filter(|&(_, count)| count > 0)
    .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
        ty,
        descriptor_count,
    })
    .collect())
}

/// Create a pool that can hold one set per frame in flight.
pub fn create_descriptor_pool(
    device: &Arc<dyn RawDevice>,
    bindings: &[DescriptorBindingSpec],
    frames: u32,
) -> Result<DescriptorPool, PoolCreationError> {
    if frames == 0 {
        return Err(PoolCreationError::ZeroFrames);
    }
    let pool_sizes = descriptor_pool_sizes(bindings)?;
    if pool_sizes.is_empty() {
        return Err(PoolCreationError::NoBufferBindings);
    }
    DescriptorPool::new(device, frames, &pool_sizes)
        .map_err(PoolCreationError::Vulkan)
}

/// Allocate exactly `frames` sets from `pool`, all with `layout`.
pub fn create_descriptor_sets(
    layout: &DescriptorSetLayout,
    pool: &DescriptorPool,
    frames: u32,
) -> Result<Vec<DescriptorSet>, AllocateSetsError> {
    if frames == 0 {
        return Err(AllocateSetsError::ZeroFrames);
    }
    let layouts = vec![layout; frames as usize];
    pool.allocate_sets(&layouts)
        .map_err(AllocateSetsError::Vulkan)
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// The buffers that back one binding across all frames in flight.
#[derive(Clone)]
pub enum BindingResource<'a> {
    /// For a count-1 binding: one buffer per frame.
    Single(Vec<&'a dyn DescriptorBuffer>),
    /// For a count-k binding: k elements, each with one buffer per frame.
    Array(Vec<Vec<&'a dyn DescriptorBuffer>>),
}

impl std::fmt::Debug for BindingResource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raw = |b: &&dyn DescriptorBuffer| b.raw_buffer();
        match self {
            Self::Single(frames) => f
                .debug_tuple("Single")
                .field(&frames.iter().map(raw).collect::<Vec<_>>())
                .finish(),
            Self::Array(elements) => f
                .debug_tuple("Array")
                .field(&elements.len())
                .finish(),
        }
    }
}

impl<'a> BindingResource<'a> {
    pub fn single<B: DescriptorBuffer>(per_frame: &'a [B]) -> Self {
        Self::Single(
            per_frame
                .iter()
                .map(|b| b as &dyn DescriptorBuffer)
                .collect(),
        )
    }

    pub fn array<B: DescriptorBuffer>(elements: &'a [Vec<B>]) -> Self {
        Self::Array(
            elements
                .iter()
                .map(|per_frame| {
                    per_frame
                        .iter()
                        .map(|b| b as &dyn DescriptorBuffer)
                        .collect()
                })
                .collect(),
        )
    }
}

fn validate_writes(
    sets: &[DescriptorSet],
    bindings: &[DescriptorBindingSpec],
    resources: &[BindingResource<'_>],
    frames: usize,
) -> Result<(), WriteDescriptorError> {
    if resources.len() != bindings.len() {
        return Err(WriteDescriptorError::ResourceCountMismatch {
            bindings: bindings.len(),
            resources: resources.len(),
        });
    }
    if sets.len() < frames {
        return Err(WriteDescriptorError::NotEnoughSets {
            sets: sets.len(),
            frames,
        });
    }

    let check_frames = |binding: u32, element: u32, available: usize| {
        if available < frames {
            Err(WriteDescriptorError::MissingFrame {
                binding,
                element,
                available,
                frames,
            })
        } else {
            Ok(())
        }
    };

    for (spec, resource) in bindings.iter().zip(resources) {
        if spec.count == 0 {
            continue;
        }
        if !spec.kind.is_buffer() {
            return Err(WriteDescriptorError::UnsupportedKind {
                binding: spec.binding,
                kind: spec.kind,
            });
        }
        match (spec.count, resource) {
            (1, BindingResource::Single(per_frame)) => {
                check_frames(spec.binding, 0, per_frame.len())?;
            }
            (1, BindingResource::Array(_)) => {
                return Err(WriteDescriptorError::ExpectedSingle {
                    binding: spec.binding,
                });
            }
            (count, BindingResource::Single(_)) => {
                return Err(WriteDescriptorError::ExpectedArray {
                    binding: spec.binding,
                    count,
                });
            }
            (count, BindingResource::Array(elements)) => {
                if elements.len() != count as usize {
                    return Err(WriteDescriptorError::ArrayLengthMismatch {
                        binding: spec.binding,
                        expected: count,
                        actual: elements.len(),
                    });
                }
                for (element, per_frame) in (0u32..).zip(elements) {
                    check_frames(spec.binding, element, per_frame.len())?;
                }
            }
        }
    }
    Ok(())
}

/// Point every binding of each frame's set at that frame's buffers.
///
/// For frame `i`, a count-1 binding gets `Single[i]`, and a count-k
/// binding gets `Array[0..k][i]` in element order as one write of `k`
/// descriptors. All writes for one frame go out in a single update.
/// Every precondition is checked before the device is touched.
///
/// # Safety
/// Every referenced buffer must stay alive, and must not be destroyed,
/// while any command buffer that binds one of these sets is pending.
pub unsafe fn write_descriptor_sets(
    device: &Arc<dyn RawDevice>,
    sets: &[DescriptorSet],
    bindings: &[DescriptorBindingSpec],
    resources: &[BindingResource<'_>],
    frames: usize,
) -> Result<(), WriteDescriptorError> {
    validate_writes(sets, bindings, resources, frames)?;

    let buffer_info = |b: &dyn DescriptorBuffer| {
        vk::DescriptorBufferInfo::default()
            .buffer(b.raw_buffer())
            .offset(0)
            .range(b.range())
    };

    for (frame, set) in sets.iter().take(frames).enumerate() {
        let active: Vec<(&DescriptorBindingSpec, Vec<vk::DescriptorBufferInfo>)> =
            bindings
                .iter()
                .zip(resources)
                .filter(|(spec, _)| spec.count > 0)
                .map(|(spec, resource)| {
                    let infos = match resource {
                        BindingResource::Single(per_frame) => {
                            vec![buffer_info(per_frame[frame])]
                        }
                        BindingResource::Array(elements) => elements
                            .iter()
                            .map(|per_frame| buffer_info(per_frame[frame]))
                            .collect(),
                    };
                    (spec, infos)
                })
                .collect();
        if active.is_empty() {
            continue;
        }

        let writes: Vec<vk::WriteDescriptorSet<'_>> = active
            .iter()
            .map(|(spec, infos)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set.raw_descriptor_set())
                    .dst_binding(spec.binding)
                    .dst_array_element(0)
                    .descriptor_type(spec.kind.into())
                    .buffer_info(infos)
            })
            .collect();

        tracing::trace!(
            "Writing {} bindings into descriptor set {:?} (frame {frame})",
            writes.len(),
            set.raw_descriptor_set()
        );
        // SAFETY: writes reference live sets and buffer infos; the caller
        // guarantees the buffers outlive GPU use.
        unsafe { device.update_raw_descriptor_sets(&writes, &[]) };
    }
    Ok(())
}
