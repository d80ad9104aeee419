//! Device-memory allocation seam ([`MemoryAllocator`]) and its
//! `gpu-allocator` implementation ([`GpuAllocator`]).
//!
//! Resource wrappers never see the allocator's own allocation objects.
//! They hold an opaque [`AllocationToken`] plus an `Arc` to the allocator
//! that issued it, and hand both back when they are dropped.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
    AllocatorCreateDesc,
};
use thiserror::Error;

use crate::device::{Device, RawDevice};

/// Opaque identifier for one live allocation inside a [`MemoryAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationToken(u64);

impl AllocationToken {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters for a buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Required memory properties. Drives the memory location the
    /// allocator picks.
    pub memory_flags: vk::MemoryPropertyFlags,
}

impl BufferRequest {
    /// A host-visible, coherent uniform buffer.
    pub fn uniform(size: vk::DeviceSize) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    pub fn host_visible(
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Self {
        Self {
            size,
            usage,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    pub fn device_local(
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Self {
        Self {
            size,
            usage,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }
}

/// Parameters for an image allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRequest {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub image_type: vk::ImageType,
    pub tiling: vk::ImageTiling,
    pub flags: vk::ImageCreateFlags,
}

impl ImageRequest {
    /// A single-mip, single-layer, optimally tiled, device-local 2-D image.
    pub fn new_2d(
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage,
            memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            mip_levels: 1,
            array_layers: 1,
            image_type: vk::ImageType::TYPE_2D,
            tiling: vk::ImageTiling::OPTIMAL,
            flags: vk::ImageCreateFlags::empty(),
        }
    }

    pub fn depth_attachment(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self::new_2d(
            extent.width,
            extent.height,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    fn is_empty(&self) -> bool {
        self.extent.width == 0
            || self.extent.height == 0
            || self.extent.depth == 0
            || self.mip_levels == 0
            || self.array_layers == 0
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Requested allocation size is zero")]
    ZeroSize,

    #[error("Invalid memory property combination: {0:?}")]
    InvalidMemoryFlags(vk::MemoryPropertyFlags),

    #[error("No memory type supports the requested properties {0:?}")]
    NoMatchingMemoryType(vk::MemoryPropertyFlags),

    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(gpu_allocator::AllocationError),

    #[error("Vulkan error binding memory: {0}")]
    BindMemory(vk::Result),

    #[error("GPU allocator error freeing memory: {0}")]
    FreeMemory(gpu_allocator::AllocationError),

    #[error("Allocation {0:?} is not live in this allocator")]
    UnknownAllocation(AllocationToken),
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("Cannot map a null resource")]
    Null,

    #[error("Allocation memory is not host-visible")]
    NotHostVisible,

    #[error("Allocation is not host-mapped")]
    NotMapped,

    #[error("Allocation {0:?} is not live in this allocator")]
    UnknownAllocation(AllocationToken),

    #[error("Vulkan error flushing mapped memory: {0}")]
    Flush(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateAllocatorError {
    #[error("GPU allocator creation failed: {0}")]
    Allocator(gpu_allocator::AllocationError),
}

// ---------------------------------------------------------------------------
// MemoryAllocator
// ---------------------------------------------------------------------------

/// An allocator that creates buffers and images together with their
/// backing memory and releases both as a unit.
///
/// Implementations must destroy any native object they created before
/// returning an error from a create call.
pub trait MemoryAllocator: Send + Sync + std::fmt::Debug {
    fn create_buffer(
        &self,
        request: &BufferRequest,
        name: &str,
    ) -> Result<(vk::Buffer, AllocationToken), AllocationError>;

    fn create_image(
        &self,
        request: &ImageRequest,
        name: &str,
    ) -> Result<(vk::Image, AllocationToken), AllocationError>;

    /// Destroy `buffer` and release its memory.
    ///
    /// # Safety
    /// `buffer` and `token` must come from the same `create_buffer` call on
    /// this allocator, and no pending GPU work may reference the buffer.
    unsafe fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
        token: AllocationToken,
    ) -> Result<(), AllocationError>;

    /// Destroy `image` and release its memory.
    ///
    /// # Safety
    /// `image` and `token` must come from the same `create_image` call on
    /// this allocator. All views of the image must already be destroyed.
    unsafe fn destroy_image(
        &self,
        image: vk::Image,
        token: AllocationToken,
    ) -> Result<(), AllocationError>;

    /// Host pointer to the start of the allocation.
    fn map(&self, token: AllocationToken) -> Result<NonNull<u8>, MapError>;

    fn unmap(&self, token: AllocationToken);

    /// Make host writes in `[offset, offset + size)` visible to the device.
    /// A no-op for coherent memory.
    fn flush(
        &self,
        token: AllocationToken,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), MapError>;

    /// Property flags of the memory type backing `token`, if it is live.
    fn memory_properties(
        &self,
        token: AllocationToken,
    ) -> Option<vk::MemoryPropertyFlags>;
}

/// Reject property combinations no memory type can satisfy.
pub fn validate_memory_flags(
    flags: vk::MemoryPropertyFlags,
) -> Result<(), AllocationError> {
    use vk::MemoryPropertyFlags as F;
    let host_only_bits = F::HOST_COHERENT | F::HOST_CACHED;
    if flags.is_empty()
        || (flags.intersects(host_only_bits) && !flags.contains(F::HOST_VISIBLE))
    {
        return Err(AllocationError::InvalidMemoryFlags(flags));
    }
    Ok(())
}

/// Map required memory properties onto a `gpu-allocator` location.
pub fn memory_location_for(
    flags: vk::MemoryPropertyFlags,
) -> Result<MemoryLocation, AllocationError> {
    use vk::MemoryPropertyFlags as F;
    validate_memory_flags(flags)?;
    Ok(if flags.contains(F::HOST_VISIBLE | F::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else if flags.contains(F::HOST_VISIBLE) {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    })
}

/// Pick the best memory type allowed by `requirements` that carries every
/// flag in `required`, ranked by how well it suits `location`.
fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: &vk::MemoryRequirements,
    required: vk::MemoryPropertyFlags,
    location: MemoryLocation,
) -> Option<u32> {
    use vk::MemoryPropertyFlags as F;
    let count = memory_properties.memory_type_count as usize;
    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .filter(|(i, _)| requirements.memory_type_bits & (1 << i) != 0)
        .filter(|(_, t)| t.property_flags.contains(required))
        .map(|(i, t)| {
            let flags = t.property_flags;
            let score = match location {
                // Prefer pure VRAM; penalise HOST_VISIBLE (unified).
                MemoryLocation::GpuOnly => {
                    if flags.contains(F::HOST_VISIBLE) { 1 } else { 2 }
                }
                // Prefer DEVICE_LOCAL (ReBAR / unified memory).
                MemoryLocation::CpuToGpu => {
                    if flags.contains(F::DEVICE_LOCAL) { 2 } else { 1 }
                }
                _ => {
                    if flags.contains(F::HOST_CACHED) { 2 } else { 1 }
                }
            };
            (i as u32, score)
        })
        // Highest score wins; ties go to the lowest index.
        .fold(None, |best: Option<(u32, u32)>, (i, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((i, score)),
        })
        .map(|(i, _)| i)
}

// ---------------------------------------------------------------------------
// GpuAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum LiveObject {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

struct LiveAllocation {
    allocation: Allocation,
    object: LiveObject,
    name: String,
}

struct AllocatorState {
    allocator: Allocator,
    live: HashMap<AllocationToken, LiveAllocation>,
    next_id: u64,
}

/// [`MemoryAllocator`] backed by `gpu-allocator`.
///
/// Host-visible allocations are persistently mapped by `gpu-allocator`, so
/// [`unmap`](MemoryAllocator::unmap) only exists for bookkeeping symmetry.
/// Allocations still live when the allocator drops are reported and
/// released.
pub struct GpuAllocator {
    state: Mutex<AllocatorState>,
    device: Arc<Device>,
}

impl std::fmt::Debug for GpuAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuAllocator")
            .field("device", &self.device.raw_device())
            .finish_non_exhaustive()
    }
}

impl GpuAllocator {
    pub fn new(device: &Arc<Device>) -> Result<Self, CreateAllocatorError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.ash_instance().clone(),
            device: device.ash_device().clone(),
            physical_device: device.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(CreateAllocatorError::Allocator)?;

        Ok(Self {
            state: Mutex::new(AllocatorState {
                allocator,
                live: HashMap::new(),
                next_id: 1,
            }),
            device: Arc::clone(device),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name_object<H: vk::Handle + std::fmt::Debug + Copy>(
        &self,
        handle: H,
        name: &str,
    ) {
        let raw_device: &dyn RawDevice = self.device.as_ref();
        let name = (!name.is_empty()).then_some(name);
        // SAFETY: handle was just created from self.device.
        let name_result = unsafe { raw_device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name {:?}: {e}", handle);
        }
    }

    /// Allocate memory for `requirements`, narrowing the memory type to one
    /// carrying `flags` and padding non-coherent host memory to the
    /// flush atom.
    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        use vk::MemoryPropertyFlags as F;
        let location = memory_location_for(flags)?;
        let memory_properties = self.device.memory_properties();
        let idx = select_memory_type(
            memory_properties,
            &requirements,
            flags,
            location,
        )
        .ok_or(AllocationError::NoMatchingMemoryType(flags))?;

        let type_flags =
            memory_properties.memory_types[idx as usize].property_flags;
        let atom = self.device.non_coherent_atom_size();
        let (size, alignment) = if type_flags.contains(F::HOST_VISIBLE)
            && !type_flags.contains(F::HOST_COHERENT)
        {
            (
                requirements.size.div_ceil(atom) * atom,
                requirements.alignment.max(atom),
            )
        } else {
            (requirements.size, requirements.alignment)
        };
        let requirements = vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: 1 << idx,
        };

        self.lock()
            .allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(AllocationError::AllocateMemory)
    }

    fn register(
        &self,
        allocation: Allocation,
        object: LiveObject,
        name: &str,
    ) -> AllocationToken {
        let mut state = self.lock();
        let token = AllocationToken(state.next_id);
        state.next_id += 1;
        state.live.insert(
            token,
            LiveAllocation {
                allocation,
                object,
                name: name.to_owned(),
            },
        );
        token
    }

    fn release(
        &self,
        token: AllocationToken,
    ) -> Result<LiveAllocation, AllocationError> {
        self.lock()
            .live
            .remove(&token)
            .ok_or(AllocationError::UnknownAllocation(token))
    }

    fn free(&self, allocation: Allocation) -> Result<(), AllocationError> {
        self.lock()
            .allocator
            .free(allocation)
            .map_err(AllocationError::FreeMemory)
    }
}

impl MemoryAllocator for GpuAllocator {
    fn create_buffer(
        &self,
        request: &BufferRequest,
        name: &str,
    ) -> Result<(vk::Buffer, AllocationToken), AllocationError> {
        if request.size == 0 {
            return Err(AllocationError::ZeroSize);
        }
        validate_memory_flags(request.memory_flags)?;

        let create_info = vk::BufferCreateInfo::default()
            .size(request.size)
            .usage(request.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { self.device.create_raw_buffer(&create_info) }
            .map_err(AllocationError::CreateBuffer)?;
        self.name_object(handle, name);

        // SAFETY: handle is a valid buffer created from this device.
        let reqs =
            unsafe { self.device.get_raw_buffer_memory_requirements(handle) };
        let allocation_name = if name.is_empty() { "buffer" } else { name };
        let allocation = self
            .allocate(allocation_name, reqs, request.memory_flags, true)
            .inspect_err(|_| {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { self.device.destroy_raw_buffer(handle) };
            })?;

        // SAFETY: handle and allocation memory are valid and belong to this
        // device.
        let bind_result = unsafe {
            self.device.bind_raw_buffer_memory(
                handle,
                allocation.memory(),
                allocation.offset(),
            )
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = self.free(allocation) {
                tracing::error!("Failed to free GPU allocation: {free_err}");
            }
            // SAFETY: handle is valid and owned by this scope.
            unsafe { self.device.destroy_raw_buffer(handle) };
            return Err(AllocationError::BindMemory(e));
        }

        let token = self.register(allocation, LiveObject::Buffer(handle), name);
        tracing::debug!(
            "Allocated buffer {:?} ({} bytes, {:?}) as {:?}",
            handle,
            request.size,
            request.memory_flags,
            token
        );
        Ok((handle, token))
    }

    fn create_image(
        &self,
        request: &ImageRequest,
        name: &str,
    ) -> Result<(vk::Image, AllocationToken), AllocationError> {
        if request.is_empty() {
            return Err(AllocationError::ZeroSize);
        }
        validate_memory_flags(request.memory_flags)?;

        let create_info = vk::ImageCreateInfo::default()
            .flags(request.flags)
            .image_type(request.image_type)
            .format(request.format)
            .extent(request.extent)
            .mip_levels(request.mip_levels)
            .array_layers(request.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(request.tiling)
            .usage(request.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { self.device.create_raw_image(&create_info) }
            .map_err(AllocationError::CreateImage)?;
        self.name_object(handle, name);

        // SAFETY: handle is a valid image created from this device.
        let reqs =
            unsafe { self.device.get_raw_image_memory_requirements(handle) };
        let allocation_name = if name.is_empty() { "image" } else { name };
        let linear = request.tiling == vk::ImageTiling::LINEAR;
        let allocation = self
            .allocate(allocation_name, reqs, request.memory_flags, linear)
            .inspect_err(|_| {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { self.device.destroy_raw_image(handle) };
            })?;

        // SAFETY: handle and allocation memory are valid and belong to this
        // device.
        let bind_result = unsafe {
            self.device.bind_raw_image_memory(
                handle,
                allocation.memory(),
                allocation.offset(),
            )
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = self.free(allocation) {
                tracing::error!(
                    "Failed to free GPU image allocation: {free_err}"
                );
            }
            // SAFETY: handle is valid and owned by this scope.
            unsafe { self.device.destroy_raw_image(handle) };
            return Err(AllocationError::BindMemory(e));
        }

        let token = self.register(allocation, LiveObject::Image(handle), name);
        tracing::debug!(
            "Allocated image {:?} ({:?}, {:?}) as {:?}",
            handle,
            request.extent,
            request.format,
            token
        );
        Ok((handle, token))
    }

    unsafe fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        let live = self.release(token);
        // SAFETY: Caller guarantees buffer provenance and that no GPU work
        // still references it.
        unsafe { self.device.destroy_raw_buffer(buffer) };
        self.free(live?.allocation)
    }

    unsafe fn destroy_image(
        &self,
        image: vk::Image,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        let live = self.release(token);
        // SAFETY: Caller guarantees image provenance, that its views are
        // gone and that no GPU work still references it.
        unsafe { self.device.destroy_raw_image(image) };
        self.free(live?.allocation)
    }

    fn map(&self, token: AllocationToken) -> Result<NonNull<u8>, MapError> {
        let state = self.lock();
        let live = state
            .live
            .get(&token)
            .ok_or(MapError::UnknownAllocation(token))?;
        if !live
            .allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(MapError::NotHostVisible);
        }
        live.allocation
            .mapped_ptr()
            .map(|ptr| ptr.cast::<u8>())
            .ok_or(MapError::NotMapped)
    }

    fn unmap(&self, _token: AllocationToken) {}

    fn flush(
        &self,
        token: AllocationToken,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), MapError> {
        let state = self.lock();
        let live = state
            .live
            .get(&token)
            .ok_or(MapError::UnknownAllocation(token))?;
        let allocation = &live.allocation;
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
            || size == 0
        {
            return Ok(());
        }

        let atom = self.device.non_coherent_atom_size();
        // Allocation offset and size are atom-aligned by `allocate`; round
        // the written range out to atom boundaries inside the allocation.
        let start = (offset / atom) * atom;
        let end = offset
            .saturating_add(size)
            .div_ceil(atom)
            .saturating_mul(atom)
            .min(allocation.size());
        let flush_range = vk::MappedMemoryRange::default()
            // SAFETY: allocation is live in this allocator while the lock is
            // held.
            .memory(unsafe { allocation.memory() })
            .offset(allocation.offset() + start)
            .size(end - start);
        // SAFETY: flush_range lies within a mapped non-coherent allocation
        // owned by this device.
        unsafe {
            self.device
                .flush_raw_mapped_memory_ranges(std::slice::from_ref(&flush_range))
        }
        .map_err(MapError::Flush)
    }

    fn memory_properties(
        &self,
        token: AllocationToken,
    ) -> Option<vk::MemoryPropertyFlags> {
        self.lock()
            .live
            .get(&token)
            .map(|live| live.allocation.memory_properties())
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        tracing::debug!("Dropping GPU allocator");
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (token, live) in state.live.drain() {
            tracing::error!(
                "Allocation {:?} ({:?}, {:?}) still live at allocator teardown",
                live.name,
                live.object,
                token
            );
            match live.object {
                // SAFETY: the object was created by this allocator and its
                // owner has been leaked; nothing can use it any more.
                LiveObject::Buffer(buffer) => unsafe {
                    self.device.destroy_raw_buffer(buffer)
                },
                // SAFETY: as above.
                LiveObject::Image(image) => unsafe {
                    self.device.destroy_raw_image(image)
                },
            }
            if let Err(e) = state.allocator.free(live.allocation) {
                tracing::error!("Failed to free leaked GPU allocation: {e}");
            }
        }
    }
}
