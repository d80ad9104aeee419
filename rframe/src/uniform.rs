//! Persistently mapped uniform buffers, one per (uniform, frame in flight).

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use thiserror::Error;

use crate::allocator::{
    AllocationError, BufferRequest, MapError, MemoryAllocator,
};
use crate::resource::{AllocatedBuffer, BufferHandle, DescriptorBuffer};

#[derive(Debug, Error)]
pub enum CreateSlotError {
    #[error("Failed to allocate uniform buffer: {0}")]
    Allocate(#[from] AllocationError),

    #[error("Failed to map uniform buffer: {0}")]
    Map(#[from] MapError),
}

#[derive(Debug, Error)]
pub enum WriteSlotError {
    #[error(
        "Data size ({data_bytes} bytes) exceeds slot size ({slot_bytes} bytes)"
    )]
    DataTooLarge {
        data_bytes: usize,
        slot_bytes: vk::DeviceSize,
    },

    #[error("Uniform slot is not mapped")]
    NotMapped,

    #[error("Failed to flush uniform slot: {0}")]
    Flush(#[from] MapError),
}

/// A uniform buffer plus a host pointer into its memory.
///
/// The pointer is only held while the buffer is live and mapped;
/// [`unmap`](Self::unmap) runs automatically before the buffer is released.
/// Synchronising host writes with GPU reads of the same frame slot is the
/// caller's job.
pub struct MappedUniformSlot {
    buffer: AllocatedBuffer,
    mapped: Option<NonNull<u8>>,
}

impl std::fmt::Debug for MappedUniformSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedUniformSlot")
            .field("buffer", &self.buffer)
            .field("mapped", &self.mapped.is_some())
            .finish_non_exhaustive()
    }
}

impl MappedUniformSlot {
    /// Allocate a host-visible, coherent `UNIFORM_BUFFER` of `size` bytes and
    /// map it.
    pub fn new(
        allocator: &Arc<dyn MemoryAllocator>,
        size: vk::DeviceSize,
        name: &str,
    ) -> Result<Self, CreateSlotError> {
        let buffer =
            AllocatedBuffer::new(allocator, &BufferRequest::uniform(size), name)?;
        Ok(Self::from_buffer(buffer)?)
    }

    /// Map an existing buffer. On failure the buffer is released.
    pub fn from_buffer(buffer: AllocatedBuffer) -> Result<Self, MapError> {
        let mut slot = Self {
            buffer,
            mapped: None,
        };
        slot.map()?;
        Ok(slot)
    }

    /// Map the buffer memory. A no-op if already mapped.
    pub fn map(&mut self) -> Result<(), MapError> {
        if self.mapped.is_some() {
            return Ok(());
        }
        let (Some(allocator), Some(token)) =
            (self.buffer.allocator(), self.buffer.token())
        else {
            return Err(MapError::Null);
        };
        let host_visible = allocator
            .memory_properties(token)
            .is_some_and(|f| f.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        if !host_visible {
            return Err(MapError::NotHostVisible);
        }
        self.mapped = Some(allocator.map(token)?);
        Ok(())
    }

    /// Drop the host pointer. Idempotent.
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some()
            && let (Some(allocator), Some(token)) =
                (self.buffer.allocator(), self.buffer.token())
        {
            allocator.unmap(token);
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    pub fn buffer(&self) -> &AllocatedBuffer {
        &self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    /// Unmap and hand the buffer back.
    pub fn into_buffer(mut self) -> AllocatedBuffer {
        self.unmap();
        self.buffer.take()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WriteSlotError> {
        let mapped_ptr = self.mapped.ok_or(WriteSlotError::NotMapped)?;
        if bytes.len() as vk::DeviceSize > self.buffer.size() {
            return Err(WriteSlotError::DataTooLarge {
                data_bytes: bytes.len(),
                slot_bytes: self.buffer.size(),
            });
        }

        // SAFETY: mapped_ptr points to `size` bytes of live host-visible
        // memory and bytes.len() was bounds-checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped_ptr.as_ptr(),
                bytes.len(),
            );
        }

        if let (Some(allocator), Some(token)) =
            (self.buffer.allocator(), self.buffer.token())
        {
            allocator.flush(token, 0, bytes.len() as vk::DeviceSize)?;
        }
        Ok(())
    }

    pub fn write_pod<T: Pod>(&mut self, value: &T) -> Result<(), WriteSlotError> {
        self.write_bytes(bytemuck::bytes_of(value))
    }
}

impl Drop for MappedUniformSlot {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl BufferHandle for MappedUniformSlot {
    fn raw_buffer(&self) -> vk::Buffer {
        self.buffer.raw()
    }
}

impl DescriptorBuffer for MappedUniformSlot {
    fn range(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

/// One slot per frame in flight for a single uniform.
pub fn create_frame_slots(
    allocator: &Arc<dyn MemoryAllocator>,
    size: vk::DeviceSize,
    frames: usize,
    name: &str,
) -> Result<Vec<MappedUniformSlot>, CreateSlotError> {
    (0..frames)
        .map(|frame| {
            MappedUniformSlot::new(allocator, size, &format!("{name}[f{frame}]"))
        })
        .collect()
}

/// Per-frame slots for each element of a uniform array, indexed
/// `[element][frame]`.
pub fn create_slot_array(
    allocator: &Arc<dyn MemoryAllocator>,
    size: vk::DeviceSize,
    elements: usize,
    frames: usize,
    name: &str,
) -> Result<Vec<Vec<MappedUniformSlot>>, CreateSlotError> {
    (0..elements)
        .map(|element| {
            create_frame_slots(
                allocator,
                size,
                frames,
                &format!("{name}[{element}]"),
            )
        })
        .collect()
}
