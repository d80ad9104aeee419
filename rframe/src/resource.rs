//! Exclusive-ownership wrappers for allocator-backed buffers and images.
//!
//! [`Allocated<K>`] binds one native resource to the allocation that backs
//! it and to the allocator that issued both. Exactly one wrapper owns a
//! given resource: [`take`](Allocated::take) moves ownership out and leaves
//! an inert wrapper behind, whose drop does nothing.
//!
//! - [`AllocatedBuffer`] = `Allocated<BufferKind>`
//! - [`AllocatedImage`] = `Allocated<ImageKind>`, optionally owning an
//!   [`ImageView`] that is destroyed before the image memory is released.
//!
//! [`BufferHandle`] and [`DescriptorBuffer`] let recording and descriptor
//! helpers accept any buffer wrapper.

use std::sync::Arc;

use ash::vk::{self, Handle};
use bytemuck::Pod;
use thiserror::Error;

use crate::allocator::{
    AllocationError, AllocationToken, BufferRequest, ImageRequest, MapError,
    MemoryAllocator,
};
use crate::device::{RawDevice, depth_aspect_mask};

/// Trait for types that expose a raw `VkBuffer` handle.
///
/// Blanket impls cover `&T`, so both owned wrappers and borrows of them
/// satisfy the bound.
pub trait BufferHandle {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl<T> BufferHandle for &T
where
    T: BufferHandle + ?Sized,
{
    fn raw_buffer(&self) -> vk::Buffer {
        (*self).raw_buffer()
    }
}

impl BufferHandle for vk::Buffer {
    fn raw_buffer(&self) -> vk::Buffer {
        *self
    }
}

/// A buffer that can back a buffer descriptor over `[0, range)`.
pub trait DescriptorBuffer: BufferHandle {
    fn range(&self) -> vk::DeviceSize;
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WriteBufferError {
    #[error(
        "Data size ({data_bytes} bytes) exceeds buffer size ({buffer_bytes} bytes)"
    )]
    DataTooLarge {
        data_bytes: usize,
        buffer_bytes: vk::DeviceSize,
    },

    #[error(transparent)]
    Map(#[from] MapError),
}

#[derive(Debug, Error)]
pub enum CreateImageViewError {
    #[error("Cannot create a view of a null image")]
    NullImage,

    #[error("Vulkan error creating image view: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Resource kinds
// ---------------------------------------------------------------------------

mod sealed {
    pub trait Sealed {}
}

/// The kind of native resource an [`Allocated`] wrapper owns.
pub trait ResourceKind: sealed::Sealed + 'static {
    type Raw: Handle + Copy + PartialEq + std::fmt::Debug;
    /// Creation metadata kept alongside the handle.
    type Info: Copy + Default + std::fmt::Debug;
    /// Objects derived from the resource that must die before it.
    type Dependent: Default + std::fmt::Debug;

    const LABEL: &'static str;

    /// # Safety
    /// `raw` and `token` must have been issued together by `allocator`, and
    /// no pending GPU work may reference `raw`.
    unsafe fn release(
        allocator: &dyn MemoryAllocator,
        raw: Self::Raw,
        token: AllocationToken,
    ) -> Result<(), AllocationError>;
}

#[derive(Debug)]
pub enum BufferKind {}

#[derive(Debug)]
pub enum ImageKind {}

impl sealed::Sealed for BufferKind {}
impl sealed::Sealed for ImageKind {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageInfo {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

impl ResourceKind for BufferKind {
    type Raw = vk::Buffer;
    type Info = BufferInfo;
    type Dependent = ();

    const LABEL: &'static str = "buffer";

    unsafe fn release(
        allocator: &dyn MemoryAllocator,
        raw: vk::Buffer,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        // SAFETY: Caller guarantees raw/token provenance and GPU idleness.
        unsafe { allocator.destroy_buffer(raw, token) }
    }
}

impl ResourceKind for ImageKind {
    type Raw = vk::Image;
    type Info = ImageInfo;
    type Dependent = Option<ImageView>;

    const LABEL: &'static str = "image";

    unsafe fn release(
        allocator: &dyn MemoryAllocator,
        raw: vk::Image,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        // SAFETY: Caller guarantees raw/token provenance and GPU idleness;
        // the owning wrapper drops its view first.
        unsafe { allocator.destroy_image(raw, token) }
    }
}

// ---------------------------------------------------------------------------
// Allocated<K>
// ---------------------------------------------------------------------------

/// Exclusive owner of one allocator-backed resource.
///
/// Not `Clone`. A wrapper is *null* when it owns nothing: either built with
/// [`null`](Self::null) / `Default`, or left behind by
/// [`take`](Self::take) or [`reset`](Self::reset).
pub struct Allocated<K: ResourceKind> {
    raw: K::Raw,
    token: Option<AllocationToken>,
    allocator: Option<Arc<dyn MemoryAllocator>>,
    info: K::Info,
    name: String,
    dependent: K::Dependent,
}

pub type AllocatedBuffer = Allocated<BufferKind>;
pub type AllocatedImage = Allocated<ImageKind>;

impl<K: ResourceKind> std::fmt::Debug for Allocated<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocated")
            .field("kind", &K::LABEL)
            .field("handle", &self.raw)
            .field("token", &self.token)
            .field("name", &self.name)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl<K: ResourceKind> Default for Allocated<K> {
    fn default() -> Self {
        Self::null()
    }
}

impl<K: ResourceKind> Allocated<K> {
    /// A wrapper that owns nothing.
    pub fn null() -> Self {
        Self {
            raw: K::Raw::from_raw(0),
            token: None,
            allocator: None,
            info: K::Info::default(),
            name: String::new(),
            dependent: K::Dependent::default(),
        }
    }

    fn from_parts(
        allocator: &Arc<dyn MemoryAllocator>,
        raw: K::Raw,
        token: AllocationToken,
        info: K::Info,
        name: &str,
    ) -> Self {
        Self {
            raw,
            token: Some(token),
            allocator: Some(Arc::clone(allocator)),
            info,
            name: name.to_owned(),
            dependent: K::Dependent::default(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.token.is_none()
    }

    /// Move ownership out, leaving `self` null.
    #[must_use = "dropping the taken resource releases it immediately"]
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::null())
    }

    /// Release the owned resource now. A no-op on a null wrapper.
    pub fn reset(&mut self) {
        *self = Self::null();
    }

    /// Release the owned resource, then adopt `other`'s.
    pub fn replace(&mut self, other: Self) {
        self.reset();
        *self = other;
    }

    pub fn raw(&self) -> K::Raw {
        self.raw
    }

    pub fn token(&self) -> Option<AllocationToken> {
        self.token
    }

    pub fn allocator(&self) -> Option<&Arc<dyn MemoryAllocator>> {
        self.allocator.as_ref()
    }

    pub fn info(&self) -> &K::Info {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<K: ResourceKind> Drop for Allocated<K> {
    fn drop(&mut self) {
        let (Some(allocator), Some(token)) =
            (self.allocator.take(), self.token.take())
        else {
            return;
        };
        tracing::debug!(
            "Dropping {} {:?} ({:?})",
            K::LABEL,
            self.raw,
            self.name
        );
        drop(std::mem::take(&mut self.dependent));
        // SAFETY: raw and token were issued together by allocator and are
        // owned exclusively by this wrapper.
        let result = unsafe { K::release(allocator.as_ref(), self.raw, token) };
        if let Err(e) = result {
            tracing::error!(
                "Failed to release {} {:?}: {e}",
                K::LABEL,
                self.raw
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

impl Allocated<BufferKind> {
    pub fn new(
        allocator: &Arc<dyn MemoryAllocator>,
        request: &BufferRequest,
        name: &str,
    ) -> Result<Self, AllocationError> {
        let (raw, token) = allocator.create_buffer(request, name)?;
        Ok(Self::from_parts(
            allocator,
            raw,
            token,
            BufferInfo {
                size: request.size,
                usage: request.usage,
            },
            name,
        ))
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.info.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.info.usage
    }

    /// Copy `bytes` to the start of the buffer through a temporary mapping.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WriteBufferError> {
        let (Some(allocator), Some(token)) =
            (self.allocator.as_ref(), self.token)
        else {
            return Err(MapError::Null.into());
        };
        if bytes.len() as vk::DeviceSize > self.info.size {
            return Err(WriteBufferError::DataTooLarge {
                data_bytes: bytes.len(),
                buffer_bytes: self.info.size,
            });
        }

        let mapped_ptr = allocator.map(token)?;
        // SAFETY: mapped_ptr points to at least `size` bytes of host-visible
        // allocation memory; bytes.len() was bounds-checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped_ptr.as_ptr(),
                bytes.len(),
            );
        }
        let flushed = allocator.flush(token, 0, bytes.len() as vk::DeviceSize);
        allocator.unmap(token);
        Ok(flushed?)
    }

    pub fn write_pod<T: Pod>(
        &mut self,
        data: &[T],
    ) -> Result<(), WriteBufferError> {
        self.write_bytes(bytemuck::cast_slice(data))
    }
}

impl BufferHandle for Allocated<BufferKind> {
    fn raw_buffer(&self) -> vk::Buffer {
        self.raw
    }
}

impl DescriptorBuffer for Allocated<BufferKind> {
    fn range(&self) -> vk::DeviceSize {
        self.info.size
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

impl Allocated<ImageKind> {
    pub fn new(
        allocator: &Arc<dyn MemoryAllocator>,
        request: &ImageRequest,
        name: &str,
    ) -> Result<Self, AllocationError> {
        let (raw, token) = allocator.create_image(request, name)?;
        Ok(Self::from_parts(
            allocator,
            raw,
            token,
            ImageInfo {
                extent: request.extent,
                format: request.format,
                usage: request.usage,
            },
            name,
        ))
    }

    /// A device-local 2-D depth attachment of `extent`.
    pub fn create_depth_image(
        allocator: &Arc<dyn MemoryAllocator>,
        extent: vk::Extent2D,
        format: vk::Format,
        name: &str,
    ) -> Result<Self, AllocationError> {
        Self::new(
            allocator,
            &ImageRequest::depth_attachment(extent, format),
            name,
        )
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.info.extent
    }

    pub fn format(&self) -> vk::Format {
        self.info.format
    }

    /// Create a 2-D view over the whole image and keep it with the image.
    /// Replaces any view created earlier.
    pub fn create_view(
        &mut self,
        device: &Arc<dyn RawDevice>,
        aspect: vk::ImageAspectFlags,
    ) -> Result<&ImageView, CreateImageViewError> {
        if self.is_null() {
            return Err(CreateImageViewError::NullImage);
        }
        let name = (!self.name.is_empty()).then(|| format!("{} view", self.name));
        let view = ImageView::new(
            device,
            self.raw,
            self.info.format,
            aspect,
            name.as_deref(),
        )?;
        Ok(self.dependent.insert(view))
    }

    /// [`create_view`](Self::create_view) with the aspects a depth
    /// attachment of this image's format needs.
    pub fn create_depth_view(
        &mut self,
        device: &Arc<dyn RawDevice>,
    ) -> Result<&ImageView, CreateImageViewError> {
        let aspect = depth_aspect_mask(self.info.format);
        self.create_view(device, aspect)
    }

    pub fn view(&self) -> Option<&ImageView> {
        self.dependent.as_ref()
    }
}

// ---------------------------------------------------------------------------
// ImageView
// ---------------------------------------------------------------------------

/// An owned 2-D `VkImageView`.
pub struct ImageView {
    parent: Arc<dyn RawDevice>,
    handle: vk::ImageView,
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ImageView {
    /// Create a 2-D view covering mip 0 / layer 0 of `image`.
    pub fn new(
        device: &Arc<dyn RawDevice>,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateImageViewError> {
        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range);

        // SAFETY: create_info references a valid image from the same device.
        let handle = unsafe { device.create_raw_image_view(&create_info) }
            .map_err(CreateImageViewError::Vulkan)?;

        // SAFETY: handle is a valid image view from this device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name image view {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.handle
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        tracing::debug!("Dropping image view {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this
        // wrapper. No GPU work may still reference it.
        unsafe { self.parent.destroy_raw_image_view(self.handle) };
    }
}
