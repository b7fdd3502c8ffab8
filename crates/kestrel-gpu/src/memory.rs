//! GPU memory management.
//!
//! Buffers and images are paired `(handle, allocation)` objects. Creation and
//! destruction are explicit and go through [`GpuAllocator`], which attributes
//! every live resource to a [`MemoryTag`] so shutdown can prove nothing leaked.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use kestrel_core::{MemoryTag, MemoryTracker};
use std::sync::Arc;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    tracker: Arc<MemoryTracker>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        tracker: Arc<MemoryTracker>,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            tracker,
        })
    }

    /// Tracker receiving this allocator's tagged allocations.
    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Allocate a buffer tagged as [`MemoryTag::GpuBuffer`].
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.create_tagged_buffer(size, usage, location, MemoryTag::GpuBuffer, name)
    }

    /// Allocate a buffer attributed to `tag`.
    pub fn create_tagged_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        tag: MemoryTag,
        name: &str,
    ) -> Result<GpuBuffer> {
        validate_buffer_request(size, usage, location).inspect_err(|e| {
            tracing::warn!(buffer = name, "rejected buffer request: {e}");
        })?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device outlives the allocator.
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        // SAFETY: `buffer` was just created on this device.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: the buffer has no memory bound and is unused.
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        // SAFETY: the allocation satisfies `requirements` for this buffer.
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        self.tracker.record_alloc(tag, size);
        tracing::debug!(buffer = name, size, ?usage, "created buffer");

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            tag,
        })
    }

    /// Free a buffer allocation.
    ///
    /// The device must not reference the buffer any more.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
            self.tracker.record_free(buffer.tag, buffer.size);
        }

        if buffer.buffer != vk::Buffer::null() {
            // SAFETY: caller guarantees no in-flight work uses the buffer.
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate an image.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        validate_image_request(create_info).inspect_err(|e| {
            tracing::warn!(image = name, "rejected image request: {e}");
        })?;

        // SAFETY: the device outlives the allocator.
        let image = unsafe { self.device.create_image(create_info, None)? };
        // SAFETY: `image` was just created on this device.
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: the image has no memory bound and is unused.
                unsafe { self.device.destroy_image(image, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        // SAFETY: the allocation satisfies `requirements` for this image.
        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        self.tracker.record_alloc(MemoryTag::GpuImage, requirements.size);

        Ok(GpuImage {
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
            tracked_bytes: requirements.size,
        })
    }

    /// Free an image allocation and its view.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if image.view != vk::ImageView::null() {
            // SAFETY: caller guarantees no in-flight work uses the view.
            unsafe { self.device.destroy_image_view(image.view, None) };
            image.view = vk::ImageView::null();
        }

        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
            self.tracker
                .record_free(MemoryTag::GpuImage, image.tracked_bytes);
        }

        if image.image != vk::Image::null() {
            // SAFETY: caller guarantees no in-flight work uses the image.
            unsafe { self.device.destroy_image(image.image, None) };
        }
        image.image = vk::Image::null();

        Ok(())
    }
}

impl GpuAllocator {
    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Check a buffer request before touching the device.
pub fn validate_buffer_request(
    size: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<()> {
    if size == 0 {
        return Err(GpuError::InvalidUsage("buffer size must be non-zero".into()));
    }
    if usage.is_empty() {
        return Err(GpuError::InvalidUsage("buffer usage flags are empty".into()));
    }
    if location == MemoryLocation::Unknown {
        return Err(GpuError::InvalidUsage("buffer memory location unknown".into()));
    }
    Ok(())
}

/// Check an image request before touching the device.
pub fn validate_image_request(info: &vk::ImageCreateInfo) -> Result<()> {
    let extent = info.extent;
    if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
        return Err(GpuError::InvalidUsage(format!(
            "image extent {}x{}x{} has a zero dimension",
            extent.width, extent.height, extent.depth
        )));
    }
    if info.usage.is_empty() {
        return Err(GpuError::InvalidUsage("image usage flags are empty".into()));
    }
    if info.mip_levels == 0 || info.array_layers == 0 {
        return Err(GpuError::InvalidUsage(
            "image needs at least one mip level and layer".into(),
        ));
    }
    let depth = is_depth_format(info.format);
    if depth && info.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
        return Err(GpuError::InvalidUsage(
            "depth format used as color attachment".into(),
        ));
    }
    if !depth && info.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
        return Err(GpuError::InvalidUsage(
            "color format used as depth attachment".into(),
        ));
    }
    Ok(())
}

/// Whether `format` carries a depth aspect.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::X8_D24_UNORM_PACK32
    )
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub tag: MemoryTag,
}

impl GpuBuffer {
    /// Map the buffer memory for CPU access.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Whether the buffer still owns its memory.
    pub fn is_live(&self) -> bool {
        self.allocation.is_some()
    }

    /// Write data to the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidUsage("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidUsage(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        // SAFETY: the mapped range `[offset, end)` lies inside the allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    tracked_bytes: u64,
}

impl GpuImage {
    /// Aspect flags matching the image format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        if is_depth_format(self.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    /// 2D extent of the image.
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    /// Create the default 2D view for this image, owned by the image.
    ///
    /// # Safety
    /// The device must be the one the image was created on.
    pub unsafe fn create_view(&mut self, device: &ash::Device) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect())
                    .level_count(1)
                    .layer_count(1),
            );

        self.view = unsafe { device.create_image_view(&view_info, None)? };
        Ok(self.view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_info(format: vk::Format, usage: vk::ImageUsageFlags) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .usage(usage)
    }

    #[test]
    fn rejects_malformed_buffer_requests() {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        assert!(validate_buffer_request(0, usage, MemoryLocation::GpuOnly).is_err());
        assert!(validate_buffer_request(
            16,
            vk::BufferUsageFlags::empty(),
            MemoryLocation::GpuOnly
        )
        .is_err());
        assert!(validate_buffer_request(16, usage, MemoryLocation::Unknown).is_err());
        assert!(validate_buffer_request(16, usage, MemoryLocation::CpuToGpu).is_ok());
    }

    #[test]
    fn rejects_mismatched_attachment_usage() {
        let depth_as_color = image_info(
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        );
        let err = validate_image_request(&depth_as_color).unwrap_err();
        assert!(matches!(err, GpuError::InvalidUsage(_)));

        let color_as_depth = image_info(
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        );
        assert!(validate_image_request(&color_as_depth).is_err());

        let shadow_map = image_info(
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        );
        assert!(validate_image_request(&shadow_map).is_ok());
    }

    #[test]
    fn rejects_empty_extent() {
        let mut info = image_info(vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED);
        info.extent.height = 0;
        assert!(validate_image_request(&info).is_err());
    }
}
