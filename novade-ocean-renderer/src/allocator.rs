//! GPU memory allocation through `gpu-allocator`.
//!
//! `GpuAllocator` hands out owning [`Buffer`] and [`Image`] handles. Dropping a
//! handle destroys the Vulkan object and returns its memory to the allocator,
//! so no caller ever frees memory by hand.

use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

/// Where an allocation lives, from the renderer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocality {
    /// Device-local memory. Never mappable.
    DeviceLocal,
    /// Host-visible memory written by the CPU and read by the GPU (staging, uniforms).
    HostToDevice,
    /// Host-visible memory written by the GPU and read back by the CPU.
    DeviceToHost,
}

impl MemoryLocality {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryLocality::DeviceLocal)
    }

    fn location(self) -> MemoryLocation {
        match self {
            MemoryLocality::DeviceLocal => MemoryLocation::GpuOnly,
            MemoryLocality::HostToDevice => MemoryLocation::CpuToGpu,
            MemoryLocality::DeviceToHost => MemoryLocation::GpuToCpu,
        }
    }
}

/// Shared allocator. Lives behind an `Arc`; every handle keeps it alive.
pub struct GpuAllocator {
    inner: Mutex<Option<Allocator>>,
    device: Arc<LogicalDevice>,
}

impl GpuAllocator {
    pub fn new(device: Arc<LogicalDevice>) -> Result<Arc<Self>> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance().raw().clone(),
            device: device.raw.clone(),
            physical_device: device.physical.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
        })?;
        info!("GPU allocator initialized for device: {}", device.physical.name());
        Ok(Arc::new(Self { inner: Mutex::new(Some(allocator)), device }))
    }

    pub fn device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }

    fn lock(&self) -> MutexGuard<'_, Option<Allocator>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        locality: MemoryLocality,
        linear: bool,
    ) -> Result<Allocation> {
        let mut guard = self.lock();
        let allocator = guard
            .as_mut()
            .ok_or_else(|| VulkanError::InitializationError("GPU allocator already shut down".to_string()))?;
        Ok(allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: locality.location(),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                error!("Failed to free GPU allocation: {}", e);
            }
        }
    }

    /// Creates a buffer with bound memory.
    pub fn create_buffer(
        self: &Arc<Self>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        locality: MemoryLocality,
    ) -> Result<Buffer> {
        if size == 0 {
            return Err(VulkanError::ResourceCreationError {
                resource_type: format!("Buffer '{name}'"),
                message: "size must be non-zero".to_string(),
            });
        }
        let device = &self.device.raw;
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // # Safety: valid create info on a live device.
        let raw = unsafe { device.create_buffer(&create_info, None) }?;
        // # Safety: raw was just created from this device.
        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };

        let allocation = match self.allocate(name, requirements, locality, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                // # Safety: raw is unused and unbound.
                unsafe { device.destroy_buffer(raw, None) };
                return Err(e);
            }
        };
        // # Safety: the allocation satisfies the buffer's requirements.
        let bind = unsafe { device.bind_buffer_memory(raw, allocation.memory(), allocation.offset()) };
        if let Err(e) = bind {
            // # Safety: binding failed so nothing references raw.
            unsafe { device.destroy_buffer(raw, None) };
            self.free(allocation);
            return Err(e.into());
        }
        debug!("Created buffer '{}' ({} bytes, {:?}, {:?})", name, size, usage, locality);

        Ok(Buffer {
            raw,
            size,
            locality,
            name: name.to_string(),
            mapped: false,
            allocation: Some(allocation),
            allocator: Arc::clone(self),
        })
    }

    /// Creates an image with bound memory. Tiling must be OPTIMAL.
    pub fn create_image(
        self: &Arc<Self>,
        name: &str,
        create_info: &vk::ImageCreateInfo,
        locality: MemoryLocality,
    ) -> Result<Image> {
        let device = &self.device.raw;
        // # Safety: valid create info on a live device.
        let raw = unsafe { device.create_image(create_info, None) }?;
        // # Safety: raw was just created from this device.
        let requirements = unsafe { device.get_image_memory_requirements(raw) };

        let allocation = match self.allocate(name, requirements, locality, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                // # Safety: raw is unused and unbound.
                unsafe { device.destroy_image(raw, None) };
                return Err(e);
            }
        };
        // # Safety: the allocation satisfies the image's requirements.
        let bind = unsafe { device.bind_image_memory(raw, allocation.memory(), allocation.offset()) };
        if let Err(e) = bind {
            // # Safety: binding failed so nothing references raw.
            unsafe { device.destroy_image(raw, None) };
            self.free(allocation);
            return Err(e.into());
        }
        debug!(
            "Created image '{}' ({}x{}x{}, {} mips, {} layers, {:?})",
            name,
            create_info.extent.width,
            create_info.extent.height,
            create_info.extent.depth,
            create_info.mip_levels,
            create_info.array_layers,
            create_info.format
        );

        Ok(Image {
            raw,
            format: create_info.format,
            extent: create_info.extent,
            mip_levels: create_info.mip_levels,
            array_layers: create_info.array_layers,
            allocation: Some(allocation),
            allocator: Arc::clone(self),
        })
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        // The allocator must go before the device it was created from.
        drop(self.lock().take());
        debug!("GPU allocator shut down.");
    }
}

/// A buffer and its backing memory.
pub struct Buffer {
    raw: vk::Buffer,
    size: vk::DeviceSize,
    locality: MemoryLocality,
    name: String,
    mapped: bool,
    allocation: Option<Allocation>,
    allocator: Arc<GpuAllocator>,
}

impl Buffer {
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn locality(&self) -> MemoryLocality {
        self.locality
    }

    /// Maps the buffer for writing. The pointer stays valid until [`Buffer::unmap`]
    /// or drop. Device-local buffers cannot be mapped.
    pub fn map(&mut self) -> Result<NonNull<u8>> {
        if !self.locality.is_host_visible() {
            return Err(VulkanError::MemoryNotHostVisible(self.name.clone()));
        }
        let ptr = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .ok_or_else(|| VulkanError::MemoryNotHostVisible(self.name.clone()))?;
        self.mapped = true;
        Ok(ptr.cast())
    }

    /// Ends a mapping started with [`Buffer::map`]. Host-visible memory stays
    /// persistently mapped inside the allocator; this only closes the window in
    /// which the returned pointer may be used.
    pub fn unmap(&mut self) {
        self.mapped = false;
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Copies `bytes` into the buffer at `offset`.
    pub fn write_bytes(&mut self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len() as vk::DeviceSize;
        if end > self.size {
            return Err(VulkanError::ResourceCreationError {
                resource_type: format!("Buffer '{}'", self.name),
                message: format!("write of {} bytes at {} exceeds size {}", bytes.len(), offset, self.size),
            });
        }
        let ptr = self.map()?;
        // # Safety: the range was checked against the buffer size and the memory is host visible.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(offset as usize), bytes.len());
        }
        self.unmap();
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // # Safety: owners drop buffers only after the GPU stopped using them.
        unsafe { self.allocator.device.raw.destroy_buffer(self.raw, None) };
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free(allocation);
        }
    }
}

/// An image and its backing memory.
pub struct Image {
    raw: vk::Image,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    array_layers: u32,
    allocation: Option<Allocation>,
    allocator: Arc<GpuAllocator>,
}

impl Image {
    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        // # Safety: owners drop images only after the GPU stopped using them.
        unsafe { self.allocator.device.raw.destroy_image(self.raw, None) };
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendererConfig;
    use tracing::warn;

    #[test]
    fn only_device_local_is_unmappable() {
        assert!(!MemoryLocality::DeviceLocal.is_host_visible());
        assert!(MemoryLocality::HostToDevice.is_host_visible());
        assert!(MemoryLocality::DeviceToHost.is_host_visible());
        assert_eq!(MemoryLocality::HostToDevice.location(), MemoryLocation::CpuToGpu);
    }

    #[test]
    fn buffers_map_by_locality() {
        let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).try_init();
        let config = RendererConfig { validation: false, ..Default::default() };
        let device = match LogicalDevice::headless(&config) {
            Ok(device) => device,
            Err(e) => {
                warn!("Skipping allocator test, no Vulkan device: {}", e);
                return;
            }
        };
        let allocator = GpuAllocator::new(device).unwrap();

        let mut staging = allocator
            .create_buffer("test staging", 256, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocality::HostToDevice)
            .unwrap();
        staging.write_bytes(16, &[1, 2, 3, 4]).unwrap();
        assert!(!staging.is_mapped());
        assert!(staging.write_bytes(254, &[0; 4]).is_err());

        let mut local = allocator
            .create_buffer("test local", 256, vk::BufferUsageFlags::VERTEX_BUFFER, MemoryLocality::DeviceLocal)
            .unwrap();
        assert!(matches!(local.map(), Err(VulkanError::MemoryNotHostVisible(_))));

        assert!(allocator
            .create_buffer("empty", 0, vk::BufferUsageFlags::VERTEX_BUFFER, MemoryLocality::DeviceLocal)
            .is_err());
    }
}
