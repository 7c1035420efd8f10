//! [`UploadSink`] that records texture uploads into one command buffer per
//! batch and submits it to the graphics queue.
//!
//! Staging memory is reused between batches, so `begin_batch` waits for the
//! previous batch's fence before anything is written.

use crate::allocator::{Buffer, GpuAllocator, MemoryLocality};
use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use crate::texture::{color_range, record_generate_mipmaps, record_layout_transition, SHADER_READ_STAGES};
use crate::water::streaming::UploadSink;
use ash::vk;
use std::sync::Arc;
use tracing::{debug, warn};

/// Image written by the sink. The owner keeps the image alive for as long as
/// the sink exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTarget {
    pub image: vk::Image,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_levels: u32,
}

pub struct GpuUploadSink {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    recording: bool,
    wave_target: UploadTarget,
    wave_staging: Vec<Buffer>,
    color_target: Option<UploadTarget>,
    color_staging: Option<Buffer>,
    color_regions: Vec<vk::BufferImageCopy>,
    color_offset: vk::DeviceSize,
    allocator: Arc<GpuAllocator>,
    device: Arc<LogicalDevice>,
}

impl GpuUploadSink {
    pub fn new(allocator: Arc<GpuAllocator>, wave_target: UploadTarget) -> Result<Self> {
        let device = Arc::clone(allocator.device());
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.graphics_family());
        // # Safety: valid create info on a live device.
        let command_pool = unsafe { device.raw.create_command_pool(&pool_info, None) }?;
        // Signaled so the first begin_batch does not block.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = match unsafe { device.raw.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                // # Safety: the pool has no buffers yet.
                unsafe { device.raw.destroy_command_pool(command_pool, None) };
                return Err(e.into());
            }
        };
        let mut sink = Self {
            command_pool,
            command_buffer: vk::CommandBuffer::null(),
            fence,
            recording: false,
            wave_target,
            wave_staging: Vec::new(),
            color_target: None,
            color_staging: None,
            color_regions: Vec::new(),
            color_offset: 0,
            allocator,
            device,
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // # Safety: the pool was created above on this device.
        sink.command_buffer = unsafe { sink.device.raw.allocate_command_buffers(&alloc_info) }?[0];

        let layer_bytes = (wave_target.width * wave_target.height * 4) as vk::DeviceSize;
        for layer in 0..wave_target.layers {
            let staging = sink.allocator.create_buffer(
                &format!("wave layer {layer} (staging)"),
                layer_bytes,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocality::HostToDevice,
            )?;
            sink.wave_staging.push(staging);
        }
        debug!("Upload sink ready: {} wave layer(s) of {}x{}.", wave_target.layers, wave_target.width, wave_target.height);
        Ok(sink)
    }

    /// Points color uploads at a new color map. Waits for in-flight uploads so
    /// the old staging buffer can be released.
    pub fn set_color_target(&mut self, target: UploadTarget) -> Result<()> {
        self.wait_idle()?;
        let bytes = (target.width * target.height * 4) as vk::DeviceSize;
        self.color_staging = Some(self.allocator.create_buffer(
            "color map (staging)",
            bytes,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocality::HostToDevice,
        )?);
        self.color_target = Some(target);
        Ok(())
    }

    /// Blocks until the last submitted batch finished on the GPU.
    pub fn wait_idle(&self) -> Result<()> {
        // # Safety: the fence belongs to this device.
        unsafe { self.device.raw.wait_for_fences(&[self.fence], true, u64::MAX) }?;
        Ok(())
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.recording {
            Ok(())
        } else {
            Err(VulkanError::InitializationError("upload recorded outside of a batch".to_string()))
        }
    }

    fn push_color_region(&mut self, x: u32, y: u32, width: u32, height: u32, pixels: &[u32]) -> Result<()> {
        self.ensure_recording()?;
        let target = self.color_target.ok_or_else(|| {
            VulkanError::InitializationError("color upload without a color map".to_string())
        })?;
        if x + width > target.width || y + height > target.height {
            return Err(VulkanError::ResourceCreationError {
                resource_type: "color map upload".to_string(),
                message: format!("{width}x{height} at ({x}, {y}) exceeds {}x{}", target.width, target.height),
            });
        }
        let staging = self
            .color_staging
            .as_mut()
            .ok_or_else(|| VulkanError::InitializationError("color staging buffer missing".to_string()))?;
        staging.write_bytes(self.color_offset, bytemuck::cast_slice(pixels))?;
        self.color_regions.push(vk::BufferImageCopy {
            buffer_offset: self.color_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: x as i32, y: y as i32, z: 0 },
            image_extent: vk::Extent3D { width, height, depth: 1 },
        });
        self.color_offset += std::mem::size_of_val(pixels) as vk::DeviceSize;
        Ok(())
    }

    fn record_color_copies(&self, target: UploadTarget) {
        let device = &self.device.raw;
        let Some(staging) = self.color_staging.as_ref() else {
            return;
        };
        let range = color_range(0, 1, 0, 1);
        record_layout_transition(
            device,
            self.command_buffer,
            target.image,
            range,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            (SHADER_READ_STAGES, vk::AccessFlags::empty()),
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        );
        // # Safety: regions lie inside both the staging buffer and the image.
        unsafe {
            device.cmd_copy_buffer_to_image(
                self.command_buffer,
                staging.raw(),
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &self.color_regions,
            )
        };
        record_layout_transition(
            device,
            self.command_buffer,
            target.image,
            range,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
            (SHADER_READ_STAGES, vk::AccessFlags::SHADER_READ),
        );
    }
}

impl UploadSink for GpuUploadSink {
    fn begin_batch(&mut self) -> Result<()> {
        if self.recording {
            return Err(VulkanError::InitializationError("upload batch already open".to_string()));
        }
        self.wait_idle()?;
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // # Safety: the fence wait above guarantees the buffer is no longer executing.
        unsafe {
            self.device.raw.reset_fences(&[self.fence])?;
            self.device
                .raw
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.raw.begin_command_buffer(self.command_buffer, &begin_info)?;
        }
        self.recording = true;
        self.color_regions.clear();
        self.color_offset = 0;
        Ok(())
    }

    fn upload_wave_layer(&mut self, layer: u32, size: u32, pixels: &[u32]) -> Result<()> {
        self.ensure_recording()?;
        let target = self.wave_target;
        if layer >= target.layers || size != target.width || pixels.len() != (size * size) as usize {
            return Err(VulkanError::ResourceCreationError {
                resource_type: "wave map upload".to_string(),
                message: format!("layer {layer} of size {size} does not fit the {}x{}x{} wave map", target.width, target.height, target.layers),
            });
        }
        let staging = &mut self.wave_staging[layer as usize];
        staging.write_bytes(0, bytemuck::cast_slice(pixels))?;

        let device = &self.device.raw;
        record_layout_transition(
            device,
            self.command_buffer,
            target.image,
            color_range(0, target.mip_levels, layer, 1),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            (SHADER_READ_STAGES, vk::AccessFlags::empty()),
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        );
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D { width: size, height: size, depth: 1 },
        };
        // # Safety: the layer's mip 0 is in TRANSFER_DST_OPTIMAL and the staging buffer holds size² texels.
        unsafe {
            device.cmd_copy_buffer_to_image(
                self.command_buffer,
                staging.raw(),
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        };
        record_generate_mipmaps(device, self.command_buffer, target.image, size, size, target.mip_levels, layer);
        Ok(())
    }

    fn upload_color_full(&mut self, width: u32, height: u32, pixels: &[u32]) -> Result<()> {
        self.color_regions.clear();
        self.color_offset = 0;
        self.push_color_region(0, 0, width, height, pixels)
    }

    fn upload_color_span(&mut self, x: u32, y: u32, pixels: &[u32]) -> Result<()> {
        self.push_color_region(x, y, pixels.len() as u32, 1, pixels)
    }

    fn submit_batch(&mut self) -> Result<()> {
        self.ensure_recording()?;
        if let (Some(target), false) = (self.color_target, self.color_regions.is_empty()) {
            self.record_color_copies(target);
        }
        self.recording = false;
        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        // # Safety: recording was started in begin_batch and the fence was reset there.
        unsafe {
            self.device.raw.end_command_buffer(self.command_buffer)?;
            self.device
                .raw
                .queue_submit(self.device.queues.graphics_queue, &[submit_info.build()], self.fence)?;
        }
        Ok(())
    }
}

impl Drop for GpuUploadSink {
    fn drop(&mut self) {
        if self.recording {
            // # Safety: an open batch was never submitted; ending it makes the pool destroyable.
            let _ = unsafe { self.device.raw.end_command_buffer(self.command_buffer) };
            // The fence was reset by begin_batch and will never signal.
        } else if let Err(e) = self.wait_idle() {
            warn!("Waiting for texture uploads failed during teardown: {}", e);
        }
        // # Safety: no submission from this pool is pending.
        unsafe {
            self.device.raw.destroy_fence(self.fence, None);
            self.device.raw.destroy_command_pool(self.command_pool, None);
        }
    }
}
