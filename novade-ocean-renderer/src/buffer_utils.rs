//! Helpers for filling device-local buffers through a staging copy.

use crate::allocator::{Buffer, GpuAllocator, MemoryLocality};
use crate::error::{Result, VulkanError};
use crate::texture::record_one_time_submit_commands;
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;
use tracing::debug;

/// Creates a device-local buffer holding `data`.
///
/// The data goes through a temporary host-visible staging buffer and a one-time
/// transfer submission; the staging buffer is released once the copy completed.
/// `TRANSFER_DST` is added to `usage` automatically. Empty `data` is an error.
pub fn create_and_fill_gpu_buffer<T: Pod>(
    allocator: &Arc<GpuAllocator>,
    command_pool: vk::CommandPool,
    transfer_queue: vk::Queue,
    name: &str,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> Result<Buffer> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    if bytes.is_empty() {
        return Err(VulkanError::ResourceCreationError {
            resource_type: format!("GPU Buffer '{name}' (usage: {usage:?})"),
            message: "Cannot create GPU buffer with empty data.".to_string(),
        });
    }
    let size = bytes.len() as vk::DeviceSize;

    let mut staging = allocator.create_buffer(
        &format!("{name} (staging)"),
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocality::HostToDevice,
    )?;
    staging.write_bytes(0, bytes)?;

    let gpu_buffer =
        allocator.create_buffer(name, size, usage | vk::BufferUsageFlags::TRANSFER_DST, MemoryLocality::DeviceLocal)?;

    let device = &allocator.device().raw;
    record_one_time_submit_commands(device, command_pool, transfer_queue, |cmd| {
        let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
        // # Safety: both buffers are alive, sized `size` and carry the transfer usages.
        unsafe { device.cmd_copy_buffer(cmd, staging.raw(), gpu_buffer.raw(), &[region]) };
    })?;
    debug!("Buffer '{}' filled with {} bytes via staging.", name, size);
    Ok(gpu_buffer)
}
