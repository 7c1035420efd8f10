//! Per-frame synchronization: semaphores, fences and the rotating frame slots.
//!
//! Each of the K frame slots owns the primitives for one frame in flight plus
//! the command buffer recorded for it. A slot's fence is the only thing the CPU
//! waits on before reusing that command buffer.

use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info};

/// Synchronization primitives for a single frame in flight.
#[derive(Debug)]
pub struct FrameSyncPrimitives {
    /// Signaled when the acquired swapchain image is ready to be rendered to.
    pub image_available_semaphore: vk::Semaphore,
    /// Signaled when rendering finished; presentation waits on it.
    pub render_finished_semaphore: vk::Semaphore,
    /// Signaled when the GPU finished the slot's submission.
    pub in_flight_fence: vk::Fence,
}

impl FrameSyncPrimitives {
    /// Creates the primitives. The fence starts signaled when
    /// `initially_signaled_fence` is set, so the first wait returns at once.
    pub fn new(device: &ash::Device, initially_signaled_fence: bool) -> Result<Self> {
        let semaphore_create_info = vk::SemaphoreCreateInfo::builder();
        // # Safety: creation on a live device; partial failures are unwound below.
        let image_available_semaphore = unsafe { device.create_semaphore(&semaphore_create_info, None) }?;
        let render_finished_semaphore = match unsafe { device.create_semaphore(&semaphore_create_info, None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                // # Safety: not yet used by any submission.
                unsafe { device.destroy_semaphore(image_available_semaphore, None) };
                return Err(e.into());
            }
        };
        let fence_flags =
            if initially_signaled_fence { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence_create_info = vk::FenceCreateInfo::builder().flags(fence_flags);
        let in_flight_fence = match unsafe { device.create_fence(&fence_create_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                // # Safety: not yet used by any submission.
                unsafe {
                    device.destroy_semaphore(image_available_semaphore, None);
                    device.destroy_semaphore(render_finished_semaphore, None);
                }
                return Err(e.into());
            }
        };

        debug!(
            "Created FrameSyncPrimitives: IAS={:?}, RFS={:?}, IFF={:?} (signaled={})",
            image_available_semaphore, render_finished_semaphore, in_flight_fence, initially_signaled_fence
        );
        Ok(Self { image_available_semaphore, render_finished_semaphore, in_flight_fence })
    }

    /// # Safety
    ///
    /// No pending GPU work may reference these primitives.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available_semaphore, None);
        device.destroy_semaphore(self.render_finished_semaphore, None);
        device.destroy_fence(self.in_flight_fence, None);
    }
}

/// One rotating frame context.
#[derive(Debug)]
pub struct FrameSlot {
    pub sync: FrameSyncPrimitives,
    pub command_buffer: vk::CommandBuffer,
}

impl FrameSlot {
    /// Blocks until the slot's fence is signaled, then resets it.
    pub fn wait_and_reset(&self, device: &ash::Device) -> Result<()> {
        let fences = [self.sync.in_flight_fence];
        // # Safety: the fence belongs to this device.
        unsafe {
            device.wait_for_fences(&fences, true, u64::MAX)?;
            device.reset_fences(&fences)?;
        }
        Ok(())
    }
}

/// The ring of K frame slots and the command pool their buffers come from.
pub struct FrameSlots {
    slots: Vec<FrameSlot>,
    current: usize,
    command_pool: vk::CommandPool,
    device: Arc<LogicalDevice>,
}

impl FrameSlots {
    /// Creates `count` slots (2 or 3) with signaled fences.
    pub fn new(device: Arc<LogicalDevice>, count: u32) -> Result<Self> {
        if !(2..=3).contains(&count) {
            return Err(VulkanError::InitializationError(format!(
                "frames in flight must be 2 or 3, got {count}"
            )));
        }
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.graphics_family());
        // # Safety: valid create info on a live device.
        let command_pool = unsafe { device.raw.create_command_pool(&pool_info, None) }?;

        // From here on, Drop of the partially built ring cleans up.
        let mut ring = Self { slots: Vec::with_capacity(count as usize), current: 0, command_pool, device };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        // # Safety: the pool was created above on this device.
        let command_buffers = unsafe { ring.device.raw.allocate_command_buffers(&alloc_info) }?;
        for command_buffer in command_buffers {
            let sync = FrameSyncPrimitives::new(&ring.device.raw, true)?;
            ring.slots.push(FrameSlot { sync, command_buffer });
        }
        info!("Created {} frame slots.", count);
        Ok(ring)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Moves to the next slot in the ring.
    pub fn advance(&mut self) {
        self.current = next_slot(self.current, self.slots.len());
    }
}

impl Drop for FrameSlots {
    fn drop(&mut self) {
        let device = &self.device.raw;
        // # Safety: waiting for idle guarantees no submission references the slots.
        unsafe {
            let _ = device.device_wait_idle();
            for slot in &self.slots {
                slot.sync.destroy(device);
            }
            device.destroy_command_pool(self.command_pool, None);
        }
        debug!("Frame slots destroyed.");
    }
}

/// Index of the slot after `current` in a ring of `count`.
pub fn next_slot(current: usize, count: usize) -> usize {
    if count == 0 {
        0
    } else {
        (current + 1) % count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps() {
        assert_eq!(next_slot(0, 2), 1);
        assert_eq!(next_slot(1, 2), 0);
        assert_eq!(next_slot(2, 3), 0);
        assert_eq!(next_slot(0, 0), 0);
    }
}
