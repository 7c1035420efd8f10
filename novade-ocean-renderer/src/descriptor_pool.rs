//! Fixed-capacity descriptor pool.
//!
//! The pool is sized for `max_sets` sets, each holding the given number of
//! descriptors per type. Sets can be freed one by one or all at once with
//! [`DescriptorPool::reset`].

use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info};

/// Pool sizes for `max_sets` sets of the given per-set descriptor counts.
pub fn pool_sizes(max_sets: u32, per_set: &[(vk::DescriptorType, u32)]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for &(ty, count) in per_set.iter().filter(|(_, count)| *count > 0) {
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += count * max_sets,
            None => sizes.push(vk::DescriptorPoolSize { ty, descriptor_count: count * max_sets }),
        }
    }
    sizes
}

/// Host-side count of sets handed out by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBudget {
    capacity: u32,
    allocated: u32,
}

impl PoolBudget {
    pub fn new(capacity: u32) -> Self {
        Self { capacity, allocated: 0 }
    }

    pub fn take(&mut self) -> Result<()> {
        if self.allocated >= self.capacity {
            return Err(self.exhausted());
        }
        self.allocated += 1;
        Ok(())
    }

    pub fn release(&mut self, count: u32) {
        self.allocated = self.allocated.saturating_sub(count);
    }

    pub fn reset(&mut self) {
        self.allocated = 0;
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    fn exhausted(&self) -> VulkanError {
        VulkanError::DescriptorPoolExhausted { allocated: self.allocated, capacity: self.capacity }
    }
}

pub struct DescriptorPool {
    raw: vk::DescriptorPool,
    budget: PoolBudget,
    device: Arc<LogicalDevice>,
}

impl DescriptorPool {
    pub fn new(device: Arc<LogicalDevice>, max_sets: u32, per_set: &[(vk::DescriptorType, u32)]) -> Result<Self> {
        let sizes = pool_sizes(max_sets, per_set);
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        // # Safety: valid create info on a live device.
        let raw = unsafe { device.raw.create_descriptor_pool(&create_info, None) }.map_err(|e| {
            VulkanError::ResourceCreationError { resource_type: "DescriptorPool".to_string(), message: e.to_string() }
        })?;
        info!("Descriptor pool created: {} sets, {:?}", max_sets, sizes);
        Ok(Self { raw, budget: PoolBudget::new(max_sets), device })
    }

    /// Allocates one set with `layout`.
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.budget.take()?;
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder().descriptor_pool(self.raw).set_layouts(&layouts);
        // # Safety: the pool and layout belong to this device.
        match unsafe { self.device.raw.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => {
                debug!("Descriptor set allocated ({}/{}).", self.budget.allocated(), self.budget.capacity());
                sets.into_iter().next().ok_or_else(|| self.budget_error())
            }
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                self.budget.release(1);
                Err(self.budget_error())
            }
            Err(e) => {
                self.budget.release(1);
                Err(e.into())
            }
        }
    }

    fn budget_error(&self) -> VulkanError {
        self.budget.exhausted()
    }

    /// Returns sets to the pool. The sets must not be referenced by pending work.
    pub fn free(&mut self, sets: &[vk::DescriptorSet]) -> Result<()> {
        if sets.is_empty() {
            return Ok(());
        }
        // # Safety: the pool was created with FREE_DESCRIPTOR_SET and the sets came from it.
        unsafe { self.device.raw.free_descriptor_sets(self.raw, sets) }?;
        self.budget.release(sets.len() as u32);
        Ok(())
    }

    /// Frees every set allocated from the pool.
    ///
    /// # Safety
    ///
    /// No pending command buffer may reference a set from this pool. This is
    /// not checked.
    pub unsafe fn reset(&mut self) -> Result<()> {
        self.device.raw.reset_descriptor_pool(self.raw, vk::DescriptorPoolResetFlags::empty())?;
        self.budget.reset();
        Ok(())
    }

    pub fn raw(&self) -> vk::DescriptorPool {
        self.raw
    }

    pub fn capacity(&self) -> u32 {
        self.budget.capacity()
    }

    pub fn allocated(&self) -> u32 {
        self.budget.allocated()
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        // # Safety: destroying the pool frees its sets; owners drop it after the GPU is idle.
        unsafe { self.device.raw.destroy_descriptor_pool(self.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_scale_with_set_count() {
        let per_set = [
            (vk::DescriptorType::UNIFORM_BUFFER, 1),
            (vk::DescriptorType::SAMPLED_IMAGE, 4),
            (vk::DescriptorType::SAMPLER, 1),
            (vk::DescriptorType::SAMPLED_IMAGE, 2),
            (vk::DescriptorType::STORAGE_BUFFER, 0),
        ];
        let sizes = pool_sizes(3, &per_set);
        let counts: Vec<_> = sizes.iter().map(|s| (s.ty, s.descriptor_count)).collect();
        assert_eq!(
            counts,
            vec![
                (vk::DescriptorType::UNIFORM_BUFFER, 3),
                (vk::DescriptorType::SAMPLED_IMAGE, 18),
                (vk::DescriptorType::SAMPLER, 3),
            ]
        );
    }

    #[test]
    fn budget_exhausts_and_recovers() {
        let mut budget = PoolBudget::new(2);
        budget.take().unwrap();
        budget.take().unwrap();
        let err = budget.take().unwrap_err();
        assert!(matches!(err, VulkanError::DescriptorPoolExhausted { allocated: 2, capacity: 2 }));
        assert_eq!(err.to_string(), "Descriptor pool exhausted (2/2 sets in use)");

        budget.release(1);
        assert!(budget.take().is_ok());
        budget.reset();
        assert_eq!(budget.allocated(), 0);
        budget.release(5);
        assert_eq!(budget.allocated(), 0);
    }
}
