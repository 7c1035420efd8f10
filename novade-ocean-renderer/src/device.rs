//! Logical device creation and queue retrieval.

use crate::config::RendererConfig;
use crate::error::{Result, VulkanError};
use crate::instance::VulkanInstance;
use crate::physical_device::{self, PhysicalDeviceInfo};
use ash::extensions::khr::Swapchain;
use ash::vk;
use std::collections::BTreeSet;
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Queue handles used by the renderer.
#[derive(Debug, Clone, Copy)]
pub struct Queues {
    pub graphics_queue: vk::Queue,
    /// Same as `graphics_queue` when the families coincide or the device is headless.
    pub present_queue: vk::Queue,
}

/// The logical device. Keeps its instance alive so drop order is always
/// device first, instance second.
pub struct LogicalDevice {
    pub raw: ash::Device,
    pub queues: Queues,
    pub physical: PhysicalDeviceInfo,
    /// True when `hostQueryReset` was enabled at creation.
    pub host_query_reset: bool,
    instance: Arc<VulkanInstance>,
}

impl LogicalDevice {
    /// Creates the device for `physical`, enabling the swapchain extension when
    /// `presenting` is set and optional features the hardware offers.
    pub fn new(instance: Arc<VulkanInstance>, physical: PhysicalDeviceInfo, presenting: bool) -> Result<Self> {
        info!("Creating logical device on {:?}...", physical.name());
        let indices = physical.queue_family_indices;
        let graphics_family = indices
            .graphics_family
            .ok_or_else(|| VulkanError::QueueFamilyNotFound("graphics".to_string()))?;
        let present_family = if presenting {
            indices
                .present_family
                .ok_or_else(|| VulkanError::QueueFamilyNotFound("present".to_string()))?
        } else {
            graphics_family
        };

        let unique_families: BTreeSet<u32> = [graphics_family, present_family].into_iter().collect();
        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                debug!("Adding DeviceQueueCreateInfo for queue family index: {}", family);
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let mut enabled_features = vk::PhysicalDeviceFeatures::default();
        if physical.features.sampler_anisotropy == vk::TRUE {
            enabled_features.sampler_anisotropy = vk::TRUE;
            debug!("Enabling feature: samplerAnisotropy");
        }
        if physical.features.occlusion_query_precise == vk::TRUE {
            enabled_features.occlusion_query_precise = vk::TRUE;
        }

        let mut host_reset_features =
            vk::PhysicalDeviceHostQueryResetFeatures::builder().host_query_reset(physical.host_query_reset);
        if !physical.host_query_reset {
            warn!("hostQueryReset is not supported; occlusion queries will be disabled.");
        }

        let extension_names: Vec<*const c_char> =
            if presenting { vec![Swapchain::name().as_ptr()] } else { Vec::new() };

        let mut device_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_features(&enabled_features)
            .enabled_extension_names(&extension_names);
        if physical.host_query_reset {
            device_create_info = device_create_info.push_next(&mut host_reset_features);
        }

        // # Safety: all pointers in the create info outlive this call.
        let raw = unsafe {
            instance
                .raw()
                .create_device(physical.physical_device, &device_create_info, None)
        }
        .map_err(|e| VulkanError::InitializationError(format!("Failed to create logical device: {e}")))?;

        // # Safety: both families were requested with one queue each.
        let queues = unsafe {
            Queues {
                graphics_queue: raw.get_device_queue(graphics_family, 0),
                present_queue: raw.get_device_queue(present_family, 0),
            }
        };
        info!("Logical device created (graphics family {}, present family {}).", graphics_family, present_family);

        Ok(Self {
            raw,
            queues,
            host_query_reset: physical.host_query_reset,
            physical,
            instance,
        })
    }

    /// Creates an instance and device without any surface. Used by tools and
    /// tests that never present.
    pub fn headless(config: &RendererConfig) -> Result<Arc<Self>> {
        let instance = Arc::new(VulkanInstance::new(&config.application_name, None, config.validation)?);
        let physical = physical_device::select_physical_device(&instance, None)?;
        Ok(Arc::new(Self::new(instance, physical, false)?))
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    pub fn graphics_family(&self) -> u32 {
        self.physical.queue_family_indices.graphics_family.unwrap_or_default()
    }

    /// Blocks until the device has finished all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        // # Safety: the device is alive; external synchronization is the caller's render thread.
        unsafe { self.raw.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        // # Safety: every object created from this device is owned by an Arc<LogicalDevice> holder
        // and therefore already destroyed.
        unsafe {
            if let Err(e) = self.raw.device_wait_idle() {
                warn!("device_wait_idle failed during teardown: {}", e);
            }
            self.raw.destroy_device(None);
        }
        info!("Logical device destroyed.");
    }
}
