//! Physical device selection.
//!
//! Devices are scored by type (discrete before integrated before the rest) and
//! filtered by queue support and, when presenting, the swapchain extension.

use crate::error::{Result, VulkanError};
use crate::instance::VulkanInstance;
use ash::extensions::khr::{Surface as SurfaceLoader, Swapchain};
use ash::vk;
use std::ffi::CStr;
use tracing::{debug, info, warn};

/// Queue family indices chosen for a device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Headless devices only need a graphics family.
    pub fn is_complete(&self, needs_present: bool) -> bool {
        self.graphics_family.is_some() && (!needs_present || self.present_family.is_some())
    }
}

/// Identity of a device as recorded in pipeline cache headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u32,
    pub device_id: u32,
    pub pipeline_cache_uuid: [u8; vk::UUID_SIZE],
}

impl DeviceIdentity {
    pub fn from_properties(properties: &vk::PhysicalDeviceProperties) -> Self {
        Self {
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            pipeline_cache_uuid: properties.pipeline_cache_uuid,
        }
    }
}

/// Everything the renderer needs to know about the selected GPU.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_family_indices: QueueFamilyIndices,
    pub identity: DeviceIdentity,
    /// Vulkan 1.2 `hostQueryReset`; occlusion queries depend on it.
    pub host_query_reset: bool,
}

impl PhysicalDeviceInfo {
    pub fn name(&self) -> String {
        // # Safety: device_name is a NUL-terminated array filled in by the driver.
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Preference score for a device type; higher wins.
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 500,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 200,
        _ => 100,
    }
}

/// Picks graphics and present families.
///
/// A family that does both is preferred so the swapchain can use exclusive
/// sharing. `supports_present` is only consulted when `needs_present` is set.
pub fn choose_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    needs_present: bool,
    mut supports_present: F,
) -> Result<QueueFamilyIndices>
where
    F: FnMut(u32) -> Result<bool>,
{
    let mut indices = QueueFamilyIndices::default();
    for (i, family) in families.iter().enumerate() {
        let index = i as u32;
        if family.queue_count == 0 {
            continue;
        }
        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = needs_present && supports_present(index)?;

        if graphics && present {
            return Ok(QueueFamilyIndices { graphics_family: Some(index), present_family: Some(index) });
        }
        if graphics && indices.graphics_family.is_none() {
            indices.graphics_family = Some(index);
        }
        if present && indices.present_family.is_none() {
            indices.present_family = Some(index);
        }
    }
    Ok(indices)
}

/// Selects the best device. `surface` is `None` for headless use.
pub fn select_physical_device(
    vulkan_instance: &VulkanInstance,
    surface: Option<(&SurfaceLoader, vk::SurfaceKHR)>,
) -> Result<PhysicalDeviceInfo> {
    let instance = vulkan_instance.raw();
    // # Safety: the instance is alive for the duration of the call.
    let physical_devices = unsafe { instance.enumerate_physical_devices() }?;
    if physical_devices.is_empty() {
        return Err(VulkanError::NoSuitablePhysicalDevice);
    }
    info!("Found {} physical device(s). Evaluating suitability...", physical_devices.len());

    let mut best: Option<(u32, PhysicalDeviceInfo)> = None;
    for physical_device in physical_devices {
        match evaluate_device(instance, physical_device, surface) {
            Ok(Some(info)) => {
                let score = device_type_score(info.properties.device_type);
                debug!("Device {:?} suitable with score {}.", info.name(), score);
                if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                    best = Some((score, info));
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Error checking device suitability: {}", e),
        }
    }

    let (_, info) = best.ok_or(VulkanError::NoSuitablePhysicalDevice)?;
    info!(
        "Selected physical device {:?} ({:?}), host query reset: {}",
        info.name(),
        info.properties.device_type,
        info.host_query_reset
    );
    Ok(info)
}

fn evaluate_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<(&SurfaceLoader, vk::SurfaceKHR)>,
) -> Result<Option<PhysicalDeviceInfo>> {
    // # Safety: physical_device was enumerated from this instance.
    let (properties, features, memory_properties, families) = unsafe {
        (
            instance.get_physical_device_properties(physical_device),
            instance.get_physical_device_features(physical_device),
            instance.get_physical_device_memory_properties(physical_device),
            instance.get_physical_device_queue_family_properties(physical_device),
        )
    };
    let needs_present = surface.is_some();

    if needs_present {
        // # Safety: as above.
        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
        let has_swapchain = extensions
            .iter()
            // # Safety: extension_name is a NUL-terminated array filled in by the driver.
            .any(|ext| (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == Swapchain::name());
        if !has_swapchain {
            debug!("Device lacks {:?}; skipping.", Swapchain::name());
            return Ok(None);
        }
    }

    let indices = choose_queue_families(&families, needs_present, |index| match surface {
        // # Safety: the surface belongs to the same instance as the device.
        Some((loader, surface)) => Ok(unsafe {
            loader.get_physical_device_surface_support(physical_device, index, surface)
        }?),
        None => Ok(false),
    })?;
    if !indices.is_complete(needs_present) {
        debug!("Device lacks required queue families: {:?}", indices);
        return Ok(None);
    }

    let host_query_reset = if properties.api_version >= vk::API_VERSION_1_2 {
        let mut host_reset = vk::PhysicalDeviceHostQueryResetFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut host_reset);
        // # Safety: the chain only contains structs that live on this stack frame.
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        host_reset.host_query_reset == vk::TRUE
    } else {
        false
    };

    Ok(Some(PhysicalDeviceInfo {
        physical_device,
        properties,
        features,
        memory_properties,
        queue_family_indices: indices,
        identity: DeviceIdentity::from_properties(&properties),
        host_query_reset,
    }))
}

/// First candidate format whose tiling features contain `features`.
pub fn find_supported_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        // # Safety: physical_device was enumerated from this instance.
        let props = unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}
