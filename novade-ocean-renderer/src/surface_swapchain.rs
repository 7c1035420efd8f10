//! Presentation surface and swapchain management.
//!
//! A stale swapchain (out of date or suboptimal) is rebuilt wholesale. Acquire
//! retries exactly once after a rebuild; present treats staleness as a soft
//! failure. Both policies are written against the [`SwapchainOps`] trait so they
//! can be exercised without a window.

use crate::config::PresentModePreference;
use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use crate::instance::VulkanInstance;
use ash::extensions::khr::{Surface as SurfaceLoader, Swapchain as SwapchainLoader};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A window surface. Destroyed on drop.
pub struct Surface {
    loader: SurfaceLoader,
    raw: vk::SurfaceKHR,
    _instance: Arc<VulkanInstance>,
}

impl Surface {
    /// Creates a surface for a native window.
    pub fn new(
        instance: Arc<VulkanInstance>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        // # Safety: the handles come from a live window that outlives the surface.
        let raw = unsafe {
            ash_window::create_surface(instance.entry(), instance.raw(), display_handle, window_handle, None)
        }
        .map_err(|e| VulkanError::InitializationError(format!("Failed to create window surface: {e}")))?;
        let loader = SurfaceLoader::new(instance.entry(), instance.raw());
        info!("Window surface created: {:?}", raw);
        Ok(Self { loader, raw, _instance: instance })
    }

    pub fn raw(&self) -> vk::SurfaceKHR {
        self.raw
    }

    pub fn loader(&self) -> &SurfaceLoader {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // # Safety: the swapchain owning this surface is destroyed first.
        unsafe { self.loader.destroy_surface(self.raw, None) };
        debug!("Window surface destroyed.");
    }
}

/// Picks B8G8R8A8_SRGB / SRGB_NONLINEAR when offered, else the first format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first().copied())
}

/// Honors the preference when available; FIFO is always supported.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], preference: PresentModePreference) -> vk::PresentModeKHR {
    let wanted = match preference {
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentModePreference::Fifo => vk::PresentModeKHR::FIFO,
    };
    if modes.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Uses the surface's current extent unless the window system leaves it to us.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: desired
            .width
            .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: desired
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

/// One more than the minimum, capped at the maximum (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Result of asking the swapchain for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    Stale,
}

/// Result of a present request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// Presented, but the swapchain should be rebuilt.
    Suboptimal,
    /// Not presented; the swapchain no longer matches the surface.
    Stale,
}

/// What the caller learns after the present policy ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// The image was presented and the swapchain was rebuilt afterwards.
    PresentedAndRebuilt,
    /// Nothing was presented; the swapchain was rebuilt. Not an error.
    SoftFailed,
}

/// The swapchain operations the acquire/present policies need.
pub trait SwapchainOps {
    fn acquire(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome>;
    fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentStatus>;
    /// Waits for the device to idle and recreates the swapchain and everything
    /// sized by it at the current window extent.
    fn rebuild(&mut self) -> Result<()>;
}

/// Acquires an image, rebuilding and retrying exactly once on staleness.
pub fn acquire_with_rebuild<S: SwapchainOps + ?Sized>(ops: &mut S, signal: vk::Semaphore) -> Result<u32> {
    match ops.acquire(signal)? {
        AcquireOutcome::Acquired { index, .. } => Ok(index),
        AcquireOutcome::Stale => {
            info!("Swapchain stale on acquire; rebuilding.");
            ops.rebuild()?;
            match ops.acquire(signal)? {
                AcquireOutcome::Acquired { index, .. } => Ok(index),
                AcquireOutcome::Stale => Err(VulkanError::SwapchainOutOfDate),
            }
        }
    }
}

/// Presents an image. Staleness rebuilds and soft-fails; suboptimal presents
/// rebuild afterwards.
pub fn present_with_rebuild<S: SwapchainOps + ?Sized>(
    ops: &mut S,
    image_index: u32,
    wait: &[vk::Semaphore],
) -> Result<PresentOutcome> {
    match ops.present(image_index, wait)? {
        PresentStatus::Presented => Ok(PresentOutcome::Presented),
        PresentStatus::Suboptimal => {
            debug!("Present reported suboptimal swapchain; rebuilding.");
            ops.rebuild()?;
            Ok(PresentOutcome::PresentedAndRebuilt)
        }
        PresentStatus::Stale => {
            warn!("Swapchain stale on present; frame dropped, rebuilding.");
            ops.rebuild()?;
            Ok(PresentOutcome::SoftFailed)
        }
    }
}

/// A swapchain with its image views. Owns the surface it presents to.
pub struct SurfaceSwapchain {
    swapchain_loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    present_preference: PresentModePreference,
    device: Arc<LogicalDevice>,
    surface: Surface,
}

impl SurfaceSwapchain {
    pub fn new(
        device: Arc<LogicalDevice>,
        surface: Surface,
        initial_extent: vk::Extent2D,
        present_preference: PresentModePreference,
    ) -> Result<Self> {
        info!("Creating swapchain with initial extent: {:?}", initial_extent);
        let swapchain_loader = SwapchainLoader::new(device.instance().raw(), &device.raw);
        let mut surface_swapchain = Self {
            swapchain_loader,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            image_views: Vec::new(),
            present_preference,
            device,
            surface,
        };
        surface_swapchain.create_swapchain_internal(initial_extent, vk::SwapchainKHR::null())?;
        Ok(surface_swapchain)
    }

    fn create_swapchain_internal(&mut self, desired_extent: vk::Extent2D, old_swapchain: vk::SwapchainKHR) -> Result<()> {
        let physical_device = self.device.physical.physical_device;
        let loader = self.surface.loader();
        let surface = self.surface.raw();
        // # Safety: the surface and device belong to the same instance.
        let (capabilities, formats, present_modes) = unsafe {
            (
                loader.get_physical_device_surface_capabilities(physical_device, surface)?,
                loader.get_physical_device_surface_formats(physical_device, surface)?,
                loader.get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };

        let surface_format = choose_surface_format(&formats)
            .ok_or_else(|| VulkanError::UnsupportedFormat("surface offers no formats".to_string()))?;
        let present_mode = choose_present_mode(&present_modes, self.present_preference);
        let extent = choose_extent(&capabilities, desired_extent);
        let image_count = choose_image_count(&capabilities);
        debug!(
            "Swapchain parameters: format {:?}, mode {:?}, extent {:?}, images {}",
            surface_format.format, present_mode, extent, image_count
        );

        let indices = self.device.physical.queue_family_indices;
        let family_indices: Vec<u32> = match (indices.graphics_family, indices.present_family) {
            (Some(graphics), Some(present)) if graphics != present => vec![graphics, present],
            _ => Vec::new(),
        };
        let sharing_mode =
            if family_indices.is_empty() { vk::SharingMode::EXCLUSIVE } else { vk::SharingMode::CONCURRENT };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        // # Safety: create info references live objects only.
        self.swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?;
        // # Safety: the swapchain was just created.
        self.images = unsafe { self.swapchain_loader.get_swapchain_images(self.swapchain) }?;
        self.format = surface_format.format;
        self.extent = extent;

        for &image in &self.images {
            let view_create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            // # Safety: the image belongs to the live swapchain. Views created so far are kept in
            // self.image_views and released by Drop if a later one fails.
            let view = unsafe { self.device.raw.create_image_view(&view_create_info, None) }?;
            self.image_views.push(view);
        }
        info!("Swapchain ready: {} images at {:?}.", self.images.len(), self.extent);
        Ok(())
    }

    /// Waits for idle, destroys views and the old swapchain, and recreates both
    /// at `new_extent`.
    pub fn recreate(&mut self, new_extent: vk::Extent2D) -> Result<()> {
        info!("Recreating swapchain with new extent: {:?}", new_extent);
        self.device.wait_idle()?;
        self.destroy_image_views();
        let old_swapchain = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());
        let result = self.create_swapchain_internal(new_extent, old_swapchain);
        // # Safety: the device is idle and the new swapchain no longer needs the old one.
        unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        result
    }

    fn destroy_image_views(&mut self) {
        for view in self.image_views.drain(..) {
            // # Safety: callers wait for idle before views are dropped.
            unsafe { self.device.raw.destroy_image_view(view, None) };
        }
    }

    /// Raw acquire; `Stale` on out-of-date.
    pub fn acquire(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        // # Safety: the semaphore is unsignaled and owned by the current frame slot.
        match unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        } {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(e) => Err(e.into()),
        }
    }

    /// Raw present on `queue`.
    pub fn present(&mut self, queue: vk::Queue, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentStatus> {
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // # Safety: the image was acquired from this swapchain and rendering signals `wait`.
        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Stale),
            Err(e) => Err(e.into()),
        }
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn swapchain_khr(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

impl Drop for SurfaceSwapchain {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.destroy_image_views();
        // # Safety: the device is idle.
        unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
        debug!("Swapchain destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSwapchain;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    #[test]
    fn image_count_respects_bounds() {
        assert_eq!(choose_image_count(&capabilities(2, 8)), 3);
        assert_eq!(choose_image_count(&capabilities(3, 3)), 3);
        assert_eq!(choose_image_count(&capabilities(2, 0)), 3);
    }

    #[test]
    fn extent_is_clamped_when_surface_defers() {
        let caps = capabilities(2, 3);
        let extent = choose_extent(&caps, vk::Extent2D { width: 9000, height: 0 });
        assert_eq!(extent, vk::Extent2D { width: 4096, height: 1 });

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 800, height: 600 },
            ..caps
        };
        assert_eq!(choose_extent(&fixed, vk::Extent2D { width: 1, height: 1 }).width, 800);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes, PresentModePreference::Mailbox), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, PresentModePreference::Immediate), vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_SRGB, ..unorm };
        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn stale_acquire_rebuilds_at_new_extent_and_retries_once() {
        let mut swapchain = FakeSwapchain::new(vk::Extent2D { width: 640, height: 480 });
        swapchain.window_extent = vk::Extent2D { width: 1024, height: 768 };
        swapchain.acquire_script = vec![AcquireOutcome::Stale];

        let index = acquire_with_rebuild(&mut swapchain, vk::Semaphore::null()).unwrap();
        assert_eq!(index, 0);
        assert_eq!(swapchain.rebuilds, 1);
        assert_eq!(swapchain.acquires, 2);
        assert_eq!(swapchain.extent, vk::Extent2D { width: 1024, height: 768 });

        // Subsequent acquires go through untouched.
        assert_eq!(acquire_with_rebuild(&mut swapchain, vk::Semaphore::null()).unwrap(), 1);
        assert_eq!(swapchain.rebuilds, 1);
    }

    #[test]
    fn acquire_gives_up_after_one_retry() {
        let mut swapchain = FakeSwapchain::new(vk::Extent2D { width: 640, height: 480 });
        swapchain.acquire_script = vec![AcquireOutcome::Stale, AcquireOutcome::Stale];
        assert!(matches!(
            acquire_with_rebuild(&mut swapchain, vk::Semaphore::null()),
            Err(VulkanError::SwapchainOutOfDate)
        ));
        assert_eq!(swapchain.rebuilds, 1);
        assert_eq!(swapchain.acquires, 2);
    }

    #[test]
    fn stale_present_soft_fails() {
        let mut swapchain = FakeSwapchain::new(vk::Extent2D { width: 640, height: 480 });
        swapchain.present_script = vec![PresentStatus::Stale, PresentStatus::Suboptimal];

        assert_eq!(present_with_rebuild(&mut swapchain, 0, &[]).unwrap(), PresentOutcome::SoftFailed);
        assert_eq!(swapchain.presented, 0);
        assert_eq!(present_with_rebuild(&mut swapchain, 1, &[]).unwrap(), PresentOutcome::PresentedAndRebuilt);
        assert_eq!(present_with_rebuild(&mut swapchain, 0, &[]).unwrap(), PresentOutcome::Presented);
        assert_eq!(swapchain.rebuilds, 2);
        assert_eq!(swapchain.presented, 2);
    }
}
