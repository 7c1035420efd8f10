//! Runs only where a Vulkan driver is present; otherwise logs and passes.

use ash::vk;
use novade_ocean_renderer::allocator::GpuAllocator;
use novade_ocean_renderer::device::LogicalDevice;
use novade_ocean_renderer::instance::VulkanInstance;
use novade_ocean_renderer::physical_device::select_physical_device;
use novade_ocean_renderer::texture::{Texture, TextureDesc};
use novade_ocean_renderer::water::streaming::TextureStreamer;
use novade_ocean_renderer::water::upload::{GpuUploadSink, UploadTarget};
use novade_ocean_renderer::{WaterConfig, WaveQuality};
use std::sync::Arc;
use tracing::warn;

fn headless_device() -> Option<Arc<LogicalDevice>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let instance = match VulkanInstance::new("ocean-renderer-tests", None, false) {
        Ok(instance) => Arc::new(instance),
        Err(e) => {
            warn!("Skipping GPU test, no Vulkan instance: {}", e);
            return None;
        }
    };
    let physical = match select_physical_device(&instance, None) {
        Ok(physical) => physical,
        Err(e) => {
            warn!("Skipping GPU test, no usable device: {}", e);
            return None;
        }
    };
    match LogicalDevice::new(instance, physical, false) {
        Ok(device) => Some(Arc::new(device)),
        Err(e) => {
            warn!("Skipping GPU test, device creation failed: {}", e);
            None
        }
    }
}

#[test]
fn layered_waves_upload_through_the_graphics_queue() -> anyhow::Result<()> {
    let Some(device) = headless_device() else {
        return Ok(());
    };
    let allocator = GpuAllocator::new(Arc::clone(&device))?;
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::TRANSIENT)
        .queue_family_index(device.graphics_family());
    let pool = unsafe { device.raw.create_command_pool(&pool_info, None) }?;

    let quality = WaveQuality::Layered;
    let size = quality.tank_size() as u32;
    let desc = TextureDesc {
        width: size,
        height: size,
        layers: quality.tank_count() as u32,
        mipmapped: true,
        array_view: true,
        format: vk::Format::R8G8B8A8_UNORM,
    };
    let wave_map = Texture::new(&allocator, "wave map", desc, pool, device.queues.graphics_queue)?;
    let target = UploadTarget {
        image: wave_map.raw_image(),
        width: size,
        height: size,
        layers: desc.layers,
        mip_levels: wave_map.mip_levels(),
    };

    {
        let mut sink = GpuUploadSink::new(Arc::clone(&allocator), target)?;
        let mut streamer = TextureStreamer::new(&WaterConfig { quality, ..WaterConfig::default() })?;
        for _ in 0..3 {
            let report = streamer.update(1.0 / 60.0, None, &mut sink)?;
            assert_eq!(report.layers_uploaded, 3);
        }
        sink.wait_idle()?;
    }

    drop(wave_map);
    unsafe { device.raw.destroy_command_pool(pool, None) };
    device.wait_idle()?;
    Ok(())
}
