//! Sampled textures, layout transitions and mip generation.
//!
//! Textures are created device-local in `SHADER_READ_ONLY_OPTIMAL` and stay in
//! that layout between uploads. Upload code transitions the affected
//! subresources to `TRANSFER_DST_OPTIMAL`, copies, regenerates mips if the
//! texture has them, and transitions back.

use crate::allocator::{GpuAllocator, Image, MemoryLocality};
use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stages that sample textures; the wave map is displaced in the vertex stage.
pub const SHADER_READ_STAGES: vk::PipelineStageFlags =
    vk::PipelineStageFlags::from_raw(vk::PipelineStageFlags::VERTEX_SHADER.as_raw() | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw());

/// Number of mip levels for a full chain down to 1x1.
pub fn mip_levels_for(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Size of mip `level` of a `size` edge, never below 1.
pub fn mip_extent(size: u32, level: u32) -> u32 {
    (size >> level).max(1)
}

pub fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    view_type: vk::ImageViewType,
    aspect_mask: vk::ImageAspectFlags,
    mip_levels: u32,
    layer_count: u32,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count,
        });
    // # Safety: the image is alive and the range lies within it.
    Ok(unsafe { device.create_image_view(&create_info, None) }?)
}

/// Records, submits and waits for a throwaway command buffer.
///
/// Only used for setup work; per-frame uploads go through the batched uploader.
pub fn record_one_time_submit_commands<F>(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    record: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(command_pool)
        .command_buffer_count(1);
    // # Safety: the pool belongs to this device and is used from the render thread only.
    let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }?;
    let result = submit_and_wait(device, queue, command_buffers[0], record);
    // # Safety: submit_and_wait returns only after the fence signaled, or before submission.
    unsafe { device.free_command_buffers(command_pool, &command_buffers) };
    result
}

fn submit_and_wait<F>(device: &ash::Device, queue: vk::Queue, command_buffer: vk::CommandBuffer, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    // # Safety: freshly allocated buffer in the initial state.
    unsafe { device.begin_command_buffer(command_buffer, &begin_info) }?;
    record(command_buffer);
    // # Safety: recording was started above.
    unsafe { device.end_command_buffer(command_buffer) }?;

    // # Safety: a fence with default flags on a live device.
    let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
    let command_buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
    // # Safety: the buffer is executable and the fence unsignaled.
    let result = unsafe {
        device
            .queue_submit(queue, &[submit_info.build()], fence)
            .and_then(|_| device.wait_for_fences(&[fence], true, u64::MAX))
    };
    // # Safety: the fence is no longer in use (either waited on or never submitted).
    unsafe { device.destroy_fence(fence, None) };
    Ok(result?)
}

/// Records a layout transition for a mip/layer range of a color image.
#[allow(clippy::too_many_arguments)]
pub fn record_layout_transition(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    (src_stage, src_access): (vk::PipelineStageFlags, vk::AccessFlags),
    (dst_stage, dst_access): (vk::PipelineStageFlags, vk::AccessFlags),
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    // # Safety: the command buffer is recording and the image is alive.
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        )
    };
}

/// Color subresource range over `mips` levels of one layer.
pub fn color_range(base_mip_level: u32, level_count: u32, base_array_layer: u32, layer_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level,
        level_count,
        base_array_layer,
        layer_count,
    }
}

/// Regenerates mips 1.. of `layer` from mip 0 by successive blits.
///
/// Expects every level of the layer in `TRANSFER_DST_OPTIMAL`; leaves every
/// level in `SHADER_READ_ONLY_OPTIMAL`.
pub fn record_generate_mipmaps(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
    layer: u32,
) {
    let to_src = (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE);
    let read_src = (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ);
    let shader_read = (SHADER_READ_STAGES, vk::AccessFlags::SHADER_READ);

    for level in 1..mip_levels {
        record_layout_transition(
            device,
            command_buffer,
            image,
            color_range(level - 1, 1, layer, 1),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            to_src,
            read_src,
        );

        let src_size = [mip_extent(width, level - 1) as i32, mip_extent(height, level - 1) as i32];
        let dst_size = [mip_extent(width, level) as i32, mip_extent(height, level) as i32];
        let blit = vk::ImageBlit::builder()
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level - 1,
                base_array_layer: layer,
                layer_count: 1,
            })
            .src_offsets([vk::Offset3D::default(), vk::Offset3D { x: src_size[0], y: src_size[1], z: 1 }])
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level,
                base_array_layer: layer,
                layer_count: 1,
            })
            .dst_offsets([vk::Offset3D::default(), vk::Offset3D { x: dst_size[0], y: dst_size[1], z: 1 }]);
        // # Safety: source level is TRANSFER_SRC, destination level TRANSFER_DST.
        unsafe {
            device.cmd_blit_image(
                command_buffer,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit.build()],
                vk::Filter::LINEAR,
            )
        };

        record_layout_transition(
            device,
            command_buffer,
            image,
            color_range(level - 1, 1, layer, 1),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            read_src,
            shader_read,
        );
    }

    record_layout_transition(
        device,
        command_buffer,
        image,
        color_range(mip_levels.saturating_sub(1), 1, layer, 1),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        to_src,
        shader_read,
    );
}

/// Shape of a texture to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mipmapped: bool,
    /// View as `TYPE_2D_ARRAY` even with one layer.
    pub array_view: bool,
    pub format: vk::Format,
}

/// A sampled device-local texture and its view.
pub struct Texture {
    image: Image,
    view: vk::ImageView,
    desc: TextureDesc,
    device: Arc<LogicalDevice>,
}

impl Texture {
    /// Creates the texture, clears it to zero and leaves it in
    /// `SHADER_READ_ONLY_OPTIMAL` so it can be sampled before the first upload.
    pub fn new(
        allocator: &Arc<GpuAllocator>,
        name: &str,
        desc: TextureDesc,
        command_pool: vk::CommandPool,
        queue: vk::Queue,
    ) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(VulkanError::ResourceCreationError {
                resource_type: format!("Texture '{name}'"),
                message: format!("degenerate size {}x{}x{}", desc.width, desc.height, desc.layers),
            });
        }
        let device = Arc::clone(allocator.device());
        let mip_levels = if desc.mipmapped { mip_levels_for(desc.width, desc.height) } else { 1 };

        let format_properties = unsafe {
            device
                .instance()
                .raw()
                .get_physical_device_format_properties(device.physical.physical_device, desc.format)
        };
        if mip_levels > 1
            && !format_properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::BLIT_SRC | vk::FormatFeatureFlags::BLIT_DST)
        {
            return Err(VulkanError::UnsupportedFormat(format!(
                "{:?} cannot be blitted for mipmapping",
                desc.format
            )));
        }
        if !format_properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            warn!("Format {:?} lacks linear filtering; '{}' will sample with reduced quality.", desc.format, name);
        }

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
            .mip_levels(mip_levels)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = allocator.create_image(name, &create_info, MemoryLocality::DeviceLocal)?;

        let full_range = color_range(0, mip_levels, 0, desc.layers);
        let raw_image = image.raw();
        record_one_time_submit_commands(&device.raw, command_pool, queue, |cmd| {
            record_layout_transition(
                &device.raw,
                cmd,
                raw_image,
                full_range,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
            );
            // # Safety: the image is in TRANSFER_DST_OPTIMAL for the whole range.
            unsafe {
                device.raw.cmd_clear_color_image(
                    cmd,
                    raw_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearColorValue { float32: [0.0; 4] },
                    &[full_range],
                )
            };
            record_layout_transition(
                &device.raw,
                cmd,
                raw_image,
                full_range,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
                (SHADER_READ_STAGES, vk::AccessFlags::SHADER_READ),
            );
        })?;

        let view_type = if desc.array_view || desc.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view = create_image_view(
            &device.raw,
            raw_image,
            desc.format,
            view_type,
            vk::ImageAspectFlags::COLOR,
            mip_levels,
            desc.layers,
        )?;
        info!(
            "Texture '{}' created: {}x{}x{} ({} mips, {:?})",
            name, desc.width, desc.height, desc.layers, mip_levels, view_type
        );
        Ok(Self { image, view, desc, device })
    }

    pub fn raw_image(&self) -> vk::Image {
        self.image.raw()
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // # Safety: owners drop textures after the GPU finished with them.
        unsafe { self.device.raw.destroy_image_view(self.view, None) };
        debug!("Texture view {:?} destroyed.", self.view);
    }
}

/// Repeating trilinear sampler with anisotropy when the device offers it.
pub struct Sampler {
    pub raw: vk::Sampler,
    device: Arc<LogicalDevice>,
}

impl Sampler {
    pub fn new_repeat_linear(device: Arc<LogicalDevice>) -> Result<Self> {
        let mut create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false);
        if device.physical.features.sampler_anisotropy == vk::TRUE {
            create_info = create_info
                .anisotropy_enable(true)
                .max_anisotropy(device.physical.properties.limits.max_sampler_anisotropy.min(16.0));
        }
        // # Safety: valid create info on a live device.
        let raw = unsafe { device.raw.create_sampler(&create_info, None) }?;
        Ok(Self { raw, device })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        // # Safety: no descriptor referencing the sampler is in flight.
        unsafe { self.device.raw.destroy_sampler(self.raw, None) };
    }
}
