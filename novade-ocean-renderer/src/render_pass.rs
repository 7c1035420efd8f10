//! Render pass and swapchain-sized render target (depth buffer + framebuffers).

use crate::allocator::{GpuAllocator, Image, MemoryLocality};
use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use crate::physical_device::find_supported_format;
use crate::texture::create_image_view;
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info};

const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] =
    [vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT];

/// Single-subpass render pass with one color and one depth attachment.
pub struct RenderPass {
    pub raw: vk::RenderPass,
    pub depth_format: vk::Format,
    device: Arc<LogicalDevice>,
}

impl RenderPass {
    pub fn new(device: Arc<LogicalDevice>, color_format: vk::Format) -> Result<Self> {
        let depth_format = find_supported_format(
            device.instance().raw(),
            device.physical.physical_device,
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .ok_or_else(|| VulkanError::UnsupportedFormat("no supported depth format".to_string()))?;
        info!("Creating render pass with color format: {:?}, depth format: {:?}", color_format, depth_format);

        let attachments = [
            vk::AttachmentDescription::builder()
                .format(color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .build(),
            vk::AttachmentDescription::builder()
                .format(depth_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        ];
        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)
            .build()];
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .build()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        // # Safety: all referenced arrays outlive the call.
        let raw = unsafe { device.raw.create_render_pass(&create_info, None) }?;
        debug!("Render pass created: {:?}", raw);
        Ok(Self { raw, depth_format, device })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        // # Safety: pipelines and framebuffers using the pass are dropped first.
        unsafe { self.device.raw.destroy_render_pass(self.raw, None) };
        debug!("Render pass {:?} destroyed.", self.raw);
    }
}

/// Depth buffer and one framebuffer per swapchain image. Rebuilt with the swapchain.
pub struct RenderTarget {
    framebuffers: Vec<vk::Framebuffer>,
    depth_view: vk::ImageView,
    depth_image: Image,
    extent: vk::Extent2D,
    allocator: Arc<GpuAllocator>,
}

impl RenderTarget {
    pub fn new(
        allocator: Arc<GpuAllocator>,
        render_pass: &RenderPass,
        swapchain_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let (depth_image, depth_view) = create_depth_buffer(&allocator, render_pass.depth_format, extent)?;
        let mut target = Self { framebuffers: Vec::new(), depth_view, depth_image, extent, allocator };
        target.create_framebuffers(render_pass.raw, swapchain_views)?;
        Ok(target)
    }

    fn create_framebuffers(&mut self, render_pass: vk::RenderPass, swapchain_views: &[vk::ImageView]) -> Result<()> {
        let device = &self.allocator.device().raw;
        for &view in swapchain_views {
            let attachments = [view, self.depth_view];
            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            // # Safety: attachments match the render pass; partial results are cleaned in Drop.
            let framebuffer = unsafe { device.create_framebuffer(&create_info, None) }?;
            self.framebuffers.push(framebuffer);
        }
        info!("Created {} framebuffers at {:?}.", self.framebuffers.len(), self.extent);
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        let device = &self.allocator.device().raw;
        for framebuffer in self.framebuffers.drain(..) {
            // # Safety: callers wait for idle before the target is rebuilt or dropped.
            unsafe { device.destroy_framebuffer(framebuffer, None) };
        }
    }

    /// Recreates depth buffer and framebuffers for a new swapchain. The device must be idle.
    pub fn rebuild(&mut self, render_pass: &RenderPass, swapchain_views: &[vk::ImageView], extent: vk::Extent2D) -> Result<()> {
        self.destroy_framebuffers();
        // # Safety: the device is idle.
        unsafe { self.allocator.device().raw.destroy_image_view(self.depth_view, None) };
        self.depth_view = vk::ImageView::null();

        let (depth_image, depth_view) = create_depth_buffer(&self.allocator, render_pass.depth_format, extent)?;
        self.depth_image = depth_image;
        self.depth_view = depth_view;
        self.extent = extent;
        self.create_framebuffers(render_pass.raw, swapchain_views)
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn depth_image(&self) -> &Image {
        &self.depth_image
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        if self.depth_view != vk::ImageView::null() {
            // # Safety: the owning context waits for idle before dropping.
            unsafe { self.allocator.device().raw.destroy_image_view(self.depth_view, None) };
        }
    }
}

fn create_depth_buffer(
    allocator: &Arc<GpuAllocator>,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<(Image, vk::ImageView)> {
    let create_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D { width: extent.width.max(1), height: extent.height.max(1), depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = allocator.create_image("depth buffer", &create_info, MemoryLocality::DeviceLocal)?;
    let view = create_image_view(
        &allocator.device().raw,
        image.raw(),
        format,
        vk::ImageViewType::TYPE_2D,
        vk::ImageAspectFlags::DEPTH,
        1,
        1,
    )?;
    Ok((image, view))
}
