//! The render context: everything between the window and a recorded frame.
//!
//! `RenderContext` owns the instance, surface, device, allocator, swapchain,
//! render target, frame slots and pipeline cache. Fields are declared in
//! reverse creation order so drop tears the stack down front to back.

use crate::allocator::GpuAllocator;
use crate::config::RendererConfig;
use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use crate::instance::VulkanInstance;
use crate::physical_device::select_physical_device;
use crate::pipeline_cache::PipelineCache;
use crate::render_pass::{RenderPass, RenderTarget};
use crate::surface_swapchain::{
    acquire_with_rebuild, present_with_rebuild, AcquireOutcome, PresentOutcome, PresentStatus, Surface,
    SurfaceSwapchain, SwapchainOps,
};
use crate::sync_primitives::FrameSlots;
use crate::texture::record_one_time_submit_commands;
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// A frame being recorded. Returned by [`RenderContext::begin_frame`] with the
/// render pass already begun.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub slot: usize,
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
    pub extent: vk::Extent2D,
}

/// Swapchain operations over the context's borrowed presentation objects.
struct Presentation<'a> {
    swapchain: &'a mut SurfaceSwapchain,
    target: &'a mut RenderTarget,
    render_pass: &'a RenderPass,
    window_extent: vk::Extent2D,
    present_queue: vk::Queue,
}

impl SwapchainOps for Presentation<'_> {
    fn acquire(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        self.swapchain.acquire(signal)
    }

    fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentStatus> {
        self.swapchain.present(self.present_queue, image_index, wait)
    }

    fn rebuild(&mut self) -> Result<()> {
        self.swapchain.recreate(self.window_extent)?;
        self.target
            .rebuild(self.render_pass, self.swapchain.image_views(), self.swapchain.extent())
    }
}

pub struct RenderContext {
    pipeline_cache: Arc<PipelineCache>,
    frames: FrameSlots,
    target: RenderTarget,
    render_pass: Arc<RenderPass>,
    swapchain: SurfaceSwapchain,
    allocator: Arc<GpuAllocator>,
    device: Arc<LogicalDevice>,
    window_extent: vk::Extent2D,
    resize_pending: bool,
}

impl RenderContext {
    /// Creates the whole presentation stack for `window`.
    ///
    /// Any failure is fatal; objects created before the failing step are
    /// released as the partially built values drop.
    pub fn initialize<W>(window: &W, extent: vk::Extent2D, config: &RendererConfig) -> Result<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        config.validate()?;
        info!("Initializing render context at {}x{}...", extent.width, extent.height);
        let display_handle = window.raw_display_handle();
        let instance = Arc::new(VulkanInstance::new(
            &config.application_name,
            Some(display_handle),
            config.validation,
        )?);
        let surface = Surface::new(Arc::clone(&instance), display_handle, window.raw_window_handle())?;
        let physical = select_physical_device(&instance, Some((surface.loader(), surface.raw())))?;
        let device = Arc::new(LogicalDevice::new(instance, physical, true)?);
        let allocator = GpuAllocator::new(Arc::clone(&device))?;
        let swapchain = SurfaceSwapchain::new(Arc::clone(&device), surface, extent, config.present_mode)?;
        let render_pass = Arc::new(RenderPass::new(Arc::clone(&device), swapchain.format())?);
        let target = RenderTarget::new(
            Arc::clone(&allocator),
            &render_pass,
            swapchain.image_views(),
            swapchain.extent(),
        )?;
        let frames = FrameSlots::new(Arc::clone(&device), config.frames_in_flight)?;
        let pipeline_cache = Arc::new(PipelineCache::load(Arc::clone(&device), &config.pipeline_cache_path)?);
        info!("Render context ready ({} frames in flight).", frames.len());

        Ok(Self {
            pipeline_cache,
            frames,
            target,
            render_pass,
            swapchain,
            allocator,
            device,
            window_extent: extent,
            resize_pending: false,
        })
    }

    fn presentation(&mut self) -> Presentation<'_> {
        Presentation {
            swapchain: &mut self.swapchain,
            target: &mut self.target,
            render_pass: &self.render_pass,
            window_extent: self.window_extent,
            present_queue: self.device.queues.present_queue,
        }
    }

    /// Records a new window size. The swapchain is rebuilt before the next acquire.
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        let extent = vk::Extent2D { width, height };
        if extent != self.window_extent {
            debug!("Window resized to {}x{}.", width, height);
            self.window_extent = extent;
            self.resize_pending = true;
        }
    }

    /// Blocks until the current slot's fence signals, then resets it.
    pub fn wait_for_frame_slot(&mut self) -> Result<()> {
        self.frames.current().wait_and_reset(&self.device.raw)
    }

    /// Acquires the next swapchain image for the current slot, rebuilding and
    /// retrying once when the swapchain is stale.
    pub fn acquire_next_image(&mut self) -> Result<u32> {
        if self.resize_pending {
            self.resize_pending = false;
            self.presentation().rebuild()?;
        }
        let signal = self.frames.current().sync.image_available_semaphore;
        acquire_with_rebuild(&mut self.presentation(), signal)
    }

    /// Presents `image_index` after `wait`. A stale swapchain is rebuilt and
    /// the frame counts as soft-failed.
    pub fn present_image(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentOutcome> {
        present_with_rebuild(&mut self.presentation(), image_index, wait)
    }

    /// Waits for the slot, acquires an image and starts the render pass.
    pub fn begin_frame(&mut self) -> Result<FrameContext> {
        self.wait_for_frame_slot()?;
        let image_index = match self.acquire_next_image() {
            Ok(index) => index,
            Err(e) => {
                // The fence was reset; signal it again through an empty submission.
                let fence = self.frames.current().sync.in_flight_fence;
                // # Safety: the fence is unsignaled and not part of any pending submission.
                if let Err(signal_err) =
                    unsafe { self.device.raw.queue_submit(self.device.queues.graphics_queue, &[], fence) }
                {
                    warn!("Failed to re-signal frame fence after acquire failure: {}", signal_err);
                }
                return Err(e);
            }
        };

        let slot = self.frames.current();
        let command_buffer = slot.command_buffer;
        let extent = self.target.extent();
        let framebuffer = self.target.framebuffer(image_index).ok_or_else(|| {
            VulkanError::InitializationError(format!("no framebuffer for image {image_index}"))
        })?;
        let device = &self.device.raw;
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let clear_values = [
            vk::ClearValue { color: vk::ClearColorValue { float32: CLEAR_COLOR } },
            vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
        ];
        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.raw)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent })
            .clear_values(&clear_values);
        // # Safety: the slot's fence was waited, so its command buffer is idle.
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(command_buffer, &begin_info)?;
            device.cmd_begin_render_pass(command_buffer, &render_pass_begin, vk::SubpassContents::INLINE);
        }
        Ok(FrameContext { slot: self.frames.current_index(), image_index, command_buffer, extent })
    }

    /// Ends the render pass, submits the slot's command buffer, presents and
    /// moves to the next slot.
    pub fn end_frame(&mut self, frame: FrameContext) -> Result<PresentOutcome> {
        let sync = &self.frames.current().sync;
        let wait_semaphores = [sync.image_available_semaphore];
        let signal_semaphores = [sync.render_finished_semaphore];
        let fence = sync.in_flight_fence;
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let device = &self.device.raw;
        // # Safety: the command buffer is recording inside the render pass begun by begin_frame.
        unsafe {
            device.cmd_end_render_pass(frame.command_buffer);
            device.end_command_buffer(frame.command_buffer)?;
            device.queue_submit(self.device.queues.graphics_queue, &[submit_info.build()], fence)?;
        }

        let outcome = self.present_image(frame.image_index, &signal_semaphores);
        self.frames.advance();
        outcome
    }

    /// Records and runs a command buffer outside the frame loop, blocking until it finished.
    pub fn submit_one_time<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        record_one_time_submit_commands(
            &self.device.raw,
            self.frames.command_pool(),
            self.device.queues.graphics_queue,
            record,
        )
    }

    pub fn device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }

    pub fn allocator(&self) -> &Arc<GpuAllocator> {
        &self.allocator
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    /// Shared with pipeline builders; the blob is persisted when the last owner drops.
    pub fn pipeline_cache(&self) -> &Arc<PipelineCache> {
        &self.pipeline_cache
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn current_slot(&self) -> usize {
        self.frames.current_index()
    }

    /// Command pool for setup work on the render thread.
    pub fn command_pool(&self) -> vk::CommandPool {
        self.frames.command_pool()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.target.extent()
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("Device did not idle before render context teardown: {}", e);
        }
        info!("Render context shutting down.");
    }
}
