//! Water surface renderer.
//!
//! The renderer moves through [`WaterState`] lazily. The grid mesh is built at
//! construction; GPU resources wait until a [`WaterSource`] is known, because
//! the color map takes its size from the source grid; the pipeline and the
//! per-slot descriptor sets follow as soon as the program links.
//! [`WaterRenderer::ensure_resources`] performs whatever transitions are
//! possible and is called from every public entry point.

pub mod binding_schema;
pub mod dirty;
pub mod mesh;
pub mod occlusion;
pub mod streaming;
pub mod uniforms;
pub mod upload;

use crate::allocator::{Buffer, GpuAllocator, MemoryLocality};
use crate::buffer_utils::create_and_fill_gpu_buffer;
use crate::config::WaterConfig;
use crate::context::RenderContext;
use crate::descriptor_pool::DescriptorPool;
use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use crate::pipeline::{GraphicsPipeline, GraphicsPipelineBuilder, PipelineConfig};
use crate::pipeline_cache::PipelineCache;
use crate::program::{Program, ProgramManager};
use crate::render_pass::RenderPass;
use crate::texture::{Sampler, Texture, TextureDesc};
use ash::vk;
use binding_schema::{BindingSchema, SchemaBinding, WaterResource};
use mesh::WaterMesh;
use occlusion::OcclusionQuery;
use std::sync::Arc;
use streaming::{TextureStreamer, UploadReport, WaterSource};
use tracing::{debug, info, warn};
use uniforms::{SceneDefinition, WaterPushConstants, WaterUniforms};
use upload::{GpuUploadSink, UploadTarget};

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Lifecycle of a [`WaterRenderer`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WaterState {
    Uninitialized,
    MeshBuilt,
    ResourcesCreated,
    PipelineRealized,
    Rendering,
}

/// Images the lit pass samples this frame.
///
/// Color views must be in `SHADER_READ_ONLY_OPTIMAL`, depth views in
/// `DEPTH_STENCIL_READ_ONLY_OPTIMAL`. Missing mirror views fall back to the
/// screen copies.
#[derive(Debug, Clone, Copy)]
pub struct WaterFrameInputs {
    pub extent: vk::Extent2D,
    pub screen_color: vk::ImageView,
    pub screen_depth: vk::ImageView,
    pub mirror_color: Option<vk::ImageView>,
    pub mirror_depth: Option<vk::ImageView>,
}

impl WaterFrameInputs {
    fn view_for(&self, resource: WaterResource) -> Option<vk::ImageView> {
        match resource {
            WaterResource::ScreenColor => Some(self.screen_color),
            WaterResource::ScreenDepth => Some(self.screen_depth),
            WaterResource::MirrorColor => Some(self.mirror_color.unwrap_or(self.screen_color)),
            WaterResource::MirrorDepth => Some(self.mirror_depth.unwrap_or(self.screen_depth)),
            _ => None,
        }
    }
}

/// Runs `realize` unless an earlier attempt failed, in which case that
/// failure is returned again. Pipeline realization errors are not transient.
fn realize_once<T>(failure: &mut Option<String>, realize: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(message) = failure {
        return Err(VulkanError::PipelineCreationError(message.clone()));
    }
    realize().map_err(|e| {
        *failure = Some(e.to_string());
        e
    })
}

fn sampled_layout(resource: WaterResource) -> vk::ImageLayout {
    match resource {
        WaterResource::ScreenDepth | WaterResource::MirrorDepth => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

/// GPU objects that exist once a source grid is known.
struct WaterResources {
    // Declared first: waits for pending uploads before the textures go.
    sink: GpuUploadSink,
    occlusion: OcclusionQuery,
    uniform_buffers: Vec<Buffer>,
    sampler: Sampler,
    color_map: Texture,
    wave_map: Texture,
    index_buffer: Buffer,
    vertex_buffer: Buffer,
    grid_size: (u32, u32),
}

/// Pipeline and the per-slot descriptor sets written against its layout.
struct RealizedPipeline {
    descriptor_sets: Vec<vk::DescriptorSet>,
    descriptor_pool: DescriptorPool,
    pipeline: GraphicsPipeline,
    program: Arc<Program>,
}

pub struct WaterRenderer {
    realized: Option<RealizedPipeline>,
    resources: Option<WaterResources>,
    streamer: TextureStreamer,
    mesh: Option<WaterMesh>,
    schema: BindingSchema,
    config: WaterConfig,
    source: Option<Arc<dyn WaterSource>>,
    programs: Arc<ProgramManager>,
    pipeline_cache: Arc<PipelineCache>,
    render_pass: Arc<RenderPass>,
    setup_pool: vk::CommandPool,
    frames_in_flight: usize,
    allocator: Arc<GpuAllocator>,
    device: Arc<LogicalDevice>,
    state: WaterState,
    pipeline_failure: Option<String>,
}

impl WaterRenderer {
    /// Builds the mesh, starts the wave tanks and creates whatever GPU state
    /// the available inputs allow.
    pub fn new(
        context: &RenderContext,
        programs: Arc<ProgramManager>,
        config: &WaterConfig,
        source: Option<Arc<dyn WaterSource>>,
    ) -> Result<Self> {
        let device = Arc::clone(context.device());
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.graphics_family());
        // # Safety: valid create info on a live device.
        let setup_pool = unsafe { device.raw.create_command_pool(&pool_info, None) }?;

        let streamer = match TextureStreamer::new(config) {
            Ok(streamer) => streamer,
            Err(e) => {
                // # Safety: nothing was allocated from the pool.
                unsafe { device.raw.destroy_command_pool(setup_pool, None) };
                return Err(e);
            }
        };
        let mut renderer = Self {
            realized: None,
            resources: None,
            streamer,
            mesh: None,
            schema: BindingSchema::for_quality(config.quality),
            config: config.clone(),
            source: None,
            programs,
            pipeline_cache: Arc::clone(context.pipeline_cache()),
            render_pass: Arc::clone(context.render_pass()),
            setup_pool,
            frames_in_flight: context.frames_in_flight(),
            allocator: Arc::clone(context.allocator()),
            device,
            state: WaterState::Uninitialized,
            pipeline_failure: None,
        };

        renderer.mesh = Some(WaterMesh::grid(config.mesh_resolution));
        renderer.state = WaterState::MeshBuilt;
        debug!("Water mesh built at resolution {}.", config.mesh_resolution);

        match source {
            Some(source) => renderer.set_source(source)?,
            None => {
                renderer.ensure_resources()?;
            }
        }
        Ok(renderer)
    }

    pub fn state(&self) -> WaterState {
        self.state
    }

    /// Samples visible in the last completed occlusion query. Zero means the
    /// water was hidden; drawing is never skipped because of it.
    pub fn last_visible_samples(&self) -> Option<u64> {
        self.resources.as_ref().and_then(|r| r.occlusion.last_visible())
    }

    pub fn occlusion_enabled(&self) -> bool {
        self.resources.as_ref().is_some_and(|r| r.occlusion.is_enabled())
    }

    /// Binds (or replaces) the source grid and marks all of it dirty.
    pub fn set_source(&mut self, source: Arc<dyn WaterSource>) -> Result<()> {
        let size = (source.width(), source.height());
        if size.0 == 0 || size.1 == 0 {
            return Err(VulkanError::ResourceCreationError {
                resource_type: "water source".to_string(),
                message: format!("degenerate grid {}x{}", size.0, size.1),
            });
        }
        self.streamer.set_source_size(size.0, size.1);
        self.source = Some(source);
        if self.resources.as_ref().is_some_and(|r| r.grid_size != size) {
            self.replace_color_map(size)?;
        }
        self.ensure_resources()?;
        Ok(())
    }

    /// Point-mutation notification from the source grid.
    pub fn on_texel_changed(&mut self, x: u32, y: u32, z: u32) {
        if let Some(source) = self.source.as_ref() {
            let level = source.water_level();
            self.streamer.mark_texel(x, y, z, level);
        }
    }

    /// Performs every lifecycle transition the current inputs allow. Returns
    /// true once the pipeline is usable. A failed pipeline realization is
    /// reported again on every later call without being attempted.
    pub fn ensure_resources(&mut self) -> Result<bool> {
        if self.state == WaterState::Uninitialized {
            self.mesh = Some(WaterMesh::grid(self.config.mesh_resolution));
            self.state = WaterState::MeshBuilt;
        }
        if self.state == WaterState::MeshBuilt {
            let Some(source) = self.source.clone() else {
                return Ok(false);
            };
            self.resources = Some(self.create_resources((source.width(), source.height()))?);
            self.state = WaterState::ResourcesCreated;
        }
        if self.state == WaterState::ResourcesCreated {
            let already_failed = self.pipeline_failure.is_some();
            let mut failure = self.pipeline_failure.take();
            let realized = realize_once(&mut failure, || self.realize_pipeline());
            if !already_failed && failure.is_some() {
                warn!("Water pipeline could not be realized; later frames will not retry.");
            }
            self.pipeline_failure = failure;
            self.realized = Some(realized?);
            self.state = WaterState::PipelineRealized;
        }
        Ok(self.state >= WaterState::PipelineRealized)
    }

    fn create_resources(&self, grid_size: (u32, u32)) -> Result<WaterResources> {
        let mesh = self
            .mesh
            .as_ref()
            .ok_or_else(|| VulkanError::InitializationError("water mesh missing".to_string()))?;
        let queue = self.device.queues.graphics_queue;
        let vertex_buffer = create_and_fill_gpu_buffer(
            &self.allocator,
            self.setup_pool,
            queue,
            "water vertices",
            &mesh.vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = create_and_fill_gpu_buffer(
            &self.allocator,
            self.setup_pool,
            queue,
            "water indices",
            &mesh.indices,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        let quality = self.config.quality;
        let tank_size = quality.tank_size() as u32;
        let wave_map = Texture::new(
            &self.allocator,
            "wave map",
            TextureDesc {
                width: tank_size,
                height: tank_size,
                layers: quality.tank_count() as u32,
                mipmapped: true,
                array_view: self.schema.wave_map_view_type() == vk::ImageViewType::TYPE_2D_ARRAY,
                format: TEXTURE_FORMAT,
            },
            self.setup_pool,
            queue,
        )?;
        let color_map = self.create_color_map(grid_size)?;
        let sampler = Sampler::new_repeat_linear(Arc::clone(&self.device))?;

        let uniform_buffers = (0..self.frames_in_flight)
            .map(|slot| {
                self.allocator.create_buffer(
                    &format!("water uniforms {slot}"),
                    WaterUniforms::SIZE as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocality::HostToDevice,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut sink = GpuUploadSink::new(
            Arc::clone(&self.allocator),
            UploadTarget {
                image: wave_map.raw_image(),
                width: tank_size,
                height: tank_size,
                layers: quality.tank_count() as u32,
                mip_levels: wave_map.mip_levels(),
            },
        )?;
        sink.set_color_target(color_target(&color_map))?;
        let occlusion = OcclusionQuery::new(Arc::clone(&self.device), self.frames_in_flight)?;
        info!(
            "Water resources created: {}x{} color map, {} wave layer(s) of {}².",
            grid_size.0,
            grid_size.1,
            quality.tank_count(),
            tank_size
        );

        Ok(WaterResources {
            sink,
            occlusion,
            uniform_buffers,
            sampler,
            color_map,
            wave_map,
            index_buffer,
            vertex_buffer,
            grid_size,
        })
    }

    fn create_color_map(&self, (width, height): (u32, u32)) -> Result<Texture> {
        Texture::new(
            &self.allocator,
            "water color map",
            TextureDesc { width, height, layers: 1, mipmapped: false, array_view: false, format: TEXTURE_FORMAT },
            self.setup_pool,
            self.device.queues.graphics_queue,
        )
    }

    /// Swaps the color map for one of a new size and points every slot's
    /// descriptor set at it.
    fn replace_color_map(&mut self, size: (u32, u32)) -> Result<()> {
        self.device.wait_idle()?;
        let color_map = self.create_color_map(size)?;
        let Some(resources) = self.resources.as_mut() else {
            return Ok(());
        };
        resources.sink.set_color_target(color_target(&color_map))?;
        resources.color_map = color_map;
        resources.grid_size = size;
        if let (Some(realized), Some(binding)) = (self.realized.as_ref(), self.schema.binding(WaterResource::ColorMap)) {
            for &set in &realized.descriptor_sets {
                write_image(&self.device, set, binding, resources.color_map.view(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
        }
        info!("Water color map resized to {}x{}.", size.0, size.1);
        Ok(())
    }

    fn realize_pipeline(&self) -> Result<RealizedPipeline> {
        let resources = self
            .resources
            .as_ref()
            .ok_or_else(|| VulkanError::InitializationError("water resources missing".to_string()))?;
        let program = self.programs.register_program(self.schema.program_path())?;
        program.link_with_fallback(&self.schema.linked_layout())?;
        let layout = program
            .layout()
            .ok_or_else(|| VulkanError::ProgramNotLinked(program.name().to_string()))?;
        self.schema.check_layout(layout).map_err(|mismatch| {
            VulkanError::ProgramLinkError(format!("'{}' does not match the water bindings: {mismatch}", program.name()))
        })?;

        let pipeline = GraphicsPipelineBuilder::from_program(&program)?
            .render_pass(self.render_pass.raw, 0)
            .vertex_input(WaterMesh::vertex_input())
            .config(PipelineConfig { cull_mode: vk::CullModeFlags::NONE, ..PipelineConfig::default() })
            .build(Arc::clone(&self.device), Some(self.pipeline_cache.as_ref()))?;

        let set_layout = program
            .descriptor_set_layout()
            .ok_or_else(|| VulkanError::ProgramNotLinked(program.name().to_string()))?;
        let mut descriptor_pool =
            DescriptorPool::new(Arc::clone(&self.device), self.frames_in_flight as u32, &layout.descriptor_counts())?;
        let descriptor_sets = (0..self.frames_in_flight)
            .map(|_| descriptor_pool.allocate(set_layout))
            .collect::<Result<Vec<_>>>()?;
        for (slot, &set) in descriptor_sets.iter().enumerate() {
            for binding in self.schema.static_bindings() {
                self.write_static(set, slot, binding, resources);
            }
        }
        info!("Water pipeline realized from '{}'.", program.name());
        Ok(RealizedPipeline { descriptor_sets, descriptor_pool, pipeline, program })
    }

    fn write_static(&self, set: vk::DescriptorSet, slot: usize, binding: &SchemaBinding, resources: &WaterResources) {
        match binding.resource {
            WaterResource::Uniforms => {
                let buffer_info = [vk::DescriptorBufferInfo {
                    buffer: resources.uniform_buffers[slot].raw(),
                    offset: 0,
                    range: WaterUniforms::SIZE as vk::DeviceSize,
                }];
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding.binding)
                    .descriptor_type(binding.kind.descriptor_type())
                    .buffer_info(&buffer_info);
                // # Safety: the set is not in use by any submission yet.
                unsafe { self.device.raw.update_descriptor_sets(&[write.build()], &[]) };
            }
            WaterResource::LinearSampler => {
                let image_info = [vk::DescriptorImageInfo {
                    sampler: resources.sampler.raw,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }];
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding.binding)
                    .descriptor_type(binding.kind.descriptor_type())
                    .image_info(&image_info);
                // # Safety: the set is not in use by any submission yet.
                unsafe { self.device.raw.update_descriptor_sets(&[write.build()], &[]) };
            }
            WaterResource::ColorMap => write_image(
                &self.device,
                set,
                binding,
                resources.color_map.view(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            WaterResource::WaveMap => write_image(
                &self.device,
                set,
                binding,
                resources.wave_map.view(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            other => warn!("{:?} is not a static water binding.", other),
        }
    }

    /// Joins the wave tanks, uploads their bitmaps and the dirty part of the
    /// color map, then starts the next simulation step.
    pub fn update(&mut self, dt: f32) -> Result<UploadReport> {
        self.ensure_resources()?;
        let Some(resources) = self.resources.as_mut() else {
            return Ok(UploadReport::default());
        };
        let source = self.source.as_deref();
        self.streamer.update(dt, source, &mut resources.sink)
    }

    /// Records the lit water pass for frame slot `slot` into `command_buffer`,
    /// which must be inside the context's render pass. The slot's fence must
    /// already have been waited on. Returns false when nothing was drawn
    /// because no source grid is bound yet.
    pub fn render(
        &mut self,
        command_buffer: vk::CommandBuffer,
        slot: usize,
        scene: &SceneDefinition,
        inputs: &WaterFrameInputs,
    ) -> Result<bool> {
        if !self.ensure_resources()? {
            return Ok(false);
        }
        let (Some(resources), Some(realized)) = (self.resources.as_mut(), self.realized.as_ref()) else {
            return Ok(false);
        };
        let set = *realized.descriptor_sets.get(slot).ok_or_else(|| {
            VulkanError::InitializationError(format!("frame slot {slot} out of range ({})", self.frames_in_flight))
        })?;

        resources.occlusion.poll(slot);

        let water_level = self.source.as_ref().map_or(0, |s| s.water_level());
        let uniforms = WaterUniforms::new(scene, &self.config.fog, resources.grid_size, inputs.extent);
        resources.uniform_buffers[slot].write_bytes(0, bytemuck::bytes_of(&uniforms))?;
        let push = WaterPushConstants::new(
            scene,
            water_level as f32,
            self.config.displacement_scale,
            self.config.quality.tank_count() as u32,
        );

        for binding in self.schema.dynamic_bindings() {
            if let Some(view) = inputs.view_for(binding.resource) {
                write_image(&self.device, set, binding, view, sampled_layout(binding.resource));
            }
        }

        resources.occlusion.reset(slot);
        let mesh_indices = self.mesh.as_ref().map_or(0, WaterMesh::index_count);
        let extent = inputs.extent;
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D { offset: vk::Offset2D::default(), extent };
        let device = &self.device.raw;
        let program = &realized.program;
        let pipeline_layout =
            program.pipeline_layout().ok_or_else(|| VulkanError::ProgramNotLinked(program.name().to_string()))?;
        let push_stages = program
            .layout()
            .map(|layout| layout.push_constants.iter().fold(vk::ShaderStageFlags::empty(), |acc, pc| acc | pc.stages))
            .unwrap_or_default();
        // # Safety: the command buffer is recording inside a compatible render pass and every bound
        // object outlives the frame.
        unsafe {
            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, realized.pipeline.raw());
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[scissor]);
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &[set],
                &[],
            );
            if !push_stages.is_empty() {
                device.cmd_push_constants(command_buffer, pipeline_layout, push_stages, 0, bytemuck::bytes_of(&push));
            }
            device.cmd_bind_vertex_buffers(command_buffer, 0, &[resources.vertex_buffer.raw()], &[0]);
            device.cmd_bind_index_buffer(command_buffer, resources.index_buffer.raw(), 0, vk::IndexType::UINT32);
        }
        resources.occlusion.begin(command_buffer, slot);
        // # Safety: see above.
        unsafe { device.cmd_draw_indexed(command_buffer, mesh_indices, 1, 0, 0, 0) };
        resources.occlusion.end(command_buffer, slot);

        self.state = WaterState::Rendering;
        Ok(true)
    }
}

impl Drop for WaterRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("Device did not idle before water teardown: {}", e);
        }
        self.realized = None;
        self.resources = None;
        // # Safety: the device is idle and every buffer from the pool was freed.
        unsafe { self.device.raw.destroy_command_pool(self.setup_pool, None) };
        debug!("Water renderer destroyed.");
    }
}

fn color_target(texture: &Texture) -> UploadTarget {
    let desc = texture.desc();
    UploadTarget {
        image: texture.raw_image(),
        width: desc.width,
        height: desc.height,
        layers: 1,
        mip_levels: texture.mip_levels(),
    }
}

fn write_image(
    device: &LogicalDevice,
    set: vk::DescriptorSet,
    binding: &SchemaBinding,
    view: vk::ImageView,
    layout: vk::ImageLayout,
) {
    let image_info = [vk::DescriptorImageInfo { sampler: vk::Sampler::null(), image_view: view, image_layout: layout }];
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding.binding)
        .descriptor_type(binding.kind.descriptor_type())
        .image_info(&image_info);
    // # Safety: callers only write sets whose slot fence has been waited on.
    unsafe { device.raw.update_descriptor_sets(&[write.build()], &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        assert!(WaterState::Uninitialized < WaterState::MeshBuilt);
        assert!(WaterState::MeshBuilt < WaterState::ResourcesCreated);
        assert!(WaterState::ResourcesCreated < WaterState::PipelineRealized);
        assert!(WaterState::PipelineRealized < WaterState::Rendering);
    }

    #[test]
    fn mirror_views_fall_back_to_screen_copies() {
        use vk::Handle;
        let inputs = WaterFrameInputs {
            extent: vk::Extent2D { width: 64, height: 64 },
            screen_color: vk::ImageView::from_raw(1),
            screen_depth: vk::ImageView::from_raw(2),
            mirror_color: Some(vk::ImageView::from_raw(3)),
            mirror_depth: None,
        };
        assert_eq!(inputs.view_for(WaterResource::MirrorColor), Some(vk::ImageView::from_raw(3)));
        assert_eq!(inputs.view_for(WaterResource::MirrorDepth), Some(vk::ImageView::from_raw(2)));
        assert_eq!(inputs.view_for(WaterResource::ColorMap), None);
        assert_eq!(sampled_layout(WaterResource::ScreenDepth), vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
        assert_eq!(sampled_layout(WaterResource::MirrorColor), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn failed_realization_is_not_retried() {
        let mut failure = None;
        let mut attempts = 0;
        let first: Result<()> = realize_once(&mut failure, || {
            attempts += 1;
            Err(VulkanError::ProgramLinkError("water3 does not match".to_string()))
        });
        assert!(matches!(first, Err(VulkanError::ProgramLinkError(_))));

        let second: Result<()> = realize_once(&mut failure, || {
            attempts += 1;
            Ok(())
        });
        assert_eq!(attempts, 1);
        match second {
            Err(VulkanError::PipelineCreationError(message)) => assert!(message.contains("water3 does not match")),
            other => panic!("expected the latched failure, got {other:?}"),
        }
    }

    #[test]
    fn successful_realization_leaves_no_failure() {
        let mut failure = None;
        let value = realize_once(&mut failure, || Ok(7)).unwrap();
        assert_eq!(value, 7);
        assert!(failure.is_none());
    }
}
