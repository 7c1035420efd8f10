//! Graphics pipelines built from a linked program and a declarative config.

use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use crate::pipeline_cache::PipelineCache;
use crate::program::Program;
use crate::shader::ShaderStage;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;
use tracing::{debug, info};

// SAFETY: the literal is NUL-terminated with no interior NUL.
const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Color blending presets for the single color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendPreset {
    #[default]
    Opaque,
    /// `src * a + dst * (1 - a)`.
    StraightAlpha,
    /// `src * a + dst`.
    Additive,
}

impl BlendPreset {
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let builder = vk::PipelineColorBlendAttachmentState::builder().color_write_mask(vk::ColorComponentFlags::RGBA);
        match self {
            BlendPreset::Opaque => builder.blend_enable(false).build(),
            BlendPreset::StraightAlpha => builder
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
            BlendPreset::Additive => builder
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ZERO)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
        }
    }
}

/// One interleaved vertex buffer binding.
#[derive(Debug, Clone, Default)]
pub struct VertexInput {
    pub stride: u32,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// Fixed-function state of a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend: BlendPreset,
    pub dynamic_states: Vec<vk::DynamicState>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            blend: BlendPreset::Opaque,
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphicsPipelineBuilder {
    stages: Vec<(ShaderStage, vk::ShaderModule)>,
    layout: Option<vk::PipelineLayout>,
    render_pass: Option<vk::RenderPass>,
    subpass: u32,
    vertex_input: VertexInput,
    config: PipelineConfig,
}

impl GraphicsPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a linked program's shader stages and pipeline layout.
    pub fn from_program(program: &Program) -> Result<Self> {
        let layout = program
            .pipeline_layout()
            .ok_or_else(|| VulkanError::ProgramNotLinked(program.name().to_string()))?;
        let mut builder = Self::new().layout(layout);
        for (stage, module) in program.stage_modules()? {
            builder = builder.stage(stage, module);
        }
        Ok(builder)
    }

    pub fn stage(mut self, stage: ShaderStage, module: vk::ShaderModule) -> Self {
        self.stages.push((stage, module));
        self
    }

    pub fn layout(mut self, layout: vk::PipelineLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn render_pass(mut self, render_pass: vk::RenderPass, subpass: u32) -> Self {
        self.render_pass = Some(render_pass);
        self.subpass = subpass;
        self
    }

    pub fn vertex_input(mut self, vertex_input: VertexInput) -> Self {
        self.vertex_input = vertex_input;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn blend(mut self, blend: BlendPreset) -> Self {
        self.config.blend = blend;
        self
    }

    /// Reports incomplete configuration before anything reaches the driver.
    pub fn validate(&self) -> Result<()> {
        let has = |wanted: ShaderStage| self.stages.iter().any(|(stage, _)| *stage == wanted);
        if !has(ShaderStage::Vertex) {
            return Err(VulkanError::PipelineCreationError("missing vertex stage".to_string()));
        }
        if !has(ShaderStage::Fragment) {
            return Err(VulkanError::PipelineCreationError("missing fragment stage".to_string()));
        }
        if has(ShaderStage::Compute) {
            return Err(VulkanError::PipelineCreationError("compute stage in a graphics pipeline".to_string()));
        }
        for (index, (stage, module)) in self.stages.iter().enumerate() {
            if *module == vk::ShaderModule::null() {
                return Err(VulkanError::PipelineCreationError(format!("{stage:?} stage has a null module")));
            }
            if self.stages[..index].iter().any(|(earlier, _)| earlier == stage) {
                return Err(VulkanError::PipelineCreationError(format!("duplicate {stage:?} stage")));
            }
        }
        match self.layout {
            Some(layout) if layout != vk::PipelineLayout::null() => {}
            _ => return Err(VulkanError::PipelineCreationError("missing pipeline layout".to_string())),
        }
        match self.render_pass {
            Some(render_pass) if render_pass != vk::RenderPass::null() => {}
            _ => return Err(VulkanError::PipelineCreationError("missing render pass".to_string())),
        }
        Ok(())
    }

    pub fn build(&self, device: Arc<LogicalDevice>, cache: Option<&PipelineCache>) -> Result<GraphicsPipeline> {
        self.validate()?;
        let config = &self.config;

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = self
            .stages
            .iter()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.vk_flags())
                    .module(*module)
                    .name(ENTRY_POINT)
                    .build()
            })
            .collect();

        let vertex_bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.vertex_input.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let mut vertex_input_info =
            vk::PipelineVertexInputStateCreateInfo::builder().vertex_attribute_descriptions(&self.vertex_input.attributes);
        if !self.vertex_input.attributes.is_empty() {
            vertex_input_info = vertex_input_info.vertex_binding_descriptions(&vertex_bindings);
        }

        let input_assembly_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(config.topology)
            .primitive_restart_enable(false);
        let viewport_info = vk::PipelineViewportStateCreateInfo::builder().viewport_count(1).scissor_count(1);
        let rasterization_info = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .line_width(1.0)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false);
        let multisample_info = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil_info = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);
        let color_blend_attachments = [config.blend.attachment_state()];
        let color_blend_info = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);
        let dynamic_state_info = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&config.dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly_info)
            .viewport_state(&viewport_info)
            .rasterization_state(&rasterization_info)
            .multisample_state(&multisample_info)
            .depth_stencil_state(&depth_stencil_info)
            .color_blend_state(&color_blend_info)
            .dynamic_state(&dynamic_state_info)
            .layout(self.layout.unwrap_or_default())
            .render_pass(self.render_pass.unwrap_or_default())
            .subpass(self.subpass)
            .build();

        let cache = cache.map(PipelineCache::raw).unwrap_or_default();
        // # Safety: every referenced state struct lives until the call returns.
        let pipelines = unsafe { device.raw.create_graphics_pipelines(cache, &[create_info], None) }.map_err(
            |(pipelines, result)| {
                for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    // # Safety: partially created pipelines are unused.
                    unsafe { device.raw.destroy_pipeline(pipeline, None) };
                }
                VulkanError::PipelineCreationError(format!("vkCreateGraphicsPipelines failed: {result}"))
            },
        )?;
        let raw = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::PipelineCreationError("driver returned no pipeline".to_string()))?;
        info!("Graphics pipeline created ({} stages, {:?} blend).", stage_infos.len(), config.blend);
        Ok(GraphicsPipeline { raw, device })
    }
}

/// Owning wrapper for a `vk::Pipeline`. The pipeline layout belongs to the program.
pub struct GraphicsPipeline {
    raw: vk::Pipeline,
    device: Arc<LogicalDevice>,
}

impl GraphicsPipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        // # Safety: no command buffer using the pipeline is pending.
        unsafe { self.device.raw.destroy_pipeline(self.raw, None) };
        debug!("Graphics pipeline {:?} destroyed.", self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use ash::vk::Handle;

    fn module(raw: u64) -> vk::ShaderModule {
        vk::ShaderModule::from_raw(raw)
    }

    fn complete() -> GraphicsPipelineBuilder {
        GraphicsPipelineBuilder::new()
            .stage(ShaderStage::Vertex, module(1))
            .stage(ShaderStage::Fragment, module(2))
            .layout(vk::PipelineLayout::from_raw(3))
            .render_pass(vk::RenderPass::from_raw(4), 0)
    }

    #[test]
    fn blend_presets() {
        let opaque = BlendPreset::Opaque.attachment_state();
        assert_eq!(opaque.blend_enable, vk::FALSE);
        assert_eq!(opaque.color_write_mask, vk::ColorComponentFlags::RGBA);

        let alpha = BlendPreset::StraightAlpha.attachment_state();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);

        let additive = BlendPreset::Additive.attachment_state();
        assert_eq!(additive.dst_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(additive.color_blend_op, vk::BlendOp::ADD);
    }

    #[test]
    fn complete_configuration_validates() {
        assert!(complete().validate().is_ok());
        assert!(complete().stage(ShaderStage::Geometry, module(5)).validate().is_ok());
    }

    #[test]
    fn incomplete_configuration_is_reported() {
        let no_fragment = GraphicsPipelineBuilder::new()
            .stage(ShaderStage::Vertex, module(1))
            .layout(vk::PipelineLayout::from_raw(3))
            .render_pass(vk::RenderPass::from_raw(4), 0);
        assert!(matches!(no_fragment.validate(), Err(VulkanError::PipelineCreationError(_))));

        let no_layout = GraphicsPipelineBuilder::new()
            .stage(ShaderStage::Vertex, module(1))
            .stage(ShaderStage::Fragment, module(2))
            .render_pass(vk::RenderPass::from_raw(4), 0);
        assert!(no_layout.validate().is_err());

        let no_pass = GraphicsPipelineBuilder::new()
            .stage(ShaderStage::Vertex, module(1))
            .stage(ShaderStage::Fragment, module(2))
            .layout(vk::PipelineLayout::from_raw(3));
        assert!(no_pass.validate().is_err());

        assert!(complete().stage(ShaderStage::Vertex, module(9)).validate().is_err());
        assert!(complete().stage(ShaderStage::Compute, module(9)).validate().is_err());
    }

    #[test]
    fn unlinked_program_cannot_seed_a_pipeline() {
        let backend = Arc::new(FakeBackend::default());
        let program = Program::new("water1.program", backend);
        let err = GraphicsPipelineBuilder::from_program(&program);
        assert!(matches!(err, Err(VulkanError::ProgramNotLinked(name)) if name == "water1.program"));
    }
}
