//! Shader loading, compilation and SPIR-V reflection.
//!
//! A shader is identified by its path. The file extension decides the stage
//! (`.vert`/`.vs`, `.frag`/`.fs`, `.geom`/`.gs`, `.comp`/`.cs`); a trailing
//! `.spv` marks pre-compiled bytecode, anything else is GLSL compiled through
//! a [`ShaderCompiler`]. Reflection runs on the final SPIR-V with naga; when it
//! cannot handle a module (geometry shaders, exotic capabilities) a warning is
//! logged once and the shader is kept without reflection data.

use crate::device::LogicalDevice;
use crate::error::{Result, VulkanError};
use ash::vk;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static REFLECTION_WARNING_LOGGED: AtomicBool = AtomicBool::new(false);

/// Pipeline stage of a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    Compute,
}

impl ShaderStage {
    /// Derives the stage and whether the file holds pre-compiled SPIR-V.
    pub fn from_path(path: &str) -> Result<(ShaderStage, bool)> {
        let (stem, precompiled) = match path.strip_suffix(".spv") {
            Some(stem) => (stem, true),
            None => (path, false),
        };
        let extension = Path::new(stem)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let stage = match extension.as_str() {
            "vert" | "vs" => ShaderStage::Vertex,
            "frag" | "fs" => ShaderStage::Fragment,
            "geom" | "gs" => ShaderStage::Geometry,
            "comp" | "cs" => ShaderStage::Compute,
            _ => {
                return Err(VulkanError::ShaderLoadingError(format!(
                    "cannot derive shader stage from '{path}'"
                )))
            }
        };
        Ok((stage, precompiled))
    }

    pub fn vk_flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Kind of descriptor a reflected binding needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    CombinedImageSampler,
}

impl ResourceKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            ResourceKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            ResourceKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            ResourceKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            ResourceKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            ResourceKind::Sampler => vk::DescriptorType::SAMPLER,
            ResourceKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// A descriptor binding found in a shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub kind: ResourceKind,
    /// Byte size for buffers, 0 for images and samplers.
    pub size: u32,
}

/// A push-constant block found in a shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedPushConstant {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// Resources used by one shader, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    pub bindings: Vec<ReflectedBinding>,
    pub push_constants: Vec<ReflectedPushConstant>,
}

/// Collects descriptor bindings and push constants from a naga module.
pub fn reflect_module(module: &naga::Module) -> ShaderReflection {
    let mut reflection = ShaderReflection::default();
    let gctx = module.to_ctx();

    for (_, var) in module.global_variables.iter() {
        let ty = &module.types[var.ty];
        let name = var
            .name
            .clone()
            .or_else(|| ty.name.clone())
            .unwrap_or_else(|| "<unnamed>".to_string());

        let kind = match var.space {
            naga::AddressSpace::PushConstant => {
                reflection.push_constants.push(ReflectedPushConstant { name, offset: 0, size: ty.inner.size(gctx) });
                continue;
            }
            naga::AddressSpace::Uniform => ResourceKind::UniformBuffer,
            naga::AddressSpace::Storage { .. } => ResourceKind::StorageBuffer,
            naga::AddressSpace::Handle => match ty.inner {
                naga::TypeInner::Image { class: naga::ImageClass::Storage { .. }, .. } => ResourceKind::StorageImage,
                naga::TypeInner::Image { .. } => ResourceKind::SampledImage,
                naga::TypeInner::Sampler { .. } => ResourceKind::Sampler,
                _ => {
                    debug!("Skipping unsupported handle resource '{}'", name);
                    continue;
                }
            },
            _ => continue,
        };

        let Some(resource_binding) = var.binding.as_ref() else {
            debug!("Resource '{}' has no binding decoration; skipping.", name);
            continue;
        };
        let size = match kind {
            ResourceKind::UniformBuffer | ResourceKind::StorageBuffer => ty.inner.size(gctx),
            _ => 0,
        };
        reflection.bindings.push(ReflectedBinding {
            name,
            set: resource_binding.group,
            binding: resource_binding.binding,
            kind,
            size,
        });
    }
    reflection
}

/// Parses SPIR-V words with naga and reflects them.
pub fn reflect_spirv(words: &[u32]) -> Result<ShaderReflection> {
    let options = naga::front::spv::Options { adjust_coordinate_space: false, ..Default::default() };
    let module = naga::front::spv::parse_u8_slice(bytemuck::cast_slice(words), &options)
        .map_err(|e| VulkanError::ShaderLoadingError(format!("SPIR-V reflection failed: {e}")))?;
    Ok(reflect_module(&module))
}

/// Turns shader source into SPIR-V.
pub trait ShaderCompiler: Send + Sync {
    fn compile(&self, stage: ShaderStage, source: &str, path: &str) -> Result<Vec<u32>>;
}

/// Compiles Vulkan GLSL (`#version 450`) through naga's GLSL front end and
/// SPIR-V back end. Geometry shaders are not supported by naga and must be
/// shipped pre-compiled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NagaGlslCompiler;

impl NagaGlslCompiler {
    /// Parses GLSL into a validated-ready naga module.
    pub fn parse(&self, stage: ShaderStage, source: &str, path: &str) -> Result<naga::Module> {
        let naga_stage = match stage {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
            ShaderStage::Geometry => {
                return Err(VulkanError::ShaderLoadingError(format!(
                    "'{path}': geometry shaders must be supplied as pre-compiled .spv"
                )))
            }
        };
        naga::front::glsl::Frontend::default()
            .parse(&naga::front::glsl::Options::from(naga_stage), source)
            .map_err(|e| VulkanError::ShaderLoadingError(format!("'{path}': {e}")))
    }
}

impl ShaderCompiler for NagaGlslCompiler {
    fn compile(&self, stage: ShaderStage, source: &str, path: &str) -> Result<Vec<u32>> {
        let module = self.parse(stage, source, path)?;
        let info = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
            .validate(&module)
            .map_err(|e| VulkanError::ShaderLoadingError(format!("'{path}' failed validation: {}", e.as_inner())))?;

        let mut options = naga::back::spv::Options::default();
        options.flags.remove(naga::back::spv::WriterFlags::ADJUST_COORDINATE_SPACE);
        options.flags.insert(naga::back::spv::WriterFlags::DEBUG);
        let entry_point = module
            .entry_points
            .first()
            .ok_or_else(|| VulkanError::ShaderLoadingError(format!("'{path}' has no entry point")))?;
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage: entry_point.stage,
            entry_point: entry_point.name.clone(),
        };
        naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
            .map_err(|e| VulkanError::ShaderLoadingError(format!("'{path}' SPIR-V generation failed: {e}")))
    }
}

/// Where shader and program files come from.
pub trait FileSource: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Reads files relative to a root directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
}

impl FileSource for DirectorySource {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.root.join(path);
        fs::read(&full_path).map_err(|e| {
            VulkanError::ShaderLoadingError(format!("failed to read {}: {}", full_path.display(), e))
        })
    }
}

/// Driver calls needed by shaders and programs.
pub trait ShaderBackend: Send + Sync {
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    /// Reflects final SPIR-V. An error leaves the shader without reflection data.
    fn reflect(&self, words: &[u32]) -> Result<ShaderReflection> {
        reflect_spirv(words)
    }
}

/// Logs that reflection is unavailable, once per process. Returns whether
/// this call produced the log line.
fn note_reflection_unavailable(path: &str, error: &VulkanError) -> bool {
    if REFLECTION_WARNING_LOGGED.swap(true, Ordering::Relaxed) {
        debug!("No reflection for '{}': {}", path, error);
        return false;
    }
    warn!("Shader reflection unavailable ('{}': {}); layouts must come from a fallback.", path, error);
    true
}

impl ShaderBackend for LogicalDevice {
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        // # Safety: `code` is non-empty SPIR-V checked by the caller.
        unsafe { self.raw.create_shader_module(&create_info, None) }
            .map_err(|e| VulkanError::ShaderLoadingError(format!("vkCreateShaderModule failed: {e}")))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        // # Safety: pipelines built from the module hold no reference to it.
        unsafe { self.raw.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        // # Safety: valid create info on a live device.
        unsafe { self.raw.create_descriptor_set_layout(&create_info, None) }.map_err(|e| {
            VulkanError::ResourceCreationError {
                resource_type: "DescriptorSetLayout".to_string(),
                message: e.to_string(),
            }
        })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // # Safety: descriptor sets allocated with the layout are no longer in flight.
        unsafe { self.raw.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        // # Safety: valid create info on a live device.
        unsafe { self.raw.create_pipeline_layout(&create_info, None) }.map_err(|e| {
            VulkanError::ResourceCreationError {
                resource_type: "PipelineLayout".to_string(),
                message: e.to_string(),
            }
        })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // # Safety: pipelines using the layout are destroyed first.
        unsafe { self.raw.destroy_pipeline_layout(layout, None) };
    }
}

/// A loaded shader module and its reflection data.
pub struct Shader {
    path: String,
    stage: ShaderStage,
    module: Option<vk::ShaderModule>,
    reflection: Option<ShaderReflection>,
    backend: Arc<dyn ShaderBackend>,
}

impl std::fmt::Debug for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("path", &self.path)
            .field("stage", &self.stage)
            .field("module", &self.module)
            .field("reflected", &self.reflection.is_some())
            .finish()
    }
}

impl Shader {
    /// A shader known by path and stage whose module has not been created.
    pub fn declared(path: &str, stage: ShaderStage, backend: Arc<dyn ShaderBackend>) -> Self {
        Self { path: path.to_string(), stage, module: None, reflection: None, backend }
    }

    /// Creates the module from SPIR-V bytes (`.spv` files).
    pub fn from_spirv_bytes(path: &str, stage: ShaderStage, bytes: &[u8], backend: Arc<dyn ShaderBackend>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(VulkanError::ShaderLoadingError(format!("'{path}' contains no bytecode")));
        }
        let words = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| VulkanError::ShaderLoadingError(format!("'{path}' is not valid SPIR-V: {e}")))?;
        Self::from_spirv_words(path, stage, words, backend)
    }

    /// Compiles source and creates the module.
    pub fn from_source(
        path: &str,
        stage: ShaderStage,
        source: &str,
        compiler: &dyn ShaderCompiler,
        backend: Arc<dyn ShaderBackend>,
    ) -> Result<Self> {
        let words = compiler.compile(stage, source, path)?;
        Self::from_spirv_words(path, stage, words, backend)
    }

    fn from_spirv_words(path: &str, stage: ShaderStage, words: Vec<u32>, backend: Arc<dyn ShaderBackend>) -> Result<Self> {
        if words.is_empty() {
            return Err(VulkanError::ShaderLoadingError(format!("'{path}' produced empty bytecode")));
        }
        let reflection = match backend.reflect(&words) {
            Ok(reflection) => Some(reflection),
            Err(e) => {
                note_reflection_unavailable(path, &e);
                None
            }
        };
        let module = backend.create_shader_module(&words)?;
        debug!("Shader '{}' ({:?}) loaded: {} words.", path, stage, words.len());
        Ok(Self { path: path.to_string(), stage, module: Some(module), reflection, backend })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn is_compiled(&self) -> bool {
        self.module.is_some()
    }

    pub fn module(&self) -> Option<vk::ShaderModule> {
        self.module
    }

    pub fn reflection(&self) -> Option<&ShaderReflection> {
        self.reflection.as_ref()
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            self.backend.destroy_shader_module(module);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    const VERTEX: &str = r#"#version 450
layout(set = 0, binding = 0) uniform Globals { mat4 view_proj; vec4 tint; } globals;
layout(push_constant) uniform Push { vec4 plane; } pc;
layout(location = 0) in vec2 a_pos;
void main() {
    gl_Position = globals.view_proj * vec4(a_pos, pc.plane.w, 1.0);
}
"#;

    const FRAGMENT: &str = r#"#version 450
layout(set = 0, binding = 1) uniform texture2D color_map;
layout(set = 0, binding = 2) uniform sampler linear_sampler;
layout(location = 0) out vec4 frag_color;
void main() {
    frag_color = texture(sampler2D(color_map, linear_sampler), vec2(0.5, 0.5));
}
"#;

    #[test]
    fn stage_follows_extension() {
        assert_eq!(ShaderStage::from_path("water.vert").unwrap(), (ShaderStage::Vertex, false));
        assert_eq!(ShaderStage::from_path("a/b/water.fs").unwrap(), (ShaderStage::Fragment, false));
        assert_eq!(ShaderStage::from_path("spray.gs.spv").unwrap(), (ShaderStage::Geometry, true));
        assert_eq!(ShaderStage::from_path("Blur.COMP").unwrap(), (ShaderStage::Compute, false));
        assert!(ShaderStage::from_path("water.txt").is_err());
        assert!(ShaderStage::from_path("water.spv").is_err());
    }

    #[test]
    fn reflects_glsl_resources_in_declaration_order() {
        let compiler = NagaGlslCompiler;
        let vertex = compiler.parse(ShaderStage::Vertex, VERTEX, "test.vert").unwrap();
        let reflection = reflect_module(&vertex);
        assert_eq!(reflection.bindings.len(), 1);
        assert_eq!(reflection.bindings[0].name, "globals");
        assert_eq!(reflection.bindings[0].kind, ResourceKind::UniformBuffer);
        assert_eq!(reflection.bindings[0].size, 80);
        assert_eq!(reflection.push_constants.len(), 1);
        assert_eq!(reflection.push_constants[0].size, 16);

        let fragment = compiler.parse(ShaderStage::Fragment, FRAGMENT, "test.frag").unwrap();
        let reflection = reflect_module(&fragment);
        let names: Vec<_> = reflection.bindings.iter().map(|b| (b.name.as_str(), b.binding, b.kind)).collect();
        assert_eq!(
            names,
            vec![("color_map", 1, ResourceKind::SampledImage), ("linear_sampler", 2, ResourceKind::Sampler)]
        );
    }

    #[test]
    fn compiled_spirv_round_trips_through_reflection() {
        let words = NagaGlslCompiler.compile(ShaderStage::Fragment, FRAGMENT, "test.frag").unwrap();
        assert_eq!(words[0], 0x0723_0203);
        let reflection = reflect_spirv(&words).unwrap();
        assert_eq!(reflection.bindings.len(), 2);
        assert!(reflection.bindings.iter().all(|b| b.set == 0));
    }

    #[test]
    fn geometry_source_cannot_be_compiled() {
        let err = NagaGlslCompiler.compile(ShaderStage::Geometry, "#version 450\nvoid main() {}", "x.geom");
        assert!(matches!(err, Err(VulkanError::ShaderLoadingError(_))));
    }

    #[test]
    fn empty_bytecode_is_rejected() {
        let backend = Arc::new(FakeBackend::default());
        let err = Shader::from_spirv_bytes("empty.vert.spv", ShaderStage::Vertex, &[], backend.clone());
        assert!(matches!(err, Err(VulkanError::ShaderLoadingError(_))));
        assert_eq!(backend.live_modules(), 0);
    }

    #[test]
    fn unreflectable_bytecode_still_loads() {
        let backend = Arc::new(FakeBackend::without_reflection());
        let header: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];
        let shader = Shader::from_spirv_bytes(
            "blank.geom.spv",
            ShaderStage::Geometry,
            bytemuck::cast_slice(&header),
            backend.clone(),
        )
        .unwrap();
        assert!(shader.is_compiled());
        assert!(shader.reflection().is_none());
        assert_eq!(backend.live_modules(), 1);
        drop(shader);
        assert_eq!(backend.live_modules(), 0);
    }

    #[test]
    fn missing_reflection_is_logged_once() {
        let err = VulkanError::ShaderLoadingError("no reflection".to_string());
        note_reflection_unavailable("a.vert", &err);
        assert!(REFLECTION_WARNING_LOGGED.load(Ordering::Relaxed));
        assert!(!note_reflection_unavailable("b.vert", &err));
        assert!(!note_reflection_unavailable("c.frag", &err));
    }
}
