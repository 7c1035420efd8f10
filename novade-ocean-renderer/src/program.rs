//! Programs (linked groups of shaders) and the manager that caches shaders and
//! programs by path.
//!
//! A program descriptor is a plain text file with one shader path per line.
//! Blank lines and `#` comments are ignored, lines starting with `*` are
//! reserved for directives and skipped.
//!
//! Linking merges the reflection data of every attached shader into a single
//! descriptor-set layout (set 0, bindings in declaration order) and a pipeline
//! layout. Once linked a program is immutable.

use crate::error::{Result, VulkanError};
use crate::config::RendererConfig;
use crate::shader::{
    DirectorySource, FileSource, NagaGlslCompiler, ReflectedBinding, ResourceKind, Shader, ShaderBackend,
    ShaderCompiler, ShaderReflection, ShaderStage,
};
use ash::vk;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

/// Returns the shader paths listed in a program descriptor, in order.
pub fn parse_program_descriptor(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('*'))
        .map(str::to_string)
        .collect()
}

/// A merged descriptor binding of a linked program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedBinding {
    pub name: String,
    pub binding: u32,
    pub kind: ResourceKind,
    pub size: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedPushConstant {
    pub offset: u32,
    pub size: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Name → binding mapping of a linked program plus its push-constant ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkedLayout {
    pub bindings: Vec<LinkedBinding>,
    pub push_constants: Vec<LinkedPushConstant>,
}

impl LinkedLayout {
    pub fn binding(&self, name: &str) -> Option<&LinkedBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn set_layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding> {
        self.bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.kind.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect()
    }

    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        self.push_constants
            .iter()
            .map(|pc| vk::PushConstantRange { stage_flags: pc.stages, offset: pc.offset, size: pc.size })
            .collect()
    }

    /// Number of bindings of each descriptor type, used to size descriptor pools.
    pub fn descriptor_counts(&self) -> Vec<(vk::DescriptorType, u32)> {
        let mut counts: Vec<(vk::DescriptorType, u32)> = Vec::new();
        for binding in &self.bindings {
            let ty = binding.kind.descriptor_type();
            match counts.iter_mut().find(|(t, _)| *t == ty) {
                Some((_, count)) => *count += 1,
                None => counts.push((ty, 1)),
            }
        }
        counts
    }
}

/// Merges per-stage reflection data into one layout.
///
/// Requires a vertex and a fragment stage. Resources outside set 0 are
/// ignored with a warning. Same-named resources get their stage flags OR-ed;
/// push-constant blocks with identical offset and size share one range.
pub fn merge_reflections(stages: &[(ShaderStage, &ShaderReflection)]) -> Result<LinkedLayout> {
    require_graphics_stages(stages.iter().map(|(stage, _)| *stage))?;

    let mut layout = LinkedLayout::default();
    for (stage, reflection) in stages {
        let flags = stage.vk_flags();
        for resource in &reflection.bindings {
            if resource.set != 0 {
                warn!(
                    "Ignoring resource '{}' in descriptor set {}; only set 0 is supported.",
                    resource.name, resource.set
                );
                continue;
            }
            merge_binding(&mut layout.bindings, resource, flags)?;
        }
        for block in &reflection.push_constants {
            match layout
                .push_constants
                .iter_mut()
                .find(|pc| pc.offset == block.offset && pc.size == block.size)
            {
                Some(existing) => existing.stages |= flags,
                None => layout.push_constants.push(LinkedPushConstant {
                    offset: block.offset,
                    size: block.size,
                    stages: flags,
                }),
            }
        }
    }
    Ok(layout)
}

fn merge_binding(bindings: &mut Vec<LinkedBinding>, resource: &ReflectedBinding, flags: vk::ShaderStageFlags) -> Result<()> {
    if let Some(existing) = bindings.iter_mut().find(|b| b.name == resource.name) {
        if existing.binding != resource.binding || existing.kind != resource.kind {
            return Err(VulkanError::ProgramLinkError(format!(
                "resource '{}' declared as {:?}@{} and {:?}@{}",
                resource.name, existing.kind, existing.binding, resource.kind, resource.binding
            )));
        }
        existing.stages |= flags;
        existing.size = existing.size.max(resource.size);
        return Ok(());
    }
    if let Some(clash) = bindings.iter().find(|b| b.binding == resource.binding) {
        return Err(VulkanError::ProgramLinkError(format!(
            "binding {} used by both '{}' and '{}'",
            resource.binding, clash.name, resource.name
        )));
    }
    bindings.push(LinkedBinding {
        name: resource.name.clone(),
        binding: resource.binding,
        kind: resource.kind,
        size: resource.size,
        stages: flags,
    });
    Ok(())
}

fn require_graphics_stages(stages: impl Iterator<Item = ShaderStage>) -> Result<()> {
    let (mut vertex, mut fragment) = (false, false);
    for stage in stages {
        vertex |= stage == ShaderStage::Vertex;
        fragment |= stage == ShaderStage::Fragment;
    }
    match (vertex, fragment) {
        (true, true) => Ok(()),
        (false, _) => Err(VulkanError::ProgramLinkError("program has no vertex shader".to_string())),
        (_, false) => Err(VulkanError::ProgramLinkError("program has no fragment shader".to_string())),
    }
}

struct LinkedProgram {
    layout: LinkedLayout,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

/// A named group of at most one vertex, fragment and geometry shader.
pub struct Program {
    name: String,
    shaders: Mutex<Vec<Arc<Shader>>>,
    linked: OnceLock<LinkedProgram>,
    backend: Arc<dyn ShaderBackend>,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program").field("name", &self.name).field("linked", &self.is_linked()).finish()
    }
}

impl Program {
    pub fn new(name: &str, backend: Arc<dyn ShaderBackend>) -> Self {
        Self { name: name.to_string(), shaders: Mutex::new(Vec::new()), linked: OnceLock::new(), backend }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_shaders(&self) -> Result<std::sync::MutexGuard<'_, Vec<Arc<Shader>>>> {
        self.shaders
            .lock()
            .map_err(|_| VulkanError::ProgramLinkError(format!("program '{}' lock poisoned", self.name)))
    }

    pub fn attach_shader(&self, shader: Arc<Shader>) -> Result<()> {
        let mut shaders = self.lock_shaders()?;
        if self.is_linked() {
            return Err(VulkanError::ProgramLinkError(format!(
                "cannot attach '{}': program '{}' is already linked",
                shader.path(),
                self.name
            )));
        }
        if !shader.is_compiled() {
            return Err(VulkanError::ProgramLinkError(format!(
                "cannot attach '{}' to '{}': shader is not compiled",
                shader.path(),
                self.name
            )));
        }
        if shader.stage() == ShaderStage::Compute {
            return Err(VulkanError::ProgramLinkError(format!(
                "compute shader '{}' cannot join graphics program '{}'",
                shader.path(),
                self.name
            )));
        }
        if let Some(existing) = shaders.iter().find(|s| s.stage() == shader.stage()) {
            return Err(VulkanError::ProgramLinkError(format!(
                "program '{}' already has a {:?} shader ('{}')",
                self.name,
                shader.stage(),
                existing.path()
            )));
        }
        shaders.push(shader);
        Ok(())
    }

    /// Links using reflection data. Fails if any attached shader has none.
    pub fn link(&self) -> Result<()> {
        self.link_inner(None)
    }

    /// Links using reflection data when every shader has it, otherwise with
    /// the supplied layout.
    pub fn link_with_fallback(&self, fallback: &LinkedLayout) -> Result<()> {
        self.link_inner(Some(fallback))
    }

    fn link_inner(&self, fallback: Option<&LinkedLayout>) -> Result<()> {
        let shaders = self.lock_shaders()?;
        if self.is_linked() {
            warn!("Program '{}' is already linked; ignoring relink.", self.name);
            return Ok(());
        }

        let reflections: Option<Vec<(ShaderStage, &ShaderReflection)>> =
            shaders.iter().map(|s| s.reflection().map(|r| (s.stage(), r))).collect();
        let layout = match (reflections, fallback) {
            (Some(reflections), _) => merge_reflections(&reflections)?,
            (None, Some(fallback)) => {
                require_graphics_stages(shaders.iter().map(|s| s.stage()))?;
                debug!("Program '{}' links with a supplied layout.", self.name);
                fallback.clone()
            }
            (None, None) => {
                return Err(VulkanError::ProgramLinkError(format!(
                    "program '{}' has shaders without reflection data",
                    self.name
                )))
            }
        };

        let set_layout = self.backend.create_descriptor_set_layout(&layout.set_layout_bindings())?;
        let pipeline_layout = match self.backend.create_pipeline_layout(&[set_layout], &layout.push_constant_ranges()) {
            Ok(pipeline_layout) => pipeline_layout,
            Err(e) => {
                self.backend.destroy_descriptor_set_layout(set_layout);
                return Err(e);
            }
        };
        info!(
            "Program '{}' linked: {} bindings, {} push-constant ranges.",
            self.name,
            layout.bindings.len(),
            layout.push_constants.len()
        );
        // The shader lock serializes linkers, so the cell is still empty here.
        let _ = self.linked.set(LinkedProgram { layout, set_layout, pipeline_layout });
        Ok(())
    }

    pub fn is_linked(&self) -> bool {
        self.linked.get().is_some()
    }

    pub fn layout(&self) -> Option<&LinkedLayout> {
        self.linked.get().map(|l| &l.layout)
    }

    pub fn descriptor_set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.linked.get().map(|l| l.set_layout)
    }

    pub fn pipeline_layout(&self) -> Option<vk::PipelineLayout> {
        self.linked.get().map(|l| l.pipeline_layout)
    }

    /// Stage and module of every attached shader.
    pub fn stage_modules(&self) -> Result<Vec<(ShaderStage, vk::ShaderModule)>> {
        let shaders = self.lock_shaders()?;
        Ok(shaders.iter().filter_map(|s| s.module().map(|m| (s.stage(), m))).collect())
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Some(linked) = self.linked.take() {
            self.backend.destroy_pipeline_layout(linked.pipeline_layout);
            self.backend.destroy_descriptor_set_layout(linked.set_layout);
        }
    }
}

/// Loads shaders and programs on first use and hands out shared references.
pub struct ProgramManager {
    backend: Arc<dyn ShaderBackend>,
    files: Arc<dyn FileSource>,
    compiler: Arc<dyn ShaderCompiler>,
    shaders: Mutex<HashMap<String, Arc<Shader>>>,
    programs: Mutex<HashMap<String, Arc<Program>>>,
}

impl ProgramManager {
    pub fn new(backend: Arc<dyn ShaderBackend>, files: Arc<dyn FileSource>, compiler: Arc<dyn ShaderCompiler>) -> Self {
        Self {
            backend,
            files,
            compiler,
            shaders: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
        }
    }

    /// Reads program descriptors and shaders from `config.shader_root`,
    /// compiling GLSL with naga.
    pub fn from_config(config: &RendererConfig, backend: Arc<dyn ShaderBackend>) -> Self {
        debug!("Shader root: {}", config.shader_root.display());
        Self::new(backend, Arc::new(DirectorySource::new(&config.shader_root)), Arc::new(NagaGlslCompiler))
    }

    pub fn register_shader(&self, path: &str) -> Result<Arc<Shader>> {
        let mut shaders = self
            .shaders
            .lock()
            .map_err(|_| VulkanError::ShaderLoadingError("shader cache lock poisoned".to_string()))?;
        if let Some(shader) = shaders.get(path) {
            return Ok(shader.clone());
        }

        let (stage, precompiled) = ShaderStage::from_path(path)?;
        let bytes = self.files.read(path)?;
        let shader = if precompiled {
            Shader::from_spirv_bytes(path, stage, &bytes, self.backend.clone())?
        } else {
            let source = String::from_utf8(bytes)
                .map_err(|e| VulkanError::ShaderLoadingError(format!("'{path}' is not UTF-8: {e}")))?;
            Shader::from_source(path, stage, &source, self.compiler.as_ref(), self.backend.clone())?
        };
        let shader = Arc::new(shader);
        shaders.insert(path.to_string(), shader.clone());
        Ok(shader)
    }

    /// Loads a program descriptor and attaches its shaders. Linking is left to
    /// the caller so it can supply a fallback layout.
    pub fn register_program(&self, path: &str) -> Result<Arc<Program>> {
        let mut programs = self
            .programs
            .lock()
            .map_err(|_| VulkanError::ProgramLinkError("program cache lock poisoned".to_string()))?;
        if let Some(program) = programs.get(path) {
            return Ok(program.clone());
        }

        let bytes = self.files.read(path)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| VulkanError::ShaderLoadingError(format!("'{path}' is not UTF-8: {e}")))?;
        let program = Program::new(path, self.backend.clone());
        for shader_path in parse_program_descriptor(&text) {
            let shader = self.register_shader(&shader_path)?;
            program.attach_shader(shader)?;
        }
        let program = Arc::new(program);
        programs.insert(path.to_string(), program.clone());
        debug!("Program '{}' registered.", path);
        Ok(program)
    }

    pub fn backend(&self) -> &Arc<dyn ShaderBackend> {
        &self.backend
    }
}
