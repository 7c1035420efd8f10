//! Descriptor bindings of the water program for each quality tier.
//!
//! The schema is the single table both the descriptor-set layout and the
//! per-frame descriptor writes are derived from. Higher tiers append the
//! mirror (reflection) inputs.

use crate::config::WaveQuality;
use crate::program::{LinkedBinding, LinkedLayout, LinkedPushConstant};
use crate::shader::ResourceKind;
use crate::water::uniforms::{WaterPushConstants, WaterUniforms};
use ash::vk;

/// Resource bound by the water program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaterResource {
    Uniforms,
    LinearSampler,
    ColorMap,
    WaveMap,
    ScreenColor,
    ScreenDepth,
    MirrorColor,
    MirrorDepth,
}

/// Whether a binding is written once per slot or every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingUpdate {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaBinding {
    pub resource: WaterResource,
    /// Variable name in the shaders.
    pub name: &'static str,
    pub binding: u32,
    pub kind: ResourceKind,
    pub update: BindingUpdate,
    pub stages: vk::ShaderStageFlags,
}

const VERTEX_FRAGMENT: vk::ShaderStageFlags =
    vk::ShaderStageFlags::from_raw(vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw());

const BASE_BINDINGS: [SchemaBinding; 6] = [
    SchemaBinding {
        resource: WaterResource::Uniforms,
        name: "ubo",
        binding: 0,
        kind: ResourceKind::UniformBuffer,
        update: BindingUpdate::Static,
        stages: VERTEX_FRAGMENT,
    },
    SchemaBinding {
        resource: WaterResource::LinearSampler,
        name: "linear_sampler",
        binding: 1,
        kind: ResourceKind::Sampler,
        update: BindingUpdate::Static,
        stages: VERTEX_FRAGMENT,
    },
    SchemaBinding {
        resource: WaterResource::ColorMap,
        name: "color_map",
        binding: 2,
        kind: ResourceKind::SampledImage,
        update: BindingUpdate::Static,
        stages: vk::ShaderStageFlags::FRAGMENT,
    },
    SchemaBinding {
        resource: WaterResource::WaveMap,
        name: "wave_map",
        binding: 3,
        kind: ResourceKind::SampledImage,
        update: BindingUpdate::Static,
        stages: VERTEX_FRAGMENT,
    },
    SchemaBinding {
        resource: WaterResource::ScreenColor,
        name: "screen_color",
        binding: 4,
        kind: ResourceKind::SampledImage,
        update: BindingUpdate::Dynamic,
        stages: vk::ShaderStageFlags::FRAGMENT,
    },
    SchemaBinding {
        resource: WaterResource::ScreenDepth,
        name: "screen_depth",
        binding: 5,
        kind: ResourceKind::SampledImage,
        update: BindingUpdate::Dynamic,
        stages: vk::ShaderStageFlags::FRAGMENT,
    },
];

const MIRROR_BINDINGS: [SchemaBinding; 2] = [
    SchemaBinding {
        resource: WaterResource::MirrorColor,
        name: "mirror_color",
        binding: 6,
        kind: ResourceKind::SampledImage,
        update: BindingUpdate::Dynamic,
        stages: vk::ShaderStageFlags::FRAGMENT,
    },
    SchemaBinding {
        resource: WaterResource::MirrorDepth,
        name: "mirror_depth",
        binding: 7,
        kind: ResourceKind::SampledImage,
        update: BindingUpdate::Dynamic,
        stages: vk::ShaderStageFlags::FRAGMENT,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSchema {
    quality: WaveQuality,
    bindings: Vec<SchemaBinding>,
}

impl BindingSchema {
    pub fn for_quality(quality: WaveQuality) -> Self {
        let mut bindings = BASE_BINDINGS.to_vec();
        if quality == WaveQuality::Reflective {
            bindings.extend_from_slice(&MIRROR_BINDINGS);
        }
        Self { quality, bindings }
    }

    pub fn quality(&self) -> WaveQuality {
        self.quality
    }

    pub fn program_path(&self) -> &'static str {
        match self.quality {
            WaveQuality::Single => "water1.program",
            WaveQuality::Layered => "water2.program",
            WaveQuality::Reflective => "water3.program",
        }
    }

    /// View the wave map is sampled through: a plain 2D view for the single
    /// tank, an array with one layer per tank otherwise.
    pub fn wave_map_view_type(&self) -> vk::ImageViewType {
        if self.quality.uses_wave_array() {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        }
    }

    pub fn bindings(&self) -> &[SchemaBinding] {
        &self.bindings
    }

    pub fn binding(&self, resource: WaterResource) -> Option<&SchemaBinding> {
        self.bindings.iter().find(|b| b.resource == resource)
    }

    pub fn dynamic_bindings(&self) -> impl Iterator<Item = &SchemaBinding> {
        self.bindings.iter().filter(|b| b.update == BindingUpdate::Dynamic)
    }

    pub fn static_bindings(&self) -> impl Iterator<Item = &SchemaBinding> {
        self.bindings.iter().filter(|b| b.update == BindingUpdate::Static)
    }

    /// Layout used when shader reflection is unavailable.
    pub fn linked_layout(&self) -> LinkedLayout {
        LinkedLayout {
            bindings: self
                .bindings
                .iter()
                .map(|b| LinkedBinding {
                    name: b.name.to_string(),
                    binding: b.binding,
                    kind: b.kind,
                    size: if b.kind == ResourceKind::UniformBuffer { WaterUniforms::SIZE } else { 0 },
                    stages: b.stages,
                })
                .collect(),
            push_constants: vec![LinkedPushConstant {
                offset: 0,
                size: WaterPushConstants::SIZE,
                stages: VERTEX_FRAGMENT,
            }],
        }
    }

    /// Checks that a linked layout has every schema binding at the same slot
    /// and of the same kind. Returns the first mismatch.
    pub fn check_layout(&self, layout: &LinkedLayout) -> Result<(), String> {
        for expected in &self.bindings {
            match layout.binding(expected.name) {
                Some(found) if found.binding == expected.binding && found.kind == expected.kind => {}
                Some(found) => {
                    return Err(format!(
                        "'{}' is {:?}@{} in the shaders but {:?}@{} in the schema",
                        expected.name, found.kind, found.binding, expected.kind, expected.binding
                    ))
                }
                None => return Err(format!("'{}' is not declared by the shaders", expected.name)),
            }
        }
        Ok(())
    }
}
