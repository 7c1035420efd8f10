//! The shipped water shaders must agree with the binding schema, or the
//! renderer falls back to the schema layout on every start.

use novade_ocean_renderer::config::WaveQuality;
use novade_ocean_renderer::program::{merge_reflections, parse_program_descriptor};
use novade_ocean_renderer::shader::{reflect_module, DirectorySource, FileSource, NagaGlslCompiler, ShaderStage};
use novade_ocean_renderer::water::binding_schema::BindingSchema;
use novade_ocean_renderer::water::uniforms::{WaterPushConstants, WaterUniforms};
use novade_ocean_renderer::wave::rasterize_height_field;
use std::f32::consts::TAU;

fn shader_root() -> DirectorySource {
    DirectorySource::new(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders"))
}

#[test]
fn water_programs_match_their_schema() {
    let files = shader_root();
    for quality in [WaveQuality::Single, WaveQuality::Layered, WaveQuality::Reflective] {
        let schema = BindingSchema::for_quality(quality);
        let descriptor = String::from_utf8(files.read(schema.program_path()).unwrap()).unwrap();
        let paths = parse_program_descriptor(&descriptor);
        assert_eq!(paths.len(), 2, "{}", schema.program_path());

        let mut reflections = Vec::new();
        for path in &paths {
            let (stage, _) = ShaderStage::from_path(path).unwrap();
            let source = String::from_utf8(files.read(path).unwrap()).unwrap();
            let module = NagaGlslCompiler.parse(stage, &source, path).unwrap();
            assert_eq!(
                wave_map_is_arrayed(&module),
                Some(quality.uses_wave_array()),
                "{path} declares the wave map with the wrong dimension"
            );
            reflections.push((stage, reflect_module(&module)));
        }
        let stages: Vec<_> = reflections.iter().map(|(stage, r)| (*stage, r)).collect();
        let layout = merge_reflections(&stages).unwrap();

        assert_eq!(schema.check_layout(&layout), Ok(()), "{}", schema.program_path());
        assert_eq!(layout.bindings.len(), schema.bindings().len());
        assert_eq!(layout.binding("ubo").map(|b| b.size), Some(WaterUniforms::SIZE));
        assert_eq!(layout.push_constants.len(), 1);
        assert_eq!(layout.push_constants[0].size, WaterPushConstants::SIZE);
    }
}

fn wave_map_is_arrayed(module: &naga::Module) -> Option<bool> {
    module.global_variables.iter().find_map(|(_, var)| {
        if var.name.as_deref() != Some("wave_map") {
            return None;
        }
        match module.types[var.ty].inner {
            naga::TypeInner::Image { dim: naga::ImageDimension::D2, arrayed, .. } => Some(arrayed),
            _ => None,
        }
    })
}

fn decode(byte: u8) -> f32 {
    byte as f32 / 255.0 * 2.0 - 1.0
}

#[test]
fn wave_texels_carry_normal_in_rgb_and_height_in_alpha() {
    // Varies only along y, so the x-slope stays zero.
    let size = 16;
    let heights: Vec<f32> =
        (0..size * size).map(|i| 0.5 * (TAU * (i / size) as f32 / size as f32).sin()).collect();
    let mut bitmap = vec![0u32; size * size];
    rasterize_height_field(&heights, size, &mut bitmap);

    for (texel, height) in bitmap.iter().zip(&heights) {
        let [r, g, b, a] = texel.to_le_bytes();
        assert!((decode(a) - height).abs() <= 1.01 / 255.0, "alpha {a} does not hold height {height}");
        assert_eq!(r, 128);
        let normal = [decode(r), decode(g), decode(b)];
        let length = normal.iter().map(|c| c * c).sum::<f32>().sqrt();
        assert!((length - 1.0).abs() < 0.02, "rgb does not decode to a unit normal: {normal:?}");
    }
    let distinct_alpha: std::collections::BTreeSet<u8> = bitmap.iter().map(|t| t.to_le_bytes()[3]).collect();
    assert!(distinct_alpha.len() > 2);
}

#[test]
fn shaders_decode_wave_texels_the_same_way() {
    let root = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders");
    let files = shader_root();
    for name in ["water.vert", "water1.vert", "water1.frag", "water2.frag", "water3.frag"] {
        let source = String::from_utf8(files.read(name).unwrap()).unwrap();
        let decodes_height = source.contains("texel.a * 2.0 - 1.0");
        let decodes_normal = source.contains("texel.rgb * 2.0 - 1.0");
        assert!(decodes_height || decodes_normal, "{root}/{name} samples the wave map without decoding it");
        if name.ends_with(".vert") {
            assert!(decodes_height, "{name} must displace by the alpha channel");
        } else {
            assert!(decodes_normal, "{name} must shade with the packed normal");
        }
    }
}
