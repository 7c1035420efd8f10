//! Per-frame uniform block and push constants of the water program.
//!
//! Both structs are laid out to match the std140 / push-constant blocks in
//! `shaders/water.vert` and `shaders/water*.frag`.

use crate::config::FogConfig;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Camera description supplied by the scene each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneDefinition {
    pub view_origin: Vec3,
    /// Unit view direction.
    pub view_forward: Vec3,
    /// Unit up vector, orthogonal to `view_forward`.
    pub view_up: Vec3,
    /// Full horizontal field of view, radians.
    pub fov_x: f32,
    /// Full vertical field of view, radians.
    pub fov_y: f32,
    pub z_near: f32,
    pub z_far: f32,
    /// Seconds since the scene started; animates the wave map lookups.
    pub time: f32,
}

impl SceneDefinition {
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.view_origin, self.view_forward, self.view_up)
    }

    /// Vulkan-style projection (depth in `[0, 1]`) built from both FOV angles.
    pub fn projection_matrix(&self) -> Mat4 {
        let tan_x = (self.fov_x * 0.5).tan();
        let tan_y = (self.fov_y * 0.5).tan();
        Mat4::perspective_rh(self.fov_y, tan_x / tan_y, self.z_near, self.z_far)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct WaterUniforms {
    pub view_proj: [[f32; 4]; 4],
    /// xyz: camera position, w: time.
    pub view_origin_time: [f32; 4],
    /// rgb: fog color, a: unused.
    pub fog_color: [f32; 4],
    /// x: fog start, y: fog end, z: 1 / (end - start), w: unused.
    pub fog_params: [f32; 4],
    /// xy: grid size in world units, zw: 1 / viewport size in pixels.
    pub grid_viewport: [f32; 4],
}

impl WaterUniforms {
    pub const SIZE: u32 = std::mem::size_of::<WaterUniforms>() as u32;

    pub fn new(scene: &SceneDefinition, fog: &FogConfig, grid_size: (u32, u32), viewport: vk::Extent2D) -> Self {
        let view_proj = scene.projection_matrix() * scene.view_matrix();
        let fog_range = (fog.end - fog.start).max(f32::EPSILON);
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            view_origin_time: scene.view_origin.extend(scene.time).to_array(),
            fog_color: [fog.color[0], fog.color[1], fog.color[2], 1.0],
            fog_params: [fog.start, fog.end, 1.0 / fog_range, 0.0],
            grid_viewport: [
                grid_size.0 as f32,
                grid_size.1 as f32,
                1.0 / viewport.width.max(1) as f32,
                1.0 / viewport.height.max(1) as f32,
            ],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct WaterPushConstants {
    /// Water plane `(n, d)` with `dot(n, p) + d = 0`.
    pub plane: [f32; 4],
    /// `tan(fov_x / 2)`, `tan(fov_y / 2)`.
    pub fov_tan: [f32; 2],
    pub displacement_scale: f32,
    /// Number of wave map layers in use.
    pub wave_layers: f32,
}

impl WaterPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<WaterPushConstants>() as u32;

    /// The water plane is horizontal (`+z` up) at `water_level`.
    pub fn new(scene: &SceneDefinition, water_level: f32, displacement_scale: f32, wave_layers: u32) -> Self {
        Self {
            plane: [0.0, 0.0, 1.0, -water_level],
            fov_tan: [(scene.fov_x * 0.5).tan(), (scene.fov_y * 0.5).tan()],
            displacement_scale,
            wave_layers: wave_layers as f32,
        }
    }
}
