//! Flat grid mesh covering the water surface in normalized coordinates.

use crate::pipeline::VertexInput;
use ash::vk;
use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct WaterVertex {
    /// Position on the grid in `[0, 1]²`; the vertex shader scales it.
    pub uv: [f32; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaterMesh {
    pub vertices: Vec<WaterVertex>,
    pub indices: Vec<u32>,
    resolution: u32,
}

impl WaterMesh {
    /// `resolution` × `resolution` quads, two counter-clockwise triangles each.
    pub fn grid(resolution: u32) -> Self {
        let resolution = resolution.max(1);
        let row = resolution + 1;
        let step = 1.0 / resolution as f32;
        let vertices = (0..row)
            .flat_map(|y| (0..row).map(move |x| WaterVertex { uv: [x as f32 * step, y as f32 * step] }))
            .collect();
        let mut indices = Vec::with_capacity((resolution * resolution * 6) as usize);
        for y in 0..resolution {
            for x in 0..resolution {
                let i0 = y * row + x;
                let i1 = i0 + 1;
                let i2 = i0 + row;
                let i3 = i2 + 1;
                indices.extend_from_slice(&[i0, i1, i3, i0, i3, i2]);
            }
        }
        Self { vertices, indices, resolution }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn vertex_input() -> VertexInput {
        VertexInput {
            stride: std::mem::size_of::<WaterVertex>() as u32,
            attributes: vec![vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_counts_and_bounds() {
        let mesh = WaterMesh::grid(4);
        assert_eq!(mesh.vertices.len(), 25);
        assert_eq!(mesh.index_count(), 96);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
        assert_eq!(mesh.vertices[0].uv, [0.0, 0.0]);
        assert_eq!(mesh.vertices[24].uv, [1.0, 1.0]);
    }

    #[test]
    fn triangles_wind_counter_clockwise() {
        let mesh = WaterMesh::grid(3);
        for tri in mesh.indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| mesh.vertices[i as usize].uv);
            let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
            assert!(cross > 0.0);
        }
    }

    #[test]
    fn zero_resolution_still_builds_one_quad() {
        let mesh = WaterMesh::grid(0);
        assert_eq!(mesh.resolution(), 1);
        assert_eq!(mesh.index_count(), 6);
    }
}
