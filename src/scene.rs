// The scene: a single hard-coded triangle
//
// Host-side data lives here as plain constants. MeshBuffers carries the
// device-local copies that feed the BLAS build.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::sync::Arc;

use crate::backend::{buffer, Buffer, CommandPool, VulkanDevice};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
}

impl Vertex {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: Vec3::new(x, y, z),
        }
    }
}

pub const TRIANGLE_VERTICES: [Vertex; 3] = [
    Vertex::new(1.0, 1.0, 0.0),
    Vertex::new(-1.0, 1.0, 0.0),
    Vertex::new(0.0, -1.0, 0.0),
];

pub const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

/// Vulkan wants the top three rows of a row-major 4x4
pub fn transform_matrix(transform: &Mat4) -> vk::TransformMatrixKHR {
    let t = transform;
    vk::TransformMatrixKHR {
        matrix: [
            t.x_axis.x, t.y_axis.x, t.z_axis.x, t.w_axis.x, // row 1
            t.x_axis.y, t.y_axis.y, t.z_axis.y, t.w_axis.y, // row 2
            t.x_axis.z, t.y_axis.z, t.z_axis.z, t.w_axis.z, // row 3
        ],
    }
}

/// Device copies of the triangle plus the BLAS transform
pub struct MeshBuffers {
    pub vertices: Buffer,
    pub indices: Buffer,
    pub transform: Buffer,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl MeshBuffers {
    /// Upload the triangle through staging buffers. With `verify` the
    /// device-local copies are read back and compared byte for byte.
    pub fn upload(device: Arc<VulkanDevice>, pool: &CommandPool, verify: bool) -> Result<Self> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE_VERTICES);
        let index_bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE_INDICES);

        let vertices = Buffer::device_local_with_data(
            device.clone(),
            pool,
            "vertex positions",
            buffer::GEOMETRY_USAGE,
            vertex_bytes,
        )?;
        let indices = Buffer::device_local_with_data(
            device.clone(),
            pool,
            "indices",
            buffer::GEOMETRY_USAGE,
            index_bytes,
        )?;

        let identity = transform_matrix(&Mat4::IDENTITY);
        let transform = Buffer::with_data(
            device,
            "blas transform",
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            bytemuck::cast_slice(&identity.matrix),
        )?;

        if verify {
            vertices
                .verify(pool, "vertex positions", vertex_bytes)
                .context("Vertex upload verification failed")?;
            indices
                .verify(pool, "indices", index_bytes)
                .context("Index upload verification failed")?;
            log::info!("Mesh upload verified");
        }

        log::info!(
            "Uploaded mesh: {} vertices, {} indices",
            TRIANGLE_VERTICES.len(),
            TRIANGLE_INDICES.len()
        );

        Ok(Self {
            vertices,
            indices,
            transform,
            vertex_count: TRIANGLE_VERTICES.len() as u32,
            index_count: TRIANGLE_INDICES.len() as u32,
        })
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 12);
        let bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE_VERTICES);
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn indices_reference_every_vertex_once() {
        let mut seen = TRIANGLE_INDICES.to_vec();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(TRIANGLE_INDICES
            .iter()
            .all(|&i| (i as usize) < TRIANGLE_VERTICES.len()));
        assert_eq!(std::mem::size_of_val(&TRIANGLE_INDICES), 12);
    }

    #[test]
    fn identity_transform_rows() {
        let m = transform_matrix(&Mat4::IDENTITY).matrix;
        assert_eq!(
            m,
            [
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
            ]
        );
    }

    #[test]
    fn translation_lands_in_last_column() {
        let m = transform_matrix(&Mat4::from_translation(Vec3::new(2.0, 3.0, 4.0))).matrix;
        assert_eq!([m[3], m[7], m[11]], [2.0, 3.0, 4.0]);
        assert_eq!([m[0], m[5], m[10]], [1.0, 1.0, 1.0]);
    }

    #[test]
    fn triangle_is_not_degenerate() {
        let [a, b, c] = TRIANGLE_VERTICES.map(|v| v.position);
        assert!((b - a).cross(c - a).length() > 0.0);
    }
}
