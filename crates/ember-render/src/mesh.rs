//! Mesh: the unit of draw submission.

use std::sync::Arc;

use ash::vk;

use ember_rhi::buffer::Buffer;

use crate::material::Material;

/// Vertex and index buffers plus the material they are drawn with.
///
/// Meshes are asset-lifetime: built once through the render core's buffer
/// factories and submitted any number of times with a world transform.
pub struct Mesh {
    vertex_buffer: Arc<Buffer>,
    index_buffer: Arc<Buffer>,
    index_count: u32,
    material: Arc<Material>,
}

impl Mesh {
    /// Assembles a mesh from already-created buffers.
    pub fn new(
        vertex_buffer: Arc<Buffer>,
        index_buffer: Arc<Buffer>,
        index_count: u32,
        material: Arc<Material>,
    ) -> Self {
        Self {
            vertex_buffer,
            index_buffer,
            index_count,
            material,
        }
    }

    /// The vertex buffer.
    #[inline]
    pub fn vertex_buffer(&self) -> &Arc<Buffer> {
        &self.vertex_buffer
    }

    /// The index buffer (32-bit indices).
    #[inline]
    pub fn index_buffer(&self) -> &Arc<Buffer> {
        &self.index_buffer
    }

    /// Number of indices to draw.
    #[inline]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// The index type stored in the index buffer.
    #[inline]
    pub fn index_type(&self) -> vk::IndexType {
        vk::IndexType::UINT32
    }

    /// The material the mesh is drawn with.
    #[inline]
    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }
}
