//! Uniform buffer block definitions.
//!
//! These structures must match the shader uniform block layouts exactly;
//! `#[repr(C)]` plus `Pod`/`Zeroable` make them safe to copy into mapped
//! pool memory byte-for-byte.
//!
//! Convention used by the default draw path: descriptor set
//! [`FRAME_DATA_SET`] carries the camera block at [`CAMERA_BINDING`] and
//! the per-draw object block at [`OBJECT_BINDING`].

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Descriptor set index for the engine-provided uniform blocks.
pub const FRAME_DATA_SET: u32 = 0;
/// Binding of the camera block within [`FRAME_DATA_SET`].
pub const CAMERA_BINDING: u32 = 0;
/// Binding of the per-draw object block within [`FRAME_DATA_SET`].
pub const OBJECT_BINDING: u32 = 1;

/// Camera uniform block: view and projection matrices.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct CameraUbo {
    /// World to view space.
    pub view: Mat4,
    /// View to clip space.
    pub projection: Mat4,
}

impl CameraUbo {
    /// Size of the block in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Creates a camera block from the two matrices.
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        Self { view, projection }
    }
}

/// Per-draw object uniform block: the world transform.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ObjectUbo {
    /// Object to world space.
    pub model: Mat4,
}

impl ObjectUbo {
    /// Size of the block in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Creates an object block from a world transform.
    pub fn new(model: Mat4) -> Self {
        Self { model }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_ubo_layout() {
        // Two column-major Mat4s, nothing else.
        assert_eq!(CameraUbo::SIZE, 128);
        assert_eq!(std::mem::align_of::<CameraUbo>(), 16);
    }

    #[test]
    fn object_ubo_layout() {
        assert_eq!(ObjectUbo::SIZE, 64);
        assert_eq!(std::mem::align_of::<ObjectUbo>(), 16);
    }

    #[test]
    fn ubo_bytes_round_trip() {
        let camera = CameraUbo::new(Mat4::IDENTITY, Mat4::IDENTITY);
        let bytes: &[u8] = bytemuck::bytes_of(&camera);
        assert_eq!(bytes.len(), CameraUbo::SIZE);

        let object = ObjectUbo::new(Mat4::IDENTITY);
        assert_eq!(bytemuck::bytes_of(&object).len(), ObjectUbo::SIZE);
    }
}
