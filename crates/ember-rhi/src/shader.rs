//! Shader modules and resource layouts.
//!
//! Shader compilation and reflection happen offline; this core consumes the
//! compiled SPIR-V bytes together with the extracted [`ResourceLayout`]:
//! the vertex inputs (location, byte offset, byte width) and the per-set
//! uniform-buffer bindings. Merging the vertex and fragment layouts yields
//! the [`CombinedResourceLayout`], the immutable contract descriptor and
//! pipeline construction build from.

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Shader stage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader stage
    Vertex,
    /// Fragment shader stage
    Fragment,
}

impl ShaderStage {
    /// Converts to Vulkan shader stage flags.
    pub fn to_vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }

    /// Returns a human-readable name for the stage.
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One vertex input as extracted by the offline compiler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexInput {
    /// Shader input location.
    pub location: u32,
    /// Byte offset within the tightly packed vertex.
    pub offset: u32,
    /// Byte width of the input (4, 8, 12 or 16).
    pub width: u32,
    /// Source-level name, for diagnostics.
    pub name: String,
}

/// One uniform-buffer binding within a descriptor set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformBufferBinding {
    /// Binding index within the set.
    pub binding: u32,
    /// Source-level block name, for diagnostics.
    pub name: String,
    /// Shader stages that read the buffer.
    pub stages: vk::ShaderStageFlags,
}

/// The uniform-buffer bindings declared for one descriptor set index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetLayout {
    /// Bindings in declaration order; dynamic offsets are accumulated in
    /// this order at draw time.
    pub uniform_buffers: Vec<UniformBufferBinding>,
}

/// Per-stage resource layout emitted by the offline compiler step.
#[derive(Clone, Debug, Default)]
pub struct ResourceLayout {
    /// Vertex inputs (meaningful for the vertex stage).
    pub inputs: Vec<VertexInput>,
    /// Uniform-buffer bindings grouped by descriptor set index.
    pub sets: BTreeMap<u32, SetLayout>,
}

/// The merged vertex + fragment binding contract for one material.
#[derive(Clone, Debug, Default)]
pub struct CombinedResourceLayout {
    /// Vertex inputs, taken from the vertex stage.
    pub inputs: Vec<VertexInput>,
    /// Union of both stages' sets, keyed by set index.
    pub sets: BTreeMap<u32, SetLayout>,
}

impl CombinedResourceLayout {
    /// Merges the two stage layouts by set index.
    ///
    /// A binding declared by both stages is kept once with the union of the
    /// stage flags; vertex inputs always come from the vertex stage.
    pub fn merge(vertex: &ResourceLayout, fragment: &ResourceLayout) -> Self {
        let mut sets: BTreeMap<u32, SetLayout> = BTreeMap::new();

        for (source, stage) in [
            (vertex, vk::ShaderStageFlags::VERTEX),
            (fragment, vk::ShaderStageFlags::FRAGMENT),
        ] {
            for (&set_index, layout) in &source.sets {
                let merged = sets.entry(set_index).or_default();
                for binding in &layout.uniform_buffers {
                    match merged
                        .uniform_buffers
                        .iter_mut()
                        .find(|existing| existing.binding == binding.binding)
                    {
                        Some(existing) => existing.stages |= stage,
                        None => merged.uniform_buffers.push(UniformBufferBinding {
                            binding: binding.binding,
                            name: binding.name.clone(),
                            stages: stage,
                        }),
                    }
                }
            }
        }

        Self {
            inputs: vertex.inputs.clone(),
            sets,
        }
    }
}

/// Entry point every offline-compiled shader in this engine exports.
const ENTRY_POINT: &CStr = c"main";

/// Vulkan shader module carrying its extracted resource layout.
pub struct Shader {
    device: Arc<Device>,
    module: vk::ShaderModule,
    stage: ShaderStage,
    layout: ResourceLayout,
}

impl Shader {
    /// Creates a shader module from a SPIR-V file plus its layout.
    pub fn from_spirv_file(
        device: Arc<Device>,
        path: &Path,
        stage: ShaderStage,
        layout: ResourceLayout,
    ) -> RhiResult<Self> {
        debug!("Loading {} shader from {:?}", stage, path);
        let bytes = std::fs::read(path).map_err(|e| {
            RhiError::Shader(format!("failed to read shader file {:?}: {}", path, e))
        })?;
        Self::from_spirv_bytes(device, &bytes, stage, layout)
    }

    /// Creates a shader module from SPIR-V bytes plus its layout.
    ///
    /// # Errors
    ///
    /// Fails when the byte length is not 4-byte aligned (SPIR-V words) or
    /// module creation fails.
    pub fn from_spirv_bytes(
        device: Arc<Device>,
        bytes: &[u8],
        stage: ShaderStage,
        layout: ResourceLayout,
    ) -> RhiResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(RhiError::Shader(format!(
                "SPIR-V code must be 4-byte aligned, got {} bytes",
                bytes.len()
            )));
        }

        let code: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.handle().create_shader_module(&create_info, None)? };

        info!(
            "Created {} shader module ({} inputs, {} set(s))",
            stage,
            layout.inputs.len(),
            layout.sets.len()
        );

        Ok(Self {
            device,
            module,
            stage,
            layout,
        })
    }

    /// Returns the Vulkan shader module handle.
    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Returns the shader stage.
    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Returns the extracted resource layout.
    #[inline]
    pub fn layout(&self) -> &ResourceLayout {
        &self.layout
    }

    /// Stage-create descriptor for pipeline construction; borrows the
    /// module, so it must not outlive the shader.
    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.to_vk_stage())
            .module(self.module)
            .name(ENTRY_POINT)
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_shader_module(self.module, None);
        }
        debug!("Destroyed {} shader module", self.stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_with(set: u32, bindings: &[u32]) -> ResourceLayout {
        let mut sets = BTreeMap::new();
        sets.insert(
            set,
            SetLayout {
                uniform_buffers: bindings
                    .iter()
                    .map(|&binding| UniformBufferBinding {
                        binding,
                        name: format!("ubo{}", binding),
                        stages: vk::ShaderStageFlags::empty(),
                    })
                    .collect(),
            },
        );
        ResourceLayout {
            inputs: Vec::new(),
            sets,
        }
    }

    #[test]
    fn shader_stage_to_vk() {
        assert_eq!(
            ShaderStage::Vertex.to_vk_stage(),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            ShaderStage::Fragment.to_vk_stage(),
            vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn merge_takes_inputs_from_vertex_stage() {
        let mut vertex = layout_with(0, &[0]);
        vertex.inputs.push(VertexInput {
            location: 0,
            offset: 0,
            width: 12,
            name: "position".to_string(),
        });
        let fragment = ResourceLayout::default();

        let combined = CombinedResourceLayout::merge(&vertex, &fragment);
        assert_eq!(combined.inputs.len(), 1);
        assert_eq!(combined.inputs[0].name, "position");
    }

    #[test]
    fn merge_unions_disjoint_sets() {
        let vertex = layout_with(0, &[0]);
        let fragment = layout_with(1, &[0]);

        let combined = CombinedResourceLayout::merge(&vertex, &fragment);
        assert_eq!(combined.sets.len(), 2);
        assert!(combined.sets.contains_key(&0));
        assert!(combined.sets.contains_key(&1));
    }

    #[test]
    fn merge_unions_stage_flags_for_shared_binding() {
        let vertex = layout_with(0, &[0]);
        let fragment = layout_with(0, &[0]);

        let combined = CombinedResourceLayout::merge(&vertex, &fragment);
        let set = &combined.sets[&0];
        assert_eq!(set.uniform_buffers.len(), 1);
        assert!(set.uniform_buffers[0]
            .stages
            .contains(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn merge_keeps_declaration_order() {
        let vertex = layout_with(0, &[2, 0, 1]);
        let fragment = ResourceLayout::default();

        let combined = CombinedResourceLayout::merge(&vertex, &fragment);
        let bindings: Vec<u32> = combined.sets[&0]
            .uniform_buffers
            .iter()
            .map(|b| b.binding)
            .collect();
        assert_eq!(bindings, vec![2, 0, 1]);
    }

    #[test]
    fn misaligned_spirv_is_rejected_by_length_check() {
        let misaligned = vec![0u8; 5];
        assert!(misaligned.len() % 4 != 0);
    }
}
