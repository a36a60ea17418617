//! Materials and the material registry.
//!
//! A [`Material`] pairs a vertex and fragment shader with the pipeline
//! layout derived from their merged resource layouts. It is asset-lifetime:
//! created once, shared across frames and draws, and identified by a
//! process-unique id that pipeline cache keys embed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use ember_rhi::device::Device;
use ember_rhi::pipeline::PipelineLayout;
use ember_rhi::shader::{CombinedResourceLayout, Shader, ShaderStage, VertexInput};
use ember_rhi::{RhiError, RhiResult};

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

/// Vulkan format for a vertex input of the given byte width, assuming
/// 32-bit float components.
pub fn format_for_width(width: u32) -> Option<vk::Format> {
    match width {
        4 => Some(vk::Format::R32_SFLOAT),
        8 => Some(vk::Format::R32G32_SFLOAT),
        12 => Some(vk::Format::R32G32B32_SFLOAT),
        16 => Some(vk::Format::R32G32B32A32_SFLOAT),
        _ => None,
    }
}

/// Derives the single-binding vertex input state from the extracted
/// inputs: attribute offsets come straight from the layout (attributes are
/// tightly packed) and the stride is the end of the furthest input.
pub fn derive_vertex_input(
    inputs: &[VertexInput],
) -> RhiResult<(
    vk::VertexInputBindingDescription,
    Vec<vk::VertexInputAttributeDescription>,
)> {
    let mut attributes = Vec::with_capacity(inputs.len());
    let mut stride = 0u32;

    for input in inputs {
        let format = format_for_width(input.width).ok_or_else(|| {
            RhiError::InvalidUsage(format!(
                "vertex input '{}' has unsupported width {}",
                input.name, input.width
            ))
        })?;
        attributes.push(vk::VertexInputAttributeDescription {
            binding: 0,
            location: input.location,
            format,
            offset: input.offset,
        });
        stride = stride.max(input.offset + input.width);
    }

    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride,
        input_rate: vk::VertexInputRate::VERTEX,
    };

    Ok((binding, attributes))
}

/// A vertex/fragment shader pair with their shared pipeline layout.
pub struct Material {
    id: u64,
    vertex: Shader,
    fragment: Shader,
    layout: CombinedResourceLayout,
    pipeline_layout: PipelineLayout,
}

impl Material {
    /// Merges the two shaders' resource layouts and builds the pipeline
    /// layout (per-set descriptor allocators plus the API object).
    pub fn new(device: Arc<Device>, vertex: Shader, fragment: Shader) -> RhiResult<Arc<Self>> {
        debug_assert_eq!(vertex.stage(), ShaderStage::Vertex);
        debug_assert_eq!(fragment.stage(), ShaderStage::Fragment);

        let layout = CombinedResourceLayout::merge(vertex.layout(), fragment.layout());
        let pipeline_layout = PipelineLayout::new(device, &layout)?;
        let id = NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Created material #{} ({} vertex input(s), {} descriptor set(s))",
            id,
            layout.inputs.len(),
            layout.sets.len()
        );

        Ok(Arc::new(Self {
            id,
            vertex,
            fragment,
            layout,
            pipeline_layout,
        }))
    }

    /// Process-unique material identity, part of every pipeline cache key.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The merged resource layout.
    #[inline]
    pub fn resource_layout(&self) -> &CombinedResourceLayout {
        &self.layout
    }

    /// The shared pipeline layout.
    #[inline]
    pub fn pipeline_layout(&self) -> &PipelineLayout {
        &self.pipeline_layout
    }

    /// The two shader-stage descriptors needed to build a pipeline.
    pub fn shader_stages(&self) -> [vk::PipelineShaderStageCreateInfo<'_>; 2] {
        [
            self.vertex.stage_create_info(),
            self.fragment.stage_create_info(),
        ]
    }

    /// The vertex input binding and attribute descriptions.
    pub fn vertex_input(
        &self,
    ) -> RhiResult<(
        vk::VertexInputBindingDescription,
        Vec<vk::VertexInputAttributeDescription>,
    )> {
        derive_vertex_input(&self.layout.inputs)
    }
}

/// Name → material map owned by the engine context.
///
/// Replaces any global default-material caching: the registry is built at
/// startup and passed by reference to whoever resolves materials.
#[derive(Default)]
pub struct MaterialRegistry {
    materials: HashMap<String, Arc<Material>>,
}

impl MaterialRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `material` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, material: Arc<Material>) {
        let name = name.into();
        info!("Registered material '{}' (#{})", name, material.id());
        self.materials.insert(name, material);
    }

    /// Looks up a material by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Material>> {
        self.materials.get(name)
    }

    /// Number of registered materials.
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(location: u32, offset: u32, width: u32, name: &str) -> VertexInput {
        VertexInput {
            location,
            offset,
            width,
            name: name.to_string(),
        }
    }

    #[test]
    fn width_to_format_mapping() {
        assert_eq!(format_for_width(4), Some(vk::Format::R32_SFLOAT));
        assert_eq!(format_for_width(8), Some(vk::Format::R32G32_SFLOAT));
        assert_eq!(format_for_width(12), Some(vk::Format::R32G32B32_SFLOAT));
        assert_eq!(format_for_width(16), Some(vk::Format::R32G32B32A32_SFLOAT));
        assert_eq!(format_for_width(3), None);
    }

    #[test]
    fn vertex_input_derivation_packs_tightly() {
        let inputs = [
            input(0, 0, 12, "position"),
            input(1, 12, 12, "normal"),
            input(2, 24, 8, "uv"),
        ];
        let (binding, attributes) = derive_vertex_input(&inputs).unwrap();

        assert_eq!(binding.binding, 0);
        assert_eq!(binding.stride, 32);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);

        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[2].offset, 24);
    }

    #[test]
    fn vertex_input_rejects_unsupported_width() {
        let inputs = [input(0, 0, 5, "broken")];
        assert!(derive_vertex_input(&inputs).is_err());
    }

    #[test]
    fn empty_inputs_yield_zero_stride() {
        let (binding, attributes) = derive_vertex_input(&[]).unwrap();
        assert_eq!(binding.stride, 0);
        assert!(attributes.is_empty());
    }
}
