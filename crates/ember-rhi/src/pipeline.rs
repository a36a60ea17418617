//! Pipeline layouts, graphics pipelines, and the pipeline cache.
//!
//! A [`PipelineLayout`] is derived once from a material's merged resource
//! layout: one descriptor-set allocator per declared set index plus the API
//! layout object, immutable after construction. [`Pipeline`] compiles the
//! fixed-function state this engine draws with; [`PipelineCache`] wraps the
//! API cache object and persists it across runs.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::descriptor::DescriptorSetAllocator;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::render_pass::RenderPass;
use crate::shader::CombinedResourceLayout;

/// Polygon rasterization mode; the command-buffer wireframe toggle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    /// Fill the polygon interior.
    #[default]
    Fill,
    /// Draw polygon edges as lines (wireframe).
    Line,
}

impl PolygonMode {
    /// Converts to the Vulkan polygon mode.
    pub fn to_vk(self) -> vk::PolygonMode {
        match self {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
        }
    }
}

/// Pipeline layout derived from a merged resource layout.
///
/// Owns one [`DescriptorSetAllocator`] per descriptor set index (with its
/// update template) and the `VkPipelineLayout`. Immutable once built and
/// shared by every pipeline of the owning material.
pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
    /// Allocators indexed by set number; sets are contiguous from 0.
    set_allocators: Vec<DescriptorSetAllocator>,
}

impl PipelineLayout {
    /// Builds the per-set allocators and the API layout object.
    ///
    /// Set indices must be contiguous starting at 0 (binding a set array
    /// with gaps is not expressible in the pipeline layout).
    pub fn new(device: Arc<Device>, resource_layout: &CombinedResourceLayout) -> RhiResult<Self> {
        let set_count = resource_layout.sets.len() as u32;
        for &set_index in resource_layout.sets.keys() {
            if set_index >= set_count {
                return Err(RhiError::InvalidUsage(format!(
                    "descriptor set indices must be contiguous from 0, found set {} among {} set(s)",
                    set_index, set_count
                )));
            }
        }

        let mut set_allocators = Vec::with_capacity(resource_layout.sets.len());
        for set_layout in resource_layout.sets.values() {
            set_allocators.push(DescriptorSetAllocator::new(device.clone(), set_layout)?);
        }

        let vk_set_layouts: Vec<vk::DescriptorSetLayout> = set_allocators
            .iter()
            .map(|allocator| allocator.layout())
            .collect();

        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&vk_set_layouts);
        let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };

        debug!(
            "Created pipeline layout with {} descriptor set(s)",
            set_allocators.len()
        );

        Ok(Self {
            device,
            layout,
            set_allocators,
        })
    }

    /// Returns the Vulkan pipeline layout handle.
    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Number of descriptor sets in the layout.
    #[inline]
    pub fn set_count(&self) -> usize {
        self.set_allocators.len()
    }

    /// The allocator for descriptor set `set`.
    #[inline]
    pub fn set_allocator(&self, set: u32) -> Option<&DescriptorSetAllocator> {
        self.set_allocators.get(set as usize)
    }

    /// Iterates allocators in set-index order.
    pub fn set_allocators(&self) -> impl Iterator<Item = (u32, &DescriptorSetAllocator)> {
        self.set_allocators
            .iter()
            .enumerate()
            .map(|(i, allocator)| (i as u32, allocator))
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
        debug!("Destroyed pipeline layout");
    }
}

/// Everything variable about a graphics pipeline build; the rest of the
/// fixed-function state is this engine's single configuration (triangle
/// list, dynamic viewport/scissor, back-face culling, CCW, no blending,
/// single-sample).
pub struct GraphicsPipelineDesc<'a> {
    /// Vertex + fragment stage descriptors.
    pub shader_stages: &'a [vk::PipelineShaderStageCreateInfo<'a>],
    /// Vertex input bindings.
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    /// Vertex input attributes.
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    /// Fill or wireframe rasterization.
    pub polygon_mode: PolygonMode,
}

/// Compiled, immutable graphics pipeline.
pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
}

impl Pipeline {
    /// Builds a graphics pipeline against `render_pass` (subpass 0),
    /// merging the result into `cache`.
    pub fn new_graphics(
        device: Arc<Device>,
        desc: &GraphicsPipelineDesc<'_>,
        layout: vk::PipelineLayout,
        render_pass: &RenderPass,
        cache: vk::PipelineCache,
    ) -> RhiResult<Self> {
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.polygon_mode.to_vk())
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let has_depth = render_pass.has_depth();
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(has_depth)
            .depth_write_enable(has_depth)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..render_pass
            .color_attachment_count())
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(false)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();
        let color_blend_state =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(desc.shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(0);

        let pipeline = unsafe {
            device
                .handle()
                .create_graphics_pipelines(cache, &[create_info], None)
                .map_err(|(_, result)| result)?[0]
        };

        info!(
            "Graphics pipeline created ({:?}, render pass #{})",
            desc.polygon_mode,
            render_pass.id()
        );

        Ok(Self { device, pipeline })
    }

    /// Returns the Vulkan pipeline handle.
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
        }
        debug!("Graphics pipeline destroyed");
    }
}

/// Disk-backed wrapper over `VkPipelineCache`.
///
/// Loaded opportunistically at startup and serialized back on clean
/// shutdown; missing or incompatible data starts the cache empty. Never
/// required for correctness, only for warm-start pipeline builds.
pub struct PipelineCache {
    device: Arc<Device>,
    cache: vk::PipelineCache,
}

impl PipelineCache {
    /// Creates the cache, seeding it from `path` when a previous run left
    /// data there. A corrupt or incompatible blob falls back to an empty
    /// cache (the driver validates the header).
    pub fn load(device: Arc<Device>, path: &Path) -> RhiResult<Self> {
        let initial_data = match std::fs::read(path) {
            Ok(data) => {
                info!(
                    "Loaded pipeline cache from {:?} ({} bytes)",
                    path,
                    data.len()
                );
                data
            }
            Err(_) => {
                debug!("No pipeline cache at {:?}, starting empty", path);
                Vec::new()
            }
        };

        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(&initial_data);
        let cache = match unsafe { device.handle().create_pipeline_cache(&create_info, None) } {
            Ok(cache) => cache,
            Err(_) if !initial_data.is_empty() => {
                warn!("Stored pipeline cache rejected, starting empty");
                let empty = vk::PipelineCacheCreateInfo::default();
                unsafe { device.handle().create_pipeline_cache(&empty, None)? }
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self { device, cache })
    }

    /// Returns the Vulkan pipeline cache handle.
    #[inline]
    pub fn handle(&self) -> vk::PipelineCache {
        self.cache
    }

    /// Serializes the cache contents to `path`.
    pub fn save(&self, path: &Path) -> RhiResult<()> {
        let data = unsafe { self.device.handle().get_pipeline_cache_data(self.cache)? };
        std::fs::write(path, &data).map_err(|e| {
            RhiError::InvalidUsage(format!("failed to write pipeline cache {:?}: {}", path, e))
        })?;
        info!("Saved pipeline cache to {:?} ({} bytes)", path, data.len());
        Ok(())
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline_cache(self.cache, None);
        }
        debug!("Destroyed pipeline cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygon_mode_to_vk() {
        assert_eq!(PolygonMode::Fill.to_vk(), vk::PolygonMode::FILL);
        assert_eq!(PolygonMode::Line.to_vk(), vk::PolygonMode::LINE);
    }

    #[test]
    fn polygon_mode_default_is_fill() {
        assert_eq!(PolygonMode::default(), PolygonMode::Fill);
    }
}
