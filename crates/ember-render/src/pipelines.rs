//! The tuple-keyed pipeline store.
//!
//! Pipelines are cached by `{material identity, fill mode, render-pass
//! compatibility class}`: the same combination drawn twice reuses the
//! compiled object, while a new fill mode or render pass builds its own
//! variant. All builds go through the shared disk-backed
//! [`PipelineCache`], which amortizes compilation across process runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use ember_rhi::device::Device;
use ember_rhi::pipeline::{GraphicsPipelineDesc, Pipeline, PipelineCache, PolygonMode};
use ember_rhi::render_pass::RenderPass;
use ember_rhi::{RhiError, RhiResult};

use crate::material::Material;

/// Identity of one compiled pipeline variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// The material the pipeline was built for.
    pub material_id: u64,
    /// Fill or wireframe rasterization.
    pub polygon_mode: PolygonMode,
    /// Render-pass compatibility class (the pass id).
    pub render_pass_id: u64,
}

/// Keyed cache of compiled pipelines plus the API pipeline cache.
///
/// Shared behind `Arc` between the frame manager and the per-image command
/// buffers; the map's `Mutex` is uncontended on the single recording
/// thread.
pub struct PipelineStore {
    device: Arc<Device>,
    cache: PipelineCache,
    pipelines: Mutex<HashMap<PipelineKey, Arc<Pipeline>>>,
}

impl PipelineStore {
    /// Creates the store, seeding the API cache from `cache_path` when a
    /// previous run saved one.
    pub fn new(device: Arc<Device>, cache_path: &Path) -> RhiResult<Self> {
        let cache = PipelineCache::load(device.clone(), cache_path)?;
        Ok(Self {
            device,
            cache,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the pipeline for `key`, building it on first use.
    pub fn get_or_create(
        &self,
        key: PipelineKey,
        material: &Material,
        render_pass: &RenderPass,
    ) -> RhiResult<Arc<Pipeline>> {
        let mut pipelines = self
            .pipelines
            .lock()
            .map_err(|_| RhiError::InvalidUsage("pipeline store mutex poisoned".to_string()))?;

        if let Some(pipeline) = pipelines.get(&key) {
            return Ok(pipeline.clone());
        }

        debug!(
            "Pipeline miss for material #{} ({:?}, pass #{}), building",
            key.material_id, key.polygon_mode, key.render_pass_id
        );

        let shader_stages = material.shader_stages();
        let (vertex_binding, vertex_attributes) = material.vertex_input()?;
        let vertex_bindings = [vertex_binding];

        let desc = GraphicsPipelineDesc {
            shader_stages: &shader_stages,
            vertex_bindings: &vertex_bindings,
            vertex_attributes: &vertex_attributes,
            polygon_mode: key.polygon_mode,
        };

        let pipeline = Arc::new(Pipeline::new_graphics(
            self.device.clone(),
            &desc,
            material.pipeline_layout().handle(),
            render_pass,
            self.cache.handle(),
        )?);

        pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    /// Number of compiled pipeline variants.
    pub fn len(&self) -> usize {
        self.pipelines.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Whether no pipeline has been built yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the API pipeline cache to `path`.
    pub fn save(&self, path: &Path) -> RhiResult<()> {
        self.cache.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &PipelineKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn identical_state_yields_identical_keys() {
        // Same material, same fill mode, same pass: the second draw must
        // hit the cached pipeline.
        let first = PipelineKey {
            material_id: 7,
            polygon_mode: PolygonMode::Fill,
            render_pass_id: 3,
        };
        let second = PipelineKey {
            material_id: 7,
            polygon_mode: PolygonMode::Fill,
            render_pass_id: 3,
        };
        assert_eq!(first, second);
        assert_eq!(hash_of(&first), hash_of(&second));
    }

    #[test]
    fn any_component_change_yields_a_distinct_key() {
        let base = PipelineKey {
            material_id: 7,
            polygon_mode: PolygonMode::Fill,
            render_pass_id: 3,
        };

        let other_material = PipelineKey {
            material_id: 8,
            ..base
        };
        let other_mode = PipelineKey {
            polygon_mode: PolygonMode::Line,
            ..base
        };
        let other_pass = PipelineKey {
            render_pass_id: 4,
            ..base
        };

        assert_ne!(base, other_material);
        assert_ne!(base, other_mode);
        assert_ne!(base, other_pass);
    }

    #[test]
    fn keys_work_as_map_keys() {
        let mut map: HashMap<PipelineKey, u32> = HashMap::new();
        let key = PipelineKey {
            material_id: 1,
            polygon_mode: PolygonMode::Line,
            render_pass_id: 2,
        };
        map.insert(key, 42);
        assert_eq!(map.get(&key), Some(&42));
    }
}
