//! The graphics command buffer state machine.
//!
//! [`GraphicsCommandBuffer`] records one frame's draws for one swapchain
//! image. It tracks the bound material, vertex/index buffers, per-set
//! resource bindings and the fill mode; before each indexed draw it
//! flushes descriptor state through the update-template path and lazily
//! resolves the pipeline matching the current
//! {material, fill mode, render pass} state.
//!
//! State machine: `Idle` → `Recording` (begin) → `InRenderPass`
//! (begin_render_pass) → `Recording` (end_render_pass) → `Submitted`
//! (end). Invalid transitions and draws without a bound material are
//! programmer errors, checked by debug assertions.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use ember_rhi::buffer::Buffer;
use ember_rhi::command::{CommandBuffer, CommandPool};
use ember_rhi::device::Device;
use ember_rhi::pipeline::PolygonMode;
use ember_rhi::render_pass::{Framebuffer, RenderPass, RenderPassInfo};
use ember_rhi::{RhiError, RhiResult};

use crate::material::Material;
use crate::pipelines::{PipelineKey, PipelineStore};
use crate::uniform::{UniformBufferAllocation, UniformBufferPool};

/// Recording lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    /// Not recording; the initial state and the state after frame retire.
    Idle,
    /// Between `begin` and `begin_render_pass` / after `end_render_pass`.
    Recording,
    /// Inside a render pass; draws are legal here.
    InRenderPass,
    /// Recording finished, buffer handed to the queue.
    Submitted,
}

/// One resource reference recorded for a (set, binding) pair:
/// the unit written into a descriptor set via the update template.
#[derive(Clone, Copy, Debug)]
pub struct ResourceBinding {
    /// Backing buffer handle.
    pub buffer: vk::Buffer,
    /// Byte offset of the range, applied as a dynamic offset.
    pub offset: u64,
    /// Byte size of the range.
    pub range: u64,
}

/// Per-image graphics recorder with lazy pipeline construction.
pub struct GraphicsCommandBuffer {
    recorder: CommandBuffer,
    pool: Arc<UniformBufferPool>,
    pipelines: Arc<PipelineStore>,

    state: RecordingState,

    // Transient state, reset at render-pass boundaries.
    polygon_mode: PolygonMode,
    render_pass: Option<Arc<RenderPass>>,

    // Per-draw state, reset per draw-call batch (material bind).
    material: Option<Arc<Material>>,
    pre_bound_sets: HashMap<u32, vk::DescriptorSet>,
    resource_bindings: HashMap<(u32, u32), ResourceBinding>,

    // Frame-lifetime uniform block, acquired on first upload and returned
    // to the pool once the frame is known retired.
    uniform_block: Option<UniformBufferAllocation>,
}

impl GraphicsCommandBuffer {
    /// Allocates a recorder from `command_pool`.
    pub fn new(
        device: Arc<Device>,
        command_pool: &CommandPool,
        pool: Arc<UniformBufferPool>,
        pipelines: Arc<PipelineStore>,
    ) -> RhiResult<Self> {
        let recorder = CommandBuffer::new(device, command_pool)?;
        Ok(Self {
            recorder,
            pool,
            pipelines,
            state: RecordingState::Idle,
            polygon_mode: PolygonMode::Fill,
            render_pass: None,
            material: None,
            pre_bound_sets: HashMap::new(),
            resource_bindings: HashMap::new(),
            uniform_block: None,
        })
    }

    /// The raw command buffer handle, for submission.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.recorder.handle()
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Starts recording a new frame.
    ///
    /// Must only be called once the previous frame using this buffer has
    /// retired (the frame manager's fence wait guarantees it); the uniform
    /// block that frame held goes back to the pool here.
    pub fn begin(&mut self) -> RhiResult<()> {
        debug_assert!(
            matches!(self.state, RecordingState::Idle | RecordingState::Submitted),
            "begin called in state {:?}",
            self.state
        );

        self.release_uniform_block();
        self.reset_per_draw_state();
        self.polygon_mode = PolygonMode::Fill;
        self.render_pass = None;

        self.recorder.reset()?;
        self.recorder.begin()?;
        self.state = RecordingState::Recording;
        Ok(())
    }

    /// Begins `render_pass` over `framebuffer`.
    pub fn begin_render_pass(
        &mut self,
        render_pass: Arc<RenderPass>,
        framebuffer: &Framebuffer,
        info: &RenderPassInfo,
    ) {
        debug_assert_eq!(
            self.state,
            RecordingState::Recording,
            "begin_render_pass outside recording"
        );
        debug_assert_eq!(
            framebuffer.render_pass_id(),
            render_pass.id(),
            "framebuffer was built for a different render pass"
        );

        let clear_values = info.clear_values();
        self.recorder
            .begin_render_pass(&render_pass, framebuffer, &clear_values);
        self.render_pass = Some(render_pass);
        self.state = RecordingState::InRenderPass;
    }

    /// Ends the active render pass; transient state resets here.
    pub fn end_render_pass(&mut self) {
        debug_assert_eq!(
            self.state,
            RecordingState::InRenderPass,
            "end_render_pass outside a render pass"
        );
        self.recorder.end_render_pass();
        self.render_pass = None;
        self.polygon_mode = PolygonMode::Fill;
        self.state = RecordingState::Recording;
    }

    /// Finishes recording; the buffer is ready for submission.
    pub fn end(&mut self) -> RhiResult<()> {
        debug_assert_eq!(
            self.state,
            RecordingState::Recording,
            "end called with an open render pass"
        );
        self.recorder.end()?;
        self.state = RecordingState::Submitted;
        Ok(())
    }

    /// Sets the viewport for subsequent draws.
    pub fn set_viewport(&self, viewport: vk::Viewport) {
        self.recorder.set_viewport(&viewport);
    }

    /// Sets the scissor rectangle for subsequent draws.
    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        self.recorder.set_scissor(&scissor);
    }

    /// Switches between fill and wireframe rasterization.
    ///
    /// Takes effect at the next draw through pipeline resolution.
    pub fn set_polygon_mode(&mut self, mode: PolygonMode) {
        self.polygon_mode = mode;
    }

    /// Binds `material`, starting a new draw-call batch: recorded resource
    /// bindings and pre-bound sets from the previous batch are dropped.
    pub fn bind_material(&mut self, material: Arc<Material>) {
        self.reset_per_draw_state();
        self.material = Some(material);
    }

    /// Binds the mesh vertex buffer at binding 0.
    ///
    /// A material must already be bound; its layout validates the vertex
    /// input when the pipeline is built.
    pub fn bind_vertex_buffer(&self, buffer: &Buffer) {
        debug_assert!(self.material.is_some(), "vertex buffer bound without material");
        self.recorder.bind_vertex_buffer(0, buffer.handle(), 0);
    }

    /// Binds the mesh index buffer.
    pub fn bind_index_buffer(&self, buffer: &Buffer, index_type: vk::IndexType) {
        debug_assert!(self.material.is_some(), "index buffer bound without material");
        self.recorder.bind_index_buffer(buffer.handle(), 0, index_type);
    }

    /// Installs an externally prepared descriptor set for `set`.
    ///
    /// The set is used verbatim at draw time, bypassing the ring allocator
    /// and template update for that index.
    pub fn set_descriptor_set(&mut self, set: u32, descriptor_set: vk::DescriptorSet) {
        self.pre_bound_sets.insert(set, descriptor_set);
    }

    /// Allocates per-draw uniform data and records its binding.
    ///
    /// The first call of a frame acquires one pool block; every call
    /// carves a fresh aligned range from it and copies `data` in
    /// immediately (the memory is host-coherent, no flush). The resulting
    /// buffer range is recorded as the [`ResourceBinding`] for
    /// `(set, binding)` and applied at the next draw.
    pub fn allocate_uniform_buffer(
        &mut self,
        set: u32,
        binding: u32,
        data: &[u8],
    ) -> RhiResult<()> {
        debug_assert!(!data.is_empty(), "uniform upload with no data");
        if data.is_empty() {
            return Err(RhiError::InvalidUsage(
                "uniform upload with no data".to_string(),
            ));
        }

        if self.uniform_block.is_none() {
            self.uniform_block = Some(self.pool.allocate(data.len() as u64)?);
            debug!("Command buffer acquired a uniform pool block");
        }
        let block = self
            .uniform_block
            .as_mut()
            .ok_or_else(|| RhiError::InvalidUsage("uniform block unavailable".to_string()))?;

        let offset = block.allocate(data.len() as u64).ok_or_else(|| {
            debug_assert!(false, "uniform pool block exhausted for this frame");
            RhiError::InvalidUsage(format!(
                "uniform pool block exhausted ({} byte request)",
                data.len()
            ))
        })?;
        block.write(offset, data)?;

        self.resource_bindings.insert(
            (set, binding),
            ResourceBinding {
                buffer: block.buffer_handle(),
                offset,
                range: data.len() as u64,
            },
        );

        Ok(())
    }

    /// Issues an indexed draw of `index_count` indices.
    ///
    /// Descriptor state is flushed first: for every set in the material's
    /// layout, an externally pre-bound set is used verbatim, otherwise the
    /// ring's next slot is fetched, template-updated from the recorded
    /// bindings and bound with the accumulated dynamic offsets in
    /// declared-binding order. Then the pipeline for the current
    /// {material, fill mode, render pass} is resolved (built on first use,
    /// reused afterwards) and the draw recorded. Instancing is a seam left
    /// for extension: instance count is fixed at 1 with zero offsets.
    pub fn draw_indexed(&mut self, index_count: u32) -> RhiResult<()> {
        debug_assert_eq!(
            self.state,
            RecordingState::InRenderPass,
            "draw outside a render pass"
        );
        debug_assert!(self.material.is_some(), "draw without a bound material");

        let material = self
            .material
            .clone()
            .ok_or_else(|| RhiError::InvalidUsage("draw without a bound material".to_string()))?;
        let render_pass = self
            .render_pass
            .clone()
            .ok_or_else(|| RhiError::InvalidUsage("draw outside a render pass".to_string()))?;

        self.flush_descriptor_sets(&material)?;

        let key = PipelineKey {
            material_id: material.id(),
            polygon_mode: self.polygon_mode,
            render_pass_id: render_pass.id(),
        };
        let pipeline = self.pipelines.get_or_create(key, &material, &render_pass)?;
        self.recorder.bind_pipeline(pipeline.handle());

        self.recorder.draw_indexed(index_count, 1, 0, 0, 0);
        Ok(())
    }

    /// Binds every descriptor set the material's layout declares.
    fn flush_descriptor_sets(&mut self, material: &Material) -> RhiResult<()> {
        let layout = material.pipeline_layout();

        for (set_index, allocator) in layout.set_allocators() {
            // An externally prepared set wins over the ring.
            if let Some(&pre_bound) = self.pre_bound_sets.get(&set_index) {
                self.recorder
                    .bind_descriptor_set(layout.handle(), set_index, pre_bound, &[]);
                continue;
            }

            let mut buffer_infos = Vec::with_capacity(allocator.binding_count());
            let mut dynamic_offsets = Vec::with_capacity(allocator.binding_count());

            for &binding in allocator.binding_order() {
                let resource = self
                    .resource_bindings
                    .get(&(set_index, binding))
                    .ok_or_else(|| {
                        debug_assert!(
                            false,
                            "draw with no data for set {} binding {}",
                            set_index, binding
                        );
                        RhiError::InvalidUsage(format!(
                            "no uniform data recorded for set {} binding {}",
                            set_index, binding
                        ))
                    })?;

                // The template writes base ranges; the per-draw placement
                // rides in as a dynamic offset.
                buffer_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(resource.buffer)
                        .offset(0)
                        .range(resource.range),
                );
                dynamic_offsets.push(resource.offset as u32);
            }

            let descriptor_set = allocator.get_set()?;
            allocator.update(descriptor_set, &buffer_infos);
            self.recorder.bind_descriptor_set(
                layout.handle(),
                set_index,
                descriptor_set,
                &dynamic_offsets,
            );
        }

        Ok(())
    }

    fn reset_per_draw_state(&mut self) {
        self.material = None;
        self.pre_bound_sets.clear();
        self.resource_bindings.clear();
    }

    /// Returns the held uniform block to the pool.
    ///
    /// Called from `begin` (the fence wait proved the previous frame
    /// retired) and on destruction.
    fn release_uniform_block(&mut self) {
        if let Some(block) = self.uniform_block.take() {
            self.pool.release(block);
        }
    }
}

impl Drop for GraphicsCommandBuffer {
    fn drop(&mut self) {
        self.release_uniform_block();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_states_are_distinct() {
        assert_ne!(RecordingState::Idle, RecordingState::Recording);
        assert_ne!(RecordingState::Recording, RecordingState::InRenderPass);
        assert_ne!(RecordingState::InRenderPass, RecordingState::Submitted);
    }

    #[test]
    fn resource_binding_is_plain_data() {
        let binding = ResourceBinding {
            buffer: vk::Buffer::null(),
            offset: 256,
            range: 64,
        };
        let copy = binding;
        assert_eq!(copy.offset, 256);
        assert_eq!(copy.range, 64);
    }
}
