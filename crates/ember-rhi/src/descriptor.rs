//! Descriptor set allocation and batched updates.
//!
//! Each descriptor set index of a pipeline layout gets one
//! [`DescriptorSetAllocator`]: a ring of [`SET_COUNT`] pre-allocated sets,
//! refreshed through a descriptor update template. Three in-flight reuse
//! slots avoid write-after-read hazards without per-draw allocation cost;
//! the descriptor types are fixed by the layout, so the pool never needs
//! resizing. The template turns the per-draw rebind into one structured
//! memory-copy-driven API call instead of N individual writes.

use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::shader::SetLayout;

/// Depth of the descriptor-set reuse ring.
///
/// Correctness relies on no more than this many frames' worth of
/// submissions being outstanding at once, which the frame fence protocol
/// guarantees.
pub const SET_COUNT: usize = 3;

/// Round-robin index over a fixed number of slots.
#[derive(Clone, Copy, Debug)]
pub struct RingIndex {
    index: usize,
    count: usize,
}

impl RingIndex {
    /// Creates a ring over `count` slots, starting at slot 0.
    pub fn new(count: usize) -> Self {
        debug_assert!(count > 0, "ring must have at least one slot");
        Self { index: 0, count }
    }

    /// Returns the current slot and advances to the next one.
    pub fn next(&mut self) -> usize {
        let current = self.index;
        self.index = (self.index + 1) % self.count;
        current
    }
}

/// Pool sizes for a layout with `uniform_buffer_count` dynamic uniform
/// buffers per set: every set in the ring gets its own descriptors.
pub fn pool_sizes_for(uniform_buffer_count: usize) -> Vec<vk::DescriptorPoolSize> {
    if uniform_buffer_count == 0 {
        return Vec::new();
    }
    vec![vk::DescriptorPoolSize::default()
        .ty(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
        .descriptor_count((uniform_buffer_count * SET_COUNT) as u32)]
}

/// Update-template entries for the declared bindings, in declaration
/// order. Entry `i` reads the `i`-th element of a packed
/// `[vk::DescriptorBufferInfo]` array.
pub fn template_entries(bindings: &[u32]) -> Vec<vk::DescriptorUpdateTemplateEntry> {
    let stride = std::mem::size_of::<vk::DescriptorBufferInfo>();
    bindings
        .iter()
        .enumerate()
        .map(|(i, &binding)| vk::DescriptorUpdateTemplateEntry {
            dst_binding: binding,
            dst_array_element: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            offset: i * stride,
            stride,
        })
        .collect()
}

/// Ring state, created lazily on the first `get_set` call.
struct RingState {
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    ring: RingIndex,
}

/// Per-set-index descriptor allocator.
///
/// Owns the set layout, the update template, and (once used) the pool plus
/// the ring of sets. Shared behind the pipeline layout's `Arc`; the ring
/// state sits in a `Mutex` that is uncontended on the single recording
/// thread.
pub struct DescriptorSetAllocator {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    template: vk::DescriptorUpdateTemplate,
    /// Binding indices in declaration order; dynamic offsets follow it.
    binding_order: Vec<u32>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    state: Mutex<Option<RingState>>,
}

impl DescriptorSetAllocator {
    /// Builds the set layout and update template for `set_layout`.
    pub fn new(device: Arc<Device>, set_layout: &SetLayout) -> RhiResult<Self> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = set_layout
            .uniform_buffers
            .iter()
            .map(|ubo| {
                let stages = if ubo.stages.is_empty() {
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
                } else {
                    ubo.stages
                };
                vk::DescriptorSetLayoutBinding::default()
                    .binding(ubo.binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                    .descriptor_count(1)
                    .stage_flags(stages)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&layout_info, None)?
        };

        let binding_order: Vec<u32> = set_layout
            .uniform_buffers
            .iter()
            .map(|ubo| ubo.binding)
            .collect();

        let entries = template_entries(&binding_order);
        let template_info = vk::DescriptorUpdateTemplateCreateInfo::default()
            .descriptor_update_entries(&entries)
            .template_type(vk::DescriptorUpdateTemplateType::DESCRIPTOR_SET)
            .descriptor_set_layout(layout);

        let template = unsafe {
            device
                .handle()
                .create_descriptor_update_template(&template_info, None)?
        };

        debug!(
            "Created descriptor set allocator ({} binding(s), ring of {})",
            binding_order.len(),
            SET_COUNT
        );

        Ok(Self {
            device,
            layout,
            template,
            pool_sizes: pool_sizes_for(set_layout.uniform_buffers.len()),
            binding_order,
            state: Mutex::new(None),
        })
    }

    /// Returns the Vulkan descriptor set layout handle.
    #[inline]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Binding indices in declaration order.
    #[inline]
    pub fn binding_order(&self) -> &[u32] {
        &self.binding_order
    }

    /// Number of declared bindings.
    #[inline]
    pub fn binding_count(&self) -> usize {
        self.binding_order.len()
    }

    /// Returns the next set in the ring.
    ///
    /// The pool and the [`SET_COUNT`] sets are created on first use; after
    /// that the call only advances the ring.
    pub fn get_set(&self) -> RhiResult<vk::DescriptorSet> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| RhiError::InvalidUsage("descriptor ring mutex poisoned".to_string()))?;

        if guard.is_none() {
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(SET_COUNT as u32)
                .pool_sizes(&self.pool_sizes);
            let pool = unsafe {
                self.device
                    .handle()
                    .create_descriptor_pool(&pool_info, None)?
            };

            let layouts = [self.layout; SET_COUNT];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };

            debug!("Allocated descriptor ring ({} sets)", sets.len());

            *guard = Some(RingState {
                pool,
                sets,
                ring: RingIndex::new(SET_COUNT),
            });
        }

        let state = guard
            .as_mut()
            .ok_or_else(|| RhiError::InvalidUsage("descriptor ring unavailable".to_string()))?;
        let slot = state.ring.next();
        Ok(state.sets[slot])
    }

    /// Writes `buffer_infos` into `set` through the update template.
    ///
    /// `buffer_infos` must hold one entry per declared binding, in
    /// declaration order.
    pub fn update(&self, set: vk::DescriptorSet, buffer_infos: &[vk::DescriptorBufferInfo]) {
        debug_assert_eq!(
            buffer_infos.len(),
            self.binding_order.len(),
            "one buffer info per declared binding"
        );
        if buffer_infos.is_empty() {
            return;
        }
        unsafe {
            self.device.handle().update_descriptor_set_with_template(
                set,
                self.template,
                buffer_infos.as_ptr() as *const c_void,
            );
        }
    }
}

impl Drop for DescriptorSetAllocator {
    fn drop(&mut self) {
        unsafe {
            if let Ok(mut guard) = self.state.lock() {
                if let Some(state) = guard.take() {
                    self.device.handle().destroy_descriptor_pool(state.pool, None);
                }
            }
            self.device
                .handle()
                .destroy_descriptor_update_template(self.template, None);
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed descriptor set allocator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_cycles_through_fixed_slots() {
        let mut ring = RingIndex::new(SET_COUNT);
        let first_cycle: Vec<usize> = (0..SET_COUNT).map(|_| ring.next()).collect();
        assert_eq!(first_cycle, vec![0, 1, 2]);

        // The (n + SET_COUNT)-th call returns the same slot as the n-th.
        let second_cycle: Vec<usize> = (0..SET_COUNT).map(|_| ring.next()).collect();
        assert_eq!(second_cycle, first_cycle);
    }

    #[test]
    fn ring_slots_are_distinct_within_a_cycle() {
        let mut ring = RingIndex::new(SET_COUNT);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..SET_COUNT {
            assert!(seen.insert(ring.next()));
        }
    }

    #[test]
    fn pool_sizes_scale_with_ring_depth() {
        let sizes = pool_sizes_for(2);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC);
        assert_eq!(sizes[0].descriptor_count, (2 * SET_COUNT) as u32);

        assert!(pool_sizes_for(0).is_empty());
    }

    #[test]
    fn template_entries_stride_over_buffer_infos() {
        let stride = std::mem::size_of::<vk::DescriptorBufferInfo>();
        let entries = template_entries(&[0, 1, 3]);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].dst_binding, 0);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[1].dst_binding, 1);
        assert_eq!(entries[1].offset, stride);
        assert_eq!(entries[2].dst_binding, 3);
        assert_eq!(entries[2].offset, 2 * stride);
        assert!(entries
            .iter()
            .all(|e| e.descriptor_type == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC));
        assert!(entries.iter().all(|e| e.stride == stride));
    }
}
