//! Render pass and framebuffer objects.
//!
//! A [`RenderPassInfo`] is the declarative description: ordered color
//! attachments, an optional depth/stencil attachment, per-attachment
//! clear/store bits and one or more subpasses. [`RenderPass`] compiles it
//! into the immutable API object; [`Framebuffer`] binds a compatible pass
//! to concrete attachment views, one per swapchain image.
//!
//! Attachment descriptions, subpass dependencies and validation are pure
//! functions over the info struct, so their rules are unit-tested without
//! a device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::image::Attachment;

static NEXT_RENDER_PASS_ID: AtomicU64 = AtomicU64::new(1);

/// One subpass: which color attachment indices it writes, and whether it
/// uses the depth/stencil attachment.
#[derive(Clone, Debug, Default)]
pub struct SubpassInfo {
    /// Indices into [`RenderPassInfo::color_attachments`].
    pub color_attachments: Vec<u32>,
    /// Whether the subpass writes the depth/stencil attachment.
    pub uses_depth_stencil: bool,
}

/// Declarative render pass description.
#[derive(Clone, Debug)]
pub struct RenderPassInfo {
    /// Ordered color attachments.
    pub color_attachments: Vec<Attachment>,
    /// Optional depth/stencil attachment, bound after the color attachments.
    pub depth_stencil: Option<Attachment>,
    /// Bit `i` set: color attachment `i` is cleared on load.
    pub clear_attachments: u32,
    /// Bit `i` set: color attachment `i` is stored at the end of the pass.
    pub store_attachments: u32,
    /// Clear color per color attachment (used where the clear bit is set).
    pub clear_colors: Vec<[f32; 4]>,
    /// Whether the depth/stencil attachment is cleared on load.
    pub clear_depth_stencil: bool,
    /// Depth/stencil clear values.
    pub depth_clear_value: f32,
    /// Stencil clear value.
    pub stencil_clear_value: u32,
    /// Subpasses; every pass has at least one.
    pub subpasses: Vec<SubpassInfo>,
}

impl RenderPassInfo {
    /// A single-subpass pass over one color attachment, cleared and stored.
    pub fn single_color(attachment: Attachment, clear_color: [f32; 4]) -> Self {
        Self {
            color_attachments: vec![attachment],
            depth_stencil: None,
            clear_attachments: 1 << 0,
            store_attachments: 1 << 0,
            clear_colors: vec![clear_color],
            clear_depth_stencil: false,
            depth_clear_value: 1.0,
            stencil_clear_value: 0,
            subpasses: vec![SubpassInfo {
                color_attachments: vec![0],
                uses_depth_stencil: false,
            }],
        }
    }

    /// Adds a cleared depth/stencil attachment used by every subpass.
    pub fn with_depth_stencil(mut self, attachment: Attachment) -> Self {
        self.depth_stencil = Some(attachment);
        self.clear_depth_stencil = true;
        for subpass in &mut self.subpasses {
            subpass.uses_depth_stencil = true;
        }
        self
    }

    /// Validates the description.
    ///
    /// Rejects descriptions with no color attachments, no subpasses, a
    /// subpass referencing an attachment index out of range, or a subpass
    /// using depth/stencil when none is attached.
    pub fn validate(&self) -> RhiResult<()> {
        if self.color_attachments.is_empty() {
            return Err(RhiError::RenderPass(
                "render pass requires at least one color attachment".to_string(),
            ));
        }
        if self.subpasses.is_empty() {
            return Err(RhiError::RenderPass(
                "render pass requires at least one subpass".to_string(),
            ));
        }
        if self.clear_colors.len() != self.color_attachments.len() {
            return Err(RhiError::RenderPass(format!(
                "expected {} clear colors, got {}",
                self.color_attachments.len(),
                self.clear_colors.len()
            )));
        }

        let attachment_count = self.color_attachments.len() as u32;
        for (i, subpass) in self.subpasses.iter().enumerate() {
            for &index in &subpass.color_attachments {
                if index >= attachment_count {
                    return Err(RhiError::RenderPass(format!(
                        "subpass {} references color attachment {} but only {} exist",
                        i, index, attachment_count
                    )));
                }
            }
            if subpass.uses_depth_stencil && self.depth_stencil.is_none() {
                return Err(RhiError::RenderPass(format!(
                    "subpass {} uses depth/stencil but none is attached",
                    i
                )));
            }
        }

        Ok(())
    }

    /// The framebuffer area: the minimum extent across all color attachments.
    pub fn dimensions(&self) -> (u32, u32) {
        let mut width = u32::MAX;
        let mut height = u32::MAX;
        for attachment in &self.color_attachments {
            width = width.min(attachment.width);
            height = height.min(attachment.height);
        }
        (width, height)
    }

    /// Clear values in attachment order (colors, then depth/stencil).
    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        let mut values: Vec<vk::ClearValue> = self
            .clear_colors
            .iter()
            .map(|&color| vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            })
            .collect();

        if self.depth_stencil.is_some() {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.depth_clear_value,
                    stencil: self.stencil_clear_value,
                },
            });
        }

        values
    }
}

/// Load op for color attachment `index`: CLEAR iff its clear bit is set,
/// DONT_CARE otherwise.
pub fn color_load_op(info: &RenderPassInfo, index: u32) -> vk::AttachmentLoadOp {
    if info.clear_attachments & (1 << index) != 0 {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::DONT_CARE
    }
}

/// Store op for color attachment `index`: STORE iff its store bit is set,
/// DONT_CARE otherwise.
pub fn color_store_op(info: &RenderPassInfo, index: u32) -> vk::AttachmentStoreOp {
    if info.store_attachments & (1 << index) != 0 {
        vk::AttachmentStoreOp::STORE
    } else {
        vk::AttachmentStoreOp::DONT_CARE
    }
}

/// Compiles the attachment descriptions (colors, then depth/stencil).
///
/// Swapchain-backed attachments are pinned to their present layout: that is
/// the final layout, and also the initial layout when the attachment is
/// loaded rather than cleared.
pub fn build_attachment_descriptions(info: &RenderPassInfo) -> Vec<vk::AttachmentDescription> {
    let mut descriptions = Vec::with_capacity(info.color_attachments.len() + 1);

    for (i, attachment) in info.color_attachments.iter().enumerate() {
        let load_op = color_load_op(info, i as u32);
        let (initial_layout, final_layout) = match attachment.swapchain_layout {
            Some(present_layout) => {
                let initial = if load_op == vk::AttachmentLoadOp::CLEAR {
                    vk::ImageLayout::UNDEFINED
                } else {
                    present_layout
                };
                (initial, present_layout)
            }
            None => (
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
        };

        descriptions.push(
            vk::AttachmentDescription::default()
                .format(attachment.format)
                .samples(sample_count(attachment.samples))
                .load_op(load_op)
                .store_op(color_store_op(info, i as u32))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(initial_layout)
                .final_layout(final_layout),
        );
    }

    if let Some(depth) = &info.depth_stencil {
        let load_op = if info.clear_depth_stencil {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };
        descriptions.push(
            vk::AttachmentDescription::default()
                .format(depth.format)
                .samples(sample_count(depth.samples))
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(load_op)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }

    descriptions
}

/// Builds one EXTERNAL → subpass dependency per subpass, gated on
/// color-attachment-output, plus early-fragment-tests when the subpass
/// writes depth/stencil. This keeps a subpass from writing an attachment
/// before a prior external access to it is visible.
pub fn build_subpass_dependencies(info: &RenderPassInfo) -> Vec<vk::SubpassDependency> {
    info.subpasses
        .iter()
        .enumerate()
        .map(|(i, subpass)| {
            let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            let mut dst_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
            if subpass.uses_depth_stencil {
                stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
                dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
            }

            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(i as u32)
                .src_stage_mask(stages)
                .dst_stage_mask(stages)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(dst_access)
        })
        .collect()
}

fn sample_count(samples: vk::SampleCountFlags) -> vk::SampleCountFlags {
    if samples.is_empty() {
        vk::SampleCountFlags::TYPE_1
    } else {
        samples
    }
}

/// Compiled, immutable render pass.
///
/// Carries a process-unique id used as the render-pass compatibility class
/// in pipeline cache keys; framebuffers refer back to the pass by this id,
/// never by ownership.
pub struct RenderPass {
    device: Arc<Device>,
    render_pass: vk::RenderPass,
    id: u64,
    color_attachment_count: u32,
    depth_format: Option<vk::Format>,
}

impl RenderPass {
    /// Validates `info` and compiles the render pass.
    pub fn new(device: Arc<Device>, info: &RenderPassInfo) -> RhiResult<Self> {
        info.validate()?;

        let descriptions = build_attachment_descriptions(info);
        let dependencies = build_subpass_dependencies(info);

        // Per-subpass reference arrays must outlive create_info.
        let depth_index = info.color_attachments.len() as u32;
        let color_refs: Vec<Vec<vk::AttachmentReference>> = info
            .subpasses
            .iter()
            .map(|subpass| {
                subpass
                    .color_attachments
                    .iter()
                    .map(|&index| {
                        vk::AttachmentReference::default()
                            .attachment(index)
                            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    })
                    .collect()
            })
            .collect();
        let depth_ref = vk::AttachmentReference::default()
            .attachment(depth_index)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let subpasses: Vec<vk::SubpassDescription> = info
            .subpasses
            .iter()
            .zip(&color_refs)
            .map(|(subpass, refs)| {
                let description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(refs);
                if subpass.uses_depth_stencil {
                    description.depth_stencil_attachment(&depth_ref)
                } else {
                    description
                }
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&descriptions)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { device.handle().create_render_pass(&create_info, None)? };
        let id = NEXT_RENDER_PASS_ID.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Created render pass #{} ({} color attachment(s), depth: {})",
            id,
            info.color_attachments.len(),
            info.depth_stencil.is_some()
        );

        Ok(Self {
            device,
            render_pass,
            id,
            color_attachment_count: info.color_attachments.len() as u32,
            depth_format: info.depth_stencil.as_ref().map(|d| d.format),
        })
    }

    /// Returns the Vulkan render pass handle.
    #[inline]
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Process-unique id; the compatibility class for pipeline keying.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of color attachments per subpass framebuffer.
    #[inline]
    pub fn color_attachment_count(&self) -> u32 {
        self.color_attachment_count
    }

    /// The depth/stencil format, when the pass has that attachment.
    #[inline]
    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth_format
    }

    /// Whether the pass carries a depth/stencil attachment.
    #[inline]
    pub fn has_depth(&self) -> bool {
        self.depth_format.is_some()
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_render_pass(self.render_pass, None);
        }
        debug!("Destroyed render pass #{}", self.id);
    }
}

/// A render pass bound to concrete attachment views.
///
/// Holds the pass by id only (the frame manager owns both); its area is the
/// minimum extent across the color attachments.
pub struct Framebuffer {
    device: Arc<Device>,
    framebuffer: vk::Framebuffer,
    render_pass_id: u64,
    width: u32,
    height: u32,
}

impl Framebuffer {
    /// Creates a framebuffer for `render_pass` over the views in `info`.
    pub fn new(
        device: Arc<Device>,
        render_pass: &RenderPass,
        info: &RenderPassInfo,
    ) -> RhiResult<Self> {
        info.validate()?;
        debug_assert!(
            !info.color_attachments.is_empty(),
            "framebuffer requires at least one color attachment"
        );

        let (width, height) = info.dimensions();

        let mut views: Vec<vk::ImageView> = info
            .color_attachments
            .iter()
            .map(|attachment| attachment.view)
            .collect();
        if let Some(depth) = &info.depth_stencil {
            views.push(depth.view);
        }

        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle())
            .attachments(&views)
            .width(width)
            .height(height)
            .layers(1);

        let framebuffer = unsafe { device.handle().create_framebuffer(&create_info, None)? };

        debug!(
            "Created framebuffer {}x{} for render pass #{}",
            width,
            height,
            render_pass.id()
        );

        Ok(Self {
            device,
            framebuffer,
            render_pass_id: render_pass.id(),
            width,
            height,
        })
    }

    /// Returns the Vulkan framebuffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Id of the render pass this framebuffer was built against.
    #[inline]
    pub fn render_pass_id(&self) -> u64 {
        self.render_pass_id
    }

    /// Framebuffer width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Framebuffer height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The full render area.
    #[inline]
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_framebuffer(self.framebuffer, None);
        }
        debug!("Destroyed framebuffer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_attachment(width: u32, height: u32, swapchain: bool) -> Attachment {
        Attachment {
            view: vk::ImageView::null(),
            format: vk::Format::B8G8R8A8_SRGB,
            width,
            height,
            samples: vk::SampleCountFlags::TYPE_1,
            swapchain_layout: swapchain.then_some(vk::ImageLayout::PRESENT_SRC_KHR),
        }
    }

    fn single_color_info() -> RenderPassInfo {
        RenderPassInfo::single_color(test_attachment(800, 600, true), [0.0, 0.0, 0.0, 1.0])
    }

    #[test]
    fn validate_accepts_single_color_pass() {
        assert!(single_color_info().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_subpass_reference() {
        let mut info = single_color_info();
        info.subpasses[0].color_attachments = vec![1];
        assert!(info.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_color_attachments() {
        let mut info = single_color_info();
        info.color_attachments.clear();
        info.clear_colors.clear();
        assert!(info.validate().is_err());
    }

    #[test]
    fn validate_rejects_depth_use_without_attachment() {
        let mut info = single_color_info();
        info.subpasses[0].uses_depth_stencil = true;
        assert!(info.validate().is_err());
    }

    #[test]
    fn load_op_follows_clear_mask() {
        let mut info = single_color_info();
        assert_eq!(color_load_op(&info, 0), vk::AttachmentLoadOp::CLEAR);

        info.clear_attachments = 0;
        assert_eq!(color_load_op(&info, 0), vk::AttachmentLoadOp::DONT_CARE);
    }

    #[test]
    fn store_op_follows_store_mask() {
        let mut info = single_color_info();
        assert_eq!(color_store_op(&info, 0), vk::AttachmentStoreOp::STORE);

        info.store_attachments = 0;
        assert_eq!(color_store_op(&info, 0), vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn cleared_single_color_pass_compiles_expected_ops() {
        // One color attachment, clear bit 0 set, one subpass over it.
        let info = single_color_info();
        let descriptions = build_attachment_descriptions(&info);

        assert_eq!(descriptions.len(), 1);
        assert_eq!(descriptions[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(descriptions[0].store_op, vk::AttachmentStoreOp::STORE);

        let dependencies = build_subpass_dependencies(&info);
        assert_eq!(dependencies.len(), 1);
        assert_eq!(dependencies[0].src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependencies[0].dst_subpass, 0);
        assert_eq!(
            dependencies[0].src_stage_mask,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            dependencies[0].dst_access_mask,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn swapchain_attachment_layouts_are_pinned_to_present() {
        let cleared = single_color_info();
        let descriptions = build_attachment_descriptions(&cleared);
        assert_eq!(descriptions[0].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            descriptions[0].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );

        let mut loaded = single_color_info();
        loaded.clear_attachments = 0;
        let descriptions = build_attachment_descriptions(&loaded);
        assert_eq!(
            descriptions[0].initial_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    fn non_swapchain_attachment_targets_color_optimal() {
        let info =
            RenderPassInfo::single_color(test_attachment(256, 256, false), [0.0; 4]);
        let descriptions = build_attachment_descriptions(&info);
        assert_eq!(
            descriptions[0].final_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn depth_subpass_gates_on_early_fragment_tests() {
        let depth = Attachment {
            format: vk::Format::D32_SFLOAT,
            ..test_attachment(800, 600, false)
        };
        let info = single_color_info().with_depth_stencil(depth);

        let descriptions = build_attachment_descriptions(&info);
        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[1].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(
            descriptions[1].final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );

        let dependencies = build_subpass_dependencies(&info);
        assert!(dependencies[0]
            .src_stage_mask
            .contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
        assert!(dependencies[0]
            .dst_access_mask
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn dimensions_take_minimum_across_attachments() {
        let mut info = single_color_info();
        info.color_attachments.push(test_attachment(640, 720, false));
        info.clear_colors.push([0.0; 4]);
        assert_eq!(info.dimensions(), (640, 600));
    }

    #[test]
    fn clear_values_cover_depth() {
        let depth = Attachment {
            format: vk::Format::D32_SFLOAT,
            ..test_attachment(800, 600, false)
        };
        let info = single_color_info().with_depth_stencil(depth);
        assert_eq!(info.clear_values().len(), 2);
    }
}
