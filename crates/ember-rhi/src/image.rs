//! Images and image views.
//!
//! An [`Image`] owns GPU pixel storage plus its format/dimension metadata;
//! an [`ImageView`] is a typed, range-scoped projection of one image used as
//! a framebuffer attachment. Swapchain images are the special case: their
//! storage is borrowed from the presentation engine and they carry the
//! final present layout as a tag instead of being application-created.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Static description of an image.
#[derive(Clone, Copy, Debug)]
pub struct ImageInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: vk::Format,
    /// Sample count (1 for everything this core renders).
    pub samples: vk::SampleCountFlags,
    /// Usage flags the image was created with.
    pub usage: vk::ImageUsageFlags,
}

impl ImageInfo {
    /// Description for a color render target.
    pub fn render_target(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        }
    }

    /// Description for a depth/stencil attachment.
    pub fn depth_stencil(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        }
    }
}

/// Returns the aspect mask implied by a format.
pub fn format_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Whether a format carries a depth aspect.
pub fn format_has_depth(format: vk::Format) -> bool {
    format_aspect_mask(format).contains(vk::ImageAspectFlags::DEPTH)
}

/// GPU image.
///
/// Application-created images own their storage through gpu-allocator.
/// Swapchain-backed images are borrowed: the presentation engine owns the
/// storage and the wrapper only carries metadata plus the present layout.
pub struct Image {
    device: Arc<Device>,
    image: vk::Image,
    allocation: Option<Allocation>,
    info: ImageInfo,
    /// Final layout for presentation; set only on swapchain-backed images.
    swapchain_layout: Option<vk::ImageLayout>,
}

impl Image {
    /// Creates an application-owned image (e.g. a depth attachment) in
    /// device-local memory.
    pub fn new(device: Arc<Device>, info: ImageInfo) -> RhiResult<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(info.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&create_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = {
            let mut allocator = device
                .allocator()
                .lock()
                .map_err(|_| RhiError::InvalidUsage("allocator mutex poisoned".to_string()))?;
            allocator.allocate(&AllocationCreateDesc {
                name: "image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?
        };

        unsafe {
            device
                .handle()
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        debug!(
            "Created image {}x{} ({:?})",
            info.width, info.height, info.format
        );

        Ok(Self {
            device,
            image,
            allocation: Some(allocation),
            info,
            swapchain_layout: None,
        })
    }

    /// Wraps a swapchain image borrowed from the presentation engine.
    ///
    /// The wrapper does not destroy the image; the swapchain owns it.
    /// `present_layout` is the layout the image must be in when presented.
    pub fn from_swapchain(
        device: Arc<Device>,
        image: vk::Image,
        info: ImageInfo,
        present_layout: vk::ImageLayout,
    ) -> Self {
        Self {
            device,
            image,
            allocation: None,
            info,
            swapchain_layout: Some(present_layout),
        }
    }

    /// Returns the Vulkan image handle.
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Returns the image description.
    #[inline]
    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.info.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.info.height
    }

    /// Whether this image is borrowed from the swapchain.
    #[inline]
    pub fn is_swapchain_image(&self) -> bool {
        self.swapchain_layout.is_some()
    }

    /// The final present layout for swapchain-backed images.
    #[inline]
    pub fn swapchain_layout(&self) -> Option<vk::ImageLayout> {
        self.swapchain_layout
    }

    /// Creates a 2D view covering the whole image.
    pub fn create_view(&self) -> RhiResult<ImageView> {
        ImageView::new(self.device.clone(), self, ImageViewInfo::full_2d(&self.info))
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Ok(mut allocator) = self.device.allocator().lock() {
                if let Err(e) = allocator.free(allocation) {
                    tracing::error!("Failed to free image allocation: {:?}", e);
                }
            }
            unsafe {
                self.device.handle().destroy_image(self.image, None);
            }
            debug!("Destroyed image");
        }
        // Swapchain-backed images are borrowed and not destroyed here.
    }
}

/// Range and type selection for an image view.
#[derive(Clone, Copy, Debug)]
pub struct ImageViewInfo {
    /// View format, normally the image's own.
    pub format: vk::Format,
    /// First mip level visible through the view.
    pub base_mip_level: u32,
    /// Number of mip levels.
    pub level_count: u32,
    /// First array layer visible through the view.
    pub base_array_layer: u32,
    /// Number of array layers.
    pub layer_count: u32,
    /// View dimensionality.
    pub view_type: vk::ImageViewType,
}

impl ImageViewInfo {
    /// A 2D view of the whole image.
    pub fn full_2d(info: &ImageInfo) -> Self {
        Self {
            format: info.format,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
            view_type: vk::ImageViewType::TYPE_2D,
        }
    }
}

/// Typed, range-scoped projection of one image.
///
/// Views are owned by whoever caches the framebuffer they are attached to;
/// the underlying image must outlive the view.
pub struct ImageView {
    device: Arc<Device>,
    view: vk::ImageView,
    info: ImageViewInfo,
    /// Dimensions and tags copied from the image for attachment descriptors.
    width: u32,
    height: u32,
    samples: vk::SampleCountFlags,
    swapchain_layout: Option<vk::ImageLayout>,
}

impl ImageView {
    /// Creates a view of `image` with the given range selection.
    pub fn new(device: Arc<Device>, image: &Image, info: ImageViewInfo) -> RhiResult<Self> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image.handle())
            .view_type(info.view_type)
            .format(info.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(format_aspect_mask(info.format))
                    .base_mip_level(info.base_mip_level)
                    .level_count(info.level_count)
                    .base_array_layer(info.base_array_layer)
                    .layer_count(info.layer_count),
            );

        let view = unsafe { device.handle().create_image_view(&create_info, None)? };
        debug!("Created image view ({:?})", info.format);

        Ok(Self {
            device,
            view,
            info,
            width: image.width(),
            height: image.height(),
            samples: image.info().samples,
            swapchain_layout: image.swapchain_layout(),
        })
    }

    /// Returns the Vulkan image view handle.
    #[inline]
    pub fn handle(&self) -> vk::ImageView {
        self.view
    }

    /// Returns the view description.
    #[inline]
    pub fn info(&self) -> &ImageViewInfo {
        &self.info
    }

    /// Width of the viewed image in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height of the viewed image in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Produces the plain attachment descriptor render passes and
    /// framebuffers consume. The descriptor borrows nothing; the caller
    /// keeps the view alive for as long as the attachment is in use.
    pub fn attachment(&self) -> Attachment {
        Attachment {
            view: self.view,
            format: self.info.format,
            width: self.width,
            height: self.height,
            samples: self.samples,
            swapchain_layout: self.swapchain_layout,
        }
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_image_view(self.view, None);
        }
        debug!("Destroyed image view");
    }
}

/// Plain-data attachment descriptor: everything render-pass and framebuffer
/// construction needs to know about one attachment, with no ownership.
#[derive(Clone, Copy, Debug)]
pub struct Attachment {
    /// The raw view handle bound into the framebuffer.
    pub view: vk::ImageView,
    /// Attachment format.
    pub format: vk::Format,
    /// Width of the backing image in pixels.
    pub width: u32,
    /// Height of the backing image in pixels.
    pub height: u32,
    /// Sample count.
    pub samples: vk::SampleCountFlags,
    /// Present layout tag for swapchain-backed attachments.
    pub swapchain_layout: Option<vk::ImageLayout>,
}

impl Attachment {
    /// Whether the attachment is backed by a swapchain image.
    #[inline]
    pub fn is_swapchain(&self) -> bool {
        self.swapchain_layout.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_mask_for_color_and_depth() {
        assert_eq!(
            format_aspect_mask(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert!(format_aspect_mask(vk::Format::D24_UNORM_S8_UINT)
            .contains(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL));
    }

    #[test]
    fn depth_format_detection() {
        assert!(format_has_depth(vk::Format::D32_SFLOAT));
        assert!(format_has_depth(vk::Format::D24_UNORM_S8_UINT));
        assert!(!format_has_depth(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn attachment_swapchain_tag() {
        let tagged = Attachment {
            view: vk::ImageView::null(),
            format: vk::Format::B8G8R8A8_SRGB,
            width: 640,
            height: 480,
            samples: vk::SampleCountFlags::TYPE_1,
            swapchain_layout: Some(vk::ImageLayout::PRESENT_SRC_KHR),
        };
        assert!(tagged.is_swapchain());

        let untagged = Attachment {
            swapchain_layout: None,
            ..tagged
        };
        assert!(!untagged.is_swapchain());
    }
}
