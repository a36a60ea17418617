//! The frame lifecycle manager.
//!
//! [`RenderCore`] owns the instance, surface, device, swapchain and
//! queues, double-buffers the synchronization primitives and drives the
//! steady-state protocol: acquire an image, hand out the image's command
//! buffer for recording, submit, present, advance the frame-in-flight
//! index. It also owns the uniform pool, the material registry and the
//! tuple-keyed pipeline store with its on-disk cache.
//!
//! Two frames may be in flight: while the GPU executes frame N, the CPU
//! records frame N+1. The two blocking waits - the current slot's fence,
//! and the fence of whichever frame last rendered to the just-acquired
//! image - are the only points bounding CPU lead; there is no other
//! serialization in the core.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use glam::Mat4;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{error, info, warn};

use ember_core::Timer;
use ember_rhi::buffer::{Buffer, BufferUsage};
use ember_rhi::command::CommandPool;
use ember_rhi::device::Device;
use ember_rhi::image::{Image, ImageInfo, ImageView};
use ember_rhi::instance::Instance;
use ember_rhi::physical_device::select_physical_device;
use ember_rhi::pipeline::PolygonMode;
use ember_rhi::render_pass::{Framebuffer, RenderPass, RenderPassInfo};
use ember_rhi::shader::{ResourceLayout, Shader, ShaderStage};
use ember_rhi::swapchain::Swapchain;
use ember_rhi::vertex::Vertex;
use ember_rhi::{RhiError, RhiResult};

use crate::command_buffer::GraphicsCommandBuffer;
use crate::frame::FrameSync;
use crate::material::{Material, MaterialRegistry};
use crate::mesh::Mesh;
use crate::pipelines::PipelineStore;
use crate::ubo::{CameraUbo, ObjectUbo, CAMERA_BINDING, FRAME_DATA_SET, OBJECT_BINDING};
use crate::uniform::{UniformBufferPool, UNIFORM_POOL_ALIGNMENT, UNIFORM_POOL_BLOCK_SIZE};
use crate::FRAMES_IN_FLIGHT;

/// Where the compiled-pipeline cache is persisted between runs.
const PIPELINE_CACHE_PATH: &str = "pipeline_cache.bin";

/// Clear color of the default pass.
const CLEAR_COLOR: [f32; 4] = [0.01, 0.01, 0.012, 1.0];

/// Depth attachment format of the default pass.
const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// A render-target image together with the view the framebuffer binds.
/// The view is declared first so it drops before its image.
struct RenderTarget {
    view: ImageView,
    _image: Arc<Image>,
}

/// Handle to one frame being recorded, returned by
/// [`RenderCore::begin_frame`] and consumed by [`RenderCore::end_frame`].
#[derive(Debug)]
pub struct RenderContext {
    frame_slot: usize,
    image_index: u32,
    delta_time: f32,
}

impl RenderContext {
    /// The frame-in-flight slot this frame occupies.
    #[inline]
    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    /// The swapchain image being rendered to.
    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Seconds since the previous `begin_frame`.
    #[inline]
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }
}

/// Device, swapchain and frame-protocol owner.
pub struct RenderCore {
    // Recording state. Field order is drop order; everything here only
    // holds the device through `Arc`, so the device outlives it all.
    command_buffers: Vec<GraphicsCommandBuffer>,
    framebuffers: Vec<Option<Framebuffer>>,
    render_pass: Option<Arc<RenderPass>>,
    depth: Option<RenderTarget>,
    backbuffers: Vec<RenderTarget>,

    materials: MaterialRegistry,
    pipelines: Arc<PipelineStore>,
    uniform_pool: Arc<UniformBufferPool>,

    frames: Vec<FrameSync>,
    /// Which frame slot last rendered to each swapchain image.
    images_in_flight: Vec<Option<usize>>,
    current_frame: usize,

    camera: CameraUbo,
    timer: Timer,
    pipeline_cache_path: PathBuf,

    command_pool: CommandPool,
    swapchain: Option<Swapchain>,
    surface: vk::SurfaceKHR,
    device: Arc<Device>,
    instance: Instance,
}

impl RenderCore {
    /// Bootstraps the whole rendering stack against the window the
    /// platform collaborator provides.
    ///
    /// Instance → surface → physical device → logical device → swapchain
    /// → backbuffers → command pool and per-image command buffers → sync
    /// objects → uniform pool → pipeline store (with the on-disk cache
    /// loaded opportunistically). Any failure is fatal to the caller;
    /// there is no degraded mode.
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> RhiResult<Self> {
        let instance = Instance::new(display_handle, cfg!(debug_assertions))?;
        let surface = instance.create_surface(display_handle, window_handle)?;

        let physical_device =
            select_physical_device(instance.handle(), surface, instance.surface_loader())?;
        let device = Device::new(&instance, &physical_device)?;

        let swapchain = Swapchain::new(&instance, device.clone(), surface, width, height)?;
        let backbuffers = Self::create_backbuffers(&device, &swapchain)?;
        let depth = Some(Self::create_depth_target(&device, swapchain.extent())?);

        let graphics_family = device.queue_families().graphics_family.unwrap_or(0);
        let command_pool = CommandPool::new(device.clone(), graphics_family)?;

        let uniform_pool = Arc::new(UniformBufferPool::new(
            device.clone(),
            UNIFORM_POOL_BLOCK_SIZE,
            UNIFORM_POOL_ALIGNMENT,
        ));

        let pipeline_cache_path = PathBuf::from(PIPELINE_CACHE_PATH);
        let pipelines = Arc::new(PipelineStore::new(device.clone(), &pipeline_cache_path)?);

        let image_count = swapchain.image_count();
        let mut command_buffers = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            command_buffers.push(GraphicsCommandBuffer::new(
                device.clone(),
                &command_pool,
                uniform_pool.clone(),
                pipelines.clone(),
            )?);
        }

        let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            frames.push(FrameSync::new(device.clone())?);
        }

        info!(
            "Render core ready: {} swapchain images, {} frames in flight",
            image_count, FRAMES_IN_FLIGHT
        );

        Ok(Self {
            command_buffers,
            framebuffers: (0..image_count).map(|_| None).collect(),
            render_pass: None,
            depth,
            backbuffers,
            materials: MaterialRegistry::new(),
            pipelines,
            uniform_pool,
            frames,
            images_in_flight: vec![None; image_count],
            current_frame: 0,
            camera: CameraUbo::default(),
            timer: Timer::new(),
            pipeline_cache_path,
            command_pool,
            swapchain: Some(swapchain),
            surface,
            device,
            instance,
        })
    }

    /// Begins a frame: waits on the current slot's fence, acquires the
    /// next swapchain image (recreating the swapchain when it is out of
    /// date), waits for whichever frame last targeted that image, then
    /// opens the image's command buffer inside the default render pass
    /// with a full-extent viewport and scissor.
    pub fn begin_frame(&mut self) -> RhiResult<RenderContext> {
        let delta_time = self.timer.delta_secs();

        self.frames[self.current_frame].in_flight().wait(u64::MAX)?;

        let (image_index, _suboptimal) = self.acquire_image()?;
        let image_index_usize = image_index as usize;

        // The presentation engine can hand images back out of ring order;
        // if another slot still has this image in flight, wait it out.
        if let Some(slot) = self.images_in_flight[image_index_usize] {
            self.frames[slot].in_flight().wait(u64::MAX)?;
        }
        self.images_in_flight[image_index_usize] = Some(self.current_frame);

        self.ensure_render_pass()?;
        self.ensure_framebuffer(image_index_usize)?;

        let info = self.render_pass_info(image_index_usize);
        let render_pass = self
            .render_pass
            .clone()
            .ok_or_else(|| RhiError::InvalidUsage("render pass unavailable".to_string()))?;
        let extent = self.extent()?;

        let framebuffer = self.framebuffers[image_index_usize]
            .as_ref()
            .ok_or_else(|| RhiError::InvalidUsage("framebuffer unavailable".to_string()))?;
        let cmd = &mut self.command_buffers[image_index_usize];
        cmd.begin()?;
        cmd.begin_render_pass(render_pass, framebuffer, &info);

        cmd.set_viewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        cmd.set_scissor(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        });

        Ok(RenderContext {
            frame_slot: self.current_frame,
            image_index,
            delta_time,
        })
    }

    /// Sets the camera matrices used by subsequent [`Self::draw_mesh`]
    /// calls this frame.
    pub fn set_camera(&mut self, view: Mat4, projection: Mat4) {
        self.camera = CameraUbo::new(view, projection);
    }

    /// Records one mesh submission: binds the mesh's material and
    /// buffers, uploads the camera and object uniform blocks through the
    /// frame pool, and issues the indexed draw.
    pub fn draw_mesh(
        &mut self,
        context: &RenderContext,
        mesh: &Mesh,
        transform: &Mat4,
    ) -> RhiResult<()> {
        let camera = self.camera;
        let object = ObjectUbo::new(*transform);

        let cmd = &mut self.command_buffers[context.image_index as usize];
        cmd.bind_material(mesh.material().clone());
        cmd.bind_vertex_buffer(mesh.vertex_buffer());
        cmd.bind_index_buffer(mesh.index_buffer(), mesh.index_type());
        cmd.allocate_uniform_buffer(FRAME_DATA_SET, CAMERA_BINDING, bytemuck::bytes_of(&camera))?;
        cmd.allocate_uniform_buffer(FRAME_DATA_SET, OBJECT_BINDING, bytemuck::bytes_of(&object))?;
        cmd.draw_indexed(mesh.index_count())
    }

    /// Toggles wireframe rasterization for subsequent draws this frame.
    pub fn set_wireframe(&mut self, context: &RenderContext, enabled: bool) {
        let mode = if enabled {
            PolygonMode::Line
        } else {
            PolygonMode::Fill
        };
        self.command_buffers[context.image_index as usize].set_polygon_mode(mode);
    }

    /// Direct access to the frame's command buffer, for callers recording
    /// beyond the mesh-submission path.
    pub fn command_buffer_mut(&mut self, context: &RenderContext) -> &mut GraphicsCommandBuffer {
        &mut self.command_buffers[context.image_index as usize]
    }

    /// Ends the frame: closes the render pass and recording, submits with
    /// the slot's semaphores (acquire semaphore waited at
    /// color-attachment-output, release semaphore signaled, the slot
    /// fence reset immediately before the submit that signals it), then
    /// presents and advances the frame index.
    ///
    /// Returns `true` when the swapchain reported it should be recreated;
    /// the caller follows up with [`Self::resize`].
    pub fn end_frame(&mut self, context: RenderContext) -> RhiResult<bool> {
        let image_index = context.image_index as usize;

        {
            let cmd = &mut self.command_buffers[image_index];
            cmd.end_render_pass();
            cmd.end()?;
        }

        let frame = &self.frames[context.frame_slot];
        let wait_semaphores = [frame.image_available().handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffers[image_index].handle()];
        let signal_semaphores = [frame.render_finished().handle()];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        frame.in_flight().reset()?;
        unsafe {
            self.device
                .submit_graphics(&[submit_info], frame.in_flight().handle())?;
        }

        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| RhiError::Swapchain("swapchain unavailable".to_string()))?;
        let needs_resize = match swapchain.present(
            self.device.present_queue(),
            context.image_index,
            frame.render_finished().handle(),
        ) {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => true,
            Err(e) => return Err(e.into()),
        };

        self.current_frame = (self.current_frame + 1) % FRAMES_IN_FLIGHT;
        Ok(needs_resize)
    }

    /// Rebuilds the swapchain and everything derived from it for a new
    /// surface size: backbuffer wrappers, the depth target, per-image
    /// command buffers and the cached framebuffers (the render pass is
    /// rebuilt lazily in case the surface format changed).
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.device.wait_idle()?;

        // Views over swapchain images must go before the images do.
        self.framebuffers.clear();
        self.render_pass = None;
        self.backbuffers.clear();

        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| RhiError::Swapchain("swapchain unavailable".to_string()))?;
        swapchain.recreate(&self.instance, self.surface, width, height)?;

        self.backbuffers = Self::create_backbuffers(&self.device, swapchain)?;
        self.depth = Some(Self::create_depth_target(&self.device, swapchain.extent())?);

        let image_count = swapchain.image_count();
        if image_count != self.command_buffers.len() {
            self.command_buffers.clear();
            for _ in 0..image_count {
                self.command_buffers.push(GraphicsCommandBuffer::new(
                    self.device.clone(),
                    &self.command_pool,
                    self.uniform_pool.clone(),
                    self.pipelines.clone(),
                )?);
            }
        }

        self.framebuffers = (0..image_count).map(|_| None).collect();
        self.images_in_flight = vec![None; image_count];

        info!("Render targets rebuilt at {}x{}", width, height);
        Ok(())
    }

    /// Blocks until the GPU finishes all submitted work.
    pub fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }

    /// The current swapchain extent.
    pub fn extent(&self) -> RhiResult<vk::Extent2D> {
        self.swapchain
            .as_ref()
            .map(|swapchain| swapchain.extent())
            .ok_or_else(|| RhiError::Swapchain("swapchain unavailable".to_string()))
    }

    /// The shared logical device.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    // =======================================================================
    // Asset factories
    // =======================================================================

    /// Creates a vertex buffer from mesh vertices.
    pub fn create_vertex_buffer(&self, vertices: &[Vertex]) -> RhiResult<Arc<Buffer>> {
        Ok(Arc::new(Buffer::new_with_data(
            self.device.clone(),
            BufferUsage::Vertex,
            bytemuck::cast_slice(vertices),
        )?))
    }

    /// Creates an index buffer from 32-bit indices.
    pub fn create_index_buffer(&self, indices: &[u32]) -> RhiResult<Arc<Buffer>> {
        Ok(Arc::new(Buffer::new_with_data(
            self.device.clone(),
            BufferUsage::Index,
            bytemuck::cast_slice(indices),
        )?))
    }

    /// Creates a standalone uniform buffer, for externally managed
    /// descriptor sets.
    pub fn create_uniform_buffer(&self, data: &[u8]) -> RhiResult<Arc<Buffer>> {
        Ok(Arc::new(Buffer::new_with_data(
            self.device.clone(),
            BufferUsage::Uniform,
            data,
        )?))
    }

    /// Builds a material from two precompiled shader stages and their
    /// extracted resource layouts.
    pub fn create_material(
        &self,
        vertex_spirv: &[u8],
        vertex_layout: ResourceLayout,
        fragment_spirv: &[u8],
        fragment_layout: ResourceLayout,
    ) -> RhiResult<Arc<Material>> {
        let vertex = Shader::from_spirv_bytes(
            self.device.clone(),
            vertex_spirv,
            ShaderStage::Vertex,
            vertex_layout,
        )?;
        let fragment = Shader::from_spirv_bytes(
            self.device.clone(),
            fragment_spirv,
            ShaderStage::Fragment,
            fragment_layout,
        )?;
        Material::new(self.device.clone(), vertex, fragment)
    }

    /// Creates a mesh from vertex and index data.
    pub fn create_mesh(
        &self,
        vertices: &[Vertex],
        indices: &[u32],
        material: Arc<Material>,
    ) -> RhiResult<Mesh> {
        let vertex_buffer = self.create_vertex_buffer(vertices)?;
        let index_buffer = self.create_index_buffer(indices)?;
        Ok(Mesh::new(
            vertex_buffer,
            index_buffer,
            indices.len() as u32,
            material,
        ))
    }

    /// Registers a material in the engine-owned registry.
    pub fn register_material(&mut self, name: impl Into<String>, material: Arc<Material>) {
        self.materials.register(name, material);
    }

    /// Looks up a registered material.
    pub fn material(&self, name: &str) -> Option<&Arc<Material>> {
        self.materials.get(name)
    }

    // =======================================================================
    // Internals
    // =======================================================================

    fn acquire_image(&mut self) -> RhiResult<(u32, bool)> {
        let semaphore = self.frames[self.current_frame].image_available().handle();

        let result = {
            let swapchain = self
                .swapchain
                .as_ref()
                .ok_or_else(|| RhiError::Swapchain("swapchain unavailable".to_string()))?;
            swapchain.acquire_next_image(semaphore)
        };

        match result {
            Ok(pair) => Ok(pair),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                let extent = self.extent()?;
                self.resize(extent.width, extent.height)?;

                let semaphore = self.frames[self.current_frame].image_available().handle();
                let swapchain = self
                    .swapchain
                    .as_ref()
                    .ok_or_else(|| RhiError::Swapchain("swapchain unavailable".to_string()))?;
                swapchain
                    .acquire_next_image(semaphore)
                    .map_err(RhiError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The default pass description for one swapchain image.
    fn render_pass_info(&self, image_index: usize) -> RenderPassInfo {
        let mut info = RenderPassInfo::single_color(
            self.backbuffers[image_index].view.attachment(),
            CLEAR_COLOR,
        );
        if let Some(depth) = &self.depth {
            info = info.with_depth_stencil(depth.view.attachment());
        }
        info
    }

    /// Compiles the default render pass on first use.
    fn ensure_render_pass(&mut self) -> RhiResult<()> {
        if self.render_pass.is_none() {
            let info = self.render_pass_info(0);
            self.render_pass = Some(Arc::new(RenderPass::new(self.device.clone(), &info)?));
        }
        Ok(())
    }

    /// Builds the image's framebuffer on first use after (re)creation.
    fn ensure_framebuffer(&mut self, image_index: usize) -> RhiResult<()> {
        if self.framebuffers[image_index].is_none() {
            let render_pass = self
                .render_pass
                .as_ref()
                .ok_or_else(|| RhiError::InvalidUsage("render pass unavailable".to_string()))?;
            let info = self.render_pass_info(image_index);
            self.framebuffers[image_index] = Some(Framebuffer::new(
                self.device.clone(),
                render_pass,
                &info,
            )?);
        }
        Ok(())
    }

    fn create_backbuffers(
        device: &Arc<Device>,
        swapchain: &Swapchain,
    ) -> RhiResult<Vec<RenderTarget>> {
        let extent = swapchain.extent();
        let info = ImageInfo::render_target(extent.width, extent.height, swapchain.format());

        swapchain
            .images()
            .iter()
            .map(|&raw| {
                let image = Arc::new(Image::from_swapchain(
                    device.clone(),
                    raw,
                    info,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                ));
                let view = image.create_view()?;
                Ok(RenderTarget {
                    view,
                    _image: image,
                })
            })
            .collect()
    }

    fn create_depth_target(
        device: &Arc<Device>,
        extent: vk::Extent2D,
    ) -> RhiResult<RenderTarget> {
        let image = Arc::new(Image::new(
            device.clone(),
            ImageInfo::depth_stencil(extent.width, extent.height, DEPTH_FORMAT),
        )?);
        let view = image.create_view()?;
        Ok(RenderTarget {
            view,
            _image: image,
        })
    }
}

impl Drop for RenderCore {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Device idle wait failed during shutdown: {}", e);
        }

        if let Err(e) = self.pipelines.save(&self.pipeline_cache_path) {
            warn!("Pipeline cache not saved: {}", e);
        }

        // Views over swapchain images must be destroyed before the
        // swapchain, and the swapchain before its surface.
        self.framebuffers.clear();
        self.render_pass = None;
        self.depth = None;
        self.backbuffers.clear();
        self.swapchain = None;
        unsafe {
            self.instance.destroy_surface(self.surface);
        }

        info!("Render core shut down");
    }
}
