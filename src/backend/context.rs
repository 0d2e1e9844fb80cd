// Vulkan context - owns the objects of every stage
//
// Each stage's objects live in their own field and are created/destroyed by
// `StageResources`, which the sequencer drives in dependency order. Nothing
// here decides *when* a stage exists; accessors fail if asked for a stage
// that has not been created.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;
use winit::window::Window;

use super::buffer::{create_device_local_buffer, Buffer};
use super::command::{create_command_buffers, create_command_pool, DrawInfo};
use super::device::{create_instance, pick_physical_device, DebugMessenger, LogicalDevice, PhysicalDevice};
use super::pipeline::{create_framebuffers, create_render_pass, destroy_framebuffers, GraphicsPipeline};
use super::stage::{StageResources, VkStage};
use super::swapchain::{create_image_views, destroy_image_views, Swapchain};
use super::sync::FrameRing;
use super::vertex::TRIANGLE_VERTICES;

/// Renderer knobs, resolved from the config file
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub app_name: String,
    pub enable_validation: bool,
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub final_stage: VkStage,
}

/// Disjoint borrows of the context used while drawing a frame
pub struct FrameParts<'a> {
    pub device: &'a LogicalDevice,
    pub swapchain: &'a Swapchain,
    pub command_buffers: &'a [vk::CommandBuffer],
    pub frames: &'a mut FrameRing,
}

pub struct VulkanContext {
    settings: RendererSettings,
    window: Arc<Window>,
    entry: Entry,

    instance: Option<ash::Instance>,
    debug_messenger: Option<DebugMessenger>,
    surface_loader: Option<khr::Surface>,
    surface: Option<vk::SurfaceKHR>,
    physical_device: Option<PhysicalDevice>,
    device: Option<LogicalDevice>,
    swapchain: Option<Swapchain>,
    image_views: Vec<vk::ImageView>,
    render_pass: Option<vk::RenderPass>,
    pipeline: Option<GraphicsPipeline>,
    framebuffers: Vec<vk::Framebuffer>,
    command_pool: Option<vk::CommandPool>,
    vertex_buffer: Option<Buffer>,
    command_buffers: Vec<vk::CommandBuffer>,
    frames: Option<FrameRing>,
}

impl VulkanContext {
    pub fn new(window: Arc<Window>, settings: RendererSettings) -> Result<Self> {
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        Ok(Self {
            settings,
            window,
            entry,
            instance: None,
            debug_messenger: None,
            surface_loader: None,
            surface: None,
            physical_device: None,
            device: None,
            swapchain: None,
            image_views: Vec::new(),
            render_pass: None,
            pipeline: None,
            framebuffers: Vec::new(),
            command_pool: None,
            vertex_buffer: None,
            command_buffers: Vec::new(),
            frames: None,
        })
    }

    /// Current framebuffer size of the window, zero when minimized
    pub fn window_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    pub fn instance(&self) -> Result<&ash::Instance> {
        self.instance.as_ref().context("Instance not created")
    }

    fn surface_loader(&self) -> Result<&khr::Surface> {
        self.surface_loader.as_ref().context("Surface not created")
    }

    fn surface(&self) -> Result<vk::SurfaceKHR> {
        self.surface.context("Surface not created")
    }

    pub fn physical_device(&self) -> Result<&PhysicalDevice> {
        self.physical_device
            .as_ref()
            .context("Physical device not selected")
    }

    pub fn device(&self) -> Result<&LogicalDevice> {
        self.device.as_ref().context("Logical device not created")
    }

    pub fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swap chain not created")
    }

    fn render_pass(&self) -> Result<vk::RenderPass> {
        self.render_pass.context("Render pass not created")
    }

    fn pipeline(&self) -> Result<GraphicsPipeline> {
        self.pipeline.context("Graphics pipeline not created")
    }

    fn command_pool(&self) -> Result<vk::CommandPool> {
        self.command_pool.context("Command pool not created")
    }

    fn vertex_buffer(&self) -> Result<Buffer> {
        self.vertex_buffer.context("Vertex buffer not created")
    }

    /// Borrow everything the present loop touches at once
    pub fn frame_parts(&mut self) -> Result<FrameParts<'_>> {
        Ok(FrameParts {
            device: self.device.as_ref().context("Logical device not created")?,
            swapchain: self.swapchain.as_ref().context("Swap chain not created")?,
            command_buffers: &self.command_buffers,
            frames: self.frames.as_mut().context("Sync objects not created")?,
        })
    }

    pub fn frames_mut(&mut self) -> Result<&mut FrameRing> {
        self.frames.as_mut().context("Sync objects not created")
    }

    fn create_surface(&self) -> Result<(khr::Surface, vk::SurfaceKHR)> {
        let instance = self.instance()?;
        let loader = khr::Surface::new(&self.entry, instance);

        let surface = unsafe {
            ash_window::create_surface(
                &self.entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        Ok((loader, surface))
    }
}

impl StageResources for VulkanContext {
    fn create_stage(&mut self, stage: VkStage) -> Result<()> {
        match stage {
            VkStage::Instance => {
                let instance = create_instance(
                    &self.entry,
                    &self.settings.app_name,
                    self.window.raw_display_handle(),
                    self.settings.enable_validation,
                )?;
                self.instance = Some(instance);
            }
            VkStage::DebugMessenger => {
                if self.settings.enable_validation {
                    let messenger = DebugMessenger::new(&self.entry, self.instance()?)?;
                    self.debug_messenger = Some(messenger);
                }
            }
            VkStage::Surface => {
                let (loader, surface) = self.create_surface()?;
                self.surface_loader = Some(loader);
                self.surface = Some(surface);
            }
            VkStage::PhysicalDevice => {
                let physical =
                    pick_physical_device(self.instance()?, self.surface_loader()?, self.surface()?)?;
                self.physical_device = Some(physical);
            }
            VkStage::LogicalDevice => {
                let device = LogicalDevice::new(
                    self.instance()?,
                    self.physical_device()?,
                    self.settings.enable_validation,
                )?;
                self.device = Some(device);
            }
            VkStage::SwapChain => {
                let swapchain = Swapchain::new(
                    self.instance()?,
                    self.device()?,
                    self.physical_device()?,
                    self.surface_loader()?,
                    self.surface()?,
                    self.window_size(),
                    self.settings.present_mode,
                )?;
                self.swapchain = Some(swapchain);
            }
            VkStage::ImageViews => {
                let swapchain = self.swapchain()?;
                let views =
                    create_image_views(&self.device()?.device, &swapchain.images, swapchain.format)?;
                self.image_views = views;
            }
            VkStage::RenderPass => {
                let render_pass =
                    create_render_pass(&self.device()?.device, self.swapchain()?.format)?;
                self.render_pass = Some(render_pass);
            }
            VkStage::GraphicsPipeline => {
                let pipeline = GraphicsPipeline::new(
                    &self.device()?.device,
                    self.render_pass()?,
                    self.swapchain()?.extent,
                    &self.settings.vertex_shader,
                    &self.settings.fragment_shader,
                )?;
                self.pipeline = Some(pipeline);
            }
            VkStage::Framebuffers => {
                let framebuffers = create_framebuffers(
                    &self.device()?.device,
                    &self.image_views,
                    self.render_pass()?,
                    self.swapchain()?.extent,
                )?;
                self.framebuffers = framebuffers;
            }
            VkStage::CommandPool => {
                let family = self.physical_device()?.queue_families.graphics_family()?;
                let pool = create_command_pool(&self.device()?.device, family)?;
                self.command_pool = Some(pool);
            }
            VkStage::VertexBuffer => {
                let device = self.device()?;
                let buffer = create_device_local_buffer(
                    &device.device,
                    &self.physical_device()?.memory_properties,
                    self.command_pool()?,
                    device.graphics_queue,
                    vk::BufferUsageFlags::VERTEX_BUFFER,
                    &TRIANGLE_VERTICES,
                )?;
                self.vertex_buffer = Some(buffer);
            }
            VkStage::CommandBuffers => {
                let draw = DrawInfo {
                    render_pass: self.render_pass()?,
                    pipeline: self.pipeline()?.pipeline,
                    extent: self.swapchain()?.extent,
                    vertex_buffer: self.vertex_buffer()?.handle,
                    vertex_count: TRIANGLE_VERTICES.len() as u32,
                    clear_color: self.settings.clear_color,
                };
                let command_buffers = create_command_buffers(
                    &self.device()?.device,
                    self.command_pool()?,
                    &self.framebuffers,
                    &draw,
                )?;
                self.command_buffers = command_buffers;
            }
            VkStage::SyncObjects => {
                let frames = FrameRing::new(
                    &self.device()?.device,
                    self.settings.max_frames_in_flight,
                    self.swapchain()?.images.len(),
                )?;
                self.frames = Some(frames);
            }
        }

        Ok(())
    }

    fn destroy_stage(&mut self, stage: VkStage) {
        // Instance-level stages are destroyed after the device is gone
        match stage {
            VkStage::Instance => {
                if let Some(instance) = self.instance.take() {
                    unsafe { instance.destroy_instance(None) };
                }
                return;
            }
            VkStage::DebugMessenger => {
                if let Some(messenger) = self.debug_messenger.take() {
                    messenger.destroy();
                }
                return;
            }
            VkStage::Surface => {
                if let (Some(loader), Some(surface)) =
                    (self.surface_loader.take(), self.surface.take())
                {
                    unsafe { loader.destroy_surface(surface, None) };
                }
                return;
            }
            // Owned by the instance, nothing to destroy
            VkStage::PhysicalDevice => {
                self.physical_device = None;
                return;
            }
            VkStage::LogicalDevice => {
                if let Some(device) = self.device.take() {
                    device.destroy();
                }
                return;
            }
            _ => {}
        }

        let Some(device) = self.device.as_ref() else {
            log::warn!("Cannot destroy {} without a logical device", stage);
            return;
        };
        let device = &device.device;

        match stage {
            VkStage::SwapChain => {
                if let Some(swapchain) = self.swapchain.take() {
                    swapchain.destroy();
                }
            }
            VkStage::ImageViews => {
                destroy_image_views(device, &self.image_views);
                self.image_views.clear();
            }
            VkStage::RenderPass => {
                if let Some(render_pass) = self.render_pass.take() {
                    unsafe { device.destroy_render_pass(render_pass, None) };
                }
            }
            VkStage::GraphicsPipeline => {
                if let Some(pipeline) = self.pipeline.take() {
                    pipeline.destroy(device);
                }
            }
            VkStage::Framebuffers => {
                destroy_framebuffers(device, &self.framebuffers);
                self.framebuffers.clear();
            }
            VkStage::CommandPool => {
                // Also frees any command buffers still allocated from it
                if let Some(pool) = self.command_pool.take() {
                    unsafe { device.destroy_command_pool(pool, None) };
                }
            }
            VkStage::VertexBuffer => {
                if let Some(buffer) = self.vertex_buffer.take() {
                    buffer.destroy(device);
                }
            }
            VkStage::CommandBuffers => {
                if let (Some(pool), false) = (self.command_pool, self.command_buffers.is_empty()) {
                    unsafe { device.free_command_buffers(pool, &self.command_buffers) };
                }
                self.command_buffers.clear();
            }
            VkStage::SyncObjects => {
                if let Some(frames) = self.frames.take() {
                    frames.destroy(device);
                }
            }
            VkStage::Instance
            | VkStage::DebugMessenger
            | VkStage::Surface
            | VkStage::PhysicalDevice
            | VkStage::LogicalDevice => {}
        }
    }
}
