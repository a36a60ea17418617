//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! Safe wrappers over `ash` for everything the rendering core touches:
//! - Instance, physical device selection, logical device and queues
//! - Swapchain management
//! - Synchronization primitives
//! - Command pool and raw command recording
//! - Buffers, images and image views
//! - Render passes and framebuffers
//! - Descriptor-set ring allocation with update templates
//! - Shader modules, resource layouts, pipelines and the pipeline cache

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use error::{RhiError, RhiResult};

// Re-export ash types that callers need.
pub use ash::vk;
