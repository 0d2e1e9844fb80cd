// Backend module - Vulkan bring-up and the triangle's present loop
//
// `stage` orders the bring-up, `context` owns what each stage creates, and
// `renderer` drives both plus the per-frame work. The rest are the pieces
// each stage is built from.

pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod stage;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use context::RendererSettings;
pub use renderer::{FrameStatus, Renderer};
pub use stage::VkStage;
