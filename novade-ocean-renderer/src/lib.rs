//! Vulkan resource and frame-synchronization layer for NovaDE's ocean view,
//! plus the wave simulation that feeds it.
//!
//! [`context::RenderContext`] owns the device, swapchain and frame slots.
//! [`water::WaterRenderer`] draws the water surface and streams textures from
//! the wave tanks in [`wave`], which step on background threads between frames.

pub mod allocator;
pub mod buffer_utils;
pub mod config;
pub mod context;
pub mod descriptor_pool;
pub mod device;
pub mod error;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod pipeline_cache;
pub mod program;
pub mod render_pass;
pub mod shader;
pub mod surface_swapchain;
pub mod sync_primitives;
pub mod texture;
pub mod water;
pub mod wave;

#[cfg(test)]
mod testing;

pub use config::{RendererConfig, WaterConfig, WaveQuality, WaveSolver};
pub use context::{FrameContext, RenderContext};
pub use error::{Result, VulkanError};
pub use water::streaming::{UploadReport, UploadSink, WaterSource};
pub use water::uniforms::SceneDefinition;
pub use water::{WaterFrameInputs, WaterRenderer, WaterState};
