//! Error type and `Result` alias shared by every module of the renderer.
//!
//! Errors fall into three groups. Initialization and per-call failures are
//! returned to the caller as-is. Swapchain staleness (`SwapchainOutOfDate`) is
//! recoverable and handled by the presentation layer. Cache and reflection
//! problems never surface as errors at all; they are logged where they happen.

use ash::vk;
use thiserror::Error;

/// Error type for the Vulkan renderer and the wave simulation feeding it.
#[derive(Debug, Error)]
pub enum VulkanError {
    /// An error originating directly from a Vulkan API call.
    #[error("Vulkan API error: {0}")]
    VkResult(vk::Result),

    /// Vulkan entry points could not be loaded (no loader on this system).
    #[error("Failed to load Vulkan entry points: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// An error reported by the GPU memory allocator.
    #[error("GPU memory allocator error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// A standard I/O error (shader files, pipeline cache, config).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("Failed to parse renderer configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration parsed but holds an unusable value.
    #[error("Invalid renderer configuration: {0}")]
    Config(String),

    /// A failure during the one-time setup of a component.
    #[error("Initialization error: {0}")]
    InitializationError(String),

    /// A specific Vulkan resource could not be created.
    #[error("Failed to create resource '{resource_type}': {message}")]
    ResourceCreationError {
        /// Kind of resource, e.g. "Buffer" or "DescriptorSetLayout".
        resource_type: String,
        /// Cause of the failure.
        message: String,
    },

    /// A required instance or device extension is not available.
    #[error("Missing required Vulkan extension: {0}")]
    MissingExtension(String),

    /// No physical device satisfies the renderer's requirements.
    #[error("No suitable physical device found")]
    NoSuitablePhysicalDevice,

    /// A required queue family is missing on the selected device.
    #[error("Required queue family not found: {0}")]
    QueueFamilyNotFound(String),

    /// The presentation surface was lost.
    #[error("Vulkan surface lost")]
    SurfaceLost,

    /// The swapchain no longer matches the surface and must be rebuilt.
    #[error("Vulkan swapchain is out of date and needs recreation")]
    SwapchainOutOfDate,

    /// A format needed by the renderer is not supported by the device.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A shader could not be loaded, compiled or turned into a module.
    #[error("Shader loading error: {0}")]
    ShaderLoadingError(String),

    /// A program descriptor or shader attachment was rejected, or linking failed.
    #[error("Program link error: {0}")]
    ProgramLinkError(String),

    /// A pipeline was requested from a program that has not been linked.
    #[error("Program '{0}' is not linked")]
    ProgramNotLinked(String),

    /// Pipeline configuration was incomplete, or the driver rejected it.
    #[error("Pipeline creation error: {0}")]
    PipelineCreationError(String),

    /// The descriptor pool has no room left for another set.
    #[error("Descriptor pool exhausted ({allocated}/{capacity} sets in use)")]
    DescriptorPoolExhausted {
        /// Sets currently allocated from the pool.
        allocated: u32,
        /// Total number of sets the pool was sized for.
        capacity: u32,
    },

    /// Attempted to map an allocation that lives in device-local memory.
    #[error("Allocation '{0}' is not host visible and cannot be mapped")]
    MemoryNotHostVisible(String),

    /// A wave simulation worker terminated without handing its state back.
    #[error("Wave simulation task failed: {0}")]
    WaveTaskFailed(String),
}

impl From<vk::Result> for VulkanError {
    /// Maps staleness codes to their dedicated variants; everything else is
    /// wrapped as `VkResult`.
    fn from(err: vk::Result) -> Self {
        match err {
            vk::Result::ERROR_OUT_OF_DATE_KHR => VulkanError::SwapchainOutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => VulkanError::SurfaceLost,
            _ => VulkanError::VkResult(err),
        }
    }
}

/// A `Result` type alias used throughout the renderer, defaulting the error
/// type to `VulkanError`.
pub type Result<T, E = VulkanError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_maps_to_recoverable_variant() {
        let err: VulkanError = vk::Result::ERROR_OUT_OF_DATE_KHR.into();
        assert!(matches!(err, VulkanError::SwapchainOutOfDate));

        let err: VulkanError = vk::Result::ERROR_SURFACE_LOST_KHR.into();
        assert!(matches!(err, VulkanError::SurfaceLost));

        let err: VulkanError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, VulkanError::VkResult(vk::Result::ERROR_DEVICE_LOST)));
    }

    #[test]
    fn exhausted_pool_message_names_capacity() {
        let err = VulkanError::DescriptorPoolExhausted { allocated: 3, capacity: 3 };
        assert_eq!(err.to_string(), "Descriptor pool exhausted (3/3 sets in use)");
    }
}
