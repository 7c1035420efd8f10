//! Vulkan instance creation with optional validation.
//!
//! The validation layer is requested when the configuration asks for it. When
//! the layer is not installed the instance is still created and a single warning
//! is logged.

use crate::error::{Result, VulkanError};
use ash::extensions::ext::DebugUtils;
use ash::vk::{self, make_api_version};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use tracing::{debug, error, info, trace, warn};

const ENGINE_NAME: &str = "NovaDE Ocean Renderer";
const VK_LAYER_KHRONOS_VALIDATION_NAME: &str = "VK_LAYER_KHRONOS_validation";

/// API version requested from the driver. 1.2 brings host query reset into core.
pub const REQUESTED_API_VERSION: u32 = vk::API_VERSION_1_2;

fn engine_version() -> u32 {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0);
    make_api_version(
        0,
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

/// Compares a driver-filled, NUL-terminated name array with `name`.
fn name_matches(raw: &[c_char], name: &CStr) -> bool {
    if !raw.contains(&0) {
        return false;
    }
    // # Safety: the array holds a NUL terminator, checked above.
    (unsafe { CStr::from_ptr(raw.as_ptr()) }) == name
}

fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available.iter().any(|ext| name_matches(&ext.extension_name, name))
}

fn has_layer(available: &[vk::LayerProperties], name: &CStr) -> bool {
    available.iter().any(|layer| name_matches(&layer.layer_name, name))
}

/// Owns the Vulkan entry, the instance and the optional debug messenger.
pub struct VulkanInstance {
    entry: ash::Entry,
    instance: ash::Instance,
    api_version: u32,
    debug_utils_loader: Option<DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Creates an instance.
    ///
    /// `display` selects the platform surface extensions; pass `None` for a
    /// headless instance that never presents.
    pub fn new(application_name: &str, display: Option<RawDisplayHandle>, validation: bool) -> Result<Self> {
        // # Safety: loading the library has no preconditions beyond it being a real Vulkan loader.
        let entry = unsafe { ash::Entry::load() }?;

        let app_name = CString::new(application_name)
            .map_err(|e| VulkanError::InitializationError(format!("Invalid application name: {e}")))?;
        let engine_name = CString::new(ENGINE_NAME)
            .map_err(|e| VulkanError::InitializationError(format!("Invalid engine name: {e}")))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(engine_version())
            .api_version(REQUESTED_API_VERSION);

        let mut required_extensions: Vec<*const c_char> = match display {
            Some(display_handle) => ash_window::enumerate_required_extensions(display_handle)?.to_vec(),
            None => Vec::new(),
        };

        let available_extensions = entry.enumerate_instance_extension_properties(None)?;
        let is_available = |name: &CStr| has_extension(&available_extensions, name);
        for &required in &required_extensions {
            // # Safety: ash-window returns pointers to static NUL-terminated names.
            let name = unsafe { CStr::from_ptr(required) };
            if !is_available(name) {
                return Err(VulkanError::MissingExtension(name.to_string_lossy().into_owned()));
            }
        }

        let mut enabled_layer_names: Vec<*const c_char> = Vec::new();
        let validation_layer_name = CString::new(VK_LAYER_KHRONOS_VALIDATION_NAME)
            .map_err(|e| VulkanError::InitializationError(e.to_string()))?;
        if validation {
            let available_layers = entry.enumerate_instance_layer_properties()?;
            let validation_layer_available = has_layer(&available_layers, validation_layer_name.as_c_str());
            if validation_layer_available && is_available(DebugUtils::name()) {
                info!("Validation layer '{}' enabled.", VK_LAYER_KHRONOS_VALIDATION_NAME);
                enabled_layer_names.push(validation_layer_name.as_ptr());
                required_extensions.push(DebugUtils::name().as_ptr());
            } else {
                warn!(
                    "Validation layer '{}' requested but not available; continuing without it.",
                    VK_LAYER_KHRONOS_VALIDATION_NAME
                );
            }
        }

        let instance_create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&required_extensions)
            .enabled_layer_names(&enabled_layer_names);

        // # Safety: every pointer in the create info outlives this call.
        let instance = unsafe { entry.create_instance(&instance_create_info, None) }
            .map_err(|e| VulkanError::InitializationError(format!("Failed to create Vulkan instance: {e}")))?;
        let headless = display.is_none();
        info!("Vulkan instance created (headless: {}).", headless);

        let mut debug_utils_loader = None;
        let mut debug_messenger = None;
        if !enabled_layer_names.is_empty() {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger_create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_utils_callback));
            // # Safety: the loader was created from this instance.
            match unsafe { loader.create_debug_utils_messenger(&messenger_create_info, None) } {
                Ok(messenger) => {
                    debug!("Vulkan debug messenger created.");
                    debug_messenger = Some(messenger);
                }
                Err(e) => error!("Failed to create Vulkan debug messenger: {}", e),
            }
            debug_utils_loader = Some(loader);
        }

        Ok(Self {
            entry,
            instance,
            api_version: REQUESTED_API_VERSION,
            debug_utils_loader,
            debug_messenger,
        })
    }

    /// API version the instance was created with.
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        // # Safety: every child object is owned by structs declared to drop before the instance.
        unsafe {
            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger.take()) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan instance destroyed.");
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else {
        trace!(target: "vulkan", "[{:?}] {}", message_type, message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, src) in props.layer_name.iter_mut().zip(name.bytes()) {
            *dst = src as c_char;
        }
        props
    }

    fn extension(name: &str) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, src) in props.extension_name.iter_mut().zip(name.bytes()) {
            *dst = src as c_char;
        }
        props
    }

    #[test]
    fn validation_layer_found_by_exact_name() {
        let validation = CString::new(VK_LAYER_KHRONOS_VALIDATION_NAME).unwrap();
        let layers = [layer("VK_LAYER_MESA_overlay"), layer(VK_LAYER_KHRONOS_VALIDATION_NAME)];
        assert!(has_layer(&layers, &validation));
        assert!(!has_layer(&layers[..1], &validation));
        assert!(!has_layer(&[layer("VK_LAYER_KHRONOS_validation_extra")], &validation));
    }

    #[test]
    fn extension_lookup_compares_whole_names() {
        let available = [extension("VK_KHR_surface"), extension("VK_EXT_debug_utils")];
        assert!(has_extension(&available, DebugUtils::name()));
        assert!(!has_extension(&available, CStr::from_bytes_with_nul(b"VK_KHR_wayland_surface\0").unwrap()));
    }

    #[test]
    fn unterminated_name_never_matches() {
        let mut props = vk::LayerProperties::default();
        props.layer_name.fill(b'A' as c_char);
        let name = CString::new("A").unwrap();
        assert!(!has_layer(&[props], &name));
    }
}
