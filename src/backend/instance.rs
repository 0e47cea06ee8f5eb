// Vulkan Instance - entry point into the driver
//
// Responsibilities:
// - Load the Vulkan library
// - Check requested layers/extensions before asking for them
// - Instance creation (+ debug messenger when validating)

use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::BootstrapError;

pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Needed by the ray tracing feature queries on 1.0 loaders
const PROPERTIES2_EXTENSION: &str = "VK_KHR_get_physical_device_properties2";

/// What to ask the loader for
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub app_name: String,
    pub layers: Vec<String>,
    pub debug_messenger: bool,
}

impl InstanceSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            layers: config.instance_layers(),
            debug_messenger: config.validation_enabled(),
        }
    }
}

pub struct VulkanInstance {
    pub instance: ash::Instance,
    pub entry: Entry,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Boxed so the messenger's user-data pointer stays put
    validation_errors: Box<AtomicUsize>,
}

impl VulkanInstance {
    /// Create the instance. `display` is None for headless use, in which case
    /// no surface extensions are enabled.
    pub fn new(settings: &InstanceSettings, display: Option<RawDisplayHandle>) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", settings.app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Layers first: asking for an absent layer must be a clean error
        let available_layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?
            .iter()
            .map(|props| raw_name(&props.layer_name))
            .collect::<Vec<_>>();
        let missing = missing_names(&settings.layers, &available_layers);
        if !missing.is_empty() {
            return Err(BootstrapError::MissingLayers(missing).into());
        }

        let extensions = required_instance_extensions(display, settings.debug_messenger)?;
        let available_extensions = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?
            .iter()
            .map(|props| raw_name(&props.extension_name))
            .collect::<Vec<_>>();
        let missing = missing_names(&extensions, &available_extensions);
        if !missing.is_empty() {
            return Err(BootstrapError::MissingInstanceExtensions(missing).into());
        }

        let app_name = CString::new(settings.app_name.as_str())?;
        let engine_name = CString::new("rt-bootstrap")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let layer_names = to_cstrings(&settings.layers)?;
        let layer_ptrs = layer_names.iter().map(|s| s.as_ptr()).collect::<Vec<_>>();
        let extension_names = to_cstrings(&extensions)?;
        let extension_ptrs = extension_names.iter().map(|s| s.as_ptr()).collect::<Vec<_>>();

        for layer in &settings.layers {
            log::info!("Enabling layer {}", layer);
        }
        log::debug!("Instance extensions: {:?}", extensions);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        let validation_errors = Box::new(AtomicUsize::new(0));

        let debug_utils = if settings.debug_messenger {
            match setup_debug_messenger(&entry, &instance, &validation_errors) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            instance,
            entry,
            debug_utils,
            validation_errors,
        }))
    }

    /// Number of error-severity messages the validation layer has sent
    pub fn validation_errors(&self) -> usize {
        self.validation_errors.load(Ordering::Relaxed)
    }

    pub fn has_debug_messenger(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn required_instance_extensions(
    display: Option<RawDisplayHandle>,
    debug_messenger: bool,
) -> Result<Vec<String>> {
    let mut extensions = Vec::new();

    if let Some(display) = display {
        let surface_extensions = ash_window::enumerate_required_extensions(display)
            .context("Failed to query surface extensions for this display")?;
        for &ptr in surface_extensions {
            extensions.push(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned());
        }
    }

    extensions.push(PROPERTIES2_EXTENSION.to_string());

    if debug_messenger {
        extensions.push(DebugUtils::name().to_string_lossy().into_owned());
    }

    Ok(extensions)
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
    error_counter: &AtomicUsize,
) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .user_data(error_counter as *const AtomicUsize as *mut std::ffi::c_void);

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")?;

    Ok((debug_utils, messenger))
}

/// Names in `required` that are not in `available`, in request order
pub fn missing_names(required: &[String], available: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !available.contains(name))
        .cloned()
        .collect()
}

/// Decode a fixed-size, NUL-terminated name array from a Vulkan struct
pub(crate) fn raw_name(raw: &[c_char]) -> String {
    let bytes = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect::<Vec<_>>();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub(crate) fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| CString::new(name.as_str()).with_context(|| format!("Invalid name {:?}", name)))
        .collect()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            if !p_user_data.is_null() {
                (*(p_user_data as *const AtomicUsize)).fetch_add(1, Ordering::Relaxed);
            }
            log::error!("[Vulkan] {}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message);
        }
        _ => {
            log::debug!("[Vulkan] {}", message);
        }
    }

    vk::FALSE
}
