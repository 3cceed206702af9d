use std::ffi::{CStr, c_char, c_void};

use anyhow::Context;
use ash::{Entry, ext::debug_utils, vk};

#[cfg(debug_assertions)]
pub const ENABLE_VALIDATION_LAYERS: bool = true;
#[cfg(not(debug_assertions))]
pub const ENABLE_VALIDATION_LAYERS: bool = false;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

    let message = unsafe {
        if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };
    match severity {
        Severity::VERBOSE => log::debug!("{kind:?} - {message}"),
        Severity::INFO => log::info!("{kind:?} - {message}"),
        Severity::WARNING => log::warn!("{kind:?} - {message}"),
        _ => log::error!("{kind:?} - {message}"),
    }
    vk::FALSE
}

pub fn layer_name_pointers() -> [*const c_char; 1] {
    [VALIDATION_LAYER.as_ptr()]
}

/// Whether the Khronos validation layer is installed.
pub fn validation_layer_available(entry: &Entry) -> anyhow::Result<bool> {
    let layers = unsafe {
        entry
            .enumerate_instance_layer_properties()
            .context("failed to enumerate Vulkan instance layer properties")?
    };
    Ok(layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .is_ok_and(|name| name == VALIDATION_LAYER)
    }))
}

pub fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let create_info = create_debug_create_info();
    let debug_utils = debug_utils::Instance::new(entry, instance);
    match unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) } {
        Ok(messenger) => Some((debug_utils, messenger)),
        Err(e) => {
            log::warn!("failed to create debug utils messenger: {e:?}");
            None
        }
    }
}

pub fn create_debug_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback))
}
