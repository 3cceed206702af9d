use std::ffi::CString;

use anyhow::Context;
use ash::{ext::debug_utils, vk};

use super::debug::{create_debug_create_info, layer_name_pointers};

/// Creates an instance with no surface extensions. With `validation` set the
/// Khronos layer and debug utils are enabled.
pub fn create_instance(entry: &ash::Entry, validation: bool) -> anyhow::Result<ash::Instance> {
    let app_name = CString::new("arbor-resources")?;
    let engine_name = CString::new("Arbor")?;

    let app_info = vk::ApplicationInfo::default()
        .api_version(vk::API_VERSION_1_3)
        .application_name(app_name.as_c_str())
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name.as_c_str())
        .engine_version(vk::make_api_version(0, 0, 1, 0));

    let mut extension_names = Vec::new();
    if validation {
        extension_names.push(debug_utils::NAME.as_ptr());
    }

    let create_flags = if cfg!(any(target_os = "macos", target_os = "ios")) {
        extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::default()
    };

    let layer_names = layer_name_pointers();
    let mut debug_create_info = create_debug_create_info();
    let mut instance_create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .flags(create_flags);
    if validation {
        instance_create_info = instance_create_info
            .enabled_layer_names(&layer_names)
            .push_next(&mut debug_create_info);
    }

    let instance = unsafe {
        entry
            .create_instance(&instance_create_info, None)
            .context("failed to create ash::Instance")?
    };
    log::trace!("Created instance (validation: {validation})");
    Ok(instance)
}
