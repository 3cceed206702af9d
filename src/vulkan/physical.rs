use anyhow::Context;
use ash::vk;

/// Queue families the device is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics_index: u32,
    pub graphics_queue_count: u32,
    /// A transfer-only family, when the hardware has one.
    pub transfer_index: Option<u32>,
}

pub fn pick_physical_device(
    instance: &ash::Instance,
) -> anyhow::Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .context("failed to enumerate physical devices")?
    };

    let (device, families) = devices
        .into_iter()
        .filter_map(|device| find_queue_families(instance, device).map(|f| (device, f)))
        .max_by_key(|(device, _)| device_type_rank(instance, *device))
        .context("no physical device with a graphics queue")?;

    let props = unsafe { instance.get_physical_device_properties(device) };
    log::debug!(
        "Selected physical device: {:?} ({:?})",
        props.device_name_as_c_str().unwrap_or(c"<unnamed>"),
        props.device_type
    );

    Ok((device, families))
}

fn device_type_rank(instance: &ash::Instance, device: vk::PhysicalDevice) -> u8 {
    let props = unsafe { instance.get_physical_device_properties(device) };
    match props.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

fn find_queue_families(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<QueueFamilies> {
    let props = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let (graphics_index, graphics) = props
        .iter()
        .enumerate()
        .find(|(_, f)| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))?;

    let transfer_index = props
        .iter()
        .position(|f| {
            f.queue_count > 0
                && f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f
                    .queue_flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32);

    Some(QueueFamilies {
        graphics_index: graphics_index as u32,
        graphics_queue_count: graphics.queue_count,
        transfer_index,
    })
}
