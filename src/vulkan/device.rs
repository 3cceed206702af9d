use anyhow::Context;
use ash::vk;

use super::physical::QueueFamilies;

/// Graphics queues requested from the graphics family, hardware permitting.
const MAX_GRAPHICS_QUEUES: u32 = 2;

/// Creates a device with up to [`MAX_GRAPHICS_QUEUES`] graphics queues and
/// one transfer queue. Returns the device and the graphics queue count.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
) -> anyhow::Result<(ash::Device, u32)> {
    let graphics_count = families.graphics_queue_count.min(MAX_GRAPHICS_QUEUES);
    let graphics_priorities = vec![1.0f32; graphics_count as usize];
    let transfer_priorities = [0.5f32];

    let mut queue_create_infos = vec![
        vk::DeviceQueueCreateInfo::default()
            .queue_family_index(families.graphics_index)
            .queue_priorities(&graphics_priorities),
    ];
    if let Some(transfer) = families.transfer_index {
        queue_create_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(transfer)
                .queue_priorities(&transfer_priorities),
        );
    }

    let device_create_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

    let device = unsafe {
        instance
            .create_device(physical_device, &device_create_info, None)
            .context("failed to create logical device")?
    };

    log::trace!("Created logical device with {graphics_count} graphics queues");
    Ok((device, graphics_count))
}
