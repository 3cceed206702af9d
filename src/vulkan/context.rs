use std::sync::Arc;

use anyhow::{Context, bail};
use ash::{ext::debug_utils, vk};

use super::{
    debug::{ENABLE_VALIDATION_LAYERS, setup_debug_messenger, validation_layer_available},
    device::create_logical_device,
    device_context::DeviceContext,
    instance::create_instance,
    physical::{QueueFamilies, pick_physical_device},
};

/// Headless instance, device and queues the resource systems run on.
///
/// Every system holding the device or an allocator created here must be
/// dropped before the core.
pub struct VulkanCore {
    device_context: DeviceContext,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: QueueFamilies,
    graphics_queue_count: u32,
    debug_messenger: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    _entry: ash::Entry,
}

impl VulkanCore {
    pub fn new() -> anyhow::Result<Self> {
        let entry = ash::Entry::linked();

        let validation = ENABLE_VALIDATION_LAYERS
            && validation_layer_available(&entry)
                .context("failed to check validation layer support")?;
        if ENABLE_VALIDATION_LAYERS && !validation {
            log::warn!("Validation layer not installed, continuing without it");
        }

        let instance = create_instance(&entry, validation).context("failed to create instance")?;
        let debug_messenger = if validation {
            setup_debug_messenger(&entry, &instance)
        } else {
            None
        };

        let created = pick_physical_device(&instance).and_then(|(physical_device, families)| {
            let (device, graphics_queue_count) =
                create_logical_device(&instance, physical_device, families)?;
            Ok((physical_device, families, device, graphics_queue_count))
        });
        let (physical_device, queue_families, device, graphics_queue_count) = match created {
            Ok(created) => created,
            Err(e) => {
                unsafe { destroy_instance(&instance, debug_messenger.as_ref()) };
                return Err(e);
            }
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let debug_utils =
            validation.then(|| Arc::new(debug_utils::Device::new(&instance, &device)));

        Ok(Self {
            device_context: DeviceContext {
                device: Arc::new(device),
                debug_utils,
            },
            physical_device,
            memory_properties,
            queue_families,
            graphics_queue_count,
            debug_messenger,
            instance,
            _entry: entry,
        })
    }

    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device_context.device
    }

    pub fn device_context(&self) -> &DeviceContext {
        &self.device_context
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    pub fn graphics_family(&self) -> u32 {
        self.queue_families.graphics_index
    }

    pub fn graphics_queue_count(&self) -> u32 {
        self.graphics_queue_count
    }

    /// The `index`th queue of `family`, if the device was created with it.
    pub fn queue(&self, family: u32, index: u32) -> anyhow::Result<vk::Queue> {
        let created = if family == self.queue_families.graphics_index {
            self.graphics_queue_count
        } else if Some(family) == self.queue_families.transfer_index {
            1
        } else {
            0
        };
        if index >= created {
            bail!("queue {index} of family {family} was not created");
        }
        Ok(unsafe { self.device().get_device_queue(family, index) })
    }

    pub fn graphics_queue(&self, index: u32) -> anyhow::Result<vk::Queue> {
        self.queue(self.graphics_family(), index)
    }

    pub fn create_allocator(&self) -> anyhow::Result<vk_mem::Allocator> {
        let info = vk_mem::AllocatorCreateInfo::new(
            &self.instance,
            self.device().as_ref(),
            self.physical_device,
        );
        unsafe { vk_mem::Allocator::new(info).context("failed to create allocator") }
    }

    pub fn wait_idle(&self) -> anyhow::Result<()> {
        unsafe { self.device().device_wait_idle() }.context("failed to wait for device idle")
    }
}

impl Drop for VulkanCore {
    fn drop(&mut self) {
        log::trace!("Destroying Vulkan core");
        if let Err(e) = self.wait_idle() {
            log::error!("{e:#}");
        }

        let holders = Arc::strong_count(&self.device_context.device);
        if holders > 1 {
            log::error!("Device still shared by {} owners, leaking it", holders - 1);
        } else {
            log::trace!("  Destroying device");
            unsafe { self.device().destroy_device(None) };
        }

        unsafe { destroy_instance(&self.instance, self.debug_messenger.as_ref()) };
        log::trace!("Vulkan core destroyed");
    }
}

unsafe fn destroy_instance(
    instance: &ash::Instance,
    debug_messenger: Option<&(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
) {
    if let Some((debug_utils, messenger)) = debug_messenger {
        log::trace!("  Destroying debug messenger");
        unsafe { debug_utils.destroy_debug_utils_messenger(*messenger, None) };
    }
    log::trace!("  Destroying instance");
    unsafe { instance.destroy_instance(None) };
}
