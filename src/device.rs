use ash::{prelude::VkResult, vk};

/// The device entry points the resource systems call.
///
/// Implemented for [`ash::Device`]. Callers uphold Vulkan valid-usage rules for
/// every handle they pass in; the systems in this crate only ever hand back
/// handles they created through the same device.
pub trait GpuDevice {
    fn create_command_pool(&self, info: &vk::CommandPoolCreateInfo<'_>)
    -> VkResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn create_fence(&self, info: &vk::FenceCreateInfo<'_>) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// `Ok(true)` once the fence is signaled.
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: u64) -> VkResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()>;
    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    fn create_graphics_pipelines(
        &self,
        infos: &[vk::GraphicsPipelineCreateInfo<'_>],
    ) -> VkResult<Vec<vk::Pipeline>>;
    fn create_compute_pipelines(
        &self,
        infos: &[vk::ComputePipelineCreateInfo<'_>],
    ) -> VkResult<Vec<vk::Pipeline>>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn device_wait_idle(&self) -> VkResult<()>;
}

impl GpuDevice for ash::Device {
    fn create_command_pool(
        &self,
        info: &vk::CommandPoolCreateInfo<'_>,
    ) -> VkResult<vk::CommandPool> {
        unsafe { ash::Device::create_command_pool(self, info, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe {
            ash::Device::reset_command_pool(self, pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { ash::Device::destroy_command_pool(self, pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        unsafe { ash::Device::allocate_command_buffers(self, info) }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        unsafe { ash::Device::begin_command_buffer(self, cmd, info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { ash::Device::end_command_buffer(self, cmd) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        unsafe { ash::Device::queue_submit(self, queue, submits, fence) }
    }

    fn create_fence(&self, info: &vk::FenceCreateInfo<'_>) -> VkResult<vk::Fence> {
        unsafe { ash::Device::create_fence(self, info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { ash::Device::destroy_fence(self, fence, None) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { ash::Device::get_fence_status(self, fence) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: u64) -> VkResult<()> {
        unsafe { ash::Device::wait_for_fences(self, fences, wait_all, timeout) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { ash::Device::reset_fences(self, fences) }
    }

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        unsafe { ash::Device::create_descriptor_pool(self, info, None) }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        unsafe {
            ash::Device::reset_descriptor_pool(self, pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { ash::Device::destroy_descriptor_pool(self, pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        unsafe { ash::Device::allocate_descriptor_sets(self, info) }
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        unsafe { ash::Device::free_descriptor_sets(self, pool, sets) }
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        unsafe { ash::Device::update_descriptor_sets(self, writes, &[]) }
    }

    fn create_graphics_pipelines(
        &self,
        infos: &[vk::GraphicsPipelineCreateInfo<'_>],
    ) -> VkResult<Vec<vk::Pipeline>> {
        let result = unsafe {
            ash::Device::create_graphics_pipelines(self, vk::PipelineCache::null(), infos, None)
        };
        result.map_err(|(partial, e)| {
            destroy_partial_pipelines(self, &partial);
            e
        })
    }

    fn create_compute_pipelines(
        &self,
        infos: &[vk::ComputePipelineCreateInfo<'_>],
    ) -> VkResult<Vec<vk::Pipeline>> {
        let result = unsafe {
            ash::Device::create_compute_pipelines(self, vk::PipelineCache::null(), infos, None)
        };
        result.map_err(|(partial, e)| {
            destroy_partial_pipelines(self, &partial);
            e
        })
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { ash::Device::destroy_pipeline(self, pipeline, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { ash::Device::destroy_pipeline_layout(self, layout, None) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { ash::Device::device_wait_idle(self) }
    }
}

fn destroy_partial_pipelines(device: &ash::Device, partial: &[vk::Pipeline]) {
    for &pipeline in partial.iter().filter(|p| **p != vk::Pipeline::null()) {
        unsafe { device.destroy_pipeline(pipeline, None) };
    }
}
