use anyhow::Context;
use ash::vk;

use crate::device::GpuDevice;

use super::context::ExecutionContext;

/// A command pool plus a fixed number of execution contexts carved from it.
///
/// Slots are handed out in order and only come back all at once, when the
/// pool is reset, so the free slots are always `contexts[handed_out..]`.
pub struct CommandPoolBlock {
    pub queue_family: u32,
    pool: vk::CommandPool,
    contexts: Vec<ExecutionContext>,
    handed_out: usize,
    num_submitted: usize,
    num_complete: usize,
}

impl CommandPoolBlock {
    pub fn new(device: &impl GpuDevice, queue_family: u32, size: u32) -> anyhow::Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = device
            .create_command_pool(&pool_info)
            .context("failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(size);
        let command_buffers = match device.allocate_command_buffers(&alloc_info) {
            Ok(buffers) => buffers,
            Err(e) => {
                device.destroy_command_pool(pool);
                return Err(e).context("failed to allocate command buffers");
            }
        };

        let mut fences = Vec::with_capacity(size as usize);
        for _ in 0..size {
            match device.create_fence(&vk::FenceCreateInfo::default()) {
                Ok(fence) => fences.push(fence),
                Err(e) => {
                    for fence in fences {
                        device.destroy_fence(fence);
                    }
                    device.destroy_command_pool(pool);
                    return Err(e).context("failed to create command fence");
                }
            }
        }

        log::debug!("Created command pool for queue family {queue_family} with {size} contexts");

        Ok(Self {
            queue_family,
            pool,
            contexts: command_buffers
                .into_iter()
                .zip(fences)
                .map(|(cmd, fence)| ExecutionContext::new(cmd, fence))
                .collect(),
            handed_out: 0,
            num_submitted: 0,
            num_complete: 0,
        })
    }

    pub fn has_free_slot(&self) -> bool {
        self.handed_out < self.contexts.len()
    }

    pub fn take_slot(&mut self, queue: vk::Queue) -> Option<usize> {
        if !self.has_free_slot() {
            return None;
        }
        let slot = self.handed_out;
        self.handed_out += 1;
        self.contexts[slot].queue = queue;
        Some(slot)
    }

    pub fn find_open(&self, queue: vk::Queue) -> Option<usize> {
        self.contexts[..self.handed_out]
            .iter()
            .position(|ctx| ctx.is_open() && ctx.queue == queue)
    }

    pub fn context(&self, slot: usize) -> &ExecutionContext {
        &self.contexts[slot]
    }

    pub fn context_mut(&mut self, slot: usize) -> &mut ExecutionContext {
        &mut self.contexts[slot]
    }

    pub fn handed_out(&self) -> usize {
        self.handed_out
    }

    pub fn mark_submitted(&mut self, slot: usize) {
        let ctx = &mut self.contexts[slot];
        debug_assert!(ctx.is_open());
        ctx.submitted = true;
        self.num_submitted += 1;
    }

    pub fn mark_complete(&mut self, slot: usize) {
        let ctx = &mut self.contexts[slot];
        debug_assert!(!ctx.complete);
        ctx.complete = true;
        self.num_complete += 1;
    }

    /// Retires a context that began recording but will never be submitted.
    pub fn abandon(&mut self, slot: usize) {
        debug_assert!(!self.contexts[slot].submitted);
        self.mark_complete(slot);
    }

    /// Resets the whole pool once every handed-out slot has completed.
    /// Resetting earlier would invalidate buffers that are still recording
    /// or still queued on the GPU.
    pub fn try_reset(&mut self, device: &impl GpuDevice) -> anyhow::Result<bool> {
        if self.handed_out == 0 || self.num_complete != self.handed_out {
            return Ok(false);
        }
        debug_assert!(self.num_submitted <= self.num_complete);

        device
            .reset_command_pool(self.pool)
            .context("failed to reset command pool")?;

        for ctx in &mut self.contexts[..self.handed_out] {
            ctx.recycle();
        }
        self.handed_out = 0;
        self.num_submitted = 0;
        self.num_complete = 0;
        log::trace!("Reset command pool for queue family {}", self.queue_family);
        Ok(true)
    }

    pub fn in_flight_fences(&self) -> Vec<vk::Fence> {
        self.contexts[..self.handed_out]
            .iter()
            .filter(|ctx| ctx.is_in_flight())
            .map(|ctx| ctx.fence)
            .collect()
    }

    pub fn destroy(&mut self, device: &impl GpuDevice) {
        log::trace!("Destroying command pool for queue family {}", self.queue_family);
        for ctx in self.contexts.drain(..) {
            device.destroy_fence(ctx.fence);
        }
        device.destroy_command_pool(self.pool);
    }
}
