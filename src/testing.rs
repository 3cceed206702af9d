//! In-memory stand-in for a Vulkan device used by the unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};

use crate::device::GpuDevice;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub fence: vk::Fence,
}

#[derive(Debug, Clone)]
pub struct CreatedPool {
    pub max_sets: u32,
    pub flags: vk::DescriptorPoolCreateFlags,
    pub sizes: Vec<(vk::DescriptorType, u32)>,
}

#[derive(Default)]
pub struct MockState {
    pub command_pools_created: usize,
    pub command_pool_resets: Vec<vk::CommandPool>,
    pub command_pools_destroyed: usize,
    pub fences_created: usize,
    pub fences_destroyed: usize,
    pub fence_resets: usize,
    pub fence_waits: usize,
    pub submissions: Vec<Submission>,
    pub begun: Vec<vk::CommandBuffer>,
    pub ended: Vec<vk::CommandBuffer>,

    pub descriptor_pools_created: Vec<CreatedPool>,
    pub descriptor_pool_resets: Vec<vk::DescriptorPool>,
    pub descriptor_pools_destroyed: Vec<vk::DescriptorPool>,
    pub sets_allocated: usize,
    pub sets_freed: Vec<vk::DescriptorSet>,
    pub update_calls: usize,
    pub writes_per_update: Vec<usize>,

    pub pipelines_destroyed: Vec<vk::Pipeline>,
    pub layouts_destroyed: Vec<vk::PipelineLayout>,

    /// Fences the "GPU" has finished.
    pub signaled: HashSet<vk::Fence>,
    /// Fences handed to `queue_submit` and not yet reset.
    pub pending: HashSet<vk::Fence>,

    pub fail_command_pool: Option<vk::Result>,
    /// Fail fence creation once this many fences exist.
    pub fail_fence_after: Option<usize>,
    pub fail_wait: Option<vk::Result>,
    pub fail_descriptor_pool: Option<vk::Result>,
    pub fail_set_allocation: Option<vk::Result>,
    pub fail_submit: Option<vk::Result>,
    /// Signal every fence on submit, as if the GPU were infinitely fast.
    pub complete_on_submit: bool,
}

/// What a descriptor pool physically holds, checked like a driver would.
#[derive(Default)]
struct MockPool {
    max_sets: u32,
    sizes: Vec<(vk::DescriptorType, u32)>,
    live: HashMap<vk::DescriptorSet, Vec<(vk::DescriptorType, u32)>>,
}

impl MockPool {
    fn used(&self, ty: vk::DescriptorType) -> u32 {
        self.live
            .values()
            .flatten()
            .filter(|(t, _)| *t == ty)
            .map(|(_, n)| n)
            .sum()
    }

    fn capacity(&self, ty: vk::DescriptorType) -> u32 {
        self.sizes
            .iter()
            .filter(|(t, _)| *t == ty)
            .map(|(_, n)| n)
            .sum()
    }
}

#[derive(Default)]
pub struct MockDevice {
    next_handle: Cell<u64>,
    pub state: RefCell<MockState>,
    pool_for_set: RefCell<HashMap<vk::DescriptorSet, vk::DescriptorPool>>,
    pools: RefCell<HashMap<vk::DescriptorPool, MockPool>>,
    layouts: RefCell<HashMap<vk::DescriptorSetLayout, Vec<(vk::DescriptorType, u32)>>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn next<T: Handle>(&self) -> T {
        let id = self.next_handle.get() + 1;
        self.next_handle.set(id);
        T::from_raw(id)
    }

    /// Marks every submitted fence as signaled.
    pub fn complete_all(&self) {
        let mut state = self.state.borrow_mut();
        let pending: Vec<_> = state.pending.iter().copied().collect();
        state.signaled.extend(pending);
    }

    pub fn complete(&self, fence: vk::Fence) {
        self.state.borrow_mut().signaled.insert(fence);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.borrow().submissions.clone()
    }

    pub fn pool_of(&self, set: vk::DescriptorSet) -> Option<vk::DescriptorPool> {
        self.pool_for_set.borrow().get(&set).copied()
    }

    /// Declares the descriptors a set with `layout` takes from its pool.
    /// Unregistered layouts only count against the pool's set limit.
    pub fn register_layout(
        &self,
        layout: vk::DescriptorSetLayout,
        descriptors: &[(vk::DescriptorType, u32)],
    ) {
        self.layouts.borrow_mut().insert(layout, descriptors.to_vec());
    }

    /// Sets physically allocated from `pool` and not yet freed or reset.
    pub fn live_sets(&self, pool: vk::DescriptorPool) -> usize {
        self.pools.borrow().get(&pool).map_or(0, |p| p.live.len())
    }
}

impl GpuDevice for MockDevice {
    fn create_command_pool(
        &self,
        _info: &vk::CommandPoolCreateInfo<'_>,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.fail_command_pool {
            return Err(e);
        }
        state.command_pools_created += 1;
        Ok(self.next())
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        self.state.borrow_mut().command_pool_resets.push(pool);
        Ok(())
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.state.borrow_mut().command_pools_destroyed += 1;
    }

    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        Ok((0..info.command_buffer_count).map(|_| self.next()).collect())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        self.state.borrow_mut().begun.push(cmd);
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.state.borrow_mut().ended.push(cmd);
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.fail_submit {
            return Err(e);
        }
        let command_buffers = submits
            .iter()
            .flat_map(|submit| raw_slice(submit.p_command_buffers, submit.command_buffer_count))
            .copied()
            .collect();
        state.submissions.push(Submission {
            queue,
            command_buffers,
            fence,
        });
        state.pending.insert(fence);
        if state.complete_on_submit {
            state.signaled.insert(fence);
        }
        Ok(())
    }

    fn create_fence(&self, _info: &vk::FenceCreateInfo<'_>) -> VkResult<vk::Fence> {
        let mut state = self.state.borrow_mut();
        if state
            .fail_fence_after
            .is_some_and(|limit| state.fences_created - state.fences_destroyed >= limit)
        {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        state.fences_created += 1;
        Ok(self.next())
    }

    fn destroy_fence(&self, _fence: vk::Fence) {
        self.state.borrow_mut().fences_destroyed += 1;
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self.state.borrow().signaled.contains(&fence))
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        _wait_all: bool,
        _timeout: u64,
    ) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        state.fence_waits += 1;
        if let Some(e) = state.fail_wait {
            return Err(e);
        }
        // Blocking waits always observe the GPU catching up.
        state.signaled.extend(fences.iter().copied());
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        for fence in fences {
            state.signaled.remove(fence);
            state.pending.remove(fence);
        }
        state.fence_resets += fences.len();
        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.fail_descriptor_pool {
            return Err(e);
        }
        let sizes: Vec<(vk::DescriptorType, u32)> = raw_slice(info.p_pool_sizes, info.pool_size_count)
            .iter()
            .map(|size| (size.ty, size.descriptor_count))
            .collect();
        let pool = self.next();
        self.pools.borrow_mut().insert(
            pool,
            MockPool {
                max_sets: info.max_sets,
                sizes: Vec::clone(&sizes),
                live: HashMap::new(),
            },
        );
        state.descriptor_pools_created.push(CreatedPool {
            max_sets: info.max_sets,
            flags: info.flags,
            sizes,
        });
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        self.state.borrow_mut().descriptor_pool_resets.push(pool);
        self.pool_for_set.borrow_mut().retain(|_, p| *p != pool);
        if let Some(pool) = self.pools.borrow_mut().get_mut(&pool) {
            pool.live.clear();
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.borrow_mut().descriptor_pools_destroyed.push(pool);
        self.pool_for_set.borrow_mut().retain(|_, p| *p != pool);
        self.pools.borrow_mut().remove(&pool);
    }

    fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.fail_set_allocation.take() {
            return Err(e);
        }

        let set_layouts = raw_slice(info.p_set_layouts, info.descriptor_set_count);
        let demands: Vec<Vec<(vk::DescriptorType, u32)>> = {
            let layouts = self.layouts.borrow();
            set_layouts
                .iter()
                .map(|layout| layouts.get(layout).cloned().unwrap_or_default())
                .collect()
        };

        let mut pools = self.pools.borrow_mut();
        let Some(pool) = pools.get_mut(&info.descriptor_pool) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        if pool.live.len() + demands.len() > pool.max_sets as usize {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let over_budget = demands.iter().flatten().any(|(ty, _)| {
            let wanted: u32 = demands
                .iter()
                .flatten()
                .filter(|(t, _)| t == ty)
                .map(|(_, n)| n)
                .sum();
            pool.used(*ty) + wanted > pool.capacity(*ty)
        });
        if over_budget {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }

        let mut owners = self.pool_for_set.borrow_mut();
        let mut sets = Vec::with_capacity(demands.len());
        for demand in demands {
            let set: vk::DescriptorSet = self.next();
            owners.insert(set, info.descriptor_pool);
            pool.live.insert(set, demand);
            sets.push(set);
        }
        state.sets_allocated += sets.len();
        Ok(sets)
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        self.state.borrow_mut().sets_freed.extend_from_slice(sets);
        if let Some(pool) = self.pools.borrow_mut().get_mut(&pool) {
            for set in sets {
                pool.live.remove(set);
            }
        }
        let mut owners = self.pool_for_set.borrow_mut();
        for set in sets {
            owners.remove(set);
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.borrow_mut();
        state.update_calls += 1;
        state.writes_per_update.push(writes.len());
    }

    fn create_graphics_pipelines(
        &self,
        infos: &[vk::GraphicsPipelineCreateInfo<'_>],
    ) -> VkResult<Vec<vk::Pipeline>> {
        Ok(infos.iter().map(|_| self.next()).collect())
    }

    fn create_compute_pipelines(
        &self,
        infos: &[vk::ComputePipelineCreateInfo<'_>],
    ) -> VkResult<Vec<vk::Pipeline>> {
        Ok(infos.iter().map(|_| self.next()).collect())
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.borrow_mut().pipelines_destroyed.push(pipeline);
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.borrow_mut().layouts_destroyed.push(layout);
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.complete_all();
        Ok(())
    }
}

fn raw_slice<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(ptr, len as usize) }
}
