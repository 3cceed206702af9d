use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use slotmap::SlotMap;

use crate::{
    device::GpuDevice,
    frame::FrameInfo,
    resource::{Owned, RetireQueue},
};

use super::{
    keys::{PoolAllocatorKey, SetAllocatorKey},
    pool_allocator::{DescriptorPoolAllocator, PoolCapacity},
    scaffold::DescriptorSetScaffold,
    set_allocator::DescriptorSetAllocator,
};

pub type PoolAllocatorHandle = Owned<PoolAllocatorKey>;
pub type SetAllocatorHandle = Owned<SetAllocatorKey>;

struct SetAllocatorEntry {
    layout: vk::DescriptorSetLayout,
    pool_allocator: PoolAllocatorKey,
    per_frame: Vec<DescriptorSetAllocator>,
}

/// Keeps one copy of every pool and set allocator per frame in flight, so
/// the frame being recorded never touches descriptor state an in-flight
/// frame still reads.
pub struct DescriptorSystem<D: GpuDevice = ash::Device> {
    device: Arc<D>,
    frame: FrameInfo,
    eviction_threshold: u32,
    pool_allocators: SlotMap<PoolAllocatorKey, Vec<DescriptorPoolAllocator>>,
    set_allocators: SlotMap<SetAllocatorKey, SetAllocatorEntry>,
    retired_pool_allocators: RetireQueue<PoolAllocatorKey>,
    retired_set_allocators: RetireQueue<SetAllocatorKey>,
}

impl<D: GpuDevice> DescriptorSystem<D> {
    pub fn new(device: Arc<D>, frame_queue_depth: u32, eviction_threshold: u32) -> Self {
        debug_assert!(frame_queue_depth > 0);
        Self {
            device,
            frame: FrameInfo::new(frame_queue_depth),
            eviction_threshold,
            pool_allocators: SlotMap::with_key(),
            set_allocators: SlotMap::with_key(),
            retired_pool_allocators: RetireQueue::new(),
            retired_set_allocators: RetireQueue::new(),
        }
    }

    fn depth(&self) -> usize {
        self.frame.frame_queue_depth as usize
    }

    pub fn create_pool_allocator(
        &mut self,
        capacities: &[PoolCapacity],
        max_sets_per_pool: u32,
        individual_free: bool,
    ) -> PoolAllocatorHandle {
        let copies = (0..self.depth())
            .map(|_| {
                DescriptorPoolAllocator::new(
                    capacities.iter().copied(),
                    max_sets_per_pool,
                    individual_free,
                )
            })
            .collect();
        let key = self.pool_allocators.insert(copies);
        log::trace!("Created descriptor pool allocator {key:?}");
        self.retired_pool_allocators.wrap(key)
    }

    pub fn create_set_allocator(
        &mut self,
        pool_allocator: &PoolAllocatorHandle,
        layout: vk::DescriptorSetLayout,
    ) -> anyhow::Result<SetAllocatorHandle> {
        let pool_key = **pool_allocator;
        if !self.pool_allocators.contains_key(pool_key) {
            anyhow::bail!("pool allocator {pool_key:?} has already been destroyed");
        }

        let per_frame = (0..self.depth())
            .map(|_| DescriptorSetAllocator::new(self.eviction_threshold))
            .collect();
        let key = self.set_allocators.insert(SetAllocatorEntry {
            layout,
            pool_allocator: pool_key,
            per_frame,
        });
        log::trace!("Created descriptor set allocator {key:?}");
        Ok(self.retired_set_allocators.wrap(key))
    }

    /// The current frame's copy of a pool allocator.
    pub fn get_pool_allocator(&self, handle: &PoolAllocatorHandle) -> Option<&DescriptorPoolAllocator> {
        self.pool_allocators
            .get(**handle)
            .and_then(|copies| copies.get(self.frame.index()))
    }

    /// The current frame's copy of a set allocator.
    pub fn get_set_allocator(&self, handle: &SetAllocatorHandle) -> Option<&DescriptorSetAllocator> {
        self.set_allocators
            .get(**handle)
            .and_then(|entry| entry.per_frame.get(self.frame.index()))
    }

    pub fn require_updated_descriptor_set(
        &mut self,
        handle: &SetAllocatorHandle,
        scaffold: &DescriptorSetScaffold,
    ) -> anyhow::Result<vk::DescriptorSet> {
        let index = self.frame.index();
        let entry = self
            .set_allocators
            .get_mut(**handle)
            .context("descriptor set allocator has been destroyed")?;
        let pools = self
            .pool_allocators
            .get_mut(entry.pool_allocator)
            .context("descriptor set allocator outlived its pool allocator")?;

        entry.per_frame[index].require_updated_descriptor_set(
            self.device.as_ref(),
            entry.layout,
            &mut pools[index],
            scaffold,
        )
    }

    /// Reclaims allocators released during frames that have finished, then
    /// starts aging the new frame's cached sets.
    pub fn begin_frame(&mut self, frame: FrameInfo) {
        let _span = tracing::trace_span!("DescriptorSystem::begin_frame").entered();
        debug_assert_eq!(frame.frame_queue_depth, self.frame.frame_queue_depth);
        self.frame = frame;

        let device = self.device.as_ref();
        let set_allocators = &mut self.set_allocators;
        let pool_allocators = &mut self.pool_allocators;

        // Set allocators go first so their sets are back in the pools before
        // any pool allocator is torn down.
        self.retired_set_allocators.begin_frame(frame, |key| {
            destroy_set_allocator(device, set_allocators, pool_allocators, key)
        });
        self.retired_pool_allocators.begin_frame(frame, |key| {
            destroy_pool_allocator(device, set_allocators, pool_allocators, key)
        });

        let index = frame.index();
        for entry in self.set_allocators.values_mut() {
            entry.per_frame[index].begin_frame();
        }
    }

    pub fn end_frame(&mut self) {
        let _span = tracing::trace_span!("DescriptorSystem::end_frame").entered();
        let index = self.frame.index();
        for entry in self.set_allocators.values_mut() {
            let Some(pools) = self.pool_allocators.get_mut(entry.pool_allocator) else {
                continue;
            };
            entry.per_frame[index].end_frame(self.device.as_ref(), &mut pools[index]);
        }
    }

    /// Destroys every allocator and descriptor pool. The device must be idle.
    pub fn terminate(&mut self) {
        let device = self.device.as_ref();
        let set_allocators = &mut self.set_allocators;
        let pool_allocators = &mut self.pool_allocators;

        self.retired_set_allocators.flush(|key| {
            destroy_set_allocator(device, set_allocators, pool_allocators, key)
        });
        if !set_allocators.is_empty() {
            log::warn!(
                "Terminating descriptor system with {} set allocators still held",
                set_allocators.len()
            );
            let live: Vec<_> = set_allocators.keys().collect();
            for key in live {
                destroy_set_allocator(device, set_allocators, pool_allocators, key);
            }
        }

        self.retired_pool_allocators.flush(|key| {
            destroy_pool_allocator(device, set_allocators, pool_allocators, key)
        });
        if !pool_allocators.is_empty() {
            log::warn!(
                "Terminating descriptor system with {} pool allocators still held",
                pool_allocators.len()
            );
            for (_, mut copies) in pool_allocators.drain() {
                for allocator in &mut copies {
                    allocator.destroy(device);
                }
            }
        }
    }
}

impl<D: GpuDevice> Drop for DescriptorSystem<D> {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn destroy_set_allocator(
    device: &impl GpuDevice,
    set_allocators: &mut SlotMap<SetAllocatorKey, SetAllocatorEntry>,
    pool_allocators: &mut SlotMap<PoolAllocatorKey, Vec<DescriptorPoolAllocator>>,
    key: SetAllocatorKey,
) {
    let Some(mut entry) = set_allocators.remove(key) else {
        return;
    };
    match pool_allocators.get_mut(entry.pool_allocator) {
        Some(pools) => {
            for (sets, pools) in entry.per_frame.iter_mut().zip(pools.iter_mut()) {
                sets.release(device, pools);
            }
        }
        None => log::warn!("Set allocator {key:?} outlived its pool allocator"),
    }
    log::trace!("Destroyed descriptor set allocator {key:?}");
}

fn destroy_pool_allocator(
    device: &impl GpuDevice,
    set_allocators: &SlotMap<SetAllocatorKey, SetAllocatorEntry>,
    pool_allocators: &mut SlotMap<PoolAllocatorKey, Vec<DescriptorPoolAllocator>>,
    key: PoolAllocatorKey,
) {
    assert!(
        !set_allocators.values().any(|e| e.pool_allocator == key),
        "pool allocator {key:?} destroyed while a live set allocator still uses it"
    );
    if let Some(mut copies) = pool_allocators.remove(key) {
        for allocator in &mut copies {
            allocator.destroy(device);
        }
    }
    log::trace!("Destroyed descriptor pool allocator {key:?}");
}
