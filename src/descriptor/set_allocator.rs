use std::collections::HashMap;

use anyhow::Context;
use ash::vk;

use crate::device::GpuDevice;

use super::{
    pool_allocator::{AllocatedPool, DescriptorPoolAllocator},
    scaffold::{DescriptorSetScaffold, ScaffoldShape},
};

struct CachedSet {
    set: vk::DescriptorSet,
    pool: AllocatedPool,
    frames_untouched: u32,
}

struct ParkedSet {
    set: vk::DescriptorSet,
    pool: AllocatedPool,
}

/// Caches written descriptor sets by the resources they bind.
///
/// One allocator serves one binding layout. A set whose bindings haven't
/// changed is handed back as-is; sets nobody asked for in
/// `eviction_threshold` frames give their capacity back to the pool
/// allocator.
pub struct DescriptorSetAllocator {
    cache: HashMap<DescriptorSetScaffold, CachedSet>,
    parked: Vec<ParkedSet>,
    eviction_threshold: u32,
    #[cfg(debug_assertions)]
    reference_shape: Option<ScaffoldShape>,
}

impl DescriptorSetAllocator {
    pub fn new(eviction_threshold: u32) -> Self {
        debug_assert!(eviction_threshold > 0, "eviction threshold must be positive");
        Self {
            cache: HashMap::new(),
            parked: Vec::new(),
            eviction_threshold,
            #[cfg(debug_assertions)]
            reference_shape: None,
        }
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    pub fn require_updated_descriptor_set(
        &mut self,
        device: &impl GpuDevice,
        layout: vk::DescriptorSetLayout,
        pool_allocator: &mut DescriptorPoolAllocator,
        scaffold: &DescriptorSetScaffold,
    ) -> anyhow::Result<vk::DescriptorSet> {
        if let Some(cached) = self.cache.get_mut(scaffold) {
            cached.frames_untouched = 0;
            return Ok(cached.set);
        }

        self.check_shape(scaffold);

        let (set, pool) = match self.take_parked(pool_allocator, scaffold) {
            Some(parked) => (parked.set, parked.pool),
            None => {
                let pool = pool_allocator.require_pool(device, scaffold)?;
                let layouts = [layout];
                let info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool.pool)
                    .set_layouts(&layouts);
                match device.allocate_descriptor_sets(&info) {
                    Ok(sets) if !sets.is_empty() => (sets[0], pool),
                    Ok(_) => {
                        pool_allocator.refund(&pool, scaffold);
                        anyhow::bail!("descriptor set allocation returned no sets");
                    }
                    Err(e) => {
                        pool_allocator.refund(&pool, scaffold);
                        return Err(e).context("failed to allocate descriptor set");
                    }
                }
            }
        };

        scaffold.write(device, set);
        self.cache.insert(
            scaffold.clone(),
            CachedSet {
                set,
                pool,
                frames_untouched: 0,
            },
        );
        Ok(set)
    }

    pub fn begin_frame(&mut self) {
        for cached in self.cache.values_mut() {
            cached.frames_untouched = cached.frames_untouched.saturating_add(1);
        }
    }

    pub fn end_frame(&mut self, device: &impl GpuDevice, pool_allocator: &mut DescriptorPoolAllocator) {
        let threshold = self.eviction_threshold;
        let stale: Vec<DescriptorSetScaffold> = self
            .cache
            .iter()
            .filter(|(_, cached)| cached.frames_untouched >= threshold)
            .map(|(scaffold, _)| scaffold.clone())
            .collect();

        if !stale.is_empty() {
            log::debug!("Evicting {} idle descriptor sets", stale.len());
        }

        for scaffold in stale {
            if let Some(cached) = self.cache.remove(&scaffold) {
                self.evict(device, pool_allocator, cached, &scaffold);
            }
        }
    }

    /// Hands every set back to the pool allocator.
    pub fn release(&mut self, device: &impl GpuDevice, pool_allocator: &mut DescriptorPoolAllocator) {
        let cached: Vec<_> = self.cache.drain().collect();
        for (scaffold, set) in cached {
            self.evict(device, pool_allocator, set, &scaffold);
        }
        self.parked.clear();
    }

    /// Pops parked sets until one can be handed back out. Sets whose pool
    /// was reset in the meantime (possibly by another set allocator sharing
    /// the pool allocator) are dropped.
    fn take_parked(
        &mut self,
        pool_allocator: &mut DescriptorPoolAllocator,
        scaffold: &DescriptorSetScaffold,
    ) -> Option<ParkedSet> {
        while let Some(parked) = self.parked.pop() {
            match pool_allocator.reacquire(&parked.pool, scaffold) {
                Ok(()) => return Some(parked),
                Err(e) => log::trace!("Dropping parked descriptor set: {e:#}"),
            }
        }
        None
    }

    fn evict(
        &mut self,
        device: &impl GpuDevice,
        pool_allocator: &mut DescriptorPoolAllocator,
        cached: CachedSet,
        scaffold: &DescriptorSetScaffold,
    ) {
        if pool_allocator.supports_individual_free() {
            pool_allocator.release_and_free(device, &cached.pool, cached.set, scaffold);
            return;
        }

        if pool_allocator.release(device, &cached.pool, scaffold) {
            // The pool was reset, so every set carved from it is gone.
            self.parked.retain(|p| p.pool.key != cached.pool.key);
        } else {
            self.parked.push(ParkedSet {
                set: cached.set,
                pool: cached.pool,
            });
        }
    }

    #[cfg(debug_assertions)]
    fn check_shape(&mut self, scaffold: &DescriptorSetScaffold) {
        let shape = scaffold.shape();
        match &self.reference_shape {
            Some(reference) => debug_assert_eq!(
                reference, &shape,
                "descriptor set allocator used with scaffolds of different shapes"
            ),
            None => self.reference_shape = Some(shape),
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_shape(&mut self, _scaffold: &DescriptorSetScaffold) {}
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::descriptor::pool_allocator::PoolCapacity;
    use crate::descriptor::scaffold::{BufferRange, DescriptorResource};
    use crate::testing::MockDevice;

    fn layout() -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(7)
    }

    fn scaffold(buffer: u64) -> DescriptorSetScaffold {
        DescriptorSetScaffold::new(0)
            .with(
                0,
                DescriptorResource::UniformBuffer(BufferRange::whole(vk::Buffer::from_raw(buffer))),
            )
            .with(
                1,
                DescriptorResource::StorageBuffer(BufferRange::whole(vk::Buffer::from_raw(
                    buffer + 1000,
                ))),
            )
    }

    fn pools(max_sets: u32, individual_free: bool) -> DescriptorPoolAllocator {
        DescriptorPoolAllocator::new(
            [
                PoolCapacity::new(vk::DescriptorType::UNIFORM_BUFFER, max_sets),
                PoolCapacity::new(vk::DescriptorType::STORAGE_BUFFER, max_sets),
            ],
            max_sets,
            individual_free,
        )
    }

    #[test]
    fn cache_hit_returns_same_set_without_updates() {
        let device = MockDevice::new();
        let mut pool_allocator = pools(4, false);
        let mut sets = DescriptorSetAllocator::new(4);

        let first = sets
            .require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap();
        assert_eq!(device.state.borrow().update_calls, 1);
        assert_eq!(device.state.borrow().writes_per_update, vec![2]);

        for _ in 0..3 {
            sets.begin_frame();
            let again = sets
                .require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
                .unwrap();
            assert_eq!(again, first);
            sets.end_frame(&device, &mut pool_allocator);
        }

        let state = device.state.borrow();
        assert_eq!(state.update_calls, 1);
        assert_eq!(state.sets_allocated, 1);
        drop(state);
        sets.release(&device, &mut pool_allocator);
        pool_allocator.destroy(&device);
    }

    #[test]
    fn distinct_scaffolds_get_distinct_sets() {
        let device = MockDevice::new();
        let mut pool_allocator = pools(4, false);
        let mut sets = DescriptorSetAllocator::new(4);

        let a = sets
            .require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap();
        let b = sets
            .require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(2))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(sets.cached_count(), 2);
        assert_eq!(device.state.borrow().update_calls, 2);

        sets.release(&device, &mut pool_allocator);
        pool_allocator.destroy(&device);
    }

    #[test]
    fn idle_sets_are_evicted_and_capacity_returned() {
        let device = MockDevice::new();
        // Room for exactly one set, so a second scaffold only fits once the
        // first one has been evicted.
        let mut pool_allocator = pools(1, true);
        let mut sets = DescriptorSetAllocator::new(2);

        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap();
        sets.end_frame(&device, &mut pool_allocator);
        assert_eq!(pool_allocator.free_pool_count(), 0);

        sets.begin_frame();
        sets.end_frame(&device, &mut pool_allocator);
        assert_eq!(sets.cached_count(), 1);

        sets.begin_frame();
        sets.end_frame(&device, &mut pool_allocator);
        assert_eq!(sets.cached_count(), 0);
        assert_eq!(pool_allocator.free_pool_count(), 1);
        assert_eq!(device.state.borrow().sets_freed.len(), 1);

        sets.begin_frame();
        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(2))
            .unwrap();
        assert_eq!(pool_allocator.pool_count(), 1);

        sets.release(&device, &mut pool_allocator);
        pool_allocator.destroy(&device);
    }

    #[test]
    fn touched_sets_survive_eviction() {
        let device = MockDevice::new();
        let mut pool_allocator = pools(4, false);
        let mut sets = DescriptorSetAllocator::new(2);

        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap();
        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(2))
            .unwrap();

        for _ in 0..5 {
            sets.begin_frame();
            sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
                .unwrap();
            sets.end_frame(&device, &mut pool_allocator);
        }

        assert_eq!(sets.cached_count(), 1);
        assert_eq!(sets.parked_count(), 1);

        sets.release(&device, &mut pool_allocator);
        pool_allocator.destroy(&device);
    }

    #[test]
    fn parked_set_is_reused_and_counts_as_touched() {
        let device = MockDevice::new();
        let mut pool_allocator = pools(4, false);
        let mut sets = DescriptorSetAllocator::new(1);

        let a = sets
            .require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap();
        let _keep = sets
            .require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(2))
            .unwrap();

        // Keep scaffold 2 alive so its pool is never reset.
        sets.begin_frame();
        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(2))
            .unwrap();
        sets.end_frame(&device, &mut pool_allocator);
        assert_eq!(sets.parked_count(), 1);

        sets.begin_frame();
        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(2))
            .unwrap();
        let reused = sets
            .require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(3))
            .unwrap();
        assert_eq!(reused, a);
        assert_eq!(sets.parked_count(), 0);
        assert_eq!(device.state.borrow().sets_allocated, 2);
        assert_eq!(device.state.borrow().update_calls, 3);

        // Reused in this frame, so it must survive this frame's eviction.
        sets.end_frame(&device, &mut pool_allocator);
        assert_eq!(sets.cached_count(), 2);

        sets.release(&device, &mut pool_allocator);
        pool_allocator.destroy(&device);
    }

    #[test]
    fn parked_sets_in_reset_pools_are_dropped() {
        let device = MockDevice::new();
        let mut pool_allocator = pools(4, false);
        let mut sets = DescriptorSetAllocator::new(1);

        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap();
        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(2))
            .unwrap();

        sets.begin_frame();
        sets.end_frame(&device, &mut pool_allocator);

        // Both evicted: the pool emptied and was reset, so nothing is parked.
        assert_eq!(sets.cached_count(), 0);
        assert_eq!(sets.parked_count(), 0);
        assert_eq!(device.state.borrow().descriptor_pool_resets.len(), 1);
        assert_eq!(pool_allocator.free_pool_count(), 1);

        pool_allocator.destroy(&device);
    }

    #[test]
    fn failed_set_allocation_returns_capacity() {
        let device = MockDevice::new();
        device.state.borrow_mut().fail_set_allocation = Some(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        let mut pool_allocator = pools(4, false);
        let mut sets = DescriptorSetAllocator::new(2);

        let err = sets
            .require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<vk::Result>(),
            Some(&vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        );
        assert_eq!(sets.cached_count(), 0);
        assert_eq!(pool_allocator.free_pool_count(), 1);
        assert_eq!(device.state.borrow().update_calls, 0);

        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap();
        sets.release(&device, &mut pool_allocator);
        pool_allocator.destroy(&device);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "different shapes")]
    fn mixing_shapes_is_caught_in_debug_builds() {
        let device = MockDevice::new();
        let mut pool_allocator = pools(4, false);
        let mut sets = DescriptorSetAllocator::new(2);

        sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &scaffold(1))
            .unwrap();
        let other = DescriptorSetScaffold::new(0).with(
            0,
            DescriptorResource::StorageBuffer(BufferRange::whole(vk::Buffer::from_raw(9))),
        );
        let _ = sets.require_updated_descriptor_set(&device, layout(), &mut pool_allocator, &other);
    }
}
