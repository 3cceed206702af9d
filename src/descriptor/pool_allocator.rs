use anyhow::{Context, bail};
use ash::vk;
use slotmap::SlotMap;
use smallvec::{SmallVec, smallvec};

use crate::device::GpuDevice;

use super::{keys::DescriptorPoolKey, scaffold::DescriptorSetScaffold};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolCapacity {
    pub descriptor_type: vk::DescriptorType,
    pub max_count: u32,
}

impl PoolCapacity {
    pub fn new(descriptor_type: vk::DescriptorType, max_count: u32) -> Self {
        Self {
            descriptor_type,
            max_count,
        }
    }
}

/// The pool a set was charged against.
///
/// `generation` counts the pool's resets; a set allocated before the last
/// reset no longer exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocatedPool {
    pub key: DescriptorPoolKey,
    pub pool: vk::DescriptorPool,
    pub generation: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolUsage {
    /// Sets physically carved from the pool, parked ones included.
    pub set_count: u32,
    /// Sets currently handed out to callers.
    pub live_sets: u32,
    pub descriptors: SmallVec<[(vk::DescriptorType, u32); 8]>,
}

/// Per-type descriptor counts, parallel to the capacity table.
type Counts = SmallVec<[u32; 8]>;

struct TrackedPool {
    pool: vk::DescriptorPool,
    /// Physical usage. Released sets keep their descriptors until the pool
    /// is reset or the set is freed.
    used: Counts,
    set_count: u32,
    live_sets: u32,
    generation: u64,
}

/// Bin-packs descriptor sets into fixed-size pools, adding pools on demand.
///
/// Every pool is created with exactly the capacity table. A pool stays on the
/// free list while it has room for at least one more set and leaves it the
/// moment any type (or the set count) hits its maximum.
///
/// Without individual free a released set still occupies its pool, so it
/// stays charged until the last live set is released and the pool is reset.
pub struct DescriptorPoolAllocator {
    capacities: SmallVec<[PoolCapacity; 8]>,
    max_sets_per_pool: u32,
    individual_free: bool,
    pools: SlotMap<DescriptorPoolKey, TrackedPool>,
    free_pools: Vec<DescriptorPoolKey>,
}

impl DescriptorPoolAllocator {
    pub fn new(
        capacities: impl IntoIterator<Item = PoolCapacity>,
        max_sets_per_pool: u32,
        individual_free: bool,
    ) -> Self {
        let capacities: SmallVec<[PoolCapacity; 8]> = capacities.into_iter().collect();
        debug_assert!(max_sets_per_pool > 0, "max_sets_per_pool must be positive");
        debug_assert!(!capacities.is_empty(), "capacity table is empty");
        debug_assert!(
            capacities.iter().enumerate().all(|(i, c)| capacities[..i]
                .iter()
                .all(|o| o.descriptor_type != c.descriptor_type)),
            "capacity table lists a descriptor type twice"
        );

        Self {
            capacities,
            max_sets_per_pool,
            individual_free,
            pools: SlotMap::with_key(),
            free_pools: Vec::new(),
        }
    }

    pub fn supports_individual_free(&self) -> bool {
        self.individual_free
    }

    pub fn max_sets_per_pool(&self) -> u32 {
        self.max_sets_per_pool
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn free_pool_count(&self) -> usize {
        self.free_pools.len()
    }

    pub fn is_free(&self, key: DescriptorPoolKey) -> bool {
        self.free_pools.contains(&key)
    }

    pub fn usage(&self, key: DescriptorPoolKey) -> Option<PoolUsage> {
        let pool = self.pools.get(key)?;
        Some(PoolUsage {
            set_count: pool.set_count,
            live_sets: pool.live_sets,
            descriptors: self
                .capacities
                .iter()
                .zip(&pool.used)
                .map(|(c, used)| (c.descriptor_type, *used))
                .collect(),
        })
    }

    /// Finds (or creates) a pool with room for one set shaped like
    /// `scaffold` and charges the scaffold's descriptors against it.
    pub fn require_pool(
        &mut self,
        device: &impl GpuDevice,
        scaffold: &DescriptorSetScaffold,
    ) -> anyhow::Result<AllocatedPool> {
        let demand = self.demand(scaffold)?;

        let found = self
            .free_pools
            .iter()
            .copied()
            .find(|&key| self.fits(&self.pools[key], &demand));

        let key = match found {
            Some(key) => key,
            None => {
                if !self.fits_empty(&demand) {
                    bail!(
                        "descriptor set needs more descriptors than a whole pool holds ({:?})",
                        scaffold.type_counts()
                    );
                }
                self.create_pool(device)?
            }
        };

        self.charge(key, &demand);
        let pool = &self.pools[key];
        Ok(AllocatedPool {
            key,
            pool: pool.pool,
            generation: pool.generation,
        })
    }

    /// Hands a released set that still lives in its pool back out. Fails if
    /// the pool has been reset (or destroyed) since the set was allocated.
    pub fn reacquire(
        &mut self,
        allocated: &AllocatedPool,
        scaffold: &DescriptorSetScaffold,
    ) -> anyhow::Result<()> {
        self.demand(scaffold)?;
        let pool = self
            .pools
            .get_mut(allocated.key)
            .context("descriptor pool no longer exists")?;
        if pool.generation != allocated.generation {
            bail!("descriptor pool was reset after the set was allocated");
        }
        if pool.live_sets >= pool.set_count {
            bail!("descriptor pool has no released set to hand back out");
        }
        pool.live_sets += 1;
        Ok(())
    }

    /// Marks a set as no longer in use without freeing it. Its descriptors
    /// stay charged until the pool is reset.
    ///
    /// Returns true if that was the pool's last live set and the pool was
    /// reset, which invalidates every set ever allocated from it.
    pub fn release(
        &mut self,
        device: &impl GpuDevice,
        allocated: &AllocatedPool,
        scaffold: &DescriptorSetScaffold,
    ) -> bool {
        if let Err(e) = self.demand(scaffold) {
            log::error!("Ignoring descriptor release: {e:#}");
            return false;
        }
        let Some(pool) = self.live_pool(allocated) else {
            return false;
        };

        debug_assert!(pool.live_sets > 0, "descriptor pool live set underflow");
        pool.live_sets = pool.live_sets.saturating_sub(1);
        if pool.live_sets == 0 {
            self.reset_pool(device, allocated.key);
            return true;
        }
        false
    }

    /// Frees the set individually and returns its capacity. The pool goes
    /// back on the free list right away since the space is really free.
    pub fn release_and_free(
        &mut self,
        device: &impl GpuDevice,
        allocated: &AllocatedPool,
        set: vk::DescriptorSet,
        scaffold: &DescriptorSetScaffold,
    ) -> bool {
        if !self.individual_free {
            debug_assert!(false, "pool allocator was created without individual free");
            return self.release(device, allocated, scaffold);
        }

        if let Err(e) = device.free_descriptor_sets(allocated.pool, &[set]) {
            log::error!("Failed to free descriptor set: {e}");
        }

        let demand = match self.demand(scaffold) {
            Ok(demand) => demand,
            Err(e) => {
                log::error!("Ignoring descriptor release: {e:#}");
                return false;
            }
        };
        let Some(pool) = self.live_pool(allocated) else {
            return false;
        };
        debug_assert!(pool.live_sets > 0, "descriptor pool live set underflow");
        pool.live_sets = pool.live_sets.saturating_sub(1);
        uncharge(pool, &demand);

        if pool.live_sets == 0 {
            self.reset_pool(device, allocated.key);
            return true;
        }
        self.make_free_if_room(allocated.key);
        false
    }

    /// Undoes a [`require_pool`](Self::require_pool) whose set was never
    /// allocated.
    pub fn refund(&mut self, allocated: &AllocatedPool, scaffold: &DescriptorSetScaffold) {
        let Ok(demand) = self.demand(scaffold) else {
            return;
        };
        let Some(pool) = self.live_pool(allocated) else {
            return;
        };
        pool.live_sets = pool.live_sets.saturating_sub(1);
        uncharge(pool, &demand);
        self.make_free_if_room(allocated.key);
    }

    /// Resets every pool and puts all of them back on the free list.
    pub fn reset(&mut self, device: &impl GpuDevice) {
        let keys: Vec<_> = self.pools.keys().collect();
        for key in keys {
            self.reset_pool(device, key);
        }
    }

    pub fn destroy(&mut self, device: &impl GpuDevice) {
        for (_, pool) in self.pools.drain() {
            device.destroy_descriptor_pool(pool.pool);
        }
        self.free_pools.clear();
    }

    fn demand(&self, scaffold: &DescriptorSetScaffold) -> anyhow::Result<Counts> {
        let mut demand: Counts = smallvec![0; self.capacities.len()];
        for (ty, count) in scaffold.type_counts() {
            let Some(slot) = self
                .capacities
                .iter()
                .position(|c| c.descriptor_type == ty)
            else {
                debug_assert!(false, "descriptor type {ty:?} is not in the capacity table");
                bail!("descriptor type {ty:?} is not in the capacity table");
            };
            demand[slot] += count;
        }
        Ok(demand)
    }

    fn fits(&self, pool: &TrackedPool, demand: &[u32]) -> bool {
        pool.set_count < self.max_sets_per_pool
            && self
                .capacities
                .iter()
                .zip(pool.used.iter().zip(demand))
                .all(|(c, (used, wanted))| used + wanted <= c.max_count)
    }

    fn fits_empty(&self, demand: &[u32]) -> bool {
        self.capacities
            .iter()
            .zip(demand)
            .all(|(c, wanted)| *wanted <= c.max_count)
    }

    fn is_exhausted(&self, pool: &TrackedPool) -> bool {
        pool.set_count >= self.max_sets_per_pool
            || self
                .capacities
                .iter()
                .zip(&pool.used)
                .any(|(c, used)| *used >= c.max_count)
    }

    fn live_pool(&mut self, allocated: &AllocatedPool) -> Option<&mut TrackedPool> {
        match self.pools.get_mut(allocated.key) {
            Some(pool) if pool.generation == allocated.generation => Some(pool),
            Some(_) => {
                log::warn!("Released a descriptor set from before its pool was reset");
                None
            }
            None => {
                log::warn!("Released a descriptor set into a pool this allocator doesn't own");
                None
            }
        }
    }

    fn make_free_if_room(&mut self, key: DescriptorPoolKey) {
        if let Some(pool) = self.pools.get(key)
            && !self.is_exhausted(pool)
            && !self.free_pools.contains(&key)
        {
            self.free_pools.push(key);
        }
    }

    fn charge(&mut self, key: DescriptorPoolKey, demand: &[u32]) {
        let pool = &mut self.pools[key];
        pool.set_count += 1;
        pool.live_sets += 1;
        for (used, wanted) in pool.used.iter_mut().zip(demand) {
            *used += wanted;
        }

        if self.is_exhausted(&self.pools[key]) {
            self.free_pools.retain(|k| *k != key);
        }
    }

    fn create_pool(&mut self, device: &impl GpuDevice) -> anyhow::Result<DescriptorPoolKey> {
        let sizes: SmallVec<[vk::DescriptorPoolSize; 8]> = self
            .capacities
            .iter()
            .map(|c| {
                vk::DescriptorPoolSize::default()
                    .ty(c.descriptor_type)
                    .descriptor_count(c.max_count)
            })
            .collect();

        let flags = if self.individual_free {
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };

        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(flags)
            .max_sets(self.max_sets_per_pool)
            .pool_sizes(&sizes);

        let pool = device
            .create_descriptor_pool(&info)
            .context("failed to create descriptor pool")?;

        let key = self.pools.insert(TrackedPool {
            pool,
            used: smallvec![0; self.capacities.len()],
            set_count: 0,
            live_sets: 0,
            generation: 0,
        });
        self.free_pools.push(key);
        log::debug!(
            "Created descriptor pool #{} ({} sets max)",
            self.pools.len(),
            self.max_sets_per_pool
        );
        Ok(key)
    }

    fn reset_pool(&mut self, device: &impl GpuDevice, key: DescriptorPoolKey) {
        let Some(pool) = self.pools.get_mut(key) else {
            return;
        };
        if let Err(e) = device.reset_descriptor_pool(pool.pool) {
            log::error!("Failed to reset descriptor pool: {e}");
        }
        pool.set_count = 0;
        pool.live_sets = 0;
        pool.generation += 1;
        pool.used.iter_mut().for_each(|u| *u = 0);
        if !self.free_pools.contains(&key) {
            self.free_pools.push(key);
        }
        log::trace!("Reset descriptor pool");
    }
}

fn uncharge(pool: &mut TrackedPool, demand: &[u32]) {
    debug_assert!(pool.set_count > 0, "descriptor pool set count underflow");
    pool.set_count = pool.set_count.saturating_sub(1);
    for (used, wanted) in pool.used.iter_mut().zip(demand) {
        debug_assert!(*used >= *wanted, "descriptor pool count underflow");
        *used = used.saturating_sub(*wanted);
    }
}

impl Drop for DescriptorPoolAllocator {
    fn drop(&mut self) {
        if !self.pools.is_empty() {
            log::warn!(
                "Descriptor pool allocator dropped with {} live pools",
                self.pools.len()
            );
        }
    }
}
