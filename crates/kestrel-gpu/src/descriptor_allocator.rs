//! Growable descriptor-set allocator.
//!
//! Pools live in an arena and are referred to by [`PoolId`]. Every pool sits in
//! exactly one of two queues: READY (may still have room) or FULL (an
//! allocation from it failed). When READY is empty a new pool is created, each
//! one 1.5× the size of the last, clamped to `max_sets_per_pool`. FULL pools
//! only return to READY through [`DescriptorAllocator::reset_all`].

use crate::error::{GpuError, Result};
use ash::vk;
use kestrel_core::{GrowableArray, MemoryTag, MemoryTracker};
use std::fmt::Debug;
use std::sync::Arc;

/// Driver-level pool operations.
pub trait DescriptorBackend {
    type Pool: Copy + Debug;

    fn create_pool(&mut self, max_sets: u32, sizes: &[vk::DescriptorPoolSize])
        -> Result<Self::Pool>;

    /// Allocate one set. Errors are returned raw so the allocator can tell
    /// exhaustion apart from other failures.
    fn allocate_set(
        &mut self,
        pool: Self::Pool,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result>;

    fn reset_pool(&mut self, pool: Self::Pool) -> Result<()>;

    fn destroy_pool(&mut self, pool: Self::Pool);
}

/// Backend issuing real Vulkan calls.
pub struct VulkanDescriptorBackend {
    device: Arc<ash::Device>,
}

impl VulkanDescriptorBackend {
    pub fn new(device: Arc<ash::Device>) -> Self {
        Self { device }
    }
}

impl DescriptorBackend for VulkanDescriptorBackend {
    type Pool = vk::DescriptorPool;

    fn create_pool(
        &mut self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        // SAFETY: the device is valid for the lifetime of the backend.
        Ok(unsafe { self.device.create_descriptor_pool(&create_info, None)? })
    }

    fn allocate_set(
        &mut self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: pool and layout belong to this device.
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        sets.first()
            .copied()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn reset_pool(&mut self, pool: vk::DescriptorPool) -> Result<()> {
        // SAFETY: callers reset only after the sets' users have retired.
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn destroy_pool(&mut self, pool: vk::DescriptorPool) {
        // SAFETY: as for reset.
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }
}

/// Share of a pool given to one descriptor type, per set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

impl PoolRatio {
    pub const fn new(ty: vk::DescriptorType, ratio: f32) -> Self {
        Self { ty, ratio }
    }
}

/// Descriptor allocator configuration.
#[derive(Debug, Clone)]
pub struct DescriptorAllocatorConfig {
    /// Descriptor counts per set, by type.
    pub ratios: Vec<PoolRatio>,
    /// Sets in the first pool.
    pub initial_sets: u32,
    /// Size multiplier applied to each new pool.
    pub growth: f32,
    /// Largest pool ever created.
    pub max_sets_per_pool: u32,
}

impl Default for DescriptorAllocatorConfig {
    fn default() -> Self {
        Self {
            ratios: vec![
                PoolRatio::new(vk::DescriptorType::STORAGE_BUFFER, 4.0),
                PoolRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 2.0),
                PoolRatio::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2.0),
                PoolRatio::new(vk::DescriptorType::STORAGE_IMAGE, 1.0),
            ],
            initial_sets: 64,
            growth: 1.5,
            max_sets_per_pool: 4092,
        }
    }
}

impl DescriptorAllocatorConfig {
    /// Set the descriptor type ratios.
    pub fn with_ratios(mut self, ratios: Vec<PoolRatio>) -> Self {
        self.ratios = ratios;
        self
    }

    /// Set the number of sets in the first pool.
    pub fn with_initial_sets(mut self, initial_sets: u32) -> Self {
        self.initial_sets = initial_sets;
        self
    }

    /// Set the per-pool ceiling.
    pub fn with_max_sets_per_pool(mut self, max_sets: u32) -> Self {
        self.max_sets_per_pool = max_sets;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.ratios.is_empty() {
            return Err(GpuError::InvalidUsage(
                "descriptor allocator needs at least one pool ratio".into(),
            ));
        }
        if self.ratios.iter().any(|r| r.ratio.is_nan() || r.ratio <= 0.0) {
            return Err(GpuError::InvalidUsage(
                "descriptor pool ratios must be positive".into(),
            ));
        }
        if self.initial_sets == 0 || self.max_sets_per_pool < self.initial_sets {
            return Err(GpuError::InvalidUsage(format!(
                "invalid descriptor pool sizing: initial {} max {}",
                self.initial_sets, self.max_sets_per_pool
            )));
        }
        if self.growth.is_nan() || self.growth < 1.0 {
            return Err(GpuError::InvalidUsage(format!(
                "descriptor pool growth {} is below 1",
                self.growth
            )));
        }
        Ok(())
    }
}

/// Index of a pool in the allocator's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Ready,
    Full,
}

#[derive(Debug, Clone, Copy)]
struct PoolEntry<P> {
    handle: P,
    max_sets: u32,
    allocated: u32,
    state: PoolState,
}

/// Descriptor-set allocator that grows by adding pools.
pub struct DescriptorAllocator<B: DescriptorBackend> {
    backend: B,
    config: DescriptorAllocatorConfig,
    tracker: Arc<MemoryTracker>,
    pools: GrowableArray<PoolEntry<B::Pool>>,
    ready: GrowableArray<PoolId>,
    full: GrowableArray<PoolId>,
    sets_per_pool: u32,
    cap_reported: bool,
}

impl<B: DescriptorBackend> DescriptorAllocator<B> {
    /// Create the allocator with one pool of `config.initial_sets` sets.
    pub fn new(
        backend: B,
        config: DescriptorAllocatorConfig,
        tracker: Arc<MemoryTracker>,
    ) -> Result<Self> {
        config.validate()?;

        let mut allocator = Self {
            backend,
            sets_per_pool: config.initial_sets,
            config,
            tracker,
            pools: GrowableArray::new(MemoryTag::Renderer),
            ready: GrowableArray::new(MemoryTag::Renderer),
            full: GrowableArray::new(MemoryTag::Renderer),
            cap_reported: false,
        };

        let first = allocator.create_pool(allocator.sets_per_pool)?;
        allocator.ready.push(first);
        Ok(allocator)
    }

    fn create_pool(&mut self, max_sets: u32) -> Result<PoolId> {
        let sizes: Vec<_> = self
            .config
            .ratios
            .iter()
            .map(|r| vk::DescriptorPoolSize {
                ty: r.ty,
                descriptor_count: ((r.ratio * max_sets as f32).ceil() as u32).max(1),
            })
            .collect();

        let handle = self.backend.create_pool(max_sets, &sizes)?;
        let id = PoolId(self.pools.len() as u32);
        self.pools.push(PoolEntry {
            handle,
            max_sets,
            allocated: 0,
            state: PoolState::Ready,
        });
        self.tracker.record_alloc(MemoryTag::DescriptorPool, 0);

        tracing::debug!(pool = id.0, max_sets, "created descriptor pool");
        Ok(id)
    }

    /// Pop a READY pool, creating a larger one if none is left.
    fn acquire_pool(&mut self) -> Result<PoolId> {
        if let Some(id) = self.ready.try_pop() {
            return Ok(id);
        }

        let grown = (self.sets_per_pool as f32 * self.config.growth).ceil() as u32;
        if grown > self.config.max_sets_per_pool && !self.cap_reported {
            tracing::warn!(
                max_sets = self.config.max_sets_per_pool,
                pools = self.pools.len(),
                "descriptor pool size reached its ceiling; further growth adds pools of that size"
            );
            self.cap_reported = true;
        }
        self.sets_per_pool = grown.min(self.config.max_sets_per_pool);
        self.create_pool(self.sets_per_pool)
    }

    fn try_allocate_from(
        &mut self,
        id: PoolId,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result> {
        let entry = self.pools[id.0 as usize];
        let set = self.backend.allocate_set(entry.handle, layout)?;
        self.pools[id.0 as usize].allocated += 1;
        Ok(set)
    }

    fn mark_full(&mut self, id: PoolId) {
        self.pools[id.0 as usize].state = PoolState::Full;
        self.full.push(id);
    }

    fn mark_ready(&mut self, id: PoolId) {
        self.pools[id.0 as usize].state = PoolState::Ready;
        self.ready.push(id);
    }

    /// Allocate a descriptor set for `layout`.
    ///
    /// An exhausted or fragmented pool is moved to FULL and the allocation is
    /// retried once on another pool. A second failure is fatal.
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let id = self.acquire_pool()?;
        match self.try_allocate_from(id, layout) {
            Ok(set) => {
                self.mark_ready(id);
                return Ok(set);
            }
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                self.mark_full(id);
            }
            Err(e) => {
                self.mark_ready(id);
                tracing::error!("descriptor set allocation failed: {e}");
                return Err(GpuError::Vulkan(e));
            }
        }

        let retry = self.acquire_pool()?;
        match self.try_allocate_from(retry, layout) {
            Ok(set) => {
                self.mark_ready(retry);
                Ok(set)
            }
            Err(source) => {
                self.mark_full(retry);
                tracing::error!(
                    sets_per_pool = self.sets_per_pool,
                    pools = self.pools.len(),
                    "descriptor set allocation failed after retry: {source}"
                );
                Err(GpuError::DescriptorPoolExhausted {
                    sets_per_pool: self.sets_per_pool,
                    source,
                })
            }
        }
    }

    /// Reset every pool and return all of them to READY.
    ///
    /// Sets handed out earlier become invalid. Only call once the GPU work
    /// using them has retired.
    pub fn reset_all(&mut self) -> Result<()> {
        for index in 0..self.pools.len() {
            let entry = self.pools[index];
            self.backend.reset_pool(entry.handle)?;
            self.pools[index].allocated = 0;
        }

        while let Some(id) = self.full.try_pop() {
            self.mark_ready(id);
        }
        Ok(())
    }

    /// Destroy every pool.
    pub fn destroy_all(&mut self) {
        while let Some(entry) = self.pools.try_pop() {
            self.backend.destroy_pool(entry.handle);
            self.tracker.record_free(MemoryTag::DescriptorPool, 0);
        }
        self.ready.clear();
        self.full.clear();
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn full_count(&self) -> usize {
        self.full.len()
    }

    /// Sets handed out since the last reset.
    pub fn allocated_sets(&self) -> u32 {
        self.pools.iter().map(|p| p.allocated).sum()
    }

    /// Sets all pools can hold together.
    pub fn total_capacity(&self) -> u32 {
        self.pools.iter().map(|p| p.max_sets).sum()
    }

    /// Size of the most recently created pool.
    pub fn sets_per_pool(&self) -> u32 {
        self.sets_per_pool
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[cfg(test)]
    fn check_queues(&self) {
        for (index, entry) in self.pools.iter().enumerate() {
            let id = PoolId(index as u32);
            let in_ready = self.ready.iter().filter(|p| **p == id).count();
            let in_full = self.full.iter().filter(|p| **p == id).count();
            assert_eq!(in_ready + in_full, 1, "pool {index} must be in one queue");
            let expected = if in_ready == 1 {
                PoolState::Ready
            } else {
                PoolState::Full
            };
            assert_eq!(entry.state, expected);
        }
    }
}

impl<B: DescriptorBackend> Drop for DescriptorAllocator<B> {
    fn drop(&mut self) {
        if !self.pools.is_empty() {
            self.destroy_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[derive(Default)]
    struct MockBackend {
        capacity: Vec<u32>,
        used: Vec<u32>,
        destroyed: Vec<bool>,
        next_set: u64,
        fail_everything: bool,
    }

    impl DescriptorBackend for MockBackend {
        type Pool = usize;

        fn create_pool(&mut self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> Result<usize> {
            assert!(sizes.iter().all(|s| s.descriptor_count >= max_sets));
            self.capacity.push(max_sets);
            self.used.push(0);
            self.destroyed.push(false);
            Ok(self.capacity.len() - 1)
        }

        fn allocate_set(
            &mut self,
            pool: usize,
            _layout: vk::DescriptorSetLayout,
        ) -> std::result::Result<vk::DescriptorSet, vk::Result> {
            if self.fail_everything || self.used[pool] == self.capacity[pool] {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }
            self.used[pool] += 1;
            self.next_set += 1;
            Ok(vk::DescriptorSet::from_raw(self.next_set))
        }

        fn reset_pool(&mut self, pool: usize) -> Result<()> {
            self.used[pool] = 0;
            Ok(())
        }

        fn destroy_pool(&mut self, pool: usize) {
            assert!(!self.destroyed[pool], "pool {pool} destroyed twice");
            self.destroyed[pool] = true;
        }
    }

    fn allocator(initial: u32, max: u32) -> DescriptorAllocator<MockBackend> {
        let config = DescriptorAllocatorConfig::default()
            .with_ratios(vec![PoolRatio::new(vk::DescriptorType::STORAGE_BUFFER, 1.0)])
            .with_initial_sets(initial)
            .with_max_sets_per_pool(max);
        DescriptorAllocator::new(MockBackend::default(), config, Arc::new(MemoryTracker::new()))
            .unwrap()
    }

    fn layout() -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(1)
    }

    #[test]
    fn starts_with_one_ready_pool() {
        let alloc = allocator(4, 4092);
        assert_eq!(alloc.pool_count(), 1);
        assert_eq!(alloc.ready_count(), 1);
        assert_eq!(alloc.full_count(), 0);
        alloc.check_queues();
    }

    #[test]
    fn grows_by_half_when_pool_is_exhausted() {
        let mut alloc = allocator(4, 4092);
        for _ in 0..4 {
            alloc.allocate(layout()).unwrap();
        }
        assert_eq!(alloc.pool_count(), 1);

        alloc.allocate(layout()).unwrap();
        assert_eq!(alloc.pool_count(), 2);
        assert_eq!(alloc.sets_per_pool(), 6);
        assert_eq!(alloc.full_count(), 1);
        assert_eq!(alloc.backend().capacity, vec![4, 6]);
        alloc.check_queues();
    }

    #[test]
    fn growth_is_clamped_per_pool() {
        let mut alloc = allocator(4, 8);
        for _ in 0..(4 + 6 + 8 + 8) {
            alloc.allocate(layout()).unwrap();
        }
        assert_eq!(alloc.backend().capacity, vec![4, 6, 8, 8]);
        assert_eq!(alloc.sets_per_pool(), 8);
        alloc.check_queues();
    }

    #[test]
    fn reset_all_returns_every_pool_to_ready() {
        let mut alloc = allocator(2, 4092);
        for _ in 0..10 {
            alloc.allocate(layout()).unwrap();
        }
        let pools = alloc.pool_count();
        assert!(alloc.full_count() > 0);

        alloc.reset_all().unwrap();
        assert_eq!(alloc.allocated_sets(), 0);
        assert_eq!(alloc.full_count(), 0);
        assert_eq!(alloc.ready_count(), pools);
        alloc.check_queues();

        for _ in 0..alloc.sets_per_pool() {
            alloc.allocate(layout()).unwrap();
        }
        assert_eq!(alloc.pool_count(), pools);
    }

    #[test]
    fn second_failure_is_pool_exhaustion() {
        let mut alloc = allocator(2, 4092);
        alloc.backend.fail_everything = true;
        let err = alloc.allocate(layout()).unwrap_err();
        assert!(matches!(err, GpuError::DescriptorPoolExhausted { .. }));
        assert!(err.is_fatal());
        assert_eq!(alloc.full_count(), 2);
        alloc.check_queues();
    }

    #[test]
    fn destroy_all_releases_pools_and_accounting() {
        let tracker = Arc::new(MemoryTracker::new());
        let config = DescriptorAllocatorConfig::default().with_initial_sets(1);
        let mut alloc =
            DescriptorAllocator::new(MockBackend::default(), config, tracker.clone()).unwrap();
        for _ in 0..5 {
            alloc.allocate(layout()).unwrap();
        }
        assert!(tracker.usage(MemoryTag::DescriptorPool).allocations > 1);

        alloc.destroy_all();
        assert!(alloc.backend().destroyed.iter().all(|d| *d));
        assert!(tracker.is_clear(&[MemoryTag::DescriptorPool]));
    }

    #[test]
    fn rejects_bad_config() {
        let config = DescriptorAllocatorConfig::default().with_initial_sets(0);
        assert!(DescriptorAllocator::new(
            MockBackend::default(),
            config,
            Arc::new(MemoryTracker::new())
        )
        .is_err());
    }
}
