pub const DEFAULT_FRAME_QUEUE_DEPTH: u32 = 2;
pub const DEFAULT_COMMAND_POOL_SIZE: u32 = 8;
pub const DEFAULT_EVICTION_THRESHOLD: u32 = 8;
pub const DEFAULT_MAX_SETS_PER_POOL: u32 = 64;

/// Tunables shared by the resource systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub frame_queue_depth: u32,
    /// Execution contexts (command buffer + fence) per command pool.
    pub command_pool_size: u32,
    /// Consecutive idle frames before a cached descriptor set is evicted.
    pub descriptor_eviction_threshold: u32,
    /// Timeout for blocking fence waits, in nanoseconds.
    pub fence_timeout_ns: u64,
    pub max_sets_per_pool: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            frame_queue_depth: DEFAULT_FRAME_QUEUE_DEPTH,
            command_pool_size: DEFAULT_COMMAND_POOL_SIZE,
            descriptor_eviction_threshold: DEFAULT_EVICTION_THRESHOLD,
            fence_timeout_ns: u64::MAX,
            max_sets_per_pool: DEFAULT_MAX_SETS_PER_POOL,
        }
    }
}

impl LifecycleConfig {
    pub fn frame_queue_depth(mut self, depth: u32) -> Self {
        self.frame_queue_depth = depth;
        self
    }

    pub fn command_pool_size(mut self, size: u32) -> Self {
        self.command_pool_size = size;
        self
    }

    pub fn descriptor_eviction_threshold(mut self, frames: u32) -> Self {
        self.descriptor_eviction_threshold = frames;
        self
    }

    pub fn fence_timeout_ns(mut self, timeout: u64) -> Self {
        self.fence_timeout_ns = timeout;
        self
    }

    pub fn max_sets_per_pool(mut self, max_sets: u32) -> Self {
        self.max_sets_per_pool = max_sets;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.frame_queue_depth > 0, "frame_queue_depth must be > 0");
        anyhow::ensure!(self.command_pool_size > 0, "command_pool_size must be > 0");
        anyhow::ensure!(
            self.descriptor_eviction_threshold > 0,
            "descriptor_eviction_threshold must be > 0"
        );
        anyhow::ensure!(self.max_sets_per_pool > 0, "max_sets_per_pool must be > 0");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = LifecycleConfig::default()
            .frame_queue_depth(3)
            .command_pool_size(4)
            .descriptor_eviction_threshold(2);

        assert_eq!(config.frame_queue_depth, 3);
        assert_eq!(config.command_pool_size, 4);
        assert_eq!(config.descriptor_eviction_threshold, 2);
        assert_eq!(config.max_sets_per_pool, DEFAULT_MAX_SETS_PER_POOL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_depth_is_rejected() {
        assert!(LifecycleConfig::default().frame_queue_depth(0).validate().is_err());
    }
}
