mod keys;
mod pool_allocator;
mod scaffold;
mod set_allocator;
mod system;

pub use keys::{DescriptorPoolKey, PoolAllocatorKey, SetAllocatorKey};
pub use pool_allocator::{AllocatedPool, DescriptorPoolAllocator, PoolCapacity, PoolUsage};
pub use scaffold::{
    BufferRange, DescriptorResource, DescriptorSetScaffold, ScaffoldEntry, ScaffoldShape,
};
pub use set_allocator::DescriptorSetAllocator;
pub use system::{DescriptorSystem, PoolAllocatorHandle, SetAllocatorHandle};
