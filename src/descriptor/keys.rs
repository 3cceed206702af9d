use slotmap::new_key_type;

new_key_type! { pub struct DescriptorPoolKey; }

new_key_type! { pub struct PoolAllocatorKey; }
new_key_type! { pub struct SetAllocatorKey; }
