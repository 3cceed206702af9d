mod buffer;
mod pipeline;
mod retire;

pub use buffer::{Buffer, BufferHandle, BufferSpec, BufferSystem, BufferUsage, MemoryLocation};
pub use pipeline::{LayoutOwnership, Pipeline, PipelineHandle, PipelineSystem};
pub use retire::{Owned, RetireQueue};
