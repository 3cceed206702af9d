mod context;
mod future;
mod pool;
mod processor;

pub use context::ExecutionContext;
pub use future::CommandFuture;
pub use processor::CommandProcessor;
