//! Frame-synchronised lifetime management for Vulkan command buffers,
//! descriptor sets, buffers and pipelines.
//!
//! Every system follows the same frame protocol: `begin_frame` with the new
//! [`FrameInfo`] reclaims whatever the GPU has finished with, work is recorded,
//! and `end_frame` flushes it. Nothing is destroyed while a frame that may
//! still reference it is in flight.

pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod resource;
pub mod vulkan;

#[cfg(test)]
mod testing;

pub use config::LifecycleConfig;
pub use device::GpuDevice;
pub use frame::{FrameClock, FrameInfo};
