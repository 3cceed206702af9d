use std::sync::Arc;

use anyhow::Context;
use ash::vk;
use vk_mem::Alloc;

use crate::{frame::FrameInfo, vulkan::DeviceContext};

use super::retire::{Owned, RetireQueue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Storage,
    Uniform,
    Vertex,
    Index,
    Indirect,
    Staging,
}

impl BufferUsage {
    pub fn flags(self) -> vk::BufferUsageFlags {
        let transfer = vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
        match self {
            BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER | transfer,
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER | transfer,
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | transfer,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | transfer,
            BufferUsage::Indirect => {
                vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER | transfer
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    DeviceLocal,
    HostVisible,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferSpec {
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    pub size: vk::DeviceSize,
    pub debug_name: Option<String>,
}

impl BufferSpec {
    pub fn new(usage: BufferUsage, location: MemoryLocation, size: vk::DeviceSize) -> Self {
        Self {
            usage,
            location,
            size,
            debug_name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }

    fn allocation_info(&self) -> vk_mem::AllocationCreateInfo {
        match self.location {
            MemoryLocation::DeviceLocal => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                ..Default::default()
            },
            // Coherent so uploads never need an explicit flush.
            MemoryLocation::HostVisible => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                required_flags: vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            },
        }
    }
}

pub struct Buffer {
    pub vk_buffer: vk::Buffer,
    pub allocation: vk_mem::Allocation,
    pub size: vk::DeviceSize,
}

pub type BufferHandle = Owned<Buffer>;

/// Owns vk-mem backed buffers and defers their destruction until every
/// frame that could have used them has retired.
pub struct BufferSystem {
    allocator: Arc<vk_mem::Allocator>,
    device_context: DeviceContext,
    retired: RetireQueue<Buffer>,
}

impl BufferSystem {
    pub fn new(allocator: Arc<vk_mem::Allocator>, device_context: DeviceContext) -> Self {
        Self {
            allocator,
            device_context,
            retired: RetireQueue::new(),
        }
    }

    /// Takes ownership of a buffer allocated from this system's allocator.
    pub fn emplace(&self, buffer: Buffer) -> BufferHandle {
        log::trace!("Managing buffer {:?} ({} bytes)", buffer.vk_buffer, buffer.size);
        self.retired.wrap(buffer)
    }

    pub fn create_buffer(&self, spec: &BufferSpec) -> anyhow::Result<BufferHandle> {
        let buffer = self.allocate(spec)?;
        Ok(self.emplace(buffer))
    }

    /// Creates a host-visible buffer holding `data`.
    pub fn create_buffer_with_data<T: bytemuck::Pod>(
        &self,
        usage: BufferUsage,
        data: &[T],
        debug_name: Option<&str>,
    ) -> anyhow::Result<BufferHandle> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut spec = BufferSpec::new(usage, MemoryLocation::HostVisible, bytes.len() as u64);
        spec.debug_name = debug_name.map(str::to_owned);

        let mut buffer = self.allocate(&spec)?;
        let upload = unsafe {
            self.allocator
                .map_memory(&mut buffer.allocation)
                .map(|ptr| {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                    self.allocator.unmap_memory(&mut buffer.allocation);
                })
        };

        if let Err(e) = upload {
            // Never submitted, so it can go right away.
            unsafe {
                self.allocator
                    .destroy_buffer(buffer.vk_buffer, &mut buffer.allocation)
            };
            return Err(e).context("failed to upload buffer contents");
        }

        Ok(self.emplace(buffer))
    }

    /// Same as dropping the handle.
    pub fn destroy_buffer(&self, handle: BufferHandle) {
        drop(handle);
    }

    pub fn pending_destruction(&self) -> usize {
        self.retired.pending_count()
    }

    pub fn begin_frame(&mut self, frame: FrameInfo) -> usize {
        let _span = tracing::trace_span!("BufferSystem::begin_frame").entered();
        let allocator = self.allocator.as_ref();
        self.retired
            .begin_frame(frame, |buffer| destroy(allocator, buffer))
    }

    /// Destroys every released buffer. The device must be idle.
    pub fn terminate(&mut self) {
        let allocator = self.allocator.as_ref();
        let destroyed = self.retired.flush(|buffer| destroy(allocator, buffer));
        if destroyed > 0 {
            log::debug!("Destroyed {destroyed} buffers on terminate");
        }
    }

    fn allocate(&self, spec: &BufferSpec) -> anyhow::Result<Buffer> {
        if spec.size == 0 {
            anyhow::bail!("cannot create an empty buffer");
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(spec.size)
            .usage(spec.usage.flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (vk_buffer, mut allocation) =
            unsafe { self.allocator.create_buffer(&buffer_info, &spec.allocation_info()) }
                .context("failed to create buffer")?;

        if let Some(name) = spec.debug_name.as_deref()
            && let Err(e) = self.device_context.name_object(vk_buffer, name)
        {
            unsafe { self.allocator.destroy_buffer(vk_buffer, &mut allocation) };
            return Err(e);
        }

        Ok(Buffer {
            vk_buffer,
            allocation,
            size: spec.size,
        })
    }
}

impl Drop for BufferSystem {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn destroy(allocator: &vk_mem::Allocator, mut buffer: Buffer) {
    log::trace!("Destroying buffer {:?}", buffer.vk_buffer);
    unsafe { allocator.destroy_buffer(buffer.vk_buffer, &mut buffer.allocation) };
}
