use std::sync::Arc;

use anyhow::Context;
use ash::vk;

use crate::{device::GpuDevice, frame::FrameInfo};

use super::{
    future::{CommandFuture, completion_channel},
    pool::CommandPoolBlock,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ContextRef {
    pool: usize,
    slot: usize,
}

/// Runs recorded command buffers against device queues.
///
/// `sync` records, submits and blocks on the fence. `async_submit` records into
/// a context shared by every async call on the same queue until `end_frame`
/// submits it; `begin_frame` observes the fences and resolves the futures.
pub struct CommandProcessor<D: GpuDevice = ash::Device> {
    device: Arc<D>,
    pools: Vec<CommandPoolBlock>,
    command_pool_size: u32,
    fence_timeout_ns: u64,
    frame: FrameInfo,
}

impl<D: GpuDevice> CommandProcessor<D> {
    pub fn new(device: Arc<D>, command_pool_size: u32, fence_timeout_ns: u64) -> Self {
        assert!(command_pool_size > 0, "command pool size must be non-zero");
        Self {
            device,
            pools: Vec::new(),
            command_pool_size,
            fence_timeout_ns,
            frame: FrameInfo::default(),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Records `command` into a fresh command buffer, submits it and blocks
    /// until the GPU has executed it.
    pub fn sync<F>(&mut self, queue: vk::Queue, queue_family: u32, command: F) -> anyhow::Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> anyhow::Result<()>,
    {
        let _span = tracing::trace_span!("command_sync").entered();
        let at = self.acquire(queue, queue_family)?;
        let cmd = self.begin(at)?;

        if let Err(e) = command(cmd).and_then(|_| self.end(at)) {
            self.pools[at.pool].abandon(at.slot);
            self.reset_if_idle(at.pool)?;
            return Err(e).context("failed to record sync command buffer");
        }

        let fence = self.pools[at.pool].context(at.slot).fence;
        let cmds = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        if let Err(e) = self.device.queue_submit(queue, &[submit], fence) {
            self.pools[at.pool].abandon(at.slot);
            self.reset_if_idle(at.pool)?;
            return Err(e).context("failed to submit sync command buffer");
        }
        self.pools[at.pool].mark_submitted(at.slot);

        // On failure the context stays in flight; begin_frame keeps polling it.
        self.device
            .wait_for_fences(&[fence], true, self.fence_timeout_ns)
            .context("failed waiting for sync command fence")?;
        self.device
            .reset_fences(&[fence])
            .context("failed to reset sync command fence")?;

        let pool = &mut self.pools[at.pool];
        pool.mark_complete(at.slot);
        pool.context_mut(at.slot).resolve(Ok(()));
        self.reset_if_idle(at.pool)?;
        Ok(())
    }

    /// Records `command` into the context currently open for `queue`, opening
    /// one if needed. The buffer is submitted by the next `end_frame`.
    ///
    /// The buffer is shared with every other `async_submit` on the same queue
    /// this frame, so if `command` fails whatever it already recorded is still
    /// submitted. Record all-or-nothing.
    pub fn async_submit<F>(
        &mut self,
        queue: vk::Queue,
        queue_family: u32,
        command: F,
    ) -> anyhow::Result<CommandFuture>
    where
        F: FnOnce(vk::CommandBuffer) -> anyhow::Result<()>,
    {
        let _span = tracing::trace_span!("command_async").entered();
        let (at, cmd) = match self.find_open(queue, queue_family) {
            Some(at) => (at, self.pools[at.pool].context(at.slot).command_buffer),
            None => {
                let at = self.acquire(queue, queue_family)?;
                let cmd = self.begin(at)?;
                (at, cmd)
            }
        };

        command(cmd).context("failed to record async command")?;

        let (waiter, future) = completion_channel();
        self.pools[at.pool].context_mut(at.slot).add_waiter(waiter);
        Ok(future)
    }

    /// Polls every in-flight fence (once per context per frame), resolves the
    /// futures of finished work and resets pools that became idle.
    pub fn begin_frame(&mut self, frame: FrameInfo) -> anyhow::Result<()> {
        let _span = tracing::trace_span!("command_begin_frame").entered();
        self.frame = frame;
        let mut first_error: Option<anyhow::Error> = None;

        for pool_index in 0..self.pools.len() {
            for slot in 0..self.pools[pool_index].handed_out() {
                if let Err(e) = self.poll_context(ContextRef {
                    pool: pool_index,
                    slot,
                }) {
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = self.reset_if_idle(pool_index) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ends and submits every command buffer opened by `async_submit` since the
    /// last `end_frame`.
    pub fn end_frame(&mut self) -> anyhow::Result<()> {
        let _span = tracing::trace_span!("command_end_frame").entered();
        let mut first_error: Option<anyhow::Error> = None;

        for pool_index in 0..self.pools.len() {
            for slot in 0..self.pools[pool_index].handed_out() {
                if !self.pools[pool_index].context(slot).is_open() {
                    continue;
                }
                if let Err(e) = self.submit_open(ContextRef {
                    pool: pool_index,
                    slot,
                }) {
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = self.reset_if_idle(pool_index) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Submits pending work, waits for everything in flight and destroys all
    /// pools and fences.
    pub fn terminate(&mut self) -> anyhow::Result<()> {
        if self.pools.is_empty() {
            return Ok(());
        }
        log::trace!("Terminating CommandProcessor");
        let submitted = self.end_frame();

        for pool in &mut self.pools {
            let fences = pool.in_flight_fences();
            let waited = if fences.is_empty() {
                Ok(())
            } else {
                self.device
                    .wait_for_fences(&fences, true, self.fence_timeout_ns)
            };
            for slot in 0..pool.handed_out() {
                if pool.context(slot).is_in_flight() {
                    pool.mark_complete(slot);
                    pool.context_mut(slot).resolve(waited);
                }
            }
            if let Err(e) = waited {
                log::error!("failed waiting for command fences during terminate: {e:?}");
            }
            pool.destroy(self.device.as_ref());
        }
        self.pools.clear();
        submitted
    }

    fn find_open(&self, queue: vk::Queue, queue_family: u32) -> Option<ContextRef> {
        self.pools
            .iter()
            .enumerate()
            .filter(|(_, pool)| pool.queue_family == queue_family)
            .find_map(|(index, pool)| {
                pool.find_open(queue).map(|slot| ContextRef { pool: index, slot })
            })
    }

    fn acquire(&mut self, queue: vk::Queue, queue_family: u32) -> anyhow::Result<ContextRef> {
        let existing = self
            .pools
            .iter()
            .position(|pool| pool.queue_family == queue_family && pool.has_free_slot());

        let pool_index = match existing {
            Some(index) => index,
            None => {
                let block =
                    CommandPoolBlock::new(self.device.as_ref(), queue_family, self.command_pool_size)
                        .with_context(|| {
                            format!("failed to grow command pools for queue family {queue_family}")
                        })?;
                self.pools.push(block);
                self.pools.len() - 1
            }
        };

        let slot = self.pools[pool_index]
            .take_slot(queue)
            .context("command pool reported a free slot but had none")?;
        Ok(ContextRef {
            pool: pool_index,
            slot,
        })
    }

    fn begin(&mut self, at: ContextRef) -> anyhow::Result<vk::CommandBuffer> {
        let cmd = self.pools[at.pool].context(at.slot).command_buffer;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.pools[at.pool].abandon(at.slot);
            self.reset_if_idle(at.pool)?;
            return Err(e).context("failed to begin command buffer");
        }
        self.pools[at.pool].context_mut(at.slot).began = true;
        Ok(cmd)
    }

    fn end(&self, at: ContextRef) -> anyhow::Result<()> {
        let cmd = self.pools[at.pool].context(at.slot).command_buffer;
        self.device
            .end_command_buffer(cmd)
            .context("failed to end command buffer")
    }

    fn submit_open(&mut self, at: ContextRef) -> anyhow::Result<()> {
        let (queue, cmd, fence) = {
            let ctx = self.pools[at.pool].context(at.slot);
            (ctx.queue, ctx.command_buffer, ctx.fence)
        };

        let cmds = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        let result = self
            .device
            .end_command_buffer(cmd)
            .and_then(|_| self.device.queue_submit(queue, &[submit], fence));

        let pool = &mut self.pools[at.pool];
        match result {
            Ok(()) => {
                pool.mark_submitted(at.slot);
                Ok(())
            }
            Err(e) => {
                pool.abandon(at.slot);
                pool.context_mut(at.slot).resolve(Err(e));
                Err(e).context("failed to submit async command buffer")
            }
        }
    }

    fn poll_context(&mut self, at: ContextRef) -> anyhow::Result<()> {
        let frame_id = self.frame.current_frame_id;
        let pool = &mut self.pools[at.pool];
        let ctx = pool.context_mut(at.slot);
        if !ctx.is_in_flight() || !ctx.mark_polled(frame_id) {
            return Ok(());
        }
        let fence = ctx.fence;

        match self.device.fence_status(fence) {
            Ok(false) => Ok(()),
            Ok(true) => {
                let reset = self.device.reset_fences(&[fence]);
                pool.mark_complete(at.slot);
                pool.context_mut(at.slot).resolve(reset);
                reset.context("failed to reset async command fence")
            }
            Err(e) => {
                pool.mark_complete(at.slot);
                pool.context_mut(at.slot).resolve(Err(e));
                Err(e).context("failed to query async command fence")
            }
        }
    }

    fn reset_if_idle(&mut self, pool_index: usize) -> anyhow::Result<()> {
        self.pools[pool_index].try_reset(self.device.as_ref())?;
        Ok(())
    }
}

impl<D: GpuDevice> Drop for CommandProcessor<D> {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            log::error!("failed to terminate CommandProcessor: {e:?}");
        }
    }
}
