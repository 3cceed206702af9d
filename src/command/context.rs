use ash::vk;
use crossbeam_channel::Sender;

use super::future::Completion;

/// One command buffer and its fence, owned by a pool slot.
///
/// free -> began (recording) -> submitted -> complete -> free (pool reset)
pub struct ExecutionContext {
    pub queue: vk::Queue,
    pub fence: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
    pub began: bool,
    pub submitted: bool,
    pub complete: bool,
    last_polled_frame: Option<u64>,
    waiters: Vec<Sender<Completion>>,
}

impl ExecutionContext {
    pub(crate) fn new(command_buffer: vk::CommandBuffer, fence: vk::Fence) -> Self {
        Self {
            queue: vk::Queue::null(),
            fence,
            command_buffer,
            began: false,
            submitted: false,
            complete: false,
            last_polled_frame: None,
            waiters: Vec::new(),
        }
    }

    /// Recording and not yet handed to a queue.
    pub fn is_open(&self) -> bool {
        self.began && !self.submitted && !self.complete
    }

    pub fn is_in_flight(&self) -> bool {
        self.submitted && !self.complete
    }

    pub(crate) fn add_waiter(&mut self, waiter: Sender<Completion>) {
        self.waiters.push(waiter);
    }

    /// Returns false if this context was already polled during `frame_id`.
    pub(crate) fn mark_polled(&mut self, frame_id: u64) -> bool {
        if self.last_polled_frame == Some(frame_id) {
            return false;
        }
        self.last_polled_frame = Some(frame_id);
        true
    }

    pub(crate) fn resolve(&mut self, result: Completion) {
        for waiter in self.waiters.drain(..) {
            // A dropped future simply isn't interested any more.
            let _ = waiter.send(result);
        }
    }

    pub(crate) fn recycle(&mut self) {
        debug_assert!(self.waiters.is_empty());
        self.queue = vk::Queue::null();
        self.began = false;
        self.submitted = false;
        self.complete = false;
        self.last_polled_frame = None;
    }
}
