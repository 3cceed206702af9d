use std::{collections::VecDeque, fmt, mem::ManuallyDrop, ops::Deref};

use crossbeam_channel::{Receiver, Sender};

use crate::frame::FrameInfo;

/// Exclusive handle to a resource owned by one of the resource systems.
///
/// Dropping the handle doesn't destroy anything: the resource goes back to
/// its system, which destroys it once the GPU has retired every frame that
/// could still reference it.
pub struct Owned<T> {
    resource: ManuallyDrop<T>,
    retire: Sender<T>,
}

impl<T> Owned<T> {
    pub(crate) fn new(resource: T, retire: Sender<T>) -> Self {
        Self {
            resource: ManuallyDrop::new(resource),
            retire,
        }
    }

    pub fn get(&self) -> &T {
        self
    }
}

impl<T> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T: fmt::Debug> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&*self.resource).finish()
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        // SAFETY: `resource` is never touched again after this.
        let resource = unsafe { ManuallyDrop::take(&mut self.resource) };
        if self.retire.send(resource).is_err() {
            log::warn!(
                "{} handle outlived its owning system, leaking it",
                std::any::type_name::<T>()
            );
        }
    }
}

/// Holds released resources until the frame they were released in retires.
///
/// Entries are tagged with the `current_frame_id` at the time they were
/// released, so the queue is always ordered by tag.
pub struct RetireQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    pending: VecDeque<(u64, T)>,
    frame: FrameInfo,
}

impl<T> Default for RetireQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RetireQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            pending: VecDeque::new(),
            frame: FrameInfo::default(),
        }
    }

    pub fn frame(&self) -> FrameInfo {
        self.frame
    }

    /// Wraps a resource in a handle that returns it here when dropped.
    pub fn wrap(&self, resource: T) -> Owned<T> {
        Owned::new(resource, self.sender.clone())
    }

    /// Queues a resource that isn't behind a handle.
    pub fn retire(&mut self, resource: T) {
        self.collect();
        self.pending.push_back((self.frame.current_frame_id, resource));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len() + self.receiver.len()
    }

    /// Advances to `frame` and destroys everything released during a frame
    /// that has now finished. Returns how many resources were destroyed.
    pub fn begin_frame(&mut self, frame: FrameInfo, mut destroy: impl FnMut(T)) -> usize {
        // Anything dropped since the last call was dropped during the
        // previous frame.
        self.collect();
        self.frame = frame;

        let mut destroyed = 0;
        while self
            .pending
            .front()
            .is_some_and(|(tag, _)| frame.is_retired(*tag))
        {
            if let Some((_, resource)) = self.pending.pop_front() {
                destroy(resource);
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Destroys everything regardless of frame. The caller must have waited
    /// for the device to go idle.
    pub fn flush(&mut self, mut destroy: impl FnMut(T)) -> usize {
        self.collect();
        let destroyed = self.pending.len();
        for (_, resource) in self.pending.drain(..) {
            destroy(resource);
        }
        destroyed
    }

    fn collect(&mut self) {
        let tag = self.frame.current_frame_id;
        while let Ok(resource) = self.receiver.try_recv() {
            self.pending.push_back((tag, resource));
        }
    }
}
