/// Which frame is being recorded and which frame the GPU has fully retired.
///
/// A resource last touched during `current_frame_id = F` may be destroyed once
/// `finished_frame_id >= F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub current_frame_id: u64,
    pub finished_frame_id: u64,
    pub current_frame_index: u32,
    pub frame_queue_depth: u32,
}

impl FrameInfo {
    pub fn new(frame_queue_depth: u32) -> Self {
        assert!(frame_queue_depth > 0, "frame queue depth must be non-zero");
        Self {
            current_frame_id: 0,
            finished_frame_id: 0,
            current_frame_index: 0,
            frame_queue_depth,
        }
    }

    /// True once the GPU has retired `frame_id`.
    #[inline]
    pub fn is_retired(&self, frame_id: u64) -> bool {
        self.finished_frame_id >= frame_id
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.current_frame_index as usize
    }
}

/// Produces successive [`FrameInfo`] values for a render loop.
pub struct FrameClock {
    info: FrameInfo,
}

impl FrameClock {
    pub fn new(frame_queue_depth: u32) -> Self {
        Self {
            info: FrameInfo::new(frame_queue_depth),
        }
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    /// Moves to the next frame. `finished_frame_id` is clamped so it never
    /// runs ahead of the frame being recorded.
    pub fn advance(&mut self, finished_frame_id: u64) -> FrameInfo {
        let info = &mut self.info;
        info.current_frame_id += 1;
        info.current_frame_index = (info.current_frame_index + 1) % info.frame_queue_depth;
        info.finished_frame_id = finished_frame_id
            .max(info.finished_frame_id)
            .min(info.current_frame_id);
        self.info
    }
}
