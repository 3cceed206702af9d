use std::sync::Arc;

use anyhow::Context;
use ash::vk;

use crate::{device::GpuDevice, frame::FrameInfo};

use super::retire::{Owned, RetireQueue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutOwnership {
    /// The layout outlives the pipeline and is destroyed by someone else.
    Shared,
    /// The layout is destroyed together with the pipeline.
    Owned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    owns_layout: bool,
}

impl Pipeline {
    pub fn new(
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        ownership: LayoutOwnership,
    ) -> Self {
        Self {
            pipeline,
            layout,
            bind_point,
            owns_layout: ownership == LayoutOwnership::Owned,
        }
    }

    pub fn owns_layout(&self) -> bool {
        self.owns_layout
    }
}

pub type PipelineHandle = Owned<Pipeline>;

/// Hands out pipelines whose destruction waits for the frames using them.
pub struct PipelineSystem<D: GpuDevice = ash::Device> {
    device: Arc<D>,
    retired: RetireQueue<Pipeline>,
}

impl<D: GpuDevice> PipelineSystem<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            retired: RetireQueue::new(),
        }
    }

    pub fn emplace(&self, pipeline: Pipeline) -> PipelineHandle {
        log::trace!("Managing pipeline {:?}", pipeline.pipeline);
        self.retired.wrap(pipeline)
    }

    /// Creates a graphics pipeline using the layout named in `info`. On
    /// failure the layout stays with the caller even if `ownership` is
    /// [`LayoutOwnership::Owned`].
    pub fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
        ownership: LayoutOwnership,
    ) -> anyhow::Result<PipelineHandle> {
        let pipeline = self
            .device
            .create_graphics_pipelines(std::slice::from_ref(info))
            .context("failed to create graphics pipeline")?
            .into_iter()
            .next()
            .context("no graphics pipeline returned")?;

        Ok(self.emplace(Pipeline::new(
            pipeline,
            info.layout,
            vk::PipelineBindPoint::GRAPHICS,
            ownership,
        )))
    }

    pub fn create_compute_pipeline(
        &self,
        info: &vk::ComputePipelineCreateInfo<'_>,
        ownership: LayoutOwnership,
    ) -> anyhow::Result<PipelineHandle> {
        let pipeline = self
            .device
            .create_compute_pipelines(std::slice::from_ref(info))
            .context("failed to create compute pipeline")?
            .into_iter()
            .next()
            .context("no compute pipeline returned")?;

        Ok(self.emplace(Pipeline::new(
            pipeline,
            info.layout,
            vk::PipelineBindPoint::COMPUTE,
            ownership,
        )))
    }

    /// Same as dropping the handle.
    pub fn destroy_pipeline(&self, handle: PipelineHandle) {
        drop(handle);
    }

    pub fn pending_destruction(&self) -> usize {
        self.retired.pending_count()
    }

    pub fn begin_frame(&mut self, frame: FrameInfo) -> usize {
        let _span = tracing::trace_span!("PipelineSystem::begin_frame").entered();
        let device = self.device.as_ref();
        self.retired
            .begin_frame(frame, |pipeline| destroy(device, pipeline))
    }

    /// Destroys every released pipeline. The device must be idle.
    pub fn terminate(&mut self) {
        let device = self.device.as_ref();
        let destroyed = self.retired.flush(|pipeline| destroy(device, pipeline));
        if destroyed > 0 {
            log::debug!("Destroyed {destroyed} pipelines on terminate");
        }
    }
}

impl<D: GpuDevice> Drop for PipelineSystem<D> {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn destroy(device: &impl GpuDevice, pipeline: Pipeline) {
    log::trace!("Destroying pipeline {:?}", pipeline.pipeline);
    device.destroy_pipeline(pipeline.pipeline);
    if pipeline.owns_layout {
        device.destroy_pipeline_layout(pipeline.layout);
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::frame::FrameClock;
    use crate::testing::MockDevice;

    #[test]
    fn released_pipeline_waits_for_its_frame() {
        let device = Arc::new(MockDevice::new());
        let mut system = PipelineSystem::new(device.clone());
        let mut clock = FrameClock::new(2);

        system.begin_frame(clock.advance(0));
        let layout = vk::PipelineLayout::from_raw(77);
        let info = vk::ComputePipelineCreateInfo::default().layout(layout);
        let handle = system
            .create_compute_pipeline(&info, LayoutOwnership::Owned)
            .unwrap();
        assert_eq!(handle.bind_point, vk::PipelineBindPoint::COMPUTE);
        assert_eq!(handle.layout, layout);
        let pipeline = handle.pipeline;

        system.destroy_pipeline(handle);
        assert_eq!(system.pending_destruction(), 1);

        // Released during frame 1; frame 1 is still on the GPU.
        assert_eq!(system.begin_frame(clock.advance(0)), 0);
        assert!(device.state.borrow().pipelines_destroyed.is_empty());

        assert_eq!(system.begin_frame(clock.advance(1)), 1);
        let state = device.state.borrow();
        assert_eq!(state.pipelines_destroyed, vec![pipeline]);
        assert_eq!(state.layouts_destroyed, vec![layout]);
    }

    #[test]
    fn shared_layouts_are_left_alone() {
        let device = Arc::new(MockDevice::new());
        let mut system = PipelineSystem::new(device.clone());

        let info = vk::GraphicsPipelineCreateInfo::default()
            .layout(vk::PipelineLayout::from_raw(5));
        let handle = system
            .create_graphics_pipeline(&info, LayoutOwnership::Shared)
            .unwrap();
        assert!(!handle.owns_layout());
        drop(handle);

        system.terminate();
        let state = device.state.borrow();
        assert_eq!(state.pipelines_destroyed.len(), 1);
        assert!(state.layouts_destroyed.is_empty());
    }

    #[test]
    fn emplaced_pipelines_survive_until_terminate() {
        let device = Arc::new(MockDevice::new());
        let system = PipelineSystem::new(device.clone());

        let handles: Vec<_> = (1..=3)
            .map(|raw| {
                system.emplace(Pipeline::new(
                    vk::Pipeline::from_raw(raw),
                    vk::PipelineLayout::null(),
                    vk::PipelineBindPoint::GRAPHICS,
                    LayoutOwnership::Shared,
                ))
            })
            .collect();
        drop(handles);

        drop(system);
        assert_eq!(device.state.borrow().pipelines_destroyed.len(), 3);
    }
}
