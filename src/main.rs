use std::{collections::VecDeque, sync::Arc};

use anyhow::{Context, bail};
use ash::vk;

use arbor_resources::{
    FrameClock, LifecycleConfig,
    command::{CommandFuture, CommandProcessor},
    descriptor::{
        BufferRange, DescriptorResource, DescriptorSetScaffold, DescriptorSystem, PoolCapacity,
    },
    resource::{
        BufferHandle, BufferSpec, BufferSystem, BufferUsage, LayoutOwnership, MemoryLocation,
        PipelineHandle, PipelineSystem,
    },
    vulkan::VulkanCore,
};

const DEMO_FRAMES: u64 = 240;
/// Frames spent on each material before switching, long enough for the
/// unused material's descriptor sets to be evicted.
const MATERIAL_PERIOD: u64 = 40;
const STORAGE_SIZE: vk::DeviceSize = 4096;

/// `void main() {}` with `local_size = (1, 1, 1)`.
const NOOP_COMPUTE_SPV: [u32; 35] = [
    0x0723_0203, 0x0001_0000, 0x0000_0000, 5, 0, // header, id bound 5
    0x0002_0011, 1, // OpCapability Shader
    0x0003_000E, 0, 1, // OpMemoryModel Logical GLSL450
    0x0005_000F, 5, 1, 0x6E69_616D, 0, // OpEntryPoint GLCompute %1 "main"
    0x0006_0010, 1, 17, 1, 1, 1, // OpExecutionMode %1 LocalSize 1 1 1
    0x0002_0013, 2, // %2 = OpTypeVoid
    0x0003_0021, 3, 2, // %3 = OpTypeFunction %2
    0x0005_0036, 2, 1, 0, 3, // %1 = OpFunction %2 None %3
    0x0002_00F8, 4, // %4 = OpLabel
    0x0001_00FD, // OpReturn
    0x0001_0038, // OpFunctionEnd
];

fn main() -> anyhow::Result<()> {
    log4rs::init_file("log4rs.yml", Default::default())
        .context("failed to load logging config file")?;

    #[cfg(feature = "tracing")]
    init_profiling()?;

    let config = LifecycleConfig::default();
    config.validate()?;

    let core = VulkanCore::new().context("failed to create Vulkan core")?;
    if let Err(e) = run(&core, &config) {
        log::error!("{e:?}");
        return Err(e);
    }

    Ok(())
}

#[cfg(feature = "tracing")]
fn init_profiling() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    tracy_client::Client::start();
    let subscriber = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")
}

struct Systems {
    commands: CommandProcessor,
    descriptors: DescriptorSystem,
    buffers: BufferSystem,
    pipelines: PipelineSystem,
}

impl Systems {
    fn terminate(&mut self) -> anyhow::Result<()> {
        self.commands.terminate()?;
        self.descriptors.terminate();
        self.buffers.terminate();
        self.pipelines.terminate();
        Ok(())
    }
}

/// Everything in here borrows the device, so it all has to be gone before
/// the core is dropped.
fn run(core: &VulkanCore, config: &LifecycleConfig) -> anyhow::Result<()> {
    let device = core.device().clone();
    let allocator = Arc::new(core.create_allocator()?);

    let mut systems = Systems {
        commands: CommandProcessor::new(
            device.clone(),
            config.command_pool_size,
            config.fence_timeout_ns,
        ),
        descriptors: DescriptorSystem::new(
            device.clone(),
            config.frame_queue_depth,
            config.descriptor_eviction_threshold,
        ),
        buffers: BufferSystem::new(allocator.clone(), core.device_context().clone()),
        pipelines: PipelineSystem::new(device.clone()),
    };

    let set_layout = create_set_layout(&device)?;
    let result = frame_loop(core, config, &mut systems, set_layout);

    core.wait_idle()?;
    systems.terminate()?;
    unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
    result
}

fn frame_loop(
    core: &VulkanCore,
    config: &LifecycleConfig,
    systems: &mut Systems,
    set_layout: vk::DescriptorSetLayout,
) -> anyhow::Result<()> {
    let device = core.device().clone();
    let queue = core.graphics_queue(0)?;
    let family = core.graphics_family();
    let depth = config.frame_queue_depth as usize;

    let storage = systems.buffers.create_buffer(
        &BufferSpec::new(BufferUsage::Storage, MemoryLocation::DeviceLocal, STORAGE_SIZE)
            .named("demo storage"),
    )?;
    systems.commands.sync(queue, family, |cmd| {
        unsafe { device.cmd_fill_buffer(cmd, storage.vk_buffer, 0, vk::WHOLE_SIZE, 0) };
        Ok(())
    })?;

    let materials: Vec<BufferHandle> = (0..2u32)
        .map(|i| {
            systems.buffers.create_buffer_with_data(
                BufferUsage::Uniform,
                &[i; 64],
                Some(&format!("material {i}")),
            )
        })
        .collect::<anyhow::Result<_>>()?;

    let pipeline = create_noop_pipeline(&device, &systems.pipelines, set_layout)?;

    let pool_allocator = systems.descriptors.create_pool_allocator(
        &[
            PoolCapacity::new(vk::DescriptorType::UNIFORM_BUFFER, 16),
            PoolCapacity::new(vk::DescriptorType::STORAGE_BUFFER, 16),
        ],
        config.max_sets_per_pool,
        false,
    );
    let set_allocator = systems
        .descriptors
        .create_set_allocator(&pool_allocator, set_layout)?;

    let mut clock = FrameClock::new(config.frame_queue_depth);
    let mut in_flight: VecDeque<(u64, CommandFuture)> = VecDeque::new();
    let mut finished = 0;

    for _ in 0..DEMO_FRAMES {
        let frame = clock.advance(finished);
        let _span = tracing::trace_span!("frame", id = frame.current_frame_id).entered();

        systems.commands.begin_frame(frame)?;
        systems.descriptors.begin_frame(frame);
        systems.buffers.begin_frame(frame);
        systems.pipelines.begin_frame(frame);

        while let Some((_, future)) = in_flight.front_mut() {
            if !future.is_resolved() {
                break;
            }
            if let Some((id, mut future)) = in_flight.pop_front()
                && let Some(Err(e)) = future.try_result()
            {
                bail!("work for frame {id} failed: {e}");
            }
        }

        let material = &materials[((frame.current_frame_id / MATERIAL_PERIOD) % 2) as usize];
        let scaffold = DescriptorSetScaffold::new(0)
            .with(
                0,
                DescriptorResource::UniformBuffer(BufferRange::whole(material.vk_buffer)),
            )
            .with(
                1,
                DescriptorResource::StorageBuffer(BufferRange::whole(storage.vk_buffer)),
            );
        let set = systems
            .descriptors
            .require_updated_descriptor_set(&set_allocator, &scaffold)?;

        // A throwaway upload every few frames; dropping it right after
        // submission is safe because destruction waits for this frame.
        let staging = if frame.current_frame_id % 4 == 0 {
            let value = frame.current_frame_id as u32;
            Some(systems.buffers.create_buffer_with_data(
                BufferUsage::Staging,
                &[value; 64],
                Some("frame staging"),
            )?)
        } else {
            None
        };

        let value = frame.current_frame_id as u32;
        let future = systems.commands.async_submit(queue, family, |cmd| {
            unsafe {
                device.cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    pipeline.bind_point,
                    pipeline.layout,
                    0,
                    &[set],
                    &[],
                );
                device.cmd_dispatch(cmd, 1, 1, 1);
                device.cmd_fill_buffer(cmd, storage.vk_buffer, 0, 256, value);
                if let Some(staging) = &staging {
                    let region = vk::BufferCopy::default()
                        .dst_offset(256)
                        .size(staging.size);
                    device.cmd_copy_buffer(cmd, staging.vk_buffer, storage.vk_buffer, &[region]);
                }
            }
            Ok(())
        })?;
        in_flight.push_back((frame.current_frame_id, future));

        systems.descriptors.end_frame();
        systems.commands.end_frame()?;
        drop(staging);

        if in_flight.len() >= depth {
            core.wait_idle()?;
            finished = frame.current_frame_id;
        }

        #[cfg(feature = "tracing")]
        tracy_client::frame_mark();
    }

    if let Some(pools) = systems.descriptors.get_pool_allocator(&pool_allocator) {
        log::info!(
            "Descriptor pools in the last frame slot: {} ({} free)",
            pools.pool_count(),
            pools.free_pool_count()
        );
    }
    log::info!(
        "Ran {DEMO_FRAMES} frames on {} command pools; {} buffers awaiting destruction",
        systems.commands.pool_count(),
        systems.buffers.pending_destruction()
    );
    Ok(())
}

fn create_set_layout(device: &ash::Device) -> anyhow::Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE),
        vk::DescriptorSetLayoutBinding::default()
            .binding(1)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE),
    ];
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&info, None) }
        .context("failed to create descriptor set layout")
}

fn create_noop_pipeline(
    device: &ash::Device,
    pipelines: &PipelineSystem,
    set_layout: vk::DescriptorSetLayout,
) -> anyhow::Result<PipelineHandle> {
    let module_info = vk::ShaderModuleCreateInfo::default().code(&NOOP_COMPUTE_SPV);
    let module = unsafe { device.create_shader_module(&module_info, None) }
        .context("failed to create shader module")?;

    let set_layouts = [set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
        Ok(layout) => layout,
        Err(e) => {
            unsafe { device.destroy_shader_module(module, None) };
            return Err(e).context("failed to create pipeline layout");
        }
    };

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let pipeline = pipelines.create_compute_pipeline(&info, LayoutOwnership::Owned);
    unsafe { device.destroy_shader_module(module, None) };
    if pipeline.is_err() {
        unsafe { device.destroy_pipeline_layout(layout, None) };
    }
    pipeline
}
