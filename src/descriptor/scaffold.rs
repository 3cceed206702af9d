use ash::vk;
use smallvec::SmallVec;

use crate::device::GpuDevice;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

impl BufferRange {
    pub fn whole(buffer: vk::Buffer) -> Self {
        Self {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }
}

/// The resource bound at one binding slot, identified by its handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    Sampler(vk::Sampler),
    CombinedImageSampler {
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    SampledImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    UniformBuffer(BufferRange),
    StorageBuffer(BufferRange),
    UniformBufferDynamic(BufferRange),
    StorageBufferDynamic(BufferRange),
}

enum ResourceInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

impl DescriptorResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::Sampler(_) => vk::DescriptorType::SAMPLER,
            Self::CombinedImageSampler { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::SampledImage { .. } => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            Self::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            Self::UniformBufferDynamic(_) => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBufferDynamic(_) => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        }
    }

    fn info(&self) -> ResourceInfo {
        match *self {
            Self::Sampler(sampler) => {
                ResourceInfo::Image(vk::DescriptorImageInfo::default().sampler(sampler))
            }
            Self::CombinedImageSampler {
                sampler,
                view,
                layout,
            } => ResourceInfo::Image(
                vk::DescriptorImageInfo::default()
                    .sampler(sampler)
                    .image_view(view)
                    .image_layout(layout),
            ),
            Self::SampledImage { view, layout } | Self::StorageImage { view, layout } => {
                ResourceInfo::Image(
                    vk::DescriptorImageInfo::default()
                        .image_view(view)
                        .image_layout(layout),
                )
            }
            Self::UniformBuffer(range)
            | Self::StorageBuffer(range)
            | Self::UniformBufferDynamic(range)
            | Self::StorageBufferDynamic(range) => ResourceInfo::Buffer(
                vk::DescriptorBufferInfo::default()
                    .buffer(range.buffer)
                    .offset(range.offset)
                    .range(range.range),
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScaffoldEntry {
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
}

/// Binding layout of a scaffold with the resource identities stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaffoldShape {
    set_index: u32,
    slots: SmallVec<[(u32, u32, vk::DescriptorType); 8]>,
}

/// Value description of a descriptor set's contents: which resource sits at
/// which binding. Equality over the whole ordered list is the cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSetScaffold {
    set_index: u32,
    entries: SmallVec<[ScaffoldEntry; 8]>,
}

impl DescriptorSetScaffold {
    pub fn new(set_index: u32) -> Self {
        Self {
            set_index,
            entries: SmallVec::new(),
        }
    }

    pub fn with(mut self, binding: u32, resource: DescriptorResource) -> Self {
        self.push(binding, resource);
        self
    }

    pub fn push(&mut self, binding: u32, resource: DescriptorResource) {
        self.push_element(binding, 0, resource);
    }

    pub fn push_element(&mut self, binding: u32, array_element: u32, resource: DescriptorResource) {
        self.entries.push(ScaffoldEntry {
            binding,
            array_element,
            resource,
        });
    }

    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    pub fn entries(&self) -> &[ScaffoldEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor count per type, in order of first appearance.
    pub fn type_counts(&self) -> SmallVec<[(vk::DescriptorType, u32); 4]> {
        let mut counts: SmallVec<[(vk::DescriptorType, u32); 4]> = SmallVec::new();
        for entry in &self.entries {
            let ty = entry.resource.descriptor_type();
            match counts.iter_mut().find(|(t, _)| *t == ty) {
                Some((_, count)) => *count += 1,
                None => counts.push((ty, 1)),
            }
        }
        counts
    }

    pub fn shape(&self) -> ScaffoldShape {
        ScaffoldShape {
            set_index: self.set_index,
            slots: self
                .entries
                .iter()
                .map(|e| (e.binding, e.array_element, e.resource.descriptor_type()))
                .collect(),
        }
    }

    /// Writes every entry into `set` with a single update call.
    pub fn write(&self, device: &impl GpuDevice, set: vk::DescriptorSet) {
        let mut buffer_infos: SmallVec<[vk::DescriptorBufferInfo; 8]> = SmallVec::new();
        let mut image_infos: SmallVec<[vk::DescriptorImageInfo; 8]> = SmallVec::new();
        let slots: SmallVec<[(bool, usize); 8]> = self
            .entries
            .iter()
            .map(|entry| match entry.resource.info() {
                ResourceInfo::Buffer(info) => {
                    buffer_infos.push(info);
                    (true, buffer_infos.len() - 1)
                }
                ResourceInfo::Image(info) => {
                    image_infos.push(info);
                    (false, image_infos.len() - 1)
                }
            })
            .collect();

        let writes: SmallVec<[vk::WriteDescriptorSet<'_>; 8]> = self
            .entries
            .iter()
            .zip(&slots)
            .map(|(entry, &(is_buffer, index))| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(entry.binding)
                    .dst_array_element(entry.array_element)
                    .descriptor_type(entry.resource.descriptor_type());
                if is_buffer {
                    write.buffer_info(std::slice::from_ref(&buffer_infos[index]))
                } else {
                    write.image_info(std::slice::from_ref(&image_infos[index]))
                }
            })
            .collect();

        device.update_descriptor_sets(&writes);
    }
}
