//! Descriptor set layouts and writes.

use crate::error::Result;
use ash::vk;

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stage_flags,
        )
    }

    /// Descriptor types in binding order.
    pub fn types(&self) -> Vec<vk::DescriptorType> {
        self.bindings.iter().map(|b| b.descriptor_type).collect()
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        Ok(unsafe { device.create_descriptor_set_layout(&layout_info, None)? })
    }
}

enum PendingWrite {
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        binding: u32,
        info: vk::DescriptorImageInfo,
    },
}

/// Collects writes to one descriptor set and applies them in a single update.
pub struct DescriptorWriter {
    set: vk::DescriptorSet,
    pending: Vec<PendingWrite>,
}

impl DescriptorWriter {
    pub fn new(set: vk::DescriptorSet) -> Self {
        Self {
            set,
            pending: Vec::new(),
        }
    }

    pub fn buffer(
        mut self,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) -> Self {
        self.pending.push(PendingWrite::Buffer {
            binding,
            ty,
            info: vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            },
        });
        self
    }

    pub fn storage_buffer(self, binding: u32, buffer: vk::Buffer) -> Self {
        self.buffer(
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
            buffer,
            0,
            vk::WHOLE_SIZE,
        )
    }

    pub fn combined_image_sampler(
        mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> Self {
        self.pending.push(PendingWrite::Image {
            binding,
            info: vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            },
        });
        self
    }

    /// Apply all collected writes.
    ///
    /// # Safety
    /// The set and every referenced resource must belong to `device`, and the
    /// set must not be in use by pending GPU work.
    pub unsafe fn update(self, device: &ash::Device) {
        let writes: Vec<_> = self
            .pending
            .iter()
            .map(|pending| match pending {
                PendingWrite::Buffer { binding, ty, info } => vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info)),
                PendingWrite::Image { binding, info } => vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info)),
            })
            .collect();

        if !writes.is_empty() {
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_builder_keeps_binding_order() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .uniform_buffer(1, vk::ShaderStageFlags::VERTEX)
            .sampled_image(2, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(
            builder.types(),
            vec![
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ]
        );
    }
}
