//! Descriptor set layouts, pools and set updates.
//!
//! The scene uses one layout: binding 0 is the per-frame uniform buffer
//! (vertex stage), binding 1 is the texture and sampler (fragment stage).
//! [`SCENE_BINDINGS`] describes it; pool sizing is derived from the same
//! table.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;

/// One slot in a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl DescriptorBinding {
    fn as_vk(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type)
            .descriptor_count(self.count)
            .stage_flags(self.stages)
    }
}

pub const UNIFORM_BINDING: u32 = 0;
pub const TEXTURE_BINDING: u32 = 1;

pub const SCENE_BINDINGS: [DescriptorBinding; 2] = [
    DescriptorBinding {
        binding: UNIFORM_BINDING,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        count: 1,
        stages: vk::ShaderStageFlags::VERTEX,
    },
    DescriptorBinding {
        binding: TEXTURE_BINDING,
        descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        count: 1,
        stages: vk::ShaderStageFlags::FRAGMENT,
    },
];

/// Pool capacity for `set_count` sets of `bindings`, one entry per
/// descriptor type.
pub fn pool_sizes_for(
    bindings: &[DescriptorBinding],
    set_count: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let needed = binding.count * set_count;
        match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += needed,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: needed,
            }),
        }
    }
    sizes
}

/// An owned `VkDescriptorSetLayout`.
pub struct DescriptorSetLayout {
    parent: Arc<Device>,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<Device>,
        bindings: &[DescriptorBinding],
    ) -> Result<Self, vk::Result> {
        let raw: Vec<_> = bindings.iter().map(DescriptorBinding::as_vk).collect();
        let create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw);
        // SAFETY: create_info borrows `raw`, which outlives the call.
        let handle =
            unsafe { device.create_raw_descriptor_set_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
            bindings: bindings.to_vec(),
        })
    }

    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    pub fn raw_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: pipelines and pools built from this layout are owned by
        // the same scene and dropped with it.
        unsafe { self.parent.destroy_raw_descriptor_set_layout(self.handle) };
    }
}

/// An owned `VkDescriptorPool`. Sets allocated from it are freed with it.
pub struct DescriptorPool {
    parent: Arc<Device>,
    handle: vk::DescriptorPool,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    /// A pool sized for exactly `set_count` sets of `layout`.
    pub fn for_layout(
        device: &Arc<Device>,
        layout: &DescriptorSetLayout,
        set_count: u32,
    ) -> Result<Self, vk::Result> {
        let sizes = pool_sizes_for(layout.bindings(), set_count);
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(set_count)
            .pool_sizes(&sizes);
        // SAFETY: create_info borrows `sizes`, which outlives the call.
        let handle = unsafe { device.create_raw_descriptor_pool(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Allocate `count` sets of `layout`.
    pub fn allocate(
        &self,
        layout: &DescriptorSetLayout,
        count: usize,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        let layouts = vec![layout.raw_descriptor_set_layout(); count];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&layouts);
        // SAFETY: pool and layout both come from self.parent.
        unsafe { self.parent.allocate_raw_descriptor_sets(&allocate_info) }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        // SAFETY: owners wait for idle before dropping the pool.
        unsafe { self.parent.destroy_raw_descriptor_pool(self.handle) };
    }
}

/// Point a scene set at its uniform buffer and texture.
///
/// # Safety
/// `set` must not be bound in pending work. The buffer, view and sampler
/// must come from `device` and stay alive while the set is in use; the
/// image must be in `SHADER_READ_ONLY_OPTIMAL` when sampled.
pub unsafe fn write_scene_set(
    device: &Device,
    set: vk::DescriptorSet,
    uniform: (vk::Buffer, vk::DeviceSize),
    texture: (vk::ImageView, vk::Sampler),
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(uniform.0)
        .offset(0)
        .range(uniform.1);
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(texture.0)
        .sampler(texture.1)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    let writes = [
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info)),
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(std::slice::from_ref(&image_info)),
    ];
    // SAFETY: forwarded caller contract.
    unsafe { device.update_raw_descriptor_sets(&writes) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_scale_with_set_count() {
        let sizes = pool_sizes_for(&SCENE_BINDINGS, 3);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 3);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 3);
    }

    #[test]
    fn bindings_of_the_same_type_share_a_pool_entry() {
        let bindings = [
            DescriptorBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX,
            },
            DescriptorBinding {
                binding: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 2,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
        ];
        let sizes = pool_sizes_for(&bindings, 2);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].descriptor_count, 6);
    }

    #[test]
    fn scene_layout_matches_shader_interface() {
        assert_eq!(SCENE_BINDINGS[0].stages, vk::ShaderStageFlags::VERTEX);
        assert_eq!(SCENE_BINDINGS[1].stages, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(SCENE_BINDINGS[1].binding, TEXTURE_BINDING);
    }
}
