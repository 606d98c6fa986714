use ash::vk;

use crate::gpu_structs::Uniforms;

// Set 0 holds everything that doesn't change size, set 1 the per-primitive
// materials and set 2 the variable-length texture array.
pub struct Descriptors {
    pub pool: vk::DescriptorPool,
    pub common_layout: vk::DescriptorSetLayout,
    pub materials_layout: vk::DescriptorSetLayout,
    pub textures_layout: vk::DescriptorSetLayout,
    pub common_set: vk::DescriptorSet,
    pub materials_set: vk::DescriptorSet,
    pub textures_set: vk::DescriptorSet,
}

pub fn pool_sizes(texture_count: u32) -> [vk::DescriptorPoolSize; 5] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 3,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 1,
        },
        // Pool sizes can't be zero, so keep one slot even with no textures.
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: texture_count.max(1),
        },
    ]
}

fn create_common_layout(device: &ash::Device) -> anyhow::Result<vk::DescriptorSetLayout> {
    let bindings = [
        *vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        *vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        *vk::DescriptorSetLayoutBinding::builder()
            .binding(2)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        *vk::DescriptorSetLayoutBinding::builder()
            .binding(3)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        *vk::DescriptorSetLayoutBinding::builder()
            .binding(4)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR),
    ];

    Ok(unsafe {
        device.create_descriptor_set_layout(
            &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings),
            None,
        )
    }?)
}

fn create_materials_layout(device: &ash::Device) -> anyhow::Result<vk::DescriptorSetLayout> {
    let bindings = [*vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR)];

    let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND];

    let mut flags_info =
        vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

    Ok(unsafe {
        device.create_descriptor_set_layout(
            &vk::DescriptorSetLayoutCreateInfo::builder()
                .bindings(&bindings)
                .push_next(&mut flags_info),
            None,
        )
    }?)
}

fn create_textures_layout(
    device: &ash::Device,
    texture_count: u32,
) -> anyhow::Result<vk::DescriptorSetLayout> {
    let bindings = [*vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .descriptor_count(texture_count)
        .stage_flags(vk::ShaderStageFlags::CLOSEST_HIT_KHR)];

    Ok(unsafe {
        device.create_descriptor_set_layout(
            &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings),
            None,
        )
    }?)
}

pub struct DescriptorWrites<'a> {
    pub tlas: vk::AccelerationStructureKHR,
    pub uniform_buffer: vk::Buffer,
    pub triangle_table_buffer: vk::Buffer,
    pub vertex_buffer: vk::Buffer,
    pub storage_image_view: vk::ImageView,
    pub material_buffer: vk::Buffer,
    pub image_infos: &'a [vk::DescriptorImageInfo],
}

impl Descriptors {
    pub fn new(device: &ash::Device, texture_count: u32) -> anyhow::Result<Self> {
        let common_layout = create_common_layout(device)?;
        let materials_layout = create_materials_layout(device)?;
        let textures_layout = create_textures_layout(device, texture_count)?;

        let sizes = pool_sizes(texture_count);

        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .pool_sizes(&sizes)
                    .max_sets(3),
                None,
            )
        }?;

        let layouts = [common_layout, materials_layout, textures_layout];

        let sets = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts),
            )
        }?;

        Ok(Self {
            pool,
            common_layout,
            materials_layout,
            textures_layout,
            common_set: sets[0],
            materials_set: sets[1],
            textures_set: sets[2],
        })
    }

    pub fn layouts(&self) -> [vk::DescriptorSetLayout; 3] {
        [
            self.common_layout,
            self.materials_layout,
            self.textures_layout,
        ]
    }

    pub fn sets(&self) -> [vk::DescriptorSet; 3] {
        [self.common_set, self.materials_set, self.textures_set]
    }

    pub fn write_descriptor_sets(&self, device: &ash::Device, writes: &DescriptorWrites) {
        let tlas_structures = [writes.tlas];

        let mut tlas_write = *vk::WriteDescriptorSetAccelerationStructureKHR::builder()
            .acceleration_structures(&tlas_structures);

        let uniform_buffer_info = [*vk::DescriptorBufferInfo::builder()
            .buffer(writes.uniform_buffer)
            .offset(0)
            // The dynamic offset selects the slot, so the range is one block.
            .range(std::mem::size_of::<Uniforms>() as u64)];

        let triangle_table_buffer_info = [*vk::DescriptorBufferInfo::builder()
            .buffer(writes.triangle_table_buffer)
            .range(vk::WHOLE_SIZE)];

        let vertex_buffer_info = [*vk::DescriptorBufferInfo::builder()
            .buffer(writes.vertex_buffer)
            .range(vk::WHOLE_SIZE)];

        let storage_image_info = [*vk::DescriptorImageInfo::builder()
            .image_view(writes.storage_image_view)
            .image_layout(vk::ImageLayout::GENERAL)];

        let material_buffer_info = [*vk::DescriptorBufferInfo::builder()
            .buffer(writes.material_buffer)
            .range(vk::WHOLE_SIZE)];

        let mut write_descriptor_sets = vec![
            {
                // Acceleration structure writes get their count from the
                // extension struct, which ash doesn't wire up for us.
                let mut write = *vk::WriteDescriptorSet::builder()
                    .dst_set(self.common_set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .push_next(&mut tlas_write);
                write.descriptor_count = 1;
                write
            },
            *vk::WriteDescriptorSet::builder()
                .dst_set(self.common_set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&uniform_buffer_info),
            *vk::WriteDescriptorSet::builder()
                .dst_set(self.common_set)
                .dst_binding(2)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&triangle_table_buffer_info),
            *vk::WriteDescriptorSet::builder()
                .dst_set(self.common_set)
                .dst_binding(3)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&vertex_buffer_info),
            *vk::WriteDescriptorSet::builder()
                .dst_set(self.common_set)
                .dst_binding(4)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&storage_image_info),
            *vk::WriteDescriptorSet::builder()
                .dst_set(self.materials_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&material_buffer_info),
        ];

        // Writing zero descriptors is invalid, so a textureless scene skips
        // the array entirely.
        if !writes.image_infos.is_empty() {
            write_descriptor_sets.push(
                *vk::WriteDescriptorSet::builder()
                    .dst_set(self.textures_set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(writes.image_infos),
            );
        }

        unsafe {
            device.update_descriptor_sets(&write_descriptor_sets, &[]);
        }
    }

    pub fn cleanup(self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.common_layout, None);
            device.destroy_descriptor_set_layout(self.materials_layout, None);
            device.destroy_descriptor_set_layout(self.textures_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_for(sizes: &[vk::DescriptorPoolSize], ty: vk::DescriptorType) -> u32 {
        sizes
            .iter()
            .find(|size| size.ty == ty)
            .map(|size| size.descriptor_count)
            .unwrap_or(0)
    }

    #[test]
    fn pool_sizes_cover_every_binding() {
        let sizes = pool_sizes(7);

        assert_eq!(count_for(&sizes, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC), 1);
        assert_eq!(count_for(&sizes, vk::DescriptorType::STORAGE_BUFFER), 3);
        assert_eq!(
            count_for(&sizes, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            1
        );
        assert_eq!(count_for(&sizes, vk::DescriptorType::STORAGE_IMAGE), 1);
        assert_eq!(
            count_for(&sizes, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            7
        );
    }

    #[test]
    fn texture_pool_size_is_never_zero() {
        let sizes = pool_sizes(0);

        assert_eq!(
            count_for(&sizes, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            1
        );
    }
}
