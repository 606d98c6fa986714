use ash::vk;
use std::path::Path;

use crate::util_functions::{load_shader_module_as_stage, shader_groups_for_stages};
use crate::util_structs::{Allocator, ShaderBindingTable};
use crate::RayTracingPipelineLoader;

pub const SHADER_DIRECTORY: &str = "shaders/spv";

// The hit group has to come first so that its shader binding table record
// lands at the start of the buffer.
const SHADER_STAGES: [(&str, vk::ShaderStageFlags); 4] = [
    ("shader.rchit.spv", vk::ShaderStageFlags::CLOSEST_HIT_KHR),
    ("shader.rgen.spv", vk::ShaderStageFlags::RAYGEN_KHR),
    ("shader.rmiss.spv", vk::ShaderStageFlags::MISS_KHR),
    ("shader_shadow.rmiss.spv", vk::ShaderStageFlags::MISS_KHR),
];

pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub sbt: ShaderBindingTable,
}

impl RayTracingPipeline {
    pub fn new(
        device: &ash::Device,
        pipeline_loader: &RayTracingPipelineLoader,
        descriptor_set_layouts: &[vk::DescriptorSetLayout; 3],
        props: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let shader_directory = Path::new(SHADER_DIRECTORY);

        let mut stages = [vk::PipelineShaderStageCreateInfo::default(); 4];

        for (i, (file_name, stage)) in SHADER_STAGES.iter().enumerate() {
            stages[i] =
                load_shader_module_as_stage(&shader_directory.join(file_name), *stage, device)?;
        }

        let groups = shader_groups_for_stages(&stages);

        let layout = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder().set_layouts(descriptor_set_layouts),
                None,
            )
        }?;

        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            // Primary rays plus one bounce for the shadow rays.
            .max_pipeline_ray_recursion_depth(2)
            .layout(layout);

        let pipelines = unsafe {
            pipeline_loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[*create_info],
                None,
            )
        }?;

        let pipeline = pipelines[0];

        let group_count = groups.len() as u32;
        let handle_size = props.shader_group_handle_size;

        let group_handles = unsafe {
            pipeline_loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                (group_count * handle_size) as usize,
            )
        }?;

        let sbt = ShaderBindingTable::new(&group_handles, props, device, allocator)?;

        // The modules are baked into the pipeline at this point.
        for stage in &stages {
            unsafe { device.destroy_shader_module(stage.module, None) };
        }

        Ok(Self {
            pipeline,
            layout,
            sbt,
        })
    }

    pub fn cleanup(self, device: &ash::Device, allocator: &mut Allocator) -> anyhow::Result<()> {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }

        self.sbt.cleanup(allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_matches_the_shader_binding_table_layout() {
        let kinds: Vec<_> = SHADER_STAGES.iter().map(|(_, stage)| *stage).collect();

        assert_eq!(
            kinds,
            vec![
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                vk::ShaderStageFlags::RAYGEN_KHR,
                vk::ShaderStageFlags::MISS_KHR,
                vk::ShaderStageFlags::MISS_KHR,
            ]
        );
    }

    #[test]
    fn shader_files_are_unique() {
        for (i, (file_name, _)) in SHADER_STAGES.iter().enumerate() {
            assert!(SHADER_STAGES
                .iter()
                .skip(i + 1)
                .all(|(other, _)| other != file_name));
        }
    }
}
