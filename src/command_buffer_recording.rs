use ash::vk;

use crate::pipeline::RayTracingPipeline;
use crate::util_functions::{
    cmd_pipeline_image_memory_barrier_explicit, PipelineImageMemoryBarrierParams,
};
use crate::RayTracingPipelineLoader;

pub struct FrameRecordParams<'a> {
    pub device: &'a ash::Device,
    pub pipeline_loader: &'a RayTracingPipelineLoader,
    pub pipeline: &'a RayTracingPipeline,
    pub descriptor_sets: [vk::DescriptorSet; 3],
    pub uniform_offset: u32,
    pub storage_image: vk::Image,
    pub swapchain_image: vk::Image,
    pub extent: vk::Extent2D,
}

// Records one frame: trace into the storage image, then copy it into the
// acquired swapchain image and get both ready for their next use.
pub unsafe fn record_frame(
    command_buffer: vk::CommandBuffer,
    params: &FrameRecordParams,
) -> anyhow::Result<()> {
    let device = params.device;

    device.begin_command_buffer(
        command_buffer,
        &vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
    )?;

    device.cmd_bind_pipeline(
        command_buffer,
        vk::PipelineBindPoint::RAY_TRACING_KHR,
        params.pipeline.pipeline,
    );

    device.cmd_bind_descriptor_sets(
        command_buffer,
        vk::PipelineBindPoint::RAY_TRACING_KHR,
        params.pipeline.layout,
        0,
        &params.descriptor_sets,
        // Selects this frame slot's block in the uniform ring.
        &[params.uniform_offset],
    );

    params.pipeline_loader.cmd_trace_rays(
        command_buffer,
        &params.pipeline.sbt.raygen_region,
        &params.pipeline.sbt.miss_region,
        &params.pipeline.sbt.hit_region,
        // We don't use callable shaders here
        &params.pipeline.sbt.callable_region,
        params.extent.width,
        params.extent.height,
        1,
    );

    let subresource = *vk::ImageSubresourceLayers::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1);

    let subresource_range = *vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1);

    // The traced image becomes a copy source once the rays have finished
    // writing it.
    cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
        device,
        buffer: command_buffer,
        src_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        dst_stage: vk::PipelineStageFlags::TRANSFER,
        image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
            .image(params.storage_image)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)],
    });

    // The acquire semaphore is waited on at the transfer stage, so this
    // transition chains onto it.
    cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
        device,
        buffer: command_buffer,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::TRANSFER,
        image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
            .image(params.swapchain_image)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)],
    });

    device.cmd_copy_image(
        command_buffer,
        params.storage_image,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        params.swapchain_image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[*vk::ImageCopy::builder()
            .src_subresource(subresource)
            .dst_subresource(subresource)
            .extent(vk::Extent3D {
                width: params.extent.width,
                height: params.extent.height,
                depth: 1,
            })],
    );

    // Hand the swapchain image over to the present engine.
    cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
        device,
        buffer: command_buffer,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
            .image(params.swapchain_image)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)],
    });

    // Put the traced image back into the layout the ray generation shader
    // expects for the next frame.
    cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
        device,
        buffer: command_buffer,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
            .image(params.storage_image)
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::SHADER_WRITE)],
    });

    device.end_command_buffer(command_buffer)?;

    Ok(())
}
