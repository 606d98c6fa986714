use crate::SurfaceLoader;
use anyhow::Context;
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::Path;

use crate::util_structs::{Allocator, Buffer, CStrList, Image};

pub fn select_physical_device(
    instance: &ash::Instance,
    required_extensions: &CStrList,
    surface_loader: &SurfaceLoader,
    surface: vk::SurfaceKHR,
) -> anyhow::Result<Option<(vk::PhysicalDevice, u32, vk::SurfaceFormatKHR)>> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }?;

    log::info!(
        "Found {} device{}",
        physical_devices.len(),
        if physical_devices.len() == 1 { "" } else { "s" }
    );

    let selection = physical_devices
        .into_iter()
        .filter_map(|physical_device| unsafe {
            let properties = instance.get_physical_device_properties(physical_device);

            log::info!("");
            log::info!(
                "Checking Device: {:?}",
                cstr_from_array(&properties.device_name)
            );

            log::debug!("Api version: {}", properties.api_version);

            let queue_family = instance
                .get_physical_device_queue_family_properties(physical_device)
                .into_iter()
                .enumerate()
                .position(|(i, queue_family_properties)| {
                    queue_family_properties
                        .queue_flags
                        .contains(vk::QueueFlags::GRAPHICS)
                        && surface_loader
                            .get_physical_device_surface_support(physical_device, i as u32, surface)
                            .unwrap()
                })
                .map(|queue_family| queue_family as u32);

            log::info!(
                "  Checking for a graphics queue family: {}",
                tick(queue_family.is_some())
            );

            let queue_family = match queue_family {
                Some(queue_family) => queue_family,
                None => return None,
            };

            let surface_formats = surface_loader
                .get_physical_device_surface_formats(physical_device, surface)
                .unwrap();

            let surface_format = surface_formats
                .iter()
                .find(|surface_format| {
                    surface_format.format == vk::Format::B8G8R8A8_UNORM
                        && surface_format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .or_else(|| surface_formats.get(0));

            log::info!(
                "  Checking for an appropriate surface format: {}",
                tick(surface_format.is_some())
            );

            let surface_format = match surface_format {
                Some(surface_format) => *surface_format,
                None => return None,
            };

            log::info!("  Checking for required extensions:");

            let supported_device_extensions = instance
                .enumerate_device_extension_properties(physical_device)
                .unwrap();

            let mut has_required_extensions = true;

            for required_extension in &required_extensions.list {
                let device_has_extension = supported_device_extensions.iter().any(|extension| {
                    &cstr_from_array(&extension.extension_name) == required_extension
                });

                log::info!(
                    "    * {:?}: {}",
                    required_extension,
                    tick(device_has_extension)
                );

                has_required_extensions &= device_has_extension;
            }

            if log::log_enabled!(log::Level::Debug) {
                log::debug!("  Supported extensions:");
                supported_device_extensions.iter().for_each(|extension| {
                    log::debug!("    * {:?}", &cstr_from_array(&extension.extension_name));
                });
            }

            if !has_required_extensions {
                return None;
            }

            Some((physical_device, queue_family, surface_format, properties))
        })
        .max_by_key(|(.., properties)| match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 2,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            _ => 0,
        });

    log::info!("");

    Ok(match selection {
        Some((physical_device, queue_family, surface_format, properties)) => {
            unsafe {
                log::info!(
                    "Using device {:?}",
                    cstr_from_array(&properties.device_name)
                );
            }

            Some((physical_device, queue_family, surface_format))
        }
        None => None,
    })
}

fn tick(supported: bool) -> &'static str {
    if supported {
        "✔️"
    } else {
        "❌"
    }
}

unsafe fn cstr_from_array(array: &[c_char]) -> &CStr {
    CStr::from_ptr(array.as_ptr())
}

pub fn load_shader_module(path: &Path, device: &ash::Device) -> anyhow::Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader from {}", path.display()))?;
    let spv = ash::util::read_spv(&mut std::io::Cursor::new(bytes))?;
    Ok(unsafe {
        device.create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(&spv), None)
    }?)
}

pub fn load_shader_module_as_stage(
    path: &Path,
    stage: vk::ShaderStageFlags,
    device: &ash::Device,
) -> anyhow::Result<vk::PipelineShaderStageCreateInfo> {
    let module = load_shader_module(path, device)?;

    Ok(*vk::PipelineShaderStageCreateInfo::builder()
        .module(module)
        .stage(stage)
        .name(CStr::from_bytes_with_nul(b"main\0")?))
}

// Allocates a fresh primary command buffer, records into it and blocks until the
// submission finishes.
pub fn record_and_submit_once<R>(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    record: impl FnOnce(vk::CommandBuffer) -> anyhow::Result<R>,
) -> anyhow::Result<R> {
    let command_buffer = unsafe {
        device.allocate_command_buffers(
            &vk::CommandBufferAllocateInfo::builder()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1),
        )
    }?[0];

    unsafe {
        device.begin_command_buffer(
            command_buffer,
            &vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
        )?;
    }

    let result = record(command_buffer)?;

    let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }?;

    unsafe {
        device.end_command_buffer(command_buffer)?;

        device.queue_submit(
            queue,
            &[*vk::SubmitInfo::builder().command_buffers(&[command_buffer])],
            fence,
        )?;

        device.wait_for_fences(&[fence], true, u64::MAX)?;

        device.destroy_fence(fence, None);
        device.free_command_buffers(command_pool, &[command_buffer]);
    }

    Ok(result)
}

pub fn mip_level_count(width: u32, height: u32) -> u32 {
    (width.max(height) as f32).log2().floor() as u32 + 1
}

fn mip_dimensions(width: u32, height: u32, level: u32) -> (u32, u32) {
    ((width >> level).max(1), (height >> level).max(1))
}

fn single_mip_subresource_range(level: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: level,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

// Uploads a decoded image as a full mipchain, blitting each level from the one
// above it.
pub fn upload_rgba_texture(
    rgba_image: &image::RgbaImage,
    name: &str,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    allocator: &mut Allocator,
) -> anyhow::Result<Image> {
    let device = allocator.device.clone();

    let staging_buffer = Buffer::new(
        rgba_image,
        &format!("{} staging buffer", name),
        vk::BufferUsageFlags::TRANSFER_SRC,
        allocator,
    )?;

    let (width, height) = rgba_image.dimensions();
    let mip_levels = mip_level_count(width, height);

    let extent = vk::Extent3D {
        width,
        height,
        depth: 1,
    };

    let image = unsafe {
        device.create_image(
            &vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .format(vk::Format::R8G8B8A8_UNORM)
                .extent(extent)
                .mip_levels(mip_levels)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .usage(
                    vk::ImageUsageFlags::SAMPLED
                        | vk::ImageUsageFlags::TRANSFER_DST
                        | vk::ImageUsageFlags::TRANSFER_SRC,
                ),
            None,
        )
    }?;

    let requirements = unsafe { device.get_image_memory_requirements(image) };

    let allocation = allocator.inner.allocate(&AllocationCreateDesc {
        name,
        requirements,
        location: gpu_allocator::MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    })?;

    unsafe {
        device.bind_image_memory(image, allocation.memory(), allocation.offset())?;
    }

    let view = unsafe {
        device.create_image_view(
            &vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(vk::Format::R8G8B8A8_UNORM)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: mip_levels,
                    base_array_layer: 0,
                    layer_count: 1,
                }),
            None,
        )
    }?;

    record_and_submit_once(&device, command_pool, queue, |command_buffer| {
        unsafe {
            cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
                device: &device,
                buffer: command_buffer,
                // We don't need to block on anything before this.
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
                image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
                    .image(image)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: mip_levels,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)],
            });

            device.cmd_copy_buffer_to_image(
                command_buffer,
                staging_buffer.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[*vk::BufferImageCopy::builder()
                    .buffer_row_length(width)
                    .buffer_image_height(height)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(extent)],
            );

            for level in 1..mip_levels {
                let (src_width, src_height) = mip_dimensions(width, height, level - 1);
                let (dst_width, dst_height) = mip_dimensions(width, height, level);

                cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
                    device: &device,
                    buffer: command_buffer,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::TRANSFER,
                    image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
                        .image(image)
                        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                        .subresource_range(single_mip_subresource_range(level - 1))
                        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)],
                });

                device.cmd_blit_image(
                    command_buffer,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[*vk::ImageBlit::builder()
                        .src_subresource(vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: level - 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .src_offsets([
                            vk::Offset3D::default(),
                            vk::Offset3D {
                                x: src_width as i32,
                                y: src_height as i32,
                                z: 1,
                            },
                        ])
                        .dst_subresource(vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: level,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .dst_offsets([
                            vk::Offset3D::default(),
                            vk::Offset3D {
                                x: dst_width as i32,
                                y: dst_height as i32,
                                z: 1,
                            },
                        ])],
                    vk::Filter::LINEAR,
                );

                cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
                    device: &device,
                    buffer: command_buffer,
                    src_stage: vk::PipelineStageFlags::TRANSFER,
                    dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
                        .image(image)
                        .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .subresource_range(single_mip_subresource_range(level - 1))
                        .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                        .dst_access_mask(vk::AccessFlags::SHADER_READ)],
                });
            }

            // The smallest mip is never blitted from, so it goes straight from
            // being a transfer destination to shader readable.
            cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
                device: &device,
                buffer: command_buffer,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
                    .image(image)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .subresource_range(single_mip_subresource_range(mip_levels - 1))
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)],
            });
        }

        Ok(())
    })?;

    staging_buffer.cleanup(allocator)?;

    Ok(Image {
        image,
        view,
        allocation,
    })
}

fn shader_group_for_stage(
    index: u32,
    stage: vk::ShaderStageFlags,
) -> vk::RayTracingShaderGroupCreateInfoKHR {
    let mut info = vk::RayTracingShaderGroupCreateInfoKHR {
        general_shader: vk::SHADER_UNUSED_KHR,
        closest_hit_shader: vk::SHADER_UNUSED_KHR,
        any_hit_shader: vk::SHADER_UNUSED_KHR,
        intersection_shader: vk::SHADER_UNUSED_KHR,
        ..Default::default()
    };

    match stage {
        vk::ShaderStageFlags::CLOSEST_HIT_KHR => {
            info.ty = vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP;
            info.closest_hit_shader = index;
        }
        vk::ShaderStageFlags::ANY_HIT_KHR => {
            info.ty = vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP;
            info.any_hit_shader = index;
        }
        vk::ShaderStageFlags::INTERSECTION_KHR => {
            info.ty = vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP;
            info.intersection_shader = index;
        }
        _ => {
            info.ty = vk::RayTracingShaderGroupTypeKHR::GENERAL;
            info.general_shader = index;
        }
    }

    info
}

pub fn shader_groups_for_stages<const N: usize>(
    stages: &[vk::PipelineShaderStageCreateInfo; N],
) -> [vk::RayTracingShaderGroupCreateInfoKHR; N] {
    let mut groups = [vk::RayTracingShaderGroupCreateInfoKHR::default(); N];

    for (i, stage) in stages.iter().enumerate() {
        groups[i] = shader_group_for_stage(i as u32, stage.stage);
    }

    groups
}

// Copied from:
// https://github.com/SaschaWillems/Vulkan/blob/eb11297312a164d00c60b06048100bac1d780bb4/base/VulkanTools.cpp#L383
pub fn aligned_size(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

pub struct PipelineImageMemoryBarrierParams<'a> {
    pub device: &'a ash::Device,
    pub buffer: vk::CommandBuffer,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub image_memory_barriers: &'a [vk::ImageMemoryBarrier],
}

// `cmd_pipeline_barrier` is one of those cases where it's nice if each param is clear.
pub unsafe fn cmd_pipeline_image_memory_barrier_explicit(
    params: &PipelineImageMemoryBarrierParams,
) {
    params.device.cmd_pipeline_barrier(
        params.buffer,
        params.src_stage,
        params.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        params.image_memory_barriers,
    )
}

pub unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let filter_out = (message_severity == vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        && message_type == vk::DebugUtilsMessageTypeFlagsEXT::GENERAL)
        || (message_severity == vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            && message_type == vk::DebugUtilsMessageTypeFlagsEXT::GENERAL)
        || (message_severity == vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            && message_type == vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION);

    if filter_out {
        return vk::FALSE;
    }

    let level = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => log::Level::Debug,
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::Level::Info,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        _ => log::Level::Info,
    };

    let message = std::ffi::CStr::from_ptr((*p_callback_data).p_message);
    let ty = format!("{:?}", message_type).to_lowercase();
    log::log!(level, "[Debug Msg][{}] {:?}", ty, message);
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up_to_the_alignment() {
        assert_eq!(aligned_size(0, 64), 0);
        assert_eq!(aligned_size(1, 64), 64);
        assert_eq!(aligned_size(64, 64), 64);
        assert_eq!(aligned_size(65, 64), 128);
        assert_eq!(aligned_size(256, 16), 256);
    }

    #[test]
    fn mip_level_count_covers_the_full_chain() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 2), 2);
        assert_eq!(mip_level_count(1024, 1024), 11);
        assert_eq!(mip_level_count(1600, 1200), 11);
        assert_eq!(mip_level_count(640, 480), 10);
    }

    #[test]
    fn mip_dimensions_halve_and_clamp() {
        assert_eq!(mip_dimensions(1024, 512, 0), (1024, 512));
        assert_eq!(mip_dimensions(1024, 512, 1), (512, 256));
        assert_eq!(mip_dimensions(1024, 512, 10), (1, 1));
    }

    #[test]
    fn shader_groups_match_stage_kinds() {
        let stages = [
            *vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
            *vk::PipelineShaderStageCreateInfo::builder().stage(vk::ShaderStageFlags::RAYGEN_KHR),
            *vk::PipelineShaderStageCreateInfo::builder().stage(vk::ShaderStageFlags::MISS_KHR),
            *vk::PipelineShaderStageCreateInfo::builder().stage(vk::ShaderStageFlags::MISS_KHR),
        ];

        let groups = shader_groups_for_stages(&stages);

        assert_eq!(
            groups[0].ty,
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        );
        assert_eq!(groups[0].closest_hit_shader, 0);
        assert_eq!(groups[0].general_shader, vk::SHADER_UNUSED_KHR);

        for (i, group) in groups.iter().enumerate().skip(1) {
            assert_eq!(group.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
            assert_eq!(group.general_shader, i as u32);
            assert_eq!(group.closest_hit_shader, vk::SHADER_UNUSED_KHR);
        }
    }
}
