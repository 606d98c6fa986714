use anyhow::Context;
use ash::extensions::khr::AccelerationStructure as AccelerationStructureLoader;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, AllocatorCreateDesc,
};
use std::ffi::CStr;
use std::os::raw::c_char;

use crate::gpu_structs::Uniforms;
use crate::util_functions::{
    aligned_size, cmd_pipeline_image_memory_barrier_explicit, record_and_submit_once,
    PipelineImageMemoryBarrierParams,
};

// A list of C strings and their associated pointers
pub struct CStrList<'a> {
    pub list: Vec<&'a CStr>,
    pub pointers: Vec<*const c_char>,
}

impl<'a> CStrList<'a> {
    pub fn new(list: Vec<&'a CStr>) -> Self {
        let pointers = list.iter().map(|cstr| cstr.as_ptr()).collect();

        Self { list, pointers }
    }
}

pub struct Allocator {
    pub inner: gpu_allocator::vulkan::Allocator,
    pub device: ash::Device,
    queue_family: u32,
}

impl Allocator {
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> anyhow::Result<Self> {
        Ok(Allocator {
            inner: gpu_allocator::vulkan::Allocator::new(&AllocatorCreateDesc {
                instance,
                device: device.clone(),
                physical_device,
                debug_settings: gpu_allocator::AllocatorDebugSettings {
                    log_memory_information: false,
                    log_leaks_on_shutdown: true,
                    store_stack_traces: false,
                    log_allocations: false,
                    log_frees: true,
                    log_stack_traces: false,
                },
                // Needed for getting buffer device addresses
                buffer_device_address: true,
            })?,
            queue_family,
            device,
        })
    }
}

pub struct Buffer {
    pub allocation: Allocation,
    pub buffer: vk::Buffer,
}

impl Buffer {
    pub fn new_of_size(
        size: vk::DeviceSize,
        name: &str,
        usage: vk::BufferUsageFlags,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let buffer = unsafe {
            allocator.device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size)
                    .usage(usage)
                    .queue_family_indices(&[allocator.queue_family]),
                None,
            )
        }?;

        let requirements = unsafe { allocator.device.get_buffer_memory_requirements(buffer) };

        let allocation = allocator.inner.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            allocator
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }?;

        Ok(Self { buffer, allocation })
    }

    pub fn new(
        bytes: &[u8],
        name: &str,
        usage: vk::BufferUsageFlags,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let buffer_size = bytes.len() as vk::DeviceSize;

        let buffer = unsafe {
            allocator.device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(buffer_size)
                    .usage(usage)
                    .queue_family_indices(&[allocator.queue_family]),
                None,
            )
        }?;

        let requirements = unsafe { allocator.device.get_buffer_memory_requirements(buffer) };

        let allocation = allocator.inner.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: gpu_allocator::MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        Self::from_parts(allocation, buffer, bytes, allocator)
    }

    pub fn new_with_custom_alignment(
        bytes: &[u8],
        name: &str,
        usage: vk::BufferUsageFlags,
        alignment: vk::DeviceSize,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let buffer_size = bytes.len() as vk::DeviceSize;

        let buffer = unsafe {
            allocator.device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(buffer_size)
                    .usage(usage)
                    .queue_family_indices(&[allocator.queue_family]),
                None,
            )
        }?;

        let mut requirements = unsafe { allocator.device.get_buffer_memory_requirements(buffer) };

        requirements.alignment = requirements.alignment.max(alignment);

        let allocation = allocator.inner.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: gpu_allocator::MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        Self::from_parts(allocation, buffer, bytes, allocator)
    }

    // Uploads via a staging buffer so the data ends up in device-local memory.
    pub fn new_device_local(
        bytes: &[u8],
        name: &str,
        usage: vk::BufferUsageFlags,
        command_pool: vk::CommandPool,
        queue: vk::Queue,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let device = allocator.device.clone();

        let staging_buffer = Buffer::new(
            bytes,
            &format!("{} staging buffer", name),
            vk::BufferUsageFlags::TRANSFER_SRC,
            allocator,
        )?;

        let buffer = Buffer::new_of_size(
            bytes.len() as vk::DeviceSize,
            name,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            allocator,
        )?;

        record_and_submit_once(&device, command_pool, queue, |command_buffer| {
            unsafe {
                device.cmd_copy_buffer(
                    command_buffer,
                    staging_buffer.buffer,
                    buffer.buffer,
                    &[*vk::BufferCopy::builder().size(bytes.len() as vk::DeviceSize)],
                );
            }

            Ok(())
        })?;

        staging_buffer.cleanup(allocator)?;

        Ok(buffer)
    }

    fn from_parts(
        mut allocation: Allocation,
        buffer: vk::Buffer,
        bytes: &[u8],
        allocator: &Allocator,
    ) -> anyhow::Result<Self> {
        let slice = allocation.mapped_slice_mut().unwrap();

        slice[..bytes.len()].copy_from_slice(bytes);

        unsafe {
            allocator
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }?;

        Ok(Self { buffer, allocation })
    }

    pub fn write_mapped(&mut self, bytes: &[u8], offset: usize) -> anyhow::Result<()> {
        let slice = self
            .allocation
            .mapped_slice_mut()
            .context("Attempted to write to an unmapped buffer")?;

        slice[offset..offset + bytes.len()].copy_from_slice(bytes);

        Ok(())
    }

    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        unsafe {
            device.get_buffer_device_address(
                &vk::BufferDeviceAddressInfo::builder().buffer(self.buffer),
            )
        }
    }

    pub fn cleanup(self, allocator: &mut Allocator) -> anyhow::Result<()> {
        allocator.inner.free(self.allocation)?;

        unsafe { allocator.device.destroy_buffer(self.buffer, None) };

        Ok(())
    }
}

pub struct Image {
    pub image: vk::Image,
    pub allocation: Allocation,
    pub view: vk::ImageView,
}

impl Image {
    pub fn new_storage_image(
        width: u32,
        height: u32,
        format: vk::Format,
        command_pool: vk::CommandPool,
        queue: vk::Queue,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let image = unsafe {
            allocator.device.create_image(
                &vk::ImageCreateInfo::builder()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(format)
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .usage(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::STORAGE),
                None,
            )
        }?;

        let requirements = unsafe { allocator.device.get_image_memory_requirements(image) };

        let allocation = allocator.inner.allocate(&AllocationCreateDesc {
            name: "storage image",
            requirements,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            allocator
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }?;

        let view = unsafe {
            allocator.device.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .level_count(1)
                            .layer_count(1)
                            .build(),
                    ),
                None,
            )
        }?;

        // The ray generation shader expects the image to already be GENERAL.
        record_and_submit_once(&allocator.device, command_pool, queue, |command_buffer| {
            unsafe {
                cmd_pipeline_image_memory_barrier_explicit(&PipelineImageMemoryBarrierParams {
                    device: &allocator.device,
                    buffer: command_buffer,
                    src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    dst_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    image_memory_barriers: &[*vk::ImageMemoryBarrier::builder()
                        .image(image)
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(vk::ImageLayout::GENERAL)
                        .subresource_range(
                            vk::ImageSubresourceRange::builder()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .level_count(1)
                                .layer_count(1)
                                .build(),
                        )
                        .dst_access_mask(vk::AccessFlags::SHADER_WRITE)],
                });
            }

            Ok(())
        })?;

        Ok(Self {
            image,
            view,
            allocation,
        })
    }

    pub fn cleanup(self, allocator: &mut Allocator) -> anyhow::Result<()> {
        allocator.inner.free(self.allocation)?;

        unsafe { allocator.device.destroy_image_view(self.view, None) };

        unsafe { allocator.device.destroy_image(self.image, None) };

        Ok(())
    }
}

// Owns every sampled texture and the sampler they share, handing out the
// indices that material infos refer to.
pub struct ImageManager {
    pub images: Vec<Image>,
    pub sampler: vk::Sampler,
}

impl ImageManager {
    pub fn new(device: &ash::Device) -> anyhow::Result<Self> {
        let sampler = unsafe {
            device.create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                    .address_mode_u(vk::SamplerAddressMode::REPEAT)
                    .address_mode_v(vk::SamplerAddressMode::REPEAT)
                    .address_mode_w(vk::SamplerAddressMode::REPEAT)
                    .max_anisotropy(1.0)
                    .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
                    .compare_op(vk::CompareOp::ALWAYS)
                    .max_lod(vk::LOD_CLAMP_NONE),
                None,
            )
        }?;

        Ok(Self {
            images: Vec::new(),
            sampler,
        })
    }

    pub fn push_image(&mut self, image: Image) -> u32 {
        let index = self.images.len() as u32;

        self.images.push(image);

        index
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn image_infos(&self) -> Vec<vk::DescriptorImageInfo> {
        self.images
            .iter()
            .map(|image| {
                *vk::DescriptorImageInfo::builder()
                    .image_view(image.view)
                    .sampler(self.sampler)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect()
    }

    pub fn cleanup(self, allocator: &mut Allocator) -> anyhow::Result<()> {
        unsafe { allocator.device.destroy_sampler(self.sampler, None) };

        for image in self.images {
            image.cleanup(allocator)?;
        }

        Ok(())
    }
}

pub struct AccelerationStructure {
    pub buffer: Buffer,
    pub acceleration_structure: vk::AccelerationStructureKHR,
}

impl AccelerationStructure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        size: vk::DeviceSize,
        name: &str,
        ty: vk::AccelerationStructureTypeKHR,
        loader: &AccelerationStructureLoader,
        command_pool: vk::CommandPool,
        queue: vk::Queue,
        allocator: &mut Allocator,
        scratch_buffer: &Buffer,
        mut geometry_info: vk::AccelerationStructureBuildGeometryInfoKHRBuilder,
        build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) -> anyhow::Result<Self> {
        let device = allocator.device.clone();

        log::info!("Creating a {} of {} bytes", name, size);

        let buffer = Buffer::new_of_size(
            size,
            name,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            allocator,
        )?;

        let acceleration_structure = unsafe {
            loader.create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR::builder()
                    .buffer(buffer.buffer)
                    .offset(0)
                    .size(size)
                    .ty(ty),
                None,
            )
        }?;

        geometry_info = geometry_info
            .dst_acceleration_structure(acceleration_structure)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_buffer.device_address(&device),
            });

        record_and_submit_once(&device, command_pool, queue, |command_buffer| {
            unsafe {
                loader.cmd_build_acceleration_structures(
                    command_buffer,
                    &[*geometry_info],
                    &[build_ranges],
                );
            }

            Ok(())
        })?;

        Ok(Self {
            buffer,
            acceleration_structure,
        })
    }

    pub fn device_address(&self, loader: &AccelerationStructureLoader) -> vk::DeviceAddress {
        unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                    .acceleration_structure(self.acceleration_structure),
            )
        }
    }

    pub fn cleanup(
        self,
        loader: &AccelerationStructureLoader,
        allocator: &mut Allocator,
    ) -> anyhow::Result<()> {
        unsafe { loader.destroy_acceleration_structure(self.acceleration_structure, None) };

        self.buffer.cleanup(allocator)?;

        Ok(())
    }
}

pub fn sbt_handle_stride(props: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR) -> u64 {
    aligned_size(
        props.shader_group_handle_size as u64,
        (props.shader_group_handle_alignment as u64).max(props.shader_group_base_alignment as u64),
    )
}

// Spaces the raw group handles out so each record starts on a stride boundary.
pub fn pack_sbt_handles(handles: &[u8], handle_size: usize, stride: usize) -> Vec<u8> {
    let group_count = handles.len() / handle_size;

    let mut bytes = vec![0; stride * group_count];

    for group in 0..group_count {
        bytes[group * stride..group * stride + handle_size]
            .copy_from_slice(&handles[group * handle_size..(group + 1) * handle_size]);
    }

    bytes
}

fn sbt_region(
    base_address: vk::DeviceAddress,
    stride: u64,
    index: u64,
    count: u64,
) -> vk::StridedDeviceAddressRegionKHR {
    *vk::StridedDeviceAddressRegionKHR::builder()
        .device_address(base_address + index * stride)
        .stride(stride)
        .size(count * stride)
}

pub struct ShaderBindingTable {
    pub buffer: Buffer,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    // Record order matches the pipeline's shader groups: hit, ray generation,
    // miss, shadow miss.
    pub fn new(
        group_handles: &[u8],
        props: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
        device: &ash::Device,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let handle_size = props.shader_group_handle_size as usize;
        let stride = sbt_handle_stride(props);

        let bytes = pack_sbt_handles(group_handles, handle_size, stride as usize);

        let buffer = Buffer::new_with_custom_alignment(
            &bytes,
            "shader binding table",
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            props.shader_group_base_alignment as u64,
            allocator,
        )?;

        let base_address = buffer.device_address(device);

        Ok(Self {
            buffer,
            hit_region: sbt_region(base_address, stride, 0, 1),
            raygen_region: sbt_region(base_address, stride, 1, 1),
            miss_region: sbt_region(base_address, stride, 2, 2),
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }

    pub fn cleanup(self, allocator: &mut Allocator) -> anyhow::Result<()> {
        self.buffer.cleanup(allocator)
    }
}

pub fn uniform_slot_stride(min_offset_alignment: u64) -> u64 {
    aligned_size(
        std::mem::size_of::<Uniforms>() as u64,
        min_offset_alignment.max(1),
    )
}

// One uniform block per frame in flight, bound through a single dynamic
// descriptor.
pub struct UniformBufferRing {
    pub buffer: Buffer,
    stride: u64,
}

impl UniformBufferRing {
    pub fn new(
        slot_count: usize,
        min_offset_alignment: u64,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let stride = uniform_slot_stride(min_offset_alignment);

        let buffer = Buffer::new(
            &vec![0; stride as usize * slot_count],
            "uniform buffer",
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            allocator,
        )?;

        Ok(Self { buffer, stride })
    }

    pub fn write_slot(&mut self, uniforms: &Uniforms, slot: usize) -> anyhow::Result<()> {
        self.buffer
            .write_mapped(bytemuck::bytes_of(uniforms), slot * self.stride as usize)
    }

    pub fn dynamic_offset(&self, slot: usize) -> u32 {
        (slot as u64 * self.stride) as u32
    }

    pub fn cleanup(self, allocator: &mut Allocator) -> anyhow::Result<()> {
        self.buffer.cleanup(allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_props(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
    ) -> vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
        vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            ..Default::default()
        }
    }

    #[test]
    fn sbt_stride_respects_both_alignments() {
        assert_eq!(sbt_handle_stride(&test_props(32, 32, 64)), 64);
        assert_eq!(sbt_handle_stride(&test_props(32, 64, 64)), 64);
        assert_eq!(sbt_handle_stride(&test_props(64, 32, 64)), 64);
        assert_eq!(sbt_handle_stride(&test_props(64, 64, 128)), 128);
    }

    #[test]
    fn packed_handles_start_on_stride_boundaries() {
        let handles: Vec<u8> = (0..32).collect();

        let bytes = pack_sbt_handles(&handles, 8, 16);

        assert_eq!(bytes.len(), 64);

        for group in 0..4 {
            let handle_start = group * 8;
            let record_start = group * 16;

            assert_eq!(
                &bytes[record_start..record_start + 8],
                &handles[handle_start..handle_start + 8]
            );
            assert_eq!(&bytes[record_start + 8..record_start + 16], &[0; 8]);
        }
    }

    #[test]
    fn sbt_regions_are_stride_multiples_apart() {
        let stride = sbt_handle_stride(&test_props(32, 32, 64));

        let hit = sbt_region(4096, stride, 0, 1);
        let raygen = sbt_region(4096, stride, 1, 1);
        let miss = sbt_region(4096, stride, 2, 2);

        assert_eq!(hit.device_address, 4096);
        assert_eq!(raygen.device_address, 4096 + stride);
        assert_eq!(miss.device_address, 4096 + 2 * stride);

        // Required for the ray generation region.
        assert_eq!(raygen.stride, raygen.size);

        assert_eq!(miss.stride, stride);
        assert_eq!(miss.size, 2 * stride);
    }

    #[test]
    fn uniform_slots_are_aligned_up() {
        assert_eq!(uniform_slot_stride(64), 256);
        assert_eq!(uniform_slot_stride(256), 256);
        assert_eq!(uniform_slot_stride(1024), 1024);
        // Some devices report no alignment requirement at all.
        assert_eq!(uniform_slot_stride(1), 256);
    }
}
