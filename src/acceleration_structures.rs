use ash::extensions::khr::AccelerationStructure as AccelerationStructureLoader;
use ash::vk;
use glam::{Mat4, Vec3};

use crate::gpu_structs::{unsafe_bytes_of, AccelerationStructureInstance, Vertex};
use crate::scene::{PrimitiveRecord, SceneBuffers};
use crate::util_structs::{AccelerationStructure, Allocator, Buffer};

pub fn blas_build_ranges(
    records: &[PrimitiveRecord],
) -> (Vec<u32>, Vec<vk::AccelerationStructureBuildRangeInfoKHR>) {
    let triangle_counts = records
        .iter()
        .map(|record| record.triangle_count)
        .collect();

    let build_ranges = records
        .iter()
        .map(|record| {
            *vk::AccelerationStructureBuildRangeInfoKHR::builder()
                .primitive_count(record.triangle_count)
                .primitive_offset(record.index_byte_offset)
        })
        .collect();

    (triangle_counts, build_ranges)
}

// One geometry per primitive, all sharing the merged vertex and index buffers.
// The geometry order is what `gl_GeometryIndexEXT` indexes into.
pub fn build_blas(
    scene_buffers: &SceneBuffers,
    records: &[PrimitiveRecord],
    as_loader: &AccelerationStructureLoader,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    allocator: &mut Allocator,
) -> anyhow::Result<AccelerationStructure> {
    let device = allocator.device.clone();

    let vertex_buffer_address = scene_buffers.vertices.device_address(&device);
    let index_buffer_address = scene_buffers.indices.device_address(&device);

    let geometries: Vec<_> = records
        .iter()
        .map(|record| {
            *vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    triangles: *vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                        .vertex_format(vk::Format::R32G32B32_SFLOAT)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: vertex_buffer_address,
                        })
                        .vertex_stride(std::mem::size_of::<Vertex>() as u64)
                        .max_vertex(record.max_vertex)
                        .index_type(vk::IndexType::UINT32)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: index_buffer_address,
                        }),
                })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        })
        .collect();

    let (triangle_counts, build_ranges) = blas_build_ranges(records);

    let geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .geometries(&geometries);

    let build_sizes = unsafe {
        as_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &geometry_info,
            &triangle_counts,
        )
    };

    let scratch_buffer = Buffer::new_of_size(
        build_sizes.build_scratch_size,
        "blas scratch buffer",
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        allocator,
    )?;

    let blas = AccelerationStructure::new(
        build_sizes.acceleration_structure_size,
        "blas",
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        as_loader,
        command_pool,
        queue,
        allocator,
        &scratch_buffer,
        geometry_info,
        &build_ranges,
    )?;

    scratch_buffer.cleanup(allocator)?;

    Ok(blas)
}

// Sponza is authored in centimeters. The instance scales it to meters, which
// the camera spawn and light positions assume.
fn scene_instance(blas_device_address: vk::DeviceAddress) -> AccelerationStructureInstance {
    AccelerationStructureInstance::new(Mat4::from_scale(Vec3::splat(0.01)), blas_device_address)
}

pub fn build_tlas(
    blas: &AccelerationStructure,
    as_loader: &AccelerationStructureLoader,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    allocator: &mut Allocator,
) -> anyhow::Result<AccelerationStructure> {
    let device = allocator.device.clone();

    let instance = scene_instance(blas.device_address(as_loader));

    // Instance data has to start on a 16 byte boundary.
    let instances_buffer = Buffer::new_with_custom_alignment(
        unsafe { unsafe_bytes_of(&instance) },
        "instances buffer",
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        16,
        allocator,
    )?;

    let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder().data(
        vk::DeviceOrHostAddressConstKHR {
            device_address: instances_buffer.device_address(&device),
        },
    );

    let geometries = &[*vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: *instances_data,
        })
        .flags(vk::GeometryFlagsKHR::OPAQUE)];

    let geometry_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .geometries(geometries);

    let build_sizes = unsafe {
        as_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &geometry_info,
            &[1],
        )
    };

    let scratch_buffer = Buffer::new_of_size(
        build_sizes.build_scratch_size,
        "tlas scratch buffer",
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        allocator,
    )?;

    let build_ranges =
        [*vk::AccelerationStructureBuildRangeInfoKHR::builder().primitive_count(1)];

    let tlas = AccelerationStructure::new(
        build_sizes.acceleration_structure_size,
        "tlas",
        vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        as_loader,
        command_pool,
        queue,
        allocator,
        &scratch_buffer,
        geometry_info,
        &build_ranges,
    )?;

    scratch_buffer.cleanup(allocator)?;
    instances_buffer.cleanup(allocator)?;

    Ok(tlas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn the_scene_instance_scales_centimeters_to_meters() {
        let instance = scene_instance(0xdead_beef);

        assert_eq!(instance.transform[0], Vec4::new(0.01, 0.0, 0.0, 0.0));
        assert_eq!(instance.transform[1], Vec4::new(0.0, 0.01, 0.0, 0.0));
        assert_eq!(instance.transform[2], Vec4::new(0.0, 0.0, 0.01, 0.0));

        assert_eq!(instance.acceleration_structure_device_address, 0xdead_beef);
    }

    #[test]
    fn build_ranges_follow_the_primitive_records() {
        let records = [
            PrimitiveRecord {
                max_vertex: 59,
                triangle_count: 100,
                index_byte_offset: 0,
            },
            PrimitiveRecord {
                max_vertex: 39,
                triangle_count: 50,
                index_byte_offset: 1200,
            },
        ];

        let (triangle_counts, build_ranges) = blas_build_ranges(&records);

        assert_eq!(triangle_counts, vec![100, 50]);
        assert_eq!(build_ranges.len(), 2);

        assert_eq!(build_ranges[0].primitive_count, 100);
        assert_eq!(build_ranges[0].primitive_offset, 0);

        assert_eq!(build_ranges[1].primitive_count, 50);
        assert_eq!(build_ranges[1].primitive_offset, 1200);

        // Indices were rewritten at pack time, so no extra vertex offset.
        assert_eq!(build_ranges[1].first_vertex, 0);
    }
}
