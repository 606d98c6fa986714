use ash::vk;
use glam::{Mat4, Vec2, Vec3, Vec4};

pub const LIGHT_POSITIONS: [Vec4; 4] = [
    Vec4::new(6.0, 6.0, 0.0, 0.0),
    Vec4::new(2.0, 5.0, 0.0, 0.0),
    Vec4::new(-2.0, 4.0, 0.0, 0.0),
    Vec4::new(-6.0, 3.0, 0.0, 0.0),
];

#[derive(Copy, Clone, bytemuck::Zeroable, bytemuck::Pod, Debug)]
#[repr(C)]
pub struct Uniforms {
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
    pub position: Vec4,
    pub right: Vec4,
    pub up: Vec4,
    pub forward: Vec4,
    pub light_positions: [Vec4; 4],
}

// Matches the std430 vertex layout in the closest-hit shader.
#[derive(Copy, Clone, bytemuck::Zeroable, bytemuck::Pod, Debug)]
#[repr(C)]
pub struct Vertex {
    pub position: Vec3,
    pub _padding_0: f32,
    pub normal: Vec3,
    pub _padding_1: f32,
    pub uv: Vec2,
    pub _padding_2: [f32; 2],
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            _padding_0: 0.0,
            normal,
            _padding_1: 0.0,
            uv,
            _padding_2: [0.0; 2],
        }
    }
}

#[derive(Copy, Clone, bytemuck::Zeroable, bytemuck::Pod, Debug)]
#[repr(C)]
pub struct MaterialInfo {
    pub base_color_texture_index: i32,
    pub metallic_roughness_texture_index: i32,
    pub normal_texture_index: i32,
    pub index_buffer_offset: i32,
}

pub unsafe fn unsafe_bytes_of<T>(reference: &T) -> &[u8] {
    std::slice::from_raw_parts(reference as *const T as *const u8, std::mem::size_of::<T>())
}

// A slightly easier to use `vk::AccelerationStructureInstanceKHR`.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct AccelerationStructureInstance {
    pub transform: [Vec4; 3],
    pub instance_custom_index_and_mask: vk::Packed24_8,
    pub instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8,
    pub acceleration_structure_device_address: vk::DeviceAddress,
}

impl AccelerationStructureInstance {
    pub fn new(transform: Mat4, blas_device_address: vk::DeviceAddress) -> Self {
        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;

        Self {
            transform: transpose_matrix_for_instance(transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                flags.as_raw() as u8,
            ),
            acceleration_structure_device_address: blas_device_address,
        }
    }
}

// `VkTransformMatrixKHR` wants a row-major 3x4 matrix.
pub fn transpose_matrix_for_instance(matrix: Mat4) -> [Vec4; 3] {
    [matrix.row(0), matrix.row(1), matrix.row(2)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_shader_interface() {
        assert_eq!(std::mem::size_of::<Uniforms>(), 256);
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
        assert_eq!(std::mem::size_of::<MaterialInfo>(), 16);
        assert_eq!(
            std::mem::size_of::<AccelerationStructureInstance>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn identity_transform_rows() {
        let rows = transpose_matrix_for_instance(Mat4::IDENTITY);
        assert_eq!(rows[0], Vec4::new(1.0, 0.0, 0.0, 0.0));
        assert_eq!(rows[1], Vec4::new(0.0, 1.0, 0.0, 0.0));
        assert_eq!(rows[2], Vec4::new(0.0, 0.0, 1.0, 0.0));
    }

    #[test]
    fn translation_ends_up_in_the_fourth_column() {
        let rows = transpose_matrix_for_instance(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(rows[0].w, 1.0);
        assert_eq!(rows[1].w, 2.0);
        assert_eq!(rows[2].w, 3.0);
    }

    #[test]
    fn vertex_padding_is_zeroed() {
        let vertex = Vertex::new(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec2::new(0.5, 0.5),
        );
        let bytes = bytemuck::bytes_of(&vertex);
        assert_eq!(&bytes[12..16], &[0; 4]);
        assert_eq!(&bytes[28..32], &[0; 4]);
        assert_eq!(&bytes[40..48], &[0; 8]);
    }
}
