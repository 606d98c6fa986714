use anyhow::Context;
use ash::vk;
use glam::{Vec2, Vec3};
use std::path::Path;

use crate::gpu_structs::{MaterialInfo, Vertex};
use crate::util_functions::upload_rgba_texture;
use crate::util_structs::{Allocator, Buffer, ImageManager};

// Texture indices are -1 when the material doesn't have that texture.
#[derive(Clone, Copy)]
pub struct ModelMaterial {
    pub base_color_texture_index: i32,
    pub metallic_roughness_texture_index: i32,
    pub normal_texture_index: i32,
}

impl Default for ModelMaterial {
    fn default() -> Self {
        Self {
            base_color_texture_index: -1,
            metallic_roughness_texture_index: -1,
            normal_texture_index: -1,
        }
    }
}

pub struct ModelPrimitive {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material: ModelMaterial,
}

pub struct Model {
    pub primitives: Vec<ModelPrimitive>,
    pub images: Vec<image::RgbaImage>,
}

pub fn load_gltf_model(path: &Path) -> anyhow::Result<Model> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read model from {}", path.display()))?;

    let gltf = gltf::Gltf::from_slice(&bytes)?;

    let parent_directory = path
        .parent()
        .context("Model path has no parent directory")?;

    let mut buffers = Vec::new();

    for buffer in gltf.buffers() {
        match buffer.source() {
            gltf::buffer::Source::Bin => {
                buffers.push(
                    gltf.blob
                        .clone()
                        .context("Model is missing its binary blob")?,
                );
            }
            gltf::buffer::Source::Uri(uri) => {
                anyhow::ensure!(
                    !uri.starts_with("data:"),
                    "Data uri buffers are not supported"
                );

                buffers.push(std::fs::read(parent_directory.join(uri))?);
            }
        }
    }

    let materials: Vec<_> = gltf
        .materials()
        .map(|material| {
            let pbr = material.pbr_metallic_roughness();

            ModelMaterial {
                base_color_texture_index: pbr
                    .base_color_texture()
                    .map(|info| info.texture().source().index() as i32)
                    .unwrap_or(-1),
                metallic_roughness_texture_index: pbr
                    .metallic_roughness_texture()
                    .map(|info| info.texture().source().index() as i32)
                    .unwrap_or(-1),
                normal_texture_index: material
                    .normal_texture()
                    .map(|normal| normal.texture().source().index() as i32)
                    .unwrap_or(-1),
            }
        })
        .collect();

    let mut images = Vec::new();

    for gltf_image in gltf.images() {
        let image_bytes = match gltf_image.source() {
            gltf::image::Source::View { view, .. } => image_view_bytes(&buffers, &view)?,
            gltf::image::Source::Uri { uri, .. } => {
                anyhow::ensure!(
                    !uri.starts_with("data:"),
                    "Data uri images are not supported"
                );

                std::fs::read(parent_directory.join(uri))?
            }
        };

        images.push(image::load_from_memory(&image_bytes)?.to_rgba8());
    }

    let mut primitives = Vec::new();

    for mesh in gltf.meshes() {
        for primitive in mesh.primitives() {
            let reader = primitive
                .reader(|buffer| buffers.get(buffer.index()).map(|buffer| buffer.as_slice()));

            let positions = reader
                .read_positions()
                .context("Primitive has no positions")?;
            let normals = reader.read_normals().context("Primitive has no normals")?;
            let uvs = reader
                .read_tex_coords(0)
                .context("Primitive has no uvs")?
                .into_f32();

            let vertices = positions
                .zip(normals)
                .zip(uvs)
                .map(|((position, normal), uv)| {
                    Vertex::new(Vec3::from(position), Vec3::from(normal), Vec2::from(uv))
                })
                .collect();

            let indices = reader
                .read_indices()
                .context("Primitive has no indices")?
                .into_u32()
                .collect();

            let material = primitive
                .material()
                .index()
                .map(|index| materials[index])
                .unwrap_or_default();

            primitives.push(ModelPrimitive {
                vertices,
                indices,
                material,
            });
        }
    }

    log::info!(
        "Loaded {}: {} primitives, {} images",
        path.display(),
        primitives.len(),
        images.len()
    );

    Ok(Model { primitives, images })
}

// A companion .bin shorter than the glTF declares is an error, not a panic.
fn image_view_bytes(buffers: &[Vec<u8>], view: &gltf::buffer::View) -> anyhow::Result<Vec<u8>> {
    let buffer = buffers
        .get(view.buffer().index())
        .context("Image view points at a missing buffer")?;

    let bytes = buffer
        .get(view.offset()..view.offset() + view.length())
        .context("Image view is out of bounds of its buffer")?;

    Ok(bytes.to_vec())
}

// The material texture indices assume the manager gets filled in glTF image
// order, starting from an empty manager.
pub fn upload_model_images(
    model: &Model,
    image_manager: &mut ImageManager,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    allocator: &mut Allocator,
) -> anyhow::Result<()> {
    for (index, rgba_image) in model.images.iter().enumerate() {
        let image = upload_rgba_texture(
            rgba_image,
            &format!("texture {}", index),
            command_pool,
            queue,
            allocator,
        )?;

        image_manager.push_image(image);
    }

    Ok(())
}

pub struct PrimitiveRecord {
    pub max_vertex: u32,
    pub triangle_count: u32,
    pub index_byte_offset: u32,
}

pub struct PackedGeometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub triangle_table: Vec<[u32; 4]>,
    pub materials: Vec<MaterialInfo>,
    pub primitive_records: Vec<PrimitiveRecord>,
}

impl PackedGeometry {
    // Merges every primitive into shared vertex and index buffers. Indices get
    // rewritten to address the merged vertex buffer, so the geometry build
    // ranges all use a firstVertex of zero.
    pub fn pack(primitives: &[ModelPrimitive]) -> Self {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut materials = Vec::new();
        let mut primitive_records = Vec::new();

        let mut vertex_offset = 0;
        let mut index_byte_offset = 0;
        let mut triangle_offset = 0;

        for primitive in primitives {
            let mut max_vertex = 0;

            for &index in &primitive.indices {
                indices.push(vertex_offset + index);
                max_vertex = max_vertex.max(index);
            }

            vertices.extend_from_slice(&primitive.vertices);

            primitive_records.push(PrimitiveRecord {
                max_vertex,
                triangle_count: primitive.indices.len() as u32 / 3,
                index_byte_offset,
            });

            // Missing base colors stay -1 for the hit shader to test, while
            // the other two fall back to the first texture.
            materials.push(MaterialInfo {
                base_color_texture_index: primitive.material.base_color_texture_index,
                metallic_roughness_texture_index: primitive
                    .material
                    .metallic_roughness_texture_index
                    .max(0),
                normal_texture_index: primitive.material.normal_texture_index.max(0),
                index_buffer_offset: triangle_offset,
            });

            vertex_offset += primitive.vertices.len() as u32;
            index_byte_offset += (std::mem::size_of::<u32>() * primitive.indices.len()) as u32;
            triangle_offset += primitive.indices.len() as i32 / 3;
        }

        let triangle_table = indices
            .chunks(3)
            .map(|triangle| [triangle[0], triangle[1], triangle[2], 0])
            .collect();

        Self {
            vertices,
            indices,
            triangle_table,
            materials,
            primitive_records,
        }
    }
}

pub struct SceneBuffers {
    pub vertices: Buffer,
    pub indices: Buffer,
    pub triangle_table: Buffer,
    pub materials: Buffer,
}

impl SceneBuffers {
    pub fn upload(
        geometry: &PackedGeometry,
        command_pool: vk::CommandPool,
        queue: vk::Queue,
        allocator: &mut Allocator,
    ) -> anyhow::Result<Self> {
        let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        Ok(Self {
            vertices: Buffer::new_device_local(
                bytemuck::cast_slice(&geometry.vertices),
                "vertex buffer",
                geometry_usage,
                command_pool,
                queue,
                allocator,
            )?,
            indices: Buffer::new_device_local(
                bytemuck::cast_slice(&geometry.indices),
                "index buffer",
                geometry_usage,
                command_pool,
                queue,
                allocator,
            )?,
            triangle_table: Buffer::new_device_local(
                bytemuck::cast_slice(&geometry.triangle_table),
                "triangle table buffer",
                vk::BufferUsageFlags::STORAGE_BUFFER,
                command_pool,
                queue,
                allocator,
            )?,
            materials: Buffer::new_device_local(
                bytemuck::cast_slice(&geometry.materials),
                "material buffer",
                vk::BufferUsageFlags::STORAGE_BUFFER,
                command_pool,
                queue,
                allocator,
            )?,
        })
    }

    pub fn cleanup(self, allocator: &mut Allocator) -> anyhow::Result<()> {
        self.vertices.cleanup(allocator)?;
        self.indices.cleanup(allocator)?;
        self.triangle_table.cleanup(allocator)?;
        self.materials.cleanup(allocator)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_primitive(
        vertex_count: u32,
        triangle_count: u32,
        material: ModelMaterial,
    ) -> ModelPrimitive {
        let vertices = (0..vertex_count)
            .map(|i| Vertex::new(Vec3::new(i as f32, 0.0, 0.0), Vec3::Y, Vec2::ZERO))
            .collect();

        let indices = (0..triangle_count * 3).map(|i| i % vertex_count).collect();

        ModelPrimitive {
            vertices,
            indices,
            material,
        }
    }

    fn test_geometry() -> PackedGeometry {
        PackedGeometry::pack(&[
            test_primitive(60, 100, ModelMaterial::default()),
            test_primitive(
                40,
                50,
                ModelMaterial {
                    base_color_texture_index: 2,
                    metallic_roughness_texture_index: 1,
                    normal_texture_index: 3,
                },
            ),
        ])
    }

    #[test]
    fn packed_indices_address_the_merged_vertex_buffer() {
        let geometry = test_geometry();

        assert_eq!(geometry.vertices.len(), 100);
        assert_eq!(geometry.indices.len(), 450);

        // The second primitive's indices start where its vertices do.
        assert_eq!(geometry.indices[300], 60);

        assert!(geometry.indices.iter().all(|&index| index < 100));
    }

    #[test]
    fn primitive_records_describe_build_ranges() {
        let geometry = test_geometry();

        assert_eq!(geometry.primitive_records.len(), 2);

        assert_eq!(geometry.primitive_records[0].triangle_count, 100);
        assert_eq!(geometry.primitive_records[0].index_byte_offset, 0);
        assert_eq!(geometry.primitive_records[0].max_vertex, 59);

        assert_eq!(geometry.primitive_records[1].triangle_count, 50);
        assert_eq!(geometry.primitive_records[1].index_byte_offset, 1200);
        assert_eq!(geometry.primitive_records[1].max_vertex, 39);
    }

    #[test]
    fn triangle_table_has_one_entry_per_triangle() {
        let geometry = test_geometry();

        assert_eq!(geometry.triangle_table.len(), 150);

        assert_eq!(geometry.triangle_table[0], [0, 1, 2, 0]);

        // First triangle of the second primitive, rewritten.
        assert_eq!(geometry.triangle_table[100], [60, 61, 62, 0]);
    }

    #[test]
    fn materials_carry_triangle_offsets_and_clamps() {
        let geometry = test_geometry();

        assert_eq!(geometry.materials[0].index_buffer_offset, 0);
        assert_eq!(geometry.materials[1].index_buffer_offset, 100);

        // Base color stays -1 so the hit shader can fall back, the others
        // clamp to the first texture.
        assert_eq!(geometry.materials[0].base_color_texture_index, -1);
        assert_eq!(geometry.materials[0].metallic_roughness_texture_index, 0);
        assert_eq!(geometry.materials[0].normal_texture_index, 0);

        assert_eq!(geometry.materials[1].base_color_texture_index, 2);
        assert_eq!(geometry.materials[1].metallic_roughness_texture_index, 1);
        assert_eq!(geometry.materials[1].normal_texture_index, 3);
    }

    #[test]
    fn empty_models_pack_to_empty_buffers() {
        let geometry = PackedGeometry::pack(&[]);

        assert!(geometry.vertices.is_empty());
        assert!(geometry.indices.is_empty());
        assert!(geometry.triangle_table.is_empty());
        assert!(geometry.materials.is_empty());
        assert!(geometry.primitive_records.is_empty());
    }

    #[test]
    fn triangle_table_uploads_as_sixteen_byte_entries() {
        let geometry = test_geometry();

        let bytes: &[u8] = bytemuck::cast_slice(&geometry.triangle_table);

        assert_eq!(bytes.len(), geometry.triangle_table.len() * 16);
    }

    #[test]
    fn truncated_image_buffers_are_an_error() {
        let json = br#"{
            "asset": {"version": "2.0"},
            "buffers": [{"byteLength": 1024, "uri": "scene.bin"}],
            "bufferViews": [{"buffer": 0, "byteOffset": 512, "byteLength": 512}],
            "images": [{"bufferView": 0, "mimeType": "image/png"}]
        }"#;

        let gltf = gltf::Gltf::from_slice(json).unwrap();
        let gltf_image = gltf.images().next().unwrap();

        let view = match gltf_image.source() {
            gltf::image::Source::View { view, .. } => view,
            gltf::image::Source::Uri { .. } => unreachable!(),
        };

        // The declared range is valid, but the companion buffer came up short.
        let result = image_view_bytes(&[vec![0; 16]], &view);
        assert!(result.is_err());

        let bytes = image_view_bytes(&[vec![0; 1024]], &view).unwrap();
        assert_eq!(bytes.len(), 512);
    }
}
