use std::path::Path;
use std::time::Instant;

use ash::vk;
use glam::Vec3;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, VirtualKeyCode, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::platform::run_return::EventLoopExtRunReturn;
use winit::window::WindowBuilder;

mod acceleration_structures;
mod camera;
mod command_buffer_recording;
mod context;
mod descriptors;
mod gpu_structs;
mod pipeline;
mod scene;
mod util_functions;
mod util_structs;

pub use ash::extensions::ext::DebugUtils as DebugUtilsLoader;
pub use ash::extensions::khr::{
    AccelerationStructure as AccelerationStructureLoader,
    RayTracingPipeline as RayTracingPipelineLoader, Surface as SurfaceLoader,
    Swapchain as SwapchainLoader,
};

use acceleration_structures::{build_blas, build_tlas};
use camera::{Camera, KeyStates};
use command_buffer_recording::{record_frame, FrameRecordParams};
use context::{Context, FrameSync, Swapchain, FRAMES_IN_FLIGHT};
use descriptors::{Descriptors, DescriptorWrites};
use pipeline::RayTracingPipeline;
use scene::{PackedGeometry, SceneBuffers};
use util_structs::{Allocator, Image, ImageManager, UniformBufferRing};

const WIDTH: u32 = 1600;
const HEIGHT: u32 = 1200;

const MODEL_PATH: &str = "sponza/Sponza.gltf";

fn main() -> anyhow::Result<()> {
    simplelog::TermLogger::init(
        log::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let mut event_loop = EventLoop::new();

    let window = WindowBuilder::new()
        .with_title("gltf ray tracer")
        .with_inner_size(PhysicalSize::new(WIDTH, HEIGHT))
        .with_resizable(false)
        .build(&event_loop)?;

    let context = Context::new(&window)?;
    let device = context.device.clone();

    let mut allocator = Allocator::new(
        context.instance.clone(),
        device.clone(),
        context.physical_device,
        context.queue_family,
    )?;

    let swapchain = Swapchain::new(
        &context,
        vk::Extent2D {
            width: WIDTH,
            height: HEIGHT,
        },
    )?;

    let as_loader = AccelerationStructureLoader::new(&context.instance, &device);
    let pipeline_loader = RayTracingPipelineLoader::new(&context.instance, &device);

    let model = scene::load_gltf_model(Path::new(MODEL_PATH))?;

    let mut image_manager = ImageManager::new(&device)?;

    scene::upload_model_images(
        &model,
        &mut image_manager,
        context.command_pool,
        context.queue,
        &mut allocator,
    )?;

    let geometry = PackedGeometry::pack(&model.primitives);

    let scene_buffers = SceneBuffers::upload(
        &geometry,
        context.command_pool,
        context.queue,
        &mut allocator,
    )?;

    let blas = build_blas(
        &scene_buffers,
        &geometry.primitive_records,
        &as_loader,
        context.command_pool,
        context.queue,
        &mut allocator,
    )?;

    let tlas = build_tlas(
        &blas,
        &as_loader,
        context.command_pool,
        context.queue,
        &mut allocator,
    )?;

    let storage_image = Image::new_storage_image(
        swapchain.extent.width,
        swapchain.extent.height,
        context.surface_format.format,
        context.command_pool,
        context.queue,
        &mut allocator,
    )?;

    let mut uniform_ring = UniformBufferRing::new(
        FRAMES_IN_FLIGHT,
        context.min_uniform_buffer_offset_alignment,
        &mut allocator,
    )?;

    let descriptors = Descriptors::new(&device, image_manager.image_count())?;

    let image_infos = image_manager.image_infos();

    descriptors.write_descriptor_sets(
        &device,
        &DescriptorWrites {
            tlas: tlas.acceleration_structure,
            uniform_buffer: uniform_ring.buffer.buffer,
            triangle_table_buffer: scene_buffers.triangle_table.buffer,
            vertex_buffer: scene_buffers.vertices.buffer,
            storage_image_view: storage_image.view,
            material_buffer: scene_buffers.materials.buffer,
            image_infos: &image_infos,
        },
    );

    let pipeline = RayTracingPipeline::new(
        &device,
        &pipeline_loader,
        &descriptors.layouts(),
        &context.ray_tracing_props,
        &mut allocator,
    )?;

    let command_buffers = unsafe {
        device.allocate_command_buffers(
            &vk::CommandBufferAllocateInfo::builder()
                .command_pool(context.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(FRAMES_IN_FLIGHT as u32),
        )
    }?;

    let mut frame_sync = FrameSync::new(&device)?;

    // A spot next to the lion head with a view down the atrium.
    let mut camera = Camera::new(Vec3::new(6.3, 4.5, -0.7), Vec3::new(0.0, 1.57, 0.0));
    let mut key_states = KeyStates::default();

    let aspect_ratio = WIDTH as f32 / HEIGHT as f32;

    let mut previous_frame_time = Instant::now();
    let mut frame_error = None;

    event_loop.run_return(|event, _, control_flow| {
        *control_flow = ControlFlow::Poll;

        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => *control_flow = ControlFlow::Exit,
                WindowEvent::KeyboardInput { input, .. } => {
                    if input.state == ElementState::Pressed
                        && input.virtual_keycode == Some(VirtualKeyCode::Escape)
                    {
                        *control_flow = ControlFlow::Exit;
                    }

                    key_states.handle_event(&input);
                }
                _ => {}
            },
            Event::MainEventsCleared => {
                window.request_redraw();
            }
            Event::RedrawRequested(_) => {
                let delta_time = previous_frame_time.elapsed().as_secs_f32();
                previous_frame_time = Instant::now();

                camera.update(&key_states, delta_time);

                let result = draw_frame(
                    &context,
                    &swapchain,
                    &mut frame_sync,
                    &mut uniform_ring,
                    &camera,
                    aspect_ratio,
                    &command_buffers,
                    &pipeline_loader,
                    &pipeline,
                    &descriptors,
                    storage_image.image,
                );

                exit_on_draw_error(result, &mut frame_error, control_flow);
            }
            _ => {}
        }
    });

    unsafe {
        device.device_wait_idle()?;
    }

    frame_sync.cleanup(&device);
    pipeline.cleanup(&device, &mut allocator)?;
    descriptors.cleanup(&device);
    uniform_ring.cleanup(&mut allocator)?;
    storage_image.cleanup(&mut allocator)?;
    tlas.cleanup(&as_loader, &mut allocator)?;
    blas.cleanup(&as_loader, &mut allocator)?;
    scene_buffers.cleanup(&mut allocator)?;
    image_manager.cleanup(&mut allocator)?;
    swapchain.cleanup();

    // The allocator frees through the device, so it has to go first.
    drop(allocator);
    context.cleanup();

    // A failed frame still gets the cleanup above, but the process has to
    // exit nonzero.
    match frame_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

// The first failed frame ends the loop; later redraws can cascade off it, so
// theirs are only logged.
fn exit_on_draw_error(
    result: anyhow::Result<()>,
    frame_error: &mut Option<anyhow::Error>,
    control_flow: &mut ControlFlow,
) {
    if let Err(error) = result {
        log::error!("Error while drawing a frame: {:#}", error);

        if frame_error.is_none() {
            *frame_error = Some(error);
        }

        *control_flow = ControlFlow::Exit;
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_frame(
    context: &Context,
    swapchain: &Swapchain,
    frame_sync: &mut FrameSync,
    uniform_ring: &mut UniformBufferRing,
    camera: &Camera,
    aspect_ratio: f32,
    command_buffers: &[vk::CommandBuffer],
    pipeline_loader: &RayTracingPipelineLoader,
    pipeline: &RayTracingPipeline,
    descriptors: &Descriptors,
    storage_image: vk::Image,
) -> anyhow::Result<()> {
    let (slot, image_index) = frame_sync.acquire(&context.device, swapchain)?;

    // The fence wait in acquire means the GPU is done with this slot's block.
    uniform_ring.write_slot(&camera.uniforms(aspect_ratio), slot)?;

    let command_buffer = command_buffers[slot];

    unsafe {
        record_frame(
            command_buffer,
            &FrameRecordParams {
                device: &context.device,
                pipeline_loader,
                pipeline,
                descriptor_sets: descriptors.sets(),
                uniform_offset: uniform_ring.dynamic_offset(slot),
                storage_image,
                swapchain_image: swapchain.images[image_index as usize],
                extent: swapchain.extent,
            },
        )?;
    }

    frame_sync.submit_and_present(context, swapchain, slot, image_index, command_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_errors_exit_the_loop_and_the_first_is_kept() {
        let mut frame_error = None;
        let mut control_flow = ControlFlow::Poll;

        exit_on_draw_error(Ok(()), &mut frame_error, &mut control_flow);

        assert!(frame_error.is_none());
        assert_eq!(control_flow, ControlFlow::Poll);

        exit_on_draw_error(
            Err(anyhow::anyhow!("device lost")),
            &mut frame_error,
            &mut control_flow,
        );
        exit_on_draw_error(
            Err(anyhow::anyhow!("swapchain suboptimal")),
            &mut frame_error,
            &mut control_flow,
        );

        assert_eq!(control_flow, ControlFlow::Exit);
        assert_eq!(frame_error.unwrap().to_string(), "device lost");
    }
}
