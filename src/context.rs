use std::ffi::CStr;

use anyhow::anyhow;
use ash::extensions::khr::DeferredHostOperations;
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::window::Window;

use crate::util_functions::{select_physical_device, vulkan_debug_utils_callback};
use crate::util_structs::CStrList;
use crate::{
    AccelerationStructureLoader, DebugUtilsLoader, RayTracingPipelineLoader, SurfaceLoader,
    SwapchainLoader,
};

pub const FRAMES_IN_FLIGHT: usize = 3;

// Waiting longer than this on a fence or an acquire means something has hung.
pub const FRAME_TIMEOUT_NANOS: u64 = 10_000_000_000;

pub struct Context {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub debug_utils_loader: DebugUtilsLoader,
    pub debug_messenger: vk::DebugUtilsMessengerEXT,
    pub surface_loader: SurfaceLoader,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
    pub ray_tracing_props: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    pub min_uniform_buffer_offset_alignment: u64,
}

impl Context {
    pub fn new(window: &Window) -> anyhow::Result<Self> {
        let entry = unsafe { ash::Entry::load() }?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(CStr::from_bytes_with_nul(b"gltf ray tracer\0")?)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut instance_extensions =
            ash_window::enumerate_required_extensions(window.raw_display_handle())?.to_vec();
        instance_extensions.push(DebugUtilsLoader::name().as_ptr());

        let enabled_layers = CStrList::new(if cfg!(debug_assertions) {
            vec![CStr::from_bytes_with_nul(b"VK_LAYER_KHRONOS_validation\0")?]
        } else {
            Vec::new()
        });

        let mut debug_messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_utils_callback));

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_extension_names(&instance_extensions)
                    .enabled_layer_names(&enabled_layers.pointers)
                    .push_next(&mut debug_messenger_info),
                None,
            )
        }?;

        let debug_utils_loader = DebugUtilsLoader::new(&entry, &instance);
        let debug_messenger = unsafe {
            debug_utils_loader.create_debug_utils_messenger(&debug_messenger_info, None)
        }?;

        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }?;

        let surface_loader = SurfaceLoader::new(&entry, &instance);

        let device_extensions = CStrList::new(vec![
            SwapchainLoader::name(),
            DeferredHostOperations::name(),
            AccelerationStructureLoader::name(),
            RayTracingPipelineLoader::name(),
        ]);

        let (physical_device, queue_family, surface_format) =
            match select_physical_device(&instance, &device_extensions, &surface_loader, surface)? {
                Some(selection) => selection,
                None => return Err(anyhow!("No suitable device found")),
            };

        let queue_priorities = [1.0];
        let queue_info = [*vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let device_features = vk::PhysicalDeviceFeatures::builder();

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true);

        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
                .acceleration_structure(true);

        let mut ray_tracing_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let device = unsafe {
            instance.create_device(
                physical_device,
                &vk::DeviceCreateInfo::builder()
                    .queue_create_infos(&queue_info)
                    .enabled_features(&device_features)
                    .enabled_extension_names(&device_extensions.pointers)
                    .enabled_layer_names(&enabled_layers.pointers)
                    .push_next(&mut vulkan_1_2_features)
                    .push_next(&mut acceleration_structure_features)
                    .push_next(&mut ray_tracing_pipeline_features),
                None,
            )
        }?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        // Frame command buffers get re-recorded every frame, so the pool
        // needs per-buffer resets.
        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(queue_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )
        }?;

        let ray_tracing_props =
            unsafe { RayTracingPipelineLoader::get_properties(&instance, physical_device) };

        let device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let min_uniform_buffer_offset_alignment =
            device_properties.limits.min_uniform_buffer_offset_alignment;

        Ok(Self {
            entry,
            instance,
            debug_utils_loader,
            debug_messenger,
            surface_loader,
            surface,
            physical_device,
            queue_family,
            surface_format,
            device,
            queue,
            command_pool,
            ray_tracing_props,
            min_uniform_buffer_offset_alignment,
        })
    }

    pub fn cleanup(self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.debug_utils_loader
                .destroy_debug_utils_messenger(self.debug_messenger, None);
            self.instance.destroy_instance(None);
        }
    }
}

pub struct Swapchain {
    pub loader: SwapchainLoader,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(context: &Context, window_extent: vk::Extent2D) -> anyhow::Result<Self> {
        let surface_caps = unsafe {
            context
                .surface_loader
                .get_physical_device_surface_capabilities(context.physical_device, context.surface)
        }?;

        let mut image_count = (FRAMES_IN_FLIGHT as u32).max(surface_caps.min_image_count);
        // A max count of 0 means there is no maximum.
        if surface_caps.max_image_count > 0 {
            image_count = image_count.min(surface_caps.max_image_count);
        }

        let present_modes = unsafe {
            context
                .surface_loader
                .get_physical_device_surface_present_modes(context.physical_device, context.surface)
        }?;

        // Fifo is the only mode guaranteed to exist.
        let present_mode = if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };

        let extent = match surface_caps.current_extent.width {
            u32::MAX => window_extent,
            _ => surface_caps.current_extent,
        };

        let loader = SwapchainLoader::new(&context.instance, &context.device);

        // The ray traced output gets copied in, so the images need to be
        // transfer destinations on top of the usual colour attachment usage.
        let swapchain = unsafe {
            loader.create_swapchain(
                &vk::SwapchainCreateInfoKHR::builder()
                    .surface(context.surface)
                    .min_image_count(image_count)
                    .image_format(context.surface_format.format)
                    .image_color_space(context.surface_format.color_space)
                    .image_extent(extent)
                    .image_array_layers(1)
                    .image_usage(
                        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                    )
                    .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .pre_transform(surface_caps.current_transform)
                    .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                    .present_mode(present_mode)
                    .clipped(true),
                None,
            )
        }?;

        let images = unsafe { loader.get_swapchain_images(swapchain) }?;

        Ok(Self {
            loader,
            swapchain,
            images,
            extent,
        })
    }

    pub fn cleanup(self) {
        unsafe {
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

pub struct FrameSyncSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub fence: vk::Fence,
}

pub struct FrameSync {
    pub slots: Vec<FrameSyncSlot>,
    current: usize,
}

fn next_slot(slot: usize) -> usize {
    (slot + 1) % FRAMES_IN_FLIGHT
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> anyhow::Result<Self> {
        let slots = (0..FRAMES_IN_FLIGHT)
            .map(|_| -> anyhow::Result<FrameSyncSlot> {
                let image_available =
                    unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None) }?;
                let render_finished =
                    unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None) }?;

                // Signalled so the first wait on each slot passes straight through.
                let fence = unsafe {
                    device.create_fence(
                        &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
                        None,
                    )
                }?;

                Ok(FrameSyncSlot {
                    image_available,
                    render_finished,
                    fence,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { slots, current: 0 })
    }

    // Blocks until the current slot's previous submission has finished and a
    // swapchain image is ready, then hands back `(slot index, image index)`.
    pub fn acquire(
        &mut self,
        device: &ash::Device,
        swapchain: &Swapchain,
    ) -> anyhow::Result<(usize, u32)> {
        let slot = self.current;
        let slot_sync = &self.slots[slot];

        unsafe {
            device.wait_for_fences(&[slot_sync.fence], true, FRAME_TIMEOUT_NANOS)?;
        }

        let (image_index, suboptimal) = unsafe {
            swapchain.loader.acquire_next_image(
                swapchain.swapchain,
                FRAME_TIMEOUT_NANOS,
                slot_sync.image_available,
                vk::Fence::null(),
            )
        }?;

        // The window can't resize, so a suboptimal swapchain means something
        // is wrong with the surface.
        if suboptimal {
            return Err(anyhow!("The swapchain is suboptimal"));
        }

        // Only reset once the acquire has succeeded, otherwise the next wait
        // on this slot would block forever.
        unsafe {
            device.reset_fences(&[slot_sync.fence])?;
        }

        self.current = next_slot(self.current);

        Ok((slot, image_index))
    }

    pub fn submit_and_present(
        &self,
        context: &Context,
        swapchain: &Swapchain,
        slot: usize,
        image_index: u32,
        command_buffer: vk::CommandBuffer,
    ) -> anyhow::Result<()> {
        let slot_sync = &self.slots[slot];

        let wait_semaphores = [slot_sync.image_available];
        // The swapchain image is first touched by the copy, not a render pass.
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [command_buffer];
        let signal_semaphores = [slot_sync.render_finished];

        unsafe {
            context.device.queue_submit(
                context.queue,
                &[*vk::SubmitInfo::builder()
                    .wait_semaphores(&wait_semaphores)
                    .wait_dst_stage_mask(&wait_stages)
                    .command_buffers(&command_buffers)
                    .signal_semaphores(&signal_semaphores)],
                slot_sync.fence,
            )?;
        }

        let swapchains = [swapchain.swapchain];
        let image_indices = [image_index];

        let suboptimal = unsafe {
            swapchain.loader.queue_present(
                context.queue,
                &vk::PresentInfoKHR::builder()
                    .wait_semaphores(&signal_semaphores)
                    .swapchains(&swapchains)
                    .image_indices(&image_indices),
            )
        }?;

        if suboptimal {
            return Err(anyhow!("The swapchain is suboptimal"));
        }

        Ok(())
    }

    pub fn cleanup(self, device: &ash::Device) {
        for slot in &self.slots {
            unsafe {
                device.destroy_semaphore(slot.image_available, None);
                device.destroy_semaphore(slot.render_finished, None);
                device.destroy_fence(slot.fence, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_ring_cycles_round_robin() {
        let mut slot = 0;
        let mut seen = Vec::new();

        for _ in 0..2 * FRAMES_IN_FLIGHT {
            seen.push(slot);
            slot = next_slot(slot);
        }

        assert_eq!(seen, [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn slot_ring_advances_one_step_at_a_time() {
        for slot in 0..FRAMES_IN_FLIGHT {
            let next = next_slot(slot);

            assert!(next < FRAMES_IN_FLIGHT);
            assert_eq!(next, (slot + 1) % FRAMES_IN_FLIGHT);
        }
    }
}
