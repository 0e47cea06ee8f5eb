// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (capability scored, see selection.rs)
// - Logical device + single queue with ray tracing extensions enabled
// - Memory allocator setup
// - Acceleration structure loader and cached ray tracing properties

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::selection::{self, RayTracingSelector};
use super::{Surface, VulkanInstance};
use crate::error::BootstrapError;

/// Device extensions the ray tracing path needs, in addition to
/// VK_KHR_swapchain when presenting
pub const RAY_TRACING_EXTENSIONS: [&str; 11] = [
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_acceleration_structure",
    "VK_KHR_spirv_1_4",
    "VK_KHR_shader_float_controls",
    "VK_KHR_get_memory_requirements2",
    "VK_EXT_descriptor_indexing",
    "VK_KHR_buffer_device_address",
    "VK_KHR_deferred_host_operations",
    "VK_KHR_pipeline_library",
    "VK_KHR_maintenance3",
    "VK_KHR_maintenance1",
];

pub fn required_device_extensions(presenting: bool) -> Vec<String> {
    let mut extensions = Vec::with_capacity(RAY_TRACING_EXTENSIONS.len() + 1);
    if presenting {
        extensions.push(khr::Swapchain::name().to_string_lossy().into_owned());
    }
    extensions.extend(RAY_TRACING_EXTENSIONS.iter().map(|ext| ext.to_string()));
    extensions
}

/// How to choose the GPU
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub forced_index: Option<usize>,
    pub prefer_discrete: bool,
}

impl DeviceSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            forced_index: config.device.index,
            prefer_discrete: config.device.prefer_discrete,
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device goes away
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<VulkanInstance>,

    // One queue for graphics, present and compute
    pub queue: vk::Queue,
    pub queue_family: u32,

    pub acceleration_structure: khr::AccelerationStructure,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub ray_tracing_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    pub acceleration_structure_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
}

impl VulkanDevice {
    /// Pick a GPU and create the logical device on it. Without a surface no
    /// presentation support is required or enabled.
    pub fn new(
        instance: Arc<VulkanInstance>,
        surface: Option<&Surface>,
        settings: &DeviceSettings,
    ) -> Result<Arc<Self>> {
        let extensions = required_device_extensions(surface.is_some());

        // Step 1: Describe and score every GPU
        let described = selection::describe_devices(&instance.instance, surface)?;
        let candidates = described
            .iter()
            .map(|(_, candidate)| candidate.clone())
            .collect::<Vec<_>>();
        let selector = RayTracingSelector {
            required_extensions: extensions.clone(),
            prefer_discrete: settings.prefer_discrete,
        };
        let chosen = selection::select(&candidates, &selector, settings.forced_index)
            .context("Failed to select a physical device")?;
        let physical_device = described[chosen.index].0;
        let queue_family = chosen
            .queue_family
            .context("Selected GPU has no graphics/compute queue family")?;

        // Present support was sampled while describing devices. Ask again
        // for the family actually chosen, since the one queue below must
        // present as well.
        if let Some(surface) = surface {
            if !surface.supports_present(physical_device, queue_family)? {
                return Err(BootstrapError::PresentUnsupported(queue_family).into());
            }
        }

        // Step 2: Create logical device
        let (device, queue) =
            Self::create_logical_device(&instance.instance, physical_device, queue_family, &extensions)?;

        // Step 3: Cache device properties
        let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let (ray_tracing_properties, acceleration_structure_properties) =
            Self::ray_tracing_properties(&instance.instance, physical_device);

        log::info!("Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy());
        log::info!("API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version));
        log::debug!(
            "Shader group handle size {}, max recursion depth {}",
            ray_tracing_properties.shader_group_handle_size,
            ray_tracing_properties.max_ray_recursion_depth
        );

        // Step 4: Create memory allocator
        let allocator = match Self::create_allocator(&instance.instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let acceleration_structure = khr::AccelerationStructure::new(&instance.instance, &device);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            queue,
            queue_family,
            acceleration_structure,
            properties,
            ray_tracing_properties,
            acceleration_structure_properties,
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        extensions: &[String],
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extension_names = super::instance::to_cstrings(extensions)?;
        let extension_ptrs = extension_names.iter().map(|s| s.as_ptr()).collect::<Vec<_>>();

        let mut bda_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::builder()
            .buffer_device_address(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
            .ray_tracing_pipeline(true);
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
            .acceleration_structure(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features)
            .push_next(&mut bda_features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    fn ray_tracing_properties(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> (
        vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
        vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
    ) {
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        {
            let mut properties2 = vk::PhysicalDeviceProperties2::builder()
                .push_next(&mut rt_properties)
                .push_next(&mut accel_properties);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        }
        // The chain pointers are dangling once properties2 is gone
        rt_properties.p_next = std::ptr::null_mut();
        accel_properties.p_next = std::ptr::null_mut();
        (rt_properties, accel_properties)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let debug_settings = gpu_allocator::AllocatorDebugSettings {
            log_leaks_on_shutdown: true,
            ..Default::default()
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings,
            // Acceleration structure inputs are addressed by pointer
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    pub fn supports_storage_image(&self, format: vk::Format) -> bool {
        let props = unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::STORAGE_IMAGE)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            // The allocator frees its memory blocks on drop
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}
