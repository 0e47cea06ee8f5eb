// =============================================================================
// RENDERING CONTEXT - everything the ray tracer will need, created in order
// =============================================================================
//
// BOOTSTRAP ORDER:
//   instance -> surface -> physical/logical device -> swapchain
//   -> command pool -> storage image -> mesh buffers -> BLAS -> TLAS
//
// Each step is a RAII value. If step N fails, steps 0..N are dropped in
// reverse, so a failed bootstrap leaves nothing behind.

use anyhow::{Context, Result};
use glam::Mat4;
use raw_window_handle::HasRawDisplayHandle;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::{
    swapchain, AccelerationStructure, CommandPool, DeviceSettings, InstanceSettings, StorageImage, Surface,
    Swapchain, VulkanDevice, VulkanInstance,
};
use crate::config::Config;
use crate::scene::MeshBuffers;

/// Owns every GPU object of the demo.
///
/// IMPORTANT: Field order matters for Drop! Fields drop top to bottom, which
/// is the reverse of creation order.
pub struct RenderContext {
    pub tlas: AccelerationStructure,
    pub blas: AccelerationStructure,
    pub mesh: MeshBuffers,
    pub storage_image: StorageImage,
    pub command_pool: CommandPool,
    pub swapchain: Option<Swapchain>,
    pub device: Arc<VulkanDevice>,
    pub surface: Surface,
    pub instance: Arc<VulkanInstance>,
    // Outlives the surface created from it
    _window: Arc<Window>,
    present_mode: Option<ash::vk::PresentModeKHR>,
}

impl RenderContext {
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // STEP 1: Instance, with the surface extensions this display needs
        let instance = VulkanInstance::new(
            &InstanceSettings::from_config(config),
            Some(window.raw_display_handle()),
        )?;

        // STEP 2: Surface
        let surface = Surface::new(instance.clone(), &*window)?;

        // STEP 3: Physical + logical device
        let device = VulkanDevice::new(
            instance.clone(),
            Some(&surface),
            &DeviceSettings::from_config(config),
        )?;

        // STEP 4: Swapchain sized to the window
        let size = window.inner_size();
        let present_mode = config.present_mode();
        let swapchain = Swapchain::new(
            device.clone(),
            &surface,
            size.width,
            size.height,
            present_mode,
        )?;

        // STEP 5: Commands + ray trace target
        let command_pool = CommandPool::new(device.clone())?;
        let storage_image =
            StorageImage::new(device.clone(), &command_pool, swapchain.format, swapchain.extent)?;

        // STEP 6: Geometry
        let mesh = MeshBuffers::upload(device.clone(), &command_pool, config.debug.verify_uploads)
            .context("Failed to upload mesh")?;

        // STEP 7: Acceleration structures
        let blas = AccelerationStructure::build_blas(device.clone(), &command_pool, &mesh)?;
        let tlas =
            AccelerationStructure::build_tlas(device.clone(), &command_pool, &blas, &Mat4::IDENTITY)?;

        log::info!(
            "Acceleration structures: BLAS {} bytes, TLAS {} bytes at {:#x}",
            blas.size(),
            tlas.size(),
            tlas.address
        );
        log::info!(
            "Ray trace target: {}x{} {:?}, {} triangle(s)",
            storage_image.extent.width,
            storage_image.extent.height,
            storage_image.format,
            mesh.triangle_count()
        );
        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            tlas,
            blas,
            mesh,
            storage_image,
            command_pool,
            swapchain: Some(swapchain),
            device,
            surface,
            instance,
            _window: window,
            present_mode,
        })
    }

    /// Recreate the swapchain and the storage image for a new window size.
    /// Returns false, recreating nothing, while the window is minimized.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<bool> {
        if !swapchain::needs_recreate(width, height) {
            return Ok(false);
        }

        // Wait for GPU to finish all work before destroying resources
        self.device.wait_idle()?;

        // The surface can only have one swapchain at a time
        self.swapchain = None;

        let swapchain = Swapchain::new(
            self.device.clone(),
            &self.surface,
            width,
            height,
            self.present_mode,
        )?;

        self.storage_image = StorageImage::new(
            self.device.clone(),
            &self.command_pool,
            swapchain.format,
            swapchain.extent,
        )?;
        self.swapchain = Some(swapchain);

        Ok(true)
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        let errors = self.instance.validation_errors();
        if errors > 0 {
            log::warn!("Validation layer reported {} error(s) this run", errors);
        }
        // Wait for GPU to finish before the fields start dropping
        let _ = self.device.wait_idle();
    }
}
