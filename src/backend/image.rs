// Storage image - the ray trace output target

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::{CommandPool, VulkanDevice};
use crate::error::BootstrapError;

/// Tried in order when the swapchain format can't be written from shaders
const STORAGE_FALLBACK_FORMATS: [vk::Format; 2] =
    [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub struct StorageImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl StorageImage {
    /// Create the image, bind device-local memory, create a view and move it
    /// to GENERAL layout so shaders can write it
    pub fn new(
        device: Arc<VulkanDevice>,
        pool: &CommandPool,
        preferred_format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let format = choose_storage_format(preferred_format, |f| device.supports_storage_image(f))
            .ok_or(BootstrapError::NoStorageFormat)?;
        if format != preferred_format {
            log::info!(
                "{:?} does not support storage usage, storage image uses {:?}",
                preferred_format,
                format
            );
        }

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::STORAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create storage image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "storage image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e).context("Failed to allocate storage image memory");
            }
        };

        let mut storage = Self {
            image,
            view: vk::ImageView::null(),
            format,
            extent,
            allocation: Some(allocation),
            device,
        };

        if let Some(allocation) = &storage.allocation {
            unsafe {
                storage
                    .device
                    .device
                    .bind_image_memory(image, allocation.memory(), allocation.offset())
            }
            .context("Failed to bind storage image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(COLOR_RANGE);

        storage.view = unsafe { storage.device.device.create_image_view(&view_info, None) }
            .context("Failed to create storage image view")?;

        storage.transition_to_general(pool)?;

        log::info!(
            "Created storage image {}x{} ({:?})",
            extent.width,
            extent.height,
            format
        );
        Ok(storage)
    }

    fn transition_to_general(&self, pool: &CommandPool) -> Result<()> {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::SHADER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(COLOR_RANGE)
            .build();

        pool.one_shot(|device, cmd| unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
        .context("Failed to transition storage image layout")
    }
}

impl Drop for StorageImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                log::error!("Failed to free storage image memory: {}", e);
            }
        }
    }
}

/// The swapchain format if it supports storage usage, else the first
/// fallback that does
pub fn choose_storage_format(
    preferred: vk::Format,
    supports_storage: impl Fn(vk::Format) -> bool,
) -> Option<vk::Format> {
    std::iter::once(preferred)
        .chain(STORAGE_FALLBACK_FORMATS)
        .find(|&format| supports_storage(format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_format_used_when_storable() {
        let format = choose_storage_format(vk::Format::B8G8R8A8_UNORM, |_| true);
        assert_eq!(format, Some(vk::Format::B8G8R8A8_UNORM));
    }

    #[test]
    fn srgb_falls_back_to_unorm() {
        let format = choose_storage_format(vk::Format::B8G8R8A8_SRGB, |f| {
            f != vk::Format::B8G8R8A8_SRGB
        });
        assert_eq!(format, Some(vk::Format::B8G8R8A8_UNORM));

        let format = choose_storage_format(vk::Format::B8G8R8A8_SRGB, |f| {
            f == vk::Format::R8G8B8A8_UNORM
        });
        assert_eq!(format, Some(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn nothing_storable() {
        assert_eq!(choose_storage_format(vk::Format::B8G8R8A8_SRGB, |_| false), None);
    }
}
