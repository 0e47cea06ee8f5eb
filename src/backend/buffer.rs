// GPU buffers
//
// Each Buffer owns its vk::Buffer and gpu-allocator allocation and gives both
// back on drop, so staging buffers are released on every exit path of an
// upload.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::{CommandPool, VulkanDevice};
use crate::error::BootstrapError;

/// Usage for buffers that feed acceleration structure builds and may later
/// be read by shaders
pub const GEOMETRY_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

pub struct Buffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Helper to create a GPU buffer with specified usage and memory location
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        // From here on Drop takes care of both halves
        let buffer = Self {
            buffer,
            size,
            allocation: Some(allocation),
            device,
        };

        if let Some(allocation) = &buffer.allocation {
            unsafe {
                buffer
                    .device
                    .device
                    .bind_buffer_memory(buffer.buffer, allocation.memory(), allocation.offset())
            }
            .with_context(|| format!("Failed to bind memory for '{}'", name))?;
        }

        log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);
        Ok(buffer)
    }

    /// Host-visible buffer filled with `data`
    pub fn with_data(
        device: Arc<VulkanDevice>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<Self> {
        let mut buffer = Self::new(
            device,
            name,
            data.len() as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
        )?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Device-local buffer filled through a transient staging buffer
    pub fn device_local_with_data(
        device: Arc<VulkanDevice>,
        pool: &CommandPool,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<Self> {
        let size = data.len() as vk::DeviceSize;

        let staging = Self::with_data(
            device.clone(),
            &format!("{} (staging)", name),
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;

        let buffer = Self::new(
            device,
            name,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        pool.one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer(
                cmd,
                staging.buffer,
                buffer.buffer,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            );
        })
        .with_context(|| format!("Failed to upload '{}'", name))?;

        Ok(buffer)
    }

    /// Copy the buffer's contents back to the host
    pub fn read_back(&self, pool: &CommandPool) -> Result<Vec<u8>> {
        let readback = Self::new(
            self.device.clone(),
            "readback",
            self.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        pool.one_shot(|device, cmd| unsafe {
            device.cmd_copy_buffer(
                cmd,
                self.buffer,
                readback.buffer,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: self.size,
                }],
            );
            // The copy has to be made visible to the host, not just finished
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[host_read_barrier(readback.buffer, self.size)],
                &[],
            );
        })
        .context("Failed to copy buffer for readback")?;

        let bytes = readback
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .context("Readback buffer is not host visible")?;

        Ok(bytes[..self.size as usize].to_vec())
    }

    /// Read the buffer back and compare it with what was uploaded
    pub fn verify(&self, pool: &CommandPool, name: &str, expected: &[u8]) -> Result<()> {
        let actual = self.read_back(pool)?;
        if actual != expected {
            return Err(BootstrapError::UploadMismatch {
                name: name.to_string(),
                expected: expected.len(),
                actual: actual.len(),
            }
            .into());
        }
        log::debug!("Verified {} bytes of '{}'", expected.len(), name);
        Ok(())
    }

    /// Copy bytes into a host-visible buffer
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer is not host visible")?;

        anyhow::ensure!(
            data.len() <= mapped.len(),
            "{} bytes do not fit in a {} byte buffer",
            data.len(),
            mapped.len()
        );

        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.buffer);
        unsafe { self.device.device.get_buffer_device_address(&info) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// Transfer writes into `buffer` become readable through its mapping
fn host_read_barrier(buffer: vk::Buffer, size: vk::DeviceSize) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(size)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support;

    #[test]
    fn geometry_usage_covers_build_input_and_upload() {
        assert!(GEOMETRY_USAGE.contains(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        ));
        assert!(GEOMETRY_USAGE.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(GEOMETRY_USAGE.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(!GEOMETRY_USAGE.contains(vk::BufferUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn readback_barrier_hands_transfer_writes_to_the_host() {
        let barrier = host_read_barrier(vk::Buffer::null(), 251);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::HOST_READ);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!((barrier.offset, barrier.size), (0, 251));
    }

    #[test]
    #[ignore = "requires a ray tracing capable Vulkan device"]
    fn upload_round_trips_odd_sized_data() {
        let Some(gpu) = test_support::headless() else {
            return;
        };

        let data = (0..=250u8).collect::<Vec<_>>();
        let buffer = Buffer::device_local_with_data(
            gpu.device.clone(),
            &gpu.pool,
            "odd sized",
            vk::BufferUsageFlags::TRANSFER_SRC,
            &data,
        )
        .unwrap();

        assert_eq!(buffer.read_back(&gpu.pool).unwrap(), data);
        buffer.verify(&gpu.pool, "odd sized", &data).unwrap();

        let err = buffer.verify(&gpu.pool, "odd sized", &[0u8; 3]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::UploadMismatch { .. })
        ));
    }

    #[test]
    #[ignore = "requires a ray tracing capable Vulkan device"]
    fn oversized_write_is_rejected() {
        let Some(gpu) = test_support::headless() else {
            return;
        };

        let mut buffer = Buffer::new(
            gpu.device.clone(),
            "small",
            4,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )
        .unwrap();

        // Allocations may round up, so go well past it
        assert!(buffer.write(&[0u8; 1 << 20]).is_err());
        buffer.write(&[1, 2, 3, 4]).unwrap();
    }
}
