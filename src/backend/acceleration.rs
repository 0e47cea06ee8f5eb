// Acceleration structures (BLAS / TLAS)
//
// One bottom-level structure over the triangle mesh, one top-level
// structure holding a single instance of it. Each build is its own
// synchronous submission; scratch and instance buffers are dropped as soon
// as the build has finished.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::{Buffer, CommandPool, VulkanDevice};
use crate::scene::{self, MeshBuffers, Vertex};

pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    // Backing storage, must outlive the handle
    buffer: Buffer,
    device: Arc<VulkanDevice>,
}

/// vk::AccelerationStructureInstanceKHR as raw bytes for the instance buffer
#[repr(transparent)]
#[derive(Clone, Copy)]
struct InstanceRecord(vk::AccelerationStructureInstanceKHR);
unsafe impl bytemuck::Zeroable for InstanceRecord {}
unsafe impl bytemuck::Pod for InstanceRecord {}

impl AccelerationStructure {
    /// Bottom-level structure over the uploaded triangle mesh
    pub fn build_blas(device: Arc<VulkanDevice>, pool: &CommandPool, mesh: &MeshBuffers) -> Result<Self> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.vertices.device_address(),
            })
            .vertex_stride(std::mem::size_of::<Vertex>() as vk::DeviceSize)
            .max_vertex(mesh.vertex_count - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.indices.device_address(),
            })
            .transform_data(vk::DeviceOrHostAddressConstKHR {
                device_address: mesh.transform.device_address(),
            })
            .build();

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .build();

        Self::build(
            device,
            pool,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            geometry,
            mesh.triangle_count(),
            "blas",
        )
    }

    /// Top-level structure with one instance of `blas`
    pub fn build_tlas(
        device: Arc<VulkanDevice>,
        pool: &CommandPool,
        blas: &AccelerationStructure,
        transform: &Mat4,
    ) -> Result<Self> {
        let record = InstanceRecord(instance_for(blas.address, transform));

        let instances = Buffer::with_data(
            device.clone(),
            "tlas instances",
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            bytemuck::bytes_of(&record),
        )?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instances.device_address(),
            })
            .build();

        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();

        Self::build(
            device,
            pool,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            geometry,
            1,
            "tlas",
        )
    }

    fn build(
        device: Arc<VulkanDevice>,
        pool: &CommandPool,
        ty: vk::AccelerationStructureTypeKHR,
        geometry: vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
        name: &str,
    ) -> Result<Self> {
        let loader = &device.acceleration_structure;
        let geometries = [geometry];

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries)
            .build();

        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
            )
        };
        log::debug!(
            "{}: {} bytes, {} bytes scratch",
            name,
            sizes.acceleration_structure_size,
            sizes.build_scratch_size
        );

        let buffer = Buffer::new(
            device.clone(),
            name,
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.buffer)
            .size(sizes.acceleration_structure_size)
            .ty(ty);

        let handle = unsafe { loader.create_acceleration_structure(&create_info, None) }
            .with_context(|| format!("Failed to create {}", name))?;

        let mut accel = Self {
            handle,
            address: 0,
            buffer,
            device: device.clone(),
        };

        let alignment = vk::DeviceSize::from(
            device
                .acceleration_structure_properties
                .min_acceleration_structure_scratch_offset_alignment,
        );
        // Padded by a full alignment so the address can be rounded up
        // wherever the allocator placed it
        let scratch = Buffer::new(
            device.clone(),
            &format!("{} scratch", name),
            sizes.build_scratch_size + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
        )?;

        build_info.dst_acceleration_structure = handle;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: align_up(scratch.device_address(), alignment),
        };

        let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(primitive_count)
            .build();

        pool.one_shot(|_, cmd| unsafe {
            loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        })
        .with_context(|| format!("Failed to build {}", name))?;

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
        accel.address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        log::info!("Built {} ({} primitives)", name, primitive_count);
        Ok(accel)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.device
                .acceleration_structure
                .destroy_acceleration_structure(self.handle, None);
        }
    }
}

/// Instance record pointing at a BLAS: mask 0xFF, hit group 0, no culling
fn instance_for(blas_address: vk::DeviceAddress, transform: &Mat4) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: scene::transform_matrix(transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xff),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

/// Round `address` up to a power-of-two `alignment`. Zero means unaligned.
pub fn align_up(address: vk::DeviceAddress, alignment: vk::DeviceSize) -> vk::DeviceAddress {
    if alignment == 0 {
        return address;
    }
    (address + alignment - 1) & !(alignment - 1)
}
