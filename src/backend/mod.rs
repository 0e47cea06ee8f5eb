// Backend module - Vulkan abstraction layer
//
// Design: thin RAII wrappers around ash. Every wrapper destroys its own
// handle on drop and holds an Arc to its parent, so teardown always runs in
// reverse creation order, including after a failed bootstrap.

pub mod acceleration;
pub mod buffer;
pub mod commands;
pub mod device;
pub mod image;
pub mod instance;
pub mod selection;
pub mod surface;
pub mod swapchain;

pub use acceleration::AccelerationStructure;
pub use buffer::Buffer;
pub use commands::CommandPool;
pub use device::{DeviceSettings, VulkanDevice};
pub use image::StorageImage;
pub use instance::{InstanceSettings, VulkanInstance};
pub use surface::Surface;
pub use swapchain::Swapchain;
