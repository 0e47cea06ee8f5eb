// Physical device selection
//
// Every enumerated GPU is described once (type, extensions, ray tracing
// features, queue family, present support) and then scored by a
// DeviceSelector. Scoring is plain data in, number out, so it can be tested
// without a GPU.

use anyhow::{Context, Result};
use ash::vk;

use super::instance::raw_name;
use super::Surface;
use crate::error::{BootstrapError, RejectedDevice, Rejection};

/// What we know about one physical device
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    /// Position in vkEnumeratePhysicalDevices order
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub extensions: Vec<String>,
    pub buffer_device_address: bool,
    pub ray_tracing_pipeline: bool,
    pub acceleration_structure: bool,
    /// First family with both graphics and compute
    pub queue_family: Option<u32>,
    /// None when running without a surface
    pub present_supported: Option<bool>,
}

pub trait DeviceSelector {
    /// Higher is better. A rejection removes the device from consideration.
    fn score(&self, candidate: &DeviceCandidate) -> Result<u32, Rejection>;
}

/// Accepts devices that can build acceleration structures and run ray
/// tracing pipelines on one queue family
pub struct RayTracingSelector {
    pub required_extensions: Vec<String>,
    pub prefer_discrete: bool,
}

impl DeviceSelector for RayTracingSelector {
    fn score(&self, candidate: &DeviceCandidate) -> Result<u32, Rejection> {
        let missing = self
            .required_extensions
            .iter()
            .filter(|ext| !candidate.extensions.contains(ext))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(Rejection::MissingExtensions(missing));
        }

        if !candidate.buffer_device_address {
            return Err(Rejection::MissingFeature("bufferDeviceAddress"));
        }
        if !candidate.ray_tracing_pipeline {
            return Err(Rejection::MissingFeature("rayTracingPipeline"));
        }
        if !candidate.acceleration_structure {
            return Err(Rejection::MissingFeature("accelerationStructure"));
        }

        if candidate.queue_family.is_none() {
            return Err(Rejection::NoQueueFamily);
        }
        if candidate.present_supported == Some(false) {
            return Err(Rejection::PresentUnsupported);
        }

        if !self.prefer_discrete {
            return Ok(1);
        }

        // Prefer discrete GPUs
        Ok(match candidate.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            vk::PhysicalDeviceType::CPU => 10,
            _ => 1,
        })
    }
}

/// Pick the best candidate. With `forced_index` only that device is
/// considered, and it still has to pass the selector.
pub fn select<'a>(
    candidates: &'a [DeviceCandidate],
    selector: &dyn DeviceSelector,
    forced_index: Option<usize>,
) -> Result<&'a DeviceCandidate, BootstrapError> {
    if candidates.is_empty() {
        return Err(BootstrapError::NoDevices);
    }

    let considered: Vec<&DeviceCandidate> = match forced_index {
        Some(index) => {
            let candidate = candidates
                .iter()
                .find(|c| c.index == index)
                .ok_or(BootstrapError::DeviceIndexOutOfRange {
                    index,
                    count: candidates.len(),
                })?;
            vec![candidate]
        }
        None => candidates.iter().collect(),
    };

    let mut best: Option<(&DeviceCandidate, u32)> = None;
    let mut rejections = Vec::new();

    for candidate in considered {
        match selector.score(candidate) {
            Ok(score) => {
                log::debug!("GPU {} '{}' scored {}", candidate.index, candidate.name, score);
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((candidate, score));
                }
            }
            Err(reason) => {
                log::warn!("Skipping GPU {} '{}': {}", candidate.index, candidate.name, reason);
                rejections.push(RejectedDevice {
                    name: candidate.name.clone(),
                    reason,
                });
            }
        }
    }

    best.map(|(candidate, _)| candidate)
        .ok_or(BootstrapError::NoSuitableDevice(rejections))
}

/// Query everything the selector needs from each physical device
pub fn describe_devices(
    instance: &ash::Instance,
    surface: Option<&Surface>,
) -> Result<Vec<(vk::PhysicalDevice, DeviceCandidate)>> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .context("Failed to enumerate physical devices")?;

    devices
        .into_iter()
        .enumerate()
        .map(|(index, physical_device)| {
            let candidate = describe_device(instance, surface, physical_device, index)?;
            Ok((physical_device, candidate))
        })
        .collect()
}

fn describe_device(
    instance: &ash::Instance,
    surface: Option<&Surface>,
    physical_device: vk::PhysicalDevice,
    index: usize,
) -> Result<DeviceCandidate> {
    let props = unsafe { instance.get_physical_device_properties(physical_device) };

    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .context("Failed to enumerate device extensions")?
        .iter()
        .map(|ext| raw_name(&ext.extension_name))
        .collect::<Vec<_>>();

    let mut bda_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    {
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut bda_features)
            .push_next(&mut rt_features)
            .push_next(&mut accel_features);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    }

    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let queue_family = queue_families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32);

    let present_supported = match (surface, queue_family) {
        (Some(surface), Some(family)) => Some(surface.supports_present(physical_device, family)?),
        _ => None,
    };

    Ok(DeviceCandidate {
        index,
        name: raw_name(&props.device_name),
        device_type: props.device_type,
        extensions,
        buffer_device_address: bda_features.buffer_device_address == vk::TRUE,
        ray_tracing_pipeline: rt_features.ray_tracing_pipeline == vk::TRUE,
        acceleration_structure: accel_features.acceleration_structure == vk::TRUE,
        queue_family,
        present_supported,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt_candidate(index: usize, device_type: vk::PhysicalDeviceType) -> DeviceCandidate {
        DeviceCandidate {
            index,
            name: format!("GPU {index}"),
            device_type,
            extensions: vec![
                "VK_KHR_swapchain".to_string(),
                "VK_KHR_ray_tracing_pipeline".to_string(),
                "VK_KHR_acceleration_structure".to_string(),
            ],
            buffer_device_address: true,
            ray_tracing_pipeline: true,
            acceleration_structure: true,
            queue_family: Some(0),
            present_supported: Some(true),
        }
    }

    fn selector() -> RayTracingSelector {
        RayTracingSelector {
            required_extensions: vec![
                "VK_KHR_ray_tracing_pipeline".to_string(),
                "VK_KHR_acceleration_structure".to_string(),
            ],
            prefer_discrete: true,
        }
    }

    #[test]
    fn discrete_beats_integrated_regardless_of_order() {
        let candidates = vec![
            rt_candidate(0, vk::PhysicalDeviceType::INTEGRATED_GPU),
            rt_candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        let chosen = select(&candidates, &selector(), None).unwrap();
        assert_eq!(chosen.index, 1);
    }

    #[test]
    fn without_preference_first_suitable_wins() {
        let candidates = vec![
            rt_candidate(0, vk::PhysicalDeviceType::INTEGRATED_GPU),
            rt_candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        let selector = RayTracingSelector {
            prefer_discrete: false,
            ..selector()
        };
        assert_eq!(select(&candidates, &selector, None).unwrap().index, 0);
    }

    #[test]
    fn missing_extension_is_a_named_rejection() {
        let mut candidate = rt_candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU);
        candidate.extensions.retain(|ext| ext != "VK_KHR_acceleration_structure");

        assert_eq!(
            selector().score(&candidate),
            Err(Rejection::MissingExtensions(vec![
                "VK_KHR_acceleration_structure".to_string()
            ]))
        );
    }

    #[test]
    fn missing_features_are_rejected() {
        let mut candidate = rt_candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU);
        candidate.ray_tracing_pipeline = false;
        assert_eq!(
            selector().score(&candidate),
            Err(Rejection::MissingFeature("rayTracingPipeline"))
        );

        let mut candidate = rt_candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU);
        candidate.buffer_device_address = false;
        assert_eq!(
            selector().score(&candidate),
            Err(Rejection::MissingFeature("bufferDeviceAddress"))
        );
    }

    #[test]
    fn present_support_only_matters_with_a_surface() {
        let mut candidate = rt_candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU);
        candidate.present_supported = Some(false);
        assert_eq!(selector().score(&candidate), Err(Rejection::PresentUnsupported));

        candidate.present_supported = None;
        assert!(selector().score(&candidate).is_ok());
    }

    #[test]
    fn no_suitable_device_reports_every_rejection() {
        let mut first = rt_candidate(0, vk::PhysicalDeviceType::CPU);
        first.queue_family = None;
        let mut second = rt_candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU);
        second.acceleration_structure = false;

        match select(&[first, second], &selector(), None) {
            Err(BootstrapError::NoSuitableDevice(rejections)) => {
                assert_eq!(rejections.len(), 2);
                assert_eq!(rejections[0].reason, Rejection::NoQueueFamily);
                assert_eq!(
                    rejections[1].reason,
                    Rejection::MissingFeature("accelerationStructure")
                );
            }
            other => panic!("unexpected selection result: {other:?}"),
        }
    }

    #[test]
    fn forced_index_is_still_checked() {
        let mut weak = rt_candidate(1, vk::PhysicalDeviceType::INTEGRATED_GPU);
        weak.ray_tracing_pipeline = false;
        let candidates = vec![rt_candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU), weak];

        assert!(matches!(
            select(&candidates, &selector(), Some(1)),
            Err(BootstrapError::NoSuitableDevice(_))
        ));
        assert_eq!(select(&candidates, &selector(), Some(0)).unwrap().index, 0);
    }

    #[test]
    fn forced_index_out_of_range() {
        let candidates = vec![rt_candidate(0, vk::PhysicalDeviceType::DISCRETE_GPU)];
        assert!(matches!(
            select(&candidates, &selector(), Some(3)),
            Err(BootstrapError::DeviceIndexOutOfRange { index: 3, count: 1 })
        ));
    }

    #[test]
    fn no_devices_at_all() {
        assert!(matches!(
            select(&[], &selector(), None),
            Err(BootstrapError::NoDevices)
        ));
    }
}
