// Typed bootstrap failures
//
// Everything fallible returns anyhow::Result. The reasons a caller may want
// to match on are surfaced as BootstrapError and wrapped with context.

use thiserror::Error;

/// Why a physical device was turned down by the selector
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing device extensions: {}", .0.join(", "))]
    MissingExtensions(Vec<String>),

    #[error("missing device feature: {0}")]
    MissingFeature(&'static str),

    #[error("no queue family supports both graphics and compute")]
    NoQueueFamily,

    #[error("queue family cannot present to the window surface")]
    PresentUnsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDevice {
    pub name: String,
    pub reason: Rejection,
}

impl std::fmt::Display for RejectedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("missing instance layers: {}", .0.join(", "))]
    MissingLayers(Vec<String>),

    #[error("missing instance extensions: {}", .0.join(", "))]
    MissingInstanceExtensions(Vec<String>),

    #[error("no Vulkan-capable GPU found")]
    NoDevices,

    #[error("no suitable GPU found: {}", join_rejections(.0))]
    NoSuitableDevice(Vec<RejectedDevice>),

    #[error("device index {index} is out of range ({count} devices available)")]
    DeviceIndexOutOfRange { index: usize, count: usize },

    #[error("queue family {0} cannot present to the window surface")]
    PresentUnsupported(u32),

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("surface reports no present modes")]
    NoPresentMode,

    #[error("no format supports storage image usage")]
    NoStorageFormat,

    #[error("{name} read back {actual} bytes that differ from the {expected} bytes uploaded")]
    UploadMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

fn join_rejections(rejections: &[RejectedDevice]) -> String {
    rejections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_layers_names_every_layer() {
        let err = BootstrapError::MissingLayers(vec![
            "VK_LAYER_A".to_string(),
            "VK_LAYER_B".to_string(),
        ]);
        assert_eq!(err.to_string(), "missing instance layers: VK_LAYER_A, VK_LAYER_B");
    }

    #[test]
    fn no_suitable_device_lists_rejections() {
        let err = BootstrapError::NoSuitableDevice(vec![
            RejectedDevice {
                name: "llvmpipe".to_string(),
                reason: Rejection::MissingFeature("rayTracingPipeline"),
            },
            RejectedDevice {
                name: "GPU 1".to_string(),
                reason: Rejection::NoQueueFamily,
            },
        ]);
        let message = err.to_string();
        assert!(message.contains("llvmpipe: missing device feature: rayTracingPipeline"));
        assert!(message.contains("GPU 1: no queue family"));
    }

    #[test]
    fn present_failure_names_the_family() {
        let err = anyhow::Error::new(BootstrapError::PresentUnsupported(2))
            .context("Failed to create device");
        assert_eq!(
            format!("{:#}", err),
            "Failed to create device: queue family 2 cannot present to the window surface"
        );
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::PresentUnsupported(2))
        ));
    }

    #[test]
    fn bootstrap_error_survives_anyhow_context() {
        let err = anyhow::Error::new(BootstrapError::NoDevices).context("Failed to pick GPU");
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::NoDevices)
        ));
    }
}
