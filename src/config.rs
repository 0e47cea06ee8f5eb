// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Every section falls back to defaults, so a missing file or a partial file
// still yields a usable Config.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub device: DeviceConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
    pub capture_cursor: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Raytracing Demo".to_string(),
            width: 800,
            height: 600,
            resizable: false,
            capture_cursor: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Empty means "first mode the surface reports"
    pub present_mode: String,
}

/// Physical device selection
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Force a device by enumeration index. It still has to pass the
    /// capability checks.
    pub index: Option<usize>,
    pub prefer_discrete: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: None,
            prefer_discrete: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Only honoured in debug builds
    pub validation_layers: bool,
    pub extra_layers: Vec<String>,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    /// Read the mesh buffers back after upload and compare them
    pub verify_uploads: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            extra_layers: Vec::new(),
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "rt_bootstrap.log".to_string(),
            verify_uploads: false,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            quit_key: "Escape".to_string(),
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults if it is missing or
    /// broken. The reason for a fallback is handed back for the caller to
    /// log, since this runs before the logger exists.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        let path = path.as_ref();
        if !path.exists() {
            let reason = anyhow::anyhow!("{:?} not found", path);
            return (Config::default(), Some(reason));
        }
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path. A missing file gives the
    /// defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validation is a debug-build feature
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    /// Layers to request at instance creation
    pub fn instance_layers(&self) -> Vec<String> {
        let mut layers = Vec::new();
        if self.validation_enabled() {
            layers.push(crate::backend::instance::VALIDATION_LAYER.to_string());
        }
        for layer in &self.debug.extra_layers {
            if !layers.contains(layer) {
                layers.push(layer.clone());
            }
        }
        layers
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// Get the preferred present mode as a Vulkan enum.
    /// None means "take whatever the surface lists first".
    pub fn present_mode(&self) -> Option<ash::vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "" | "first" => None,
            "immediate" => Some(ash::vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(ash::vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(ash::vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(ash::vk::PresentModeKHR::FIFO_RELAXED),
            _ => {
                log::warn!(
                    "Unknown present mode '{}', using the surface's first mode",
                    self.graphics.present_mode
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.title, "Raytracing Demo");
        assert_eq!((config.window.width, config.window.height), (800, 600));
        assert!(!config.window.resizable);
        assert!(config.window.capture_cursor);
        assert_eq!(config.device.index, None);
        assert_eq!(config.controls.quit_key, "Escape");
        assert!(!config.debug.verify_uploads);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 1280

            [device]
            index = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.device.index, Some(1));
        assert!(config.device.prefer_discrete);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
        assert!(Config::parse("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn load_from_missing_path_gives_defaults() {
        let config = Config::load_from_path("does/not/exist/config.toml").unwrap();
        assert_eq!(config.window.title, "Raytracing Demo");
    }

    /// Scratch file under the system temp dir, removed on drop
    struct TempConfig(std::path::PathBuf);

    impl TempConfig {
        fn new(name: &str, content: &str) -> Self {
            let path = std::env::temp_dir()
                .join(format!("rt-bootstrap-{}-{}.toml", name, std::process::id()));
            std::fs::write(&path, content).unwrap();
            Self(path)
        }
    }

    impl Drop for TempConfig {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn malformed_file_gives_defaults_and_the_reason() {
        let file = TempConfig::new("malformed", "[window\nwidth = ");
        let (config, reason) = Config::load_or_default(&file.0);

        assert_eq!(config.window.title, "Raytracing Demo");
        assert_eq!(config.window.width, 800);
        let reason = reason.expect("a broken file must be reported");
        assert!(format!("{:#}", reason).contains("Failed to parse config file"));
    }

    #[test]
    fn missing_file_gives_defaults_and_the_reason() {
        let (config, reason) = Config::load_or_default("does/not/exist/config.toml");
        assert_eq!(config.controls.quit_key, "Escape");
        assert!(reason.unwrap().to_string().contains("not found"));
    }

    #[test]
    fn valid_file_loads_without_complaint() {
        let file = TempConfig::new("valid", "[window]\nresizable = true\n");
        let (config, reason) = Config::load_or_default(&file.0);
        assert!(reason.is_none());
        assert!(config.window.resizable);
    }

    #[test]
    fn present_mode_names() {
        let mut config = Config::default();
        assert_eq!(config.present_mode(), None);

        config.graphics.present_mode = "Mailbox".to_string();
        assert_eq!(config.present_mode(), Some(vk::PresentModeKHR::MAILBOX));

        config.graphics.present_mode = "fifo_relaxed".to_string();
        assert_eq!(config.present_mode(), Some(vk::PresentModeKHR::FIFO_RELAXED));

        config.graphics.present_mode = "vsync-please".to_string();
        assert_eq!(config.present_mode(), None);
    }

    #[test]
    fn extra_layers_are_deduplicated() {
        let config = Config::parse(
            r#"
            [debug]
            validation_layers = false
            extra_layers = ["VK_LAYER_LUNARG_monitor", "VK_LAYER_LUNARG_monitor"]
            "#,
        )
        .unwrap();
        assert_eq!(config.instance_layers(), vec!["VK_LAYER_LUNARG_monitor".to_string()]);
    }

    #[test]
    fn log_level_falls_back_to_info() {
        let mut config = Config::default();
        config.debug.log_level = "debug".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);

        config.debug.log_level = "chatty".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }
}
