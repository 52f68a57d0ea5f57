//! HAL device configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigFormat};
use crate::device::DeviceCapabilities;

/// Native backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendKind {
    /// CPU-side immediate-mode backend that records native calls
    #[default]
    Headless,
    /// Explicit Vulkan backend
    Vulkan,
}

/// # HAL Configuration
///
/// Settings for device creation, disposal timing and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    /// Application name reported to the native API
    pub application_name: String,
    /// Backend to create
    pub backend: BackendKind,
    /// Enable the native debug layer and forward its messages to the log
    pub enable_debug_layer: bool,
    /// Frames a released resource waits before its native objects are freed
    pub release_delay_frames: u32,
    /// Maximum number of recycled command lists kept per queue
    pub command_list_pool_size: usize,
    /// Capability limits that replace the backend-reported ones
    pub capabilities_override: Option<DeviceCapabilities>,
}

impl HalConfig {
    /// Create a configuration for the named application
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    /// Select the backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Enable or disable the native debug layer
    pub fn with_debug_layer(mut self, enabled: bool) -> Self {
        self.enable_debug_layer = enabled;
        self
    }

    /// Set the deferred-release delay in frames
    pub fn with_release_delay(mut self, frames: u32) -> Self {
        self.release_delay_frames = frames;
        self
    }

    /// Override the capability limits reported by the backend
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities_override = Some(capabilities);
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }
        if self.release_delay_frames > 16 {
            return Err(format!(
                "Release delay of {} frames is unreasonably long (max 16)",
                self.release_delay_frames
            ));
        }
        if self.command_list_pool_size == 0 {
            return Err("Command list pool size must be at least 1".to_string());
        }
        if let Some(caps) = &self.capabilities_override {
            caps.validate()?;
        }
        Ok(())
    }

    /// Parse configuration text and validate it
    ///
    /// Fields missing from the text keep their default values.
    pub fn parse(text: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Self = format.parse(text)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Read and validate a `.toml` or `.ron` configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let config = Self::parse(&std::fs::read_to_string(path)?, format)?;
        log::info!("Loaded {:?} configuration from {}", config.backend, path.display());
        Ok(config)
    }

    /// Write the configuration in the format named by the extension of `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = ConfigFormat::from_path(path)?.render(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            application_name: "graphics_hal".to_string(),
            backend: BackendKind::Headless,
            enable_debug_layer: cfg!(debug_assertions),
            release_delay_frames: 2,
            command_list_pool_size: 8,
            capabilities_override: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(HalConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = HalConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_overrides() {
        let config = HalConfig::new("demo")
            .with_backend(BackendKind::Vulkan)
            .with_release_delay(0)
            .with_capabilities(DeviceCapabilities::default().with_max_compute_groups([64, 64, 1]));

        let text = ConfigFormat::Toml.render(&config).unwrap();
        let parsed = HalConfig::parse(&text, ConfigFormat::Toml).unwrap();

        assert_eq!(parsed.backend, BackendKind::Vulkan);
        assert_eq!(parsed.release_delay_frames, 0);
        let caps = parsed.capabilities_override.unwrap();
        assert_eq!(caps.max_compute_groups, [64, 64, 1]);
    }

    #[test]
    fn test_ron_partial_config_uses_defaults() {
        let parsed = HalConfig::parse("(application_name: \"ron_app\")", ConfigFormat::Ron).unwrap();
        assert_eq!(parsed.application_name, "ron_app");
        assert_eq!(parsed.command_list_pool_size, 8);
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        let result = HalConfig::parse("release_delay_frames = 40", ConfigFormat::Toml);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_then_load_file() {
        let path = std::env::temp_dir().join(format!("graphics_hal_{}.ron", std::process::id()));
        HalConfig::new("saved").with_release_delay(3).save(&path).unwrap();

        let loaded = HalConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.application_name, "saved");
        assert_eq!(loaded.release_delay_frames, 3);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let result = HalConfig::load("hal.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
