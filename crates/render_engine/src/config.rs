//! Renderer configuration
//!
//! Applications customize the frame pipeline through [`RendererConfig`]
//! instead of hardcoding values in the rendering system itself. The struct is
//! serde-derived so it can be loaded from a TOML file alongside the rest of
//! the application configuration.

use serde::{Deserialize, Serialize};

use crate::initialization::context::{GpuError, GpuResult};

/// Preferred presentation mode, resolved against what the device supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresentPreference {
    /// Prefer a low-latency non-blocking mode (mailbox), fall back to FIFO
    #[default]
    LowLatency,
    /// Always use FIFO (vsync); universally supported
    Vsync,
}

/// Configuration for the frame pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Desired number of frames in flight; the actual slot count follows the
    /// swapchain image count the device hands back
    pub frames_in_flight: usize,
    /// Whether to enable Vulkan validation layers (None = by build profile)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_validation: Option<bool>,
    /// Presentation mode preference
    pub present_preference: PresentPreference,
    /// Background clear color [R, G, B, A] (0.0-1.0 range)
    pub clear_color: [f32; 4],
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            frames_in_flight: 3,
            enable_validation: None, // Auto-detect based on build profile
            present_preference: PresentPreference::LowLatency,
            clear_color: [0.005, 0.005, 0.005, 1.0],
        }
    }

    /// Parse a configuration from a TOML document
    pub fn from_toml(text: &str) -> GpuResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| GpuError::InitializationFailed(
            format!("Invalid renderer configuration: {}", e),
        ))?;
        Ok(config.clamped())
    }

    /// Set application version
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Set the desired number of frames in flight
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self.clamped()
    }

    /// Enable or disable Vulkan validation layers
    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = Some(enable);
        self
    }

    /// Set the presentation mode preference
    pub fn with_present_preference(mut self, preference: PresentPreference) -> Self {
        self.present_preference = preference;
        self
    }

    /// Set background clear color [R, G, B, A] (0.0-1.0 range)
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Whether validation layers should be enabled for this build
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    fn clamped(mut self) -> Self {
        self.frames_in_flight = self.frames_in_flight.clamp(1, 8);
        self
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Render Engine Application")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.present_preference, PresentPreference::LowLatency);
        assert!(config.enable_validation.is_none());
    }

    #[test]
    fn frames_in_flight_is_clamped() {
        assert_eq!(RendererConfig::default().with_frames_in_flight(0).frames_in_flight, 1);
        assert_eq!(RendererConfig::default().with_frames_in_flight(64).frames_in_flight, 8);
        assert_eq!(RendererConfig::default().with_frames_in_flight(2).frames_in_flight, 2);
    }

    #[test]
    fn toml_round_trip() {
        let config = RendererConfig::new("viewer")
            .with_version(2, 1, 0)
            .with_frames_in_flight(2)
            .with_present_preference(PresentPreference::Vsync);

        let text = toml::to_string(&config).unwrap();
        let parsed = RendererConfig::from_toml(&text).unwrap();

        assert_eq!(parsed.application_name, "viewer");
        assert_eq!(parsed.application_version, (2, 1, 0));
        assert_eq!(parsed.frames_in_flight, 2);
        assert_eq!(parsed.present_preference, PresentPreference::Vsync);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed = RendererConfig::from_toml("application_name = \"demo\"").unwrap();
        assert_eq!(parsed.application_name, "demo");
        assert_eq!(parsed.frames_in_flight, 3);
    }

    #[test]
    fn toml_clamps_frames_in_flight() {
        let parsed = RendererConfig::from_toml("frames_in_flight = 99").unwrap();
        assert_eq!(parsed.frames_in_flight, 8);
    }
}
