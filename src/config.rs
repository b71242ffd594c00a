// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing or partial config.toml still runs.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use winit::keyboard::KeyCode;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
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
    pub fullscreen: bool,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "villa".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode; FIFO is used when it is unavailable
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Descriptor sets per pool. Pools never grow.
    pub descriptor_pool_capacity: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.02, 0.02, 0.05, 1.0],
            descriptor_pool_capacity: 4,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Only honoured in debug builds
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "villa_validation.log".to_string(),
            show_fps: true,
        }
    }
}

/// Control key bindings, by winit key code name ("Escape", "F11", ...)
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub quit_key: KeyCode,
    pub fullscreen_key: KeyCode,
    pub undo_key: KeyCode,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            quit_key: KeyCode::Escape,
            fullscreen_key: KeyCode::F11,
            undo_key: KeyCode::Backspace,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validation layers are a debug-build feature regardless of config
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::MAILBOX
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.descriptor_pool_capacity, 4);
        assert_eq!(config.controls.quit_key, KeyCode::Escape);
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [window]
            title = "triangles"
            width = 640

            [graphics]
            present_mode = "FIFO"

            [controls]
            quit_key = "KeyQ"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "triangles");
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
        assert_eq!(config.controls.quit_key, KeyCode::KeyQ);
        assert_eq!(config.controls.fullscreen_key, KeyCode::F11);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_mailbox() {
        let config = Config::from_toml_str("[graphics]\npresent_mode = \"turbo\"").unwrap();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml_str("[window\nwidth = ").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.window.height, 720);
    }
}
