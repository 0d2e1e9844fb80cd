// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section and key is optional; anything missing takes its default.
// A missing or broken file means the whole config falls back to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::{RendererSettings, VkStage};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub vulkan: VulkanConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Compiled SPIR-V locations, relative to the working directory
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/triangle.vert.spv"),
            fragment: PathBuf::from("shaders/triangle.frag.spv"),
        }
    }
}

/// How far the bring-up goes
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct VulkanConfig {
    pub final_stage: VkStage,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            final_stage: VkStage::SyncObjects,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_file: None,
            show_fps: true,
        }
    }
}

/// Where the configuration came from. Loading happens before the logger
/// exists, so this is reported once logging is up.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at this path; defaults used
    Missing(PathBuf),
    /// The file exists but could not be used; defaults used
    Invalid(anyhow::Error),
}

impl ConfigSource {
    pub fn report(&self, config: &Config) {
        match self {
            ConfigSource::File(path) => {
                log::info!("Loaded configuration from {:?}", path);
                log::debug!("Config: {:?}", config);
            }
            ConfigSource::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path);
            }
            ConfigSource::Invalid(e) => {
                log::warn!("{:#}. Using defaults.", e);
            }
        }
    }
}

impl Config {
    /// Load config.toml from the working directory, falling back to defaults
    pub fn load() -> (Self, ConfigSource) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref();
        match Self::load_from_path(path) {
            Ok(Some(config)) => (config, ConfigSource::File(path.to_path_buf())),
            Ok(None) => (Config::default(), ConfigSource::Missing(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigSource::Invalid(e)),
        }
    }

    /// Load configuration from a specific path, `None` if there is no file
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(Some(config))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Validation is a debug-build feature; release builds never load layers
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    pub fn renderer_settings(&self) -> RendererSettings {
        RendererSettings {
            app_name: self.window.title.clone(),
            enable_validation: self.validation_enabled(),
            present_mode: self.present_mode(),
            clear_color: self.graphics.clear_color,
            max_frames_in_flight: self.graphics.max_frames_in_flight,
            vertex_shader: self.shaders.vertex.clone(),
            fragment_shader: self.shaders.fragment.clone(),
            final_stage: self.vulkan.final_stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_tutorial_window() {
        let config = Config::default();
        assert_eq!(config.window.title, "Vulkan");
        assert_eq!((config.window.width, config.window.height), (800, 600));
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.vulkan.final_stage, VkStage::SyncObjects);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert!(config.debug.log_file.is_none());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/triangle.vert.spv"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 1024

            [debug]
            log_file = "vk.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1024);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.debug.log_file, Some(PathBuf::from("vk.log")));
        assert!(config.debug.show_fps);
    }

    #[test]
    fn present_mode_names_map_case_insensitively() {
        let mut config = Config::default();
        for (name, mode) in [
            ("FIFO", vk::PresentModeKHR::FIFO),
            ("fifo_relaxed", vk::PresentModeKHR::FIFO_RELAXED),
            ("Immediate", vk::PresentModeKHR::IMMEDIATE),
            ("bogus", vk::PresentModeKHR::MAILBOX),
        ] {
            config.graphics.present_mode = name.to_string();
            assert_eq!(config.present_mode(), mode, "{}", name);
        }
    }

    #[test]
    fn final_stage_parses_snake_case() {
        let config = Config::parse("[vulkan]\nfinal_stage = \"render_pass\"").unwrap();
        assert_eq!(config.vulkan.final_stage, VkStage::RenderPass);

        let settings = config.renderer_settings();
        assert_eq!(settings.final_stage, VkStage::RenderPass);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        assert!(Config::parse("[vulkan]\nfinal_stage = \"teapot\"").is_err());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        assert!(matches!(Config::load_from_path("does/not/exist.toml"), Ok(None)));

        let (config, source) = Config::load_or_default("does/not/exist.toml");
        assert_eq!(config.window.width, 800);
        assert!(matches!(source, ConfigSource::Missing(_)));
    }

    #[test]
    fn broken_file_keeps_the_error_for_reporting() {
        let path = std::env::temp_dir().join(format!(
            "hello-triangle-broken-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let (config, source) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.width, 800);
        match source {
            ConfigSource::Invalid(e) => {
                assert!(format!("{:#}", e).contains("Failed to parse config file"));
            }
            other => panic!("expected an invalid config, got {:?}", other),
        }
    }
}
