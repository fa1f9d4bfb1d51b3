//! Configuration management for hwvdec
//!
//! This module handles loading and managing component configuration
//! from config files and environment variables.

use crate::offload::params::{H264Bitstream, WmvStream};
use crate::port::{ColorFormat, CompressionKind};
use crate::utils::error::{DecoderError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main component configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Component identity and stream format
    pub component: ComponentConfig,

    /// Input (bitstream) port pool
    pub input_port: PortConfig,

    /// Output (frame) port pool
    pub output_port: PortConfig,

    /// Event loop and offload timing
    pub engine: EngineConfig,

    /// General settings
    pub general: GeneralConfig,
}

/// Component identity and initial stream format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    /// Component id used to match marks
    pub id: u32,

    /// Component name
    pub name: String,

    /// Bitstream codec of the input port
    pub codec: CompressionKind,

    /// Initial frame width
    pub width: u32,

    /// Initial frame height
    pub height: u32,

    /// Decoded pixel layout
    pub color_format: ColorFormat,

    /// H.264 bitstream packaging
    pub h264_bitstream: H264Bitstream,

    /// WMV stream packaging
    pub wmv_stream: WmvStream,
}

/// Buffer pool policy of one port
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Number of buffers the host must populate
    pub buffer_count_actual: usize,

    /// Smallest acceptable pool
    pub buffer_count_min: usize,

    /// Buffer size in bytes (0 = derive from format)
    pub buffer_size: usize,
}

/// Event loop and offload timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time an offload acknowledgement or flush may take (0 disables the watchdog)
    pub watchdog_timeout_ms: u64,

    /// Time a synchronous host request waits for the event loop
    pub request_timeout_ms: u64,

    /// Time teardown waits for pending transitions
    pub teardown_timeout_ms: u64,

    /// Largest pool allowed on a port
    pub max_buffers_per_port: usize,

    /// Metadata ring capacity as a multiple of the largest pool
    pub metadata_ring_multiplier: usize,

    /// Check ledger conservation after every dispatched event
    pub verify_invariants: bool,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            component: ComponentConfig::default(),
            input_port: PortConfig::input(),
            output_port: PortConfig::output(),
            engine: EngineConfig::default(),
            general: GeneralConfig::default(),
        }
    }
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: "hwvdec.video.decoder".to_string(),
            codec: CompressionKind::H264,
            width: crate::port::format::DEFAULT_WIDTH,
            height: crate::port::format::DEFAULT_HEIGHT,
            color_format: ColorFormat::Yuv420Planar,
            h264_bitstream: H264Bitstream::ByteStream,
            wmv_stream: WmvStream::Elementary,
        }
    }
}

impl PortConfig {
    /// Default input pool
    pub fn input() -> Self {
        Self {
            buffer_count_actual: 4,
            buffer_count_min: 1,
            buffer_size: crate::port::format::DEFAULT_INPUT_BUFFER_SIZE,
        }
    }

    /// Default output pool
    pub fn output() -> Self {
        Self {
            buffer_count_actual: 4,
            buffer_count_min: 1,
            buffer_size: 0,
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::input()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 5000,
            request_timeout_ms: 2000,
            teardown_timeout_ms: 2000,
            max_buffers_per_port: 16,
            metadata_ring_multiplier: 4,
            verify_invariants: cfg!(debug_assertions),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. System config file (/etc/hwvdec/config.toml on Linux)
    /// 3. User config file (~/.config/hwvdec/config.toml on Linux)
    /// 4. Environment variables (HWVDEC_* prefix)
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        if let Some(system_path) = Self::system_config_path() {
            if system_path.exists() {
                config.merge_from_file(&system_path)?;
            }
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                config.merge_from_file(&user_path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a single TOML file, then validate it
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::new();
        config.merge_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DecoderError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let toml = toml::to_string_pretty(self)
            .map_err(|e| DecoderError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml)
            .map_err(|e| DecoderError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Merge configuration from a TOML file
    ///
    /// Sections and fields missing from the file keep their defaults.
    fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DecoderError::Config(format!("Failed to read config file: {}", e)))?;

        let file_config: Config = toml::from_str(&contents)
            .map_err(|e| DecoderError::Config(format!("Failed to parse config file: {}", e)))?;

        *self = file_config;

        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(width) = lookup("HWVDEC_WIDTH") {
            self.component.width = width
                .parse()
                .map_err(|_| DecoderError::Config("Invalid HWVDEC_WIDTH".to_string()))?;
        }

        if let Some(height) = lookup("HWVDEC_HEIGHT") {
            self.component.height = height
                .parse()
                .map_err(|_| DecoderError::Config("Invalid HWVDEC_HEIGHT".to_string()))?;
        }

        if let Some(codec) = lookup("HWVDEC_CODEC") {
            self.component.codec = codec
                .parse()
                .map_err(|_| DecoderError::Config("Invalid HWVDEC_CODEC".to_string()))?;
        }

        if let Some(watchdog) = lookup("HWVDEC_WATCHDOG_MS") {
            self.engine.watchdog_timeout_ms = watchdog
                .parse()
                .map_err(|_| DecoderError::Config("Invalid HWVDEC_WATCHDOG_MS".to_string()))?;
        }

        if let Some(log_level) = lookup("HWVDEC_LOG_LEVEL") {
            self.general.log_level = log_level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let c = &self.component;
        if c.width == 0 || c.height == 0 {
            return Err(DecoderError::Config("Frame dimensions must be non-zero".to_string()));
        }
        if c.width % 2 != 0 || c.height % 2 != 0 {
            return Err(DecoderError::Config("Frame dimensions must be even".to_string()));
        }
        if !c.codec.is_codec() {
            return Err(DecoderError::Config("Input codec must be a bitstream format".to_string()));
        }

        let max = self.engine.max_buffers_per_port;
        for (name, port) in [("input_port", &self.input_port), ("output_port", &self.output_port)] {
            if port.buffer_count_min == 0
                || port.buffer_count_min > port.buffer_count_actual
                || port.buffer_count_actual > max
            {
                return Err(DecoderError::Config(format!(
                    "{}: buffer counts must satisfy 1 <= min ({}) <= actual ({}) <= {}",
                    name, port.buffer_count_min, port.buffer_count_actual, max
                )));
            }
        }

        if self.engine.metadata_ring_multiplier == 0 {
            return Err(DecoderError::Config("metadata_ring_multiplier must be non-zero".to_string()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(DecoderError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// Capacity of each port's metadata ring
    pub fn ring_capacity(&self) -> usize {
        self.engine.max_buffers_per_port * self.engine.metadata_ring_multiplier
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return Some(PathBuf::from("/etc/hwvdec/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("hwvdec").join("config.toml"))
    }
}
