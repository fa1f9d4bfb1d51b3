//! Utility module for hwvdec
//!
//! This module provides common utilities used throughout the crate:
//! - Error handling with custom error types
//! - Configuration management
//! - Small formatting helpers for reports

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{ComponentConfig, Config, EngineConfig, GeneralConfig, PortConfig};
pub use error::{DecoderError, ErrorKind, ErrorSeverity, Result};

/// Initialize the component configuration
///
/// Loads configuration from:
/// 1. Default values
/// 2. System configuration file
/// 3. User configuration file
/// 4. Environment variables
///
/// # Returns
///
/// Returns the loaded configuration or an error if loading fails
pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Format a duration for display
///
/// # Arguments
///
/// * `duration` - Duration to format
///
/// # Returns
///
/// Formatted string in the format "MM:SS.mmm", with hours prepended when needed
pub fn format_duration(duration: std::time::Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, seconds, millis)
    }
}

/// Frames per second over `elapsed`, 0 for an empty interval
pub fn frame_rate(frames: u64, elapsed: std::time::Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        frames as f64 / secs
    } else {
        0.0
    }
}
