//! Runtime settings
//!
//! Settings the host may read or change in any state but Invalid, unlike
//! port definitions which are fixed while a port is enabled.

use crate::port::{CompressionKind, FrameGeometry};
use crate::utils::error::{DecoderError, Result};
use serde::Serialize;

/// Which setting to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingIndex {
    /// Corrupt frames raise an error event
    ErrorReporting,

    /// Region of the output frame holding picture data
    OutputCrop,
}

/// A setting and its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SettingValue {
    ErrorReporting(bool),
    OutputCrop(CropRect),
}

impl SettingValue {
    pub fn index(&self) -> SettingIndex {
        match self {
            SettingValue::ErrorReporting(_) => SettingIndex::ErrorReporting,
            SettingValue::OutputCrop(_) => SettingIndex::OutputCrop,
        }
    }
}

/// Crop rectangle in output pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// The whole frame
    pub fn full(geometry: FrameGeometry) -> Self {
        Self {
            left: 0,
            top: 0,
            width: geometry.width,
            height: geometry.height,
        }
    }
}

/// Per-frame error reporting exists for codecs with macroblock error maps
pub(super) fn check_error_reporting(codec: CompressionKind) -> Result<()> {
    match codec {
        CompressionKind::H263 | CompressionKind::H264 | CompressionKind::Mpeg4 => Ok(()),
        other => Err(DecoderError::UnsupportedSetting(format!("{} has no error reporting", other))),
    }
}
