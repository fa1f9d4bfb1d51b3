//! Negotiated port formats

use crate::buffer::PortIndex;
use crate::utils::error::{DecoderError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default frame width
pub const DEFAULT_WIDTH: u32 = 640;

/// Default frame height
pub const DEFAULT_HEIGHT: u32 = 480;

/// Default input (bitstream) buffer size in bytes
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 614_400;

/// Smallest bitstream buffer a port will accept
pub const MIN_INPUT_BUFFER_SIZE: usize = 16 * 1024;

/// Compression kind of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// Uncompressed frames (output port)
    Unused,
    H263,
    H264,
    Mpeg2,
    Mpeg4,
    Wmv,
}

impl CompressionKind {
    /// Every bitstream codec, in role enumeration order
    pub const CODECS: [CompressionKind; 5] = [
        CompressionKind::H263,
        CompressionKind::H264,
        CompressionKind::Mpeg2,
        CompressionKind::Mpeg4,
        CompressionKind::Wmv,
    ];

    /// Whether this kind names a bitstream codec
    pub fn is_codec(&self) -> bool {
        !matches!(self, CompressionKind::Unused)
    }

    /// Standard component role decoding this codec
    pub fn role(&self) -> Option<&'static str> {
        match self {
            CompressionKind::Unused => None,
            CompressionKind::H263 => Some("video_decoder.h263"),
            CompressionKind::H264 => Some("video_decoder.avc"),
            CompressionKind::Mpeg2 => Some("video_decoder.mpeg2"),
            CompressionKind::Mpeg4 => Some("video_decoder.mpeg4"),
            CompressionKind::Wmv => Some("video_decoder.wmv"),
        }
    }

    /// Codec decoded by a standard component role
    pub fn from_role(role: &str) -> Result<Self> {
        Self::CODECS
            .into_iter()
            .find(|codec| codec.role() == Some(role))
            .ok_or_else(|| DecoderError::BadParameter(format!("unknown component role '{}'", role)))
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionKind::Unused => "raw",
            CompressionKind::H263 => "h263",
            CompressionKind::H264 => "h264",
            CompressionKind::Mpeg2 => "mpeg2",
            CompressionKind::Mpeg4 => "mpeg4",
            CompressionKind::Wmv => "wmv",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for CompressionKind {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h263" => Ok(CompressionKind::H263),
            "h264" | "avc" => Ok(CompressionKind::H264),
            "mpeg2" => Ok(CompressionKind::Mpeg2),
            "mpeg4" => Ok(CompressionKind::Mpeg4),
            "wmv" | "vc1" => Ok(CompressionKind::Wmv),
            "raw" | "unused" => Ok(CompressionKind::Unused),
            other => Err(DecoderError::BadParameter(format!("unknown codec '{}'", other))),
        }
    }
}

/// Pixel layout of decoded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorFormat {
    /// Planar 4:2:0
    Yuv420Planar,

    /// Interleaved 4:2:2 (Cb Y Cr Y)
    CbYCrY,
}

impl ColorFormat {
    /// Bytes needed for one frame of `geometry`
    pub fn frame_size(&self, geometry: FrameGeometry) -> usize {
        let pixels = geometry.width as usize * geometry.height as usize;
        match self {
            ColorFormat::Yuv420Planar => pixels * 3 / 2,
            ColorFormat::CbYCrY => pixels * 2,
        }
    }
}

/// Frame dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

impl fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Format negotiated on one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFormat {
    /// Frame dimensions
    pub geometry: FrameGeometry,

    /// Decoded pixel layout
    pub color: ColorFormat,

    /// Bitstream codec, `Unused` on the output port
    pub compression: CompressionKind,
}

impl PortFormat {
    /// Default format for `port` decoding `codec`
    pub fn default_for(port: PortIndex, codec: CompressionKind) -> Self {
        Self {
            geometry: FrameGeometry::default(),
            color: ColorFormat::Yuv420Planar,
            compression: match port {
                PortIndex::Input => codec,
                PortIndex::Output => CompressionKind::Unused,
            },
        }
    }

    /// Smallest buffer size acceptable for this format on `port`
    pub fn required_buffer_size(&self, port: PortIndex) -> usize {
        match port {
            PortIndex::Input => {
                let pixels = self.geometry.width as usize * self.geometry.height as usize;
                (pixels / 2).max(MIN_INPUT_BUFFER_SIZE)
            }
            PortIndex::Output => self.color.frame_size(self.geometry),
        }
    }

    /// Check dimensions are usable
    pub fn validate(&self) -> Result<()> {
        let FrameGeometry { width, height } = self.geometry;
        if width == 0 || height == 0 {
            return Err(DecoderError::BadParameter(format!(
                "frame dimensions {} must be non-zero",
                self.geometry
            )));
        }
        if width % 2 != 0 || height % 2 != 0 {
            return Err(DecoderError::BadParameter(format!(
                "frame dimensions {} must be even",
                self.geometry
            )));
        }
        Ok(())
    }
}
