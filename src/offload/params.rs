//! Per-codec offload parameter blocks
//!
//! Every codec supplies three fixed-layout parameter blocks to the offload
//! engine: one at creation, one per input submission and one per output
//! submission. Blocks are little-endian, start with a version/size header
//! and are size-checked on construction. The blocks for buffers in flight
//! live in a [`ParamArena`] keyed by buffer handle.

use crate::buffer::{BufferFlags, BufferHandle};
use crate::port::{ColorFormat, CompressionKind, FrameGeometry, PortFormat};
use crate::utils::config::ComponentConfig;
use crate::utils::error::{DecoderError, Result};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::mem::size_of;

/// Size of the version/size header at the start of every block
pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Version/size header; all fields little-endian
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlockHeader {
    version: u16,
    size: u16,
}

impl BlockHeader {
    fn for_layout<T>(codec: CompressionKind) -> Self {
        Self {
            version: expected_version(codec).unwrap_or_default().to_le(),
            size: (size_of::<T>() as u16).to_le(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CreateLayout {
    header: BlockHeader,
    codec: u32,
    width: u32,
    height: u32,
    color: u32,
    input_buffer_size: u32,
    output_buffer_size: u32,
    codec_word: u32,
}

/// Input block of MPEG-2, MPEG-4 and H.263
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct InputLayout {
    header: BlockHeader,
    sequence: u64,
    flags: u32,
    codec_word: u32,
}

/// Input block of H.264 and WMV
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ExtendedInputLayout {
    base: InputLayout,
    extra: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct OutputLayout {
    header: BlockHeader,
    width: u32,
    height: u32,
    color: u32,
    reserved: u32,
}

/// H.264 bitstream packaging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum H264Bitstream {
    /// Annex B start codes
    ByteStream,

    /// Length-prefixed NAL units, 2 byte lengths
    NalLength2,

    /// Length-prefixed NAL units, 4 byte lengths
    NalLength4,
}

/// WMV stream packaging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WmvStream {
    /// Raw elementary stream
    Elementary,

    /// RCV container framing
    Rcv,
}

/// Which submission a block accompanies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
    Create,
    Input,
    Output,
}

/// H.264 parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H264Params {
    pub bitstream: H264Bitstream,
}

impl H264Params {
    pub const VERSION: u16 = 2;
    pub const INPUT_SIZE: usize = size_of::<ExtendedInputLayout>();
}

/// MPEG-4 part 2 parameters, also used for H.263 (short video header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mpeg4Params {
    pub short_video_header: bool,
}

impl Mpeg4Params {
    pub const VERSION: u16 = 1;
    pub const INPUT_SIZE: usize = size_of::<InputLayout>();
}

/// MPEG-2 parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mpeg2Params;

impl Mpeg2Params {
    pub const VERSION: u16 = 1;
    pub const INPUT_SIZE: usize = size_of::<InputLayout>();
}

/// WMV parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WmvParams {
    pub stream: WmvStream,
}

impl WmvParams {
    pub const VERSION: u16 = 1;
    pub const INPUT_SIZE: usize = size_of::<ExtendedInputLayout>();
}

/// Size of every create-phase block
pub const CREATE_SIZE: usize = size_of::<CreateLayout>();

/// Size of every output block
pub const OUTPUT_SIZE: usize = size_of::<OutputLayout>();

/// Codec-specific parameter set, chosen once when the input format is set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecParams {
    H263(Mpeg4Params),
    H264(H264Params),
    Mpeg2(Mpeg2Params),
    Mpeg4(Mpeg4Params),
    Wmv(WmvParams),
}

impl CodecParams {
    /// Select the variant for `codec`
    pub fn select(codec: CompressionKind, config: &ComponentConfig) -> Result<Self> {
        match codec {
            CompressionKind::H263 => Ok(CodecParams::H263(Mpeg4Params { short_video_header: true })),
            CompressionKind::H264 => Ok(CodecParams::H264(H264Params {
                bitstream: config.h264_bitstream,
            })),
            CompressionKind::Mpeg2 => Ok(CodecParams::Mpeg2(Mpeg2Params)),
            CompressionKind::Mpeg4 => Ok(CodecParams::Mpeg4(Mpeg4Params { short_video_header: false })),
            CompressionKind::Wmv => Ok(CodecParams::Wmv(WmvParams {
                stream: config.wmv_stream,
            })),
            CompressionKind::Unused => Err(DecoderError::BadParameter(
                "no offload parameters for uncompressed input".to_string(),
            )),
        }
    }

    pub fn compression(&self) -> CompressionKind {
        match self {
            CodecParams::H263(_) => CompressionKind::H263,
            CodecParams::H264(_) => CompressionKind::H264,
            CodecParams::Mpeg2(_) => CompressionKind::Mpeg2,
            CodecParams::Mpeg4(_) => CompressionKind::Mpeg4,
            CodecParams::Wmv(_) => CompressionKind::Wmv,
        }
    }

    fn codec_word(&self) -> u32 {
        match self {
            CodecParams::H264(p) => match p.bitstream {
                H264Bitstream::ByteStream => 0,
                H264Bitstream::NalLength2 => 2,
                H264Bitstream::NalLength4 => 4,
            },
            CodecParams::H263(p) | CodecParams::Mpeg4(p) => p.short_video_header as u32,
            CodecParams::Mpeg2(_) => 0,
            CodecParams::Wmv(p) => match p.stream {
                WmvStream::Elementary => 0,
                WmvStream::Rcv => 1,
            },
        }
    }
}

/// Expected layout version of `codec` blocks
pub fn expected_version(codec: CompressionKind) -> Option<u16> {
    match codec {
        CompressionKind::H264 => Some(H264Params::VERSION),
        CompressionKind::H263 | CompressionKind::Mpeg4 => Some(Mpeg4Params::VERSION),
        CompressionKind::Mpeg2 => Some(Mpeg2Params::VERSION),
        CompressionKind::Wmv => Some(WmvParams::VERSION),
        CompressionKind::Unused => None,
    }
}

/// Expected byte size of a `codec` block for `role`
pub fn expected_size(codec: CompressionKind, role: ParamRole) -> Option<usize> {
    match role {
        ParamRole::Create => expected_version(codec).map(|_| CREATE_SIZE),
        ParamRole::Output => expected_version(codec).map(|_| OUTPUT_SIZE),
        ParamRole::Input => match codec {
            CompressionKind::H264 => Some(H264Params::INPUT_SIZE),
            CompressionKind::H263 | CompressionKind::Mpeg4 => Some(Mpeg4Params::INPUT_SIZE),
            CompressionKind::Mpeg2 => Some(Mpeg2Params::INPUT_SIZE),
            CompressionKind::Wmv => Some(WmvParams::INPUT_SIZE),
            CompressionKind::Unused => None,
        },
    }
}

/// A versioned, size-checked parameter block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamBlock {
    codec: CompressionKind,
    role: ParamRole,
    bytes: Vec<u8>,
}

impl ParamBlock {
    /// Wrap raw bytes, checking the header against the codec layout
    pub fn new(codec: CompressionKind, role: ParamRole, bytes: Vec<u8>) -> Result<Self> {
        let size = expected_size(codec, role)
            .ok_or_else(|| DecoderError::BadParameter(format!("no parameter layout for {}", codec)))?;
        if bytes.len() != size {
            return Err(DecoderError::BadParameter(format!(
                "{} {:?} block is {} bytes, expected {}",
                codec,
                role,
                bytes.len(),
                size
            )));
        }
        let header: BlockHeader = read_layout(&bytes[..BLOCK_HEADER_SIZE])?;
        let version = u16::from_le(header.version);
        if Some(version) != expected_version(codec) {
            return Err(DecoderError::BadParameter(format!(
                "{} block version {} not supported",
                codec, version
            )));
        }
        if u16::from_le(header.size) as usize != size {
            return Err(DecoderError::BadParameter(format!("{} block size field mismatch", codec)));
        }
        Ok(Self { codec, role, bytes })
    }

    fn from_layout<T: Pod>(codec: CompressionKind, role: ParamRole, layout: &T) -> Result<Self> {
        Self::new(codec, role, bytemuck::bytes_of(layout).to_vec())
    }

    pub fn codec(&self) -> CompressionKind {
        self.codec
    }

    pub fn role(&self) -> ParamRole {
        self.role
    }

    pub fn version(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        self.field(offset).map(u16::from_le)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.field(offset).map(u32::from_le)
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        self.field(offset).map(u64::from_le)
    }

    fn field<T: Pod>(&self, offset: usize) -> Result<T> {
        self.bytes
            .get(offset..offset + size_of::<T>())
            .ok_or_else(|| DecoderError::BadParameter(format!("read past end of {:?} block at {}", self.role, offset)))
            .and_then(read_layout)
    }
}

fn read_layout<T: Pod>(bytes: &[u8]) -> Result<T> {
    bytemuck::try_pod_read_unaligned(bytes)
        .map_err(|e| DecoderError::BadParameter(format!("parameter block layout: {:?}", e)))
}

fn color_word(color: ColorFormat) -> u32 {
    match color {
        ColorFormat::Yuv420Planar => 0,
        ColorFormat::CbYCrY => 1,
    }
}

/// Builds the parameter blocks the offload engine consumes
pub trait OffloadParamBuilder {
    /// Block passed with the engine create request
    fn create_params(&self, input: &PortFormat, input_size: usize, output: &PortFormat, output_size: usize) -> Result<ParamBlock>;

    /// Block accompanying one input submission
    fn input_params(&self, sequence: u64, flags: BufferFlags) -> Result<ParamBlock>;

    /// Block accompanying one output submission
    fn output_params(&self, output: &PortFormat) -> Result<ParamBlock>;
}

impl OffloadParamBuilder for CodecParams {
    fn create_params(&self, input: &PortFormat, input_size: usize, output: &PortFormat, output_size: usize) -> Result<ParamBlock> {
        let codec = self.compression();
        let layout = CreateLayout {
            header: BlockHeader::for_layout::<CreateLayout>(codec),
            codec: (codec as u32).to_le(),
            width: input.geometry.width.to_le(),
            height: input.geometry.height.to_le(),
            color: color_word(output.color).to_le(),
            input_buffer_size: (input_size as u32).to_le(),
            output_buffer_size: (output_size as u32).to_le(),
            codec_word: self.codec_word().to_le(),
        };
        ParamBlock::from_layout(codec, ParamRole::Create, &layout)
    }

    fn input_params(&self, sequence: u64, flags: BufferFlags) -> Result<ParamBlock> {
        let codec = self.compression();
        let base = |header| InputLayout {
            header,
            sequence: sequence.to_le(),
            flags: flags.bits().to_le(),
            codec_word: self.codec_word().to_le(),
        };
        let extended = |extra: u32| ExtendedInputLayout {
            base: base(BlockHeader::for_layout::<ExtendedInputLayout>(codec)),
            extra: extra.to_le(),
        };
        match self {
            CodecParams::H264(p) => {
                let nal_length = match p.bitstream {
                    H264Bitstream::ByteStream => 0,
                    H264Bitstream::NalLength2 => 2,
                    H264Bitstream::NalLength4 => 4,
                };
                ParamBlock::from_layout(codec, ParamRole::Input, &extended(nal_length))
            }
            CodecParams::Wmv(_) => ParamBlock::from_layout(codec, ParamRole::Input, &extended(0)),
            CodecParams::H263(_) | CodecParams::Mpeg4(_) | CodecParams::Mpeg2(_) => {
                let layout = base(BlockHeader::for_layout::<InputLayout>(codec));
                ParamBlock::from_layout(codec, ParamRole::Input, &layout)
            }
        }
    }

    fn output_params(&self, output: &PortFormat) -> Result<ParamBlock> {
        let codec = self.compression();
        let layout = OutputLayout {
            header: BlockHeader::for_layout::<OutputLayout>(codec),
            width: output.geometry.width.to_le(),
            height: output.geometry.height.to_le(),
            color: color_word(output.color).to_le(),
            reserved: 0,
        };
        ParamBlock::from_layout(codec, ParamRole::Output, &layout)
    }
}

/// Fields of a create-phase block the engine needs back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateSummary {
    pub geometry: FrameGeometry,
    pub color: ColorFormat,
    pub output_buffer_size: usize,
}

impl CreateSummary {
    /// Read a create-phase block
    pub fn decode(block: &ParamBlock) -> Result<Self> {
        if block.role() != ParamRole::Create {
            return Err(DecoderError::BadParameter(format!("{:?} block is not a create block", block.role())));
        }
        let layout: CreateLayout = read_layout(block.as_bytes())?;
        let color = match u32::from_le(layout.color) {
            0 => ColorFormat::Yuv420Planar,
            _ => ColorFormat::CbYCrY,
        };
        Ok(Self {
            geometry: FrameGeometry::new(u32::from_le(layout.width), u32::from_le(layout.height)),
            color,
            output_buffer_size: u32::from_le(layout.output_buffer_size) as usize,
        })
    }
}

/// Sequence number carried by an input block
pub fn input_sequence(block: &ParamBlock) -> Result<u64> {
    if block.role() != ParamRole::Input {
        return Err(DecoderError::BadParameter(format!("{:?} block is not an input block", block.role())));
    }
    let layout: InputLayout = read_layout(&block.as_bytes()[..size_of::<InputLayout>()])?;
    Ok(u64::from_le(layout.sequence))
}

/// Parameter blocks of in-flight buffers, indexed by buffer handle
#[derive(Debug, Default)]
pub struct ParamArena {
    slots: HashMap<BufferHandle, Option<ParamBlock>>,
}

impl ParamArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the slot for a newly populated buffer
    pub fn reserve(&mut self, handle: BufferHandle) {
        self.slots.insert(handle, None);
    }

    /// Drop the slot of a destroyed buffer
    pub fn release(&mut self, handle: BufferHandle) {
        self.slots.remove(&handle);
    }

    /// Store the block for a submission
    pub fn store(&mut self, handle: BufferHandle, block: ParamBlock) -> Result<()> {
        let slot = self.slots.get_mut(&handle).ok_or(DecoderError::UnknownBuffer(handle))?;
        *slot = Some(block);
        Ok(())
    }

    /// Block currently stored for `handle`
    pub fn get(&self, handle: BufferHandle) -> Option<&ParamBlock> {
        self.slots.get(&handle).and_then(|s| s.as_ref())
    }

    /// Clear the block once the buffer is back from the engine
    pub fn clear(&mut self, handle: BufferHandle) {
        if let Some(slot) = self.slots.get_mut(&handle) {
            *slot = None;
        }
    }

    /// Number of slots holding a block
    pub fn in_use(&self) -> usize {
        self.slots.values().filter(|s| s.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
