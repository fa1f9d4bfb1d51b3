//! Offload engine boundary
//!
//! The offload engine is the coprocessor that performs the actual decode.
//! It is driven through a narrow contract: buffer submissions that are
//! accepted or rejected synchronously, completions delivered later from any
//! thread, and a control side-channel whose requests are acknowledged
//! asynchronously. Completions and acknowledgements only ever travel back
//! as messages through a [`CompletionSink`].

pub mod params;

pub use params::{CodecParams, OffloadParamBuilder, ParamArena, ParamBlock, ParamRole};

use crate::buffer::{BufferHeader, PortIndex};
use crate::port::FrameGeometry;
use crossbeam_channel::Sender;
use std::fmt;
use thiserror::Error;

/// A buffer handed to the offload engine
#[derive(Debug)]
pub struct Submission {
    /// The buffer itself
    pub buffer: BufferHeader,

    /// Format epoch of the port when submitted
    pub epoch: u64,

    /// Per-port submission sequence number
    pub sequence: u64,

    /// Codec side parameters for this buffer
    pub params: ParamBlock,
}

/// Why a submission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Engine queue is full; retry later
    Busy,

    /// Engine is gone
    Unreachable,
}

/// Synchronous answer to a submission
#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted,
    Rejected {
        submission: Submission,
        reason: RejectReason,
    },
}

/// Result status bits reported with a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultStatus(u32);

impl ResultStatus {
    pub const OK: ResultStatus = ResultStatus(0);
    pub const CORRUPT: ResultStatus = ResultStatus(0x0001);
    pub const INSUFFICIENT_DATA: ResultStatus = ResultStatus(0x0002);
    pub const UNSUPPORTED: ResultStatus = ResultStatus(0x0004);
    pub const END_OF_STREAM: ResultStatus = ResultStatus(0x0008);
    pub const SYNC_FRAME: ResultStatus = ResultStatus(0x0010);
    pub const FLUSHED: ResultStatus = ResultStatus(0x0020);
    pub const FATAL: ResultStatus = ResultStatus(0x8000_0000);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ResultStatus) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn with(self, other: ResultStatus) -> Self {
        Self(self.0 | other.0)
    }

    /// Any bit describing unusable stream data
    pub fn is_data_error(&self) -> bool {
        self.0 & (Self::CORRUPT.0 | Self::INSUFFICIENT_DATA.0 | Self::UNSUPPORTED.0) != 0
    }
}

/// What the engine learnt while decoding a buffer
#[derive(Debug, Clone, Default)]
pub struct DecodedMetadata {
    /// Stream geometry, when the engine detected one
    pub geometry: Option<FrameGeometry>,

    /// Submission sequence of the input a frame was decoded from
    pub source_sequence: Option<u64>,

    /// Parameter block written back by the engine
    pub params: Option<ParamBlock>,
}

/// A buffer returned by the offload engine
#[derive(Debug)]
pub struct Completion {
    pub buffer: BufferHeader,
    pub status: ResultStatus,
    pub decoded: DecodedMetadata,
}

impl Completion {
    pub fn new(buffer: BufferHeader, status: ResultStatus) -> Self {
        Self {
            buffer,
            status,
            decoded: DecodedMetadata::default(),
        }
    }
}

/// Parameters of an engine create request
#[derive(Debug, Clone)]
pub struct CreateParams {
    /// Codec create-phase block
    pub block: ParamBlock,

    /// Input pool size
    pub input_buffers: usize,

    /// Output pool size
    pub output_buffers: usize,
}

/// Control side-channel request
#[derive(Debug, Clone)]
pub enum ControlRequest {
    Create(CreateParams),
    Start,
    Pause,
    Resume,
    Stop,
    Flush(PortIndex),
    Destroy,
}

impl ControlRequest {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlRequest::Create(_) => ControlKind::Create,
            ControlRequest::Start => ControlKind::Start,
            ControlRequest::Pause => ControlKind::Pause,
            ControlRequest::Resume => ControlKind::Resume,
            ControlRequest::Stop => ControlKind::Stop,
            ControlRequest::Flush(port) => ControlKind::Flush(*port),
            ControlRequest::Destroy => ControlKind::Destroy,
        }
    }
}

/// Control request identity, used to match acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Create,
    Start,
    Pause,
    Resume,
    Stop,
    Flush(PortIndex),
    Destroy,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlKind::Flush(port) => write!(f, "Flush({})", port),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Failure reported by the offload engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OffloadFault {
    #[error("offload engine unreachable: {0}")]
    Unreachable(String),

    #[error("offload engine internal error: {0}")]
    Internal(String),
}

/// Asynchronous answer to a control request
#[derive(Debug, Clone)]
pub struct ControlAck {
    pub kind: ControlKind,
    pub result: std::result::Result<(), OffloadFault>,
}

/// Route from engine threads back into the command queue
///
/// Sending never blocks and never touches component state.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    input: Sender<Completion>,
    output: Sender<Completion>,
    control: Sender<ControlAck>,
}

impl CompletionSink {
    pub(crate) fn new(input: Sender<Completion>, output: Sender<Completion>, control: Sender<ControlAck>) -> Self {
        Self { input, output, control }
    }

    /// Hand a finished buffer back; false when the component is gone
    pub fn complete(&self, completion: Completion) -> bool {
        let sender = match completion.buffer.port() {
            PortIndex::Input => &self.input,
            PortIndex::Output => &self.output,
        };
        sender.send(completion).is_ok()
    }

    /// Acknowledge a control request; false when the component is gone
    pub fn acknowledge(&self, kind: ControlKind, result: std::result::Result<(), OffloadFault>) -> bool {
        self.control.send(ControlAck { kind, result }).is_ok()
    }
}

/// The coprocessor as seen by the component
///
/// Implementations must return from every call promptly; results arrive
/// through the sink given to [`OffloadEngine::attach`].
pub trait OffloadEngine: Send {
    /// Receive the sink completions and acknowledgements go to
    fn attach(&mut self, sink: CompletionSink);

    /// Take ownership of a buffer for decoding
    fn submit(&mut self, submission: Submission) -> SubmitOutcome;

    /// Issue a control request; the acknowledgement follows through the sink
    fn control(&mut self, request: ControlRequest) -> std::result::Result<(), OffloadFault>;
}
