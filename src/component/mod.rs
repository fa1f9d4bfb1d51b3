//! Decoder component engine
//!
//! This module holds the host-facing contract of the component (states,
//! commands, events and callbacks) and the machinery behind it: the
//! command queue, the single-threaded engine that owns every port and the
//! buffer ledger, the lifecycle state machine and the reconfiguration
//! controller.

mod engine;
pub mod instance;
mod port_ops;
pub mod queue;
pub mod reconfig;
pub mod settings;
pub mod state;
mod transitions;
pub mod tunnel;

pub use instance::{DecoderInstance, DecoderInstanceBuilder, FreeError, Rejected};
pub use reconfig::{ReconfigurationRequest, StreamInfo, StreamInspector};
pub use settings::{CropRect, SettingIndex, SettingValue};
pub use state::{PendingTransitions, StateMonitor, TransitionPlan};
pub use tunnel::{TunnelPeer, TunnelReturn};

use crate::buffer::{BufferFlags, BufferHeader, Mark, OwnerCounts, PortIndex, PortSelector};
use crate::port::PortFormat;
use crate::utils::error::{ErrorKind, ErrorSeverity};
use serde::Serialize;
use std::fmt;

/// Lifecycle state of the component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComponentState {
    /// Configured, no buffers, no offload engine
    Loaded,

    /// Buffers populated, offload engine created but stopped
    Idle,

    /// Decoding
    Executing,

    /// Offload engine paused, buffers still accepted
    Pause,

    /// Waiting for the platform to grant resources
    WaitForResources,

    /// Unrecoverable fault; only teardown is honored
    Invalid,
}

impl ComponentState {
    /// States in which the host may exchange buffers
    pub fn accepts_buffers(&self) -> bool {
        matches!(self, ComponentState::Idle | ComponentState::Executing | ComponentState::Pause)
    }

    /// States in which buffers may be submitted to the offload engine
    pub fn allows_submission(&self) -> bool {
        matches!(self, ComponentState::Executing | ComponentState::Pause)
    }

    /// All states
    pub const ALL: [ComponentState; 6] = [
        ComponentState::Loaded,
        ComponentState::Idle,
        ComponentState::Executing,
        ComponentState::Pause,
        ComponentState::WaitForResources,
        ComponentState::Invalid,
    ];
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Host command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Move to another lifecycle state
    SetState(ComponentState),

    /// Stop exchanging buffers on a port and depopulate it
    PortDisable(PortSelector),

    /// Resume a disabled port once it is repopulated
    PortEnable(PortSelector),

    /// Return every buffer of a port to the host
    Flush(PortSelector),

    /// Attach a mark to the next buffer through a port
    MarkBuffer(PortIndex, Mark),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SetState(_) => CommandKind::SetState,
            Command::PortDisable(_) => CommandKind::PortDisable,
            Command::PortEnable(_) => CommandKind::PortEnable,
            Command::Flush(_) => CommandKind::Flush,
            Command::MarkBuffer(..) => CommandKind::MarkBuffer,
        }
    }
}

/// Command identity reported in completion events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandKind {
    SetState,
    PortDisable,
    PortEnable,
    Flush,
    MarkBuffer,
}

/// Payload of a command completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandData {
    /// State reached by a SetState
    State(ComponentState),

    /// Port a port command finished on
    Port(PortIndex),
}

/// Asynchronous notification to the host
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentEvent {
    /// A command finished
    CommandComplete {
        command: CommandKind,
        data: CommandData,
    },

    /// Something went wrong
    Error {
        kind: ErrorKind,
        severity: ErrorSeverity,
        port: Option<PortIndex>,
        message: String,
    },

    /// A port's negotiated format is stale and must be renegotiated
    PortSettingsChanged {
        port: PortIndex,
        format: PortFormat,
    },

    /// A mark targeting this component was consumed
    MarkReached { mark: Mark },

    /// A buffer carrying a notable flag left the component
    BufferFlag {
        port: PortIndex,
        flags: BufferFlags,
    },
}

/// Host callbacks
///
/// Called on the command-queue thread. Implementations must not call
/// synchronous [`DecoderInstance`] methods (allocate, free, definitions,
/// stats) from inside a callback; queue the work to another thread instead.
pub trait ComponentCallbacks: Send {
    /// Handle a component event
    ///
    /// # Arguments
    ///
    /// * `event` - Event raised by the component
    fn on_event(&mut self, event: ComponentEvent);

    /// An input buffer is back with the host
    fn empty_buffer_done(&mut self, buffer: BufferHeader);

    /// An output buffer is back with the host
    fn fill_buffer_done(&mut self, buffer: BufferHeader);
}

/// Engine statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Input buffers submitted to the offload engine
    pub input_submitted: u64,

    /// Output buffers submitted to the offload engine
    pub output_submitted: u64,

    /// Input buffers returned to the host
    pub empty_buffer_done: u64,

    /// Output buffers returned to the host
    pub fill_buffer_done: u64,

    /// Output buffers returned with the corrupt flag
    pub corrupt_frames: u64,

    /// Submissions the engine asked to retry
    pub busy_rejections: u64,

    /// Completed port flushes
    pub flushes: u64,

    /// Completed reconfiguration sequences
    pub reconfigurations: u64,

    /// Completed state transitions
    pub state_transitions: u64,

    /// Buffers delivered to tunneled peers
    pub tunnel_deliveries: u64,

    /// Ownership transfers recorded by the ledger
    pub ownership_transfers: u64,
}

/// Ledger view of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortLedger {
    /// Buffers per owner
    pub owners: OwnerCounts,

    /// Buffers that exist on the port
    pub allocated: usize,

    /// Buffers the port's pool must hold
    pub count_actual: usize,

    /// Current format epoch
    pub epoch: u64,
}

/// Ledger view of both ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub input: PortLedger,
    pub output: PortLedger,
}

impl LedgerSnapshot {
    pub fn port(&self, port: PortIndex) -> &PortLedger {
        match port {
            PortIndex::Input => &self.input,
            PortIndex::Output => &self.output,
        }
    }

    /// Owner counts add up to the allocated buffers on both ports
    pub fn is_conserved(&self) -> bool {
        self.input.owners.total() == self.input.allocated && self.output.owners.total() == self.output.allocated
    }
}
