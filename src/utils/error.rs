//! Error types for hwvdec
//!
//! This module defines the error taxonomy used throughout the component.
//! Errors fall into protocol, resource, data and hardware classes; each
//! error knows its severity so the event loop can decide whether the
//! component survives it. We use thiserror for the definitions and keep
//! anyhow at the binary boundary.

use crate::buffer::{BufferHandle, BufferOwner, PortIndex};
use crate::component::ComponentState;
use serde::Serialize;
use thiserror::Error;

/// Main error type for hwvdec
#[derive(Error, Debug)]
pub enum DecoderError {
    /// Requested state equals the current state
    #[error("Component is already in state {0}")]
    SameState(ComponentState),

    /// Requested transition is not in the legal transition table
    #[error("Incorrect state transition: {from} -> {to}")]
    IncorrectStateTransition {
        from: ComponentState,
        to: ComponentState,
    },

    /// Operation is not allowed in the current state or port condition
    #[error("Incorrect state operation: {0}")]
    IncorrectStateOperation(String),

    /// A buffer was not owned by the expected party
    #[error("Ownership violation on {handle}: expected {expected:?}, found {actual:?}")]
    OwnershipViolation {
        handle: BufferHandle,
        expected: BufferOwner,
        actual: BufferOwner,
    },

    /// Buffer handle is not registered in the ledger
    #[error("Unknown buffer {0}")]
    UnknownBuffer(BufferHandle),

    /// The platform resource arbiter refused admission
    #[error("Resource denied: {0}")]
    ResourceDenied(String),

    /// A bounded pool or queue is exhausted
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Port index does not name a port valid for the operation
    #[error("Bad port index: {0}")]
    BadPortIndex(String),

    /// Parameter failed validation
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// A populated port lost a buffer outside a depopulation edge
    #[error("Port {0} unpopulated")]
    PortUnpopulated(PortIndex),

    /// The offload engine reported unusable stream data
    #[error("Stream corrupt: {0}")]
    StreamCorrupt(String),

    /// The offload engine is unreachable or failed internally
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// The component is in the Invalid state
    #[error("Component is in the Invalid state")]
    InvalidState,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),

    /// A tunnel peer's port cannot carry this port's format
    #[error("Ports not compatible: {0}")]
    PortsNotCompatible(String),

    /// A configuration index the current codec does not support
    #[error("Unsupported setting: {0}")]
    UnsupportedSetting(String),

    /// The component thread is gone or did not answer in time
    #[error("Component thread unavailable: {0}")]
    Disconnected(String),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Copyable error classification carried by host events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    SameState,
    IncorrectStateTransition,
    IncorrectStateOperation,
    OwnershipViolation,
    UnknownBuffer,
    ResourceDenied,
    InsufficientResources,
    BadPortIndex,
    BadParameter,
    PortUnpopulated,
    StreamCorrupt,
    Hardware,
    InvalidState,
    Config,
    FileIO,
    PortsNotCompatible,
    UnsupportedSetting,
    Disconnected,
    Internal,
}

/// Severity attached to every error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorSeverity {
    /// Reported, lifecycle state unchanged
    Minor,

    /// The current operation was aborted, the component returned to its prior stable state
    Major,

    /// The offload engine failed; the component has gone Invalid
    Critical,

    /// Buffer ownership can no longer be trusted
    Fatal,
}

impl DecoderError {
    /// Classification used in host events
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecoderError::SameState(_) => ErrorKind::SameState,
            DecoderError::IncorrectStateTransition { .. } => ErrorKind::IncorrectStateTransition,
            DecoderError::IncorrectStateOperation(_) => ErrorKind::IncorrectStateOperation,
            DecoderError::OwnershipViolation { .. } => ErrorKind::OwnershipViolation,
            DecoderError::UnknownBuffer(_) => ErrorKind::UnknownBuffer,
            DecoderError::ResourceDenied(_) => ErrorKind::ResourceDenied,
            DecoderError::InsufficientResources(_) => ErrorKind::InsufficientResources,
            DecoderError::BadPortIndex(_) => ErrorKind::BadPortIndex,
            DecoderError::BadParameter(_) => ErrorKind::BadParameter,
            DecoderError::PortUnpopulated(_) => ErrorKind::PortUnpopulated,
            DecoderError::StreamCorrupt(_) => ErrorKind::StreamCorrupt,
            DecoderError::Hardware(_) => ErrorKind::Hardware,
            DecoderError::InvalidState => ErrorKind::InvalidState,
            DecoderError::Config(_) => ErrorKind::Config,
            DecoderError::FileIO(_) => ErrorKind::FileIO,
            DecoderError::PortsNotCompatible(_) => ErrorKind::PortsNotCompatible,
            DecoderError::UnsupportedSetting(_) => ErrorKind::UnsupportedSetting,
            DecoderError::Disconnected(_) => ErrorKind::Disconnected,
            DecoderError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Severity of this error when raised inside the event loop
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DecoderError::SameState(_)
            | DecoderError::IncorrectStateTransition { .. }
            | DecoderError::IncorrectStateOperation(_)
            | DecoderError::BadPortIndex(_)
            | DecoderError::BadParameter(_)
            | DecoderError::PortUnpopulated(_)
            | DecoderError::StreamCorrupt(_)
            | DecoderError::Config(_)
            | DecoderError::FileIO(_)
            | DecoderError::PortsNotCompatible(_)
            | DecoderError::UnsupportedSetting(_) => ErrorSeverity::Minor,
            DecoderError::ResourceDenied(_)
            | DecoderError::InsufficientResources(_)
            | DecoderError::Disconnected(_) => ErrorSeverity::Major,
            DecoderError::Hardware(_) | DecoderError::InvalidState => ErrorSeverity::Critical,
            DecoderError::OwnershipViolation { .. }
            | DecoderError::UnknownBuffer(_)
            | DecoderError::Internal(_) => ErrorSeverity::Fatal,
        }
    }

    /// Whether this error forces the component into Invalid
    pub fn is_fatal(&self) -> bool {
        self.severity() >= ErrorSeverity::Critical
    }

    /// Create a hardware error from string
    pub fn hardware<S: Into<String>>(msg: S) -> Self {
        DecoderError::Hardware(msg.into())
    }
}

/// Convenience type alias for Results in hwvdec
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Extension trait for converting other errors to DecoderError
pub trait IntoDecoderError<T> {
    /// Convert this error into a DecoderError with the given context
    fn config_err(self, context: &str) -> Result<T>;
    fn hardware_err(self, context: &str) -> Result<T>;
    fn internal_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoDecoderError<T> for std::result::Result<T, E> {
    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| DecoderError::Config(format!("{}: {}", context, e)))
    }

    fn hardware_err(self, context: &str) -> Result<T> {
        self.map_err(|e| DecoderError::Hardware(format!("{}: {}", context, e)))
    }

    fn internal_err(self, context: &str) -> Result<T> {
        self.map_err(|e| DecoderError::Internal(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::DecoderError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::DecoderError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}
