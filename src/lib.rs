//! hwvdec - port-based video decoder component engine
//!
//! The crate implements the component side of an offloaded video decoder:
//! two ports exchanging buffers with a host, a single-threaded command
//! queue that owns every buffer and state transition, a ledger that tracks
//! who holds each buffer, and the renegotiation sequence run when the
//! stream changes format. The decode itself happens behind the
//! [`offload::OffloadEngine`] trait; [`simulated`] provides a software
//! engine for demos and tests.

pub mod buffer;
pub mod component;
pub mod offload;
pub mod port;
pub mod resource;
pub mod simulated;
pub mod utils;

pub use buffer::{BufferFlags, BufferHandle, BufferHeader, BufferOwner, ComponentId, Mark, PortIndex, PortSelector};
pub use component::{
    Command, CommandData, CommandKind, ComponentCallbacks, ComponentEvent, ComponentState, CropRect, DecoderInstance,
    DecoderInstanceBuilder, EngineStats, FreeError, LedgerSnapshot, Rejected, SettingIndex, SettingValue, TunnelPeer,
    TunnelReturn,
};
pub use port::{ColorFormat, CompressionKind, FrameGeometry, PortDefinition, PortFormat};
pub use utils::config::Config;
pub use utils::error::{DecoderError, ErrorKind, ErrorSeverity, Result};
