//! Dynamic reconfiguration
//!
//! When the stream switches format mid-flight the affected ports have to be
//! renegotiated with the host. The controller tracks one renegotiation at a
//! time: a drain phase the component drives on its own, then one
//! disable/notify/enable cycle per affected port, input strictly before
//! output. While a renegotiation is active nothing is submitted to the
//! offload engine.

use crate::buffer::{BufferHandle, BufferHeader, PortIndex};
use crate::port::{CompressionKind, FrameGeometry, PortFormat};
use log::{debug, info};
use std::collections::VecDeque;

/// Stream format found in a bitstream header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Coded frame dimensions
    pub geometry: FrameGeometry,

    /// Codec, when the header identifies one
    pub compression: Option<CompressionKind>,
}

/// Bitstream header inspection
///
/// Called on the command-queue thread for every input buffer before it is
/// submitted. Returns the stream format when the buffer carries a header.
pub trait StreamInspector: Send {
    fn inspect(&mut self, codec: CompressionKind, buffer: &BufferHeader) -> Option<StreamInfo>;
}

/// Ports whose format went stale
#[derive(Debug, Clone, PartialEq)]
pub struct ReconfigurationRequest {
    /// New input format, when the input port must be renegotiated
    pub input: Option<PortFormat>,

    /// New output format, when the output port must be renegotiated
    pub output: Option<PortFormat>,

    /// Input buffer whose header revealed the change
    pub trigger: Option<BufferHandle>,
}

impl ReconfigurationRequest {
    /// Compare a detected stream format against the negotiated ones
    ///
    /// The input port needs renegotiation when the codec changes or its
    /// buffers are too small for the new dimensions; the output port when
    /// the dimensions change.
    pub fn detect(
        input: PortFormat,
        input_buffer_size: usize,
        output: PortFormat,
        info: StreamInfo,
        trigger: Option<BufferHandle>,
    ) -> Option<Self> {
        let mut new_input = input;
        new_input.geometry = info.geometry;
        if let Some(compression) = info.compression {
            new_input.compression = compression;
        }
        let input_changed = new_input.compression != input.compression
            || new_input.required_buffer_size(PortIndex::Input) > input_buffer_size;

        let mut new_output = output;
        new_output.geometry = info.geometry;
        let output_changed = new_output.geometry != output.geometry;

        if !input_changed && !output_changed {
            return None;
        }
        Some(Self {
            input: input_changed.then_some(new_input),
            output: output_changed.then_some(new_output),
            trigger,
        })
    }

    /// Affected ports in notification order
    pub fn affected(&self) -> Vec<PortIndex> {
        let mut ports = Vec::with_capacity(2);
        if self.input.is_some() {
            ports.push(PortIndex::Input);
        }
        if self.output.is_some() {
            ports.push(PortIndex::Output);
        }
        ports
    }

    pub fn affects(&self, port: PortIndex) -> bool {
        match port {
            PortIndex::Input => self.input.is_some(),
            PortIndex::Output => self.output.is_some(),
        }
    }

    /// Both ports changed at once
    pub fn both(&self) -> bool {
        self.input.is_some() && self.output.is_some()
    }

    pub fn format_for(&self, port: PortIndex) -> Option<PortFormat> {
        match port {
            PortIndex::Input => self.input,
            PortIndex::Output => self.output,
        }
    }
}

/// Phase of an active renegotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigPhase {
    /// In-flight buffers are coming back from the offload engine
    Draining,

    /// The host was notified about this port and has to re-enable it
    AwaitingHost(PortIndex),
}

/// What the engine does after a port came back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigStep {
    /// Not part of the renegotiation, or not its turn
    Ignore,

    /// Disable and notify the next port
    Notify(PortIndex),

    /// Every affected port is renegotiated
    Finished,
}

#[derive(Debug)]
struct Active {
    request: ReconfigurationRequest,
    phase: ReconfigPhase,
    remaining: VecDeque<PortIndex>,
}

/// Sequencer of renegotiation cycles
#[derive(Debug, Default)]
pub struct ReconfigurationController {
    active: Option<Active>,
    completed: u64,
}

impl ReconfigurationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a renegotiation; false when one is already running
    pub fn begin(&mut self, request: ReconfigurationRequest) -> bool {
        if self.active.is_some() {
            debug!("Renegotiation already active, ignoring {:?}", request);
            return false;
        }
        info!(
            "Stream format change: input {:?}, output {:?}",
            request.input.map(|f| f.geometry),
            request.output.map(|f| f.geometry)
        );
        let remaining = request.affected().into_iter().collect();
        self.active = Some(Active {
            request,
            phase: ReconfigPhase::Draining,
            remaining,
        });
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_draining(&self) -> bool {
        matches!(self.phase(), Some(ReconfigPhase::Draining))
    }

    pub fn phase(&self) -> Option<ReconfigPhase> {
        self.active.as_ref().map(|a| a.phase)
    }

    pub fn request(&self) -> Option<&ReconfigurationRequest> {
        self.active.as_ref().map(|a| &a.request)
    }

    /// The drain finished; returns the first port to notify
    pub fn drained(&mut self) -> Option<PortIndex> {
        let active = self.active.as_mut()?;
        if active.phase != ReconfigPhase::Draining {
            return None;
        }
        let port = active.remaining.pop_front()?;
        active.phase = ReconfigPhase::AwaitingHost(port);
        Some(port)
    }

    /// The host re-enabled `port`
    pub fn port_enabled(&mut self, port: PortIndex) -> ReconfigStep {
        let Some(active) = self.active.as_mut() else {
            return ReconfigStep::Ignore;
        };
        if active.phase != ReconfigPhase::AwaitingHost(port) {
            return ReconfigStep::Ignore;
        }
        match active.remaining.pop_front() {
            Some(next) => {
                active.phase = ReconfigPhase::AwaitingHost(next);
                ReconfigStep::Notify(next)
            }
            None => {
                self.active = None;
                self.completed += 1;
                ReconfigStep::Finished
            }
        }
    }

    /// Abandon the renegotiation (fault or teardown)
    pub fn cancel(&mut self) -> Option<ReconfigurationRequest> {
        self.active.take().map(|a| a.request)
    }

    /// Renegotiations finished so far
    pub fn completed(&self) -> u64 {
        self.completed
    }
}
