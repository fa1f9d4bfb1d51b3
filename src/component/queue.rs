//! Command queue
//!
//! Every input to the engine arrives here as a message: host commands and
//! synchronous requests, host buffers for both ports, and offload
//! completions and control acknowledgements. Everything the host sends
//! shares one channel and is dispatched in the order it was sent, so a
//! Flush or state change always sees the buffers submitted before it. The
//! engine thread blocks on all sources at once and takes host messages
//! first, then acknowledgements, then completions.

use super::settings::{SettingIndex, SettingValue};
use super::tunnel::TunnelLink;
use super::{Command, EngineStats, LedgerSnapshot, Rejected};
use crate::buffer::{BufferHeader, PortIndex};
use crate::offload::{Completion, CompletionSink, ControlAck};
use crate::port::PortDefinition;
use crate::utils::error::Result;
use crossbeam_channel::{unbounded, Receiver, Select, Sender, TryRecvError};
use std::time::Instant;

/// Host request carried on the command channel
#[derive(Debug)]
pub enum HostRequest {
    /// Asynchronous command
    Command(Command),

    /// Create a buffer with component-allocated storage
    AllocateBuffer {
        port: PortIndex,
        size: usize,
        app_private: u64,
        reply: Sender<Result<BufferHeader>>,
    },

    /// Create a buffer around host storage
    UseBuffer {
        port: PortIndex,
        storage: Vec<u8>,
        app_private: u64,
        reply: Sender<Result<BufferHeader>>,
    },

    /// Destroy a buffer
    FreeBuffer {
        buffer: BufferHeader,
        reply: Sender<std::result::Result<(), Rejected>>,
    },

    /// Read a port definition
    GetPortDefinition {
        port: PortIndex,
        reply: Sender<PortDefinition>,
    },

    /// Replace a port definition
    SetPortDefinition {
        definition: PortDefinition,
        reply: Sender<Result<()>>,
    },

    /// Read statistics
    Stats { reply: Sender<EngineStats> },

    /// Read the ledger
    Ledger { reply: Sender<LedgerSnapshot> },

    /// Read a runtime setting
    GetSetting {
        index: SettingIndex,
        reply: Sender<Result<SettingValue>>,
    },

    /// Change a runtime setting
    SetSetting {
        value: SettingValue,
        reply: Sender<Result<()>>,
    },

    /// Connect a port to a peer, or disconnect it with `None`
    Tunnel {
        port: PortIndex,
        peer: Option<TunnelLink>,
        reply: Sender<Result<()>>,
    },

    /// Host buffer for either port
    Buffer(BufferHeader),

    /// Buffer a tunneled peer is done with
    PeerBuffer(BufferHeader),

    /// Terminate the event loop
    Stop,
}

/// One dequeued message, in dispatch order
#[derive(Debug)]
pub enum QueueEvent {
    Host(HostRequest),
    ControlAck(ControlAck),
    InputCompleted(Completion),
    OutputCompleted(Completion),
    EmptyThisBuffer(BufferHeader),
    FillThisBuffer(BufferHeader),
}

/// Producer side of the queue, held by the host
#[derive(Debug, Clone)]
pub struct QueueHandle {
    requests: Sender<HostRequest>,
}

impl QueueHandle {
    /// Enqueue a request; false when the engine is gone
    pub fn send(&self, request: HostRequest) -> bool {
        self.requests.send(request).is_ok()
    }

    /// Enqueue a request, handing it back when the engine is gone
    pub fn try_send(&self, request: HostRequest) -> std::result::Result<(), HostRequest> {
        self.requests.send(request).map_err(|e| e.into_inner())
    }

    /// Enqueue a host buffer behind every request sent before it
    ///
    /// The buffer comes back as the error when the engine is gone.
    pub fn submit(&self, buffer: BufferHeader) -> std::result::Result<(), BufferHeader> {
        self.requests
            .send(HostRequest::Buffer(buffer))
            .map_err(|e| match e.into_inner() {
                HostRequest::Buffer(buffer) => buffer,
                // only a buffer was sent
                _ => unreachable!(),
            })
    }

    /// Enqueue a buffer coming back from a tunneled peer
    pub fn give_back(&self, buffer: BufferHeader) -> std::result::Result<(), BufferHeader> {
        self.requests
            .send(HostRequest::PeerBuffer(buffer))
            .map_err(|e| match e.into_inner() {
                HostRequest::PeerBuffer(buffer) => buffer,
                _ => unreachable!(),
            })
    }
}

/// Consumer side of the queue, owned by the engine thread
#[derive(Debug)]
pub struct CommandQueue {
    requests: Receiver<HostRequest>,
    acks: Receiver<ControlAck>,
    input_done: Receiver<Completion>,
    output_done: Receiver<Completion>,
    sink: CompletionSink,
}

impl CommandQueue {
    /// Create the queue with its host handle
    pub fn new() -> (CommandQueue, QueueHandle) {
        let (request_tx, request_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        let (input_done_tx, input_done_rx) = unbounded();
        let (output_done_tx, output_done_rx) = unbounded();

        let queue = CommandQueue {
            requests: request_rx,
            acks: ack_rx,
            input_done: input_done_rx,
            output_done: output_done_rx,
            sink: CompletionSink::new(input_done_tx, output_done_tx, ack_tx),
        };
        let handle = QueueHandle { requests: request_tx };
        (queue, handle)
    }

    /// Sink the offload engine reports through
    pub fn sink(&self) -> CompletionSink {
        self.sink.clone()
    }

    /// Block until any source has a message or `deadline` passes
    ///
    /// Returns false on timeout.
    pub fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut select = Select::new();
        select.recv(&self.requests);
        select.recv(&self.acks);
        select.recv(&self.input_done);
        select.recv(&self.output_done);
        match deadline {
            Some(deadline) => select.ready_deadline(deadline).is_ok(),
            None => {
                select.ready();
                true
            }
        }
    }

    /// Take every message queued right now: host messages in the order
    /// they were sent, then acknowledgements, then completions
    ///
    /// A host that dropped its handle without stopping the loop reads as a
    /// stop request.
    pub fn ready(&self) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        for _ in 0..self.requests.len() {
            match self.requests.try_recv() {
                Ok(request) => events.push(host_event(request)),
                Err(_) => break,
            }
        }
        match self.requests.try_recv() {
            Ok(request) => events.push(host_event(request)),
            Err(TryRecvError::Disconnected) => events.push(QueueEvent::Host(HostRequest::Stop)),
            Err(TryRecvError::Empty) => {}
        }
        take_ready(&self.acks, &mut events, QueueEvent::ControlAck);
        take_ready(&self.input_done, &mut events, QueueEvent::InputCompleted);
        take_ready(&self.output_done, &mut events, QueueEvent::OutputCompleted);
        events
    }

    /// Host messages still queued at shutdown
    pub fn drain_host(&self) -> Vec<QueueEvent> {
        self.requests.try_iter().map(host_event).collect()
    }
}

fn host_event(request: HostRequest) -> QueueEvent {
    match request {
        HostRequest::Buffer(buffer) => match buffer.port() {
            PortIndex::Input => QueueEvent::EmptyThisBuffer(buffer),
            PortIndex::Output => QueueEvent::FillThisBuffer(buffer),
        },
        request => QueueEvent::Host(request),
    }
}

fn take_ready<T>(rx: &Receiver<T>, events: &mut Vec<QueueEvent>, wrap: fn(T) -> QueueEvent) {
    for _ in 0..rx.len() {
        match rx.try_recv() {
            Ok(message) => events.push(wrap(message)),
            Err(_) => break,
        }
    }
}
