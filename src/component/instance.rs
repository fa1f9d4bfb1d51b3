//! Host-facing decoder instance
//!
//! A [`DecoderInstance`] owns the command-queue thread and is the only way a
//! host talks to the component. Commands and buffer submissions never block;
//! allocation, definitions and statistics are synchronous round trips to the
//! engine thread bounded by the configured request timeout.

use super::engine::{Engine, EngineParts, PortGate};
use super::queue::{CommandQueue, HostRequest, QueueHandle};
use super::reconfig::StreamInspector;
use super::settings::{SettingIndex, SettingValue};
use super::state::{PendingTransitions, StateMonitor};
use super::tunnel::{TunnelLink, TunnelPeer, TunnelReturn};
use super::{Command, ComponentCallbacks, ComponentState, EngineStats, LedgerSnapshot};
use crate::buffer::{BufferHandle, BufferHeader, PortIndex};
use crate::offload::OffloadEngine;
use crate::port::{CompressionKind, PortDefinition};
use crate::resource::{AlwaysGrant, ResourceArbiter};
use crate::utils::config::Config;
use crate::utils::error::{DecoderError, IntoDecoderError, Result};
use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// A buffer the component refused, handed back with the reason
#[derive(Error, Debug)]
#[error("{error}")]
pub struct Rejected {
    pub error: DecoderError,
    pub buffer: BufferHeader,
}

impl Rejected {
    fn new(error: DecoderError, buffer: BufferHeader) -> Self {
        Self { error, buffer }
    }
}

/// A free that did not go through
#[derive(Error, Debug)]
pub enum FreeError {
    /// Refused, the buffer is handed back
    #[error(transparent)]
    Rejected(#[from] Rejected),

    /// The command queue took the buffer and never answered
    #[error("no answer to free of {handle}: {reason}")]
    Unanswered { handle: BufferHandle, reason: String },
}

/// Decoder instance builder
pub struct DecoderInstanceBuilder {
    config: Config,
    offload: Option<Box<dyn OffloadEngine>>,
    arbiter: Box<dyn ResourceArbiter>,
    inspector: Option<Box<dyn StreamInspector>>,
    callbacks: Option<Box<dyn ComponentCallbacks>>,
}

impl DecoderInstanceBuilder {
    /// Create a builder for `config`
    pub fn new(config: Config) -> Self {
        Self {
            config,
            offload: None,
            arbiter: Box::new(AlwaysGrant),
            inspector: None,
            callbacks: None,
        }
    }

    /// Set the offload engine buffers are decoded on
    pub fn with_offload(mut self, offload: impl OffloadEngine + 'static) -> Self {
        self.offload = Some(Box::new(offload));
        self
    }

    /// Set the platform resource arbiter
    pub fn with_arbiter(mut self, arbiter: impl ResourceArbiter + 'static) -> Self {
        self.arbiter = Box::new(arbiter);
        self
    }

    /// Set the bitstream header inspector
    pub fn with_inspector(mut self, inspector: impl StreamInspector + 'static) -> Self {
        self.inspector = Some(Box::new(inspector));
        self
    }

    /// Set the host callbacks
    pub fn with_callbacks(mut self, callbacks: impl ComponentCallbacks + 'static) -> Self {
        self.callbacks = Some(Box::new(callbacks));
        self
    }

    /// Validate the configuration and start the command-queue thread
    pub fn build(self) -> Result<DecoderInstance> {
        self.config.validate()?;
        let offload = self
            .offload
            .ok_or_else(|| DecoderError::Config("no offload engine configured".to_string()))?;
        let callbacks = self
            .callbacks
            .ok_or_else(|| DecoderError::Config("no host callbacks configured".to_string()))?;

        let (queue, handle) = CommandQueue::new();
        let monitor = Arc::new(StateMonitor::default());
        let pending = Arc::new(PendingTransitions::new());
        let gate = Arc::new(PortGate::new());

        let engine = Engine::new(EngineParts {
            config: self.config.clone(),
            queue,
            monitor: Arc::clone(&monitor),
            pending: Arc::clone(&pending),
            gate: Arc::clone(&gate),
            offload,
            arbiter: self.arbiter,
            inspector: self.inspector,
            callbacks,
        })?;

        let name = self.config.component.name.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-{}", name, self.config.component.id))
            .spawn(move || engine.run())
            .internal_err("spawn command-queue thread")?;
        info!("Created {} instance {}", name, self.config.component.id);

        Ok(DecoderInstance {
            id: self.config.component.id,
            name,
            handle,
            monitor,
            pending,
            gate,
            request_timeout: Duration::from_millis(self.config.engine.request_timeout_ms),
            teardown_timeout: Duration::from_millis(self.config.engine.teardown_timeout_ms),
            thread: Some(thread),
        })
    }
}

/// A running decoder component
pub struct DecoderInstance {
    id: u32,
    name: String,
    handle: QueueHandle,
    monitor: Arc<StateMonitor>,
    pending: Arc<PendingTransitions>,
    gate: Arc<PortGate>,
    request_timeout: Duration,
    teardown_timeout: Duration,

    /// Command-queue thread
    thread: Option<thread::JoinHandle<()>>,
}

impl DecoderInstance {
    pub fn builder(config: Config) -> DecoderInstanceBuilder {
        DecoderInstanceBuilder::new(config)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ComponentState {
        self.monitor.get()
    }

    /// Block until the component reaches `state`; false on timeout
    pub fn wait_for_state(&self, state: ComponentState, timeout: Duration) -> bool {
        self.monitor.wait_for(state, timeout)
    }

    /// Queue an asynchronous command; completion is reported as an event
    pub fn send_command(&self, command: Command) -> Result<()> {
        if self.state() == ComponentState::Invalid {
            return Err(DecoderError::InvalidState);
        }
        let set_state = matches!(command, Command::SetState(_));
        if set_state {
            self.pending.begin();
        }
        if !self.handle.send(HostRequest::Command(command)) {
            if set_state {
                self.pending.finish();
            }
            return Err(DecoderError::Disconnected("command queue closed".to_string()));
        }
        debug!("Queued {:?}", command);
        Ok(())
    }

    /// Hand a filled input buffer to the component
    pub fn submit_input_buffer(&self, buffer: BufferHeader) -> std::result::Result<(), Rejected> {
        self.submit(PortIndex::Input, buffer)
    }

    /// Hand an empty output buffer to the component
    pub fn return_output_buffer(&self, mut buffer: BufferHeader) -> std::result::Result<(), Rejected> {
        buffer.clear();
        self.submit(PortIndex::Output, buffer)
    }

    fn submit(&self, port: PortIndex, buffer: BufferHeader) -> std::result::Result<(), Rejected> {
        if buffer.port() != port {
            let error = DecoderError::BadPortIndex(format!("{} belongs to the {} port", buffer.handle(), buffer.port()));
            return Err(Rejected::new(error, buffer));
        }
        let state = self.state();
        if !state.accepts_buffers() {
            let error = DecoderError::IncorrectStateOperation(format!("buffers are not accepted in {}", state));
            return Err(Rejected::new(error, buffer));
        }
        if !self.gate.is_enabled(port) || self.gate.is_flushing(port) {
            let error = DecoderError::IncorrectStateOperation(format!("{} port is disabled or flushing", port));
            return Err(Rejected::new(error, buffer));
        }
        self.handle.submit(buffer).map_err(|buffer| {
            Rejected::new(DecoderError::Disconnected("command queue closed".to_string()), buffer)
        })
    }

    /// Create a buffer with component-allocated storage of `size` bytes
    pub fn allocate_buffer(&self, port: PortIndex, size: usize, app_private: u64) -> Result<BufferHeader> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::AllocateBuffer {
            port,
            size,
            app_private,
            reply,
        })?;
        self.await_reply(rx)?
    }

    /// Create a buffer around host-provided storage
    pub fn use_buffer(&self, port: PortIndex, storage: Vec<u8>, app_private: u64) -> Result<BufferHeader> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::UseBuffer {
            port,
            storage,
            app_private,
            reply,
        })?;
        self.await_reply(rx)?
    }

    /// Destroy a buffer the host owns
    pub fn free_buffer(&self, buffer: BufferHeader) -> std::result::Result<(), FreeError> {
        let handle = buffer.handle();
        let (reply, rx) = bounded(1);
        if let Err(HostRequest::FreeBuffer { buffer, .. }) = self.handle.try_send(HostRequest::FreeBuffer { buffer, reply }) {
            let error = DecoderError::Disconnected("command queue closed".to_string());
            return Err(Rejected::new(error, buffer).into());
        }
        match rx.recv_timeout(self.request_timeout) {
            Ok(result) => Ok(result?),
            Err(e) => {
                warn!("Free of {} got no answer: {}", handle, e);
                Err(FreeError::Unanswered {
                    handle,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn port_definition(&self, port: PortIndex) -> Result<PortDefinition> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::GetPortDefinition { port, reply })?;
        self.await_reply(rx)
    }

    /// Replace a port definition (Loaded, or port disabled)
    pub fn set_port_definition(&self, definition: PortDefinition) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::SetPortDefinition { definition, reply })?;
        self.await_reply(rx)?
    }

    /// Role at `index` among the roles this component can take
    pub fn role_enum(&self, index: usize) -> Option<&'static str> {
        CompressionKind::CODECS.get(index).and_then(|codec| codec.role())
    }

    /// Role the component currently plays, from the input compression
    pub fn role(&self) -> Result<&'static str> {
        let compression = self.port_definition(PortIndex::Input)?.format.compression;
        compression
            .role()
            .ok_or_else(|| DecoderError::BadParameter(format!("{} input has no component role", compression)))
    }

    /// Switch to another role; the input port takes its compression
    pub fn set_role(&self, role: &str) -> Result<()> {
        let compression = CompressionKind::from_role(role)?;
        let mut definition = self.port_definition(PortIndex::Input)?;
        definition.format.compression = compression;
        self.set_port_definition(definition)?;
        info!("{} now plays {}", self.name, role);
        Ok(())
    }

    /// Read a runtime setting
    pub fn setting(&self, index: SettingIndex) -> Result<SettingValue> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::GetSetting { index, reply })?;
        self.await_reply(rx)?
    }

    /// Change a runtime setting
    pub fn set_setting(&self, value: SettingValue) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::SetSetting { value, reply })?;
        self.await_reply(rx)?
    }

    /// Connect `port` to a peer (Loaded, or port disabled)
    ///
    /// The peer gives buffers back through the returned handle.
    pub fn tunnel(&self, port: PortIndex, peer: impl TunnelPeer + 'static) -> Result<TunnelReturn> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::Tunnel {
            port,
            peer: Some(TunnelLink::new(Box::new(peer))),
            reply,
        })?;
        self.await_reply(rx)??;
        Ok(TunnelReturn::new(port, self.handle.clone()))
    }

    /// Disconnect the peer of `port`; it must not hold any buffer
    pub fn untunnel(&self, port: PortIndex) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::Tunnel { port, peer: None, reply })?;
        self.await_reply(rx)?
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::Stats { reply })?;
        self.await_reply(rx)
    }

    /// Current buffer ownership per port
    pub fn ledger_snapshot(&self) -> Result<LedgerSnapshot> {
        let (reply, rx) = bounded(1);
        self.request(HostRequest::Ledger { reply })?;
        self.await_reply(rx)
    }

    /// Wait for pending transitions, then stop the command-queue thread
    pub fn teardown(mut self) -> Result<()> {
        if !self.pending.wait_settled(self.teardown_timeout) {
            warn!("{} transitions still pending at teardown", self.pending.count());
        }
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        info!("Stopping {} instance {}", self.name, self.id);
        self.handle.send(HostRequest::Stop);
        thread
            .join()
            .map_err(|_| DecoderError::Internal("command-queue thread panicked".to_string()))
    }

    fn request(&self, request: HostRequest) -> Result<()> {
        if self.handle.send(request) {
            Ok(())
        } else {
            Err(DecoderError::Disconnected("command queue closed".to_string()))
        }
    }

    fn await_reply<T>(&self, rx: Receiver<T>) -> Result<T> {
        rx.recv_timeout(self.request_timeout)
            .map_err(|e| DecoderError::Disconnected(format!("no answer from command queue: {}", e)))
    }
}

impl Drop for DecoderInstance {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Teardown of {} failed: {}", self.name, e);
        }
    }
}
