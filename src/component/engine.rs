//! Command-queue engine
//!
//! One thread owns everything mutable about a decoder instance: both ports,
//! the buffer ledger, the parameter arena, the offload engine handle and the
//! lifecycle state. Host requests, host buffers, offload completions and
//! control acknowledgements all arrive as messages through the
//! [`CommandQueue`] and are applied here one at a time.
//!
//! Lifecycle transitions live in `transitions.rs`, flush, port
//! enable/disable and reconfiguration sequencing in `port_ops.rs`.

use super::port_ops::{FlushOp, FlushOrigin, PortOp};
use super::queue::{CommandQueue, HostRequest, QueueEvent};
use super::reconfig::{ReconfigurationController, ReconfigurationRequest, StreamInfo, StreamInspector};
use super::settings::{self, CropRect, SettingIndex, SettingValue};
use super::state::{PendingTransitions, StateMonitor, TransitionPlan};
use super::transitions::Transition;
use super::tunnel::{self, TunnelLink};
use super::{
    Command, ComponentCallbacks, ComponentEvent, ComponentState, EngineStats, LedgerSnapshot, PortLedger, Rejected,
};
use crate::buffer::{
    BufferFlags, BufferHandle, BufferHeader, BufferLedger, BufferOwner, ComponentId, DecodeOrderQueue, FrameTag,
    MetadataEntry, PendingMarks, PortIndex,
};
use crate::internal_error;
use crate::offload::{
    CodecParams, Completion, ControlAck, CreateParams, ControlKind, ControlRequest, DecodedMetadata, OffloadEngine,
    OffloadParamBuilder, ParamArena, RejectReason, ResultStatus, SubmitOutcome, Submission,
};
use crate::port::{CompressionKind, FrameGeometry, Port, PortDefinition, PortFormat};
use crate::resource::{ResourceArbiter, ResourceKind};
use crate::utils::config::Config;
use crate::utils::error::{DecoderError, ErrorSeverity, IntoDecoderError, Result};
use crossbeam_channel::SendError;
use log::{debug, error, info, trace, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Port flags the host side reads without a round trip to the engine
#[derive(Debug)]
pub(crate) struct PortGate {
    enabled: [AtomicBool; 2],
    flushing: [AtomicBool; 2],
}

impl PortGate {
    pub fn new() -> Self {
        Self {
            enabled: [AtomicBool::new(true), AtomicBool::new(true)],
            flushing: [AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    pub fn is_enabled(&self, port: PortIndex) -> bool {
        self.enabled[port.slot()].load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, port: PortIndex, enabled: bool) {
        self.enabled[port.slot()].store(enabled, Ordering::Release);
    }

    /// A flush is running and new buffers on `port` are refused
    pub fn is_flushing(&self, port: PortIndex) -> bool {
        self.flushing[port.slot()].load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, port: PortIndex, flushing: bool) {
        self.flushing[port.slot()].store(flushing, Ordering::Release);
    }
}

/// Run state of the offload engine as last acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RunState {
    /// No codec instance exists
    Unloaded,

    /// Created, not decoding
    Stopped,

    Running,
    Paused,
}

impl RunState {
    /// State after a successful control request
    fn after(self, kind: ControlKind) -> RunState {
        match kind {
            ControlKind::Create | ControlKind::Stop => RunState::Stopped,
            ControlKind::Start | ControlKind::Resume => RunState::Running,
            ControlKind::Pause => RunState::Paused,
            ControlKind::Destroy => RunState::Unloaded,
            ControlKind::Flush(_) => self,
        }
    }

    pub fn accepts_submissions(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }
}

/// The control side-channel: one request in flight, the rest queued
#[derive(Debug, Default)]
pub(super) struct ControlChannel {
    pub in_flight: Option<(ControlKind, Option<Instant>)>,
    pub queued: VecDeque<ControlRequest>,
}

/// Everything the engine thread is built from
pub(crate) struct EngineParts {
    pub config: Config,
    pub queue: CommandQueue,
    pub monitor: Arc<StateMonitor>,
    pub pending: Arc<PendingTransitions>,
    pub gate: Arc<PortGate>,
    pub offload: Box<dyn OffloadEngine>,
    pub arbiter: Box<dyn ResourceArbiter>,
    pub inspector: Option<Box<dyn StreamInspector>>,
    pub callbacks: Box<dyn ComponentCallbacks>,
}

/// State owned by the command-queue thread
pub(crate) struct Engine {
    pub(super) config: Config,
    pub(super) id: ComponentId,
    pub(super) state: ComponentState,
    pub(super) monitor: Arc<StateMonitor>,
    pub(super) pending: Arc<PendingTransitions>,
    pub(super) gate: Arc<PortGate>,
    pub(super) queue: CommandQueue,

    /// Input and output port, indexed by `PortIndex::slot`
    pub(super) ports: [Port; 2],
    pub(super) ledger: BufferLedger,
    pub(super) arena: ParamArena,
    pub(super) codec: CodecParams,
    pub(super) marks: [PendingMarks; 2],

    /// Tags of submitted inputs waiting for their decoded frame
    pub(super) frames: DecodeOrderQueue,

    /// Next submission sequence per port
    pub(super) sequence: [u64; 2],
    pub(super) next_handle: u32,

    pub(super) offload: Box<dyn OffloadEngine>,
    pub(super) control: ControlChannel,
    pub(super) run_state: RunState,

    /// Run state to restore once a reconfiguration finished
    pub(super) engine_target: Option<RunState>,

    pub(super) arbiter: Box<dyn ResourceArbiter>,
    pub(super) held: HashSet<ResourceKind>,
    pub(super) inspector: Option<Box<dyn StreamInspector>>,
    pub(super) callbacks: Box<dyn ComponentCallbacks>,

    /// Peer each port is tunneled to
    pub(super) tunnels: [Option<TunnelLink>; 2],

    /// Raise an error event for every corrupt frame
    pub(super) error_reporting: bool,

    pub(super) transition: Option<Transition>,
    pub(super) port_ops: [Option<PortOp>; 2],
    pub(super) flushes: [Option<FlushOp>; 2],
    pub(super) deferred: VecDeque<Command>,
    pub(super) reconfig: ReconfigurationController,
    pub(super) stats: EngineStats,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Result<Self> {
        let EngineParts {
            config,
            queue,
            monitor,
            pending,
            gate,
            mut offload,
            arbiter,
            inspector,
            callbacks,
        } = parts;

        let component = &config.component;
        let geometry = FrameGeometry::new(component.width, component.height);
        let input_format = PortFormat {
            geometry,
            color: component.color_format,
            compression: component.codec,
        };
        let output_format = PortFormat {
            geometry,
            color: component.color_format,
            compression: CompressionKind::Unused,
        };
        input_format.validate()?;
        let codec = CodecParams::select(component.codec, component)?;

        let ring_capacity = config.ring_capacity();
        let ports = [
            Port::new(PortIndex::Input, &config.input_port, input_format, ring_capacity),
            Port::new(PortIndex::Output, &config.output_port, output_format, ring_capacity),
        ];
        offload.attach(queue.sink());

        Ok(Self {
            id: ComponentId(component.id),
            state: ComponentState::Loaded,
            monitor,
            pending,
            gate,
            queue,
            ports,
            ledger: BufferLedger::new(),
            arena: ParamArena::new(),
            codec,
            marks: [PendingMarks::default(), PendingMarks::default()],
            frames: DecodeOrderQueue::new(),
            sequence: [0, 0],
            next_handle: 1,
            offload,
            control: ControlChannel::default(),
            run_state: RunState::Unloaded,
            engine_target: None,
            arbiter,
            held: HashSet::new(),
            inspector,
            callbacks,
            tunnels: [None, None],
            error_reporting: false,
            transition: None,
            port_ops: [None, None],
            flushes: [None, None],
            deferred: VecDeque::new(),
            reconfig: ReconfigurationController::new(),
            stats: EngineStats::default(),
            config,
        })
    }

    /// Event loop; returns when the host stops the component
    pub fn run(mut self) {
        info!("{} ({}) event loop started", self.config.component.name, self.id);
        loop {
            let deadline = self.next_deadline();
            if self.queue.wait(deadline) {
                let mut events = self.queue.ready().into_iter();
                while let Some(event) = events.next() {
                    if let QueueEvent::Host(HostRequest::Stop) = event {
                        let rest: Vec<QueueEvent> = events.by_ref().collect();
                        self.shutdown(rest);
                        return;
                    }
                    self.handle(event);
                }
            }
            self.check_watchdog(Instant::now());
            self.verify_invariants();
        }
    }

    fn handle(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Host(request) => self.handle_request(request),
            QueueEvent::ControlAck(ack) => self.on_control_ack(ack),
            QueueEvent::InputCompleted(completion) | QueueEvent::OutputCompleted(completion) => {
                self.on_completion(completion)
            }
            QueueEvent::EmptyThisBuffer(buffer) | QueueEvent::FillThisBuffer(buffer) => {
                self.on_buffer(buffer, BufferOwner::Client)
            }
        }
        self.progress();
    }

    /// Advance every pending operation whose wait condition now holds,
    /// then submit whatever may be submitted
    pub(super) fn progress(&mut self) {
        loop {
            if self.state == ComponentState::Invalid {
                return;
            }
            let mut changed = self.progress_flushes();
            changed |= self.progress_port_ops();
            changed |= self.progress_reconfig();
            changed |= self.progress_transition();
            changed |= self.progress_engine_target();
            changed |= self.run_deferred();
            if !changed {
                break;
            }
        }
        self.pump();
    }

    fn handle_request(&mut self, request: HostRequest) {
        match request {
            HostRequest::Command(command) => self.on_command(command),
            HostRequest::AllocateBuffer {
                port,
                size,
                app_private,
                reply,
            } => {
                let result = self
                    .check_population(port, size)
                    .and_then(|()| self.populate(port, vec![0; size], app_private));
                if let Err(SendError(Ok(buffer))) = reply.send(result) {
                    self.rollback_population(buffer);
                }
            }
            HostRequest::UseBuffer {
                port,
                storage,
                app_private,
                reply,
            } => {
                let result = self
                    .check_population(port, storage.len())
                    .and_then(|()| self.populate(port, storage, app_private));
                if let Err(SendError(Ok(buffer))) = reply.send(result) {
                    self.rollback_population(buffer);
                }
            }
            HostRequest::FreeBuffer { buffer, reply } => {
                let result = self.free(buffer);
                let _ = reply.send(result);
            }
            HostRequest::GetPortDefinition { port, reply } => {
                let _ = reply.send(self.ports[port.slot()].definition());
            }
            HostRequest::SetPortDefinition { definition, reply } => {
                let result = self.set_definition(&definition);
                let _ = reply.send(result);
            }
            HostRequest::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.ownership_transfers = self.ledger.transfers();
                let _ = reply.send(stats);
            }
            HostRequest::Ledger { reply } => {
                let _ = reply.send(self.snapshot());
            }
            HostRequest::GetSetting { index, reply } => {
                let _ = reply.send(self.get_setting(index));
            }
            HostRequest::SetSetting { value, reply } => {
                let result = self.set_setting(value);
                let _ = reply.send(result);
            }
            HostRequest::Tunnel { port, peer, reply } => {
                let result = self.set_tunnel(port, peer);
                let _ = reply.send(result);
            }
            HostRequest::Buffer(buffer) => self.on_buffer(buffer, BufferOwner::Client),
            HostRequest::PeerBuffer(buffer) => self.on_buffer(buffer, BufferOwner::TunneledPeer),
            HostRequest::Stop => {}
        }
    }

    // ---- Population ----

    fn may_populate(&self, port: PortIndex) -> bool {
        let slot = port.slot();
        let enabling = self.port_ops[slot] == Some(PortOp::Enabling);
        let loading = self
            .transition
            .as_ref()
            .map_or(false, |t| t.plan == TransitionPlan::ToIdleFromLoaded)
            && self.ports[slot].is_enabled();
        enabling || loading
    }

    fn check_population(&self, port: PortIndex, size: usize) -> Result<()> {
        if !self.may_populate(port) {
            return Err(DecoderError::IncorrectStateOperation(format!(
                "cannot populate {} port in {}",
                port, self.state
            )));
        }
        let p = &self.ports[port.slot()];
        if p.allocated() >= p.count_actual() {
            return Err(DecoderError::BadParameter(format!(
                "{} port already holds {} buffers",
                port,
                p.allocated()
            )));
        }
        if size < p.buffer_size() {
            return Err(DecoderError::BadParameter(format!(
                "{} bytes is below the {} port buffer size of {}",
                size,
                port,
                p.buffer_size()
            )));
        }
        Ok(())
    }

    fn populate(&mut self, port: PortIndex, storage: Vec<u8>, app_private: u64) -> Result<BufferHeader> {
        let handle = BufferHandle::new(self.next_handle);
        self.next_handle = self
            .next_handle
            .checked_add(1)
            .ok_or_else(|| DecoderError::InsufficientResources("buffer handles exhausted".to_string()))?;
        self.ledger.register(handle, port, BufferOwner::Client)?;
        self.arena.reserve(handle);

        let p = &mut self.ports[port.slot()];
        p.note_allocated();
        let mut header = BufferHeader::new(handle, port, storage, p.epoch());
        header.app_private = app_private;
        debug!(
            "Populated {} on {} port ({} of {}, {} bytes, epoch {})",
            handle,
            port,
            p.allocated(),
            p.count_actual(),
            header.capacity(),
            header.epoch()
        );
        Ok(header)
    }

    /// Undo a population the host never received
    fn rollback_population(&mut self, buffer: BufferHeader) {
        warn!("Host gone before receiving {}, destroying it", buffer.handle());
        if self.ledger.unregister(buffer.handle(), BufferOwner::Client).is_ok() {
            self.arena.release(buffer.handle());
            self.ports[buffer.port().slot()].note_freed();
        }
    }

    /// Buffers may be destroyed on a disabled port or while unloading
    fn may_free(&self, port: PortIndex) -> bool {
        matches!(
            self.state,
            ComponentState::Invalid | ComponentState::Loaded | ComponentState::WaitForResources
        ) || self
            .transition
            .as_ref()
            .map_or(false, |t| t.plan == TransitionPlan::ToLoaded)
            || !self.ports[port.slot()].is_enabled()
    }

    fn free(&mut self, buffer: BufferHeader) -> std::result::Result<(), Rejected> {
        let port = buffer.port();
        let handle = buffer.handle();
        if !self.may_free(port) {
            let error = DecoderError::IncorrectStateOperation(format!(
                "cannot free {} from enabled {} port in {}",
                handle, port, self.state
            ));
            return Err(Rejected { error, buffer });
        }
        if let Err(error) = self.ledger.unregister(handle, BufferOwner::Client) {
            return Err(Rejected { error, buffer });
        }
        self.arena.release(handle);
        let p = &mut self.ports[port.slot()];
        p.note_freed();
        let storage = buffer.into_storage();
        debug!(
            "Freed {} on {} port ({} bytes, {} left)",
            handle,
            port,
            storage.len(),
            p.allocated()
        );
        Ok(())
    }

    fn set_definition(&mut self, definition: &PortDefinition) -> Result<()> {
        let slot = definition.port.slot();
        let loaded = matches!(self.state, ComponentState::Loaded | ComponentState::WaitForResources);
        if !loaded && self.ports[slot].is_enabled() {
            return Err(DecoderError::IncorrectStateOperation(format!(
                "{} port definition is fixed while enabled in {}",
                definition.port, self.state
            )));
        }
        let previous = self.ports[slot].format();
        self.ports[slot].apply_definition(definition, self.config.engine.max_buffers_per_port)?;
        if definition.port == PortIndex::Input {
            if definition.format.compression != previous.compression {
                self.codec = CodecParams::select(definition.format.compression, &self.config.component)?;
            }
            if definition.format.geometry != previous.geometry {
                self.ports[PortIndex::Output.slot()].adopt_geometry(definition.format.geometry);
            }
        }
        info!(
            "{} port set to {} {} x{} buffers of {} bytes",
            definition.port,
            definition.format.compression,
            definition.format.geometry,
            self.ports[slot].count_actual(),
            self.ports[slot].buffer_size()
        );
        Ok(())
    }

    fn set_tunnel(&mut self, port: PortIndex, peer: Option<TunnelLink>) -> Result<()> {
        let slot = port.slot();
        let loaded = matches!(self.state, ComponentState::Loaded | ComponentState::WaitForResources);
        if !loaded && self.ports[slot].is_enabled() {
            return Err(DecoderError::IncorrectStateOperation(format!(
                "{} port tunnel is fixed while enabled in {}",
                port, self.state
            )));
        }
        let held = self.ledger.owner_counts(port).tunneled;
        if held > 0 {
            return Err(DecoderError::IncorrectStateOperation(format!(
                "{} port peer still holds {} buffers",
                port, held
            )));
        }
        match &peer {
            Some(link) => {
                tunnel::verify(port, &self.ports[slot].format(), link.peer())?;
                info!("{} port tunneled to a {} peer", port, link.peer().compression());
            }
            None => info!("{} port tunnel removed", port),
        }
        self.tunnels[slot] = peer;
        Ok(())
    }

    fn get_setting(&self, index: SettingIndex) -> Result<SettingValue> {
        if self.state == ComponentState::Invalid {
            return Err(DecoderError::InvalidState);
        }
        match index {
            SettingIndex::ErrorReporting => {
                settings::check_error_reporting(self.ports[PortIndex::Input.slot()].format().compression)?;
                Ok(SettingValue::ErrorReporting(self.error_reporting))
            }
            SettingIndex::OutputCrop => Ok(SettingValue::OutputCrop(CropRect::full(
                self.ports[PortIndex::Output.slot()].format().geometry,
            ))),
        }
    }

    fn set_setting(&mut self, value: SettingValue) -> Result<()> {
        if self.state == ComponentState::Invalid {
            return Err(DecoderError::InvalidState);
        }
        match value {
            SettingValue::ErrorReporting(enabled) => {
                settings::check_error_reporting(self.ports[PortIndex::Input.slot()].format().compression)?;
                self.error_reporting = enabled;
                info!("Error reporting {}", if enabled { "enabled" } else { "disabled" });
                Ok(())
            }
            SettingValue::OutputCrop(_) => Err(DecoderError::UnsupportedSetting(
                "output crop follows the stream and is read-only".to_string(),
            )),
        }
    }

    fn snapshot(&self) -> LedgerSnapshot {
        let view = |p: &Port| PortLedger {
            owners: self.ledger.owner_counts(p.index()),
            allocated: p.allocated(),
            count_actual: p.count_actual(),
            epoch: p.epoch(),
        };
        LedgerSnapshot {
            input: view(&self.ports[PortIndex::Input.slot()]),
            output: view(&self.ports[PortIndex::Output.slot()]),
        }
    }

    // ---- Host buffers and submission ----

    /// Take a buffer from the host or from a tunneled peer
    fn on_buffer(&mut self, mut buffer: BufferHeader, from: BufferOwner) {
        let port = buffer.port();
        let slot = port.slot();
        let handle = buffer.handle();

        if let Err(e) = self.ledger.acquire(handle, from, BufferOwner::Component) {
            error!("Refusing {} from {:?}: {}", handle, from, e);
            if let DecoderError::UnknownBuffer(_) = e {
                self.report(&e, Some(port));
                self.hand_back(buffer);
            } else {
                self.ledger.force_owner(handle, BufferOwner::Component);
                self.ports[slot].park(buffer);
                self.enter_invalid(e);
            }
            return;
        }

        let flushing = matches!(&self.flushes[slot], Some(op) if op.origin != FlushOrigin::Reconfig);
        let from_peer = from == BufferOwner::TunneledPeer && !self.streaming(port);
        if !self.state.accepts_buffers() || !self.ports[slot].is_enabled() || flushing || from_peer {
            debug!("{} port not accepting buffers, returning {}", port, handle);
            self.return_to_client(buffer);
            return;
        }

        if port == PortIndex::Input {
            self.marks[slot].attach(&mut buffer);
            if !self.reconfig.is_active() {
                if let Some(info) = self.inspect(&buffer) {
                    let input = &self.ports[PortIndex::Input.slot()];
                    let output = &self.ports[PortIndex::Output.slot()];
                    if let Some(request) = ReconfigurationRequest::detect(
                        input.format(),
                        input.buffer_size(),
                        output.format(),
                        info,
                        Some(handle),
                    ) {
                        self.begin_reconfig(request, Some(buffer));
                        return;
                    }
                }
            }
        }
        trace!("Parked {} on {} port", handle, port);
        self.ports[slot].park(buffer);
    }

    fn inspect(&mut self, buffer: &BufferHeader) -> Option<StreamInfo> {
        let codec = self.ports[PortIndex::Input.slot()].format().compression;
        self.inspector.as_mut()?.inspect(codec, buffer)
    }

    /// Submit parked buffers while the engine can take them
    pub(super) fn pump(&mut self) {
        let halting = self
            .transition
            .as_ref()
            .map_or(false, |t| t.plan == TransitionPlan::ToIdleFromRunning);
        if !self.state.allows_submission() || self.reconfig.is_active() || !self.run_state.accepts_submissions() || halting
        {
            return;
        }
        for port in PortIndex::ALL {
            let slot = port.slot();
            loop {
                let p = &self.ports[slot];
                if !p.is_enabled() || p.settings_changed() || self.flushes[slot].is_some() {
                    break;
                }
                let Some(buffer) = self.ports[slot].unpark() else {
                    break;
                };
                if buffer.epoch() != self.ports[slot].epoch() {
                    warn!(
                        "{} belongs to format epoch {}, {} port is at {}",
                        buffer.handle(),
                        buffer.epoch(),
                        port,
                        self.ports[slot].epoch()
                    );
                    self.return_to_client(buffer);
                    continue;
                }
                if !self.submit(buffer) {
                    break;
                }
                if self.state == ComponentState::Invalid {
                    return;
                }
            }
        }
    }

    /// Hand one buffer to the offload engine; false when it was not taken
    fn submit(&mut self, mut buffer: BufferHeader) -> bool {
        let port = buffer.port();
        let slot = port.slot();
        let handle = buffer.handle();
        let sequence = self.sequence[slot];

        let params = match port {
            PortIndex::Input => self.codec.input_params(sequence, buffer.flags),
            PortIndex::Output => self.codec.output_params(&self.ports[slot].format()),
        };
        let params = match params {
            Ok(params) => params,
            Err(e) => {
                self.report(&e, Some(port));
                self.return_to_client(buffer);
                return true;
            }
        };

        if let Err(e) = self.ledger.acquire(handle, BufferOwner::Component, BufferOwner::OffloadEngine) {
            self.ports[slot].park_front(buffer);
            self.enter_invalid(e);
            return false;
        }
        if let Err(e) = self.arena.store(handle, params.clone()) {
            self.ledger.force_owner(handle, BufferOwner::Component);
            self.ports[slot].park_front(buffer);
            self.enter_invalid(e);
            return false;
        }

        // Headers never produce a frame, flagged or not
        let frame = port == PortIndex::Input
            && !buffer.flags.contains(BufferFlags::CODEC_CONFIG)
            && self.inspect(&buffer).is_none();

        // A mark for another component travels downstream with the frame
        let mut tag_mark = None;
        if frame {
            if let Some(mark) = buffer.mark {
                if mark.target != self.id {
                    tag_mark = buffer.mark.take();
                }
            }
        }
        let entry = MetadataEntry {
            handle,
            sequence,
            timestamp: buffer.timestamp,
            flags: buffer.flags,
            mark: buffer.mark,
        };
        if let Err(e) = self.ports[slot].ring_mut().push(entry) {
            debug!("Holding {}: {}", handle, e);
            if tag_mark.is_some() {
                buffer.mark = tag_mark;
            }
            self.arena.clear(handle);
            self.reclaim(buffer);
            return false;
        }
        if frame {
            self.frames.push(FrameTag {
                sequence,
                timestamp: buffer.timestamp,
                flags: buffer.flags.intersection(BufferFlags::PROPAGATED),
                mark: tag_mark,
            });
        }
        self.sequence[slot] += 1;

        let submission = Submission {
            epoch: self.ports[slot].epoch(),
            sequence,
            params,
            buffer,
        };
        match self.offload.submit(submission) {
            SubmitOutcome::Accepted => {
                match port {
                    PortIndex::Input => self.stats.input_submitted += 1,
                    PortIndex::Output => self.stats.output_submitted += 1,
                }
                trace!("Submitted {} on {} port, sequence {}", handle, port, sequence);
                true
            }
            SubmitOutcome::Rejected { submission, reason } => {
                let mut buffer = submission.buffer;
                self.arena.clear(handle);
                self.ports[slot].ring_mut().take(handle);
                if let Some(tag) = self.frames.remove_sequence(sequence) {
                    if tag.mark.is_some() {
                        buffer.mark = tag.mark;
                    }
                }
                if !self.reclaim(buffer) {
                    return false;
                }
                match reason {
                    RejectReason::Busy => {
                        self.stats.busy_rejections += 1;
                        debug!("Offload engine busy, holding {}", handle);
                    }
                    RejectReason::Unreachable => {
                        self.enter_invalid(DecoderError::hardware("offload engine unreachable"));
                    }
                }
                false
            }
        }
    }

    /// Take back a buffer the offload engine never accepted
    ///
    /// It goes to the front of its port queue. Returns false when the ledger
    /// disagreed and the component went Invalid.
    fn reclaim(&mut self, buffer: BufferHeader) -> bool {
        let handle = buffer.handle();
        let slot = buffer.port().slot();
        let result = self.ledger.acquire(handle, BufferOwner::OffloadEngine, BufferOwner::Component);
        if result.is_err() {
            self.ledger.force_owner(handle, BufferOwner::Component);
        }
        self.ports[slot].park_front(buffer);
        match result {
            Ok(()) => true,
            Err(e) => {
                self.enter_invalid(e);
                false
            }
        }
    }

    // ---- Completions ----

    fn on_completion(&mut self, completion: Completion) {
        let Completion {
            buffer,
            status,
            decoded,
        } = completion;
        let port = buffer.port();
        let slot = port.slot();
        let handle = buffer.handle();

        if self.state == ComponentState::Invalid {
            debug!("Late completion of {} while Invalid", handle);
            self.ledger.force_owner(handle, BufferOwner::Client);
            self.hand_back(buffer);
            return;
        }
        if let Err(e) = self.ledger.acquire(handle, BufferOwner::OffloadEngine, BufferOwner::Component) {
            error!("Completion of {} rejected: {}", handle, e);
            if let DecoderError::UnknownBuffer(_) = e {
                self.report(&e, Some(port));
                self.hand_back(buffer);
            } else {
                self.ledger.force_owner(handle, BufferOwner::Component);
                self.ports[slot].park(buffer);
                self.enter_invalid(e);
            }
            return;
        }
        self.arena.clear(handle);
        let entry = self.ports[slot].ring_mut().take(handle);

        if status.contains(ResultStatus::FATAL) {
            self.ports[slot].park(buffer);
            self.enter_invalid(DecoderError::hardware(format!("fatal decode status on {}", handle)));
            return;
        }
        if self.flushes[slot].is_some() || status.contains(ResultStatus::FLUSHED) {
            self.flush_return(buffer, entry);
            return;
        }
        match port {
            PortIndex::Input => self.input_done(buffer, status, entry, decoded),
            PortIndex::Output => self.output_done(buffer, status, decoded),
        }
    }

    fn input_done(
        &mut self,
        mut buffer: BufferHeader,
        status: ResultStatus,
        entry: Option<MetadataEntry>,
        decoded: DecodedMetadata,
    ) {
        let mut reached = None;
        let entry_sequence = entry.as_ref().map(|e| e.sequence);
        if let Some(entry) = entry {
            buffer.timestamp = entry.timestamp;
            buffer.flags = entry.flags;
            reached = entry.mark.filter(|m| m.target == self.id);
        }
        buffer.mark = None;
        buffer.filled_len = 0;
        self.apply_status(&mut buffer, status);
        self.release(buffer);

        // Consumed without a frame: its tag must not shift later frames
        let no_frame = status.contains(ResultStatus::INSUFFICIENT_DATA)
            || status.contains(ResultStatus::UNSUPPORTED)
            || decoded.geometry.is_some();
        if let (true, Some(sequence)) = (no_frame, entry_sequence) {
            if self.frames.discard(sequence) {
                debug!("Input sequence {} produced no frame", sequence);
            }
        }

        if let Some(mark) = reached {
            debug!("Mark {} reached", mark.data);
            self.emit(ComponentEvent::MarkReached { mark });
        }
        if let Some(geometry) = decoded.geometry {
            self.check_stream_geometry(geometry);
        }
    }

    fn output_done(&mut self, mut buffer: BufferHeader, status: ResultStatus, decoded: DecodedMetadata) {
        match self.frames.next_for(decoded.source_sequence) {
            Some(tag) => {
                buffer.timestamp = tag.timestamp;
                buffer.flags = tag.flags;
                buffer.mark = tag.mark;
            }
            None => {
                buffer.flags = BufferFlags::NONE;
                buffer.mark = None;
            }
        }
        self.apply_status(&mut buffer, status);
        self.marks[PortIndex::Output.slot()].attach(&mut buffer);

        let eos = buffer.flags.contains(BufferFlags::EOS);
        self.release(buffer);
        if eos {
            info!("End of stream reached on output port");
            self.emit(ComponentEvent::BufferFlag {
                port: PortIndex::Output,
                flags: BufferFlags::EOS,
            });
        }
        if let Some(geometry) = decoded.geometry {
            self.check_stream_geometry(geometry);
        }
    }

    /// Translate a completion status into buffer flags and events
    fn apply_status(&mut self, buffer: &mut BufferHeader, status: ResultStatus) {
        if status.contains(ResultStatus::CORRUPT) {
            buffer.flags.insert(BufferFlags::DATA_CORRUPT);
        }
        if status.contains(ResultStatus::INSUFFICIENT_DATA) || status.contains(ResultStatus::UNSUPPORTED) {
            buffer.flags.insert(BufferFlags::DATA_CORRUPT);
            buffer.filled_len = 0;
        }
        if status.contains(ResultStatus::UNSUPPORTED) {
            let err = DecoderError::StreamCorrupt(format!("unsupported stream data in {}", buffer.handle()));
            self.report(&err, Some(buffer.port()));
        }
        if status.contains(ResultStatus::SYNC_FRAME) {
            buffer.flags.insert(BufferFlags::SYNC_FRAME);
        }
        if buffer.port() == PortIndex::Output {
            if status.contains(ResultStatus::END_OF_STREAM) {
                buffer.flags.insert(BufferFlags::EOS);
            }
            if buffer.flags.contains(BufferFlags::DATA_CORRUPT) {
                self.stats.corrupt_frames += 1;
                if self.error_reporting {
                    let err = DecoderError::StreamCorrupt(format!("corrupt frame in {}", buffer.handle()));
                    self.report(&err, Some(PortIndex::Output));
                }
            }
        }
    }

    fn check_stream_geometry(&mut self, geometry: FrameGeometry) {
        if self.reconfig.is_active() {
            return;
        }
        let input = &self.ports[PortIndex::Input.slot()];
        let output = &self.ports[PortIndex::Output.slot()];
        let info = StreamInfo {
            geometry,
            compression: None,
        };
        if let Some(request) =
            ReconfigurationRequest::detect(input.format(), input.buffer_size(), output.format(), info, None)
        {
            self.begin_reconfig(request, None);
        }
    }

    // ---- Returning buffers ----

    /// The port exchanges buffers in steady state
    fn streaming(&self, port: PortIndex) -> bool {
        self.state.allows_submission()
            && self.transition.is_none()
            && self.ports[port.slot()].is_enabled()
            && self.flushes[port.slot()].is_none()
            && !self.reconfig.is_active()
    }

    /// Pass on a buffer the component is done with: to the tunneled peer
    /// while streaming, otherwise to the host
    fn release(&mut self, buffer: BufferHeader) {
        let port = buffer.port();
        let slot = port.slot();
        if self.tunnels[slot].is_none() || !self.streaming(port) {
            self.return_to_client(buffer);
            return;
        }
        let handle = buffer.handle();
        if let Err(e) = self.ledger.acquire(handle, BufferOwner::Component, BufferOwner::TunneledPeer) {
            error!("Delivering {}: {}", handle, e);
            self.ledger.force_owner(handle, BufferOwner::TunneledPeer);
        }
        self.stats.tunnel_deliveries += 1;
        trace!("Delivered {} to {} port peer", handle, port);
        if let Some(link) = self.tunnels[slot].as_mut() {
            link.deliver(buffer);
        }
    }

    /// Give a component-held buffer back to the host
    pub(super) fn return_to_client(&mut self, buffer: BufferHeader) {
        let handle = buffer.handle();
        if let Err(e) = self.ledger.acquire(handle, BufferOwner::Component, BufferOwner::Client) {
            error!("Returning {}: {}", handle, e);
            self.ledger.force_owner(handle, BufferOwner::Client);
        }
        self.hand_back(buffer);
    }

    /// Deliver a buffer through the host callbacks without touching the ledger
    pub(super) fn hand_back(&mut self, buffer: BufferHeader) {
        match buffer.port() {
            PortIndex::Input => {
                self.stats.empty_buffer_done += 1;
                self.callbacks.empty_buffer_done(buffer);
            }
            PortIndex::Output => {
                self.stats.fill_buffer_done += 1;
                self.callbacks.fill_buffer_done(buffer);
            }
        }
    }

    pub(super) fn return_parked(&mut self, port: PortIndex) {
        for buffer in self.ports[port.slot()].unpark_all() {
            self.return_to_client(buffer);
        }
    }

    pub(super) fn return_parked_all(&mut self) {
        for port in PortIndex::ALL {
            self.return_parked(port);
        }
    }

    // ---- Offload control ----

    pub(super) fn watchdog(&self) -> Option<Duration> {
        match self.config.engine.watchdog_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub(super) fn control_idle(&self) -> bool {
        self.control.in_flight.is_none() && self.control.queued.is_empty()
    }

    /// Send a control request, or queue it behind the one in flight
    pub(super) fn issue_control(&mut self, request: ControlRequest) {
        if self.control.in_flight.is_some() {
            self.control.queued.push_back(request);
            return;
        }
        let kind = request.kind();
        debug!("Offload control {}", kind);
        let deadline = self.watchdog().map(|timeout| Instant::now() + timeout);
        self.control.in_flight = Some((kind, deadline));
        if let Err(e) = self.offload.control(request).hardware_err(&format!("{} request", kind)) {
            self.control.in_flight = None;
            self.enter_invalid(e);
        }
    }

    fn on_control_ack(&mut self, ack: ControlAck) {
        if self.state == ComponentState::Invalid {
            debug!("Ignoring {} acknowledgement while Invalid", ack.kind);
            return;
        }
        match self.control.in_flight {
            Some((kind, _)) if kind == ack.kind => {}
            other => {
                warn!("Unexpected {} acknowledgement (in flight: {:?})", ack.kind, other.map(|(k, _)| k));
                return;
            }
        }
        self.control.in_flight = None;
        if let Err(fault) = ack.result {
            self.enter_invalid(DecoderError::hardware(format!("{} failed: {}", ack.kind, fault)));
            return;
        }
        self.run_state = self.run_state.after(ack.kind);
        debug!("Offload {} acknowledged, engine {:?}", ack.kind, self.run_state);
        if let ControlKind::Flush(port) = ack.kind {
            if let Some(op) = self.flushes[port.slot()].as_mut() {
                op.acknowledged = true;
            }
        }
        if let Some(next) = self.control.queued.pop_front() {
            self.issue_control(next);
        }
    }

    /// Create request for the current port formats
    pub(super) fn create_request(&mut self) -> Result<ControlRequest> {
        let input = &self.ports[PortIndex::Input.slot()];
        let output = &self.ports[PortIndex::Output.slot()];
        self.codec = CodecParams::select(input.format().compression, &self.config.component)?;
        let block = self
            .codec
            .create_params(&input.format(), input.buffer_size(), &output.format(), output.buffer_size())?;
        Ok(ControlRequest::Create(CreateParams {
            block,
            input_buffers: input.count_actual(),
            output_buffers: output.count_actual(),
        }))
    }

    // ---- Faults ----

    fn next_deadline(&self) -> Option<Instant> {
        let control = self.control.in_flight.and_then(|(_, deadline)| deadline);
        let flushes = self.flushes.iter().flatten().filter_map(|op| op.deadline);
        control.into_iter().chain(flushes).min()
    }

    pub(super) fn check_watchdog(&mut self, now: Instant) {
        if self.state == ComponentState::Invalid {
            return;
        }
        if let Some((kind, Some(deadline))) = self.control.in_flight {
            if now >= deadline {
                self.expire(format!("offload engine did not acknowledge {}", kind));
                return;
            }
        }
        for port in PortIndex::ALL {
            let stalled = match &self.flushes[port.slot()] {
                Some(op) => op.deadline.map_or(false, |d| now >= d) && self.ledger.counts(port) > 0,
                None => false,
            };
            if stalled {
                self.expire(format!(
                    "offload engine still holds {} {} buffers after flush",
                    self.ledger.counts(port),
                    port
                ));
                return;
            }
        }
    }

    /// Watchdog expiry: the engine is presumed dead with whatever it holds
    fn expire(&mut self, message: String) {
        error!("Watchdog: {}", message);
        for port in PortIndex::ALL {
            for handle in self.ledger.handles(port, BufferOwner::OffloadEngine) {
                self.ledger.force_owner(handle, BufferOwner::Client);
            }
        }
        self.enter_invalid(DecoderError::Hardware(message));
    }

    /// Unrecoverable fault: give every buffer back and refuse further work
    pub(super) fn enter_invalid(&mut self, err: DecoderError) {
        if self.state == ComponentState::Invalid {
            warn!("Fault while already Invalid: {}", err);
            return;
        }
        error!("Entering Invalid: {}", err);

        self.transition = None;
        self.port_ops = [None, None];
        self.flushes = [None, None];
        self.deferred.clear();
        self.engine_target = None;
        self.reconfig.cancel();
        for port in PortIndex::ALL {
            self.gate.set_flushing(port, false);
        }
        self.return_parked_all();

        self.control.in_flight = None;
        self.control.queued.clear();
        if self.run_state != RunState::Unloaded {
            if let Err(fault) = self.offload.control(ControlRequest::Destroy) {
                warn!("Destroy after fault failed: {}", fault);
            }
            self.run_state = RunState::Unloaded;
        }
        self.release_all_resources();

        self.set_state(ComponentState::Invalid);
        self.pending.clear();
        self.emit(ComponentEvent::Error {
            kind: err.kind(),
            severity: err.severity().max(ErrorSeverity::Critical),
            port: None,
            message: err.to_string(),
        });
    }

    /// Cross-check the ledger against the ports (debug aid)
    fn verify_invariants(&mut self) {
        if !self.config.engine.verify_invariants || self.state == ComponentState::Invalid {
            return;
        }
        for port in PortIndex::ALL {
            let p = &self.ports[port.slot()];
            let counts = self.ledger.owner_counts(port);
            let result = self.ledger.check_conservation(port, p.allocated()).and_then(|()| {
                if counts.component != p.parked_len() {
                    Err(internal_error!(
                        "{} port: ledger has {} component buffers, {} parked",
                        port,
                        counts.component,
                        p.parked_len()
                    ))
                } else if counts.offload != p.ring().len() {
                    Err(internal_error!(
                        "{} port: {} buffers offloaded, {} metadata entries",
                        port,
                        counts.offload,
                        p.ring().len()
                    ))
                } else {
                    Ok(())
                }
            });
            if let Err(e) = result {
                self.enter_invalid(e);
                return;
            }
        }
    }

    // ---- Shared helpers ----

    pub(super) fn set_state(&mut self, state: ComponentState) {
        self.state = state;
        self.monitor.set(state);
    }

    pub(super) fn emit(&mut self, event: ComponentEvent) {
        debug!("Event: {:?}", event);
        self.callbacks.on_event(event);
    }

    /// Report an error the component survives
    pub(super) fn report(&mut self, err: &DecoderError, port: Option<PortIndex>) {
        warn!("{}", err);
        self.emit(ComponentEvent::Error {
            kind: err.kind(),
            severity: err.severity(),
            port,
            message: err.to_string(),
        });
    }

    /// Drain on host stop: every buffer the component can reach goes back
    fn shutdown(mut self, rest: Vec<QueueEvent>) {
        info!("{} ({}) stopping", self.config.component.name, self.id);
        let queued = self.queue.drain_host();
        for event in rest.into_iter().chain(queued) {
            match event {
                QueueEvent::EmptyThisBuffer(buffer) | QueueEvent::FillThisBuffer(buffer) => self.hand_back(buffer),
                QueueEvent::InputCompleted(completion) | QueueEvent::OutputCompleted(completion) => {
                    self.ledger.force_owner(completion.buffer.handle(), BufferOwner::Client);
                    self.hand_back(completion.buffer);
                }
                QueueEvent::Host(HostRequest::Command(Command::SetState(_))) => self.pending.finish(),
                QueueEvent::Host(HostRequest::PeerBuffer(buffer)) => {
                    self.ledger.force_owner(buffer.handle(), BufferOwner::Client);
                    self.hand_back(buffer);
                }
                _ => {}
            }
        }
        for port in PortIndex::ALL {
            for buffer in self.ports[port.slot()].unpark_all() {
                self.ledger.force_owner(buffer.handle(), BufferOwner::Client);
                self.hand_back(buffer);
            }
        }
        if self.run_state != RunState::Unloaded {
            if let Err(fault) = self.offload.control(ControlRequest::Destroy) {
                warn!("Destroy at shutdown failed: {}", fault);
            }
        }
        self.release_all_resources();
        self.pending.clear();

        let offloaded = self.ledger.counts(PortIndex::Input) + self.ledger.counts(PortIndex::Output);
        if offloaded > 0 {
            warn!("Stopped with {} buffers still held by the offload engine", offloaded);
        }
        info!(
            "{} stopped: {} frames out, {} transitions",
            self.config.component.name, self.stats.fill_buffer_done, self.stats.state_transitions
        );
    }
}
