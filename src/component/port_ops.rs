//! Flush, port enable/disable and reconfiguration sequencing
//!
//! A flush asks the offload engine to give back everything it holds on a
//! port and completes once the acknowledgement has arrived and the ledger
//! shows no buffer left with the engine. Disabling a port flushes it and
//! then waits for the host to free the pool; enabling waits for the pool to
//! be repopulated.

use super::engine::{Engine, RunState};
use super::reconfig::{ReconfigStep, ReconfigurationRequest};
use super::{CommandData, CommandKind, ComponentEvent, ComponentState};
use crate::buffer::{BufferFlags, BufferHeader, MetadataEntry, PortIndex};
use crate::offload::ControlRequest;
use log::{debug, info, warn};
use std::time::Instant;

/// Why a port is being flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FlushOrigin {
    /// Host Flush command
    Command,

    /// Executing/Pause -> Idle
    Transition,

    PortDisable,

    /// Drain ahead of a format change
    Reconfig,
}

/// A flush in progress on one port
#[derive(Debug, Clone, Copy)]
pub(super) struct FlushOp {
    pub origin: FlushOrigin,

    /// The offload engine confirmed the flush
    pub acknowledged: bool,

    /// Watchdog expiry for buffers still held by the engine
    pub deadline: Option<Instant>,
}

/// Port command waiting on the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PortOp {
    /// Waiting for every buffer to be freed
    Disabling,

    /// Waiting for the pool to be repopulated
    Enabling,
}

impl Engine {
    pub(super) fn flush_port(&mut self, port: PortIndex) {
        info!("Flushing {} port", port);
        self.start_flush(port, FlushOrigin::Command);
    }

    pub(super) fn start_flush(&mut self, port: PortIndex, origin: FlushOrigin) {
        let slot = port.slot();
        if self.flushes[slot].is_some() {
            debug!("{} port already flushing", port);
            return;
        }
        if origin != FlushOrigin::Reconfig {
            self.gate.set_flushing(port, true);
            self.return_parked(port);
        }
        let held = self.ledger.counts(port);
        self.flushes[slot] = Some(FlushOp {
            origin,
            acknowledged: held == 0,
            deadline: self.watchdog().filter(|_| held > 0).map(|timeout| Instant::now() + timeout),
        });
        if held > 0 {
            debug!("{} port flush ({:?}) waiting for {} buffers", port, origin, held);
            self.issue_control(ControlRequest::Flush(port));
        }
    }

    /// Finish flushes whose buffers are all back
    pub(super) fn progress_flushes(&mut self) -> bool {
        let mut changed = false;
        for port in PortIndex::ALL {
            let slot = port.slot();
            let ready = match &self.flushes[slot] {
                Some(op) => op.acknowledged && self.ledger.counts(port) == 0,
                None => false,
            };
            // The output side drains only after the input side
            if !ready || (port == PortIndex::Output && self.flushes[PortIndex::Input.slot()].is_some()) {
                continue;
            }
            if let Some(op) = self.flushes[slot].take() {
                self.finish_flush(port, op);
                changed = true;
            }
        }
        changed
    }

    fn finish_flush(&mut self, port: PortIndex, op: FlushOp) {
        let discarded = self.ports[port.slot()].ring_mut().reset();
        if discarded > 0 {
            warn!("{} port flush discarded {} stale metadata entries", port, discarded);
        }
        if port == PortIndex::Output && self.ledger.counts(PortIndex::Input) == 0 {
            self.frames.clear();
        }
        self.gate.set_flushing(port, false);
        self.stats.flushes += 1;
        debug!("{} port flush ({:?}) complete", port, op.origin);
        if op.origin == FlushOrigin::Command {
            self.emit(ComponentEvent::CommandComplete {
                command: CommandKind::Flush,
                data: CommandData::Port(port),
            });
        }
    }

    /// Route a buffer the engine gave back without processing it
    pub(super) fn flush_return(&mut self, mut buffer: BufferHeader, entry: Option<MetadataEntry>) {
        let port = buffer.port();
        if let Some(entry) = &entry {
            buffer.timestamp = entry.timestamp;
            buffer.flags = entry.flags;
            buffer.mark = entry.mark;
        }
        match port {
            PortIndex::Input => {
                if let Some(tag) = entry.and_then(|e| self.frames.remove_sequence(e.sequence)) {
                    if tag.mark.is_some() {
                        buffer.mark = tag.mark;
                    }
                }
            }
            PortIndex::Output => {
                buffer.filled_len = 0;
                buffer.flags = BufferFlags::NONE;
                buffer.mark = None;
            }
        }

        let reconfig_drain = matches!(&self.flushes[port.slot()], Some(op) if op.origin == FlushOrigin::Reconfig);
        if port == PortIndex::Output && (reconfig_drain || self.reconfig.is_active()) {
            self.ports[port.slot()].park(buffer);
        } else {
            self.return_to_client(buffer);
        }
    }

    // ---- Port enable/disable ----

    pub(super) fn disable_port(&mut self, port: PortIndex) {
        let slot = port.slot();
        if self.ports[slot].is_enabled() {
            info!("Disabling {} port", port);
            self.ports[slot].set_enabled(false);
            self.gate.set_enabled(port, false);
            self.start_flush(port, FlushOrigin::PortDisable);
        }
        self.port_ops[slot] = Some(PortOp::Disabling);
    }

    pub(super) fn enable_port(&mut self, port: PortIndex) {
        let slot = port.slot();
        if self.ports[slot].is_enabled() {
            self.complete_port_op(port, CommandKind::PortEnable);
            return;
        }
        let p = &mut self.ports[slot];
        p.set_enabled(true);
        if let Some(format) = p.adopt_pending_format() {
            debug!("{} port adopts {} {}", port, format.compression, format.geometry);
        }
        let epoch = p.begin_epoch();
        self.gate.set_enabled(port, true);
        info!("Enabling {} port, epoch {}", port, epoch);

        if matches!(self.state, ComponentState::Loaded | ComponentState::WaitForResources) {
            self.complete_port_op(port, CommandKind::PortEnable);
        } else {
            self.port_ops[slot] = Some(PortOp::Enabling);
        }
    }

    /// Finish port commands whose pool condition holds
    pub(super) fn progress_port_ops(&mut self) -> bool {
        let mut changed = false;
        for port in PortIndex::ALL {
            let slot = port.slot();
            let done = match self.port_ops[slot] {
                Some(PortOp::Disabling) => self.flushes[slot].is_none() && self.ports[slot].is_depopulated(),
                Some(PortOp::Enabling) => self.ports[slot].is_populated(),
                None => false,
            };
            if !done {
                continue;
            }
            let kind = match self.port_ops[slot].take() {
                Some(PortOp::Enabling) => CommandKind::PortEnable,
                _ => CommandKind::PortDisable,
            };
            self.complete_port_op(port, kind);
            changed = true;
        }
        changed
    }

    fn complete_port_op(&mut self, port: PortIndex, kind: CommandKind) {
        debug!("{:?} complete on {} port", kind, port);
        self.emit(ComponentEvent::CommandComplete {
            command: kind,
            data: CommandData::Port(port),
        });
        if kind == CommandKind::PortEnable {
            match self.reconfig.port_enabled(port) {
                ReconfigStep::Notify(next) => self.notify_port(next),
                ReconfigStep::Finished => self.finish_reconfig(),
                ReconfigStep::Ignore => {}
            }
        }
    }

    // ---- Reconfiguration ----

    /// Start renegotiating the ports a stream format change made stale
    pub(super) fn begin_reconfig(&mut self, request: ReconfigurationRequest, trigger: Option<BufferHeader>) {
        if !self.reconfig.begin(request.clone()) {
            if let Some(buffer) = trigger {
                let slot = buffer.port().slot();
                self.ports[slot].park(buffer);
            }
            return;
        }
        for port in request.affected() {
            if let Some(format) = request.format_for(port) {
                self.ports[port.slot()].mark_settings_changed(format);
            }
        }
        if !request.affects(PortIndex::Input) {
            if let Some(output) = request.output {
                self.ports[PortIndex::Input.slot()].adopt_geometry(output.geometry);
            }
        }

        if let Some(buffer) = trigger {
            // Inputs queued ahead of the header belong to the old format
            self.return_parked(PortIndex::Input);
            if request.affects(PortIndex::Input) {
                self.return_to_client(buffer);
            } else {
                self.ports[PortIndex::Input.slot()].park_front(buffer);
            }
        }
    }

    /// Drain the offload engine, then notify the first affected port
    pub(super) fn progress_reconfig(&mut self) -> bool {
        if !self.reconfig.is_draining() {
            return false;
        }
        if self.run_state.accepts_submissions() {
            self.drive_engine(RunState::Stopped);
            return false;
        }
        if !self.control_idle() {
            return false;
        }
        let mut started = false;
        for port in PortIndex::ALL {
            if self.flushes[port.slot()].is_none() && self.ledger.counts(port) > 0 {
                self.start_flush(port, FlushOrigin::Reconfig);
                started = true;
            }
        }
        if self.flushes.iter().any(Option::is_some) {
            return started;
        }
        if !self.drive_engine(RunState::Unloaded) {
            return false;
        }
        if let Some(port) = self.reconfig.drained() {
            self.notify_port(port);
        }
        true
    }

    fn notify_port(&mut self, port: PortIndex) {
        let slot = port.slot();
        self.ports[slot].set_enabled(false);
        self.gate.set_enabled(port, false);
        self.return_parked(port);
        match self.ports[slot].pending_format() {
            Some(format) => {
                info!("{} port settings changed to {} {}", port, format.compression, format.geometry);
                self.emit(ComponentEvent::PortSettingsChanged { port, format });
            }
            None => warn!("{} port has no pending format to report", port),
        }
    }

    fn finish_reconfig(&mut self) {
        for port in self.ports.iter_mut() {
            port.clear_settings_changed();
        }
        self.stats.reconfigurations = self.reconfig.completed();
        self.engine_target = match self.state {
            ComponentState::Executing => Some(RunState::Running),
            ComponentState::Pause => Some(RunState::Paused),
            ComponentState::Idle => Some(RunState::Stopped),
            _ => None,
        };
        info!("Renegotiation complete, resuming towards {:?}", self.engine_target);
    }
}
