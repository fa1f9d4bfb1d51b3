//! Lifecycle transitions and command dispatch
//!
//! A SetState command becomes a [`Transition`] that stays pending until its
//! completion condition holds (pools populated, offload engine created,
//! ports flushed). Commands that would interfere with a pending transition
//! or port operation are deferred and replayed in arrival order.

use super::engine::{Engine, RunState};
use super::port_ops::FlushOrigin;
use super::state::{plan_transition, TransitionPlan};
use super::{Command, CommandData, CommandKind, ComponentEvent, ComponentState};
use crate::buffer::PortIndex;
use crate::offload::ControlRequest;
use crate::resource::{Admission, ResourceKind};
use crate::utils::error::{DecoderError, Result};
use log::{debug, info};

/// Priority passed to the resource arbiter
const RESOURCE_PRIORITY: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Stage {
    Start,

    /// Both ports are being flushed after the engine stopped
    Flushing,
}

/// A state transition in progress
#[derive(Debug, Clone, Copy)]
pub(super) struct Transition {
    pub target: ComponentState,
    pub plan: TransitionPlan,
    pub stage: Stage,
}

impl Engine {
    pub(super) fn on_command(&mut self, command: Command) {
        if self.state == ComponentState::Invalid {
            if let Command::SetState(_) = command {
                self.pending.finish();
            }
            self.report(&DecoderError::InvalidState, None);
            return;
        }
        if self.must_defer(&command) {
            debug!("Deferring {:?}", command);
            self.deferred.push_back(command);
        } else {
            self.execute(command);
        }
    }

    fn execute(&mut self, command: Command) {
        debug!("Executing {:?}", command);
        match command {
            Command::SetState(target) => self.begin_transition(target),
            Command::PortDisable(selector) => {
                for port in selector.ports() {
                    self.disable_port(port);
                }
            }
            Command::PortEnable(selector) => {
                for port in selector.ports() {
                    self.enable_port(port);
                }
            }
            Command::Flush(selector) => {
                for port in selector.ports() {
                    self.flush_port(port);
                }
            }
            Command::MarkBuffer(port, mark) => {
                if let Err(e) = self.marks[port.slot()].push(mark) {
                    self.report(&e, Some(port));
                }
            }
        }
    }

    fn port_busy(&self, port: PortIndex) -> bool {
        let slot = port.slot();
        self.port_ops[slot].is_some() || self.flushes[slot].is_some()
    }

    fn must_defer(&self, command: &Command) -> bool {
        let halting = self
            .transition
            .as_ref()
            .map_or(false, |t| t.plan == TransitionPlan::ToIdleFromRunning);
        match command {
            Command::SetState(_) => {
                self.transition.is_some()
                    || self.port_ops.iter().any(Option::is_some)
                    || self.flushes.iter().any(Option::is_some)
                    || self.reconfig.is_draining()
                    || self.engine_target.is_some()
            }
            Command::PortDisable(selector) | Command::PortEnable(selector) | Command::Flush(selector) => {
                halting || self.reconfig.is_draining() || selector.ports().into_iter().any(|p| self.port_busy(p))
            }
            Command::MarkBuffer(..) => false,
        }
    }

    /// Replay deferred commands in arrival order
    pub(super) fn run_deferred(&mut self) -> bool {
        let mut ran = false;
        while let Some(command) = self.deferred.front().copied() {
            if self.state == ComponentState::Invalid || self.must_defer(&command) {
                break;
            }
            self.deferred.pop_front();
            self.execute(command);
            ran = true;
        }
        ran
    }

    fn begin_transition(&mut self, target: ComponentState) {
        let plan = match plan_transition(self.state, target) {
            Ok(plan) => plan,
            Err(e) => {
                self.report(&e, None);
                self.pending.finish();
                return;
            }
        };
        info!("Transition {} -> {} ({:?})", self.state, target, plan);

        let admission = match plan {
            TransitionPlan::ToIdleFromLoaded => self.acquire_resources(&[ResourceKind::Memory, ResourceKind::Processing]),
            TransitionPlan::ToExecuting => self.acquire_resources(&[ResourceKind::Processing]),
            _ => Ok(()),
        };
        if let Err(e) = admission {
            self.report(&e, None);
            self.pending.finish();
            return;
        }
        if plan == TransitionPlan::ToLoaded {
            self.return_parked_all();
        }
        self.transition = Some(Transition {
            target,
            plan,
            stage: Stage::Start,
        });
    }

    /// Complete the pending transition once its wait condition holds
    pub(super) fn progress_transition(&mut self) -> bool {
        let Some(transition) = self.transition else {
            return false;
        };
        let done = match transition.plan {
            TransitionPlan::ToIdleFromLoaded => {
                let populated = self
                    .ports
                    .iter()
                    .all(|p| !p.is_enabled() || p.is_populated());
                populated && self.drive_engine(RunState::Stopped)
            }
            TransitionPlan::ToLoaded => {
                self.ports.iter().all(|p| p.is_depopulated()) && self.drive_engine(RunState::Unloaded)
            }
            TransitionPlan::ToExecuting | TransitionPlan::Resume => {
                self.reconfig.is_active() || self.drive_engine(RunState::Running)
            }
            TransitionPlan::ToPause => self.reconfig.is_active() || self.drive_engine(RunState::Paused),
            TransitionPlan::ToIdleFromRunning => match transition.stage {
                Stage::Start => {
                    let halted = if self.run_state == RunState::Unloaded {
                        self.control_idle()
                    } else {
                        self.drive_engine(RunState::Stopped)
                    };
                    if !halted {
                        return false;
                    }
                    self.transition = Some(Transition {
                        stage: Stage::Flushing,
                        ..transition
                    });
                    for port in PortIndex::ALL {
                        self.start_flush(port, FlushOrigin::Transition);
                    }
                    return true;
                }
                Stage::Flushing => self.flushes.iter().all(Option::is_none) && self.control_idle(),
            },
            TransitionPlan::ToWaitForResources | TransitionPlan::CancelWait => true,
        };
        if done {
            self.complete_transition(transition);
        }
        done
    }

    fn complete_transition(&mut self, transition: Transition) {
        self.transition = None;
        match transition.plan {
            TransitionPlan::ToLoaded => {
                self.release_all_resources();
                if let Some(request) = self.reconfig.cancel() {
                    debug!("Dropping renegotiation of {:?} on unload", request.affected());
                }
                for port in self.ports.iter_mut() {
                    port.adopt_pending_format();
                }
            }
            TransitionPlan::ToIdleFromRunning => {
                self.release_resource(ResourceKind::Processing);
                self.return_parked_all();
            }
            TransitionPlan::ToExecuting => {
                self.sequence = [0, 0];
                self.frames.clear();
            }
            _ => {}
        }
        self.set_state(transition.target);
        self.stats.state_transitions += 1;
        self.emit(ComponentEvent::CommandComplete {
            command: CommandKind::SetState,
            data: CommandData::State(transition.target),
        });
        self.pending.finish();
    }

    /// Move the offload engine one control step towards `target`
    ///
    /// Returns true once the engine is there.
    pub(super) fn drive_engine(&mut self, target: RunState) -> bool {
        if !self.control_idle() {
            return false;
        }
        if self.run_state == target {
            return true;
        }
        let request = match (self.run_state, target) {
            (RunState::Unloaded, _) => match self.create_request() {
                Ok(request) => request,
                Err(e) => {
                    self.enter_invalid(e);
                    return false;
                }
            },
            (RunState::Stopped, RunState::Unloaded) => ControlRequest::Destroy,
            (RunState::Stopped, RunState::Paused) => ControlRequest::Pause,
            (RunState::Stopped, _) => ControlRequest::Start,
            (RunState::Running, RunState::Paused) => ControlRequest::Pause,
            (RunState::Paused, RunState::Running) => ControlRequest::Resume,
            (RunState::Running, _) | (RunState::Paused, _) => ControlRequest::Stop,
        };
        self.issue_control(request);
        false
    }

    /// Restore the engine run state after a renegotiation
    pub(super) fn progress_engine_target(&mut self) -> bool {
        let Some(target) = self.engine_target else {
            return false;
        };
        if self.drive_engine(target) {
            self.engine_target = None;
            return true;
        }
        false
    }

    fn acquire_resources(&mut self, kinds: &[ResourceKind]) -> Result<()> {
        let mut granted = Vec::new();
        for &kind in kinds {
            if self.held.contains(&kind) {
                continue;
            }
            match self.arbiter.request_resource(kind, RESOURCE_PRIORITY) {
                Admission::Granted => {
                    self.held.insert(kind);
                    granted.push(kind);
                }
                Admission::Denied => {
                    for kind in granted {
                        self.release_resource(kind);
                    }
                    return Err(DecoderError::ResourceDenied(format!("{:?} admission refused", kind)));
                }
            }
        }
        Ok(())
    }

    pub(super) fn release_resource(&mut self, kind: ResourceKind) {
        if self.held.remove(&kind) {
            self.arbiter.release_resource(kind);
        }
    }

    pub(super) fn release_all_resources(&mut self) {
        let held: Vec<ResourceKind> = self.held.drain().collect();
        for kind in held {
            self.arbiter.release_resource(kind);
        }
    }
}
