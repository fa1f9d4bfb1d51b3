//! Lifecycle state machine
//!
//! The legal transition table, plus the two small synchronisation objects
//! shared between the host side and the command-queue thread: the
//! pending-transition counter and the state monitor.

use super::ComponentState;
use crate::utils::error::{DecoderError, Result};
use log::info;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Host-requestable transitions
pub const LEGAL_TRANSITIONS: [(ComponentState, ComponentState); 10] = [
    (ComponentState::Loaded, ComponentState::Idle),
    (ComponentState::Loaded, ComponentState::WaitForResources),
    (ComponentState::WaitForResources, ComponentState::Loaded),
    (ComponentState::WaitForResources, ComponentState::Idle),
    (ComponentState::Idle, ComponentState::Loaded),
    (ComponentState::Idle, ComponentState::Executing),
    (ComponentState::Executing, ComponentState::Idle),
    (ComponentState::Executing, ComponentState::Pause),
    (ComponentState::Pause, ComponentState::Idle),
    (ComponentState::Pause, ComponentState::Executing),
];

/// Work a legal transition implies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    /// Admit resources, wait for population, create the offload engine
    ToIdleFromLoaded,

    /// Wait for depopulation, destroy the offload engine, release resources
    ToLoaded,

    /// Re-admit processing, start the offload engine
    ToExecuting,

    /// Stop the offload engine, flush both ports, release processing
    ToIdleFromRunning,

    /// Pause the offload engine
    ToPause,

    /// Resume the offload engine
    Resume,

    /// Register as waiting for resources
    ToWaitForResources,

    /// Leave WaitForResources for Loaded
    CancelWait,
}

/// Resolve a host-requested transition
pub fn plan_transition(from: ComponentState, to: ComponentState) -> Result<TransitionPlan> {
    use ComponentState::*;

    if from == Invalid {
        return Err(DecoderError::InvalidState);
    }
    if from == to {
        return Err(DecoderError::SameState(from));
    }
    let plan = match (from, to) {
        (Loaded, Idle) | (WaitForResources, Idle) => TransitionPlan::ToIdleFromLoaded,
        (Loaded, WaitForResources) => TransitionPlan::ToWaitForResources,
        (WaitForResources, Loaded) => TransitionPlan::CancelWait,
        (Idle, Loaded) => TransitionPlan::ToLoaded,
        (Idle, Executing) => TransitionPlan::ToExecuting,
        (Executing, Idle) | (Pause, Idle) => TransitionPlan::ToIdleFromRunning,
        (Executing, Pause) => TransitionPlan::ToPause,
        (Pause, Executing) => TransitionPlan::Resume,
        _ => return Err(DecoderError::IncorrectStateTransition { from, to }),
    };
    Ok(plan)
}

/// Whether `from -> to` is a host-requestable transition
pub fn is_legal(from: ComponentState, to: ComponentState) -> bool {
    LEGAL_TRANSITIONS.contains(&(from, to))
}

/// Counter of state transitions requested but not yet finished
///
/// The host increments it before queueing a SetState, the command-queue
/// thread decrements it once the transition completes or fails, and
/// teardown waits for it to reach zero.
#[derive(Debug, Default)]
pub struct PendingTransitions {
    count: Mutex<u32>,
    settled: Condvar,
}

impl PendingTransitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        *self.count.lock() += 1;
    }

    pub fn finish(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.settled.notify_all();
        }
    }

    /// Forget every outstanding transition (fault path)
    pub fn clear(&self) {
        *self.count.lock() = 0;
        self.settled.notify_all();
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }

    /// Block until no transition is pending; false on timeout
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.settled.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Published component state with change notification
#[derive(Debug)]
pub struct StateMonitor {
    state: Mutex<ComponentState>,
    changed: Condvar,
}

impl Default for StateMonitor {
    fn default() -> Self {
        Self::new(ComponentState::Loaded)
    }
}

impl StateMonitor {
    pub fn new(initial: ComponentState) -> Self {
        Self {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> ComponentState {
        *self.state.lock()
    }

    pub fn set(&self, state: ComponentState) {
        let mut current = self.state.lock();
        if *current != state {
            info!("Component state changed: {} -> {}", *current, state);
            *current = state;
            self.changed.notify_all();
        }
    }

    /// Block until the state equals `target`; false on timeout
    pub fn wait_for(&self, target: ComponentState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != target {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return *state == target;
            }
        }
        true
    }
}
