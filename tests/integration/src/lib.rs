//! Integration test utilities for hwvdec
//!
//! This module provides a host-side harness around a [`DecoderInstance`]
//! backed by the simulated offload engine:
//! - Fixture builder with configuration and behaviour overrides
//! - Buffer pools per port, filled and recycled the way a media pipeline would
//! - Waiting helpers over the callback channel
//! - Ledger conservation checks

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::Receiver;
use hwvdec::resource::SlotArbiter;
use hwvdec::simulated::{
    frame_payload, ChannelCallbacks, HostMessage, SimulatedBehavior, SimulatedOffloadEngine, SubmissionProbe,
    SyntheticHeaderInspector,
};
use hwvdec::{
    BufferFlags, BufferHeader, Command, CommandData, CommandKind, ComponentEvent, ComponentState, Config,
    DecoderInstance, LedgerSnapshot, Mark, PortIndex, PortSelector,
};
use log::debug;
use std::time::{Duration, Instant};

/// How long any wait helper blocks before failing the test
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame interval used for synthetic timestamps (30 fps, microseconds)
pub const FRAME_INTERVAL: i64 = 33_333;

/// Initialize test logging once per process
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// What the host saw in one fill-buffer-done callback
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub filled_len: usize,
    pub epoch: u64,
    pub mark: Option<Mark>,
}

impl OutputRecord {
    /// A decoded frame or the end-of-stream marker, as opposed to a flushed buffer
    pub fn is_frame(&self) -> bool {
        self.filled_len > 0 || self.flags.contains(BufferFlags::EOS)
    }
}

/// Fixture builder
pub struct FixtureBuilder {
    config: Config,
    behavior: SimulatedBehavior,
    arbiter: Option<SlotArbiter>,
    inspector: bool,
}

impl FixtureBuilder {
    pub fn config(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn behavior(mut self, behavior: SimulatedBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn arbiter(mut self, arbiter: SlotArbiter) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Leave header detection to the offload engine
    pub fn without_inspector(mut self) -> Self {
        self.inspector = false;
        self
    }

    pub fn build(self) -> Result<TestFixture> {
        init_logging();
        let probe = SubmissionProbe::new();
        let (callbacks, rx) = ChannelCallbacks::new();
        let mut builder = DecoderInstance::builder(self.config)
            .with_offload(SimulatedOffloadEngine::new(self.behavior).with_probe(probe.clone()))
            .with_callbacks(callbacks);
        if self.inspector {
            builder = builder.with_inspector(SyntheticHeaderInspector);
        }
        if let Some(arbiter) = self.arbiter {
            builder = builder.with_arbiter(arbiter);
        }
        Ok(TestFixture {
            instance: builder.build()?,
            probe,
            rx,
            pools: [Vec::new(), Vec::new()],
            allocated: [0, 0],
            outputs: Vec::new(),
            events: Vec::new(),
            consumed: Vec::new(),
            inputs_returned: 0,
        })
    }
}

/// A decoder instance plus the host state around it
pub struct TestFixture {
    pub instance: DecoderInstance,
    pub probe: SubmissionProbe,
    rx: Receiver<HostMessage>,

    /// Buffers the host currently holds, per port
    pub pools: [Vec<BufferHeader>; 2],

    /// Buffers that exist, per port
    pub allocated: [usize; 2],

    /// Every fill-buffer-done in arrival order
    pub outputs: Vec<OutputRecord>,

    /// Every event in arrival order
    pub events: Vec<ComponentEvent>,

    /// Events already returned by `wait_event`
    consumed: Vec<bool>,

    pub inputs_returned: usize,
}

impl TestFixture {
    pub fn builder() -> FixtureBuilder {
        FixtureBuilder {
            config: Config::default(),
            behavior: SimulatedBehavior::default(),
            arbiter: None,
            inspector: true,
        }
    }

    /// Fixture with the default configuration and an ideal engine
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    // ---- Callback processing ----

    /// Receive and record one callback
    pub fn step(&mut self, timeout: Duration) -> Result<bool> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => {
                self.record(message);
                Ok(true)
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(false),
            Err(e) => Err(anyhow!("callback channel closed: {}", e)),
        }
    }

    fn record(&mut self, message: HostMessage) {
        match message {
            HostMessage::Event(event) => {
                debug!("Event: {:?}", event);
                self.events.push(event);
                self.consumed.push(false);
            }
            HostMessage::EmptyBufferDone(buffer) => {
                self.inputs_returned += 1;
                self.pools[PortIndex::Input.slot()].push(buffer);
            }
            HostMessage::FillBufferDone(buffer) => {
                self.outputs.push(OutputRecord {
                    timestamp: buffer.timestamp,
                    flags: buffer.flags,
                    filled_len: buffer.filled_len,
                    epoch: buffer.epoch(),
                    mark: buffer.mark,
                });
                self.pools[PortIndex::Output.slot()].push(buffer);
            }
        }
    }

    /// Record callbacks until `done` holds
    pub fn run_until(&mut self, recycle: bool, mut done: impl FnMut(&Self) -> bool) -> Result<()> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            if recycle {
                self.recycle_outputs();
            }
            if done(self) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                bail!("timed out; events so far: {:?}", self.events);
            }
            self.step(deadline - now)?;
        }
    }

    /// Wait for the oldest not yet waited-for event matching `matches`
    pub fn wait_event(&mut self, mut matches: impl FnMut(&ComponentEvent) -> bool) -> Result<ComponentEvent> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let found = (0..self.events.len()).find(|&i| !self.consumed[i] && matches(&self.events[i]));
            if let Some(index) = found {
                self.consumed[index] = true;
                return Ok(self.events[index].clone());
            }
            let now = Instant::now();
            if now >= deadline {
                bail!("event never arrived; events so far: {:?}", self.events);
            }
            self.step(deadline - now)?;
        }
    }

    pub fn wait_complete(&mut self, kind: CommandKind, data: CommandData) -> Result<()> {
        self.wait_event(|e| {
            matches!(e, ComponentEvent::CommandComplete { command, data: d } if *command == kind && *d == data)
        })?;
        Ok(())
    }

    pub fn wait_state(&mut self, state: ComponentState) -> Result<()> {
        self.wait_complete(CommandKind::SetState, CommandData::State(state))
    }

    /// Events of the given shape seen so far
    pub fn count_events(&self, matches: impl Fn(&ComponentEvent) -> bool) -> usize {
        self.events.iter().filter(|e| matches(e)).count()
    }

    pub fn frames(&self) -> Vec<&OutputRecord> {
        self.outputs.iter().filter(|o| o.is_frame()).collect()
    }

    pub fn wait_frames(&mut self, count: usize) -> Result<()> {
        self.run_until(true, |f| f.frames().len() >= count)
    }

    // ---- Lifecycle ----

    /// Allocate the full pool of `port`
    pub fn populate(&mut self, port: PortIndex) -> Result<()> {
        let definition = self.instance.port_definition(port)?;
        for i in 0..definition.buffer_count_actual {
            let buffer = self.instance.allocate_buffer(port, definition.buffer_size, i as u64)?;
            self.pools[port.slot()].push(buffer);
            self.allocated[port.slot()] += 1;
        }
        debug!(
            "{} port populated with {} x {} bytes",
            port, definition.buffer_count_actual, definition.buffer_size
        );
        Ok(())
    }

    /// Loaded -> Idle with both pools allocated
    pub fn to_idle(&mut self) -> Result<()> {
        self.instance.send_command(Command::SetState(ComponentState::Idle))?;
        for port in PortIndex::ALL {
            self.populate(port)?;
        }
        self.wait_state(ComponentState::Idle)
    }

    /// Loaded -> Idle -> Executing
    pub fn start(&mut self) -> Result<()> {
        self.to_idle()?;
        self.set_state(ComponentState::Executing)?;
        self.recycle_outputs();
        Ok(())
    }

    pub fn set_state(&mut self, state: ComponentState) -> Result<()> {
        self.instance.send_command(Command::SetState(state))?;
        self.wait_state(state)
    }

    /// Executing/Pause -> Idle -> Loaded, freeing every buffer
    pub fn unload(&mut self) -> Result<()> {
        if self.instance.state() != ComponentState::Idle {
            self.set_state(ComponentState::Idle)?;
        }
        self.instance.send_command(Command::SetState(ComponentState::Loaded))?;
        self.free_all()?;
        self.wait_state(ComponentState::Loaded)
    }

    /// Free every buffer, waiting for those still out
    pub fn free_all(&mut self) -> Result<()> {
        for port in PortIndex::ALL {
            self.free_port(port)?;
        }
        Ok(())
    }

    /// Free the pool of `port` as its buffers come back
    pub fn free_port(&mut self, port: PortIndex) -> Result<()> {
        let slot = port.slot();
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            for buffer in self.pools[slot].drain(..).collect::<Vec<_>>() {
                self.instance
                    .free_buffer(buffer)
                    .map_err(|e| anyhow!("free on {} port: {}", port, e))?;
                self.allocated[slot] -= 1;
            }
            if self.allocated[slot] == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                bail!("{} {} buffers never came back", self.allocated[slot], port);
            }
            self.step(deadline - now)?;
        }
    }

    /// Answer a settings change: free the stale pool, re-enable, repopulate
    pub fn renegotiate(&mut self, port: PortIndex) -> Result<()> {
        self.free_port(port)?;
        self.instance.send_command(Command::PortEnable(PortSelector::Port(port)))?;
        self.populate(port)?;
        self.wait_complete(CommandKind::PortEnable, CommandData::Port(port))
    }

    // ---- Buffer traffic ----

    /// Hand every held output buffer to the component
    pub fn recycle_outputs(&mut self) {
        let slot = PortIndex::Output.slot();
        for buffer in self.pools[slot].drain(..).collect::<Vec<_>>() {
            if let Err(rejected) = self.instance.return_output_buffer(buffer) {
                self.pools[slot].push(rejected.buffer);
            }
        }
    }

    /// Take an input buffer, waiting for one to come back if needed
    pub fn input_buffer(&mut self) -> Result<BufferHeader> {
        let slot = PortIndex::Input.slot();
        self.run_until(true, |f| !f.pools[slot].is_empty())?;
        self.pools[slot]
            .pop()
            .ok_or_else(|| anyhow!("input pool unexpectedly empty"))
    }

    /// Submit one input buffer carrying `payload`
    pub fn submit(&mut self, payload: &[u8], timestamp: i64, flags: BufferFlags) -> Result<()> {
        let mut buffer = self.input_buffer()?;
        buffer.fill(payload)?;
        buffer.timestamp = timestamp;
        buffer.flags = flags;
        self.instance
            .submit_input_buffer(buffer)
            .map_err(|r| anyhow!("input rejected: {}", r.error))
    }

    /// Submit a synthetic frame with the timestamp of frame `index`
    pub fn submit_frame(&mut self, index: u64) -> Result<()> {
        self.submit(&frame_payload(index, 1024), index as i64 * FRAME_INTERVAL, BufferFlags::NONE)
    }

    pub fn submit_eos(&mut self, timestamp: i64) -> Result<()> {
        self.submit(&[], timestamp, BufferFlags::EOS)
    }

    // ---- Checks ----

    pub fn ledger(&self) -> Result<LedgerSnapshot> {
        Ok(self.instance.ledger_snapshot()?)
    }

    /// Every buffer of every port has exactly one owner, and the host holds
    /// exactly the buffers the ledger credits to it
    pub fn assert_conservation(&mut self) -> Result<()> {
        self.assert_conservation_with_peer([0, 0])
    }

    /// As [`Self::assert_conservation`], with `peer_held` buffers per port
    /// out with a tunneled peer
    pub fn assert_conservation_with_peer(&mut self, peer_held: [usize; 2]) -> Result<()> {
        let snapshot = self.settled_ledger()?;
        for port in PortIndex::ALL {
            let slot = port.slot();
            let view = snapshot.port(port);
            let owners = view.owners;
            if owners.total() != view.allocated {
                bail!("{} port: {:?} owners for {} buffers", port, owners, view.allocated);
            }
            if view.allocated != self.allocated[slot] {
                bail!(
                    "{} port: component counts {} buffers, host {}",
                    port,
                    view.allocated,
                    self.allocated[slot]
                );
            }
            if owners.client != self.pools[slot].len() {
                bail!(
                    "{} port: ledger credits the host with {} buffers, host holds {}",
                    port,
                    owners.client,
                    self.pools[slot].len()
                );
            }
            if owners.tunneled != peer_held[slot] {
                bail!(
                    "{} port: ledger credits the peer with {} buffers, peer holds {}",
                    port,
                    owners.tunneled,
                    peer_held[slot]
                );
            }
            if owners.component + owners.offload != self.allocated[slot] - self.pools[slot].len() - peer_held[slot] {
                bail!("{} port: {:?} with {} buffers out of the host", port, owners, self.allocated[slot]);
            }
        }
        Ok(())
    }

    /// Ledger snapshot with every callback sent before it recorded
    ///
    /// Only the component moves buffers to the host while this runs, so two
    /// snapshots with the same host count bracket a drained callback channel.
    fn settled_ledger(&mut self) -> Result<LedgerSnapshot> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let before = self.ledger()?;
            while self.step(Duration::ZERO)? {}
            let after = self.ledger()?;
            let settled = PortIndex::ALL
                .iter()
                .all(|&p| before.port(p).owners.client == after.port(p).owners.client);
            if settled {
                return Ok(before);
            }
            if Instant::now() >= deadline {
                bail!("ledger never settled: {:?}", after);
            }
        }
    }
}

/// Performance measurement utilities
pub mod perf_test {
    use std::time::{Duration, Instant};

    /// Frame throughput over a decode session
    pub struct Throughput {
        name: String,
        start: Instant,
        frames: u64,
    }

    impl Throughput {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                start: Instant::now(),
                frames: 0,
            }
        }

        pub fn frame(&mut self) {
            self.frames += 1;
        }

        pub fn elapsed(&self) -> Duration {
            self.start.elapsed()
        }

        pub fn fps(&self) -> f64 {
            hwvdec::utils::frame_rate(self.frames, self.elapsed())
        }

        pub fn report(&self) {
            println!("Throughput Report: {}", self.name);
            println!("  Frames: {}", self.frames);
            println!("  Elapsed: {}", hwvdec::utils::format_duration(self.elapsed()));
            println!("  FPS: {:.1}", self.fps());
        }
    }
}
