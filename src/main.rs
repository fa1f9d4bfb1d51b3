use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use env_logger::Env;
use hwvdec::simulated::{
    frame_payload, sequence_header, ChannelCallbacks, HostMessage, SimulatedBehavior, SimulatedOffloadEngine,
    SyntheticHeaderInspector,
};
use hwvdec::utils::{format_duration, frame_rate, load_config};
use hwvdec::{
    BufferFlags, BufferHeader, Command, CommandData, CommandKind, ComponentEvent, ComponentState, CompressionKind,
    Config, DecoderInstance, EngineStats, FrameGeometry, PortIndex, PortSelector,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// hwvdec - drive the decoder component against the simulated offload engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of frames to decode
    #[arg(short, long, default_value = "120")]
    frames: u64,

    /// Initial frame width
    #[arg(long)]
    width: Option<u32>,

    /// Initial frame height
    #[arg(long)]
    height: Option<u32>,

    /// Compressed format (h264, mpeg4, h263, mpeg2, wmv)
    #[arg(short, long)]
    codec: Option<String>,

    /// Switch the stream to 1280x720 before this frame
    #[arg(long, value_name = "FRAME")]
    resize_at: Option<u64>,

    /// Simulated decode time per frame in milliseconds
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Configuration file (defaults to the system/user config)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// How long the host waits for any callback before giving up
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => load_config()?,
    };
    if let Some(width) = args.width {
        config.component.width = width;
    }
    if let Some(height) = args.height {
        config.component.height = height;
    }
    if let Some(codec) = &args.codec {
        config.component.codec = codec.parse::<CompressionKind>()?;
    }
    config.validate()?;

    // Initialize logging
    let log_level = if args.debug { "debug" } else { config.general.log_level.as_str() };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting hwvdec v{}", env!("CARGO_PKG_VERSION"));

    let behavior = SimulatedBehavior {
        latency: Duration::from_millis(args.latency_ms),
        ..SimulatedBehavior::default()
    };
    let (callbacks, rx) = ChannelCallbacks::new();
    let instance = DecoderInstance::builder(config.clone())
        .with_offload(SimulatedOffloadEngine::new(behavior))
        .with_inspector(SyntheticHeaderInspector)
        .with_callbacks(callbacks)
        .build()?;

    let mut session = Session::new(&instance, rx, &args);
    let started = Instant::now();
    let result = session.run();
    let elapsed = started.elapsed();
    let (frames_out, settings_changes) = (session.frames_out, session.settings_changes);
    drop(session);

    let stats = instance.stats()?;
    instance.teardown()?;
    result?;

    let report = Report {
        codec: config.component.codec.to_string(),
        frames_decoded: frames_out,
        reconfigurations: settings_changes,
        elapsed: format_duration(elapsed),
        fps: frame_rate(frames_out, elapsed),
        stats,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} frames in {} ({:.1} fps), {} reconfigurations, {} corrupt",
            report.frames_decoded,
            report.elapsed,
            report.fps,
            report.reconfigurations,
            report.stats.corrupt_frames
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct Report {
    codec: String,
    frames_decoded: u64,
    reconfigurations: u64,
    elapsed: String,
    fps: f64,
    stats: EngineStats,
}

/// Host side of one decoding session
struct Session<'a> {
    instance: &'a DecoderInstance,
    rx: Receiver<HostMessage>,
    frames: u64,
    resize_at: Option<u64>,

    /// Buffers currently held by the host, per port
    idle: [Vec<BufferHeader>; 2],

    /// Buffers that exist, per port
    allocated: [usize; 2],

    /// Ports being renegotiated
    renegotiating: [bool; 2],

    next_frame: u64,
    header_sent: bool,
    eos_sent: bool,
    eos_seen: bool,
    frames_out: u64,
    settings_changes: u64,
}

impl<'a> Session<'a> {
    fn new(instance: &'a DecoderInstance, rx: Receiver<HostMessage>, args: &Args) -> Self {
        Self {
            instance,
            rx,
            frames: args.frames,
            resize_at: args.resize_at,
            idle: [Vec::new(), Vec::new()],
            allocated: [0, 0],
            renegotiating: [false, false],
            next_frame: 0,
            header_sent: false,
            eos_sent: false,
            eos_seen: false,
            frames_out: 0,
            settings_changes: 0,
        }
    }

    fn run(&mut self) -> Result<()> {
        self.instance.send_command(Command::SetState(ComponentState::Idle))?;
        for port in PortIndex::ALL {
            self.populate(port)?;
        }
        self.wait_state(ComponentState::Idle)?;

        self.instance.send_command(Command::SetState(ComponentState::Executing))?;
        self.wait_state(ComponentState::Executing)?;
        self.pump()?;

        while !self.eos_seen {
            let message = self.next()?;
            self.handle(message)?;
        }
        info!("End of stream after {} frames", self.frames_out);

        self.instance.send_command(Command::SetState(ComponentState::Idle))?;
        self.wait_state(ComponentState::Idle)?;
        self.instance.send_command(Command::SetState(ComponentState::Loaded))?;
        for port in PortIndex::ALL {
            self.free_idle(port)?;
        }
        while self.allocated.iter().any(|&n| n > 0) {
            let message = self.next()?;
            self.handle(message)?;
            for port in PortIndex::ALL {
                self.free_idle(port)?;
            }
        }
        self.wait_state(ComponentState::Loaded)
    }

    fn next(&self) -> Result<HostMessage> {
        self.rx
            .recv_timeout(CALLBACK_TIMEOUT)
            .map_err(|_| anyhow!("no callback from the component in {:?}", CALLBACK_TIMEOUT))
    }

    /// Process callbacks until the component reports `state`
    fn wait_state(&mut self, state: ComponentState) -> Result<()> {
        loop {
            match self.next()? {
                HostMessage::Event(ComponentEvent::CommandComplete {
                    command: CommandKind::SetState,
                    data: CommandData::State(reached),
                }) if reached == state => return Ok(()),
                other => self.handle(other)?,
            }
        }
    }

    fn populate(&mut self, port: PortIndex) -> Result<()> {
        let definition = self.instance.port_definition(port)?;
        for i in 0..definition.buffer_count_actual {
            let buffer = self.instance.allocate_buffer(port, definition.buffer_size, i as u64)?;
            self.idle[port.slot()].push(buffer);
            self.allocated[port.slot()] += 1;
        }
        debug!(
            "{} port populated with {} x {} bytes",
            port, definition.buffer_count_actual, definition.buffer_size
        );
        Ok(())
    }

    fn free_idle(&mut self, port: PortIndex) -> Result<()> {
        for buffer in self.idle[port.slot()].drain(..) {
            self.instance.free_buffer(buffer).map_err(|e| anyhow!("free: {}", e))?;
            self.allocated[port.slot()] -= 1;
        }
        Ok(())
    }

    fn handle(&mut self, message: HostMessage) -> Result<()> {
        match message {
            HostMessage::EmptyBufferDone(buffer) => self.idle[PortIndex::Input.slot()].push(buffer),
            HostMessage::FillBufferDone(buffer) => {
                if buffer.filled_len > 0 {
                    self.frames_out += 1;
                }
                if buffer.flags.contains(BufferFlags::EOS) {
                    self.eos_seen = true;
                }
                self.idle[PortIndex::Output.slot()].push(buffer);
            }
            HostMessage::Event(event) => self.on_event(event)?,
        }
        for port in PortIndex::ALL {
            if self.renegotiating[port.slot()] {
                self.renegotiate(port)?;
            }
        }
        self.pump()
    }

    fn on_event(&mut self, event: ComponentEvent) -> Result<()> {
        match event {
            ComponentEvent::PortSettingsChanged { port, format } => {
                info!("{} port now {} {}", port, format.compression, format.geometry);
                self.settings_changes += 1;
                self.renegotiating[port.slot()] = true;
            }
            ComponentEvent::Error {
                kind,
                severity,
                message,
                ..
            } => {
                error!("{:?} ({:?}): {}", kind, severity, message);
                if self.instance.state() == ComponentState::Invalid {
                    bail!("component entered Invalid: {}", message);
                }
            }
            other => debug!("Event: {:?}", other),
        }
        Ok(())
    }

    /// Free the stale pool of `port`; once empty, re-enable and repopulate it
    fn renegotiate(&mut self, port: PortIndex) -> Result<()> {
        self.free_idle(port)?;
        if self.allocated[port.slot()] > 0 {
            return Ok(());
        }
        self.renegotiating[port.slot()] = false;
        self.instance.send_command(Command::PortEnable(PortSelector::Port(port)))?;
        self.populate(port)
    }

    /// Hand idle buffers back to the component
    fn pump(&mut self) -> Result<()> {
        let state = self.instance.state();
        if !matches!(state, ComponentState::Executing | ComponentState::Pause) {
            return Ok(());
        }
        if !self.renegotiating[PortIndex::Output.slot()] {
            for buffer in self.idle[PortIndex::Output.slot()].drain(..).collect::<Vec<_>>() {
                if let Err(rejected) = self.instance.return_output_buffer(buffer) {
                    debug!("Output buffer held back: {}", rejected.error);
                    self.idle[PortIndex::Output.slot()].push(rejected.buffer);
                    break;
                }
            }
        }
        while !self.renegotiating[PortIndex::Input.slot()] && !self.eos_sent {
            let Some(mut buffer) = self.idle[PortIndex::Input.slot()].pop() else {
                break;
            };
            self.fill_input(&mut buffer)?;
            if let Err(rejected) = self.instance.submit_input_buffer(buffer) {
                warn!("Input buffer held back: {}", rejected.error);
                self.idle[PortIndex::Input.slot()].push(rejected.buffer);
                break;
            }
        }
        Ok(())
    }

    fn fill_input(&mut self, buffer: &mut BufferHeader) -> Result<()> {
        buffer.flags = BufferFlags::NONE;
        if self.resize_at == Some(self.next_frame) && !self.header_sent {
            self.header_sent = true;
            buffer.fill(&sequence_header(FrameGeometry::new(1280, 720)))?;
            buffer.flags.insert(BufferFlags::CODEC_CONFIG);
            return Ok(());
        }
        if self.next_frame >= self.frames {
            self.eos_sent = true;
            buffer.fill(&[])?;
            buffer.flags.insert(BufferFlags::EOS);
            return Ok(());
        }
        let payload = frame_payload(self.next_frame, 4096.min(buffer.capacity()));
        buffer.fill(&payload)?;
        buffer.timestamp = self.next_frame as i64 * 33_333;
        self.next_frame += 1;
        Ok(())
    }
}
