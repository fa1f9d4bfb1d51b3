//! Simulated offload engine
//!
//! A software stand-in for the coprocessor, used by the demo binary and the
//! tests. It runs on its own worker thread, pairs every input with the next
//! free output buffer, fills the output with a synthetic frame and reports
//! both back through the [`CompletionSink`] exactly as a bridge callback
//! thread would. Decode latency is a timer, not a blocking sleep, so a
//! flush or stop arriving mid-frame takes the frame back unprocessed. Faults (fatal status, silence, back-pressure) can be
//! injected through [`SimulatedBehavior`].

pub mod host;

pub use host::{ChannelCallbacks, HostMessage};

use crate::buffer::{BufferFlags, BufferHandle, BufferHeader, PortIndex};
use crate::component::{StreamInfo, StreamInspector};
use crate::offload::params::{input_sequence, CreateSummary};
use crate::offload::{
    Completion, CompletionSink, ControlKind, ControlRequest, DecodedMetadata, OffloadEngine, OffloadFault,
    RejectReason, ResultStatus, SubmitOutcome, Submission,
};
use crate::port::{ColorFormat, CompressionKind, FrameGeometry};
use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Magic at the start of a synthetic sequence header
pub const SEQUENCE_HEADER_MAGIC: &[u8; 4] = b"SEQH";

/// Payload prefix the simulated engine decodes as corrupt
pub const CORRUPT_FRAME_MARKER: &[u8; 4] = b"BAD!";

/// Payload prefix of a partial frame: the input is consumed, no frame comes out
pub const PARTIAL_FRAME_MARKER: &[u8; 4] = b"PRT!";

/// Synthetic sequence header announcing `geometry`
pub fn sequence_header(geometry: FrameGeometry) -> Vec<u8> {
    let mut header = Vec::with_capacity(12);
    header.extend_from_slice(SEQUENCE_HEADER_MAGIC);
    header.extend_from_slice(&geometry.width.to_le_bytes());
    header.extend_from_slice(&geometry.height.to_le_bytes());
    header
}

/// Geometry announced by a synthetic sequence header
pub fn parse_sequence_header(payload: &[u8]) -> Option<FrameGeometry> {
    if payload.len() < 12 || &payload[..4] != SEQUENCE_HEADER_MAGIC {
        return None;
    }
    let width = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let height = u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]);
    Some(FrameGeometry::new(width, height))
}

/// Synthetic compressed frame
pub fn frame_payload(index: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (index as usize + i) as u8).collect()
}

/// Header inspector for synthetic streams
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticHeaderInspector;

impl StreamInspector for SyntheticHeaderInspector {
    fn inspect(&mut self, _codec: CompressionKind, buffer: &BufferHeader) -> Option<StreamInfo> {
        parse_sequence_header(buffer.payload()).map(|geometry| StreamInfo {
            geometry,
            compression: None,
        })
    }
}

/// Injected behaviour of the simulated engine
#[derive(Debug, Clone, Default)]
pub struct SimulatedBehavior {
    /// Time spent decoding each frame
    pub latency: Duration,

    /// Report a fatal status after this many decoded frames
    pub fail_after: Option<u64>,

    /// Never acknowledge control requests nor return buffers
    pub unresponsive: bool,

    /// Report sequence headers found in the stream through completions
    pub geometry_from_stream: bool,

    /// Refuse submissions beyond this many held buffers
    pub queue_limit: Option<usize>,

    /// Do not name the source input of decoded frames
    pub decode_order_only: bool,
}

/// One submission seen by the simulated engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub port: PortIndex,
    pub handle: BufferHandle,
    pub epoch: u64,
    pub sequence: u64,
    pub timestamp: i64,
}

/// Shared record of accepted submissions and control requests
#[derive(Debug, Clone, Default)]
pub struct SubmissionProbe {
    records: Arc<Mutex<Vec<SubmissionRecord>>>,
    controls: Arc<Mutex<Vec<ControlKind>>>,
}

impl SubmissionProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, record: SubmissionRecord) {
        self.records.lock().push(record);
    }

    fn record_control(&self, kind: ControlKind) {
        self.controls.lock().push(kind);
    }

    /// Control requests sent to the engine, oldest first
    pub fn controls(&self) -> Vec<ControlKind> {
        self.controls.lock().clone()
    }

    pub fn records(&self) -> Vec<SubmissionRecord> {
        self.records.lock().clone()
    }

    /// Submissions on `port`, oldest first
    pub fn for_port(&self, port: PortIndex) -> Vec<SubmissionRecord> {
        self.records.lock().iter().filter(|r| r.port == port).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
        self.controls.lock().clear();
    }
}

enum WorkerControl {
    Request(ControlRequest),
    Shutdown,
}

/// Software offload engine running on a worker thread
pub struct SimulatedOffloadEngine {
    behavior: SimulatedBehavior,
    probe: Option<SubmissionProbe>,
    held: Arc<AtomicUsize>,
    submissions: Option<Sender<Submission>>,
    controls: Option<Sender<WorkerControl>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SimulatedOffloadEngine {
    pub fn new(behavior: SimulatedBehavior) -> Self {
        Self {
            behavior,
            probe: None,
            held: Arc::new(AtomicUsize::new(0)),
            submissions: None,
            controls: None,
            worker: None,
        }
    }

    /// Record every accepted submission into `probe`
    pub fn with_probe(mut self, probe: SubmissionProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Buffers currently held by the engine
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }
}

impl Default for SimulatedOffloadEngine {
    fn default() -> Self {
        Self::new(SimulatedBehavior::default())
    }
}

impl OffloadEngine for SimulatedOffloadEngine {
    fn attach(&mut self, sink: CompletionSink) {
        let (submission_tx, submission_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let mut worker = Worker::new(self.behavior.clone(), sink, Arc::clone(&self.held));
        let spawned = thread::Builder::new()
            .name("hwvdec-sim-offload".to_string())
            .spawn(move || worker.run(submission_rx, control_rx));
        match spawned {
            Ok(handle) => {
                self.submissions = Some(submission_tx);
                self.controls = Some(control_tx);
                self.worker = Some(handle);
            }
            Err(e) => error!("Failed to start simulated offload worker: {}", e),
        }
    }

    fn submit(&mut self, submission: Submission) -> SubmitOutcome {
        let Some(tx) = &self.submissions else {
            return SubmitOutcome::Rejected {
                submission,
                reason: RejectReason::Unreachable,
            };
        };
        if let Some(limit) = self.behavior.queue_limit {
            if self.held.load(Ordering::Acquire) >= limit {
                return SubmitOutcome::Rejected {
                    submission,
                    reason: RejectReason::Busy,
                };
            }
        }
        let record = SubmissionRecord {
            port: submission.buffer.port(),
            handle: submission.buffer.handle(),
            epoch: submission.epoch,
            sequence: submission.sequence,
            timestamp: submission.buffer.timestamp,
        };
        self.held.fetch_add(1, Ordering::AcqRel);
        match tx.send(submission) {
            Ok(()) => {
                if let Some(probe) = &self.probe {
                    probe.record(record);
                }
                SubmitOutcome::Accepted
            }
            Err(e) => {
                self.held.fetch_sub(1, Ordering::AcqRel);
                SubmitOutcome::Rejected {
                    submission: e.into_inner(),
                    reason: RejectReason::Unreachable,
                }
            }
        }
    }

    fn control(&mut self, request: ControlRequest) -> Result<(), OffloadFault> {
        let tx = self
            .controls
            .as_ref()
            .ok_or_else(|| OffloadFault::Unreachable("worker not attached".to_string()))?;
        let kind = request.kind();
        tx.send(WorkerControl::Request(request))
            .map_err(|_| OffloadFault::Unreachable("worker stopped".to_string()))?;
        if let Some(probe) = &self.probe {
            probe.record_control(kind);
        }
        Ok(())
    }
}

impl Drop for SimulatedOffloadEngine {
    fn drop(&mut self) {
        self.submissions = None;
        if let Some(tx) = self.controls.take() {
            let _ = tx.send(WorkerControl::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Worker {
    behavior: SimulatedBehavior,
    sink: CompletionSink,
    held: Arc<AtomicUsize>,
    inputs: VecDeque<Submission>,
    outputs: VecDeque<Submission>,
    running: bool,

    /// When the frame at the head of the queue finishes decoding
    ready_at: Option<Instant>,

    geometry: FrameGeometry,
    color: ColorFormat,
    decoded: u64,
    failed: bool,
}

impl Worker {
    fn new(behavior: SimulatedBehavior, sink: CompletionSink, held: Arc<AtomicUsize>) -> Self {
        Self {
            behavior,
            sink,
            held,
            inputs: VecDeque::new(),
            outputs: VecDeque::new(),
            running: false,
            ready_at: None,
            geometry: FrameGeometry::default(),
            color: ColorFormat::Yuv420Planar,
            decoded: 0,
            failed: false,
        }
    }

    fn run(&mut self, submissions: Receiver<Submission>, controls: Receiver<WorkerControl>) {
        debug!("Simulated offload worker started");
        loop {
            let timer = match self.ready_at {
                Some(at) => after(at.saturating_duration_since(Instant::now())),
                None => never(),
            };
            select! {
                recv(timer) -> _ => {}
                recv(submissions) -> message => match message {
                    Ok(submission) => self.accept(submission),
                    Err(_) => break,
                },
                recv(controls) -> message => match message {
                    Ok(WorkerControl::Request(request)) => {
                        // Submissions sent before the request are handled first
                        for submission in submissions.try_iter() {
                            self.accept(submission);
                        }
                        self.control(request);
                    }
                    Ok(WorkerControl::Shutdown) | Err(_) => break,
                },
            }
            self.decode();
        }
        let dropped = self.inputs.len() + self.outputs.len();
        if dropped > 0 {
            debug!("Simulated offload worker exits holding {} buffers", dropped);
        }
    }

    fn accept(&mut self, submission: Submission) {
        match submission.buffer.port() {
            PortIndex::Input => self.inputs.push_back(submission),
            PortIndex::Output => self.outputs.push_back(submission),
        }
    }

    fn control(&mut self, request: ControlRequest) {
        let kind = request.kind();
        if self.behavior.unresponsive {
            warn!("Simulated engine ignoring {}", kind);
            return;
        }
        trace!("Simulated engine control {}", kind);
        let result = match request {
            ControlRequest::Create(params) => match CreateSummary::decode(&params.block) {
                Ok(summary) => {
                    info!(
                        "Simulated engine created for {} ({} in / {} out buffers)",
                        summary.geometry, params.input_buffers, params.output_buffers
                    );
                    self.geometry = summary.geometry;
                    self.color = summary.color;
                    Ok(())
                }
                Err(e) => Err(OffloadFault::Internal(e.to_string())),
            },
            ControlRequest::Start | ControlRequest::Resume => {
                self.running = true;
                Ok(())
            }
            ControlRequest::Pause | ControlRequest::Stop => {
                self.running = false;
                self.ready_at = None;
                Ok(())
            }
            ControlRequest::Flush(port) => {
                self.flush(port);
                Ok(())
            }
            ControlRequest::Destroy => {
                self.running = false;
                self.flush(PortIndex::Input);
                self.flush(PortIndex::Output);
                Ok(())
            }
        };
        self.sink.acknowledge(kind, result);
    }

    fn flush(&mut self, port: PortIndex) {
        // The frame being decoded needs both sides, so either flush aborts it
        self.ready_at = None;
        let queue = match port {
            PortIndex::Input => &mut self.inputs,
            PortIndex::Output => &mut self.outputs,
        };
        let held: Vec<Submission> = queue.drain(..).collect();
        for submission in held {
            let mut buffer = submission.buffer;
            if port == PortIndex::Output {
                buffer.filled_len = 0;
            }
            self.complete(Completion::new(buffer, ResultStatus::FLUSHED));
        }
    }

    fn complete(&mut self, completion: Completion) {
        self.held.fetch_sub(1, Ordering::AcqRel);
        if !self.sink.complete(completion) {
            debug!("Component gone, dropping completion");
        }
    }

    fn decode(&mut self) {
        if !self.running || self.behavior.unresponsive || self.failed {
            return;
        }
        while let Some(input) = self.inputs.front() {
            let flags = input.buffer.flags;
            let payload = input.buffer.payload();
            let header = parse_sequence_header(payload);
            let partial = payload.starts_with(PARTIAL_FRAME_MARKER);
            let needs_output = !flags.contains(BufferFlags::CODEC_CONFIG) && header.is_none() && !partial;
            if needs_output && self.outputs.is_empty() {
                return;
            }
            if needs_output && !self.behavior.latency.is_zero() {
                match self.ready_at {
                    None => {
                        self.ready_at = Some(Instant::now() + self.behavior.latency);
                        return;
                    }
                    Some(at) if Instant::now() < at => return,
                    Some(_) => self.ready_at = None,
                }
            }
            let Some(input) = self.inputs.pop_front() else {
                return;
            };

            if let Some(limit) = self.behavior.fail_after {
                if self.decoded >= limit {
                    error!("Simulated engine failing after {} frames", self.decoded);
                    self.failed = true;
                    self.complete(Completion::new(input.buffer, ResultStatus::FATAL));
                    return;
                }
            }

            let sequence = input_sequence(&input.params).unwrap_or(input.sequence);
            if let Some(geometry) = header {
                let mut completion = Completion::new(input.buffer, ResultStatus::OK);
                if self.behavior.geometry_from_stream {
                    completion.decoded.geometry = Some(geometry);
                }
                self.complete(completion);
                continue;
            }
            if partial {
                trace!("Partial frame at sequence {}, nothing decoded", sequence);
                self.complete(Completion::new(input.buffer, ResultStatus::INSUFFICIENT_DATA));
                continue;
            }
            if !needs_output {
                self.complete(Completion::new(input.buffer, ResultStatus::OK));
                continue;
            }
            let Some(output) = self.outputs.pop_front() else {
                return;
            };
            self.decode_frame(input, output, sequence);
        }
    }

    fn decode_frame(&mut self, input: Submission, output: Submission, sequence: u64) {
        let payload = input.buffer.payload();
        let eos = input.buffer.flags.contains(BufferFlags::EOS);
        let mut status = ResultStatus::OK;
        let mut frame = output.buffer;

        if eos && payload.is_empty() {
            frame.filled_len = 0;
            status = status.with(ResultStatus::END_OF_STREAM);
        } else {
            let size = self.color.frame_size(self.geometry).min(frame.capacity());
            let data = frame.data_mut();
            for (i, byte) in data[..size].iter_mut().enumerate() {
                *byte = (sequence as usize + i) as u8;
            }
            frame.offset = 0;
            frame.filled_len = size;
            if payload.starts_with(CORRUPT_FRAME_MARKER) {
                status = status.with(ResultStatus::CORRUPT);
            }
            if eos {
                status = status.with(ResultStatus::END_OF_STREAM);
            }
        }
        if self.decoded == 0 {
            status = status.with(ResultStatus::SYNC_FRAME);
        }
        self.decoded += 1;

        self.complete(Completion::new(input.buffer, ResultStatus::OK));
        let decoded = DecodedMetadata {
            source_sequence: (!self.behavior.decode_order_only).then_some(sequence),
            ..DecodedMetadata::default()
        };
        self.complete(Completion {
            buffer: frame,
            status,
            decoded,
        });
    }
}
