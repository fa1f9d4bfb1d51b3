//! Channel-backed host callbacks
//!
//! Forwards every callback from the command-queue thread into a channel so
//! a host thread can react to it, including with synchronous calls that
//! must not be made from inside a callback.

use crate::buffer::BufferHeader;
use crate::component::{ComponentCallbacks, ComponentEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;

/// One callback, as seen by the host thread
#[derive(Debug)]
pub enum HostMessage {
    Event(ComponentEvent),
    EmptyBufferDone(BufferHeader),
    FillBufferDone(BufferHeader),
}

/// Callbacks that forward into a channel
#[derive(Debug, Clone)]
pub struct ChannelCallbacks {
    tx: Sender<HostMessage>,
}

impl ChannelCallbacks {
    /// Create the callbacks and the receiving end
    pub fn new() -> (Self, Receiver<HostMessage>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, message: HostMessage) {
        if let Err(e) = self.tx.send(message) {
            trace!("Host receiver gone, dropping {:?}", e.into_inner());
        }
    }
}

impl ComponentCallbacks for ChannelCallbacks {
    fn on_event(&mut self, event: ComponentEvent) {
        self.forward(HostMessage::Event(event));
    }

    fn empty_buffer_done(&mut self, buffer: BufferHeader) {
        self.forward(HostMessage::EmptyBufferDone(buffer));
    }

    fn fill_buffer_done(&mut self, buffer: BufferHeader) {
        self.forward(HostMessage::FillBufferDone(buffer));
    }
}
