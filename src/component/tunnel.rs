//! Tunneled ports
//!
//! A port may be connected to a peer component. While the component is
//! streaming, buffers it is done with go to the peer instead of the host:
//! decoded frames to a downstream sink, consumed inputs back to an upstream
//! source for refilling. The peer hands each buffer back through a
//! [`TunnelReturn`] and it re-enters the port like a host submission.
//!
//! Buffers given back by a flush, a port disable or a state change go to
//! the host. The host populated the port and is the only party that frees
//! its buffers, so a peer returning a buffer outside Executing/Pause sends
//! it on to the host as well.

use super::queue::QueueHandle;
use crate::buffer::{BufferHeader, PortIndex};
use crate::port::{CompressionKind, PortFormat};
use crate::utils::error::{DecoderError, Result};
use std::fmt;

/// The component on the other end of a tunnel
pub trait TunnelPeer: Send {
    /// Compression of the peer's connected port
    fn compression(&self) -> CompressionKind;

    /// Take a buffer this component is done with
    ///
    /// Called on the command-queue thread; must not block on the component.
    fn deliver(&mut self, buffer: BufferHeader);
}

/// A connected peer as held by the engine
pub struct TunnelLink(Box<dyn TunnelPeer>);

impl TunnelLink {
    pub(super) fn new(peer: Box<dyn TunnelPeer>) -> Self {
        Self(peer)
    }

    pub(super) fn peer(&self) -> &dyn TunnelPeer {
        self.0.as_ref()
    }

    pub(super) fn deliver(&mut self, buffer: BufferHeader) {
        self.0.deliver(buffer);
    }
}

impl fmt::Debug for TunnelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelLink({})", self.0.compression())
    }
}

/// Return path of a tunnel, held by the peer
#[derive(Debug, Clone)]
pub struct TunnelReturn {
    port: PortIndex,
    handle: QueueHandle,
}

impl TunnelReturn {
    pub(super) fn new(port: PortIndex, handle: QueueHandle) -> Self {
        Self { port, handle }
    }

    /// Port this tunnel is connected to
    pub fn port(&self) -> PortIndex {
        self.port
    }

    /// Hand a delivered buffer back to the component
    ///
    /// Output buffers come back emptied. The buffer is returned as the error
    /// when it belongs to another port or the component is gone.
    pub fn give_back(&self, mut buffer: BufferHeader) -> std::result::Result<(), BufferHeader> {
        if buffer.port() != self.port {
            return Err(buffer);
        }
        if self.port == PortIndex::Output {
            buffer.clear();
        }
        self.handle.give_back(buffer)
    }
}

/// A peer must carry the format of the port it connects to
pub(super) fn verify(port: PortIndex, format: &PortFormat, peer: &dyn TunnelPeer) -> Result<()> {
    if peer.compression() != format.compression {
        return Err(DecoderError::PortsNotCompatible(format!(
            "{} port carries {}, peer carries {}",
            port,
            format.compression,
            peer.compression()
        )));
    }
    Ok(())
}
