//! Buffer descriptors and ownership bookkeeping
//!
//! A [`BufferHeader`] is the single physical carrier of one buffer slot: the
//! storage travels with whoever currently owns the buffer, while the
//! [`ledger::BufferLedger`] records the owner for every registered handle.

pub mod ledger;
pub mod mark;
pub mod metadata;

pub use ledger::{BufferLedger, OwnerCounts};
pub use mark::{ComponentId, Mark, PendingMarks};
pub use metadata::{DecodeOrderQueue, FrameTag, MetadataEntry, MetadataRing};

use crate::utils::error::{DecoderError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Unique identifier of a buffer slot within one decoder instance
///
/// Handles are never reused, so a handle from a depopulated pool is simply
/// unknown to the ledger afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferHandle(u32);

impl BufferHandle {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Data direction of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortIndex {
    /// Compressed bitstream from the host
    Input = 0,

    /// Decoded frames to the host
    Output = 1,
}

impl PortIndex {
    /// Both ports in notification order
    pub const ALL: [PortIndex; 2] = [PortIndex::Input, PortIndex::Output];

    /// Index into per-port arrays
    pub fn slot(self) -> usize {
        self as usize
    }

    /// Resolve a raw host-supplied port number
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(PortIndex::Input),
            1 => Ok(PortIndex::Output),
            other => Err(DecoderError::BadPortIndex(format!("no port {}", other))),
        }
    }
}

impl fmt::Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortIndex::Input => write!(f, "input"),
            PortIndex::Output => write!(f, "output"),
        }
    }
}

/// Port argument of Flush, PortDisable and PortEnable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSelector {
    Port(PortIndex),
    All,
}

impl PortSelector {
    /// Ports addressed by this selector, input first
    pub fn ports(self) -> Vec<PortIndex> {
        match self {
            PortSelector::Port(port) => vec![port],
            PortSelector::All => PortIndex::ALL.to_vec(),
        }
    }
}

impl From<PortIndex> for PortSelector {
    fn from(port: PortIndex) -> Self {
        PortSelector::Port(port)
    }
}

/// Party currently holding a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BufferOwner {
    /// The host media pipeline
    Client,

    /// This component, parked or in transit on the command-queue thread
    Component,

    /// The offload engine (coprocessor)
    OffloadEngine,

    /// A tunneled peer component
    TunneledPeer,
}

/// Buffer flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const EOS: BufferFlags = BufferFlags(0x0000_0001);
    pub const START_TIME: BufferFlags = BufferFlags(0x0000_0002);
    pub const DECODE_ONLY: BufferFlags = BufferFlags(0x0000_0004);
    pub const DATA_CORRUPT: BufferFlags = BufferFlags(0x0000_0008);
    pub const END_OF_FRAME: BufferFlags = BufferFlags(0x0000_0010);
    pub const SYNC_FRAME: BufferFlags = BufferFlags(0x0000_0020);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(0x0000_0080);

    /// Flags that follow a frame from its input buffer to its output buffer
    pub const PROPAGATED: BufferFlags = BufferFlags(0x0000_0001 | 0x0000_0002 | 0x0000_0004);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }

    pub fn intersection(&self, other: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 & other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

/// One buffer slot: descriptor fields plus its storage
///
/// Headers are created only by the component (at port population) and are
/// not `Clone`, so holding a header is proof of physical possession.
pub struct BufferHeader {
    /// Slot identity
    handle: BufferHandle,

    /// Port this slot belongs to
    port: PortIndex,

    /// Storage, `len()` is the allocated capacity
    data: Vec<u8>,

    /// Valid bytes starting at `offset`
    pub filled_len: usize,

    /// Start of valid bytes
    pub offset: usize,

    /// Buffer flags
    pub flags: BufferFlags,

    /// Presentation timestamp in microseconds
    pub timestamp: i64,

    /// Mark carried by this buffer
    pub mark: Option<Mark>,

    /// Opaque host value returned untouched
    pub app_private: u64,

    /// Format epoch of the pool this slot was created in
    epoch: u64,
}

impl BufferHeader {
    pub(crate) fn new(handle: BufferHandle, port: PortIndex, data: Vec<u8>, epoch: u64) -> Self {
        Self {
            handle,
            port,
            data,
            filled_len: 0,
            offset: 0,
            flags: BufferFlags::NONE,
            timestamp: 0,
            mark: None,
            app_private: 0,
            epoch,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn port(&self) -> PortIndex {
        self.port
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Allocated size of the storage
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The valid bytes of the buffer
    pub fn payload(&self) -> &[u8] {
        let start = self.offset.min(self.data.len());
        let end = (start + self.filled_len).min(self.data.len());
        &self.data[start..end]
    }

    /// Copy `bytes` into the buffer from offset zero
    pub fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.data.len() {
            return Err(DecoderError::BadParameter(format!(
                "{} bytes do not fit in {} of capacity {}",
                bytes.len(),
                self.handle,
                self.data.len()
            )));
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.offset = 0;
        self.filled_len = bytes.len();
        Ok(())
    }

    /// Set the number of valid bytes written by a producer
    pub fn set_filled_len(&mut self, len: usize) -> Result<()> {
        if self.offset + len > self.data.len() {
            return Err(DecoderError::BadParameter(format!(
                "filled length {} exceeds capacity of {}",
                len, self.handle
            )));
        }
        self.filled_len = len;
        Ok(())
    }

    /// Reset descriptor fields before handing an empty buffer out again
    pub fn clear(&mut self) {
        self.filled_len = 0;
        self.offset = 0;
        self.flags = BufferFlags::NONE;
        self.mark = None;
    }

    /// Give the storage back, consuming the header
    pub(crate) fn into_storage(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("handle", &self.handle)
            .field("port", &self.port)
            .field("capacity", &self.data.len())
            .field("filled_len", &self.filled_len)
            .field("flags", &self.flags)
            .field("timestamp", &self.timestamp)
            .field("epoch", &self.epoch)
            .finish()
    }
}
