//! Per-port metadata ring and decode-order tags
//!
//! The offload engine does not preserve per-buffer metadata, so timestamp,
//! flags and marks are recorded here in submission order and restored when
//! the buffer comes back.

use super::{BufferFlags, BufferHandle, Mark};
use crate::utils::error::{DecoderError, Result};
use log::warn;
use std::collections::VecDeque;

/// Metadata captured when a buffer is submitted to the offload engine
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    /// Slot the entry belongs to
    pub handle: BufferHandle,

    /// Submission sequence number
    pub sequence: u64,

    /// Timestamp at submission
    pub timestamp: i64,

    /// Flags at submission
    pub flags: BufferFlags,

    /// Mark carried at submission
    pub mark: Option<Mark>,
}

/// Ring statistics
#[derive(Debug, Clone, Default)]
pub struct RingStats {
    /// Entries recorded
    pub pushed: u64,

    /// Entries consumed by completions
    pub consumed: u64,

    /// Completions that did not match the oldest entry
    pub out_of_order: u64,

    /// Entries discarded by resets
    pub discarded: u64,

    /// Deepest occupancy observed
    pub max_depth: usize,
}

/// Bounded circular record of in-flight buffer metadata, oldest first
#[derive(Debug)]
pub struct MetadataRing {
    entries: VecDeque<MetadataEntry>,
    capacity: usize,
    stats: RingStats,
}

impl MetadataRing {
    /// Create a ring holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            stats: RingStats::default(),
        }
    }

    /// Record a submission
    pub fn push(&mut self, entry: MetadataEntry) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(DecoderError::InsufficientResources(format!(
                "metadata ring full ({} entries)",
                self.capacity
            )));
        }
        self.entries.push_back(entry);
        self.stats.pushed += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.entries.len());
        Ok(())
    }

    /// Remove and return the entry recorded for `handle`
    pub fn take(&mut self, handle: BufferHandle) -> Option<MetadataEntry> {
        let position = self.entries.iter().position(|e| e.handle == handle)?;
        if position != 0 {
            warn!("{} returned ahead of {} older submissions", handle, position);
            self.stats.out_of_order += 1;
        }
        self.stats.consumed += 1;
        self.entries.remove(position)
    }

    /// Oldest entry without removing it
    pub fn peek(&self) -> Option<&MetadataEntry> {
        self.entries.front()
    }

    /// Drop every entry, returning how many were discarded
    pub fn reset(&mut self) -> usize {
        let discarded = self.entries.len();
        self.entries.clear();
        self.stats.discarded += discarded as u64;
        discarded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }
}

/// Metadata a decoded frame inherits from the input that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTag {
    /// Submission sequence of the source input
    pub sequence: u64,

    /// Timestamp of the source input
    pub timestamp: i64,

    /// Propagated flags of the source input
    pub flags: BufferFlags,

    /// Mark travelling downstream with the frame
    pub mark: Option<Mark>,
}

/// Decode-order queue of frame tags
#[derive(Debug, Default)]
pub struct DecodeOrderQueue {
    tags: VecDeque<FrameTag>,
}

impl DecodeOrderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: FrameTag) {
        self.tags.push_back(tag);
    }

    /// Tag for the next decoded frame
    ///
    /// When the engine names the source submission that tag is used, otherwise
    /// tags are consumed in decode order.
    pub fn next_for(&mut self, source_sequence: Option<u64>) -> Option<FrameTag> {
        if let Some(sequence) = source_sequence {
            if let Some(position) = self.tags.iter().position(|t| t.sequence == sequence) {
                return self.tags.remove(position);
            }
            warn!("No frame tag for source sequence {}, using decode order", sequence);
        }
        self.tags.pop_front()
    }

    /// Take back the tag of an input that will not be decoded
    pub fn remove_sequence(&mut self, sequence: u64) -> Option<FrameTag> {
        let position = self.tags.iter().position(|t| t.sequence == sequence)?;
        self.tags.remove(position)
    }

    /// Drop the tag of an input that was consumed without producing a frame
    ///
    /// End of stream and a downstream mark move on to the following tag. A
    /// last tag carrying either stays queued for the next frame. Returns
    /// whether a tag was dropped.
    pub fn discard(&mut self, sequence: u64) -> bool {
        let Some(position) = self.tags.iter().position(|t| t.sequence == sequence) else {
            return false;
        };
        let tag = &self.tags[position];
        let carries = tag.flags.contains(BufferFlags::EOS) || tag.mark.is_some();
        if carries && position + 1 == self.tags.len() {
            return false;
        }
        let Some(tag) = self.tags.remove(position) else {
            return false;
        };
        if let Some(next) = self.tags.get_mut(position) {
            next.flags.insert(tag.flags.intersection(BufferFlags::EOS));
            if next.mark.is_none() {
                next.mark = tag.mark;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
