//! Buffer marks
//!
//! A mark is an opaque host token that rides on a buffer through the
//! pipeline and is echoed back once the marked buffer has been consumed by
//! the component it targets.

use super::BufferHeader;
use crate::utils::error::{DecoderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Maximum number of queued marks per port
pub const MAX_PENDING_MARKS: usize = 256;

/// Identity of a component instance in a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId(pub u32);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component#{}", self.0)
    }
}

/// Opaque mark token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Mark {
    /// Component that echoes the mark
    pub target: ComponentId,

    /// Host data returned with the echo
    pub data: u64,
}

/// FIFO of marks waiting for an eligible buffer
#[derive(Debug)]
pub struct PendingMarks {
    marks: VecDeque<Mark>,
    capacity: usize,
}

impl Default for PendingMarks {
    fn default() -> Self {
        Self::new(MAX_PENDING_MARKS)
    }
}

impl PendingMarks {
    pub fn new(capacity: usize) -> Self {
        Self {
            marks: VecDeque::new(),
            capacity,
        }
    }

    /// Queue a mark
    pub fn push(&mut self, mark: Mark) -> Result<()> {
        if self.marks.len() >= self.capacity {
            return Err(DecoderError::InsufficientResources(format!(
                "mark queue full ({} pending)",
                self.capacity
            )));
        }
        self.marks.push_back(mark);
        Ok(())
    }

    /// Attach the oldest pending mark to `buffer` if it carries none
    ///
    /// Returns true when a mark was attached.
    pub fn attach(&mut self, buffer: &mut BufferHeader) -> bool {
        if buffer.mark.is_some() {
            return false;
        }
        match self.marks.pop_front() {
            Some(mark) => {
                buffer.mark = Some(mark);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn clear(&mut self) {
        self.marks.clear();
    }
}
