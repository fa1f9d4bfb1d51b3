//! Component ports
//!
//! A port is one data direction of the component: its negotiated format,
//! buffer-count policy, enable state, format epoch, metadata ring and the
//! buffers the component currently holds for it.

pub mod format;

pub use format::{ColorFormat, CompressionKind, FrameGeometry, PortFormat};

use crate::buffer::{BufferHeader, MetadataRing, PortIndex};
use crate::utils::config::PortConfig;
use crate::utils::error::{DecoderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Host-visible definition of a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDefinition {
    /// Port being described
    pub port: PortIndex,

    /// Whether the port exchanges buffers
    pub enabled: bool,

    /// Whether every slot of the pool exists
    pub populated: bool,

    /// Number of slots the pool must hold
    pub buffer_count_actual: usize,

    /// Smallest pool the component works with
    pub buffer_count_min: usize,

    /// Size of every slot in bytes
    pub buffer_size: usize,

    /// Negotiated format
    pub format: PortFormat,
}

/// Runtime state of one port
#[derive(Debug)]
pub struct Port {
    index: PortIndex,
    enabled: bool,
    allocated: usize,
    count_actual: usize,
    count_min: usize,
    buffer_size: usize,
    format: PortFormat,

    /// Format epoch; bumped every time the port is enabled
    epoch: u64,

    /// Format reported by reconfiguration and not yet renegotiated
    pending_format: Option<PortFormat>,

    /// Submission-order metadata of buffers held by the offload engine
    ring: MetadataRing,

    /// Buffers held by the component, oldest first
    parked: VecDeque<BufferHeader>,
}

impl Port {
    /// Create a port from configuration
    pub fn new(index: PortIndex, config: &PortConfig, format: PortFormat, ring_capacity: usize) -> Self {
        let required = format.required_buffer_size(index);
        let buffer_size = if config.buffer_size == 0 {
            required
        } else {
            config.buffer_size.max(required)
        };
        Self {
            index,
            enabled: true,
            allocated: 0,
            count_actual: config.buffer_count_actual,
            count_min: config.buffer_count_min,
            buffer_size,
            format,
            epoch: 0,
            pending_format: None,
            ring: MetadataRing::new(ring_capacity),
            parked: VecDeque::new(),
        }
    }

    pub fn index(&self) -> PortIndex {
        self.index
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn format(&self) -> PortFormat {
        self.format
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn count_actual(&self) -> usize {
        self.count_actual
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Snapshot for the host
    pub fn definition(&self) -> PortDefinition {
        PortDefinition {
            port: self.index,
            enabled: self.enabled,
            populated: self.is_populated(),
            buffer_count_actual: self.count_actual,
            buffer_count_min: self.count_min,
            buffer_size: self.buffer_size,
            format: self.format,
        }
    }

    /// Apply a host-supplied definition after validating it
    pub fn apply_definition(&mut self, def: &PortDefinition, max_buffers: usize) -> Result<()> {
        if def.port != self.index {
            return Err(DecoderError::BadPortIndex(format!(
                "definition for {} port applied to {} port",
                def.port, self.index
            )));
        }
        def.format.validate()?;
        if self.index == PortIndex::Input && !def.format.compression.is_codec() {
            return Err(DecoderError::BadParameter("input port needs a codec".to_string()));
        }
        if def.buffer_count_actual < self.count_min || def.buffer_count_actual > max_buffers {
            return Err(DecoderError::BadParameter(format!(
                "buffer count {} outside {}..={}",
                def.buffer_count_actual, self.count_min, max_buffers
            )));
        }
        let required = def.format.required_buffer_size(self.index);
        self.format = def.format;
        self.count_actual = def.buffer_count_actual;
        self.buffer_size = def.buffer_size.max(required);
        if self.pending_format == Some(def.format) {
            self.pending_format = None;
        }
        Ok(())
    }

    /// Adopt new dimensions, growing the buffer size when needed
    pub fn adopt_geometry(&mut self, geometry: FrameGeometry) {
        self.format.geometry = geometry;
        self.buffer_size = self.buffer_size.max(self.format.required_buffer_size(self.index));
    }

    /// Every slot of the pool exists
    pub fn is_populated(&self) -> bool {
        self.enabled && self.count_actual > 0 && self.allocated >= self.count_actual
    }

    /// No slot exists
    pub fn is_depopulated(&self) -> bool {
        self.allocated == 0
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn note_allocated(&mut self) {
        self.allocated += 1;
    }

    pub fn note_freed(&mut self) {
        self.allocated = self.allocated.saturating_sub(1);
    }

    /// Start a new format epoch
    pub fn begin_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Record a format the stream switched to
    pub fn mark_settings_changed(&mut self, format: PortFormat) {
        self.pending_format = Some(format);
    }

    /// The port is waiting for renegotiation
    pub fn settings_changed(&self) -> bool {
        self.pending_format.is_some()
    }

    pub fn pending_format(&self) -> Option<PortFormat> {
        self.pending_format
    }

    /// Clear the renegotiation marker
    pub fn clear_settings_changed(&mut self) {
        self.pending_format = None;
    }

    /// Take over the pending format as the negotiated one
    ///
    /// Used when the host re-enables the port without setting a definition.
    pub fn adopt_pending_format(&mut self) -> Option<PortFormat> {
        let format = self.pending_format.take()?;
        self.format = format;
        self.buffer_size = self.buffer_size.max(format.required_buffer_size(self.index));
        Some(format)
    }

    pub fn ring(&self) -> &MetadataRing {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut MetadataRing {
        &mut self.ring
    }

    /// Hold a buffer behind those already parked
    pub fn park(&mut self, buffer: BufferHeader) {
        self.parked.push_back(buffer);
    }

    /// Hold a buffer ahead of those already parked
    pub fn park_front(&mut self, buffer: BufferHeader) {
        self.parked.push_front(buffer);
    }

    /// Oldest parked buffer
    pub fn unpark(&mut self) -> Option<BufferHeader> {
        self.parked.pop_front()
    }

    /// Remove every parked buffer, oldest first
    pub fn unpark_all(&mut self) -> Vec<BufferHeader> {
        self.parked.drain(..).collect()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }
}
