//! Buffer ownership ledger
//!
//! Single source of truth for who holds each buffer slot. Only the
//! command-queue thread mutates it; every transfer names the owner it
//! expects to take the buffer from.

use super::{BufferHandle, BufferOwner, PortIndex};
use crate::utils::error::{DecoderError, Result};
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-owner buffer counts for one port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OwnerCounts {
    pub client: usize,
    pub component: usize,
    pub offload: usize,
    pub tunneled: usize,
}

impl OwnerCounts {
    /// Sum over all owners
    pub fn total(&self) -> usize {
        self.client + self.component + self.offload + self.tunneled
    }

    fn bump(&mut self, owner: BufferOwner) {
        match owner {
            BufferOwner::Client => self.client += 1,
            BufferOwner::Component => self.component += 1,
            BufferOwner::OffloadEngine => self.offload += 1,
            BufferOwner::TunneledPeer => self.tunneled += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    port: PortIndex,
    owner: BufferOwner,
}

/// Ownership ledger for every registered buffer slot
#[derive(Debug, Default)]
pub struct BufferLedger {
    /// Registered slots, ordered by handle
    entries: BTreeMap<BufferHandle, LedgerEntry>,

    /// Number of ownership transfers performed
    transfers: u64,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly created slot
    pub fn register(&mut self, handle: BufferHandle, port: PortIndex, owner: BufferOwner) -> Result<()> {
        if self.entries.contains_key(&handle) {
            return Err(DecoderError::BadParameter(format!("{} already registered", handle)));
        }
        self.entries.insert(handle, LedgerEntry { port, owner });
        debug!("Registered {} on {} port, owner {:?}", handle, port, owner);
        Ok(())
    }

    /// Forget a slot being destroyed; it must be held by `expected`
    pub fn unregister(&mut self, handle: BufferHandle, expected: BufferOwner) -> Result<PortIndex> {
        let entry = self.entries.get(&handle).copied().ok_or(DecoderError::UnknownBuffer(handle))?;
        if entry.owner != expected {
            return Err(DecoderError::OwnershipViolation {
                handle,
                expected,
                actual: entry.owner,
            });
        }
        self.entries.remove(&handle);
        debug!("Unregistered {} from {} port", handle, entry.port);
        Ok(entry.port)
    }

    /// Current owner of a slot
    pub fn owner(&self, handle: BufferHandle) -> Option<BufferOwner> {
        self.entries.get(&handle).map(|e| e.owner)
    }

    /// Port a slot belongs to
    pub fn port_of(&self, handle: BufferHandle) -> Option<PortIndex> {
        self.entries.get(&handle).map(|e| e.port)
    }

    /// Transfer ownership from `expected` to `new_owner`
    ///
    /// On mismatch the ledger is left untouched and `OwnershipViolation`
    /// is returned.
    pub fn acquire(&mut self, handle: BufferHandle, expected: BufferOwner, new_owner: BufferOwner) -> Result<()> {
        let entry = self.entries.get_mut(&handle).ok_or(DecoderError::UnknownBuffer(handle))?;
        if entry.owner != expected {
            return Err(DecoderError::OwnershipViolation {
                handle,
                expected,
                actual: entry.owner,
            });
        }
        entry.owner = new_owner;
        self.transfers += 1;
        Ok(())
    }

    /// Overwrite the owner without checking the prior one (fault recovery only)
    pub fn force_owner(&mut self, handle: BufferHandle, owner: BufferOwner) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            if entry.owner != owner {
                warn!("Forcing {} from {:?} to {:?}", handle, entry.owner, owner);
                entry.owner = owner;
                self.transfers += 1;
            }
        }
    }

    /// Number of buffers of `port` held by the offload engine
    pub fn counts(&self, port: PortIndex) -> usize {
        self.entries
            .values()
            .filter(|e| e.port == port && e.owner == BufferOwner::OffloadEngine)
            .count()
    }

    /// Per-owner breakdown for `port`
    pub fn owner_counts(&self, port: PortIndex) -> OwnerCounts {
        let mut counts = OwnerCounts::default();
        for entry in self.entries.values().filter(|e| e.port == port) {
            counts.bump(entry.owner);
        }
        counts
    }

    /// Number of slots registered on `port`
    pub fn population(&self, port: PortIndex) -> usize {
        self.entries.values().filter(|e| e.port == port).count()
    }

    /// Handles of `port` currently held by `owner`
    pub fn handles(&self, port: PortIndex, owner: BufferOwner) -> Vec<BufferHandle> {
        self.entries
            .iter()
            .filter(|(_, e)| e.port == port && e.owner == owner)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Check that owner counts of `port` add up to `actual`
    pub fn check_conservation(&self, port: PortIndex, actual: usize) -> Result<()> {
        let counts = self.owner_counts(port);
        if counts.total() != actual {
            return Err(DecoderError::Internal(format!(
                "{} port holds {} buffers across owners, expected {} ({:?})",
                port,
                counts.total(),
                actual,
                counts
            )));
        }
        Ok(())
    }

    /// Total ownership transfers performed so far
    pub fn transfers(&self) -> u64 {
        self.transfers
    }
}
