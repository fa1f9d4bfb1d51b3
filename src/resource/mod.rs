//! Platform resource arbitration
//!
//! The platform resource manager is consumed as an accept/reject gate. A
//! component requests what it needs when it becomes Idle or Executing and
//! releases it on the way back down.

use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Kind of platform resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    /// Coprocessor memory for codec instances and buffers
    Memory,

    /// Coprocessor decode throughput
    Processing,
}

/// Answer of the arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied,
}

/// Admission gate for platform resources
pub trait ResourceArbiter: Send {
    /// Ask for a resource at `priority` (lower is more important)
    fn request_resource(&mut self, kind: ResourceKind, priority: u32) -> Admission;

    /// Give a previously granted resource back
    fn release_resource(&mut self, kind: ResourceKind);
}

/// Arbiter that grants everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGrant;

impl ResourceArbiter for AlwaysGrant {
    fn request_resource(&mut self, _kind: ResourceKind, _priority: u32) -> Admission {
        Admission::Granted
    }

    fn release_resource(&mut self, _kind: ResourceKind) {}
}

#[derive(Debug, Default)]
struct SlotPool {
    capacity: HashMap<ResourceKind, usize>,
    in_use: HashMap<ResourceKind, usize>,
}

/// Arbiter enforcing a platform-wide budget shared by several components
///
/// Clones share the budget; each clone tracks what it holds itself so a
/// double release cannot free someone else's slot.
#[derive(Debug, Clone)]
pub struct SlotArbiter {
    pool: Arc<Mutex<SlotPool>>,
    held: HashSet<ResourceKind>,
}

impl SlotArbiter {
    /// Create a budget of `memory` and `processing` slots
    pub fn new(memory: usize, processing: usize) -> Self {
        let mut pool = SlotPool::default();
        pool.capacity.insert(ResourceKind::Memory, memory);
        pool.capacity.insert(ResourceKind::Processing, processing);
        Self {
            pool: Arc::new(Mutex::new(pool)),
            held: HashSet::new(),
        }
    }

    /// A handle on the same budget holding nothing yet
    pub fn share(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            held: HashSet::new(),
        }
    }

    /// Slots of `kind` currently granted across all handles
    pub fn in_use(&self, kind: ResourceKind) -> usize {
        self.pool.lock().in_use.get(&kind).copied().unwrap_or(0)
    }
}

impl ResourceArbiter for SlotArbiter {
    fn request_resource(&mut self, kind: ResourceKind, priority: u32) -> Admission {
        if self.held.contains(&kind) {
            return Admission::Granted;
        }
        let mut pool = self.pool.lock();
        let capacity = pool.capacity.get(&kind).copied().unwrap_or(0);
        let used = pool.in_use.entry(kind).or_insert(0);
        if *used >= capacity {
            info!("Denied {:?} at priority {} ({} of {} in use)", kind, priority, used, capacity);
            return Admission::Denied;
        }
        *used += 1;
        self.held.insert(kind);
        debug!("Granted {:?} at priority {}", kind, priority);
        Admission::Granted
    }

    fn release_resource(&mut self, kind: ResourceKind) {
        if !self.held.remove(&kind) {
            return;
        }
        let mut pool = self.pool.lock();
        if let Some(used) = pool.in_use.get_mut(&kind) {
            *used = used.saturating_sub(1);
        }
        debug!("Released {:?}", kind);
    }
}
