use ndnfw_core::packets::Data;
use ndnfw_core::{PacketBuf, TscTime};

use crate::timer::NIL;

/// Intrusive LRU links, slot-id based like every other pointer in the shard.
#[derive(Debug, Clone, Copy)]
pub struct LruLinks {
    pub prev: u32,
    pub next: u32,
}

impl Default for LruLinks {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
        }
    }
}

/// Content Store entry payload.
#[derive(Debug)]
pub enum CsKind {
    /// Exact-name entry holding the cached Data.
    Direct {
        wire: PacketBuf,
        meta: Data,
        fresh_until: TscTime,
        /// Indirect entries (slot ids) that resolve to this one; bounded.
        dependents: Vec<u32>,
    },
    /// Prefix-match entry keyed on the Interest name, pointing at the
    /// direct entry that answered it.
    Indirect { direct: u32 },
}

/// Maximum indirect entries per direct entry.
pub const MAX_DEPENDENTS: usize = 4;

#[derive(Debug)]
pub struct CsEntry {
    pub kind: CsKind,
    pub lru: LruLinks,
}

impl CsEntry {
    pub fn is_direct(&self) -> bool {
        matches!(self.kind, CsKind::Direct { .. })
    }
}

/// One LRU list head; direct and indirect entries are tracked separately
/// with separate capacities. Link storage lives inside [`CsEntry`]; the
/// shard owns the mutation logic since it owns the slot arena.
#[derive(Debug)]
pub struct LruList {
    pub head: u32,
    pub tail: u32,
    pub len: usize,
    pub capacity: usize,
}

impl LruList {
    pub fn new(capacity: usize) -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
            capacity,
        }
    }

    pub fn is_over_capacity(&self) -> bool {
        self.len > self.capacity
    }
}
