use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use ndnfw_core::lp::PitToken;
use ndnfw_core::packets::{Data, FaceId, Interest, NackReason};
use ndnfw_core::{PacketBuf, TscTime};

use crate::cs::{CsEntry, CsKind, LruLinks, LruList, MAX_DEPENDENTS};
use crate::fib::FibRealEntry;
use crate::timer::{TimerWheel, NIL};

/// Bounds on per-entry record lists.
pub const MAX_DNS: usize = 6;
pub const MAX_UPS: usize = 4;

/// Timer wheel geometry: 256 slots of 1 ms.
const WHEEL_SLOT_BITS: u32 = 8;
const WHEEL_INTERVAL: u64 = 1_000_000;

const MS: u64 = 1_000_000;

/// PCCT configuration.
#[derive(Debug, Clone, Copy)]
pub struct PcctConfig {
    /// Slot budget for the shard (PIT entries and CS entries share slots).
    pub capacity: usize,
    pub cs_direct_capacity: usize,
    pub cs_indirect_capacity: usize,
}

impl Default for PcctConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            cs_direct_capacity: 1024,
            cs_indirect_capacity: 1024,
        }
    }
}

/// Interest retransmission suppression parameters (exponential backoff per
/// upstream).
#[derive(Debug, Clone, Copy)]
pub struct SuppressConfig {
    pub min_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for SuppressConfig {
    fn default() -> Self {
        Self {
            min_ms: 10,
            max_ms: 100,
            multiplier: 2.0,
        }
    }
}

impl SuppressConfig {
    fn initial(&self) -> u64 {
        self.min_ms * MS
    }

    fn next(&self, interval: u64) -> u64 {
        ((interval as f64 * self.multiplier) as u64).min(self.max_ms * MS)
    }
}

/// Slot key: name plus the selectors that make Interests distinct in the
/// PIT.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PccKey {
    pub name: Vec<u8>,
    pub can_be_prefix: bool,
    pub must_be_fresh: bool,
    pub fh: Option<Vec<u8>>,
}

impl PccKey {
    pub fn of_interest(interest: &Interest) -> Self {
        Self {
            name: interest.name.wire().to_vec(),
            can_be_prefix: interest.can_be_prefix,
            must_be_fresh: interest.must_be_fresh,
            fh: interest
                .active_hint
                .map(|i| interest.fwd_hints[i].wire().to_vec()),
        }
    }

    /// The key direct CS entries live under.
    pub fn canonical(name_wire: &[u8]) -> Self {
        Self {
            name: name_wire.to_vec(),
            can_be_prefix: false,
            must_be_fresh: false,
            fh: None,
        }
    }
}

/// Downstream record: a face awaiting Data for this entry.
#[derive(Debug, Clone)]
pub struct PitDn {
    pub face: FaceId,
    pub token: PitToken,
    pub nonce: u32,
    pub expiry: TscTime,
    pub cong_mark: u8,
}

/// Upstream record: a face this Interest was forwarded to.
#[derive(Debug, Clone)]
pub struct PitUp {
    pub face: FaceId,
    pub nonce: u32,
    pub last_tx: TscTime,
    pub suppress_until: TscTime,
    suppress_interval: u64,
    pub nack: Option<NackReason>,
}

/// A pending Interest.
#[derive(Debug)]
pub struct PitEntry {
    pub dns: Vec<PitDn>,
    pub ups: Vec<PitUp>,
    /// Wire of the most recent Interest, kept for retransmission and Nack
    /// generation.
    pub interest_wire: PacketBuf,
    pub lifetime_ms: u32,
    pub hop_limit: Option<u8>,
    pub can_be_prefix: bool,
    pub must_be_fresh: bool,
    /// FIB entry cached at insertion; strategy hooks read scratch and
    /// counters through it.
    pub fib_entry: Option<Arc<FibRealEntry>>,
}

impl PitEntry {
    fn new(interest: &Interest, wire: PacketBuf) -> Self {
        Self {
            dns: Vec::with_capacity(2),
            ups: Vec::with_capacity(2),
            interest_wire: wire,
            lifetime_ms: interest.lifetime_ms,
            hop_limit: interest.hop_limit,
            can_be_prefix: interest.can_be_prefix,
            must_be_fresh: interest.must_be_fresh,
            fib_entry: None,
        }
    }

    pub fn earliest_expiry(&self) -> Option<TscTime> {
        self.dns.iter().map(|dn| dn.expiry).min()
    }

    pub fn latest_expiry(&self) -> Option<TscTime> {
        self.dns.iter().map(|dn| dn.expiry).max()
    }

    pub fn purge_expired_dns(&mut self, now: TscTime) {
        self.dns.retain(|dn| dn.expiry > now);
    }

    /// Downstreams still waiting at `now`.
    pub fn live_dns(&self, now: TscTime) -> impl Iterator<Item = &PitDn> {
        self.dns.iter().filter(move |dn| dn.expiry > now)
    }

    /// Record a transmission toward `face`, honoring the suppression
    /// window. Returns false when the transmission must be suppressed or
    /// the upstream list is full.
    pub fn try_tx_upstream(
        &mut self,
        face: FaceId,
        nonce: u32,
        now: TscTime,
        cfg: &SuppressConfig,
    ) -> bool {
        if let Some(up) = self.ups.iter_mut().find(|up| up.face == face) {
            if now < up.suppress_until {
                return false;
            }
            up.nonce = nonce;
            up.last_tx = now;
            up.suppress_interval = cfg.next(up.suppress_interval);
            up.suppress_until = now + up.suppress_interval;
            up.nack = None;
            return true;
        }
        if self.ups.len() >= MAX_UPS {
            return false;
        }
        self.ups.push(PitUp {
            face,
            nonce,
            last_tx: now,
            suppress_until: now + cfg.initial(),
            suppress_interval: cfg.initial(),
            nack: None,
        });
        true
    }

    /// Faces from `nexthops` that have not been tried yet.
    pub fn untried<'a>(&'a self, nexthops: &'a [FaceId]) -> impl Iterator<Item = FaceId> + 'a {
        nexthops
            .iter()
            .copied()
            .filter(move |nh| !self.ups.iter().any(|up| up.face == *nh))
    }

    /// Whether every upstream so far has answered with a Nack.
    pub fn all_ups_nacked(&self) -> bool {
        !self.ups.is_empty() && self.ups.iter().all(|up| up.nack.is_some())
    }
}

struct PccSlot {
    key: PccKey,
    gen: u32,
    pit: Option<PitEntry>,
    cs: Option<CsEntry>,
}

/// PIT+CS counters, readable by the management thread while the owning core
/// updates them.
#[derive(Debug, Default)]
pub struct PcctCounters {
    pub n_entries: AtomicU64,
    pub n_insert: AtomicU64,
    pub n_found: AtomicU64,
    pub n_cs_match: AtomicU64,
    pub n_alloc_err: AtomicU64,
    pub n_data_hit: AtomicU64,
    pub n_data_miss: AtomicU64,
    pub n_nack_hit: AtomicU64,
    pub n_nack_miss: AtomicU64,
    pub n_expired: AtomicU64,
    pub cs_hits: AtomicU64,
    pub cs_misses: AtomicU64,
    pub cs_direct_entries: AtomicU64,
    pub cs_indirect_entries: AtomicU64,
    pub cs_direct_evicts: AtomicU64,
    pub cs_indirect_evicts: AtomicU64,
}

/// Plain-value copy of [`PcctCounters`] for the management surface.
#[derive(Debug, Clone, Default)]
pub struct PcctCountersSnapshot {
    pub n_entries: u64,
    pub n_insert: u64,
    pub n_found: u64,
    pub n_cs_match: u64,
    pub n_alloc_err: u64,
    pub n_data_hit: u64,
    pub n_data_miss: u64,
    pub n_nack_hit: u64,
    pub n_nack_miss: u64,
    pub n_expired: u64,
    pub cs_hits: u64,
    pub cs_misses: u64,
    pub cs_direct_entries: u64,
    pub cs_indirect_entries: u64,
    pub cs_direct_evicts: u64,
    pub cs_indirect_evicts: u64,
}

impl PcctCounters {
    pub fn snapshot(&self) -> PcctCountersSnapshot {
        PcctCountersSnapshot {
            n_entries: self.n_entries.load(Ordering::Relaxed),
            n_insert: self.n_insert.load(Ordering::Relaxed),
            n_found: self.n_found.load(Ordering::Relaxed),
            n_cs_match: self.n_cs_match.load(Ordering::Relaxed),
            n_alloc_err: self.n_alloc_err.load(Ordering::Relaxed),
            n_data_hit: self.n_data_hit.load(Ordering::Relaxed),
            n_data_miss: self.n_data_miss.load(Ordering::Relaxed),
            n_nack_hit: self.n_nack_hit.load(Ordering::Relaxed),
            n_nack_miss: self.n_nack_miss.load(Ordering::Relaxed),
            n_expired: self.n_expired.load(Ordering::Relaxed),
            cs_hits: self.cs_hits.load(Ordering::Relaxed),
            cs_misses: self.cs_misses.load(Ordering::Relaxed),
            cs_direct_entries: self.cs_direct_entries.load(Ordering::Relaxed),
            cs_indirect_entries: self.cs_indirect_entries.load(Ordering::Relaxed),
            cs_direct_evicts: self.cs_direct_evicts.load(Ordering::Relaxed),
            cs_indirect_evicts: self.cs_indirect_evicts.load(Ordering::Relaxed),
        }
    }
}

macro_rules! bump {
    ($counters:expr, $field:ident) => {
        $counters.$field.fetch_add(1, Ordering::Relaxed)
    };
}

/// Outcome of inserting an Interest.
#[derive(Debug)]
pub enum InsertResult {
    /// A cached Data satisfies the Interest.
    CsHit { wire: PacketBuf, meta: Data },
    /// Duplicate nonce from another downstream.
    Duplicate,
    /// Appended to an existing PIT entry.
    Found(u32),
    /// Created a new PIT entry.
    New(u32),
    /// Slot or record allocation failed.
    AllocErr,
}

#[derive(Clone, Copy)]
enum CsList {
    Direct,
    Indirect,
}

/// One PIT+CS shard, exclusively owned by one forwarding core.
///
/// Slots live in an arena indexed by u32 ids; PIT tokens, CS LRU links, and
/// timer-wheel membership are all expressed as ids so the shard drops as a
/// unit with no back-pointers.
pub struct PcctShard {
    id: u8,
    cfg: PcctConfig,
    suppress: SuppressConfig,
    slots: Vec<Option<PccSlot>>,
    /// Slot generations, surviving slot reuse so stale tokens miss.
    gens: Vec<u32>,
    free: Vec<u32>,
    index: HashMap<PccKey, u32>,
    cs_direct: LruList,
    cs_indirect: LruList,
    wheel: TimerWheel,
    counters: Arc<PcctCounters>,
}

impl PcctShard {
    pub fn new(id: u8, cfg: PcctConfig, suppress: SuppressConfig, now: TscTime) -> Self {
        Self {
            id,
            cfg,
            suppress,
            slots: Vec::with_capacity(cfg.capacity),
            gens: Vec::with_capacity(cfg.capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(cfg.capacity),
            cs_direct: LruList::new(cfg.cs_direct_capacity),
            cs_indirect: LruList::new(cfg.cs_indirect_capacity),
            wheel: TimerWheel::new(cfg.capacity, WHEEL_SLOT_BITS, WHEEL_INTERVAL, now),
            counters: Arc::new(PcctCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<PcctCounters> {
        self.counters.clone()
    }

    pub fn suppress_config(&self) -> SuppressConfig {
        self.suppress
    }

    pub fn entry(&self, id: u32) -> Option<&PitEntry> {
        self.slots.get(id as usize)?.as_ref()?.pit.as_ref()
    }

    pub fn entry_mut(&mut self, id: u32) -> Option<&mut PitEntry> {
        self.slots.get_mut(id as usize)?.as_mut()?.pit.as_mut()
    }

    /// PIT token for a slot: forwarder id in the top byte, slot generation
    /// in the middle, slot index in the low 32 bits.
    pub fn token_of(&self, id: u32) -> u64 {
        let gen = self.slots[id as usize].as_ref().map_or(0, |s| s.gen) as u64;
        ((self.id as u64) << 56) | ((gen & 0xFF_FFFF) << 32) | id as u64
    }

    /// Resolve an internally originated token back to a live PIT entry.
    pub fn find_by_token(&self, token: u64) -> Option<u32> {
        if (token >> 56) as u8 != self.id {
            return None;
        }
        let id = (token & 0xFFFF_FFFF) as u32;
        let gen = ((token >> 32) & 0xFF_FFFF) as u32;
        let slot = self.slots.get(id as usize)?.as_ref()?;
        if slot.gen & 0xFF_FFFF != gen || slot.pit.is_none() {
            return None;
        }
        Some(id)
    }

    /// Probe the CS for an Interest without creating PIT state. A hit is
    /// counted; a miss is not (the follow-up [`PcctShard::insert_interest`]
    /// counts it).
    pub fn lookup_cs(
        &mut self,
        interest: &Interest,
        now: TscTime,
    ) -> Option<(PacketBuf, Data)> {
        let key = PccKey::of_interest(interest);
        let hit = match self.index.get(&key).copied() {
            Some(id) => self.cs_match(id, interest, now),
            None => None,
        }
        .or_else(|| self.cs_canonical_match(interest, now));
        if hit.is_some() {
            bump!(self.counters, n_cs_match);
            bump!(self.counters, cs_hits);
        }
        hit
    }

    /// Insert an Interest per the PIT-CS composite rules.
    pub fn insert_interest(
        &mut self,
        interest: &Interest,
        wire: &PacketBuf,
        dn_face: FaceId,
        dn_token: PitToken,
        dn_cong: u8,
        now: TscTime,
    ) -> InsertResult {
        let key = PccKey::of_interest(interest);

        if let Some(&id) = self.index.get(&key) {
            if let Some((wire, meta)) = self.cs_match(id, interest, now) {
                bump!(self.counters, n_cs_match);
                bump!(self.counters, cs_hits);
                return InsertResult::CsHit { wire, meta };
            }
            bump!(self.counters, cs_misses);

            let slot = self.slots[id as usize].as_mut().expect("indexed slot");
            if let Some(pit) = slot.pit.as_mut() {
                if pit
                    .dns
                    .iter()
                    .any(|dn| dn.nonce == interest.nonce && dn.face != dn_face)
                {
                    trace!("pcct{}: duplicate nonce {:08x}", self.id, interest.nonce);
                    return InsertResult::Duplicate;
                }
                let expiry = interest.expiry(now);
                match pit.dns.iter_mut().find(|dn| dn.face == dn_face) {
                    Some(dn) => {
                        dn.nonce = interest.nonce;
                        dn.token = dn_token;
                        dn.expiry = expiry;
                        dn.cong_mark = dn_cong;
                    }
                    None => {
                        if pit.dns.len() >= MAX_DNS {
                            bump!(self.counters, n_alloc_err);
                            return InsertResult::AllocErr;
                        }
                        pit.dns.push(PitDn {
                            face: dn_face,
                            token: dn_token,
                            nonce: interest.nonce,
                            expiry,
                            cong_mark: dn_cong,
                        });
                    }
                }
                pit.interest_wire = wire.clone();
                self.arm_timer(id, now);
                bump!(self.counters, n_found);
                return InsertResult::Found(id);
            }

            // slot holds only a CS entry that did not satisfy this Interest
            let mut pit = PitEntry::new(interest, wire.clone());
            pit.dns.push(PitDn {
                face: dn_face,
                token: dn_token,
                nonce: interest.nonce,
                expiry: interest.expiry(now),
                cong_mark: dn_cong,
            });
            slot.pit = Some(pit);
            bump!(self.counters, n_insert);
            bump!(self.counters, n_entries);
            self.arm_timer(id, now);
            return InsertResult::New(id);
        }

        // no slot under this exact key: a direct CS entry under the
        // canonical key can still answer an exact-name Interest
        if let Some((wire, meta)) = self.cs_canonical_match(interest, now) {
            bump!(self.counters, n_cs_match);
            bump!(self.counters, cs_hits);
            return InsertResult::CsHit { wire, meta };
        }
        bump!(self.counters, cs_misses);

        let Some(id) = self.alloc_slot(key) else {
            bump!(self.counters, n_alloc_err);
            return InsertResult::AllocErr;
        };
        let mut pit = PitEntry::new(interest, wire.clone());
        pit.dns.push(PitDn {
            face: dn_face,
            token: dn_token,
            nonce: interest.nonce,
            expiry: interest.expiry(now),
            cong_mark: dn_cong,
        });
        self.slots[id as usize].as_mut().expect("fresh slot").pit = Some(pit);
        bump!(self.counters, n_insert);
        bump!(self.counters, n_entries);
        self.arm_timer(id, now);
        InsertResult::New(id)
    }

    pub fn set_fib_entry(&mut self, id: u32, entry: Arc<FibRealEntry>) {
        if let Some(pit) = self.entry_mut(id) {
            pit.fib_entry = Some(entry);
        }
    }

    /// Find PIT entries satisfied by a Data: the token lookup first, then
    /// the exact-name and prefix probes for CanBePrefix matches.
    pub fn find_by_data(&mut self, data: &Data, token: Option<u64>) -> Vec<u32> {
        let mut out: Vec<u32> = Vec::with_capacity(2);

        if let Some(token) = token {
            if let Some(id) = self.find_by_token(token) {
                if self.data_matches(id, data) {
                    out.push(id);
                }
            }
        }

        let n = data.name.len();
        for l in 0..=n {
            let exact = l == n;
            let cbps: &[bool] = if exact { &[false, true] } else { &[true] };
            for &can_be_prefix in cbps {
                for &must_be_fresh in &[false, true] {
                    if must_be_fresh && data.freshness_ms == 0 {
                        continue;
                    }
                    let key = PccKey {
                        name: data.name.prefix_wire(l).to_vec(),
                        can_be_prefix,
                        must_be_fresh,
                        fh: None,
                    };
                    if let Some(&id) = self.index.get(&key) {
                        if self.entry(id).is_some() && !out.contains(&id) {
                            out.push(id);
                        }
                    }
                }
            }
        }

        if out.is_empty() {
            bump!(self.counters, n_data_miss);
        } else {
            bump!(self.counters, n_data_hit);
        }
        out
    }

    fn data_matches(&self, id: u32, data: &Data) -> bool {
        let Some(slot) = self.slots.get(id as usize).and_then(Option::as_ref) else {
            return false;
        };
        let Some(pit) = slot.pit.as_ref() else {
            return false;
        };
        if pit.must_be_fresh && data.freshness_ms == 0 {
            return false;
        }
        if slot.key.name == data.name.wire() {
            return true;
        }
        // prefix match; a Data shorter than the Interest name never matches
        pit.can_be_prefix && data.name.has_prefix(&slot.key.name)
    }

    /// Find a PIT entry for a Nack, counting hit/miss.
    pub fn find_by_nack(&self, token: Option<u64>, nonce: u32) -> Option<u32> {
        let id = token.and_then(|t| self.find_by_token(t));
        let id = id.filter(|&id| {
            self.entry(id)
                .map_or(false, |pit| pit.ups.iter().any(|up| up.nonce == nonce))
        });
        match id {
            Some(id) => {
                bump!(self.counters, n_nack_hit);
                Some(id)
            }
            None => {
                bump!(self.counters, n_nack_miss);
                None
            }
        }
    }

    /// Remove and return the PIT entry of a satisfied slot; the slot itself
    /// stays for the follow-up CS insertion.
    pub fn satisfy(&mut self, id: u32) -> Option<PitEntry> {
        let slot = self.slots.get_mut(id as usize)?.as_mut()?;
        let pit = slot.pit.take()?;
        self.wheel.cancel(id);
        self.counters.n_entries.fetch_sub(1, Ordering::Relaxed);
        Some(pit)
    }

    /// Remove and return a PIT entry, releasing the slot when nothing else
    /// lives in it (Nack propagation, strategy give-up).
    pub fn take_pit(&mut self, id: u32) -> Option<PitEntry> {
        let pit = self.satisfy(id)?;
        self.maybe_free_slot(id);
        Some(pit)
    }

    /// Erase a PIT entry without satisfying it.
    pub fn erase_pit(&mut self, id: u32) {
        let _ = self.take_pit(id);
    }

    /// Advance the timer wheel; returns entries whose every downstream has
    /// expired. Entries with a live downstream left are re-armed.
    pub fn advance_timers(&mut self, now: TscTime) -> Vec<u32> {
        let mut fired = Vec::new();
        self.wheel.advance(now, &mut fired);
        let mut expired = Vec::new();
        for id in fired {
            let next = match self
                .slots
                .get_mut(id as usize)
                .and_then(Option::as_mut)
                .and_then(|s| s.pit.as_mut())
            {
                None => continue,
                Some(pit) => {
                    pit.purge_expired_dns(now);
                    pit.earliest_expiry()
                }
            };
            match next {
                Some(t) => self.wheel.schedule(id, t, now),
                None => expired.push(id),
            }
        }
        expired
    }

    /// Count and erase an expired entry, returning it for the strategy
    /// expiry hook.
    pub fn expire(&mut self, id: u32) -> Option<PitEntry> {
        let pit = self.take_pit(id)?;
        bump!(self.counters, n_expired);
        Some(pit)
    }

    /// Management: resize the CS lists, evicting as needed.
    pub fn set_cs_capacities(&mut self, direct: usize, indirect: usize) {
        self.cs_direct.capacity = direct;
        self.cs_indirect.capacity = indirect;
        self.evict_over_capacity(CsList::Direct);
        self.evict_over_capacity(CsList::Indirect);
        self.update_cs_gauges();
    }

    /// Management: drop every CS entry.
    pub fn clear_cs(&mut self) {
        while self.cs_direct.tail != NIL {
            let tail = self.cs_direct.tail;
            self.erase_cs(tail);
        }
        while self.cs_indirect.tail != NIL {
            let tail = self.cs_indirect.tail;
            self.erase_cs(tail);
        }
        self.update_cs_gauges();
    }

    /// Insert the Data into the CS after `satisfy(id)`: direct under the
    /// Data's own name, plus an indirect entry under the Interest slot key
    /// when the names differ.
    pub fn insert_cs(&mut self, id: u32, data: &Data, wire: PacketBuf, now: TscTime) {
        let Some(slot) = self.slots.get(id as usize).and_then(Option::as_ref) else {
            return;
        };
        let canonical = PccKey::canonical(data.name.wire());
        if slot.key == canonical {
            self.store_direct(id, data, wire, now);
            self.evict_over_capacity(CsList::Direct);
            return;
        }

        let direct_id = match self.index.get(&canonical).copied() {
            Some(d) => {
                self.store_direct(d, data, wire, now);
                Some(d)
            }
            None => match self.alloc_slot(canonical) {
                Some(d) => {
                    self.store_direct(d, data, wire, now);
                    Some(d)
                }
                None => {
                    bump!(self.counters, n_alloc_err);
                    None
                }
            },
        };

        if let Some(direct_id) = direct_id {
            self.store_indirect(id, direct_id, now);
            self.evict_over_capacity(CsList::Indirect);
        } else {
            self.maybe_free_slot(id);
        }
        self.evict_over_capacity(CsList::Direct);
    }

    /// Current CS list lengths (direct, indirect).
    pub fn cs_len(&self) -> (usize, usize) {
        (self.cs_direct.len, self.cs_indirect.len)
    }

    /// Live PIT entries.
    pub fn pit_len(&self) -> usize {
        self.counters.n_entries.load(Ordering::Relaxed) as usize
    }

    // ---- internals ----

    fn alloc_slot(&mut self, key: PccKey) -> Option<u32> {
        if self.index.len() >= self.cfg.capacity {
            return None;
        }
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                if self.slots.len() >= self.cfg.capacity {
                    return None;
                }
                self.slots.push(None);
                self.gens.push(0);
                (self.slots.len() - 1) as u32
            }
        };
        let gen = self.gens[id as usize].wrapping_add(1);
        self.gens[id as usize] = gen;
        self.index.insert(key.clone(), id);
        self.slots[id as usize] = Some(PccSlot {
            key,
            gen,
            pit: None,
            cs: None,
        });
        Some(id)
    }

    fn maybe_free_slot(&mut self, id: u32) {
        let Some(slot) = self.slots.get_mut(id as usize).and_then(Option::as_mut) else {
            return;
        };
        if slot.pit.is_some() || slot.cs.is_some() {
            return;
        }
        let key = slot.key.clone();
        self.index.remove(&key);
        self.wheel.cancel(id);
        self.slots[id as usize] = None;
        self.free.push(id);
    }

    fn arm_timer(&mut self, id: u32, now: TscTime) {
        if let Some(earliest) = self.entry(id).and_then(PitEntry::earliest_expiry) {
            self.wheel.schedule(id, earliest, now);
        }
    }

    fn cs_match(&mut self, id: u32, interest: &Interest, now: TscTime) -> Option<(PacketBuf, Data)> {
        let slot = self.slots.get(id as usize)?.as_ref()?;
        let cs = slot.cs.as_ref()?;
        let (direct_id, hit) = match &cs.kind {
            CsKind::Direct {
                wire,
                meta,
                fresh_until,
                ..
            } => {
                if interest.must_be_fresh && *fresh_until <= now {
                    return None;
                }
                (id, (wire.clone(), meta.clone()))
            }
            CsKind::Indirect { direct } => {
                let direct = *direct;
                let dslot = self.slots.get(direct as usize)?.as_ref()?;
                match dslot.cs.as_ref().map(|c| &c.kind) {
                    Some(CsKind::Direct {
                        wire,
                        meta,
                        fresh_until,
                        ..
                    }) => {
                        if interest.must_be_fresh && *fresh_until <= now {
                            return None;
                        }
                        (direct, (wire.clone(), meta.clone()))
                    }
                    _ => return None,
                }
            }
        };
        if direct_id != id {
            self.lru_touch(CsList::Indirect, id);
        }
        self.lru_touch(CsList::Direct, direct_id);
        Some(hit)
    }

    fn cs_canonical_match(
        &mut self,
        interest: &Interest,
        now: TscTime,
    ) -> Option<(PacketBuf, Data)> {
        let canonical = PccKey::canonical(interest.name.wire());
        let id = self.index.get(&canonical).copied()?;
        self.cs_match(id, interest, now)
    }

    fn store_direct(&mut self, id: u32, data: &Data, wire: PacketBuf, now: TscTime) {
        // replacing a direct entry keeps its dependents (the slot stays
        // direct); any other occupant is removed in place first
        let mut dependents = Vec::new();
        match self.slots[id as usize]
            .as_ref()
            .and_then(|s| s.cs.as_ref())
            .map(CsEntry::is_direct)
        {
            Some(true) => {
                self.lru_detach(CsList::Direct, id);
                if let Some(CsKind::Direct {
                    dependents: deps, ..
                }) = self.slots[id as usize]
                    .as_mut()
                    .and_then(|s| s.cs.take())
                    .map(|c| c.kind)
                {
                    dependents = deps;
                }
            }
            Some(false) => self.remove_cs_in_place(id),
            None => {}
        }
        let entry = CsEntry {
            kind: CsKind::Direct {
                wire,
                meta: data.clone(),
                fresh_until: data.fresh_until(now),
                dependents,
            },
            lru: LruLinks::default(),
        };
        self.slots[id as usize].as_mut().expect("direct slot").cs = Some(entry);
        self.lru_push_front(CsList::Direct, id);
        self.update_cs_gauges();
        debug!("pcct{}: cs direct insert slot={}", self.id, id);
    }

    fn store_indirect(&mut self, id: u32, direct_id: u32, _now: TscTime) {
        // bounded dependents per direct entry
        let can_register = match self.slots[direct_id as usize]
            .as_mut()
            .and_then(|s| s.cs.as_mut())
        {
            Some(CsEntry {
                kind: CsKind::Direct { dependents, .. },
                ..
            }) => {
                if dependents.len() >= MAX_DEPENDENTS {
                    false
                } else {
                    dependents.push(id);
                    true
                }
            }
            _ => false,
        };
        if !can_register {
            self.maybe_free_slot(id);
            return;
        }

        self.remove_cs_in_place(id);
        if let Some(slot) = self.slots[id as usize].as_mut() {
            slot.cs = Some(CsEntry {
                kind: CsKind::Indirect { direct: direct_id },
                lru: LruLinks::default(),
            });
        }
        self.lru_push_front(CsList::Indirect, id);
        self.update_cs_gauges();
        debug!(
            "pcct{}: cs indirect insert slot={} direct={}",
            self.id, id, direct_id
        );
    }

    /// Remove the CS entry from a slot, keeping the slot allocated.
    fn remove_cs_in_place(&mut self, id: u32) {
        let Some(is_direct) = self
            .slots
            .get(id as usize)
            .and_then(Option::as_ref)
            .and_then(|s| s.cs.as_ref())
            .map(CsEntry::is_direct)
        else {
            return;
        };
        self.lru_detach(
            if is_direct {
                CsList::Direct
            } else {
                CsList::Indirect
            },
            id,
        );
        let kind = self.slots[id as usize]
            .as_mut()
            .and_then(|s| s.cs.take())
            .map(|c| c.kind);
        match kind {
            Some(CsKind::Direct { dependents, .. }) => {
                for dep in dependents {
                    self.erase_indirect_orphan(dep);
                }
            }
            Some(CsKind::Indirect { direct }) => {
                if let Some(CsEntry {
                    kind: CsKind::Direct { dependents, .. },
                    ..
                }) = self.slots[direct as usize]
                    .as_mut()
                    .and_then(|s| s.cs.as_mut())
                {
                    dependents.retain(|&d| d != id);
                }
            }
            None => {}
        }
    }

    fn erase_cs(&mut self, id: u32) {
        self.remove_cs_in_place(id);
        self.maybe_free_slot(id);
        self.update_cs_gauges();
    }

    /// Erase an indirect entry whose direct parent is going away.
    fn erase_indirect_orphan(&mut self, id: u32) {
        let is_indirect = self.slots[id as usize]
            .as_ref()
            .and_then(|s| s.cs.as_ref())
            .map_or(false, |c| !c.is_direct());
        if !is_indirect {
            return;
        }
        self.lru_detach(CsList::Indirect, id);
        if let Some(slot) = self.slots[id as usize].as_mut() {
            slot.cs = None;
        }
        self.maybe_free_slot(id);
    }

    fn evict_over_capacity(&mut self, which: CsList) {
        loop {
            let (over, tail) = match which {
                CsList::Direct => (self.cs_direct.is_over_capacity(), self.cs_direct.tail),
                CsList::Indirect => (self.cs_indirect.is_over_capacity(), self.cs_indirect.tail),
            };
            if !over || tail == NIL {
                return;
            }
            match which {
                CsList::Direct => bump!(self.counters, cs_direct_evicts),
                CsList::Indirect => bump!(self.counters, cs_indirect_evicts),
            };
            self.erase_cs(tail);
        }
    }

    fn update_cs_gauges(&self) {
        self.counters
            .cs_direct_entries
            .store(self.cs_direct.len as u64, Ordering::Relaxed);
        self.counters
            .cs_indirect_entries
            .store(self.cs_indirect.len as u64, Ordering::Relaxed);
    }

    fn cs_links(&mut self, id: u32) -> &mut LruLinks {
        &mut self.slots[id as usize]
            .as_mut()
            .expect("linked slot")
            .cs
            .as_mut()
            .expect("linked cs entry")
            .lru
    }

    fn lru_detach(&mut self, which: CsList, id: u32) {
        let links = *self.cs_links(id);
        if links.prev != NIL {
            self.cs_links(links.prev).next = links.next;
        }
        if links.next != NIL {
            self.cs_links(links.next).prev = links.prev;
        }
        let list = match which {
            CsList::Direct => &mut self.cs_direct,
            CsList::Indirect => &mut self.cs_indirect,
        };
        if list.head == id {
            list.head = links.next;
        }
        if list.tail == id {
            list.tail = links.prev;
        }
        list.len -= 1;
        *self.cs_links(id) = LruLinks::default();
    }

    fn lru_push_front(&mut self, which: CsList, id: u32) {
        let old_head = match which {
            CsList::Direct => self.cs_direct.head,
            CsList::Indirect => self.cs_indirect.head,
        };
        {
            let links = self.cs_links(id);
            links.prev = NIL;
            links.next = old_head;
        }
        if old_head != NIL {
            self.cs_links(old_head).prev = id;
        }
        let list = match which {
            CsList::Direct => &mut self.cs_direct,
            CsList::Indirect => &mut self.cs_indirect,
        };
        list.head = id;
        if list.tail == NIL {
            list.tail = id;
        }
        list.len += 1;
    }

    fn lru_touch(&mut self, which: CsList, id: u32) {
        self.lru_detach(which, id);
        self.lru_push_front(which, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndnfw_core::name::Name;

    fn interest(uri: &str, nonce: u32) -> (Interest, PacketBuf) {
        let i = Interest::new(&Name::from_str(uri), nonce);
        let wire = PacketBuf::from_vec(i.encode());
        (i, wire)
    }

    fn data(uri: &str, freshness_ms: u32) -> (Data, PacketBuf) {
        let wire = Data::build(&Name::from_str(uri), freshness_ms, b"content");
        (Data::decode(&wire).unwrap(), PacketBuf::from_vec(wire))
    }

    fn shard() -> PcctShard {
        PcctShard::new(1, PcctConfig::default(), SuppressConfig::default(), 0)
    }

    fn snapshot(shard: &PcctShard) -> (u64, u64, u64, u64) {
        let c = shard.counters();
        (
            c.n_entries.load(Ordering::Relaxed),
            c.n_insert.load(Ordering::Relaxed),
            c.n_found.load(Ordering::Relaxed),
            c.n_expired.load(Ordering::Relaxed),
        )
    }

    #[test]
    fn test_insert_new_then_aggregate() {
        let mut shard = shard();
        let (i1, w1) = interest("/A/1", 100);
        let id = match shard.insert_interest(&i1, &w1, 1, PitToken::from_u64(11), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("expected New, got {:?}", other),
        };
        let (i2, w2) = interest("/A/1", 200);
        match shard.insert_interest(&i2, &w2, 3, PitToken::from_u64(33), 0, 0) {
            InsertResult::Found(found) => assert_eq!(found, id),
            other => panic!("expected Found, got {:?}", other),
        }
        let entry = shard.entry(id).unwrap();
        assert_eq!(entry.dns.len(), 2);
        let (n_entries, n_insert, n_found, _) = snapshot(&shard);
        assert_eq!((n_entries, n_insert, n_found), (1, 1, 1));
    }

    #[test]
    fn test_duplicate_nonce_dropped() {
        let mut shard = shard();
        let (i1, w1) = interest("/A/1", 100);
        shard.insert_interest(&i1, &w1, 1, PitToken::from_u64(11), 0, 0);
        // same nonce from a different face is a duplicate
        let (i2, w2) = interest("/A/1", 100);
        assert!(matches!(
            shard.insert_interest(&i2, &w2, 3, PitToken::from_u64(33), 0, 0),
            InsertResult::Duplicate
        ));
        // same nonce from the same face is a retransmission
        let (i3, w3) = interest("/A/1", 100);
        assert!(matches!(
            shard.insert_interest(&i3, &w3, 1, PitToken::from_u64(11), 0, 0),
            InsertResult::Found(_)
        ));
    }

    #[test]
    fn test_selector_variants_use_distinct_slots() {
        let mut shard = shard();
        let (mut i1, _) = interest("/A", 1);
        i1.can_be_prefix = true;
        let w1 = PacketBuf::from_vec(i1.encode());
        let (i2, w2) = interest("/A", 2);
        let id1 = match shard.insert_interest(&i1, &w1, 1, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        let id2 = match shard.insert_interest(&i2, &w2, 1, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        assert_ne!(id1, id2);
        assert_eq!(shard.pit_len(), 2);
    }

    #[test]
    fn test_capacity_alloc_err() {
        let mut shard = PcctShard::new(
            0,
            PcctConfig {
                capacity: 1,
                cs_direct_capacity: 1,
                cs_indirect_capacity: 1,
            },
            SuppressConfig::default(),
            0,
        );
        let (i1, w1) = interest("/A", 1);
        assert!(matches!(
            shard.insert_interest(&i1, &w1, 1, PitToken::empty(), 0, 0),
            InsertResult::New(_)
        ));
        let (i2, w2) = interest("/B", 2);
        assert!(matches!(
            shard.insert_interest(&i2, &w2, 1, PitToken::empty(), 0, 0),
            InsertResult::AllocErr
        ));
        assert_eq!(shard.counters().n_alloc_err.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_token_roundtrip() {
        let mut shard = shard();
        let (i1, w1) = interest("/A/1", 1);
        let id = match shard.insert_interest(&i1, &w1, 1, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        let token = shard.token_of(id);
        assert_eq!((token >> 56) as u8, 1); // forwarder id byte
        assert_eq!(shard.find_by_token(token), Some(id));
        // stale token after the entry is gone
        shard.erase_pit(id);
        assert_eq!(shard.find_by_token(token), None);
    }

    #[test]
    fn test_data_satisfies_and_cs_serves_next_interest() {
        let mut shard = shard();
        let (i1, w1) = interest("/A/1", 1);
        let id = match shard.insert_interest(&i1, &w1, 1, PitToken::from_u64(0xD0), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        let token = shard.token_of(id);

        let (d, dw) = data("/A/1", 10_000);
        let matches = shard.find_by_data(&d, Some(token));
        assert_eq!(matches, vec![id]);

        let entry = shard.satisfy(id).unwrap();
        assert_eq!(entry.dns.len(), 1);
        shard.insert_cs(id, &d, dw, 0);
        assert_eq!(shard.pit_len(), 0);
        assert_eq!(shard.cs_len(), (1, 0));

        let (i2, w2) = interest("/A/1", 2);
        match shard.insert_interest(&i2, &w2, 3, PitToken::empty(), 0, 1) {
            InsertResult::CsHit { meta, .. } => {
                assert_eq!(meta.name.to_name().to_string(), "/A/1")
            }
            other => panic!("expected CsHit, got {:?}", other),
        }
        assert_eq!(shard.counters().n_cs_match.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_must_be_fresh_honored() {
        let mut shard = shard();
        let (i1, w1) = interest("/A/1", 1);
        let id = match shard.insert_interest(&i1, &w1, 1, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        let (d, dw) = data("/A/1", 100); // fresh for 100ms
        shard.satisfy(id).unwrap();
        shard.insert_cs(id, &d, dw, 0);

        let (mut fresh, _) = interest("/A/1", 2);
        fresh.must_be_fresh = true;
        let fw = PacketBuf::from_vec(fresh.encode());
        // within the freshness window: hit
        assert!(matches!(
            shard.insert_interest(&fresh, &fw, 2, PitToken::empty(), 0, 50 * MS),
            InsertResult::CsHit { .. }
        ));
        // stale for MustBeFresh, but a plain Interest still hits
        let (mut fresh2, _) = interest("/A/1", 3);
        fresh2.must_be_fresh = true;
        let fw2 = PacketBuf::from_vec(fresh2.encode());
        assert!(matches!(
            shard.insert_interest(&fresh2, &fw2, 2, PitToken::empty(), 0, 200 * MS),
            InsertResult::New(_) | InsertResult::Found(_)
        ));
        let (plain, pw) = interest("/A/1", 4);
        assert!(matches!(
            shard.insert_interest(&plain, &pw, 2, PitToken::empty(), 0, 200 * MS),
            InsertResult::CsHit { .. }
        ));
    }

    #[test]
    fn test_indirect_cs_prefix_hit() {
        let mut shard = shard();
        let (mut i1, _) = interest("/A", 1);
        i1.can_be_prefix = true;
        let w1 = PacketBuf::from_vec(i1.encode());
        let id = match shard.insert_interest(&i1, &w1, 1, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };

        let (d, dw) = data("/A/1", 10_000);
        let matches = shard.find_by_data(&d, None);
        assert_eq!(matches, vec![id]);
        shard.satisfy(id).unwrap();
        shard.insert_cs(id, &d, dw, 0);
        assert_eq!(shard.cs_len(), (1, 1));

        // same-prefix CanBePrefix Interest hits the indirect entry
        let (mut i2, _) = interest("/A", 2);
        i2.can_be_prefix = true;
        let w2 = PacketBuf::from_vec(i2.encode());
        match shard.insert_interest(&i2, &w2, 3, PitToken::empty(), 0, 1) {
            InsertResult::CsHit { meta, .. } => {
                assert_eq!(meta.name.to_name().to_string(), "/A/1")
            }
            other => panic!("expected CsHit, got {:?}", other),
        }
        // exact-name Interest hits the direct entry
        let (i3, w3) = interest("/A/1", 4);
        assert!(matches!(
            shard.insert_interest(&i3, &w3, 3, PitToken::empty(), 0, 1),
            InsertResult::CsHit { .. }
        ));
    }

    #[test]
    fn test_data_shorter_than_interest_no_match() {
        let mut shard = shard();
        let (mut i1, _) = interest("/A/B/C", 1);
        i1.can_be_prefix = true;
        let w1 = PacketBuf::from_vec(i1.encode());
        shard.insert_interest(&i1, &w1, 1, PitToken::empty(), 0, 0);
        let (d, _) = data("/A/B", 0);
        assert!(shard.find_by_data(&d, None).is_empty());
        assert_eq!(shard.counters().n_data_miss.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_direct_eviction_invalidates_indirect() {
        let mut shard = PcctShard::new(
            0,
            PcctConfig {
                capacity: 64,
                cs_direct_capacity: 2,
                cs_indirect_capacity: 8,
            },
            SuppressConfig::default(),
            0,
        );
        // three prefix Interests answered by longer Data names
        for (uri, duri, nonce) in [
            ("/a", "/a/1", 1u32),
            ("/b", "/b/1", 2),
            ("/c", "/c/1", 3),
        ] {
            let (mut i, _) = interest(uri, nonce);
            i.can_be_prefix = true;
            let w = PacketBuf::from_vec(i.encode());
            let id = match shard.insert_interest(&i, &w, 1, PitToken::empty(), 0, 0) {
                InsertResult::New(id) => id,
                other => panic!("{:?}", other),
            };
            let (d, dw) = data(duri, 10_000);
            shard.satisfy(id).unwrap();
            shard.insert_cs(id, &d, dw, 0);
        }
        // direct capacity 2: /a/1 was evicted together with its indirect
        let (direct, indirect) = shard.cs_len();
        assert_eq!(direct, 2);
        assert_eq!(indirect, 2);
        assert_eq!(shard.counters().cs_direct_evicts.load(Ordering::Relaxed), 1);

        let (mut again, _) = interest("/a", 9);
        again.can_be_prefix = true;
        let aw = PacketBuf::from_vec(again.encode());
        assert!(matches!(
            shard.insert_interest(&again, &aw, 1, PitToken::empty(), 0, 1),
            InsertResult::New(_)
        ));
    }

    #[test]
    fn test_expiry_counts_and_frees() {
        let mut shard = shard();
        let (mut i1, _) = interest("/A/1", 1);
        i1.lifetime_ms = 100;
        let w1 = PacketBuf::from_vec(i1.encode());
        let id = match shard.insert_interest(&i1, &w1, 1, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        assert!(shard.advance_timers(50 * MS).is_empty());
        let expired = shard.advance_timers(110 * MS);
        assert_eq!(expired, vec![id]);
        assert!(shard.expire(id).is_some());
        let (n_entries, _, _, n_expired) = snapshot(&shard);
        assert_eq!(n_entries, 0);
        assert_eq!(n_expired, 1);
    }

    #[test]
    fn test_entry_lives_until_latest_downstream() {
        let mut shard = shard();
        let (mut short, _) = interest("/A/1", 1);
        short.lifetime_ms = 50;
        let sw = PacketBuf::from_vec(short.encode());
        let id = match shard.insert_interest(&short, &sw, 1, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        let (mut long, _) = interest("/A/1", 2);
        long.lifetime_ms = 200;
        let lw = PacketBuf::from_vec(long.encode());
        shard.insert_interest(&long, &lw, 2, PitToken::empty(), 0, 0);

        // first deadline purges the short downstream and re-arms
        assert!(shard.advance_timers(60 * MS).is_empty());
        assert_eq!(shard.entry(id).unwrap().dns.len(), 1);
        // the entry expires only at the latest downstream's deadline
        let expired = shard.advance_timers(210 * MS);
        assert_eq!(expired, vec![id]);
    }

    #[test]
    fn test_suppression_window_grows() {
        let cfg = SuppressConfig {
            min_ms: 10,
            max_ms: 40,
            multiplier: 2.0,
        };
        let (i, w) = interest("/A", 1);
        let mut entry = PitEntry::new(&i, w);
        assert!(entry.try_tx_upstream(5, 1, 0, &cfg));
        // inside the initial 10ms window
        assert!(!entry.try_tx_upstream(5, 2, 5 * MS, &cfg));
        // after the window: allowed, interval doubles to 20ms
        assert!(entry.try_tx_upstream(5, 2, 11 * MS, &cfg));
        assert!(!entry.try_tx_upstream(5, 3, 25 * MS, &cfg));
        assert!(entry.try_tx_upstream(5, 3, 32 * MS, &cfg));
        // interval caps at 40ms
        assert!(!entry.try_tx_upstream(5, 4, 70 * MS, &cfg));
        assert!(entry.try_tx_upstream(5, 4, 73 * MS, &cfg));
    }

    #[test]
    fn test_nack_lookup() {
        let mut shard = shard();
        let (i1, w1) = interest("/A", 7);
        let id = match shard.insert_interest(&i1, &w1, 1, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        shard
            .entry_mut(id)
            .unwrap()
            .try_tx_upstream(5, 7, 0, &SuppressConfig::default());
        let token = shard.token_of(id);
        assert_eq!(shard.find_by_nack(Some(token), 7), Some(id));
        assert_eq!(shard.find_by_nack(Some(token), 8), None);
        let c = shard.counters();
        assert_eq!(c.n_nack_hit.load(Ordering::Relaxed), 1);
        assert_eq!(c.n_nack_miss.load(Ordering::Relaxed), 1);
    }
}
