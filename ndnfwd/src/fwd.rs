use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use log::{debug, trace};
use parking_lot::Mutex;

use ndnfw_core::lp::{LpL3, PitToken};
use ndnfw_core::packets::{FaceId, Interest, L3Packet, Nack, NackReason};
use ndnfw_core::{Packet, PacketBuf, TscTime};
use ndnfw_tables::epoch::EpochHandle;
use ndnfw_tables::fib::{Fib, FibRealEntry, StrategyKind};
use ndnfw_tables::pcct::{InsertResult, PcctShard, SuppressConfig};

use crate::face::FaceTable;
use crate::input::FwdQueues;
use crate::latency::RunningStat;
use crate::strategy::{self, NackAction};

/// Management commands serialized onto the owning forwarding core.
#[derive(Debug, Clone, Copy)]
pub enum FwdCommand {
    ClearCs,
    SetCsCapacities { direct: usize, indirect: usize },
}

/// Forwarding-stage counters beyond what the shard tracks.
#[derive(Debug, Default)]
pub struct FwdCounters {
    pub n_no_route: AtomicU64,
    pub n_hop_limit_drops: AtomicU64,
    pub n_duplicates: AtomicU64,
    pub n_bad_tokens: AtomicU64,
    pub n_unsolicited_data: AtomicU64,
    pub n_suppressed: AtomicU64,
    pub n_cs_served: AtomicU64,
    pub n_satisfied: AtomicU64,
    pub n_nacks_sent: AtomicU64,
    pub n_retries: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct FwdCountersSnapshot {
    pub n_no_route: u64,
    pub n_hop_limit_drops: u64,
    pub n_duplicates: u64,
    pub n_bad_tokens: u64,
    pub n_unsolicited_data: u64,
    pub n_suppressed: u64,
    pub n_cs_served: u64,
    pub n_satisfied: u64,
    pub n_nacks_sent: u64,
    pub n_retries: u64,
}

impl FwdCounters {
    pub fn snapshot(&self) -> FwdCountersSnapshot {
        FwdCountersSnapshot {
            n_no_route: self.n_no_route.load(Ordering::Relaxed),
            n_hop_limit_drops: self.n_hop_limit_drops.load(Ordering::Relaxed),
            n_duplicates: self.n_duplicates.load(Ordering::Relaxed),
            n_bad_tokens: self.n_bad_tokens.load(Ordering::Relaxed),
            n_unsolicited_data: self.n_unsolicited_data.load(Ordering::Relaxed),
            n_suppressed: self.n_suppressed.load(Ordering::Relaxed),
            n_cs_served: self.n_cs_served.load(Ordering::Relaxed),
            n_satisfied: self.n_satisfied.load(Ordering::Relaxed),
            n_nacks_sent: self.n_nacks_sent.load(Ordering::Relaxed),
            n_retries: self.n_retries.load(Ordering::Relaxed),
        }
    }
}

/// One forwarding core: owns a PCCT shard, drains its typed input rings in
/// Data > Nack > Interest priority under per-queue budgets, and drives the
/// shard's timer wheel.
pub struct FwdThread {
    id: u8,
    shard: PcctShard,
    fib: Arc<Fib>,
    faces: Arc<FaceTable>,
    queues: Arc<FwdQueues>,
    suppress: SuppressConfig,
    counters: Arc<FwdCounters>,
    cmd: Arc<ArrayQueue<FwdCommand>>,
    epoch: EpochHandle,
    latency: Arc<Mutex<RunningStat>>,
    lat_mask: u64,
    lat_tick: u64,
    scratch: Vec<Packet>,
    upstreams: Vec<FaceId>,
}

impl FwdThread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u8,
        shard: PcctShard,
        fib: Arc<Fib>,
        faces: Arc<FaceTable>,
        queues: Arc<FwdQueues>,
        latency_sample_freq: u32,
        cmd: Arc<ArrayQueue<FwdCommand>>,
        epoch: EpochHandle,
    ) -> Self {
        let suppress = shard.suppress_config();
        Self {
            id,
            shard,
            fib,
            faces,
            queues,
            suppress,
            counters: Arc::new(FwdCounters::default()),
            cmd,
            epoch,
            latency: Arc::new(Mutex::new(RunningStat::default())),
            lat_mask: (1u64 << latency_sample_freq.min(30)) - 1,
            lat_tick: 0,
            scratch: Vec::with_capacity(64),
            upstreams: Vec::with_capacity(4),
        }
    }

    pub fn counters(&self) -> Arc<FwdCounters> {
        self.counters.clone()
    }

    pub fn retire(&self) {
        self.epoch.retire();
    }

    pub fn pcct_counters(&self) -> Arc<ndnfw_tables::pcct::PcctCounters> {
        self.shard.counters()
    }

    pub fn latency(&self) -> Arc<Mutex<RunningStat>> {
        self.latency.clone()
    }

    /// One burst: declare quiescence, run management commands, advance the
    /// timer wheel, then drain the rings. Returns packets processed.
    pub fn run_once(&mut self, now: TscTime) -> usize {
        self.epoch.bump();

        while let Some(cmd) = self.cmd.pop() {
            match cmd {
                FwdCommand::ClearCs => self.shard.clear_cs(),
                FwdCommand::SetCsCapacities { direct, indirect } => {
                    self.shard.set_cs_capacities(direct, indirect)
                }
            }
        }

        for id in self.shard.advance_timers(now) {
            self.on_expired(id, now);
        }

        let mut processed = 0;
        let mut scratch = std::mem::take(&mut self.scratch);

        scratch.clear();
        self.queues.data.pop_burst(&mut scratch);
        for pkt in scratch.drain(..) {
            self.sample_latency(&pkt, now);
            self.process_data(pkt, now);
            processed += 1;
        }

        self.queues.nack.pop_burst(&mut scratch);
        for pkt in scratch.drain(..) {
            self.sample_latency(&pkt, now);
            self.process_nack(pkt, now);
            processed += 1;
        }

        self.queues.interest.pop_burst(&mut scratch);
        for pkt in scratch.drain(..) {
            self.sample_latency(&pkt, now);
            self.process_interest(pkt, now);
            processed += 1;
        }

        self.scratch = scratch;
        processed
    }

    #[inline]
    fn sample_latency(&mut self, pkt: &Packet, now: TscTime) {
        let hit = self.lat_tick & self.lat_mask == 0;
        self.lat_tick = self.lat_tick.wrapping_add(1);
        if hit {
            self.latency.lock().push(now.saturating_sub(pkt.timestamp));
        }
    }

    fn process_interest(&mut self, pkt: Packet, now: TscTime) {
        let Packet {
            buf,
            lp,
            l3,
            timestamp,
            rx_face,
        } = pkt;
        let L3Packet::Interest(mut interest) = l3 else {
            debug_assert!(false, "interest ring carried non-interest");
            return;
        };

        if interest.hop_limit == Some(0) {
            self.counters.n_hop_limit_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // cached Data answers without touching the FIB
        if let Some((wire, meta)) = self.shard.lookup_cs(&interest, now) {
            self.counters.n_cs_served.fetch_add(1, Ordering::Relaxed);
            let out = Packet {
                buf: wire,
                lp: LpL3 {
                    pit_token: lp.pit_token,
                    nack_reason: None,
                    cong_mark: lp.cong_mark,
                },
                l3: L3Packet::Data(meta),
                timestamp,
                rx_face,
            };
            self.tx(rx_face, out);
            return;
        }

        // FIB lookup; forwarding hints are consulted in order and the first
        // hint with a FIB match becomes the active hint
        let fib_entry = if interest.fwd_hints.is_empty() {
            self.fib.lpm(&interest.name)
        } else {
            let mut found = None;
            for (i, hint) in interest.fwd_hints.iter().enumerate() {
                if let Some(entry) = self.fib.lpm(hint) {
                    found = Some((i, entry));
                    break;
                }
            }
            match found {
                Some((i, entry)) => {
                    interest.active_hint = Some(i);
                    Some(entry)
                }
                None => None,
            }
        };

        let Some(entry) = fib_entry else {
            trace!("fwd{}: no FIB match for {}", self.id, interest.name);
            self.send_nack(buf, lp.pit_token, NackReason::NoRoute, interest, rx_face, timestamp);
            return;
        };
        let nexthops = entry.filter_nexthops(rx_face);
        if nexthops.is_empty() {
            self.send_nack(buf, lp.pit_token, NackReason::NoRoute, interest, rx_face, timestamp);
            return;
        }
        entry
            .dyn_state(self.id as usize)
            .n_rx_interests
            .fetch_add(1, Ordering::Relaxed);

        match self
            .shard
            .insert_interest(&interest, &buf, rx_face, lp.pit_token, lp.cong_mark, now)
        {
            InsertResult::CsHit { wire, meta } => {
                self.counters.n_cs_served.fetch_add(1, Ordering::Relaxed);
                let out = Packet {
                    buf: wire,
                    lp: LpL3 {
                        pit_token: lp.pit_token,
                        nack_reason: None,
                        cong_mark: lp.cong_mark,
                    },
                    l3: L3Packet::Data(meta),
                    timestamp,
                    rx_face,
                };
                self.tx(rx_face, out);
            }
            InsertResult::Duplicate => {
                self.counters.n_duplicates.fetch_add(1, Ordering::Relaxed);
            }
            InsertResult::AllocErr => {
                trace!("fwd{}: pit alloc error", self.id);
            }
            InsertResult::New(id) | InsertResult::Found(id) => {
                self.shard.set_fib_entry(id, entry.clone());
                self.upstreams.clear();
                let mut upstreams = std::mem::take(&mut self.upstreams);
                strategy::pick_upstreams(&entry, self.id as usize, &nexthops, &mut upstreams);
                for &up in &upstreams {
                    self.tx_interest_upstream(id, &entry, &interest, up, timestamp, now);
                }
                self.upstreams = upstreams;
            }
        }
    }

    /// Forward the Interest of PIT entry `id` to upstream `up`, honoring
    /// the suppression window and stamping the entry's token.
    fn tx_interest_upstream(
        &mut self,
        id: u32,
        entry: &Arc<FibRealEntry>,
        interest: &Interest,
        up: FaceId,
        timestamp: TscTime,
        now: TscTime,
    ) {
        let Some(face) = self.faces.get(up) else {
            return;
        };
        if !face.is_up() {
            return;
        }
        let allowed = match self.shard.entry_mut(id) {
            Some(pit) => pit.try_tx_upstream(up, interest.nonce, now, &self.suppress),
            None => false,
        };
        if !allowed {
            self.counters.n_suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut out_meta = interest.clone();
        out_meta.hop_limit = interest.hop_limit.map(|h| h.saturating_sub(1));
        let wire = out_meta.encode();
        let token = PitToken::from_u64(self.shard.token_of(id));
        let out = Packet {
            buf: PacketBuf::from_vec(wire),
            lp: LpL3 {
                pit_token: token,
                nack_reason: None,
                cong_mark: 0,
            },
            l3: L3Packet::Interest(out_meta),
            timestamp,
            rx_face: 0,
        };
        if face.enqueue_output(out) {
            entry
                .dyn_state(self.id as usize)
                .n_tx_interests
                .fetch_add(1, Ordering::Relaxed);
            face.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn process_data(&mut self, pkt: Packet, now: TscTime) {
        let L3Packet::Data(data) = &pkt.l3 else {
            debug_assert!(false, "data ring carried non-data");
            return;
        };
        let token = pkt.lp.pit_token.as_u64();
        if !pkt.lp.pit_token.is_empty() && token.is_none() {
            self.counters.n_bad_tokens.fetch_add(1, Ordering::Relaxed);
        }

        let matches = self.shard.find_by_data(data, token);
        if matches.is_empty() {
            trace!("fwd{}: unsolicited data {}", self.id, data.name);
            self.counters
                .n_unsolicited_data
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        for id in matches {
            let Some(pit) = self.shard.satisfy(id) else {
                continue;
            };
            if let Some(entry) = &pit.fib_entry {
                entry
                    .dyn_state(self.id as usize)
                    .n_rx_data
                    .fetch_add(1, Ordering::Relaxed);
            }
            for dn in pit.live_dns(now) {
                let Some(face) = self.faces.get(dn.face) else {
                    continue;
                };
                if !face.is_up() {
                    trace!("fwd{}: no data to {} (face down)", self.id, dn.face);
                    continue;
                }
                let out = Packet {
                    buf: pkt.buf.clone(),
                    lp: LpL3 {
                        pit_token: dn.token,
                        nack_reason: None,
                        cong_mark: dn.cong_mark.max(pkt.lp.cong_mark),
                    },
                    l3: pkt.l3.clone(),
                    timestamp: pkt.timestamp,
                    rx_face: pkt.rx_face,
                };
                if face.enqueue_output(out) {
                    self.counters.n_satisfied.fetch_add(1, Ordering::Relaxed);
                    face.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.shard.insert_cs(id, data, pkt.buf.clone(), now);
        }
    }

    fn process_nack(&mut self, pkt: Packet, now: TscTime) {
        let L3Packet::Nack(nack) = &pkt.l3 else {
            debug_assert!(false, "nack ring carried non-nack");
            return;
        };
        let token = pkt.lp.pit_token.as_u64();
        let Some(id) = self.shard.find_by_nack(token, nack.interest.nonce) else {
            return;
        };

        let (kind, nexthops) = {
            let pit = self.shard.entry_mut(id).expect("entry just found");
            if let Some(up) = pit.ups.iter_mut().find(|up| up.face == pkt.rx_face) {
                up.nack = Some(nack.reason);
            }
            match &pit.fib_entry {
                Some(entry) => {
                    entry
                        .dyn_state(self.id as usize)
                        .n_rx_nacks
                        .fetch_add(1, Ordering::Relaxed);
                    (entry.strategy, entry.nexthops.clone())
                }
                None => (StrategyKind::BestRoute, Vec::new()),
            }
        };

        let action = {
            let pit = self.shard.entry(id).expect("entry just found");
            strategy::on_nack(kind, pit, &nexthops)
        };
        match action {
            NackAction::Ignore => {}
            NackAction::Retry(up) => {
                debug!("fwd{}: nack {} -> retry via {}", self.id, nack.reason, up);
                self.counters.n_retries.fetch_add(1, Ordering::Relaxed);
                let entry = self
                    .shard
                    .entry(id)
                    .and_then(|pit| pit.fib_entry.clone());
                if let Some(entry) = entry {
                    let interest = nack.interest.clone();
                    self.tx_interest_upstream(id, &entry, &interest, up, pkt.timestamp, now);
                }
            }
            NackAction::Propagate => {
                debug!("fwd{}: nack {} -> propagate", self.id, nack.reason);
                let Some(pit) = self.shard.take_pit(id) else {
                    return;
                };
                for dn in pit.live_dns(now) {
                    let Some(face) = self.faces.get(dn.face) else {
                        continue;
                    };
                    if !face.is_up() {
                        continue;
                    }
                    let out = Packet {
                        buf: pit.interest_wire.clone(),
                        lp: LpL3 {
                            pit_token: dn.token,
                            nack_reason: Some(nack.reason),
                            cong_mark: pkt.lp.cong_mark,
                        },
                        l3: L3Packet::Nack(Nack {
                            reason: nack.reason,
                            interest: nack.interest.clone(),
                        }),
                        timestamp: pkt.timestamp,
                        rx_face: pkt.rx_face,
                    };
                    if face.enqueue_output(out) {
                        self.counters.n_nacks_sent.fetch_add(1, Ordering::Relaxed);
                        face.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Return a Nack toward the downstream that sent the Interest, reusing
    /// its wire and token.
    fn send_nack(
        &mut self,
        buf: PacketBuf,
        dn_token: PitToken,
        reason: NackReason,
        interest: Interest,
        dn_face: FaceId,
        timestamp: TscTime,
    ) {
        self.counters.n_no_route.fetch_add(1, Ordering::Relaxed);
        let out = Packet {
            buf,
            lp: LpL3 {
                pit_token: dn_token,
                nack_reason: Some(reason),
                cong_mark: 0,
            },
            l3: L3Packet::Nack(Nack { reason, interest }),
            timestamp,
            rx_face: dn_face,
        };
        if self.tx(dn_face, out) {
            self.counters.n_nacks_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn tx(&self, face_id: FaceId, pkt: Packet) -> bool {
        match self.faces.get(face_id) {
            Some(face) => {
                let ok = face.enqueue_output(pkt);
                if ok {
                    face.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
                }
                ok
            }
            None => false,
        }
    }

    fn on_expired(&mut self, id: u32, now: TscTime) {
        if let Some(pit) = self.shard.entry(id) {
            let kind = pit
                .fib_entry
                .as_ref()
                .map(|e| e.strategy)
                .unwrap_or_default();
            // a fully expired entry has no live downstream left, so the
            // strategy can never ask for a retry here
            debug_assert!(!strategy::on_expiry(kind, pit, now));
        }
        if self.shard.expire(id).is_some() {
            trace!("fwd{}: pit entry {} expired", self.id, id);
        }
    }
}
