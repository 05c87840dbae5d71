use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use ndnfw_core::lp::{self, LpReassembler};
use ndnfw_core::packets::{FaceId, L3Packet};
use ndnfw_core::{Packet, PacketBuf, TscTime};
use ndnfw_tables::epoch::EpochHandle;
use ndnfw_tables::ndt::NdtQuerier;

use crate::face::{Face, FaceTable};
use crate::ring::PktQueue;

/// The three typed rings feeding one forwarding core.
pub struct FwdQueues {
    pub interest: PktQueue,
    pub data: PktQueue,
    pub nack: PktQueue,
}

/// Input demux counters: per-type queued/dropped plus error classes.
#[derive(Debug, Default)]
pub struct InputCounters {
    pub n_interests_queued: AtomicU64,
    pub n_interests_dropped: AtomicU64,
    pub n_data_queued: AtomicU64,
    pub n_data_dropped: AtomicU64,
    pub n_nacks_queued: AtomicU64,
    pub n_nacks_dropped: AtomicU64,
    pub n_decode_errs: AtomicU64,
    pub n_token_errs: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct InputCountersSnapshot {
    pub n_interests_queued: u64,
    pub n_interests_dropped: u64,
    pub n_data_queued: u64,
    pub n_data_dropped: u64,
    pub n_nacks_queued: u64,
    pub n_nacks_dropped: u64,
    pub n_decode_errs: u64,
    pub n_token_errs: u64,
}

impl InputCounters {
    pub fn snapshot(&self) -> InputCountersSnapshot {
        InputCountersSnapshot {
            n_interests_queued: self.n_interests_queued.load(Ordering::Relaxed),
            n_interests_dropped: self.n_interests_dropped.load(Ordering::Relaxed),
            n_data_queued: self.n_data_queued.load(Ordering::Relaxed),
            n_data_dropped: self.n_data_dropped.load(Ordering::Relaxed),
            n_nacks_queued: self.n_nacks_queued.load(Ordering::Relaxed),
            n_nacks_dropped: self.n_nacks_dropped.load(Ordering::Relaxed),
            n_decode_errs: self.n_decode_errs.load(Ordering::Relaxed),
            n_token_errs: self.n_token_errs.load(Ordering::Relaxed),
        }
    }
}

/// Per-RX-core input stage: poll faces, reassemble, classify, and dispatch
/// to the owning forwarding core.
///
/// Faces are sharded across input cores by `face_id % n_inputs`; the
/// reassemblers for those faces are exclusively owned here.
pub struct InputThread {
    id: usize,
    n_inputs: usize,
    faces: Arc<FaceTable>,
    ndt: NdtQuerier,
    queues: Vec<Arc<FwdQueues>>,
    reassemblers: HashMap<FaceId, LpReassembler>,
    reassembler_capacity: usize,
    burst: usize,
    counters: Arc<InputCounters>,
    epoch: EpochHandle,
    rx_scratch: Vec<PacketBuf>,
}

impl InputThread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        n_inputs: usize,
        faces: Arc<FaceTable>,
        ndt: NdtQuerier,
        queues: Vec<Arc<FwdQueues>>,
        reassembler_capacity: usize,
        burst: usize,
        epoch: EpochHandle,
    ) -> Self {
        Self {
            id,
            n_inputs: n_inputs.max(1),
            faces,
            ndt,
            queues,
            reassemblers: HashMap::new(),
            reassembler_capacity,
            burst,
            counters: Arc::new(InputCounters::default()),
            epoch,
            rx_scratch: Vec::with_capacity(burst),
        }
    }

    pub fn counters(&self) -> Arc<InputCounters> {
        self.counters.clone()
    }

    pub fn retire(&self) {
        self.epoch.retire();
    }

    /// One burst over all faces owned by this core. Returns the number of
    /// frames processed.
    pub fn run_once(&mut self, now: TscTime) -> usize {
        self.epoch.bump();
        let mut processed = 0;
        for face in self.faces.iter() {
            if face.id as usize % self.n_inputs != self.id || !face.is_up() {
                continue;
            }
            self.rx_scratch.clear();
            let n = face.driver.rx_burst(&mut self.rx_scratch, self.burst);
            if n == 0 {
                continue;
            }
            face.counters.rx_frames.fetch_add(n as u64, Ordering::Relaxed);
            let frames: Vec<PacketBuf> = self.rx_scratch.drain(..).collect();
            for frame in frames {
                self.process_frame(&face, frame, now);
                processed += 1;
            }
        }
        processed
    }

    fn process_frame(&mut self, face: &Arc<Face>, frame: PacketBuf, now: TscTime) {
        // phase 1: parse the frame while borrowing its bytes; anything that
        // survives the borrow is owned
        enum Step {
            Trim(std::ops::Range<usize>, ndnfw_core::lp::LpL3),
            Owned(Vec<u8>, ndnfw_core::lp::LpL3),
        }
        let step = {
            let flat;
            let wire: &[u8] = match frame.contiguous() {
                Some(s) => s,
                None => {
                    flat = frame.to_vec();
                    &flat
                }
            };
            let parsed = match lp::decode_frame(wire) {
                Ok(parsed) => parsed,
                Err(e) => {
                    trace!("face {}: lp decode error: {}", face.id, e);
                    self.count_decode_err(face);
                    return;
                }
            };
            let Some(payload) = parsed.payload.clone() else {
                // keep-alive style frame without payload
                return;
            };
            match parsed.frag {
                None => Step::Trim(payload, parsed.lp),
                Some(header) => {
                    let reassembler = self
                        .reassemblers
                        .entry(face.id)
                        .or_insert_with(|| LpReassembler::new(self.reassembler_capacity));
                    match reassembler.accept(header, parsed.lp, &wire[payload]) {
                        Ok(Some((l3_wire, lp0))) => Step::Owned(l3_wire, lp0),
                        Ok(None) => return,
                        Err(e) => {
                            trace!("face {}: reassembly drop: {}", face.id, e);
                            face.counters
                                .rx_reassembly_drops
                                .fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    }
                }
            }
        };

        // phase 2: narrow the frame to the L3 wire (zero-copy for the
        // common single-frame case)
        let (l3_buf, lp_fields) = match step {
            Step::Trim(range, lp) => {
                let mut buf = frame;
                if !buf.trim(range.start, range.len()) {
                    let full = buf.to_vec();
                    buf = PacketBuf::from_vec(full[range].to_vec());
                }
                (buf, lp)
            }
            Step::Owned(l3_wire, lp) => (PacketBuf::from_vec(l3_wire), lp),
        };

        let l3 = {
            let flat2;
            let l3_wire: &[u8] = match l3_buf.contiguous() {
                Some(s) => s,
                None => {
                    flat2 = l3_buf.to_vec();
                    &flat2
                }
            };
            match L3Packet::decode(l3_wire, lp_fields.nack_reason) {
                Ok(l3) => l3,
                Err(e) => {
                    debug!("face {}: l3 decode error: {}", face.id, e);
                    self.count_decode_err(face);
                    return;
                }
            }
        };

        // Interests dispatch by NDT; Data and Nacks by the forwarder id in
        // the PIT token's top byte.
        let dest = match &l3 {
            L3Packet::Interest(interest) => {
                face.counters.rx_interests.fetch_add(1, Ordering::Relaxed);
                self.ndt.lookup(&interest.name) as usize
            }
            L3Packet::Data(_) | L3Packet::Nack(_) => {
                if matches!(l3, L3Packet::Data(_)) {
                    face.counters.rx_data.fetch_add(1, Ordering::Relaxed);
                } else {
                    face.counters.rx_nacks.fetch_add(1, Ordering::Relaxed);
                }
                match lp_fields.pit_token.as_u64() {
                    Some(token) => (token >> 56) as usize,
                    None => {
                        self.counters.n_token_errs.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        };
        let Some(queues) = self.queues.get(dest) else {
            self.counters.n_token_errs.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let pkt = Packet {
            buf: l3_buf,
            lp: lp_fields,
            l3,
            timestamp: now,
            rx_face: face.id,
        };
        let (queue, queued, dropped) = match &pkt.l3 {
            L3Packet::Interest(_) => (
                &queues.interest,
                &self.counters.n_interests_queued,
                &self.counters.n_interests_dropped,
            ),
            L3Packet::Data(_) => (
                &queues.data,
                &self.counters.n_data_queued,
                &self.counters.n_data_dropped,
            ),
            L3Packet::Nack(_) => (
                &queues.nack,
                &self.counters.n_nacks_queued,
                &self.counters.n_nacks_dropped,
            ),
        };
        if queue.push(pkt) {
            queued.fetch_add(1, Ordering::Relaxed);
        } else {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn count_decode_err(&self, face: &Arc<Face>) {
        face.counters.rx_decode_errs.fetch_add(1, Ordering::Relaxed);
        self.counters.n_decode_errs.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::mock::{MockDriver, MockDriverHandle};
    use ndnfw_core::lp::{LpFragmenter, LpL3, PitToken};
    use ndnfw_core::name::Name;
    use ndnfw_core::packets::{Data, Interest};
    use ndnfw_core::BufferPool;
    use ndnfw_tables::epoch::Quiescence;
    use ndnfw_tables::ndt::{Ndt, NdtConfig};

    fn setup(n_fwds: usize) -> (InputThread, Arc<FaceTable>, Arc<MockDriver>, Vec<Arc<FwdQueues>>, Arc<Ndt>) {
        let faces = Arc::new(FaceTable::new());
        let driver = MockDriver::new();
        faces
            .open(Box::new(MockDriverHandle(driver.clone())), 0, 1500, 64, 48)
            .unwrap();
        let ndt = Arc::new(Ndt::new(NdtConfig {
            prefix_len: 2,
            index_bits: 8,
            sample_freq: 8,
        }));
        ndt.randomize(n_fwds);
        let queues: Vec<Arc<FwdQueues>> = (0..n_fwds)
            .map(|_| {
                Arc::new(FwdQueues {
                    interest: PktQueue::new(64, 32),
                    data: PktQueue::new(64, 64),
                    nack: PktQueue::new(64, 64),
                })
            })
            .collect();
        let q = Quiescence::new(1);
        let input = InputThread::new(
            0,
            1,
            faces.clone(),
            ndt.querier(),
            queues.clone(),
            16,
            64,
            q.handle(0),
        );
        (input, faces, driver, queues, ndt)
    }

    #[test]
    fn test_interest_dispatch_by_ndt() {
        let (mut input, _faces, driver, queues, ndt) = setup(2);
        let interest = Interest::new(&Name::from_str("/a/b/c"), 7);
        driver.inject(interest.encode());
        assert_eq!(input.run_once(1), 1);

        let dest = ndt.lookup(&interest.name) as usize;
        let mut out = Vec::new();
        assert_eq!(queues[dest].interest.pop_burst(&mut out), 1);
        assert_eq!(out[0].rx_face, 1);
        assert_eq!(out[0].timestamp, 1);
        let other = 1 - dest;
        assert!(queues[other].interest.is_empty());
        assert_eq!(input.counters().snapshot().n_interests_queued, 1);
    }

    #[test]
    fn test_data_dispatch_by_token() {
        let (mut input, _faces, driver, queues, _ndt) = setup(2);
        let pool = BufferPool::new(2048, 8, 0);
        let wire = Data::build(&Name::from_str("/a/b"), 0, b"x");
        let mut lp = LpL3::default();
        // forwarder 1 in the token's top byte
        lp.pit_token = PitToken::from_u64(1u64 << 56 | 0x42);
        let mut frag = LpFragmenter::new(1500);
        let frames = frag
            .fragment(PacketBuf::from_vec(wire), &lp, &pool)
            .unwrap();
        driver.inject(frames[0].to_vec());
        input.run_once(2);

        let mut out = Vec::new();
        assert_eq!(queues[1].data.pop_burst(&mut out), 1);
        assert!(matches!(out[0].l3, L3Packet::Data(_)));
        assert_eq!(out[0].lp.pit_token.as_u64(), Some(1u64 << 56 | 0x42));
    }

    #[test]
    fn test_tokenless_data_dropped() {
        let (mut input, _faces, driver, queues, _ndt) = setup(1);
        driver.inject(Data::build(&Name::from_str("/a"), 0, b"x"));
        input.run_once(3);
        assert!(queues[0].data.is_empty());
        assert_eq!(input.counters().snapshot().n_token_errs, 1);
    }

    #[test]
    fn test_fragmented_frames_reassemble() {
        let (mut input, _faces, driver, queues, _ndt) = setup(1);
        let pool = BufferPool::new(2048, 64, 0);
        let content = vec![0x77u8; 3000];
        let wire = Data::build(&Name::from_str("/big"), 0, &content);
        let mut lp = LpL3::default();
        lp.pit_token = PitToken::from_u64(0x99);
        let mut frag = LpFragmenter::new(1200);
        let frames = frag
            .fragment(PacketBuf::from_vec(wire.clone()), &lp, &pool)
            .unwrap();
        assert!(frames.len() > 1);
        for frame in &frames {
            driver.inject(frame.to_vec());
        }
        input.run_once(4);

        let mut out = Vec::new();
        assert_eq!(queues[0].data.pop_burst(&mut out), 1);
        assert_eq!(out[0].buf.to_vec(), wire);
    }

    #[test]
    fn test_decode_error_counted() {
        let (mut input, faces, driver, _queues, _ndt) = setup(1);
        driver.inject(vec![0xFF, 0xFF, 0xFF]);
        input.run_once(5);
        assert_eq!(input.counters().snapshot().n_decode_errs, 1);
        let face = faces.get(1).unwrap();
        assert_eq!(face.counters.snapshot().rx_decode_errs, 1);
    }

    #[test]
    fn test_queue_full_drops() {
        let (mut input, _faces, driver, queues, _ndt) = setup(1);
        // interest queue capacity is 64; fill it beyond capacity
        for i in 0..70 {
            driver.inject(Interest::new(&Name::from_str("/x"), i).encode());
        }
        input.run_once(6);
        input.run_once(7);
        let snap = input.counters().snapshot();
        assert_eq!(snap.n_interests_queued, 64);
        assert_eq!(snap.n_interests_dropped, 6);
        assert_eq!(queues[0].interest.len(), 64);
    }
}
