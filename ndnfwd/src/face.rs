use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_queue::ArrayQueue;
use log::{info, warn};

use ndnfw_core::packets::FaceId;
use ndnfw_core::{FwdError, Packet, PacketBuf};
use ndnfw_tables::epoch::Quiescence;

/// Fixed face table size; ids are allocated densely starting at 1.
pub const MAX_FACES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceState {
    Up,
    Down,
    Removed,
}

impl FaceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FaceState::Up,
            1 => FaceState::Down,
            _ => FaceState::Removed,
        }
    }
}

/// Driver contract for a concrete transport under a face.
///
/// `rx_burst` runs on the face's RX core, `tx_burst` on its TX core; both
/// must be cheap and non-blocking. The dispatch pointer is cached in the
/// face descriptor, so there is one virtual call per burst, not per packet.
pub trait FaceDriver: Send + Sync {
    fn locator(&self) -> String;

    /// Append up to `max` received frames to `out`; returns the count.
    fn rx_burst(&self, out: &mut Vec<PacketBuf>, max: usize) -> usize;

    /// Transmit frames from the front of `frames`; returns how many were
    /// accepted. Leftovers are dropped by the caller and counted as
    /// underrun.
    fn tx_burst(&self, frames: &mut Vec<PacketBuf>) -> usize;

    fn close(&self) {}
}

/// Per-face counters.
#[derive(Debug, Default)]
pub struct FaceCounters {
    pub rx_frames: AtomicU64,
    pub rx_interests: AtomicU64,
    pub rx_data: AtomicU64,
    pub rx_nacks: AtomicU64,
    pub rx_decode_errs: AtomicU64,
    pub rx_reassembly_drops: AtomicU64,
    pub tx_frames: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_fragmented: AtomicU64,
    /// Output-ring rejections (queue full or face not up).
    pub tx_rejects: AtomicU64,
    pub tx_cong_marked: AtomicU64,
    /// Frames the driver could not accept in a burst.
    pub tx_incomplete: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct FaceCountersSnapshot {
    pub rx_frames: u64,
    pub rx_interests: u64,
    pub rx_data: u64,
    pub rx_nacks: u64,
    pub rx_decode_errs: u64,
    pub rx_reassembly_drops: u64,
    pub tx_frames: u64,
    pub tx_packets: u64,
    pub tx_fragmented: u64,
    pub tx_rejects: u64,
    pub tx_cong_marked: u64,
    pub tx_incomplete: u64,
}

impl FaceCounters {
    pub fn snapshot(&self) -> FaceCountersSnapshot {
        FaceCountersSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_interests: self.rx_interests.load(Ordering::Relaxed),
            rx_data: self.rx_data.load(Ordering::Relaxed),
            rx_nacks: self.rx_nacks.load(Ordering::Relaxed),
            rx_decode_errs: self.rx_decode_errs.load(Ordering::Relaxed),
            rx_reassembly_drops: self.rx_reassembly_drops.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_fragmented: self.tx_fragmented.load(Ordering::Relaxed),
            tx_rejects: self.tx_rejects.load(Ordering::Relaxed),
            tx_cong_marked: self.tx_cong_marked.load(Ordering::Relaxed),
            tx_incomplete: self.tx_incomplete.load(Ordering::Relaxed),
        }
    }
}

/// A network face: driver, state, MTU, and the output ring drained by the
/// TX stage.
pub struct Face {
    pub id: FaceId,
    pub socket: u32,
    pub mtu: usize,
    state: AtomicU8,
    outq: ArrayQueue<Packet>,
    cong_threshold: usize,
    pub counters: FaceCounters,
    pub driver: Box<dyn FaceDriver>,
}

impl Face {
    pub fn state(&self) -> FaceState {
        FaceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: FaceState) {
        info!("face {}: state -> {:?}", self.id, state);
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_up(&self) -> bool {
        self.state() == FaceState::Up
    }

    /// Queue an outgoing L3 packet toward the TX stage. Drops and counts
    /// when the face is not up or the ring is full.
    pub fn enqueue_output(&self, pkt: Packet) -> bool {
        if !self.is_up() || self.outq.push(pkt).is_err() {
            self.counters.tx_rejects.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Pop one packet from the output ring (TX core only).
    pub fn dequeue_output(&self) -> Option<Packet> {
        self.outq.pop()
    }

    pub fn output_len(&self) -> usize {
        self.outq.len()
    }

    /// Whether the ring fill currently exceeds the congestion threshold.
    pub fn is_congested(&self) -> bool {
        self.outq.len() > self.cong_threshold
    }
}

/// Process-wide face registry: a fixed array of RCU slots indexed by face
/// id.
pub struct FaceTable {
    slots: Vec<ArcSwapOption<Face>>,
}

impl FaceTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_FACES).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    /// Open a face over `driver`, allocating the lowest free id.
    pub fn open(
        &self,
        driver: Box<dyn FaceDriver>,
        socket: u32,
        mtu: usize,
        output_queue_size: usize,
        cong_threshold: usize,
    ) -> Result<Arc<Face>, FwdError> {
        for id in 1..MAX_FACES {
            if self.slots[id].load().is_none() {
                let face = Arc::new(Face {
                    id: id as FaceId,
                    socket,
                    mtu,
                    state: AtomicU8::new(FaceState::Up as u8),
                    outq: ArrayQueue::new(output_queue_size.next_power_of_two()),
                    cong_threshold,
                    counters: FaceCounters::default(),
                    driver,
                });
                info!(
                    "face {}: open locator={} mtu={} socket={}",
                    id,
                    face.driver.locator(),
                    mtu,
                    socket
                );
                self.slots[id].store(Some(face.clone()));
                return Ok(face);
            }
        }
        Err(FwdError::Capacity)
    }

    pub fn get(&self, id: FaceId) -> Option<Arc<Face>> {
        self.slots.get(id as usize)?.load_full()
    }

    /// All live faces.
    pub fn iter(&self) -> Vec<Arc<Face>> {
        self.slots.iter().filter_map(|s| s.load_full()).collect()
    }

    /// Close a face: mark it removed, clear the slot, wait one quiescence
    /// so no worker still touches it, then close the driver. Idempotent.
    pub fn close(&self, id: FaceId, q: &Quiescence) -> Result<(), FwdError> {
        let Some(face) = self.get(id) else {
            return Ok(());
        };
        face.set_state(FaceState::Removed);
        self.slots[id as usize].store(None);
        q.wait_quiescent();
        // drain whatever the TX stage will no longer pick up
        let mut drained = 0;
        while face.dequeue_output().is_some() {
            drained += 1;
        }
        if drained > 0 {
            warn!("face {}: dropped {} queued packets on close", id, drained);
        }
        face.driver.close();
        Ok(())
    }
}

impl Default for FaceTable {
    fn default() -> Self {
        Self::new()
    }
}
