use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use ndnfw_core::Packet;

/// Bounded lock-free packet queue between cores.
///
/// Many producers, one consumer. A full queue drops at the producer and
/// counts; no backpressure propagates upstream.
pub struct PktQueue {
    ring: ArrayQueue<Packet>,
    dequeue_burst: usize,
    n_queued: AtomicU64,
    n_dropped: AtomicU64,
}

impl PktQueue {
    /// Capacity is rounded up to a power of two.
    pub fn new(capacity: usize, dequeue_burst: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.next_power_of_two()),
            dequeue_burst: dequeue_burst.max(1),
            n_queued: AtomicU64::new(0),
            n_dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue; the packet is dropped (and counted) when the ring is full.
    pub fn push(&self, pkt: Packet) -> bool {
        match self.ring.push(pkt) {
            Ok(()) => {
                self.n_queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_rejected) => {
                self.n_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Dequeue up to the configured burst budget into `out`.
    pub fn pop_burst(&self, out: &mut Vec<Packet>) -> usize {
        let mut n = 0;
        while n < self.dequeue_burst {
            match self.ring.pop() {
                Some(pkt) => {
                    out.push(pkt);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn n_queued(&self) -> u64 {
        self.n_queued.load(Ordering::Relaxed)
    }

    pub fn n_dropped(&self) -> u64 {
        self.n_dropped.load(Ordering::Relaxed)
    }
}
