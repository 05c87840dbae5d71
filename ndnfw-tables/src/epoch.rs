use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Epoch value marking a worker that has left the data plane for good.
const RETIRED: u64 = u64::MAX;

/// Read-side quiescence tracking for RCU-style reclamation.
///
/// Every worker owns one padded epoch counter and bumps it at the top of each
/// burst. The management thread's [`Quiescence::wait_quiescent`] returns once
/// every worker has either advanced past the snapshot or retired, at which
/// point no worker can still hold a reference obtained before the snapshot.
///
/// The wait only applies while the data plane is running (`activate`);
/// before launch and after teardown there are no concurrent readers and
/// reclamation is immediate.
pub struct Quiescence {
    epochs: Vec<Arc<CachePadded<AtomicU64>>>,
    active: AtomicBool,
}

impl Quiescence {
    pub fn new(n_workers: usize) -> Self {
        Self {
            epochs: (0..n_workers)
                .map(|_| Arc::new(CachePadded::new(AtomicU64::new(0))))
                .collect(),
            active: AtomicBool::new(false),
        }
    }

    pub fn n_workers(&self) -> usize {
        self.epochs.len()
    }

    /// Workers are about to start busy-polling.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Workers have been joined.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Hand out the counter for worker `index`.
    pub fn handle(&self, index: usize) -> EpochHandle {
        EpochHandle {
            epoch: self.epochs[index].clone(),
        }
    }

    /// Block until every worker has declared quiescence at least once.
    ///
    /// Spins with a yield; only ever called from the management thread.
    pub fn wait_quiescent(&self) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let snapshot: Vec<u64> = self
            .epochs
            .iter()
            .map(|e| e.load(Ordering::Acquire))
            .collect();
        loop {
            let all_advanced = self.epochs.iter().zip(&snapshot).all(|(e, &before)| {
                let now = e.load(Ordering::Acquire);
                now == RETIRED || before == RETIRED || now != before
            });
            if all_advanced {
                return;
            }
            std::thread::yield_now();
        }
    }
}

/// A worker's own epoch counter.
pub struct EpochHandle {
    epoch: Arc<CachePadded<AtomicU64>>,
}

impl EpochHandle {
    /// Declare quiescence: no reference from a previous burst survives.
    #[inline]
    pub fn bump(&self) {
        let mut next = self.epoch.load(Ordering::Relaxed).wrapping_add(1);
        if next == RETIRED {
            next = 0;
        }
        self.epoch.store(next, Ordering::Release);
    }

    /// Mark this worker as permanently stopped.
    pub fn retire(&self) {
        self.epoch.store(RETIRED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_inactive_wait_is_immediate() {
        let q = Quiescence::new(4);
        q.wait_quiescent();
    }

    #[test]
    fn test_wait_returns_after_all_bump() {
        let q = Arc::new(Quiescence::new(2));
        q.activate();
        let h0 = q.handle(0);
        let h1 = q.handle(1);
        let done = Arc::new(AtomicBool::new(false));

        let waiter = {
            let q = q.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                q.wait_quiescent();
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));
        h0.bump();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));
        h1.bump();
        waiter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_retired_worker_does_not_block() {
        let q = Quiescence::new(2);
        q.activate();
        let h0 = q.handle(0);
        let h1 = q.handle(1);
        h1.retire();
        let waiter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            h0.bump();
        });
        q.wait_quiescent();
        waiter.join().unwrap();
    }
}
