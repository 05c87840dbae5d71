use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ndnfw_core::name::PName;
use ndnfw_core::FwdError;

/// Fixed seed so `randomize` produces the same table on every run with the
/// same forwarder count (replayable dispatch).
const RANDOMIZE_SEED: u64 = 0x4E44_5431;

/// NDT configuration.
#[derive(Debug, Clone, Copy)]
pub struct NdtConfig {
    /// Number of leading name components hashed for dispatch.
    pub prefix_len: usize,
    /// log2 of the table size.
    pub index_bits: u32,
    /// Each lookup samples its hit counter with probability
    /// `1 / 2^sample_freq`.
    pub sample_freq: u32,
}

impl Default for NdtConfig {
    fn default() -> Self {
        Self {
            prefix_len: 2,
            index_bits: 16,
            sample_freq: 8,
        }
    }
}

/// Name Dispatch Table: maps a truncated name-prefix hash to the index of
/// the forwarding core that owns the name.
///
/// The table is a flat array of atomic bytes: readers on any core load
/// without synchronisation, and management updates are single-byte stores
/// that readers observe as either the old or the new value.
pub struct Ndt {
    cfg: NdtConfig,
    table: Arc<Vec<AtomicU8>>,
    queriers: Mutex<Vec<Arc<Vec<AtomicU64>>>>,
}

impl Ndt {
    pub fn new(cfg: NdtConfig) -> Self {
        let size = 1usize << cfg.index_bits;
        let table = Arc::new((0..size).map(|_| AtomicU8::new(0)).collect::<Vec<_>>());
        Self {
            cfg,
            table,
            queriers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> NdtConfig {
        self.cfg
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    fn index_mask(&self) -> u64 {
        (self.table.len() - 1) as u64
    }

    /// Table index of a name under the truncation rule: the hash covers the
    /// first `prefix_len` components, or all of them when the name is
    /// shorter.
    pub fn index_of(&self, name: &PName) -> usize {
        (name.dispatch_hash(self.cfg.prefix_len) & self.index_mask()) as usize
    }

    /// Unsampled lookup for management and tests.
    pub fn lookup(&self, name: &PName) -> u8 {
        self.table[self.index_of(name)].load(Ordering::Relaxed)
    }

    /// Fill the table so each of `n` forwarder indices gets an approximately
    /// equal share, shuffled by a fixed-seed generator.
    pub fn randomize(&self, n: usize) {
        debug_assert!(n > 0 && n <= u8::MAX as usize);
        let size = self.table.len();
        let mut values: Vec<u8> = (0..size).map(|i| (i % n) as u8).collect();
        let mut rng = StdRng::seed_from_u64(RANDOMIZE_SEED);
        // Fisher-Yates
        for i in (1..size).rev() {
            let j = rng.gen_range(0..=i);
            values.swap(i, j);
        }
        for (slot, value) in self.table.iter().zip(values) {
            slot.store(value, Ordering::Relaxed);
        }
        info!("NDT randomized across {} forwarders", n);
    }

    /// Write one byte. Readers see either the old or the new value.
    pub fn update(&self, index: usize, value: u8) -> Result<(), FwdError> {
        if index >= self.table.len() {
            return Err(FwdError::InvalidArgument(format!(
                "NDT index {} out of range",
                index
            )));
        }
        self.table[index].store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Create the per-thread lookup handle used on RX cores.
    pub fn querier(&self) -> NdtQuerier {
        let counters: Arc<Vec<AtomicU64>> =
            Arc::new((0..self.table.len()).map(|_| AtomicU64::new(0)).collect());
        self.queriers.lock().push(counters.clone());
        NdtQuerier {
            cfg: self.cfg,
            table: self.table.clone(),
            counters,
            mask: self.index_mask(),
            sample_mask: (1u32 << self.cfg.sample_freq) - 1,
            lfsr: 0xACE1_u32 | 1,
        }
    }

    /// Aggregate sampled hit counters across all queriers, per table slot.
    pub fn read_counters(&self) -> Vec<u64> {
        let queriers = self.queriers.lock();
        let mut sums = vec![0u64; self.table.len()];
        for counters in queriers.iter() {
            for (sum, c) in sums.iter_mut().zip(counters.iter()) {
                *sum += c.load(Ordering::Relaxed);
            }
        }
        sums
    }
}

/// Per-RX-core NDT lookup handle with thread-local hit sampling.
pub struct NdtQuerier {
    cfg: NdtConfig,
    table: Arc<Vec<AtomicU8>>,
    counters: Arc<Vec<AtomicU64>>,
    mask: u64,
    sample_mask: u32,
    lfsr: u32,
}

impl NdtQuerier {
    /// Look up the owning forwarder for a name, sampling the slot hit
    /// counter with probability `1 / 2^sample_freq`.
    pub fn lookup(&mut self, name: &PName) -> u8 {
        let index = (name.dispatch_hash(self.cfg.prefix_len) & self.mask) as usize;
        // xorshift; cheap thread-local sampling decision
        self.lfsr ^= self.lfsr << 13;
        self.lfsr ^= self.lfsr >> 17;
        self.lfsr ^= self.lfsr << 5;
        if self.lfsr & self.sample_mask == 0 {
            self.counters[index].fetch_add(1, Ordering::Relaxed);
        }
        self.table[index].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndnfw_core::name::Name;

    fn pname(uri: &str) -> PName {
        PName::from_name(&Name::from_str(uri)).unwrap()
    }

    #[test]
    fn test_randomize_bounds_and_balance() {
        let ndt = Ndt::new(NdtConfig {
            prefix_len: 2,
            index_bits: 12,
            sample_freq: 2,
        });
        let n = 4usize;
        ndt.randomize(n);
        let mut counts = vec![0usize; n];
        for i in 0..ndt.len() {
            let v = ndt.table[i].load(Ordering::Relaxed);
            assert!((v as usize) < n, "byte {} >= {}", v, n);
            counts[v as usize] += 1;
        }
        let share = ndt.len() / n;
        for c in counts {
            assert!(c.abs_diff(share) <= 1, "uneven share: {} vs {}", c, share);
        }
    }

    #[test]
    fn test_randomize_deterministic() {
        let a = Ndt::new(NdtConfig::default());
        let b = Ndt::new(NdtConfig::default());
        a.randomize(8);
        b.randomize(8);
        for i in 0..a.len() {
            assert_eq!(
                a.table[i].load(Ordering::Relaxed),
                b.table[i].load(Ordering::Relaxed)
            );
        }
    }

    #[test]
    fn test_name_distribution_within_five_percent() {
        let ndt = Ndt::new(NdtConfig {
            prefix_len: 2,
            index_bits: 16,
            sample_freq: 8,
        });
        let n = 4usize;
        ndt.randomize(n);
        let samples = 65_536usize;
        let mut counts = vec![0usize; n];
        for i in 0..samples {
            let name = Name::from_str(&format!("/pfx{}/sub{}/leaf", i, i * 7));
            let v = ndt.lookup(&PName::from_name(&name).unwrap());
            counts[v as usize] += 1;
        }
        let expected = samples / n;
        let tolerance = expected / 20;
        for c in counts {
            assert!(
                c.abs_diff(expected) <= tolerance,
                "count {} outside {}±{}",
                c,
                expected,
                tolerance
            );
        }
    }

    #[test]
    fn test_truncation_rule() {
        let ndt = Ndt::new(NdtConfig {
            prefix_len: 2,
            index_bits: 16,
            sample_freq: 8,
        });
        // same first two components: same index
        assert_eq!(ndt.index_of(&pname("/A/A/C")), ndt.index_of(&pname("/A/A/D")));
        // a one-component name hashes the single component it has
        let short = pname("/A");
        assert_eq!(
            ndt.index_of(&short),
            (short.prefix_hash(1) & (ndt.len() as u64 - 1)) as usize
        );
        let deep = pname("/A/X/Y");
        assert_eq!(
            ndt.index_of(&deep),
            (deep.prefix_hash(2) & (ndt.len() as u64 - 1)) as usize
        );
    }

    #[test]
    fn test_update_and_bounds() {
        let ndt = Ndt::new(NdtConfig {
            prefix_len: 2,
            index_bits: 4,
            sample_freq: 1,
        });
        assert!(ndt.update(3, 7).is_ok());
        assert_eq!(ndt.table[3].load(Ordering::Relaxed), 7);
        assert!(matches!(
            ndt.update(16, 0),
            Err(FwdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sampled_counters_accumulate() {
        let ndt = Ndt::new(NdtConfig {
            prefix_len: 2,
            index_bits: 8,
            sample_freq: 0, // sample every lookup
        });
        ndt.randomize(2);
        let mut querier = ndt.querier();
        let name = pname("/hot/name");
        for _ in 0..100 {
            querier.lookup(&name);
        }
        let counters = ndt.read_counters();
        assert_eq!(counters[ndt.index_of(&name)], 100);
        assert_eq!(counters.iter().sum::<u64>(), 100);
    }
}
