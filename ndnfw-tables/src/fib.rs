use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_utils::CachePadded;
use log::{debug, info};
use parking_lot::Mutex;

use ndnfw_core::name::{Name, PName};
use ndnfw_core::packets::FaceId;
use ndnfw_core::FwdError;

use crate::epoch::Quiescence;

/// Maximum nexthops per FIB entry.
pub const MAX_NEXTHOPS: usize = 8;

/// Forwarding strategy selector, one per FIB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    BestRoute,
    Multicast,
    RoundRobin,
}

impl std::str::FromStr for StrategyKind {
    type Err = FwdError;

    fn from_str(s: &str) -> Result<Self, FwdError> {
        match s {
            "best-route" => Ok(StrategyKind::BestRoute),
            "multicast" => Ok(StrategyKind::Multicast),
            "round-robin" => Ok(StrategyKind::RoundRobin),
            other => Err(FwdError::InvalidArgument(format!(
                "unknown strategy {:?}",
                other
            ))),
        }
    }
}

/// Per-forwarder dynamic state of a FIB entry: traffic counters and strategy
/// scratch. Shared across snapshot generations so management replacements do
/// not reset it.
#[derive(Debug, Default)]
pub struct FibEntryDyn {
    pub n_rx_interests: AtomicU64,
    pub n_rx_data: AtomicU64,
    pub n_rx_nacks: AtomicU64,
    pub n_tx_interests: AtomicU64,
    /// Round-robin strategy cursor.
    pub rr_index: AtomicUsize,
}

/// A real FIB entry registered by the user.
#[derive(Debug)]
pub struct FibRealEntry {
    /// Name TLV-VALUE of the prefix.
    pub name: Vec<u8>,
    pub n_comps: u8,
    pub nexthops: Vec<FaceId>,
    pub strategy: StrategyKind,
    dyn_: Arc<Vec<CachePadded<FibEntryDyn>>>,
}

impl FibRealEntry {
    /// Dynamic state for the given forwarding core.
    pub fn dyn_state(&self, fwd: usize) -> &FibEntryDyn {
        &self.dyn_[fwd]
    }

    /// Nexthops excluding the downstream face the Interest arrived on.
    pub fn filter_nexthops(&self, exclude: FaceId) -> Vec<FaceId> {
        self.nexthops
            .iter()
            .copied()
            .filter(|&nh| nh != exclude)
            .collect()
    }
}

/// A node in one per-length hash table: a real entry, a virtual marker for
/// real entries registered below this prefix, or both.
#[derive(Clone, Default)]
struct FibNode {
    real: Option<Arc<FibRealEntry>>,
    /// Number of real entries at strictly greater lengths sharing this
    /// prefix; the node is virtual while this is nonzero and `real` is none.
    deeper: u32,
}

struct FibTables {
    /// `levels[l]` holds all nodes whose prefix has `l` components;
    /// index 0 is unused.
    levels: Vec<HashMap<Vec<u8>, FibNode>>,
    n_nodes: usize,
    n_real: usize,
}

impl FibTables {
    fn empty(max_depth: usize) -> Self {
        Self {
            levels: (0..=max_depth).map(|_| HashMap::new()).collect(),
            n_nodes: 0,
            n_real: 0,
        }
    }

    fn snapshot(&self) -> Self {
        Self {
            levels: self.levels.clone(),
            n_nodes: self.n_nodes,
            n_real: self.n_real,
        }
    }
}

/// FIB configuration.
#[derive(Debug, Clone, Copy)]
pub struct FibConfig {
    /// Total node budget (real plus virtual).
    pub capacity: usize,
    /// Prefix length at which `lpm` begins probing.
    pub start_depth: usize,
    /// Longest registrable prefix.
    pub max_depth: usize,
}

impl Default for FibConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            start_depth: 1,
            max_depth: 8,
        }
    }
}

/// Forwarding Information Base: longest-prefix match over NDN names.
///
/// Reads are lock-free against a published snapshot; writes build a new
/// snapshot under a management lock, publish it with a pointer swap, and
/// hold the write lock through one quiescence period so the previous
/// snapshot cannot be observed afterwards.
pub struct Fib {
    cfg: FibConfig,
    n_fwds: usize,
    current: ArcSwap<FibTables>,
    write_lock: Mutex<()>,
}

impl Fib {
    pub fn new(cfg: FibConfig, n_fwds: usize) -> Self {
        Self {
            cfg,
            n_fwds: n_fwds.max(1),
            current: ArcSwap::from_pointee(FibTables::empty(cfg.max_depth)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> FibConfig {
        self.cfg
    }

    /// Number of real entries.
    pub fn len(&self) -> usize {
        self.current.load().n_real
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a real entry. The previous entry's dynamic counters
    /// are retained on replace.
    pub fn insert(
        &self,
        name: &Name,
        nexthops: &[FaceId],
        strategy: StrategyKind,
        q: &Quiescence,
    ) -> Result<(), FwdError> {
        let n_comps = name.len();
        if n_comps == 0 {
            return Err(FwdError::InvalidArgument("empty prefix".into()));
        }
        if n_comps > self.cfg.max_depth {
            return Err(FwdError::TooLarge);
        }
        if nexthops.is_empty() || nexthops.len() > MAX_NEXTHOPS {
            return Err(FwdError::InvalidArgument(format!(
                "nexthop count {} outside 1..={}",
                nexthops.len(),
                MAX_NEXTHOPS
            )));
        }
        let pname = PName::from_name(name).map_err(|e| FwdError::Decode(e.to_string()))?;

        let guard = self.write_lock.lock();
        let mut next = self.current.load().snapshot();

        let wire = pname.wire().to_vec();
        let existing = next.levels[n_comps].get(&wire);
        let was_real = existing.map_or(false, |n| n.real.is_some());
        let existed = existing.is_some();

        // budget check: the entry node plus any missing virtual nodes
        let mut new_nodes = usize::from(!existed);
        if !was_real {
            for l in 1..n_comps {
                if !next.levels[l].contains_key(pname.prefix_wire(l)) {
                    new_nodes += 1;
                }
            }
        }
        if next.n_nodes + new_nodes > self.cfg.capacity {
            return Err(FwdError::Capacity);
        }

        let dyn_ = match next.levels[n_comps].get(&wire).and_then(|n| n.real.as_ref()) {
            Some(old) => old.dyn_.clone(),
            None => Arc::new(
                (0..self.n_fwds)
                    .map(|_| CachePadded::new(FibEntryDyn::default()))
                    .collect(),
            ),
        };
        let entry = Arc::new(FibRealEntry {
            name: wire.clone(),
            n_comps: n_comps as u8,
            nexthops: nexthops.to_vec(),
            strategy,
            dyn_,
        });

        let node = next.levels[n_comps].entry(wire).or_default();
        if node.real.is_none() {
            next.n_real += 1;
        }
        node.real = Some(entry);

        if !was_real {
            for l in 1..n_comps {
                let prefix = pname.prefix_wire(l).to_vec();
                next.levels[l].entry(prefix).or_default().deeper += 1;
            }
        }
        next.n_nodes += new_nodes;

        debug!("FIB insert {} nexthops={:?}", name, nexthops);
        self.publish(next, q);
        drop(guard);
        Ok(())
    }

    /// Remove a real entry, retiring any virtual markers that only existed
    /// for it.
    pub fn erase(&self, name: &Name, q: &Quiescence) -> Result<(), FwdError> {
        let n_comps = name.len();
        if n_comps == 0 || n_comps > self.cfg.max_depth {
            return Err(FwdError::NotFound);
        }
        let pname = PName::from_name(name).map_err(|e| FwdError::Decode(e.to_string()))?;

        let guard = self.write_lock.lock();
        let mut next = self.current.load().snapshot();

        let wire = pname.wire().to_vec();
        let remove_leaf = match next.levels[n_comps].get_mut(&wire) {
            Some(node) if node.real.is_some() => {
                node.real = None;
                next.n_real -= 1;
                node.deeper == 0
            }
            _ => return Err(FwdError::NotFound),
        };
        if remove_leaf {
            next.levels[n_comps].remove(&wire);
            next.n_nodes -= 1;
        }
        for l in 1..n_comps {
            let prefix = pname.prefix_wire(l);
            let remove = match next.levels[l].get_mut(prefix) {
                Some(node) => {
                    node.deeper -= 1;
                    node.deeper == 0 && node.real.is_none()
                }
                None => false,
            };
            if remove {
                next.levels[l].remove(prefix);
                next.n_nodes -= 1;
            }
        }

        info!("FIB erase {}", name);
        self.publish(next, q);
        drop(guard);
        Ok(())
    }

    fn publish(&self, next: FibTables, q: &Quiescence) {
        self.current.store(Arc::new(next));
        // readers entering after the swap see the new snapshot; one
        // quiescence period later nobody can still dereference the old one
        q.wait_quiescent();
    }

    /// Longest-prefix match.
    pub fn lpm(&self, name: &PName) -> Option<Arc<FibRealEntry>> {
        let tables = self.current.load();
        let len = name.len().min(self.cfg.max_depth);
        if len == 0 {
            return None;
        }
        let start = self.cfg.start_depth.clamp(1, len);

        let mut best = None;
        let mut l = start;
        loop {
            match tables.levels[l].get(name.prefix_wire(l)) {
                None => break,
                Some(node) => {
                    if let Some(real) = &node.real {
                        best = Some(real.clone());
                    }
                    if node.deeper == 0 {
                        break;
                    }
                }
            }
            l += 1;
            if l > len {
                break;
            }
        }

        if best.is_none() && start > 1 {
            for l in (1..start).rev() {
                if let Some(node) = tables.levels[l].get(name.prefix_wire(l)) {
                    if let Some(real) = &node.real {
                        best = Some(real.clone());
                        break;
                    }
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn pname(uri: &str) -> PName {
        PName::from_name(&Name::from_str(uri)).unwrap()
    }

    fn fib(cfg: FibConfig) -> (Fib, Quiescence) {
        (Fib::new(cfg, 2), Quiescence::new(0))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let (fib, q) = fib(FibConfig::default());
        fib.insert(&Name::from_str("/A"), &[2], StrategyKind::BestRoute, &q)
            .unwrap();
        fib.insert(&Name::from_str("/A/B/C"), &[3], StrategyKind::BestRoute, &q)
            .unwrap();

        let hit = fib.lpm(&pname("/A/B/X")).unwrap();
        assert_eq!(hit.nexthops, vec![2]);
        let hit = fib.lpm(&pname("/A/B/C/Y")).unwrap();
        assert_eq!(hit.nexthops, vec![3]);
        let hit = fib.lpm(&pname("/A")).unwrap();
        assert_eq!(hit.nexthops, vec![2]);
        assert!(fib.lpm(&pname("/Z/Z")).is_none());
    }

    #[test]
    fn test_virtual_entries_guide_start_depth() {
        let (fib, q) = fib(FibConfig {
            capacity: 64,
            start_depth: 2,
            max_depth: 8,
        });
        fib.insert(&Name::from_str("/A"), &[2], StrategyKind::BestRoute, &q)
            .unwrap();
        fib.insert(&Name::from_str("/A/B/C"), &[3], StrategyKind::BestRoute, &q)
            .unwrap();

        // probe starts at depth 2: /A/Z misses there and falls back to /A
        assert_eq!(fib.lpm(&pname("/A/Z")).unwrap().nexthops, vec![2]);
        // /A/B is virtual at depth 2, continues to /A/B/C, which does not
        // match /A/B/X, so the best real seen is /A via fallback
        assert_eq!(fib.lpm(&pname("/A/B/X")).unwrap().nexthops, vec![2]);
        assert_eq!(fib.lpm(&pname("/A/B/C")).unwrap().nexthops, vec![3]);
    }

    #[test]
    fn test_erase_retires_virtual_markers() {
        let (fib, q) = fib(FibConfig::default());
        fib.insert(&Name::from_str("/A/B/C"), &[3], StrategyKind::BestRoute, &q)
            .unwrap();
        assert!(fib.lpm(&pname("/A/B/C/D")).is_some());
        fib.erase(&Name::from_str("/A/B/C"), &q).unwrap();
        assert!(fib.lpm(&pname("/A/B/C/D")).is_none());
        assert_eq!(fib.current.load().n_nodes, 0);
        assert!(matches!(
            fib.erase(&Name::from_str("/A/B/C"), &q),
            Err(FwdError::NotFound)
        ));
    }

    #[test]
    fn test_erase_keeps_shared_virtuals() {
        let (fib, q) = fib(FibConfig::default());
        fib.insert(&Name::from_str("/A/B/C"), &[3], StrategyKind::BestRoute, &q)
            .unwrap();
        fib.insert(&Name::from_str("/A/B/D"), &[4], StrategyKind::BestRoute, &q)
            .unwrap();
        fib.erase(&Name::from_str("/A/B/C"), &q).unwrap();
        assert_eq!(fib.lpm(&pname("/A/B/D")).unwrap().nexthops, vec![4]);
        assert!(fib.lpm(&pname("/A/B/C")).is_none());
    }

    #[test]
    fn test_capacity_exhausted() {
        let (fib, q) = fib(FibConfig {
            capacity: 3,
            start_depth: 1,
            max_depth: 8,
        });
        // /A/B/C costs three nodes (two virtual, one real)
        fib.insert(&Name::from_str("/A/B/C"), &[3], StrategyKind::BestRoute, &q)
            .unwrap();
        assert!(matches!(
            fib.insert(&Name::from_str("/X"), &[1], StrategyKind::BestRoute, &q),
            Err(FwdError::Capacity)
        ));
        // replacing an existing entry needs no new node
        fib.insert(&Name::from_str("/A/B/C"), &[5], StrategyKind::BestRoute, &q)
            .unwrap();
    }

    #[test]
    fn test_name_too_deep() {
        let (fib, q) = fib(FibConfig::default());
        let mut name = Name::new();
        for i in 0..9 {
            name.append_str(&format!("c{}", i));
        }
        assert!(matches!(
            fib.insert(&name, &[1], StrategyKind::BestRoute, &q),
            Err(FwdError::TooLarge)
        ));
    }

    #[test]
    fn test_replace_retains_dyn_counters() {
        let (fib, q) = fib(FibConfig::default());
        let name = Name::from_str("/A");
        fib.insert(&name, &[2], StrategyKind::BestRoute, &q).unwrap();
        fib.lpm(&pname("/A"))
            .unwrap()
            .dyn_state(0)
            .n_rx_interests
            .fetch_add(5, Ordering::Relaxed);

        fib.insert(&name, &[2, 3], StrategyKind::Multicast, &q)
            .unwrap();
        let entry = fib.lpm(&pname("/A")).unwrap();
        assert_eq!(entry.nexthops, vec![2, 3]);
        assert_eq!(entry.strategy, StrategyKind::Multicast);
        assert_eq!(entry.dyn_state(0).n_rx_interests.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_filter_nexthops_excludes_downstream() {
        let (fib, q) = fib(FibConfig::default());
        fib.insert(
            &Name::from_str("/A"),
            &[2, 3, 4],
            StrategyKind::Multicast,
            &q,
        )
        .unwrap();
        let entry = fib.lpm(&pname("/A")).unwrap();
        assert_eq!(entry.filter_nexthops(3), vec![2, 4]);
        assert_eq!(entry.filter_nexthops(9), vec![2, 3, 4]);
    }
}
