use std::sync::atomic::Ordering;

use ndnfw_core::packets::FaceId;
use ndnfw_core::TscTime;
use ndnfw_tables::fib::{FibRealEntry, StrategyKind};
use ndnfw_tables::pcct::PitEntry;

/// Strategy decision for a received Nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Retransmit the Interest to this untried upstream.
    Retry(FaceId),
    /// Give up: propagate the Nack to all downstreams and erase the entry.
    Propagate,
    /// Wait for the remaining upstreams.
    Ignore,
}

/// Pick the upstream set for an Interest after FIB LPM. `nexthops` already
/// excludes the downstream face.
pub fn pick_upstreams(
    entry: &FibRealEntry,
    fwd: usize,
    nexthops: &[FaceId],
    out: &mut Vec<FaceId>,
) {
    match entry.strategy {
        StrategyKind::BestRoute => out.extend(nexthops.first().copied()),
        StrategyKind::Multicast => out.extend_from_slice(nexthops),
        StrategyKind::RoundRobin => {
            if !nexthops.is_empty() {
                let i = entry.dyn_state(fwd).rr_index.fetch_add(1, Ordering::Relaxed);
                out.push(nexthops[i % nexthops.len()]);
            }
        }
    }
}

/// Classify a Nack and react.
pub fn on_nack(kind: StrategyKind, pit: &PitEntry, nexthops: &[FaceId]) -> NackAction {
    match kind {
        StrategyKind::BestRoute | StrategyKind::RoundRobin => pit
            .untried(nexthops)
            .next()
            .map(NackAction::Retry)
            .unwrap_or(NackAction::Propagate),
        StrategyKind::Multicast => {
            if pit.all_ups_nacked() {
                NackAction::Propagate
            } else {
                NackAction::Ignore
            }
        }
    }
}

/// Expiry hook: retrying is only meaningful while a downstream is still
/// waiting, which cannot be the case once every downstream has expired - so
/// in practice this reports "give up" and the entry is erased.
pub fn on_expiry(_kind: StrategyKind, pit: &PitEntry, now: TscTime) -> bool {
    pit.live_dns(now).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndnfw_core::name::Name;
    use ndnfw_core::packets::Interest;
    use ndnfw_core::PacketBuf;
    use ndnfw_tables::epoch::Quiescence;
    use ndnfw_tables::fib::{Fib, FibConfig};
    use ndnfw_tables::pcct::{InsertResult, PcctConfig, PcctShard, SuppressConfig};
    use ndnfw_core::lp::PitToken;

    fn entry_with(strategy: StrategyKind, nexthops: &[FaceId]) -> std::sync::Arc<FibRealEntry> {
        let fib = Fib::new(FibConfig::default(), 1);
        let q = Quiescence::new(0);
        fib.insert(&Name::from_str("/s"), nexthops, strategy, &q)
            .unwrap();
        fib.lpm(
            &ndnfw_core::name::PName::from_name(&Name::from_str("/s/x")).unwrap(),
        )
        .unwrap()
    }

    fn pit_with_up(face: FaceId) -> (PcctShard, u32) {
        let mut shard = PcctShard::new(0, PcctConfig::default(), SuppressConfig::default(), 0);
        let interest = Interest::new(&Name::from_str("/s/x"), 1);
        let wire = PacketBuf::from_vec(interest.encode());
        let id = match shard.insert_interest(&interest, &wire, 9, PitToken::empty(), 0, 0) {
            InsertResult::New(id) => id,
            other => panic!("{:?}", other),
        };
        shard
            .entry_mut(id)
            .unwrap()
            .try_tx_upstream(face, 1, 0, &SuppressConfig::default());
        (shard, id)
    }

    #[test]
    fn test_best_route_picks_first() {
        let entry = entry_with(StrategyKind::BestRoute, &[4, 5, 6]);
        let mut out = Vec::new();
        pick_upstreams(&entry, 0, &[4, 5, 6], &mut out);
        assert_eq!(out, vec![4]);
    }

    #[test]
    fn test_multicast_picks_all() {
        let entry = entry_with(StrategyKind::Multicast, &[4, 5, 6]);
        let mut out = Vec::new();
        pick_upstreams(&entry, 0, &[4, 5, 6], &mut out);
        assert_eq!(out, vec![4, 5, 6]);
    }

    #[test]
    fn test_round_robin_rotates() {
        let entry = entry_with(StrategyKind::RoundRobin, &[4, 5]);
        let mut picks = Vec::new();
        for _ in 0..4 {
            let mut out = Vec::new();
            pick_upstreams(&entry, 0, &[4, 5], &mut out);
            picks.extend(out);
        }
        assert_eq!(picks, vec![4, 5, 4, 5]);
    }

    #[test]
    fn test_nack_retry_then_propagate() {
        let (shard, id) = pit_with_up(4);
        let pit = shard.entry(id).unwrap();
        assert_eq!(
            on_nack(StrategyKind::BestRoute, pit, &[4, 5]),
            NackAction::Retry(5)
        );
        assert_eq!(
            on_nack(StrategyKind::BestRoute, pit, &[4]),
            NackAction::Propagate
        );
    }

    #[test]
    fn test_multicast_waits_for_all_nacks() {
        let (mut shard, id) = pit_with_up(4);
        shard
            .entry_mut(id)
            .unwrap()
            .try_tx_upstream(5, 1, 0, &SuppressConfig::default());
        {
            let pit = shard.entry_mut(id).unwrap();
            pit.ups[0].nack = Some(ndnfw_core::packets::NackReason::NoRoute);
            assert_eq!(
                on_nack(StrategyKind::Multicast, pit, &[4, 5]),
                NackAction::Ignore
            );
            pit.ups[1].nack = Some(ndnfw_core::packets::NackReason::Congestion);
            assert_eq!(
                on_nack(StrategyKind::Multicast, pit, &[4, 5]),
                NackAction::Propagate
            );
        }
    }

    #[test]
    fn test_expiry_without_live_downstream_gives_up() {
        let (shard, id) = pit_with_up(4);
        let pit = shard.entry(id).unwrap();
        // downstream lifetime is 4s; at 10s it is gone
        assert!(on_expiry(StrategyKind::BestRoute, pit, 1_000_000_000));
        assert!(!on_expiry(StrategyKind::BestRoute, pit, 10_000_000_000));
    }
}
