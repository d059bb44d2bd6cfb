// SPDX-License-Identifier: GPL-2.0
use std::sync::Mutex;

use clap::ValueEnum;
use serde::Serialize;

use super::Candidate;
use super::EngineConfig;
use super::Policy;
use super::Round;
use super::Score;

/// Always the configured ordinal.
pub struct PickFirst {
    ordinal: u32,
}

impl PickFirst {
    pub fn new(ordinal: u32) -> Self {
        Self { ordinal }
    }
}

impl Policy for PickFirst {
    fn name(&self) -> &'static str {
        "pickfirst"
    }

    fn score(&self, _round: &Round, cand: &Candidate) -> Score {
        if cand.ordinal == self.ordinal {
            Score::Rank(0)
        } else {
            Score::Skip
        }
    }
}

/// Rotates through registered slots. Each decision takes one ticket from a
/// shared counter; unregistered slots are skipped so the winner is the
/// first live slot at or after the ticket, wrapping around.
#[derive(Default)]
pub struct RoundRobin {
    counter: Mutex<u32>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Policy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn begin(&self, nr_slots: u32) -> Round {
        let n = nr_slots.max(1);
        let mut ctr = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        // Stored reduced so the sequence never breaks at u32 wraparound.
        let base = *ctr % n;
        *ctr = (base + 1) % n;
        Round { base, nr_slots }
    }

    fn score(&self, round: &Round, cand: &Candidate) -> Score {
        if cand.handle.is_none() {
            return Score::Skip;
        }
        let n = round.nr_slots.max(1);
        Score::Rank(((cand.ordinal + n - round.base) % n) as u64)
    }
}

/// Least smoothed CPU utilization of the slot's core.
pub struct LeastCpu;

impl Policy for LeastCpu {
    fn name(&self) -> &'static str {
        "cpuutil"
    }

    fn score(&self, _round: &Round, cand: &Candidate) -> Score {
        Score::Rank(cand.cpu_util as u64)
    }
}

/// Least accept-queue occupancy on the slot's core.
pub struct LeastAcceptQueue;

impl Policy for LeastAcceptQueue {
    fn name(&self) -> &'static str {
        "acceptqueue"
    }

    fn score(&self, _round: &Round, cand: &Candidate) -> Score {
        Score::Rank(cand.queue_occupancy as u64)
    }
}

/// Strategy slot for policies that combine signals.
pub trait CompositeScorer: Send + Sync {
    fn rank(&self, cand: &Candidate) -> u64;
}

/// Combined policy. Until a scorer is installed it is exactly pick-first.
pub struct Composite {
    scorer: Option<Box<dyn CompositeScorer>>,
    fallback: PickFirst,
}

impl Composite {
    pub fn new(first_ordinal: u32) -> Self {
        Self {
            scorer: None,
            fallback: PickFirst::new(first_ordinal),
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn CompositeScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }
}

impl Policy for Composite {
    fn name(&self) -> &'static str {
        "agent"
    }

    fn score(&self, round: &Round, cand: &Candidate) -> Score {
        match &self.scorer {
            Some(scorer) => Score::Rank(scorer.rank(cand)),
            None => self.fallback.score(round, cand),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum PolicyKind {
    /// No steering program: the kernel's own reuseport hash.
    Default,
    Pickfirst,
    #[value(name = "round-robin")]
    RoundRobin,
    Cpuutil,
    Acceptqueue,
    /// Composite of CPU and accept-queue signals.
    Agent,
}

impl PolicyKind {
    /// Name of the matching sk_reuseport program.
    pub fn program_name(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Pickfirst => Some("pickfirst_selector"),
            Self::RoundRobin => Some("rr_selector"),
            Self::Cpuutil => Some("cpuutil_selector"),
            Self::Acceptqueue => Some("acceptq_selector"),
            Self::Agent => Some("agent_selector"),
        }
    }

    pub fn steers(&self) -> bool {
        *self != Self::Default
    }
}

/// Userspace policy for `kind`; `None` for the kernel default.
pub fn build_policy(kind: PolicyKind, cfg: &EngineConfig) -> Option<Box<dyn Policy>> {
    match kind {
        PolicyKind::Default => None,
        PolicyKind::Pickfirst => Some(Box::new(PickFirst::new(cfg.first_ordinal))),
        PolicyKind::RoundRobin => Some(Box::new(RoundRobin::new())),
        PolicyKind::Cpuutil => Some(Box::new(LeastCpu)),
        PolicyKind::Acceptqueue => Some(Box::new(LeastAcceptQueue)),
        PolicyKind::Agent => Some(Box::new(Composite::new(cfg.first_ordinal))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_util::*;
    use crate::engine::Decision;
    use crate::engine::DropReason;
    use crate::engine::Engine;
    use crate::registry::SlotHandle;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn engine(policy: Box<dyn Policy>) -> Engine {
        Engine::new(flat_config(), policy).unwrap()
    }

    fn chosen(d: Decision) -> Option<u32> {
        match d {
            Decision::Pass { ordinal, .. } => Some(ordinal),
            Decision::Drop(_) => None,
        }
    }

    #[test]
    fn least_cpu_picks_idlest_core() {
        let e = engine(Box::new(LeastCpu));
        let telem = FakeTelemetry {
            cpu: BTreeMap::from([(0, 1000), (1, 9000), (2, 5000), (3, 500)]),
            ..Default::default()
        };
        let d = e.decide(&FakeSlots::with(&[0, 1, 2, 3]), &telem);
        assert_eq!(
            d,
            Decision::Pass {
                ordinal: 3,
                handle: SlotHandle(103)
            }
        );
    }

    #[test]
    fn least_cpu_uses_slot_core_mapping() {
        let cfg = EngineConfig::new(2, &[6, 4], 0).unwrap();
        let e = Engine::new(cfg, Box::new(LeastCpu)).unwrap();
        let telem = FakeTelemetry {
            cpu: BTreeMap::from([(6, 7000), (4, 100), (0, 0)]),
            ..Default::default()
        };
        assert_eq!(chosen(e.decide(&FakeSlots::with(&[0, 1]), &telem)), Some(1));
    }

    #[test]
    fn least_accept_queue_picks_emptier_queue() {
        let cfg = EngineConfig::new(2, &[0, 1], 0).unwrap();
        let e = Engine::new(cfg, Box::new(LeastAcceptQueue)).unwrap();
        let telem = FakeTelemetry {
            queue: BTreeMap::from([
                (0, crate::telemetry::occupancy(2, 10)),
                (1, crate::telemetry::occupancy(8, 10)),
            ]),
            ..Default::default()
        };
        assert_eq!(chosen(e.decide(&FakeSlots::with(&[0, 1]), &telem)), Some(0));
    }

    #[test]
    fn least_cpu_drops_when_idlest_is_unregistered() {
        let e = engine(Box::new(LeastCpu));
        let telem = FakeTelemetry {
            cpu: BTreeMap::from([(0, 1000), (1, 9000), (2, 5000), (3, 500)]),
            ..Default::default()
        };
        let d = e.decide(&FakeSlots::with(&[0, 1, 2]), &telem);
        assert_eq!(d, Decision::Drop(DropReason::Unregistered(3)));
    }

    #[test]
    fn pick_first_targets_configured_ordinal() {
        let e = engine(Box::new(PickFirst::new(2)));
        let all = FakeSlots::with(&[0, 1, 2, 3]);
        for _ in 0..5 {
            assert_eq!(chosen(e.decide(&all, &FakeTelemetry::default())), Some(2));
        }
        let d = e.decide(&FakeSlots::with(&[0, 1, 3]), &FakeTelemetry::default());
        assert_eq!(d, Decision::Drop(DropReason::Unregistered(2)));
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let e = engine(Box::new(RoundRobin::new()));
        let all = FakeSlots::with(&[0, 1, 2, 3]);
        let picks: Vec<_> = (0..8)
            .map(|_| chosen(e.decide(&all, &FakeTelemetry::default())).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn round_robin_skips_past_missing_slots() {
        let e = engine(Box::new(RoundRobin::new()));
        let some = FakeSlots::with(&[0, 2]);
        let picks: Vec<_> = (0..4)
            .map(|_| chosen(e.decide(&some, &FakeTelemetry::default())).unwrap())
            .collect();
        // tickets 0,1,2,3 -> 0, 2 (scan from 1), 2, 0 (scan from 3 wraps)
        assert_eq!(picks, vec![0, 2, 2, 0]);
    }

    #[test]
    fn round_robin_survives_counter_wraparound() {
        let rr = RoundRobin {
            counter: Mutex::new(u32::MAX),
        };
        let bases: Vec<_> = (0..6).map(|_| rr.begin(3).base).collect();
        assert_eq!(bases, vec![0, 1, 2, 0, 1, 2]);
        assert!(*rr.counter.lock().unwrap() < 3);
    }

    #[test]
    fn round_robin_drops_with_empty_registry() {
        let e = engine(Box::new(RoundRobin::new()));
        let d = e.decide(&FakeSlots::default(), &FakeTelemetry::default());
        assert_eq!(d, Decision::Drop(DropReason::NoCandidate));
    }

    #[test]
    fn round_robin_counter_is_linearizable() {
        let rr = Arc::new(RoundRobin::new());
        let threads = 8;
        let per_thread = 500;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let rr = rr.clone();
                std::thread::spawn(move || {
                    (0..per_thread).map(|_| rr.begin(4).base).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut counts = [0usize; 4];
        for h in handles {
            for base in h.join().unwrap() {
                counts[base as usize] += 1;
            }
        }
        // 4000 tickets spread evenly means none were lost or duplicated.
        assert_eq!(counts, [threads * per_thread / 4; 4]);
        assert_eq!(*rr.counter.lock().unwrap(), 0);
    }

    #[test]
    fn composite_without_scorer_is_pick_first() {
        let e = engine(Box::new(Composite::new(1)));
        let telem = FakeTelemetry {
            cpu: BTreeMap::from([(0, 0), (1, 9900)]),
            ..Default::default()
        };
        assert_eq!(chosen(e.decide(&FakeSlots::with(&[0, 1, 2, 3]), &telem)), Some(1));
        let d = e.decide(&FakeSlots::with(&[0]), &telem);
        assert_eq!(d, Decision::Drop(DropReason::Unregistered(1)));
    }

    #[test]
    fn composite_uses_installed_scorer() {
        struct CpuPlusTwiceQueue;

        impl CompositeScorer for CpuPlusTwiceQueue {
            fn rank(&self, cand: &Candidate) -> u64 {
                cand.cpu_util as u64 + 2 * cand.queue_occupancy as u64
            }
        }

        let policy = Composite::new(0).with_scorer(Box::new(CpuPlusTwiceQueue));
        let e = engine(Box::new(policy));
        let telem = FakeTelemetry {
            cpu: BTreeMap::from([(0, 1000), (1, 3000), (2, 2000), (3, 9000)]),
            queue: BTreeMap::from([(0, 5000), (1, 0), (2, 1000), (3, 0)]),
        };
        // ranks: 11000, 3000, 4000, 9000
        assert_eq!(chosen(e.decide(&FakeSlots::with(&[0, 1, 2, 3]), &telem)), Some(1));
    }

    #[test]
    fn policy_kind_names() {
        assert_eq!(PolicyKind::Default.program_name(), None);
        assert_eq!(PolicyKind::RoundRobin.program_name(), Some("rr_selector"));
        assert!(build_policy(PolicyKind::Default, &flat_config()).is_none());
        let rr = build_policy(PolicyKind::RoundRobin, &flat_config()).unwrap();
        assert_eq!(rr.name(), "round-robin");
        assert_eq!(
            PolicyKind::from_str("round-robin", false).unwrap(),
            PolicyKind::RoundRobin
        );
    }
}
