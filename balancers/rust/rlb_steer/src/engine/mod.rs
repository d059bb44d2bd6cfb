// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Connection-steering decision engine.
//!
//! A decision is two steps. [`Engine::gather`] reads the registry and the
//! telemetry tables into a fixed-size [`CandidateSet`]; [`Engine::select`]
//! scores that set under the active [`Policy`] and returns exactly one
//! [`Decision`]. `select` is pure, bounded by `MAX_SLOTS` and does not
//! allocate.
//!
//! Policies only rank candidates. The engine keeps the first candidate with
//! the strictly lowest rank, so ties go to the lowest ordinal, and turns a
//! winner that is not registered into a DROP.
pub mod policy;

pub use policy::build_policy;
pub use policy::Composite;
pub use policy::CompositeScorer;
pub use policy::LeastAcceptQueue;
pub use policy::LeastCpu;
pub use policy::PickFirst;
pub use policy::PolicyKind;
pub use policy::RoundRobin;

use anyhow::bail;
use anyhow::Result;
use serde::Serialize;

use crate::bpf_intf::steer_config;
use crate::bpf_intf::MAX_CORES;
use crate::bpf_intf::MAX_SLOTS;
use crate::registry::SlotHandle;

/// Registry view the engine consults at decision time.
pub trait SlotSource {
    fn slot(&self, ordinal: u32) -> Option<SlotHandle>;
}

/// Telemetry view, keyed by core id. Values are percent x 100.
pub trait TelemetrySource {
    fn cpu_util(&self, core: u32) -> Option<u32>;
    fn queue_occupancy(&self, core: u32) -> Option<u32>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub ordinal: u32,
    pub core: u32,
    pub cpu_util: u32,
    pub queue_occupancy: u32,
    pub handle: Option<SlotHandle>,
}

#[derive(Debug, Clone, Copy)]
pub struct CandidateSet {
    slots: [Candidate; MAX_SLOTS],
    len: usize,
}

impl CandidateSet {
    pub fn as_slice(&self) -> &[Candidate] {
        &self.slots[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Build a set directly, mostly for tests and benches. Entries past
    /// `MAX_SLOTS` are ignored.
    pub fn from_candidates(cands: &[Candidate]) -> Self {
        let mut set = Self {
            slots: [Candidate::default(); MAX_SLOTS],
            len: cands.len().min(MAX_SLOTS),
        };
        set.slots[..set.len].copy_from_slice(&cands[..set.len]);
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropReason {
    /// The chosen ordinal has no live handle.
    Unregistered(u32),
    /// Every candidate was skipped.
    NoCandidate,
    /// The chosen backend went away before the connection reached it.
    Disconnected(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Pass { ordinal: u32, handle: SlotHandle },
    Drop(DropReason),
}

/// Per-decision context handed from [`Policy::begin`] to every
/// [`Policy::score`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub base: u32,
    pub nr_slots: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    /// Lower wins.
    Rank(u64),
    Skip,
}

pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    fn begin(&self, nr_slots: u32) -> Round {
        Round { base: 0, nr_slots }
    }

    fn score(&self, round: &Round, cand: &Candidate) -> Score;
}

/// Slot layout shared by every policy and mirrored into `steer_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub nr_slots: u32,
    pub first_ordinal: u32,
    pub slot_cores: [u32; MAX_SLOTS],
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut slot_cores = [0u32; MAX_SLOTS];
        slot_cores[..4].copy_from_slice(&[0, 2, 4, 6]);
        Self {
            nr_slots: 4,
            first_ordinal: 0,
            slot_cores,
        }
    }
}

impl EngineConfig {
    /// `cores` maps slot i to `cores[i]`; it may be longer than `nr_slots`.
    pub fn new(nr_slots: u32, cores: &[u32], first_ordinal: u32) -> Result<Self> {
        if cores.len() > MAX_SLOTS {
            bail!("{} slot cores given, at most {} slots supported", cores.len(), MAX_SLOTS);
        }
        let mut slot_cores = [0u32; MAX_SLOTS];
        slot_cores[..cores.len()].copy_from_slice(cores);
        if (cores.len() as u32) < nr_slots {
            bail!("{} slots but only {} slot cores", nr_slots, cores.len());
        }
        let cfg = Self {
            nr_slots,
            first_ordinal,
            slot_cores,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nr_slots == 0 || self.nr_slots as usize > MAX_SLOTS {
            bail!("slot count {} outside [1, {}]", self.nr_slots, MAX_SLOTS);
        }
        if self.first_ordinal >= self.nr_slots {
            bail!(
                "pick-first ordinal {} outside [0, {})",
                self.first_ordinal,
                self.nr_slots
            );
        }
        if let Some(core) = self.cores().iter().find(|c| **c >= MAX_CORES) {
            bail!("slot core {} exceeds table capacity {}", core, MAX_CORES);
        }
        Ok(())
    }

    pub fn cores(&self) -> &[u32] {
        &self.slot_cores[..self.nr_slots as usize]
    }

    pub fn to_steer_config(&self) -> steer_config {
        steer_config {
            nr_slots: self.nr_slots,
            first_ordinal: self.first_ordinal,
            slot_cores: self.slot_cores,
        }
    }

    pub fn from_steer_config(cfg: &steer_config) -> Result<Self> {
        let out = Self {
            nr_slots: cfg.nr_slots,
            first_ordinal: cfg.first_ordinal,
            slot_cores: cfg.slot_cores,
        };
        out.validate()?;
        Ok(out)
    }
}

pub struct Engine {
    cfg: EngineConfig,
    policy: Box<dyn Policy>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, policy: Box<dyn Policy>) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg, policy })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Snapshot the registry and telemetry for every slot. Missing
    /// telemetry reads as 0, which makes an unmeasured core look idle.
    pub fn gather(&self, slots: &dyn SlotSource, telem: &dyn TelemetrySource) -> CandidateSet {
        let mut set = CandidateSet {
            slots: [Candidate::default(); MAX_SLOTS],
            len: self.cfg.nr_slots as usize,
        };
        for (i, cand) in set.slots[..set.len].iter_mut().enumerate() {
            let core = self.cfg.slot_cores[i];
            *cand = Candidate {
                ordinal: i as u32,
                core,
                cpu_util: telem.cpu_util(core).unwrap_or(0),
                queue_occupancy: telem.queue_occupancy(core).unwrap_or(0),
                handle: slots.slot(i as u32),
            };
        }
        set
    }

    pub fn select(&self, set: &CandidateSet) -> Decision {
        let round = self.policy.begin(set.len as u32);
        let mut best: Option<(u64, usize)> = None;

        for (i, cand) in set.as_slice().iter().enumerate() {
            if let Score::Rank(rank) = self.policy.score(&round, cand) {
                if best.map_or(true, |(b, _)| rank < b) {
                    best = Some((rank, i));
                }
            }
        }

        match best {
            None => Decision::Drop(DropReason::NoCandidate),
            Some((_, i)) => {
                let winner = &set.slots[i];
                match winner.handle {
                    Some(handle) => Decision::Pass {
                        ordinal: winner.ordinal,
                        handle,
                    },
                    None => Decision::Drop(DropReason::Unregistered(winner.ordinal)),
                }
            }
        }
    }

    pub fn decide(&self, slots: &dyn SlotSource, telem: &dyn TelemetrySource) -> Decision {
        self.select(&self.gather(slots, telem))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub struct FakeSlots(pub BTreeMap<u32, SlotHandle>);

    impl FakeSlots {
        pub fn with(ordinals: &[u32]) -> Self {
            Self(
                ordinals
                    .iter()
                    .map(|o| (*o, SlotHandle(100 + *o as u64)))
                    .collect(),
            )
        }
    }

    impl SlotSource for FakeSlots {
        fn slot(&self, ordinal: u32) -> Option<SlotHandle> {
            self.0.get(&ordinal).copied()
        }
    }

    #[derive(Default)]
    pub struct FakeTelemetry {
        pub cpu: BTreeMap<u32, u32>,
        pub queue: BTreeMap<u32, u32>,
    }

    impl TelemetrySource for FakeTelemetry {
        fn cpu_util(&self, core: u32) -> Option<u32> {
            self.cpu.get(&core).copied()
        }

        fn queue_occupancy(&self, core: u32) -> Option<u32> {
            self.queue.get(&core).copied()
        }
    }

    /// Four slots on cores 0..4.
    pub fn flat_config() -> EngineConfig {
        EngineConfig::new(4, &[0, 1, 2, 3], 0).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn default_config_matches_even_cores() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.cores(), &[0, 2, 4, 6]);
        assert!(cfg.validate().is_ok());
        let round_trip = EngineConfig::from_steer_config(&cfg.to_steer_config()).unwrap();
        assert_eq!(round_trip, cfg);
    }

    #[test]
    fn config_validation() {
        assert!(EngineConfig::new(0, &[], 0).is_err());
        assert!(EngineConfig::new(3, &[0, 1], 0).is_err());
        assert!(EngineConfig::new(2, &[0, 1], 2).is_err());
        assert!(EngineConfig::new(1, &[MAX_CORES], 0).is_err());
        assert!(EngineConfig::new(17, &[0; 17], 0).is_err());
        // extra cores beyond nr_slots are ignored
        assert_eq!(EngineConfig::new(2, &[5, 6, 7], 1).unwrap().cores(), &[5, 6]);
    }

    #[test]
    fn gather_fills_missing_telemetry_with_zero() {
        let engine = Engine::new(flat_config(), Box::new(PickFirst::new(0))).unwrap();
        let mut telem = FakeTelemetry::default();
        telem.cpu.insert(1, 4000);
        let set = engine.gather(&FakeSlots::with(&[1]), &telem);
        assert_eq!(set.len(), 4);
        let c = set.as_slice();
        assert_eq!(c[1].cpu_util, 4000);
        assert_eq!(c[2].cpu_util, 0);
        assert_eq!(c[1].handle, Some(SlotHandle(101)));
        assert_eq!(c[0].handle, None);
    }

    #[test]
    fn unregistered_winner_drops() {
        let engine = Engine::new(flat_config(), Box::new(PickFirst::new(0))).unwrap();
        let d = engine.decide(&FakeSlots::with(&[1, 2, 3]), &FakeTelemetry::default());
        assert_eq!(d, Decision::Drop(DropReason::Unregistered(0)));
    }

    #[test]
    fn ties_go_to_lowest_ordinal() {
        let engine = Engine::new(flat_config(), Box::new(LeastCpu)).unwrap();
        let d = engine.decide(&FakeSlots::with(&[0, 1, 2, 3]), &FakeTelemetry::default());
        assert_eq!(
            d,
            Decision::Pass {
                ordinal: 0,
                handle: SlotHandle(100)
            }
        );
    }

    #[test]
    fn from_candidates_caps_length() {
        let cands = [Candidate::default(); MAX_SLOTS + 3];
        assert_eq!(CandidateSet::from_candidates(&cands).len(), MAX_SLOTS);
        assert!(CandidateSet::from_candidates(&[]).is_empty());
    }
}
