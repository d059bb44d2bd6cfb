// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use chrono::Local;
use serde::Deserialize;
use serde::Serialize;

use crate::engine::Decision;
use crate::engine::DropReason;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Active policy name.
    pub policy: String,
    /// Connections passed, indexed by slot ordinal.
    pub pass: Vec<u64>,
    /// Drops because the chosen slot had no live handle.
    pub drop_unregistered: u64,
    /// Drops because every candidate was skipped.
    pub drop_no_candidate: u64,
    /// Drops because the chosen backend had gone away.
    pub drop_disconnected: u64,
    /// Smoothed CPU utilization by core, percent x 100.
    pub cpu_util: BTreeMap<u32, u32>,
    /// Accept-queue occupancy by core, percent x 100.
    pub acceptq: BTreeMap<u32, u32>,
    /// PASS count reported by the in-kernel selector.
    pub kernel_pass: u64,
    /// DROP count reported by the in-kernel selector.
    pub kernel_drop: u64,
}

impl Metrics {
    pub fn new(policy: &str, nr_slots: u32) -> Self {
        Self {
            policy: policy.to_string(),
            pass: vec![0; nr_slots as usize],
            ..Default::default()
        }
    }

    pub fn record(&mut self, decision: &Decision) {
        match decision {
            Decision::Pass { ordinal, .. } => {
                let idx = *ordinal as usize;
                if idx >= self.pass.len() {
                    self.pass.resize(idx + 1, 0);
                }
                self.pass[idx] += 1;
            }
            Decision::Drop(DropReason::Unregistered(_)) => self.drop_unregistered += 1,
            Decision::Drop(DropReason::NoCandidate) => self.drop_no_candidate += 1,
            Decision::Drop(DropReason::Disconnected(_)) => self.drop_disconnected += 1,
        }
    }

    pub fn total_pass(&self) -> u64 {
        self.pass.iter().sum()
    }

    pub fn total_drop(&self) -> u64 {
        self.drop_unregistered + self.drop_no_candidate + self.drop_disconnected
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let total = self.total_pass();
        let now = Local::now();
        writeln!(w, "┌─ {} [{}] {} ─", crate::BALANCER_NAME, self.policy, now.format("%H:%M:%S"))?;

        write!(w, "│ pass {:>8} ", total)?;
        for (ordinal, n) in self.pass.iter().enumerate() {
            let pct = if total > 0 { (*n as f64) * 100.0 / total as f64 } else { 0.0 };
            write!(w, " s{}:{} ({:.0}%)", ordinal, n, pct)?;
        }
        writeln!(w)?;
        writeln!(
            w,
            "│ drop {:>8}   unreg {:>6}  none {:>6}  gone {:>6}",
            self.total_drop(),
            self.drop_unregistered,
            self.drop_no_candidate,
            self.drop_disconnected
        )?;
        if self.kernel_pass + self.kernel_drop > 0 {
            writeln!(w, "│ kernel: pass {:>8}  drop {:>8}", self.kernel_pass, self.kernel_drop)?;
        }
        if !self.cpu_util.is_empty() {
            write!(w, "│ cpu")?;
            for (core, util) in &self.cpu_util {
                write!(w, "  c{}:{:>5.1}%", core, *util as f64 / 100.0)?;
            }
            writeln!(w)?;
        }
        if !self.acceptq.is_empty() {
            write!(w, "│ acceptq")?;
            for (core, occ) in &self.acceptq {
                write!(w, "  c{}:{:>5.1}%", core, *occ as f64 / 100.0)?;
            }
            writeln!(w)?;
        }
        writeln!(w, "└─")?;
        Ok(())
    }

    /// Counters since `prev`; gauges are taken from `self`.
    pub fn delta(&self, prev: &Self) -> Self {
        Self {
            policy: self.policy.clone(),
            pass: self
                .pass
                .iter()
                .enumerate()
                .map(|(i, n)| n.saturating_sub(prev.pass.get(i).copied().unwrap_or(0)))
                .collect(),
            drop_unregistered: self.drop_unregistered.saturating_sub(prev.drop_unregistered),
            drop_no_candidate: self.drop_no_candidate.saturating_sub(prev.drop_no_candidate),
            drop_disconnected: self.drop_disconnected.saturating_sub(prev.drop_disconnected),
            cpu_util: self.cpu_util.clone(),
            acceptq: self.acceptq.clone(),
            kernel_pass: self.kernel_pass.saturating_sub(prev.kernel_pass),
            kernel_drop: self.kernel_drop.saturating_sub(prev.kernel_drop),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SlotHandle;

    #[test]
    fn format_includes_numbers() {
        let mut m = Metrics::new("round-robin", 2);
        for ordinal in [0, 1, 1] {
            m.record(&Decision::Pass {
                ordinal,
                handle: SlotHandle(1),
            });
        }
        m.record(&Decision::Drop(DropReason::Unregistered(3)));
        m.cpu_util.insert(2, 4250);
        let mut out = Vec::new();
        m.format(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("round-robin"));
        assert!(s.contains("s1:2 (67%)"));
        assert!(s.contains("unreg      1"));
        assert!(s.contains("c2: 42.5%"));
    }

    #[test]
    fn delta_subtracts_counters_only() {
        let mut prev = Metrics::new("cpuutil", 2);
        prev.pass = vec![5, 1];
        prev.drop_disconnected = 2;
        let mut cur = prev.clone();
        cur.pass = vec![7, 1, 4];
        cur.drop_disconnected = 3;
        cur.acceptq.insert(0, 100);
        let d = cur.delta(&prev);
        assert_eq!(d.pass, vec![2, 0, 4]);
        assert_eq!(d.drop_disconnected, 1);
        assert_eq!(d.acceptq.get(&0), Some(&100));
        assert!(d.to_json().unwrap().contains("\"policy\":\"cpuutil\""));
    }
}
