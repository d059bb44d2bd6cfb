// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-core CPU utilization collector.
//!
//! Samples `/proc/stat` every period, turns counter deltas into an
//! instantaneous busy percentage and publishes an exponentially weighted
//! average (percent x 100) keyed by core id.
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use serde::Serialize;

use super::TelemetryError;
use crate::bpf_intf::MAX_CORES;
use crate::store::update_u32;
use crate::store::Table;

pub const PROC_STAT: &str = "/proc/stat";
pub const DEFAULT_ALPHA: f64 = 0.25;
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(2);

// Longest single sleep, bounds how late shutdown is noticed.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Cumulative per-core counters, in USER_HZ ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

impl CpuTimes {
    pub fn idle_all(&self) -> u64 {
        self.idle + self.iowait
    }

    /// guest and guest_nice are already folded into user and nice.
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle_all() + self.irq + self.softirq + self.steal
    }
}

fn parse_cpu_line(line: &str) -> Option<(u32, CpuTimes)> {
    if let Ok((cpu, user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice)) = sscanf::sscanf!(
        line,
        "cpu{u32} {u64} {u64} {u64} {u64} {u64} {u64} {u64} {u64} {u64} {u64}"
    ) {
        return Some((
            cpu,
            CpuTimes {
                user,
                nice,
                system,
                idle,
                iowait,
                irq,
                softirq,
                steal,
                guest,
                guest_nice,
            },
        ));
    }

    // Kernels without guest accounting stop after steal.
    let (cpu, user, nice, system, idle, iowait, irq, softirq, steal) = sscanf::sscanf!(
        line,
        "cpu{u32} {u64} {u64} {u64} {u64} {u64} {u64} {u64} {u64}"
    )
    .ok()?;
    Some((
        cpu,
        CpuTimes {
            user,
            nice,
            system,
            idle,
            iowait,
            irq,
            softirq,
            steal,
            ..Default::default()
        },
    ))
}

/// Per-core lines of a `/proc/stat` dump. The aggregate `cpu` line and
/// anything unparsable are ignored.
pub fn parse_proc_stat(content: &str) -> BTreeMap<u32, CpuTimes> {
    content
        .lines()
        .filter(|l| l.starts_with("cpu"))
        .filter_map(parse_cpu_line)
        .collect()
}

/// Busy percentage between two snapshots of one core, clamped to [0, 100].
/// Zero elapsed time reads as idle.
pub fn utilization(core: u32, prev: &CpuTimes, cur: &CpuTimes) -> Result<f64, TelemetryError> {
    if cur.total() < prev.total() || cur.idle_all() < prev.idle_all() {
        return Err(TelemetryError::CounterRegression(core));
    }
    let dtotal = cur.total() - prev.total();
    let didle = cur.idle_all() - prev.idle_all();
    if dtotal == 0 {
        return Ok(0.0);
    }
    let inst = 100.0 * (1.0 - didle as f64 / dtotal as f64);
    Ok(inst.clamp(0.0, 100.0))
}

#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    alpha: f64,
    avg: f64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, avg: 0.0 }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        self.avg = self.alpha * sample + (1.0 - self.alpha) * self.avg;
        self.avg
    }

    pub fn value(&self) -> f64 {
        self.avg
    }
}

/// Smoothed percentage as published: round(avg * 100).
pub fn to_published(avg: f64) -> u32 {
    (avg * 100.0).round().clamp(0.0, 10000.0) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoreSample {
    pub core: u32,
    pub instantaneous: f64,
    pub average: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Sampling,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct CpuCollectorConfig {
    pub cores: Vec<u32>,
    pub period: Duration,
    pub alpha: f64,
}

impl Default for CpuCollectorConfig {
    fn default() -> Self {
        Self {
            cores: vec![0, 1, 2, 3],
            period: DEFAULT_PERIOD,
            alpha: DEFAULT_ALPHA,
        }
    }
}

impl CpuCollectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cores.is_empty() {
            bail!("no cores to monitor");
        }
        if let Some(core) = self.cores.iter().find(|c| **c >= MAX_CORES) {
            bail!("core {} exceeds table capacity {}", core, MAX_CORES);
        }
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            bail!("smoothing weight {} must be in (0, 1]", self.alpha);
        }
        if self.period.is_zero() {
            bail!("sampling period must be non-zero");
        }
        Ok(())
    }
}

/// What one tick did, per core.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub published: Vec<(u32, u32)>,
    pub skipped: Vec<u32>,
    pub rebaselined: Vec<u32>,
    pub read_failed: bool,
}

pub struct CpuCollector {
    cfg: CpuCollectorConfig,
    table: Arc<dyn Table>,
    state: CollectorState,
    prev: BTreeMap<u32, CpuTimes>,
    avgs: BTreeMap<u32, Ewma>,
    latest: BTreeMap<u32, CoreSample>,
}

impl CpuCollector {
    pub fn new(cfg: CpuCollectorConfig, table: Arc<dyn Table>) -> Result<Self> {
        cfg.validate()?;
        let avgs = cfg.cores.iter().map(|c| (*c, Ewma::new(cfg.alpha))).collect();
        Ok(Self {
            cfg,
            table,
            state: CollectorState::Idle,
            prev: BTreeMap::new(),
            avgs,
            latest: BTreeMap::new(),
        })
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn samples(&self) -> Vec<CoreSample> {
        self.latest.values().copied().collect()
    }

    /// Take one sample from `/proc/stat`.
    pub fn tick(&mut self) -> TickReport {
        let content = std::fs::read_to_string(PROC_STAT).map_err(|source| TelemetryError::Read {
            path: PROC_STAT.to_string(),
            source,
        });
        self.tick_with(content)
    }

    /// Take one sample from an already-read snapshot.
    pub fn tick_with(&mut self, content: Result<String, TelemetryError>) -> TickReport {
        let mut report = TickReport::default();
        if self.state == CollectorState::Idle {
            self.state = CollectorState::Sampling;
        }

        let content = match content {
            Ok(c) => c,
            Err(e) => {
                warn!("{}, keeping published values", e);
                report.read_failed = true;
                return report;
            }
        };
        let snapshot = parse_proc_stat(&content);

        for &core in &self.cfg.cores {
            let cur = match snapshot.get(&core) {
                Some(cur) => *cur,
                None => {
                    debug!("{}", TelemetryError::MissingCore(core));
                    report.skipped.push(core);
                    continue;
                }
            };
            let prev = match self.prev.insert(core, cur) {
                Some(prev) => prev,
                None => {
                    // First sighting only establishes the baseline.
                    debug!("core {}: baseline taken", core);
                    report.skipped.push(core);
                    continue;
                }
            };

            let inst = match utilization(core, &prev, &cur) {
                Ok(inst) => inst,
                Err(e) => {
                    warn!("{}, re-baselining", e);
                    report.rebaselined.push(core);
                    continue;
                }
            };

            let Some(ewma) = self.avgs.get_mut(&core) else {
                continue;
            };
            let avg = ewma.update(inst);
            let value = to_published(avg);
            if let Err(e) = update_u32(self.table.as_ref(), core, value) {
                warn!("publishing core {} utilization: {}", core, e);
                continue;
            }
            self.latest.insert(
                core,
                CoreSample {
                    core,
                    instantaneous: inst,
                    average: avg,
                },
            );
            report.published.push((core, value));
        }

        debug!(
            "cpu tick: published {:?} skipped {:?} rebaselined {:?}",
            report.published, report.skipped, report.rebaselined
        );
        report
    }

    pub fn run(&mut self, shutdown: &AtomicBool) {
        let mut read = || {
            std::fs::read_to_string(PROC_STAT).map_err(|source| TelemetryError::Read {
                path: PROC_STAT.to_string(),
                source,
            })
        };
        self.run_with(&mut read, shutdown)
    }

    /// Sample until `shutdown` is set. Shutdown is observed within one
    /// period.
    pub fn run_with<F>(&mut self, read: &mut F, shutdown: &AtomicBool)
    where
        F: FnMut() -> Result<String, TelemetryError>,
    {
        info!(
            "CPU collector: cores {:?} every {:?}, alpha {}",
            self.cfg.cores, self.cfg.period, self.cfg.alpha
        );
        while !shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.tick_with(read());

            while !shutdown.load(Ordering::Relaxed) {
                let elapsed = started.elapsed();
                if elapsed >= self.cfg.period {
                    break;
                }
                std::thread::sleep((self.cfg.period - elapsed).min(SLEEP_SLICE));
            }
        }
        self.state = CollectorState::Terminated;
        info!("CPU collector terminated");
    }
}
