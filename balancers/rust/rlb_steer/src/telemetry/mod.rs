// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Load telemetry feeding the selection engine.
//!
//! Collectors are single writers per key. The engine only reads, and
//! staleness is accepted: a value is whatever was published last.
pub mod acceptq;
pub mod cpu;

use std::sync::Arc;

use thiserror::Error;

use crate::bpf_intf::acceptq_rec;
use crate::engine::TelemetrySource;
use crate::store::lookup_pod;
use crate::store::lookup_u32;
use crate::store::Namespace;
use crate::store::StoreError;
use crate::store::Table;
use crate::store::ACCEPTQ_BY_CORE;
use crate::store::CPU_UTIL;

/// Transient telemetry failures. None of these stop a collector.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to read {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("core {0} missing from snapshot")]
    MissingCore(u32),
    #[error("core {0} counters went backwards")]
    CounterRegression(u32),
}

/// Occupancy in percent x 100. A zero capacity counts as one.
pub fn occupancy(curr: u32, max: u32) -> u32 {
    ((curr as u64 * 10000) / max.max(1) as u64).min(u32::MAX as u64) as u32
}

/// Engine-facing view over the core-keyed telemetry tables.
pub struct TableTelemetry {
    cpu: Arc<dyn Table>,
    acceptq: Arc<dyn Table>,
}

impl TableTelemetry {
    pub fn new(cpu: Arc<dyn Table>, acceptq: Arc<dyn Table>) -> Self {
        Self { cpu, acceptq }
    }

    pub fn open(ns: &dyn Namespace) -> Result<Self, StoreError> {
        Ok(Self::new(ns.open(&CPU_UTIL)?, ns.open(&ACCEPTQ_BY_CORE)?))
    }

    pub fn open_or_create(ns: &dyn Namespace) -> Result<Self, StoreError> {
        Ok(Self::new(
            ns.open_or_create(&CPU_UTIL)?,
            ns.open_or_create(&ACCEPTQ_BY_CORE)?,
        ))
    }
}

impl TelemetrySource for TableTelemetry {
    fn cpu_util(&self, core: u32) -> Option<u32> {
        lookup_u32(self.cpu.as_ref(), core).ok().flatten()
    }

    fn queue_occupancy(&self, core: u32) -> Option<u32> {
        lookup_pod::<acceptq_rec>(self.acceptq.as_ref(), core)
            .ok()
            .flatten()
            .map(|rec| occupancy(rec.curr, rec.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupancy_normalizes_zero_max() {
        assert_eq!(occupancy(2, 10), 2000);
        assert_eq!(occupancy(8, 10), 8000);
        assert_eq!(occupancy(3, 0), 30000);
        assert_eq!(occupancy(0, 0), 0);
    }
}
