// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Named shared tables.
//!
//! Every piece of cross-process state (registry, telemetry, selector
//! config) is a table with a well-known name. Creators call
//! [`Namespace::open_or_create`]; everyone else calls [`Namespace::open`]
//! and must cope with [`StoreError::Missing`].
//!
//! Tables are byte-level like BPF maps. Keys and values are native-endian.

mod mem;
mod pinned;

pub use mem::MemNamespace;
pub use pinned::PinnedNamespace;
pub use pinned::DEFAULT_PIN_DIR;

use std::sync::Arc;

use plain::Plain;
use thiserror::Error;

use crate::bpf_intf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Fixed-size array. In-range keys that were never written read back
    /// as zeroes.
    Array,
    /// Hash that evicts its least recently used entry when full.
    LruHash,
    /// SO_REUSEPORT socket array. In the kernel the value written is a
    /// listener fd and the value read back is that socket's cookie.
    SockArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub kind: TableKind,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

pub const BALANCING_TARGETS: TableSpec = TableSpec {
    name: "tcp_balancing_targets",
    kind: TableKind::SockArray,
    key_size: 4,
    value_size: 8,
    max_entries: bpf_intf::MAX_SLOTS as u32,
};

pub const CPU_UTIL: TableSpec = TableSpec {
    name: "cpu_util_map",
    kind: TableKind::Array,
    key_size: 4,
    value_size: 4,
    max_entries: bpf_intf::MAX_CORES,
};

pub const ACCEPTQ_BY_SOCKET: TableSpec = TableSpec {
    name: "acceptq_map",
    kind: TableKind::LruHash,
    key_size: 8,
    value_size: std::mem::size_of::<bpf_intf::acceptq_rec>() as u32,
    max_entries: bpf_intf::ACCEPTQ_SOCKETS,
};

pub const ACCEPTQ_BY_CORE: TableSpec = TableSpec {
    name: "acceptq_per_cpu_map",
    kind: TableKind::Array,
    key_size: 4,
    value_size: std::mem::size_of::<bpf_intf::acceptq_rec>() as u32,
    max_entries: bpf_intf::MAX_CORES,
};

pub const STEER_CONFIG: TableSpec = TableSpec {
    name: "steer_config",
    kind: TableKind::Array,
    key_size: 4,
    value_size: std::mem::size_of::<bpf_intf::steer_config>() as u32,
    max_entries: 1,
};

pub const RR_STATE: TableSpec = TableSpec {
    name: "rr_state",
    kind: TableKind::Array,
    key_size: 4,
    value_size: 4,
    max_entries: 1,
};

pub const STEER_STATS: TableSpec = TableSpec {
    name: "steer_stats",
    kind: TableKind::Array,
    key_size: 4,
    value_size: 8,
    max_entries: bpf_intf::NR_STATS,
};

/// Every table the selector object references, in creation order.
pub const ALL_TABLES: [TableSpec; 7] = [
    BALANCING_TARGETS,
    CPU_UTIL,
    ACCEPTQ_BY_SOCKET,
    ACCEPTQ_BY_CORE,
    STEER_CONFIG,
    RR_STATE,
    STEER_STATS,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {0} does not exist")]
    Missing(String),
    #[error("failed to create table {name}")]
    Create {
        name: String,
        #[source]
        source: libbpf_rs::Error,
    },
    #[error("failed to pin {name}")]
    Pin {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("table {name}: operation failed")]
    Io {
        name: String,
        #[source]
        source: libbpf_rs::Error,
    },
    #[error("table {name} is full or key is out of range (max_entries {max})")]
    Capacity { name: String, max: u32 },
    #[error("table {name}: key size {got}, expected {expected}")]
    KeySize {
        name: String,
        expected: u32,
        got: usize,
    },
    #[error("table {name}: value size {got}, expected {expected}")]
    ValueSize {
        name: String,
        expected: u32,
        got: usize,
    },
}

pub trait Table: Send + Sync {
    fn spec(&self) -> &TableSpec;
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    /// Insert or overwrite.
    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    /// Delete `key` only while it still holds `expected`. Returns whether
    /// it was deleted.
    fn delete_if(&self, key: &[u8], expected: &[u8]) -> Result<bool, StoreError>;
    fn keys(&self) -> Result<Vec<Vec<u8>>, StoreError>;
}

pub trait Namespace: Send + Sync {
    /// Open an existing table by name.
    fn open(&self, spec: &TableSpec) -> Result<Arc<dyn Table>, StoreError>;
    fn open_or_create(&self, spec: &TableSpec) -> Result<Arc<dyn Table>, StoreError>;
    /// Remove a table or marker. Returns false if nothing was there.
    fn remove(&self, name: &str) -> Result<bool, StoreError>;
    /// Create singleton marker `name`. Returns false if it already exists.
    fn pin_exclusive(&self, name: &str) -> Result<bool, StoreError>;
    fn is_pinned(&self, name: &str) -> bool;
}

pub(crate) fn check_sizes(spec: &TableSpec, key: &[u8], value: Option<&[u8]>) -> Result<(), StoreError> {
    if key.len() != spec.key_size as usize {
        return Err(StoreError::KeySize {
            name: spec.name.to_string(),
            expected: spec.key_size,
            got: key.len(),
        });
    }
    if let Some(value) = value {
        if value.len() != spec.value_size as usize {
            return Err(StoreError::ValueSize {
                name: spec.name.to_string(),
                expected: spec.value_size,
                got: value.len(),
            });
        }
    }
    Ok(())
}

/// Read a fixed-layout record keyed by a u32 index.
pub fn lookup_pod<T: Plain + Default>(table: &dyn Table, key: u32) -> Result<Option<T>, StoreError> {
    let bytes = match table.lookup(&key.to_ne_bytes())? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    let mut rec = T::default();
    plain::copy_from_bytes(&mut rec, &bytes).map_err(|_| StoreError::ValueSize {
        name: table.spec().name.to_string(),
        expected: std::mem::size_of::<T>() as u32,
        got: bytes.len(),
    })?;
    Ok(Some(rec))
}

pub fn update_pod<T: Plain>(table: &dyn Table, key: u32, rec: &T) -> Result<(), StoreError> {
    let bytes = unsafe { plain::as_bytes(rec) };
    table.update(&key.to_ne_bytes(), bytes)
}

pub fn lookup_u32(table: &dyn Table, key: u32) -> Result<Option<u32>, StoreError> {
    Ok(table
        .lookup(&key.to_ne_bytes())?
        .and_then(|v| v.try_into().ok())
        .map(u32::from_ne_bytes))
}

pub fn lookup_u64(table: &dyn Table, key: u32) -> Result<Option<u64>, StoreError> {
    Ok(table
        .lookup(&key.to_ne_bytes())?
        .and_then(|v| v.try_into().ok())
        .map(u64::from_ne_bytes))
}

pub fn update_u32(table: &dyn Table, key: u32, value: u32) -> Result<(), StoreError> {
    table.update(&key.to_ne_bytes(), &value.to_ne_bytes())
}
