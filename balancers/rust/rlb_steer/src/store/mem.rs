// SPDX-License-Identifier: GPL-2.0
use std::sync::Arc;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use super::check_sizes;
use super::Namespace;
use super::StoreError;
use super::Table;
use super::TableKind;
use super::TableSpec;

#[derive(Default)]
struct Entries {
    map: FxHashMap<Vec<u8>, Entry>,
    clock: u64,
}

struct Entry {
    value: Vec<u8>,
    used: u64,
}

impl Entries {
    fn touch(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.clock += 1;
        let clock = self.clock;
        self.map.get_mut(key).map(|e| {
            e.used = clock;
            e.value.clone()
        })
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) {
        self.clock += 1;
        self.map.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                used: self.clock,
            },
        );
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .map
            .iter()
            .min_by_key(|(_, e)| e.used)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.map.remove(&key);
        }
    }
}

/// In-process table with BPF map semantics.
pub struct MemTable {
    spec: TableSpec,
    entries: Mutex<Entries>,
}

impl MemTable {
    fn new(spec: TableSpec) -> Self {
        Self {
            spec,
            entries: Mutex::new(Entries::default()),
        }
    }

    fn index_of(&self, key: &[u8]) -> Option<u32> {
        let idx = match key.len() {
            4 => u32::from_ne_bytes(key.try_into().ok()?),
            _ => return None,
        };
        (idx < self.spec.max_entries).then_some(idx)
    }

    fn capacity_err(&self) -> StoreError {
        StoreError::Capacity {
            name: self.spec.name.to_string(),
            max: self.spec.max_entries,
        }
    }

    fn zeroes(&self) -> Vec<u8> {
        vec![0u8; self.spec.value_size as usize]
    }
}

impl Table for MemTable {
    fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        check_sizes(&self.spec, key, None)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match self.spec.kind {
            TableKind::Array => {
                if self.index_of(key).is_none() {
                    return Ok(None);
                }
                Ok(Some(entries.touch(key).unwrap_or_else(|| self.zeroes())))
            }
            TableKind::LruHash | TableKind::SockArray => Ok(entries.touch(key)),
        }
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        check_sizes(&self.spec, key, Some(value))?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match self.spec.kind {
            TableKind::Array | TableKind::SockArray => {
                if self.index_of(key).is_none() {
                    return Err(self.capacity_err());
                }
            }
            TableKind::LruHash => {
                if !entries.map.contains_key(key)
                    && entries.map.len() >= self.spec.max_entries as usize
                {
                    entries.evict_lru();
                }
            }
        }
        entries.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        check_sizes(&self.spec, key, None)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.map.remove(key);
        Ok(())
    }

    fn delete_if(&self, key: &[u8], expected: &[u8]) -> Result<bool, StoreError> {
        check_sizes(&self.spec, key, Some(expected))?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.map.get(key).map(|e| e.value.as_slice()) != Some(expected) {
            return Ok(false);
        }
        entries.map.remove(key);
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        match self.spec.kind {
            TableKind::Array => Ok((0..self.spec.max_entries)
                .map(|i| i.to_ne_bytes().to_vec())
                .collect()),
            TableKind::LruHash | TableKind::SockArray => {
                let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                let mut keys: Vec<Vec<u8>> = entries.map.keys().cloned().collect();
                keys.sort();
                Ok(keys)
            }
        }
    }
}

#[derive(Default)]
struct MemInner {
    tables: FxHashMap<String, Arc<MemTable>>,
    markers: FxHashSet<String>,
}

/// Namespace living in this process. Clones share the same tables, so a
/// clone handed to another thread behaves like another process opening
/// the same pin directory.
#[derive(Clone, Default)]
pub struct MemNamespace {
    inner: Arc<Mutex<MemInner>>,
}

impl MemNamespace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Namespace for MemNamespace {
    fn open(&self, spec: &TableSpec) -> Result<Arc<dyn Table>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.tables.get(spec.name) {
            Some(t) => Ok(t.clone()),
            None => Err(StoreError::Missing(spec.name.to_string())),
        }
    }

    fn open_or_create(&self, spec: &TableSpec) -> Result<Arc<dyn Table>, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let table = inner
            .tables
            .entry(spec.name.to_string())
            .or_insert_with(|| Arc::new(MemTable::new(*spec)))
            .clone();
        if table.spec != *spec {
            return Err(StoreError::ValueSize {
                name: spec.name.to_string(),
                expected: table.spec.value_size,
                got: spec.value_size as usize,
            });
        }
        Ok(table)
    }

    fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let table = inner.tables.remove(name).is_some();
        let marker = inner.markers.remove(name);
        Ok(table || marker)
    }

    fn pin_exclusive(&self, name: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.markers.insert(name.to_string()))
    }

    fn is_pinned(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.markers.contains(name) || inner.tables.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lookup_u32;
    use crate::store::update_u32;
    use crate::store::ACCEPTQ_BY_SOCKET;
    use crate::store::BALANCING_TARGETS;
    use crate::store::CPU_UTIL;

    #[test]
    fn open_requires_create() {
        let ns = MemNamespace::new();
        assert!(matches!(ns.open(&CPU_UTIL), Err(StoreError::Missing(_))));
        ns.open_or_create(&CPU_UTIL).unwrap();
        assert!(ns.open(&CPU_UTIL).is_ok());
    }

    #[test]
    fn clones_share_tables() {
        let ns = MemNamespace::new();
        let other = ns.clone();
        let t = ns.open_or_create(&CPU_UTIL).unwrap();
        update_u32(t.as_ref(), 3, 4200).unwrap();
        let t2 = other.open(&CPU_UTIL).unwrap();
        assert_eq!(lookup_u32(t2.as_ref(), 3).unwrap(), Some(4200));
    }

    #[test]
    fn array_reads_zero_and_bounds_keys() {
        let ns = MemNamespace::new();
        let t = ns.open_or_create(&CPU_UTIL).unwrap();
        assert_eq!(lookup_u32(t.as_ref(), 7).unwrap(), Some(0));
        assert_eq!(lookup_u32(t.as_ref(), CPU_UTIL.max_entries).unwrap(), None);
        assert!(matches!(
            update_u32(t.as_ref(), CPU_UTIL.max_entries, 1),
            Err(StoreError::Capacity { .. })
        ));
    }

    #[test]
    fn sockarray_absent_until_written() {
        let ns = MemNamespace::new();
        let t = ns.open_or_create(&BALANCING_TARGETS).unwrap();
        let key = 1u32.to_ne_bytes();
        assert_eq!(t.lookup(&key).unwrap(), None);
        t.update(&key, &77u64.to_ne_bytes()).unwrap();
        assert_eq!(t.lookup(&key).unwrap(), Some(77u64.to_ne_bytes().to_vec()));
        t.delete(&key).unwrap();
        assert_eq!(t.lookup(&key).unwrap(), None);
    }

    #[test]
    fn lru_hash_evicts_least_recently_used() {
        let ns = MemNamespace::new();
        let t = ns.open_or_create(&ACCEPTQ_BY_SOCKET).unwrap();
        let val = [0u8; 12];
        for cookie in 0..ACCEPTQ_BY_SOCKET.max_entries as u64 {
            t.update(&cookie.to_ne_bytes(), &val).unwrap();
        }
        // cookie 0 is now the most recently used, cookie 1 the oldest
        assert!(t.lookup(&0u64.to_ne_bytes()).unwrap().is_some());
        let extra = 99_999u64.to_ne_bytes();
        t.update(&extra, &val).unwrap();
        assert_eq!(t.keys().unwrap().len(), ACCEPTQ_BY_SOCKET.max_entries as usize);
        assert!(t.lookup(&1u64.to_ne_bytes()).unwrap().is_none());
        assert!(t.lookup(&0u64.to_ne_bytes()).unwrap().is_some());
        assert!(t.lookup(&extra).unwrap().is_some());

        assert!(matches!(t.update(&0u32.to_ne_bytes(), &val), Err(StoreError::KeySize { .. })));
        assert!(matches!(
            t.update(&0u64.to_ne_bytes(), &[0u8; 4]),
            Err(StoreError::ValueSize { .. })
        ));
    }

    #[test]
    fn delete_if_only_removes_expected_value() {
        let ns = MemNamespace::new();
        let t = ns.open_or_create(&BALANCING_TARGETS).unwrap();
        let key = 0u32.to_ne_bytes();
        t.update(&key, &5u64.to_ne_bytes()).unwrap();
        assert!(!t.delete_if(&key, &4u64.to_ne_bytes()).unwrap());
        assert!(t.lookup(&key).unwrap().is_some());
        assert!(t.delete_if(&key, &5u64.to_ne_bytes()).unwrap());
        assert!(t.lookup(&key).unwrap().is_none());
        assert!(!t.delete_if(&key, &5u64.to_ne_bytes()).unwrap());
    }

    #[test]
    fn markers_are_exclusive() {
        let ns = MemNamespace::new();
        assert!(ns.pin_exclusive("dispatch_8080").unwrap());
        assert!(!ns.pin_exclusive("dispatch_8080").unwrap());
        assert!(ns.is_pinned("dispatch_8080"));
        assert!(ns.remove("dispatch_8080").unwrap());
        assert!(!ns.is_pinned("dispatch_8080"));
        assert!(!ns.remove("dispatch_8080").unwrap());
    }
}
