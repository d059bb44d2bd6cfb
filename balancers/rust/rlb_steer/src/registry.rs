// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Backend registry: slot ordinal -> live listener handle.
//!
//! The registry is the only source of truth for whether a slot can take
//! connections. Entries are overwritten, never deleted, when a backend
//! restarts, so a replacement becomes eligible the moment it registers.
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::bpf_intf::MAX_SLOTS;
use crate::engine::SlotSource;
use crate::store::lookup_u64;
use crate::store::Namespace;
use crate::store::StoreError;
use crate::store::Table;
use crate::store::BALANCING_TARGETS;

/// Opaque per-slot handle. For the kernel socket array the value written is
/// the listener fd and the value read back is the socket cookie; for the
/// userspace dispatcher it is a mailbox token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SlotHandle(pub u64);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("backend registry is unavailable")]
    Unavailable(#[source] StoreError),
    #[error("ordinal {ordinal} out of range [0, {nr_slots})")]
    OrdinalOutOfRange { ordinal: u32, nr_slots: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BackendRegistry {
    table: Arc<dyn Table>,
    nr_slots: u32,
}

impl BackendRegistry {
    fn check_nr_slots(nr_slots: u32) -> Result<(), RegistryError> {
        if nr_slots == 0 || nr_slots as usize > MAX_SLOTS {
            return Err(RegistryError::OrdinalOutOfRange {
                ordinal: nr_slots,
                nr_slots: MAX_SLOTS as u32,
            });
        }
        Ok(())
    }

    /// Create the registry, or open it if another process already did.
    pub fn create(ns: &dyn Namespace, nr_slots: u32) -> Result<Self, RegistryError> {
        Self::check_nr_slots(nr_slots)?;
        let table = ns.open_or_create(&BALANCING_TARGETS)?;
        Ok(Self { table, nr_slots })
    }

    /// Open an existing registry by name.
    pub fn open(ns: &dyn Namespace, nr_slots: u32) -> Result<Self, RegistryError> {
        Self::check_nr_slots(nr_slots)?;
        let table = ns.open(&BALANCING_TARGETS).map_err(|e| match e {
            StoreError::Missing(_) => RegistryError::Unavailable(e),
            e => RegistryError::Store(e),
        })?;
        Ok(Self { table, nr_slots })
    }

    pub fn nr_slots(&self) -> u32 {
        self.nr_slots
    }

    fn check(&self, ordinal: u32) -> Result<(), RegistryError> {
        if ordinal >= self.nr_slots {
            return Err(RegistryError::OrdinalOutOfRange {
                ordinal,
                nr_slots: self.nr_slots,
            });
        }
        Ok(())
    }

    /// Publish `handle` at `ordinal`, replacing whatever was there.
    pub fn register(&self, ordinal: u32, handle: SlotHandle) -> Result<(), RegistryError> {
        self.check(ordinal)?;
        self.table
            .update(&ordinal.to_ne_bytes(), &handle.0.to_ne_bytes())?;
        debug!("registry: slot {} -> {:#x}", ordinal, handle.0);
        Ok(())
    }

    /// Publish a listener socket. The kernel stores the socket itself and
    /// reads back its cookie.
    pub fn register_listener(&self, ordinal: u32, fd: BorrowedFd<'_>) -> Result<(), RegistryError> {
        self.register(ordinal, SlotHandle(fd.as_raw_fd() as u64))
    }

    pub fn lookup(&self, ordinal: u32) -> Result<Option<SlotHandle>, RegistryError> {
        self.check(ordinal)?;
        Ok(lookup_u64(self.table.as_ref(), ordinal)?.map(SlotHandle))
    }

    /// Clear `ordinal` only if it still holds `expected`, so a replacement
    /// that registered in the meantime is left alone.
    pub fn unregister_if(&self, ordinal: u32, expected: SlotHandle) -> Result<bool, RegistryError> {
        self.check(ordinal)?;
        Ok(self
            .table
            .delete_if(&ordinal.to_ne_bytes(), &expected.0.to_ne_bytes())?)
    }

    /// Live slots in ordinal order.
    pub fn entries(&self) -> Result<Vec<(u32, SlotHandle)>, RegistryError> {
        let mut out = Vec::new();
        for ordinal in 0..self.nr_slots {
            if let Some(handle) = self.lookup(ordinal)? {
                out.push((ordinal, handle));
            }
        }
        Ok(out)
    }
}

impl SlotSource for BackendRegistry {
    fn slot(&self, ordinal: u32) -> Option<SlotHandle> {
        match self.lookup(ordinal) {
            Ok(handle) => handle,
            Err(e) => {
                debug!("registry lookup for slot {} failed: {}", ordinal, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemNamespace;

    #[test]
    fn register_is_idempotent_overwrite() {
        let ns = MemNamespace::new();
        let reg = BackendRegistry::create(&ns, 4).unwrap();
        reg.register(1, SlotHandle(10)).unwrap();
        reg.register(1, SlotHandle(10)).unwrap();
        assert_eq!(reg.lookup(1).unwrap(), Some(SlotHandle(10)));
        reg.register(1, SlotHandle(11)).unwrap();
        assert_eq!(reg.lookup(1).unwrap(), Some(SlotHandle(11)));
        assert_eq!(reg.entries().unwrap(), vec![(1, SlotHandle(11))]);
    }

    #[test]
    fn rejects_out_of_range_ordinal() {
        let ns = MemNamespace::new();
        let reg = BackendRegistry::create(&ns, 4).unwrap();
        assert!(matches!(
            reg.register(4, SlotHandle(1)),
            Err(RegistryError::OrdinalOutOfRange { ordinal: 4, nr_slots: 4 })
        ));
        assert!(reg.lookup(7).is_err());
        assert!(BackendRegistry::create(&ns, 0).is_err());
        assert!(BackendRegistry::create(&ns, MAX_SLOTS as u32 + 1).is_err());
    }

    #[test]
    fn open_without_creator_is_unavailable() {
        let ns = MemNamespace::new();
        assert!(matches!(
            BackendRegistry::open(&ns, 4),
            Err(RegistryError::Unavailable(_))
        ));
    }

    #[test]
    fn late_opener_sees_registrations() {
        let ns = MemNamespace::new();
        let creator = BackendRegistry::create(&ns, 4).unwrap();
        creator.register(0, SlotHandle(5)).unwrap();
        let other = BackendRegistry::open(&ns.clone(), 4).unwrap();
        assert_eq!(other.lookup(0).unwrap(), Some(SlotHandle(5)));
        assert_eq!(other.lookup(2).unwrap(), None);
    }

    #[test]
    fn unregister_if_spares_replacement() {
        let ns = MemNamespace::new();
        let reg = BackendRegistry::create(&ns, 2).unwrap();
        reg.register(0, SlotHandle(1)).unwrap();
        reg.register(0, SlotHandle(2)).unwrap();
        assert!(!reg.unregister_if(0, SlotHandle(1)).unwrap());
        assert_eq!(reg.lookup(0).unwrap(), Some(SlotHandle(2)));
        assert!(reg.unregister_if(0, SlotHandle(2)).unwrap());
        assert_eq!(reg.lookup(0).unwrap(), None);
    }
}
