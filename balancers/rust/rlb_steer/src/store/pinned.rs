// SPDX-License-Identifier: GPL-2.0
use std::ffi::CString;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use libbpf_rs::MapCore;
use libbpf_rs::MapFlags;
use libbpf_rs::MapHandle;
use libbpf_rs::MapType;
use log::debug;
use log::info;

use super::check_sizes;
use super::Namespace;
use super::StoreError;
use super::Table;
use super::TableKind;
use super::TableSpec;

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/rlb";

// Kernel map names are capped at BPF_OBJ_NAME_LEN - 1.
const MAP_NAME_MAX: usize = 15;

/// A BPF map pinned under the namespace directory.
pub struct PinnedTable {
    spec: TableSpec,
    map: MapHandle,
}

impl PinnedTable {
    fn io_err(&self, source: libbpf_rs::Error) -> StoreError {
        StoreError::Io {
            name: self.spec.name.to_string(),
            source,
        }
    }
}

impl Table for PinnedTable {
    fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        check_sizes(&self.spec, key, None)?;
        self.map
            .lookup(key, MapFlags::ANY)
            .map_err(|e| self.io_err(e))
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        check_sizes(&self.spec, key, Some(value))?;
        self.map
            .update(key, value, MapFlags::ANY)
            .map_err(|e| self.io_err(e))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        check_sizes(&self.spec, key, None)?;
        self.map.delete(key).map_err(|e| self.io_err(e))
    }

    fn delete_if(&self, key: &[u8], expected: &[u8]) -> Result<bool, StoreError> {
        // The map has no compare-and-delete; a writer landing between the
        // two calls can still be erased.
        if self.lookup(key)?.as_deref() != Some(expected) {
            return Ok(false);
        }
        self.delete(key)?;
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.map.keys().collect())
    }
}

fn map_type(kind: TableKind) -> MapType {
    match kind {
        TableKind::Array => MapType::Array,
        TableKind::LruHash => MapType::LruHash,
        TableKind::SockArray => MapType::ReuseportSockarray,
    }
}

/// Tables pinned as BPF maps under a bpffs directory. Any process with
/// access to the directory can open them by name; pins outlive their
/// creator.
#[derive(Clone, Debug)]
pub struct PinnedNamespace {
    dir: PathBuf,
}

impl PinnedNamespace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Open the namespace, mounting bpffs and creating the directory if
    /// needed.
    pub fn create(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let ns = Self::new(dir);
        rlb_utils::ensure_pin_dir(&ns.dir)?;
        Ok(ns)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Pin `fd` at `name`. Returns false when something is already pinned
    /// there, which is how singletons are claimed across processes.
    pub fn pin_fd_exclusive(&self, name: &str, fd: BorrowedFd<'_>) -> Result<bool, StoreError> {
        let path = self.path_of(name);
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|e| StoreError::Pin {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;
        let ret = unsafe { libbpf_sys::bpf_obj_pin(fd.as_raw_fd(), cpath.as_ptr()) };
        if ret == 0 {
            return Ok(true);
        }
        let err = std::io::Error::from_raw_os_error(-ret);
        if err.kind() == std::io::ErrorKind::AlreadyExists {
            return Ok(false);
        }
        Err(StoreError::Pin {
            name: name.to_string(),
            source: err,
        })
    }

    /// Get a new fd for whatever is pinned at `name`.
    pub fn open_pinned_fd(&self, name: &str) -> Result<OwnedFd, StoreError> {
        let path = self.path_of(name);
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|e| StoreError::Pin {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;
        let fd = unsafe { libbpf_sys::bpf_obj_get(cpath.as_ptr()) };
        if fd < 0 {
            let source = std::io::Error::from_raw_os_error(-fd);
            if source.kind() == std::io::ErrorKind::NotFound {
                return Err(StoreError::Missing(name.to_string()));
            }
            return Err(StoreError::Pin {
                name: name.to_string(),
                source,
            });
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn open_existing(&self, spec: &TableSpec) -> Result<PinnedTable, StoreError> {
        let path = self.path_of(spec.name);
        if !path.exists() {
            return Err(StoreError::Missing(spec.name.to_string()));
        }
        let map = MapHandle::from_pinned_path(&path).map_err(|source| StoreError::Io {
            name: spec.name.to_string(),
            source,
        })?;
        if map.key_size() != spec.key_size {
            return Err(StoreError::KeySize {
                name: spec.name.to_string(),
                expected: spec.key_size,
                got: map.key_size() as usize,
            });
        }
        if map.value_size() != spec.value_size {
            return Err(StoreError::ValueSize {
                name: spec.name.to_string(),
                expected: spec.value_size,
                got: map.value_size() as usize,
            });
        }
        Ok(PinnedTable { spec: *spec, map })
    }
}

impl Default for PinnedNamespace {
    fn default() -> Self {
        Self::new(DEFAULT_PIN_DIR)
    }
}

impl Namespace for PinnedNamespace {
    fn open(&self, spec: &TableSpec) -> Result<Arc<dyn Table>, StoreError> {
        Ok(Arc::new(self.open_existing(spec)?))
    }

    fn open_or_create(&self, spec: &TableSpec) -> Result<Arc<dyn Table>, StoreError> {
        match self.open_existing(spec) {
            Err(StoreError::Missing(_)) => {}
            other => return Ok(Arc::new(other?)),
        }

        let opts = libbpf_sys::bpf_map_create_opts {
            sz: std::mem::size_of::<libbpf_sys::bpf_map_create_opts>() as libbpf_sys::size_t,
            ..Default::default()
        };
        let kname = &spec.name[..spec.name.len().min(MAP_NAME_MAX)];
        let map = MapHandle::create(
            map_type(spec.kind),
            Some(kname),
            spec.key_size,
            spec.value_size,
            spec.max_entries,
            &opts,
        )
        .map_err(|source| StoreError::Create {
            name: spec.name.to_string(),
            source,
        })?;

        if !self.pin_fd_exclusive(spec.name, map.as_fd())? {
            // Lost a creation race, use the winner's map.
            debug!("{} pinned concurrently, reopening", spec.name);
            return Ok(Arc::new(self.open_existing(spec)?));
        }
        info!("Created {} at {}", spec.name, self.path_of(spec.name).display());
        Ok(Arc::new(PinnedTable { spec: *spec, map }))
    }

    fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_of(name);
        let res = if path.is_dir() {
            std::fs::remove_dir(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match res {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Pin {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn pin_exclusive(&self, name: &str) -> Result<bool, StoreError> {
        // bpffs only holds pins and directories; a directory is the marker.
        match std::fs::create_dir(self.path_of(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(StoreError::Pin {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn is_pinned(&self, name: &str) -> bool {
        self.path_of(name).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PinnedNamespace {
        let dir = std::env::temp_dir().join(format!(
            "rlb-ns-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        PinnedNamespace::new(dir)
    }

    #[test]
    fn open_reports_missing_without_touching_bpf() {
        let ns = scratch();
        assert!(matches!(
            ns.open(&crate::store::CPU_UTIL),
            Err(StoreError::Missing(_))
        ));
        std::fs::remove_dir_all(ns.dir()).unwrap();
    }

    #[test]
    fn markers_use_directories() {
        let ns = scratch();
        assert!(ns.pin_exclusive("dispatch_9000").unwrap());
        assert!(!ns.pin_exclusive("dispatch_9000").unwrap());
        assert!(ns.is_pinned("dispatch_9000"));
        assert!(ns.remove("dispatch_9000").unwrap());
        assert!(!ns.remove("dispatch_9000").unwrap());
        std::fs::remove_dir_all(ns.dir()).unwrap();
    }
}
