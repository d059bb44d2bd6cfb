// SPDX-License-Identifier: GPL-2.0
use anyhow::{bail, Context, Result};
use log::info;
use std::ffi::CString;
use std::path::Path;

pub const BPFFS_MAGIC: i64 = 0xCAFE4A11;
pub const DEFAULT_BPFFS_ROOT: &str = "/sys/fs/bpf";

fn is_bpffs(path: &Path) -> Result<bool> {
    let cpath = CString::new(path.as_os_str().as_encoded_bytes())
        .context("bpffs path contains a NUL byte")?;
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statfs(cpath.as_ptr(), &mut st) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statfs({})", path.display()));
    }
    Ok(st.f_type as i64 == BPFFS_MAGIC)
}

/// Make sure a BPF filesystem is mounted at `root`, mounting one if needed.
pub fn ensure_bpffs_mounted(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root).with_context(|| format!("mkdir {}", root.display()))?;
    if is_bpffs(root)? {
        return Ok(());
    }

    let src = CString::new("bpf")?;
    let fstype = CString::new("bpf")?;
    let target = CString::new(root.as_os_str().as_encoded_bytes())?;
    let ret = unsafe {
        libc::mount(
            src.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            std::ptr::null(),
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("mounting bpffs at {}", root.display()));
    }
    if !is_bpffs(root)? {
        bail!("{} is still not a bpffs after mount", root.display());
    }
    info!("Mounted bpffs at {}", root.display());
    Ok(())
}

/// Create the pin directory `dir`, mounting bpffs at its root first when
/// `dir` lives under `/sys/fs/bpf`. Directories elsewhere are created as-is.
pub fn ensure_pin_dir(dir: &Path) -> Result<()> {
    let root = Path::new(DEFAULT_BPFFS_ROOT);
    if dir.starts_with(root) {
        ensure_bpffs_mounted(root)?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))
}
