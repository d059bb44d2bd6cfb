// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utility collection for rlb steering tools
//!
//! Helpers shared by the balancer binaries:
//!
//! - CPU list parsing for slot-to-core maps and collector core sets.
//! - bpffs mounting and pin-directory management.
//! - RLIMIT_MEMLOCK lifting for BPF map creation on older kernels.
//! - Routing libbpf's own diagnostics into the `log` facade.
//! - fd readiness polling and thread pinning.

mod cpu_list;
pub use cpu_list::parse_cpu_list;
pub use cpu_list::MAX_CPU_LIST;

mod bpffs;
pub use bpffs::ensure_bpffs_mounted;
pub use bpffs::ensure_pin_dir;
pub use bpffs::BPFFS_MAGIC;
pub use bpffs::DEFAULT_BPFFS_ROOT;

mod libbpf_logging;
pub use libbpf_logging::init_libbpf_logging;

mod misc;
pub use misc::pin_current_thread;
pub use misc::try_set_rlimit_infinity;
pub use misc::wait_readable;

use lazy_static::lazy_static;

lazy_static! {
    /// Number of possible CPU ids on this host, from
    /// `/sys/devices/system/cpu/possible`. Falls back to the online count.
    pub static ref NR_CPU_IDS: usize = read_nr_cpu_ids();
}

fn read_nr_cpu_ids() -> usize {
    std::fs::read_to_string("/sys/devices/system/cpu/possible")
        .ok()
        .and_then(|s| cpu_list::parse_sysfs_range(&s))
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
}
