// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Where steering decisions take effect.
//!
//! [`ReuseportProgram`] attaches an sk_reuseport program to the group so the
//! kernel steers each SYN. [`Dispatcher`] runs the same engine in userspace
//! for hosts without that hook.
mod bpf;
mod dispatch;

pub use bpf::load_object;
pub use bpf::read_kernel_stats;
pub use bpf::ReuseportProgram;
pub use bpf::BPF_OBJECT;
pub use bpf::SO_ATTACH_REUSEPORT_EBPF;
pub use bpf::SO_DETACH_REUSEPORT_BPF;
pub use dispatch::BackendMailbox;
pub use dispatch::Dispatcher;

use std::net::TcpListener;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// Another process already attached a program to this group.
    AlreadyAttached,
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("steering program {0} is not available in this build")]
    ProgramUnavailable(String),
    #[error("failed to load steering object")]
    Load(#[source] libbpf_rs::Error),
    #[error("failed to pin steering program")]
    Pin(#[source] StoreError),
    #[error("setsockopt on listener failed")]
    Setsockopt(#[source] std::io::Error),
}

pub trait SteeringHook {
    fn attach(&mut self, listener: &TcpListener) -> Result<AttachOutcome, AttachError>;
    /// Only called on explicit teardown.
    fn detach(&mut self, listener: &TcpListener) -> Result<(), AttachError>;
}

/// Marker name the group's program is pinned under.
pub fn program_pin_name(port: u16) -> String {
    format!("steer_prog_{}", port)
}
