// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Accept-queue telemetry.
//!
//! Each sample is written twice: under the listener's socket cookie, which
//! is kept for diagnostics only, and under the core that handled the
//! connection, which is what the engine reads. Both are last writer wins.
//!
//! Samples come either from the kernel (a kprobe on
//! `tcp_v4_syn_recv_sock`, see [`AcceptQueueProbe`]) or from userspace
//! after each accept (see [`observe_accept`]).
use std::net::TcpListener;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use log::debug;
use log::info;
use serde::Serialize;

use crate::bpf_intf::acceptq_rec;
use crate::bpf_intf::MAX_CORES;
use crate::hook::load_object;
use crate::hook::AttachError;
use crate::hook::AttachOutcome;
use crate::store::lookup_pod;
use crate::store::update_pod;
use crate::store::Namespace;
use crate::store::PinnedNamespace;
use crate::store::StoreError;
use crate::store::Table;
use crate::store::ACCEPTQ_BY_CORE;
use crate::store::ACCEPTQ_BY_SOCKET;

pub const SO_INCOMING_CPU: libc::c_int = 49;
pub const SO_COOKIE: libc::c_int = 57;

pub const PROBE_PROG: &str = "on_syn_recv";
pub const PROBE_LINK_PIN: &str = "acceptq_probe_link";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcceptQueueEvent {
    pub cookie: u64,
    pub curr: u32,
    pub max: u32,
    pub cpu: u32,
}

impl AcceptQueueEvent {
    pub fn occupancy(&self) -> u32 {
        super::occupancy(self.curr, self.max)
    }

    fn rec(&self) -> acceptq_rec {
        acceptq_rec {
            curr: self.curr,
            max: self.max,
            cpu: self.cpu,
        }
    }
}

pub struct AcceptQueueCollector {
    by_socket: Arc<dyn Table>,
    by_core: Arc<dyn Table>,
}

impl AcceptQueueCollector {
    pub fn new(ns: &dyn Namespace) -> Result<Self, StoreError> {
        Ok(Self {
            by_socket: ns.open_or_create(&ACCEPTQ_BY_SOCKET)?,
            by_core: ns.open_or_create(&ACCEPTQ_BY_CORE)?,
        })
    }

    /// The core entry is written first and independently; a failed socket
    /// entry is only logged.
    pub fn record(&self, ev: &AcceptQueueEvent) -> Result<(), StoreError> {
        let rec = ev.rec();
        if ev.cpu < MAX_CORES {
            update_pod(self.by_core.as_ref(), ev.cpu, &rec)?;
        }
        let bytes = unsafe { plain::as_bytes(&rec) };
        if let Err(e) = self.by_socket.update(&ev.cookie.to_ne_bytes(), bytes) {
            debug!("acceptq socket {:#x}: {}", ev.cookie, e);
        }
        Ok(())
    }

    pub fn by_core(&self, core: u32) -> Result<Option<acceptq_rec>, StoreError> {
        lookup_pod(self.by_core.as_ref(), core)
    }

    pub fn by_socket(&self, cookie: u64) -> Result<Option<acceptq_rec>, StoreError> {
        let Some(bytes) = self.by_socket.lookup(&cookie.to_ne_bytes())? else {
            return Ok(None);
        };
        let mut rec = acceptq_rec::default();
        plain::copy_from_bytes(&mut rec, &bytes).map_err(|_| StoreError::ValueSize {
            name: ACCEPTQ_BY_SOCKET.name.to_string(),
            expected: std::mem::size_of::<acceptq_rec>() as u32,
            got: bytes.len(),
        })?;
        Ok(Some(rec))
    }
}

fn getsockopt_raw<T: Copy>(fd: impl AsFd, level: libc::c_int, opt: libc::c_int, val: &mut T) -> std::io::Result<usize> {
    let mut len = std::mem::size_of::<T>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_fd().as_raw_fd(),
            level,
            opt,
            val as *mut T as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(len as usize)
}

// Leading part of struct tcp_info. The kernel copies min(len, sizeof).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TcpInfoHead {
    state: u8,
    ca_state: u8,
    retransmits: u8,
    probes: u8,
    backoff: u8,
    options: u8,
    wscale: u8,
    flags: u8,
    rto: u32,
    ato: u32,
    snd_mss: u32,
    rcv_mss: u32,
    // On a listener: current accept backlog.
    unacked: u32,
    // On a listener: backlog limit.
    sacked: u32,
}

/// Accept-queue depth and limit of a listening socket.
pub fn listener_backlog(listener: &TcpListener) -> std::io::Result<(u32, u32)> {
    let mut info = TcpInfoHead::default();
    getsockopt_raw(listener, libc::IPPROTO_TCP, libc::TCP_INFO, &mut info)?;
    Ok((info.unacked, info.sacked))
}

pub fn socket_cookie(fd: impl AsFd) -> std::io::Result<u64> {
    let mut cookie = 0u64;
    getsockopt_raw(fd, libc::SOL_SOCKET, SO_COOKIE, &mut cookie)?;
    Ok(cookie)
}

/// Core that processed the connection's packets.
pub fn incoming_cpu(stream: &TcpStream) -> std::io::Result<u32> {
    let mut cpu: libc::c_int = -1;
    getsockopt_raw(stream, libc::SOL_SOCKET, SO_INCOMING_CPU, &mut cpu)?;
    Ok(cpu.max(0) as u32)
}

/// Sample the accept queue right after `stream` came off `listener`.
pub fn observe_accept(listener: &TcpListener, stream: &TcpStream) -> std::io::Result<AcceptQueueEvent> {
    let (curr, max) = listener_backlog(listener)?;
    Ok(AcceptQueueEvent {
        cookie: socket_cookie(listener)?,
        curr,
        max,
        cpu: incoming_cpu(stream)?,
    })
}

/// The in-kernel accept-queue sampler. Its link is pinned so sampling
/// continues after the loading process exits.
pub struct AcceptQueueProbe {
    ns: PinnedNamespace,
}

impl AcceptQueueProbe {
    pub fn new(ns: PinnedNamespace) -> Self {
        Self { ns }
    }

    pub fn attach(&self) -> Result<AttachOutcome, AttachError> {
        if self.ns.is_pinned(PROBE_LINK_PIN) {
            return Ok(AttachOutcome::AlreadyAttached);
        }
        let mut obj = load_object(&self.ns, PROBE_PROG)?;
        let link = obj
            .progs_mut()
            .find(|p| p.name() == PROBE_PROG)
            .ok_or_else(|| AttachError::ProgramUnavailable(PROBE_PROG.to_string()))?
            .attach()
            .map_err(AttachError::Load)?;

        if !self
            .ns
            .pin_fd_exclusive(PROBE_LINK_PIN, link.as_fd())
            .map_err(AttachError::Pin)?
        {
            return Ok(AttachOutcome::AlreadyAttached);
        }
        info!("Accept-queue probe attached, link pinned at {}", self.ns.path_of(PROBE_LINK_PIN).display());
        Ok(AttachOutcome::Attached)
    }

    pub fn detach(&self) -> Result<bool, StoreError> {
        self.ns.remove(PROBE_LINK_PIN)
    }
}
