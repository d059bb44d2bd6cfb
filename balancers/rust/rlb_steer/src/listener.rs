// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Backend lifecycle: bind into the shared group, attach (designated
//! process only), register, serve.
//!
//! The registry, the telemetry tables and the attached program all outlive
//! any one backend. A restarted backend only has to bind and re-register
//! its ordinal to be eligible again.
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::ValueEnum;
use log::debug;
use log::info;
use log::warn;
use nix::sys::socket::bind;
use nix::sys::socket::listen;
use nix::sys::socket::setsockopt;
use nix::sys::socket::socket;
use nix::sys::socket::sockopt;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::SockaddrStorage;
use serde::Serialize;
use thiserror::Error;

use crate::bpf_intf::steer_config;
use crate::bpf_intf::MAX_SLOTS;
use crate::engine::EngineConfig;
use crate::engine::PolicyKind;
use crate::hook::AttachError;
use crate::hook::AttachOutcome;
use crate::hook::SteeringHook;
use crate::registry::BackendRegistry;
use crate::registry::RegistryError;
use crate::store::lookup_pod;
use crate::store::update_pod;
use crate::store::update_u32;
use crate::store::Namespace;
use crate::store::StoreError;
use crate::store::ALL_TABLES;
use crate::store::RR_STATE;
use crate::store::STEER_CONFIG;
use crate::telemetry::acceptq::observe_accept;
use crate::telemetry::acceptq::socket_cookie;
use crate::telemetry::acceptq::AcceptQueueCollector;

pub const DEFAULT_BACKLOG: usize = 128;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum AcceptqSource {
    /// kprobe on tcp_v4_syn_recv_sock.
    Kernel,
    /// Sample the listener after every accept.
    Userspace,
    Off,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to attach steering program")]
    Attach(#[source] AttachError),
    #[error("backend registry unavailable")]
    RegistryUnavailable(#[source] RegistryError),
    #[error("failed to set up shared tables")]
    Tables(#[source] StoreError),
    #[error("serving failed")]
    Serve(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct StartOpts {
    pub addr: SocketAddr,
    pub ordinal: u32,
    pub policy: PolicyKind,
    pub engine: EngineConfig,
    /// Creates the group's tables and attaches the program.
    pub designated: bool,
    pub backlog: usize,
    /// Artificial per-connection delay, to let backlogs build.
    pub accept_delay: Duration,
    pub acceptq_source: AcceptqSource,
}

impl StartOpts {
    pub fn new(addr: SocketAddr, ordinal: u32, policy: PolicyKind) -> Self {
        Self {
            addr,
            ordinal,
            policy,
            engine: EngineConfig::default(),
            designated: ordinal == 0,
            backlog: DEFAULT_BACKLOG,
            accept_delay: Duration::ZERO,
            acceptq_source: AcceptqSource::Off,
        }
    }

    pub fn validate(&self) -> Result<(), StartError> {
        self.engine
            .validate()
            .map_err(|e| StartError::Config(format!("{:#}", e)))?;
        if self.ordinal >= self.engine.nr_slots {
            return Err(StartError::Config(format!(
                "ordinal {} outside [0, {})",
                self.ordinal, self.engine.nr_slots
            )));
        }
        if self.backlog == 0 {
            return Err(StartError::Config("backlog must be non-zero".into()));
        }
        Ok(())
    }
}

/// Bind a listener that shares `addr` with every other SO_REUSEPORT
/// listener of the same user.
pub fn bind_shared(addr: SocketAddr, backlog: usize) -> std::io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    setsockopt(&fd, sockopt::ReusePort, &true)?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
    listen(&fd, backlog)?;
    Ok(TcpListener::from(fd))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSetup {
    /// This process wrote the slot layout.
    Created,
    /// The group already had a matching layout; nothing was changed.
    Existing,
}

/// Create every shared table. The slot layout is written and `rr_state`
/// seeded only if no layout exists yet; a restarted designated process
/// must present the same layout the group is running with.
pub fn setup_group(ns: &dyn Namespace, cfg: &EngineConfig) -> Result<GroupSetup, StartError> {
    for spec in ALL_TABLES.iter() {
        ns.open_or_create(spec).map_err(StartError::Tables)?;
    }
    let conf = ns.open(&STEER_CONFIG).map_err(StartError::Tables)?;
    let want = cfg.to_steer_config();

    let existing = lookup_pod::<steer_config>(conf.as_ref(), 0)
        .map_err(StartError::Tables)?
        .filter(|c| c.nr_slots != 0);
    if let Some(existing) = existing {
        if existing != want {
            let n = (existing.nr_slots as usize).min(MAX_SLOTS);
            return Err(StartError::Config(format!(
                "group runs {} slots on cores {:?}, refusing to change it; tear the group down first",
                existing.nr_slots,
                &existing.slot_cores[..n]
            )));
        }
        return Ok(GroupSetup::Existing);
    }

    update_pod(conf.as_ref(), 0, &want).map_err(StartError::Tables)?;
    let rr = ns.open(&RR_STATE).map_err(StartError::Tables)?;
    update_u32(rr.as_ref(), 0, 0).map_err(StartError::Tables)?;
    Ok(GroupSetup::Created)
}

pub struct Backend {
    opts: StartOpts,
    listener: TcpListener,
    cookie: u64,
    attach: Option<AttachOutcome>,
    registry: Option<BackendRegistry>,
    acceptq: Option<AcceptQueueCollector>,
}

impl Backend {
    /// Bind, attach if designated, and register. On success the backend
    /// is routable and ready to serve.
    pub fn start(
        opts: StartOpts,
        ns: &dyn Namespace,
        hook: &mut dyn SteeringHook,
    ) -> Result<Self, StartError> {
        opts.validate()?;

        let listener = bind_shared(opts.addr, opts.backlog).map_err(|source| StartError::Bind {
            addr: opts.addr,
            source,
        })?;
        let cookie = socket_cookie(&listener).unwrap_or(0);
        info!(
            "Backend {} listening on {} (cookie {:#x}, policy {:?})",
            opts.ordinal, opts.addr, cookie, opts.policy
        );

        let mut attach = None;
        let mut registry = None;
        if opts.policy.steers() {
            if opts.designated {
                match setup_group(ns, &opts.engine)? {
                    GroupSetup::Created => info!("Configured group with {} slots", opts.engine.nr_slots),
                    GroupSetup::Existing => info!("Group already configured, keeping it"),
                }
                let outcome = hook.attach(&listener).map_err(StartError::Attach)?;
                match outcome {
                    AttachOutcome::Attached => info!("Steering program attached"),
                    AttachOutcome::AlreadyAttached => {
                        info!("Steering program already attached to the group")
                    }
                }
                attach = Some(outcome);
            }

            let reg = BackendRegistry::open(ns, opts.engine.nr_slots)
                .map_err(StartError::RegistryUnavailable)?;
            reg.register_listener(opts.ordinal, listener.as_fd())
                .map_err(StartError::RegistryUnavailable)?;
            info!("Registered backend {} in slot {}", cookie, opts.ordinal);
            registry = Some(reg);
        }

        let acceptq = match opts.acceptq_source {
            AcceptqSource::Userspace => {
                Some(AcceptQueueCollector::new(ns).map_err(StartError::Tables)?)
            }
            AcceptqSource::Kernel | AcceptqSource::Off => None,
        };

        Ok(Self {
            opts,
            listener,
            cookie,
            attach,
            registry,
            acceptq,
        })
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn attach_outcome(&self) -> Option<AttachOutcome> {
        self.attach
    }

    pub fn registry(&self) -> Option<&BackendRegistry> {
        self.registry.as_ref()
    }

    /// Accept connections and pass them to `handler` until `shutdown` is
    /// set. Returns the number of connections served.
    pub fn serve<F>(&self, shutdown: &AtomicBool, mut handler: F) -> Result<u64, StartError>
    where
        F: FnMut(TcpStream),
    {
        self.listener.set_nonblocking(true).map_err(StartError::Serve)?;
        let mut served = 0u64;

        while !shutdown.load(Ordering::Relaxed) {
            if !rlb_utils::wait_readable(self.listener.as_fd(), POLL_INTERVAL)
                .map_err(StartError::Serve)?
            {
                continue;
            }
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nonblocking(false) {
                warn!("accepted stream: {}", e);
                continue;
            }

            if !self.opts.accept_delay.is_zero() {
                std::thread::sleep(self.opts.accept_delay);
            }
            if let Some(acceptq) = &self.acceptq {
                match observe_accept(&self.listener, &stream) {
                    Ok(ev) => {
                        if let Err(e) = acceptq.record(&ev) {
                            debug!("acceptq record: {}", e);
                        }
                    }
                    Err(e) => debug!("acceptq sample: {}", e),
                }
            }

            handler(stream);
            served += 1;
        }
        info!("Backend {} stopped after {} connections", self.opts.ordinal, served);
        Ok(served)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SlotHandle;
    use crate::store::lookup_u32;
    use crate::store::MemNamespace;
    use std::io::Read;
    use std::io::Write;
    use std::sync::Arc;

    struct MockHook {
        calls: u32,
        outcome: Option<AttachOutcome>,
    }

    impl MockHook {
        fn new(outcome: Option<AttachOutcome>) -> Self {
            Self { calls: 0, outcome }
        }
    }

    impl SteeringHook for MockHook {
        fn attach(&mut self, _listener: &TcpListener) -> Result<AttachOutcome, AttachError> {
            self.calls += 1;
            self.outcome
                .ok_or_else(|| AttachError::ProgramUnavailable("mock".into()))
        }

        fn detach(&mut self, _listener: &TcpListener) -> Result<(), AttachError> {
            Ok(())
        }
    }

    fn free_addr() -> SocketAddr {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    }

    fn opts(addr: SocketAddr, ordinal: u32, policy: PolicyKind) -> StartOpts {
        let mut o = StartOpts::new(addr, ordinal, policy);
        o.engine = EngineConfig::new(2, &[0, 1], 0).unwrap();
        o
    }

    #[test]
    fn bind_shared_allows_second_listener() {
        let a = bind_shared("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = a.local_addr().unwrap();
        let b = bind_shared(addr, 16).unwrap();
        assert_eq!(b.local_addr().unwrap(), addr);
    }

    #[test]
    fn designated_sets_up_group_and_registers() {
        let ns = MemNamespace::new();
        let mut hook = MockHook::new(Some(AttachOutcome::Attached));
        let b = Backend::start(opts(free_addr(), 0, PolicyKind::RoundRobin), &ns, &mut hook).unwrap();
        assert_eq!(hook.calls, 1);
        assert_eq!(b.attach_outcome(), Some(AttachOutcome::Attached));

        let fd = b.listener().as_raw_fd() as u64;
        assert_eq!(b.registry().unwrap().lookup(0).unwrap(), Some(SlotHandle(fd)));

        let conf = ns.open(&STEER_CONFIG).unwrap();
        let sc: steer_config = lookup_pod(conf.as_ref(), 0).unwrap().unwrap();
        assert_eq!(sc.nr_slots, 2);
        assert_eq!(&sc.slot_cores[..2], &[0, 1]);
        let rr = ns.open(&RR_STATE).unwrap();
        assert_eq!(lookup_u32(rr.as_ref(), 0).unwrap(), Some(0));
    }

    #[test]
    fn late_joiner_continues_after_existing_attachment() {
        let ns = MemNamespace::new();
        let addr = free_addr();
        let mut first = MockHook::new(Some(AttachOutcome::Attached));
        let _a = Backend::start(opts(addr, 0, PolicyKind::Cpuutil), &ns, &mut first).unwrap();

        let mut second = MockHook::new(Some(AttachOutcome::AlreadyAttached));
        let mut o = opts(addr, 1, PolicyKind::Cpuutil);
        o.designated = true;
        let b = Backend::start(o, &ns, &mut second).unwrap();
        assert_eq!(b.attach_outcome(), Some(AttachOutcome::AlreadyAttached));
        assert_eq!(b.registry().unwrap().entries().unwrap().len(), 2);
    }

    #[test]
    fn designated_restart_keeps_group_config() {
        let ns = MemNamespace::new();
        let addr = free_addr();
        let mut four = StartOpts::new(addr, 0, PolicyKind::RoundRobin);
        four.engine = EngineConfig::new(4, &[0, 2, 4, 6], 0).unwrap();

        let mut hook = MockHook::new(Some(AttachOutcome::Attached));
        let first = Backend::start(four.clone(), &ns, &mut hook).unwrap();
        let rr = ns.open(&RR_STATE).unwrap();
        update_u32(rr.as_ref(), 0, 41).unwrap();
        drop(first);

        // same layout: rejoins without touching shared state
        let mut again = MockHook::new(Some(AttachOutcome::AlreadyAttached));
        let b = Backend::start(four, &ns, &mut again).unwrap();
        assert_eq!(lookup_u32(rr.as_ref(), 0).unwrap(), Some(41));
        assert!(b.registry().unwrap().lookup(0).unwrap().is_some());
        drop(b);

        // different layout: refused, group untouched
        let mut two = StartOpts::new(addr, 0, PolicyKind::RoundRobin);
        two.engine = EngineConfig::new(2, &[1, 3], 0).unwrap();
        let mut other = MockHook::new(Some(AttachOutcome::AlreadyAttached));
        let err = Backend::start(two, &ns, &mut other).err().unwrap();
        assert!(matches!(err, StartError::Config(_)));
        assert_eq!(other.calls, 0);

        let conf = ns.open(&STEER_CONFIG).unwrap();
        let sc: steer_config = lookup_pod(conf.as_ref(), 0).unwrap().unwrap();
        assert_eq!(sc.nr_slots, 4);
        assert_eq!(&sc.slot_cores[..4], &[0, 2, 4, 6]);
        assert_eq!(lookup_u32(rr.as_ref(), 0).unwrap(), Some(41));
    }

    #[test]
    fn joiner_without_registry_fails() {
        let ns = MemNamespace::new();
        let mut hook = MockHook::new(Some(AttachOutcome::Attached));
        let err = Backend::start(opts(free_addr(), 1, PolicyKind::Pickfirst), &ns, &mut hook)
            .err()
            .unwrap();
        assert!(matches!(err, StartError::RegistryUnavailable(RegistryError::Unavailable(_))));
        assert_eq!(hook.calls, 0);
    }

    #[test]
    fn attach_failure_is_reported() {
        let ns = MemNamespace::new();
        let mut hook = MockHook::new(None);
        let err = Backend::start(opts(free_addr(), 0, PolicyKind::Pickfirst), &ns, &mut hook)
            .err()
            .unwrap();
        assert!(matches!(err, StartError::Attach(_)));
    }

    #[test]
    fn default_policy_skips_steering() {
        let ns = MemNamespace::new();
        let mut hook = MockHook::new(Some(AttachOutcome::Attached));
        let b = Backend::start(opts(free_addr(), 1, PolicyKind::Default), &ns, &mut hook).unwrap();
        assert_eq!(hook.calls, 0);
        assert!(b.registry().is_none());
        assert!(ns.open(&STEER_CONFIG).is_err());
    }

    #[test]
    fn rejects_bad_ordinal() {
        let ns = MemNamespace::new();
        let mut hook = MockHook::new(Some(AttachOutcome::Attached));
        let err = Backend::start(opts(free_addr(), 5, PolicyKind::Pickfirst), &ns, &mut hook)
            .err()
            .unwrap();
        assert!(matches!(err, StartError::Config(_)));
    }

    #[test]
    fn serves_until_shutdown() {
        let ns = MemNamespace::new();
        let mut hook = MockHook::new(Some(AttachOutcome::Attached));
        let mut o = opts(free_addr(), 0, PolicyKind::Pickfirst);
        o.acceptq_source = AcceptqSource::Userspace;
        let b = Backend::start(o, &ns, &mut hook).unwrap();
        let addr = b.listener().local_addr().unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let client = std::thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            let mut buf = String::new();
            s.read_to_string(&mut buf).unwrap();
            flag.store(true, Ordering::Relaxed);
            buf
        });

        let served = b
            .serve(&shutdown, |mut stream| {
                let _ = stream.write_all(b"hi\n");
            })
            .unwrap();
        assert_eq!(served, 1);
        assert_eq!(client.join().unwrap(), "hi\n");

        let acceptq = AcceptQueueCollector::new(&ns).unwrap();
        assert!(acceptq.by_socket(b.cookie()).unwrap().is_some());
    }
}
