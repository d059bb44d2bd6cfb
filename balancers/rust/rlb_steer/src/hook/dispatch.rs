// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Userspace steering for hosts without an sk_reuseport hook.
//!
//! One dispatcher owns the accepting listener. Backends join by ordinal and
//! get a mailbox; the registry maps the ordinal to the mailbox token. Every
//! accepted connection goes through the engine and is handed to the
//! mailbox of the chosen slot. A backend that exits closes its mailbox, and
//! its slot drops connections until something re-joins that ordinal.
use std::net::TcpListener;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::info;
use log::warn;
use rustc_hash::FxHashMap;

use crate::engine::Decision;
use crate::engine::DropReason;
use crate::engine::Engine;
use crate::engine::TelemetrySource;
use crate::registry::BackendRegistry;
use crate::registry::RegistryError;
use crate::registry::SlotHandle;
use crate::stats::Metrics;
use crate::store::MemNamespace;
use crate::store::Namespace;
use crate::telemetry::acceptq::observe_accept;
use crate::telemetry::acceptq::AcceptQueueCollector;
use crate::telemetry::TableTelemetry;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receiving end handed to a backend on join.
pub struct BackendMailbox {
    ordinal: u32,
    handle: SlotHandle,
    rx: Receiver<TcpStream>,
}

impl BackendMailbox {
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<TcpStream, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<TcpStream> {
        self.rx.try_recv().ok()
    }
}

pub struct Dispatcher {
    ns: MemNamespace,
    marker: String,
    engine: Engine,
    registry: BackendRegistry,
    telemetry: TableTelemetry,
    acceptq: AcceptQueueCollector,
    observe_accepts: AtomicBool,
    mailboxes: Mutex<FxHashMap<u64, Sender<TcpStream>>>,
    next_token: AtomicU64,
    metrics: Mutex<Metrics>,
}

impl Dispatcher {
    /// Become the dispatcher for `port`. Returns `None` if another one
    /// already owns the group.
    pub fn claim(ns: MemNamespace, port: u16, engine: Engine) -> Result<Option<Self>, RegistryError> {
        let marker = format!("dispatch_{}", port);
        if !ns.pin_exclusive(&marker)? {
            info!("{} already claimed", marker);
            return Ok(None);
        }

        let setup = || -> Result<_, RegistryError> {
            let registry = BackendRegistry::create(&ns, engine.config().nr_slots)?;
            let telemetry = TableTelemetry::open_or_create(&ns)?;
            let acceptq = AcceptQueueCollector::new(&ns)?;
            Ok((registry, telemetry, acceptq))
        };
        let (registry, telemetry, acceptq) = match setup() {
            Ok(v) => v,
            Err(e) => {
                let _ = ns.remove(&marker);
                return Err(e);
            }
        };

        let metrics = Metrics::new(engine.policy_name(), engine.config().nr_slots);
        info!(
            "Dispatcher for port {}: policy {}, {} slots",
            port,
            engine.policy_name(),
            engine.config().nr_slots
        );
        Ok(Some(Self {
            ns,
            marker,
            engine,
            registry,
            telemetry,
            acceptq,
            observe_accepts: AtomicBool::new(false),
            mailboxes: Mutex::new(FxHashMap::default()),
            next_token: AtomicU64::new(1),
            metrics: Mutex::new(metrics),
        }))
    }

    /// Sample accept-queue depth after every accept.
    pub fn set_observe_accepts(&self, on: bool) {
        self.observe_accepts.store(on, Ordering::Relaxed);
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Register a backend at `ordinal`, replacing whoever held it. The
    /// replaced backend's mailbox is closed.
    pub fn join(&self, ordinal: u32) -> Result<BackendMailbox, RegistryError> {
        let prev = self.registry.lookup(ordinal)?;
        let handle = SlotHandle(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = crossbeam::channel::unbounded();
        self.mailboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.0, tx);

        if let Err(e) = self.registry.register(ordinal, handle) {
            self.mailboxes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&handle.0);
            return Err(e);
        }
        if let Some(prev) = prev {
            self.mailboxes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&prev.0);
        }
        info!("Backend joined slot {} as {:#x}", ordinal, handle.0);
        Ok(BackendMailbox {
            ordinal,
            handle,
            rx,
        })
    }

    fn forget(&self, ordinal: u32, handle: SlotHandle) {
        self.mailboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0);
        match self.registry.unregister_if(ordinal, handle) {
            Ok(true) => info!("Slot {} backend {:#x} is gone", ordinal, handle.0),
            Ok(false) => {}
            Err(e) => warn!("clearing slot {}: {}", ordinal, e),
        }
    }

    /// Steer one connection. On DROP the stream is closed.
    pub fn dispatch(&self, stream: TcpStream) -> Decision {
        let mut decision = self.engine.decide(&self.registry, &self.telemetry);

        if let Decision::Pass { ordinal, handle } = decision {
            let tx = self
                .mailboxes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&handle.0)
                .cloned();
            let delivered = match tx {
                Some(tx) => tx.send(stream).is_ok(),
                None => false,
            };
            if !delivered {
                self.forget(ordinal, handle);
                decision = Decision::Drop(DropReason::Disconnected(ordinal));
            }
        }

        debug!("dispatch: {:?}", decision);
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(&decision);
        decision
    }

    /// Accept and steer until `shutdown` is set.
    pub fn run(&self, listener: &TcpListener, shutdown: &AtomicBool) -> Result<()> {
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;

        while !shutdown.load(Ordering::Relaxed) {
            if !rlb_utils::wait_readable(listener.as_fd(), POLL_INTERVAL)? {
                continue;
            }
            let stream = match listener.accept() {
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
            if self.observe_accepts.load(Ordering::Relaxed) {
                match observe_accept(listener, &stream) {
                    Ok(ev) => {
                        if let Err(e) = self.acceptq.record(&ev) {
                            debug!("acceptq record: {}", e);
                        }
                    }
                    Err(e) => debug!("acceptq sample: {}", e),
                }
            }
            self.dispatch(stream);
        }
        Ok(())
    }

    /// Counters plus the telemetry the engine currently sees.
    pub fn metrics(&self) -> Metrics {
        let mut m = self
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for &core in self.engine.config().cores() {
            if let Some(util) = self.telemetry.cpu_util(core) {
                m.cpu_util.insert(core, util);
            }
            if let Some(occ) = self.telemetry.queue_occupancy(core) {
                m.acceptq.insert(core, occ);
            }
        }
        m
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.ns.remove(&self.marker) {
            warn!("releasing {}: {}", self.marker, e);
        }
    }
}
