// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Telemetry-driven SO_REUSEPORT connection steering.
//!
//! Backends share one listening address. A selector attached to the group
//! picks, for every new connection, the backend ordinal to hand it to:
//!
//! - [`registry`] maps ordinals to live listener handles and survives any
//!   single backend, so a restarted backend rejoins by re-registering.
//! - [`telemetry`] publishes smoothed per-core CPU utilization and
//!   accept-queue occupancy into shared tables.
//! - [`engine`] turns a candidate snapshot into a PASS/DROP decision under
//!   a pluggable [`engine::Policy`].
//! - [`hook`] attaches the in-kernel selector to the group, or runs the
//!   same engine in a userspace dispatcher where no kernel hook exists.
//! - [`listener`] drives a backend's lifecycle: bind, attach, register,
//!   serve.
//!
//! All shared state lives in named tables opened through a
//! [`store::Namespace`], either pinned BPF maps or an in-process namespace.

pub mod bpf_intf;
pub mod engine;
pub mod hook;
pub mod listener;
pub mod registry;
pub mod stats;
pub mod store;
pub mod telemetry;

pub const BALANCER_NAME: &str = "rlb_steer";
