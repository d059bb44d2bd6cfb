// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Rust mirror of `src/bpf/intf.h`. Layouts must match the C side byte for
//! byte; they are written into and read out of the shared tables as raw
//! native-endian records.
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]

pub const MAX_SLOTS: usize = 16;
pub const MAX_CORES: u32 = 256;
pub const ACCEPTQ_SOCKETS: u32 = 1024;

pub const STAT_PASS: u32 = 0;
pub const STAT_DROP: u32 = 1;
pub const NR_STATS: u32 = 2;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct acceptq_rec {
    pub curr: u32,
    pub max: u32,
    pub cpu: u32,
}

unsafe impl plain::Plain for acceptq_rec {}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct steer_config {
    pub nr_slots: u32,
    pub first_ordinal: u32,
    pub slot_cores: [u32; MAX_SLOTS],
}

unsafe impl plain::Plain for steer_config {}
