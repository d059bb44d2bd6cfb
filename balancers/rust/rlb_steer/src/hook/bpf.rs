// SPDX-License-Identifier: GPL-2.0
use std::net::TcpListener;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;

use libbpf_rs::AsRawLibbpf;
use libbpf_rs::Object;
use libbpf_rs::ObjectBuilder;
use libbpf_rs::OpenObject;
use log::debug;
use log::info;
use log::warn;

use super::program_pin_name;
use super::AttachError;
use super::AttachOutcome;
use super::SteeringHook;
use crate::bpf_intf::NR_STATS;
use crate::store::lookup_u64;
use crate::store::Namespace;
use crate::store::PinnedNamespace;
use crate::store::StoreError;
use crate::store::STEER_STATS;

pub const SO_ATTACH_REUSEPORT_EBPF: libc::c_int = 52;
pub const SO_DETACH_REUSEPORT_BPF: libc::c_int = 68;

/// Compiled steering object, absent when the build had no BPF toolchain.
#[cfg(has_bpf_object)]
pub const BPF_OBJECT: Option<&[u8]> = Some(include_bytes!(env!("RLB_BPF_OBJECT")));
#[cfg(not(has_bpf_object))]
pub const BPF_OBJECT: Option<&[u8]> = None;

/// Open the steering object with every map pinned by name under `ns`, so
/// existing tables are reused and missing ones are created and pinned.
/// Only `prog` is loaded.
pub fn load_object(ns: &PinnedNamespace, prog: &str) -> Result<Object, AttachError> {
    let bytes = BPF_OBJECT.ok_or_else(|| AttachError::ProgramUnavailable(prog.to_string()))?;

    let mut open = ObjectBuilder::default()
        .open_memory(bytes)
        .map_err(AttachError::Load)?;

    select_program(&mut open, prog)?;

    for mut map in open.maps_mut() {
        let name = map.name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        map.set_pin_path(ns.path_of(&name))
            .map_err(AttachError::Load)?;
    }

    open.load().map_err(AttachError::Load)
}

/// Mark `prog` as the only program to load.
fn select_program(open: &mut OpenObject, prog: &str) -> Result<(), AttachError> {
    let mut found = false;
    for p in open.progs_mut() {
        let wanted = p.name() == prog;
        found |= wanted;
        // OpenProgramMut::set_autoload drops libbpf's return code.
        let ret = unsafe {
            libbpf_sys::bpf_program__set_autoload(p.as_libbpf_object().as_ptr(), wanted)
        };
        if ret != 0 {
            return Err(AttachError::Load(libbpf_rs::Error::from_raw_os_error(-ret)));
        }
    }
    if !found {
        return Err(AttachError::ProgramUnavailable(prog.to_string()));
    }
    Ok(())
}

fn set_listener_opt(listener: &TcpListener, opt: libc::c_int, val: libc::c_int) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            listener.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// sk_reuseport program attached to one SO_REUSEPORT group. The program
/// is pinned per port; the pin doubles as the group's "already attached"
/// marker and keeps the program alive after the attaching process exits.
pub struct ReuseportProgram {
    ns: PinnedNamespace,
    prog: &'static str,
    port: u16,
}

impl ReuseportProgram {
    pub fn new(ns: PinnedNamespace, prog: &'static str, port: u16) -> Self {
        Self { ns, prog, port }
    }

    pub fn pin_name(&self) -> String {
        program_pin_name(self.port)
    }
}

impl SteeringHook for ReuseportProgram {
    fn attach(&mut self, listener: &TcpListener) -> Result<AttachOutcome, AttachError> {
        let pin = self.pin_name();
        if self.ns.is_pinned(&pin) {
            // The group may have been torn down and rebuilt since the pin was
            // made; re-attaching the pinned program is a no-op otherwise.
            let fd = self.ns.open_pinned_fd(&pin).map_err(AttachError::Pin)?;
            set_listener_opt(listener, SO_ATTACH_REUSEPORT_EBPF, fd.as_raw_fd())
                .map_err(AttachError::Setsockopt)?;
            info!("{} already pinned for port {}, reusing it", pin, self.port);
            return Ok(AttachOutcome::AlreadyAttached);
        }

        let obj = load_object(&self.ns, self.prog)?;
        let prog = obj
            .progs()
            .find(|p| p.name() == self.prog)
            .ok_or_else(|| AttachError::ProgramUnavailable(self.prog.to_string()))?;

        if !self
            .ns
            .pin_fd_exclusive(&pin, prog.as_fd())
            .map_err(AttachError::Pin)?
        {
            return Ok(AttachOutcome::AlreadyAttached);
        }

        let prog_fd = prog.as_fd().as_raw_fd();
        if let Err(e) = set_listener_opt(listener, SO_ATTACH_REUSEPORT_EBPF, prog_fd) {
            if let Err(ue) = self.ns.remove(&pin) {
                warn!("failed to unpin {} after attach failure: {}", pin, ue);
            }
            return Err(AttachError::Setsockopt(e));
        }
        info!("Attached {} to port {} (pinned {})", self.prog, self.port, pin);
        Ok(AttachOutcome::Attached)
    }

    fn detach(&mut self, listener: &TcpListener) -> Result<(), AttachError> {
        set_listener_opt(listener, SO_DETACH_REUSEPORT_BPF, 0).map_err(AttachError::Setsockopt)?;
        let pin = self.pin_name();
        let removed = self.ns.remove(&pin).map_err(AttachError::Pin)?;
        debug!("Detached steering program from port {} (unpinned: {})", self.port, removed);
        Ok(())
    }
}

/// PASS and DROP counts recorded by the in-kernel selectors.
pub fn read_kernel_stats(ns: &dyn Namespace) -> Result<[u64; NR_STATS as usize], StoreError> {
    let table = ns.open(&STEER_STATS)?;
    let mut out = [0u64; NR_STATS as usize];
    for (idx, slot) in out.iter_mut().enumerate() {
        *slot = lookup_u64(table.as_ref(), idx as u32)?.unwrap_or(0);
    }
    Ok(out)
}
