// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::env;
use std::path::PathBuf;
use std::process::Command;

const BPF_SRC: &str = "src/bpf/main.bpf.c";
const BPF_INTF: &str = "src/bpf/intf.h";

fn target_arch_define() -> Option<&'static str> {
    match env::var("CARGO_CFG_TARGET_ARCH").ok()?.as_str() {
        "x86_64" => Some("-D__TARGET_ARCH_x86"),
        "aarch64" => Some("-D__TARGET_ARCH_arm64"),
        "riscv64" => Some("-D__TARGET_ARCH_riscv"),
        "powerpc64" => Some("-D__TARGET_ARCH_powerpc"),
        "s390x" => Some("-D__TARGET_ARCH_s390"),
        _ => None,
    }
}

fn multiarch_include() -> Option<PathBuf> {
    let triple = match env::var("CARGO_CFG_TARGET_ARCH").ok()?.as_str() {
        "x86_64" => "x86_64-linux-gnu",
        "aarch64" => "aarch64-linux-gnu",
        "riscv64" => "riscv64-linux-gnu",
        "powerpc64" => "powerpc64le-linux-gnu",
        "s390x" => "s390x-linux-gnu",
        _ => return None,
    };
    let dir = PathBuf::from("/usr/include").join(triple);
    dir.is_dir().then_some(dir)
}

fn compile_bpf(out: &PathBuf) -> Result<(), String> {
    Command::new("clang")
        .arg("--version")
        .output()
        .map_err(|_| "clang not found".to_string())?;

    let arch = target_arch_define().ok_or("unsupported target arch for BPF")?;

    let mut cmd = Command::new("clang");
    cmd.args(["-O2", "-g", "-target", "bpf", "-mcpu=v3", "-Wall", "-Wno-unused-function"])
        .arg(arch)
        .arg("-Isrc/bpf");
    if let Ok(inc) = env::var("DEP_BPF_INCLUDE") {
        cmd.arg(format!("-I{}", inc));
    }
    if let Some(inc) = multiarch_include() {
        cmd.arg(format!("-I{}", inc.display()));
    }
    cmd.arg("-c").arg(BPF_SRC).arg("-o").arg(out);

    let status = cmd
        .status()
        .map_err(|e| format!("failed to execute clang: {}", e))?;
    if !status.success() {
        return Err(format!("clang exited with {}", status));
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", BPF_SRC);
    println!("cargo:rerun-if-changed={}", BPF_INTF);
    println!("cargo:rerun-if-env-changed=RLB_SKIP_BPF");
    println!("cargo:rustc-check-cfg=cfg(has_bpf_object)");

    if env::var_os("RLB_SKIP_BPF").is_some() {
        println!("cargo:warning=RLB_SKIP_BPF set, building without the steering object");
        return;
    }

    let out_dir = match env::var("OUT_DIR") {
        Ok(v) => PathBuf::from(v),
        Err(_) => {
            println!("cargo:warning=OUT_DIR not set, building without the steering object");
            return;
        }
    };
    let obj = out_dir.join("rlb_steer.bpf.o");

    match compile_bpf(&obj) {
        Ok(()) => {
            println!("cargo:rustc-cfg=has_bpf_object");
            println!("cargo:rustc-env=RLB_BPF_OBJECT={}", obj.display());
        }
        Err(e) => {
            println!(
                "cargo:warning={}; kernel steering disabled, userspace dispatcher only",
                e
            );
        }
    }
}
