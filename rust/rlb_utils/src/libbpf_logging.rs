// SPDX-License-Identifier: GPL-2.0
use libbpf_rs::PrintLevel;
use log::{debug, info, warn};

fn print_to_log(level: PrintLevel, msg: String) {
    let msg = msg.trim_end();
    match level {
        PrintLevel::Debug => debug!("libbpf: {}", msg),
        PrintLevel::Info => info!("libbpf: {}", msg),
        PrintLevel::Warn => warn!("libbpf: {}", msg),
    }
}

/// Route libbpf's diagnostics through `log`. `level` caps what libbpf emits;
/// `None` keeps libbpf's default of Info.
pub fn init_libbpf_logging(level: Option<PrintLevel>) {
    libbpf_rs::set_print(Some((level.unwrap_or(PrintLevel::Info), print_to_log)));
}
