// SPDX-License-Identifier: GPL-2.0
//
// Copyright (c) 2025 rlb authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::io::Write;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::ArgAction;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use log::info;
use log::warn;
use serde::Serialize;

use rlb_steer::bpf_intf::steer_config;
use rlb_steer::engine::build_policy;
use rlb_steer::engine::Decision;
use rlb_steer::engine::Engine;
use rlb_steer::engine::EngineConfig;
use rlb_steer::engine::PolicyKind;
use rlb_steer::engine::TelemetrySource;
use rlb_steer::hook::read_kernel_stats;
use rlb_steer::hook::Dispatcher;
use rlb_steer::hook::ReuseportProgram;
use rlb_steer::hook::SteeringHook;
use rlb_steer::listener::bind_shared;
use rlb_steer::listener::AcceptqSource;
use rlb_steer::listener::Backend;
use rlb_steer::listener::StartOpts;
use rlb_steer::listener::DEFAULT_BACKLOG;
use rlb_steer::registry::BackendRegistry;
use rlb_steer::registry::SlotHandle;
use rlb_steer::stats::Metrics;
use rlb_steer::store::lookup_pod;
use rlb_steer::store::MemNamespace;
use rlb_steer::store::Namespace;
use rlb_steer::store::PinnedNamespace;
use rlb_steer::store::ALL_TABLES;
use rlb_steer::store::CPU_UTIL;
use rlb_steer::store::DEFAULT_PIN_DIR;
use rlb_steer::store::STEER_CONFIG;
use rlb_steer::telemetry::acceptq::AcceptQueueProbe;
use rlb_steer::telemetry::cpu::CpuCollector;
use rlb_steer::telemetry::cpu::CpuCollectorConfig;
use rlb_steer::telemetry::cpu::DEFAULT_ALPHA;
use rlb_steer::telemetry::TableTelemetry;

/// rlb_steer: steer connections across an SO_REUSEPORT group using CPU and
/// accept-queue telemetry.
///
/// Every backend runs `serve` with its own ordinal on the same address. The
/// designated backend (ordinal 0 unless told otherwise) creates the shared
/// tables and attaches the selector. Telemetry comes from `cpu-collector`
/// and `acceptq-probe`, which run independently of the backends.
#[derive(Debug, Parser)]
#[command(name = "rlb_steer", version)]
struct Opts {
    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct PinArgs {
    /// bpffs directory holding the shared tables and pins.
    #[clap(long, default_value = DEFAULT_PIN_DIR, env = "RLB_PIN_DIR")]
    pin_dir: PathBuf,
}

#[derive(Debug, Args)]
struct SlotArgs {
    /// Number of backend slots.
    #[clap(long, default_value = "4")]
    slots: u32,

    /// Core of each slot, e.g. "0,2,4,6". Defaults to every other core.
    #[clap(long)]
    slot_cores: Option<String>,

    /// Ordinal the pick-first policy sends everything to.
    #[clap(long, default_value = "0")]
    first_ordinal: u32,
}

impl SlotArgs {
    fn engine_config(&self) -> Result<EngineConfig> {
        let cores: Vec<u32> = match &self.slot_cores {
            Some(list) => rlb_utils::parse_cpu_list(list)
                .map_err(|e| anyhow!("--slot-cores: {}", e))?
                .into_iter()
                .map(|c| c as u32)
                .collect(),
            None => (0..self.slots).map(|i| i * 2).collect(),
        };
        EngineConfig::new(self.slots, &cores, self.first_ordinal)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one backend of the group.
    Serve {
        /// Slot this backend serves.
        #[clap(short, long)]
        ordinal: u32,

        #[clap(short, long, value_enum, default_value = "default")]
        policy: PolicyKind,

        #[clap(short, long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,

        #[clap(flatten)]
        slots: SlotArgs,

        /// Create the tables and attach the selector even if not ordinal 0.
        #[clap(long, conflicts_with = "no_attach")]
        designated: bool,

        /// Never attach; only register.
        #[clap(long)]
        no_attach: bool,

        #[clap(long, default_value_t = DEFAULT_BACKLOG)]
        backlog: usize,

        /// Sleep this long before handling each connection.
        #[clap(long, default_value = "0")]
        accept_delay_ms: u64,

        #[clap(long, value_enum, default_value = "off")]
        acceptq_source: AcceptqSource,

        #[clap(flatten)]
        pin: PinArgs,
    },

    /// Publish smoothed per-core CPU utilization.
    CpuCollector {
        /// Cores to monitor, e.g. "0-3" or "all".
        #[clap(short, long, default_value = "0-3")]
        cores: String,

        #[clap(short, long, default_value = "2000")]
        interval_ms: u64,

        /// Weight of the newest sample.
        #[clap(long, default_value_t = DEFAULT_ALPHA)]
        alpha: f64,

        #[clap(flatten)]
        pin: PinArgs,
    },

    /// Attach the in-kernel accept-queue sampler.
    AcceptqProbe {
        /// Remove the probe instead.
        #[clap(long)]
        detach: bool,

        #[clap(flatten)]
        pin: PinArgs,
    },

    /// Userspace dispatcher with in-process worker backends.
    Local {
        #[clap(short, long, value_enum, default_value = "round-robin")]
        policy: PolicyKind,

        /// Workers to start; must not exceed --slots.
        #[clap(short, long, default_value = "4")]
        workers: u32,

        #[clap(short, long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,

        #[clap(flatten)]
        slots: SlotArgs,

        /// Sample accept-queue depth after every accept.
        #[clap(long)]
        observe_accepts: bool,

        /// Monitor CPU utilization of the slot cores.
        #[clap(long)]
        cpu_telemetry: bool,

        /// Print stats every this many seconds; 0 disables.
        #[clap(long, default_value = "2")]
        stats_interval: u64,
    },

    /// Evaluate a policy against the live tables and print the result.
    Decide {
        #[clap(short, long, value_enum)]
        policy: PolicyKind,

        #[clap(flatten)]
        pin: PinArgs,
    },

    /// Show registry, telemetry and selector counters.
    Status {
        #[clap(long)]
        json: bool,

        #[clap(flatten)]
        pin: PinArgs,
    },

    /// Detach the selector from a group.
    Teardown {
        #[clap(long)]
        port: u16,

        #[clap(long, default_value = "0.0.0.0")]
        host: IpAddr,

        /// Also remove every shared table and the accept-queue probe.
        #[clap(long)]
        tables: bool,

        #[clap(flatten)]
        pin: PinArgs,
    },
}

fn init_logging(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    let _ = lcfg.set_time_offset_to_local();
    simplelog::TermLogger::init(
        llv,
        lcfg.set_time_level(simplelog::LevelFilter::Error)
            .set_location_level(simplelog::LevelFilter::Off)
            .set_target_level(simplelog::LevelFilter::Off)
            .set_thread_level(simplelog::LevelFilter::Off)
            .build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    rlb_utils::init_libbpf_logging(None);
    Ok(())
}

fn greet(mut stream: TcpStream, who: &str) {
    if let Err(e) = writeln!(stream, "hello from {}", who) {
        warn!("{}: write failed: {}", who, e);
    }
}

fn pinned_namespace(pin: &PinArgs) -> Result<PinnedNamespace> {
    if let Err(e) = rlb_utils::try_set_rlimit_infinity() {
        warn!("Failed to lift RLIMIT_MEMLOCK: {}", e);
    }
    PinnedNamespace::create(&pin.pin_dir)
        .with_context(|| format!("Failed to prepare {}", pin.pin_dir.display()))
}

#[allow(clippy::too_many_arguments)]
fn cmd_serve(
    ordinal: u32,
    policy: PolicyKind,
    addr: SocketAddr,
    slots: &SlotArgs,
    designated: bool,
    no_attach: bool,
    backlog: usize,
    accept_delay_ms: u64,
    acceptq_source: AcceptqSource,
    pin: &PinArgs,
    shutdown: &AtomicBool,
) -> Result<()> {
    let ns = pinned_namespace(pin)?;

    let mut opts = StartOpts::new(addr, ordinal, policy);
    opts.engine = slots.engine_config()?;
    opts.designated = !no_attach && (designated || ordinal == 0);
    opts.backlog = backlog;
    opts.accept_delay = Duration::from_millis(accept_delay_ms);
    opts.acceptq_source = acceptq_source;

    if acceptq_source == AcceptqSource::Kernel && opts.designated {
        match AcceptQueueProbe::new(ns.clone()).attach() {
            Ok(outcome) => info!("Accept-queue probe: {:?}", outcome),
            Err(e) => warn!("Accept-queue probe unavailable: {:#}", anyhow::Error::from(e)),
        }
    }

    let prog = policy.program_name().unwrap_or_default();
    let mut hook = ReuseportProgram::new(ns.clone(), prog, addr.port());
    let backend = Backend::start(opts, &ns, &mut hook)?;

    let who = format!("backend {} (pid {})", ordinal, std::process::id());
    backend.serve(shutdown, |stream| greet(stream, &who))?;
    Ok(())
}

fn cmd_cpu_collector(
    cores: &str,
    interval_ms: u64,
    alpha: f64,
    pin: &PinArgs,
    shutdown: &AtomicBool,
) -> Result<()> {
    let ns = pinned_namespace(pin)?;
    let cfg = CpuCollectorConfig {
        cores: rlb_utils::parse_cpu_list(cores)
            .map_err(|e| anyhow!("--cores: {}", e))?
            .into_iter()
            .map(|c| c as u32)
            .collect(),
        period: Duration::from_millis(interval_ms),
        alpha,
    };
    let table = ns.open_or_create(&CPU_UTIL)?;
    let mut collector = CpuCollector::new(cfg, table)?;
    collector.run(shutdown);
    Ok(())
}

fn cmd_acceptq_probe(detach: bool, pin: &PinArgs) -> Result<()> {
    let ns = pinned_namespace(pin)?;
    let probe = AcceptQueueProbe::new(ns);
    if detach {
        let removed = probe.detach()?;
        info!("Accept-queue probe {}", if removed { "detached" } else { "was not attached" });
        return Ok(());
    }
    let outcome = probe.attach()?;
    info!("Accept-queue probe: {:?}", outcome);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_local(
    policy: PolicyKind,
    workers: u32,
    addr: SocketAddr,
    slots: &SlotArgs,
    observe_accepts: bool,
    cpu_telemetry: bool,
    stats_interval: u64,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let cfg = slots.engine_config()?;
    if workers == 0 || workers > cfg.nr_slots {
        bail!("--workers must be in [1, {}]", cfg.nr_slots);
    }
    let steer = build_policy(policy, &cfg)
        .ok_or_else(|| anyhow!("policy {:?} has nothing to steer in userspace", policy))?;
    let engine = Engine::new(cfg, steer)?;

    let ns = MemNamespace::new();
    let dispatcher = Dispatcher::claim(ns.clone(), addr.port(), engine)?
        .ok_or_else(|| anyhow!("port {} already has a dispatcher", addr.port()))?;
    dispatcher.set_observe_accepts(observe_accepts);
    let dispatcher = Arc::new(dispatcher);

    let listener = bind_shared(addr, DEFAULT_BACKLOG)
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Dispatching {} with policy {:?}", addr, policy);

    let mut threads = Vec::new();
    if cpu_telemetry {
        let ccfg = CpuCollectorConfig {
            cores: cfg.cores().to_vec(),
            ..Default::default()
        };
        let mut collector = CpuCollector::new(ccfg, ns.open_or_create(&CPU_UTIL)?)?;
        let shutdown = shutdown.clone();
        threads.push(std::thread::spawn(move || collector.run(&shutdown)));
    }

    for ordinal in 0..workers {
        let mailbox = dispatcher.join(ordinal)?;
        let core = cfg.slot_cores[ordinal as usize];
        let shutdown = shutdown.clone();
        threads.push(std::thread::spawn(move || {
            if let Err(e) = rlb_utils::pin_current_thread(core as usize) {
                warn!("worker {}: failed to pin to core {}: {}", ordinal, core, e);
            }
            let who = format!("worker {} (core {})", ordinal, core);
            while !shutdown.load(Ordering::Relaxed) {
                if let Ok(stream) = mailbox.recv_timeout(Duration::from_millis(100)) {
                    greet(stream, &who);
                }
            }
        }));
    }

    let runner = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || dispatcher.run(&listener, &shutdown))
    };

    let mut prev = Metrics::default();
    let mut last = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if stats_interval == 0 || last.elapsed() < Duration::from_secs(stats_interval) {
            continue;
        }
        last = Instant::now();
        let cur = dispatcher.metrics();
        cur.delta(&prev).format(&mut std::io::stdout())?;
        prev = cur;
    }

    match runner.join() {
        Ok(res) => res?,
        Err(_) => bail!("dispatcher thread panicked"),
    }
    for t in threads {
        let _ = t.join();
    }
    Ok(())
}

fn load_engine_config(ns: &dyn Namespace) -> Result<EngineConfig> {
    let table = ns
        .open(&STEER_CONFIG)
        .context("No steering group configured")?;
    let sc: steer_config = lookup_pod(table.as_ref(), 0)?
        .ok_or_else(|| anyhow!("steer_config is empty"))?;
    EngineConfig::from_steer_config(&sc)
}

fn cmd_decide(policy: PolicyKind, pin: &PinArgs) -> Result<()> {
    let ns = pinned_namespace(pin)?;
    let cfg = load_engine_config(&ns)?;
    let steer = build_policy(policy, &cfg)
        .ok_or_else(|| anyhow!("policy {:?} makes no decisions", policy))?;
    let engine = Engine::new(cfg, steer)?;
    let registry = BackendRegistry::open(&ns, cfg.nr_slots)?;
    let telemetry = TableTelemetry::open_or_create(&ns)?;

    let set = engine.gather(&registry, &telemetry);
    for c in set.as_slice() {
        println!(
            "slot {:>2} core {:>3}  cpu {:>6.2}%  acceptq {:>6.2}%  {}",
            c.ordinal,
            c.core,
            c.cpu_util as f64 / 100.0,
            c.queue_occupancy as f64 / 100.0,
            match c.handle {
                Some(h) => format!("{:#x}", h.0),
                None => "unregistered".to_string(),
            }
        );
    }
    match engine.select(&set) {
        Decision::Pass { ordinal, handle } => {
            println!("{}: PASS to slot {} ({:#x})", engine.policy_name(), ordinal, handle.0)
        }
        Decision::Drop(reason) => println!("{}: DROP ({:?})", engine.policy_name(), reason),
    }
    Ok(())
}

#[derive(Serialize)]
struct Status {
    slots: Vec<(u32, SlotHandle)>,
    metrics: Metrics,
}

fn cmd_status(json: bool, pin: &PinArgs) -> Result<()> {
    let ns = pinned_namespace(pin)?;
    let cfg = load_engine_config(&ns)?;
    let registry = BackendRegistry::open(&ns, cfg.nr_slots)?;
    let telemetry = TableTelemetry::open_or_create(&ns)?;

    let mut metrics = Metrics::new("kernel", 0);
    for &core in cfg.cores() {
        if let Some(util) = telemetry.cpu_util(core) {
            metrics.cpu_util.insert(core, util);
        }
        if let Some(occ) = telemetry.queue_occupancy(core) {
            metrics.acceptq.insert(core, occ);
        }
    }
    match read_kernel_stats(&ns) {
        Ok([pass, dropped]) => {
            metrics.kernel_pass = pass;
            metrics.kernel_drop = dropped;
        }
        Err(e) => warn!("selector counters: {}", e),
    }

    let status = Status {
        slots: registry.entries()?,
        metrics,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    for ordinal in 0..cfg.nr_slots {
        let handle = status.slots.iter().find(|(o, _)| *o == ordinal);
        match handle {
            Some((_, h)) => println!("slot {:>2}: {:#x}", ordinal, h.0),
            None => println!("slot {:>2}: -", ordinal),
        }
    }
    status.metrics.format(&mut std::io::stdout())?;
    Ok(())
}

fn cmd_teardown(port: u16, host: IpAddr, tables: bool, pin: &PinArgs) -> Result<()> {
    let ns = pinned_namespace(pin)?;
    let listener = bind_shared(SocketAddr::new(host, port), 1)
        .with_context(|| format!("Failed to join the group on port {}", port))?;
    let mut hook = ReuseportProgram::new(ns.clone(), "", port);
    hook.detach(&listener)?;
    info!("Detached selector from port {}", port);

    if tables {
        if let Err(e) = AcceptQueueProbe::new(ns.clone()).detach() {
            warn!("accept-queue probe: {}", e);
        }
        for spec in ALL_TABLES.iter() {
            if ns.remove(spec.name)? {
                info!("Removed {}", spec.name);
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    match &opts.cmd {
        Command::Serve {
            ordinal,
            policy,
            addr,
            slots,
            designated,
            no_attach,
            backlog,
            accept_delay_ms,
            acceptq_source,
            pin,
        } => cmd_serve(
            *ordinal,
            *policy,
            *addr,
            slots,
            *designated,
            *no_attach,
            *backlog,
            *accept_delay_ms,
            *acceptq_source,
            pin,
            &shutdown,
        ),
        Command::CpuCollector {
            cores,
            interval_ms,
            alpha,
            pin,
        } => cmd_cpu_collector(cores, *interval_ms, *alpha, pin, &shutdown),
        Command::AcceptqProbe { detach, pin } => cmd_acceptq_probe(*detach, pin),
        Command::Local {
            policy,
            workers,
            addr,
            slots,
            observe_accepts,
            cpu_telemetry,
            stats_interval,
        } => cmd_local(
            *policy,
            *workers,
            *addr,
            slots,
            *observe_accepts,
            *cpu_telemetry,
            *stats_interval,
            shutdown.clone(),
        ),
        Command::Decide { policy, pin } => cmd_decide(*policy, pin),
        Command::Status { json, pin } => cmd_status(*json, pin),
        Command::Teardown {
            port,
            host,
            tables,
            pin,
        } => cmd_teardown(*port, *host, *tables, pin),
    }
}
