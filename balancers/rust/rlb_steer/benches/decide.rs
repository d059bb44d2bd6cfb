// SPDX-License-Identifier: GPL-2.0
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rlb_steer::engine::{build_policy, Candidate, CandidateSet, Engine, EngineConfig, PolicyKind};
use rlb_steer::registry::{BackendRegistry, SlotHandle};
use rlb_steer::store::{update_u32, MemNamespace, Namespace, CPU_UTIL};
use rlb_steer::telemetry::TableTelemetry;

const SLOTS: u32 = 16;

fn engine(kind: PolicyKind) -> Engine {
    let cores: Vec<u32> = (0..SLOTS).collect();
    let cfg = EngineConfig::new(SLOTS, &cores, 0).unwrap();
    Engine::new(cfg, build_policy(kind, &cfg).unwrap()).unwrap()
}

fn bench_decide(c: &mut Criterion) {
    let ns = MemNamespace::new();
    let registry = BackendRegistry::create(&ns, SLOTS).unwrap();
    let telemetry = TableTelemetry::open_or_create(&ns).unwrap();
    let cpu = ns.open(&CPU_UTIL).unwrap();
    for ordinal in 0..SLOTS {
        registry.register(ordinal, SlotHandle(100 + ordinal as u64)).unwrap();
        update_u32(cpu.as_ref(), ordinal, (ordinal * 613) % 10000).unwrap();
    }

    let cands: Vec<Candidate> = (0..SLOTS)
        .map(|ordinal| Candidate {
            ordinal,
            core: ordinal,
            cpu_util: (ordinal * 613) % 10000,
            queue_occupancy: (ordinal * 211) % 10000,
            handle: Some(SlotHandle(100 + ordinal as u64)),
        })
        .collect();
    let set = CandidateSet::from_candidates(&cands);

    let mut group = c.benchmark_group("Engine");
    for kind in [PolicyKind::RoundRobin, PolicyKind::Cpuutil, PolicyKind::Agent] {
        let e = engine(kind);
        group.bench_function(format!("select/{:?}", kind), |b| {
            b.iter(|| black_box(e.select(black_box(&set))));
        });
        group.bench_function(format!("decide/{:?}", kind), |b| {
            b.iter(|| black_box(e.decide(&registry, &telemetry)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decide);
criterion_main!(benches);
