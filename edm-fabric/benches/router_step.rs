// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

/// Benchmark the router main loop over a loopback link.
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use edm_fabric::adapter::{FabricSender, WorkerConnectionAddrs};
use edm_fabric::config::{RouterConfig, RouterWiring};
use edm_fabric::hal::NocInterface;
use edm_fabric::header::{NocCommand, PacketHeader};
use edm_fabric::layout::TERMINATION_SIGNAL_ADDR;
use edm_fabric::router::Router;
use edm_fabric::routing::{LineRouting, RoutingFields};
use edm_fabric::test_helpers::{MockHal, test_entity};
use edm_fabric::types::{NocAddr, TerminationSignal};
use edm_fabric::view::TypedView;

const NUM_PACKETS: usize = 200;

fn create_router(first_level_ack: bool) -> Router<MockHal> {
    let config = RouterConfig {
        slot_size_bytes: 1024 + 64,
        enable_ethernet_handshake: false,
        first_level_ack,
        ..RouterConfig::default()
    };
    let mut router = Router::new(
        &test_entity(),
        "edm",
        MockHal::loopback(),
        config,
        RouterWiring::default(),
    )
    .unwrap();
    router.initialize();
    router
}

/// Push packets through a worker connection, running the router whenever
/// the channel is full.
fn stream_packets(mut router: Router<MockHal>) {
    let hal_core = router.hal().my_core();
    let endpoint = router.config().memory_map().endpoint(hal_core, 0);
    let mut worker = FabricSender::transient(endpoint, WorkerConnectionAddrs::packed(0x30000));
    worker.open(router.hal());
    let header = PacketHeader::new(
        NocCommand::UnicastWrite {
            dest: NocAddr::new(hal_core, 0x40000),
        },
        1024,
        RoutingFields::Line(LineRouting::unicast(1).unwrap()),
    );
    for _ in 0..NUM_PACKETS {
        while !worker.has_space(router.hal()) {
            router.run_batch();
        }
        worker.send_packet(router.hal(), &header, 0x31000).unwrap();
    }
    TypedView::at(TERMINATION_SIGNAL_ADDR)
        .write(router.hal(), &TerminationSignal::GracefullyTerminate);
    router.run().unwrap();
}

fn bench_router(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");

    group.bench_function("loopback_stream", |b| {
        b.iter_batched(
            || create_router(false),
            stream_packets,
            BatchSize::SmallInput,
        );
    });

    group.bench_function("loopback_stream_first_level_ack", |b| {
        b.iter_batched(
            || create_router(true),
            stream_packets,
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = bench_router
}
criterion_main!(benches);
