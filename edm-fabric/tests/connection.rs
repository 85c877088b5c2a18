// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use edm_fabric::adapter::{FabricSender, WorkerConnectionAddrs};
use edm_fabric::config::{RouterConfig, RouterWiring};
use edm_fabric::connection::semaphore;
use edm_fabric::hal::{LocalMemory, NocInterface};
use edm_fabric::header::{NocCommand, PacketHeader};
use edm_fabric::layout::TERMINATION_SIGNAL_ADDR;
use edm_fabric::router::Router;
use edm_fabric::routing::{LineRouting, RoutingFields};
use edm_fabric::test_helpers::{MockHal, start_test};
use edm_fabric::types::{L1Addr, NocAddr, TerminationSignal};
use edm_fabric::view::TypedView;

const WORKER_A: L1Addr = 0x30000;
const WORKER_B: L1Addr = 0x30400;
const PAYLOAD: L1Addr = 0x31000;
const DEST: L1Addr = 0x38000;
const PACKET_BYTES: usize = 48;

fn router() -> Router<MockHal> {
    let config = RouterConfig {
        slot_size_bytes: 128,
        enable_ethernet_handshake: false,
        ..RouterConfig::default()
    };
    let mut router = Router::new(
        &start_test(file!()),
        "edm",
        MockHal::loopback(),
        config,
        RouterWiring::default(),
    )
    .unwrap();
    router.initialize();
    router
}

fn worker(router: &Router<MockHal>, addrs: L1Addr) -> FabricSender {
    let hal = router.hal();
    let endpoint = router.config().memory_map().endpoint(hal.my_core(), 0);
    FabricSender::transient(endpoint, WorkerConnectionAddrs::packed(addrs))
}

fn send(router: &Router<MockHal>, worker: &mut FabricSender, seq: usize) {
    let hal = router.hal();
    let payload = PAYLOAD + (seq * PACKET_BYTES) as u32;
    hal.write_l1(payload, &[seq as u8 + 1; PACKET_BYTES]);
    let header = PacketHeader::new(
        NocCommand::UnicastWrite {
            dest: NocAddr::new(hal.my_core(), DEST + (seq * PACKET_BYTES) as u32),
        },
        PACKET_BYTES,
        RoutingFields::Line(LineRouting::unicast(1).unwrap()),
    );
    assert!(worker.has_space(hal));
    worker.send_packet(hal, &header, payload).unwrap();
}

fn close(router: &mut Router<MockHal>, worker: &mut FabricSender) {
    worker.start_close(router.hal()).unwrap();
    for _ in 0..100 {
        router.run_batch();
        if worker.poll_closed(router.hal()) {
            return;
        }
    }
    panic!("router never acknowledged the close request");
}

#[test]
fn second_producer_resumes_where_the_first_left_off() {
    let mut router = router();

    let mut a = worker(&router, WORKER_A);
    a.open(router.hal());
    for seq in 0..3 {
        send(&router, &mut a, seq);
    }
    close(&mut router, &mut a);
    assert!(!a.is_connected());

    let mut b = worker(&router, WORKER_B);
    b.open(router.hal());
    assert_eq!(b.write_counter(), 3);
    assert_eq!(b.next_slot(), a.next_slot());
    for seq in 3..12 {
        send(&router, &mut b, seq);
        router.run_batch();
    }
    assert_eq!(b.write_counter(), 12);

    TypedView::at(TERMINATION_SIGNAL_ADDR)
        .write(router.hal(), &TerminationSignal::GracefullyTerminate);
    router.run().unwrap();

    let hal = router.hal();
    for seq in 0..12 {
        let mut delivered = [0; PACKET_BYTES];
        hal.read_l1(DEST + (seq * PACKET_BYTES) as u32, &mut delivered);
        assert_eq!(delivered, [seq as u8 + 1; PACKET_BYTES], "packet {seq}");
    }
    // The last producer got every slot back.
    assert_eq!(b.free_slots(hal), 8);
}

#[test]
fn close_before_the_router_notices_the_open() {
    let mut router = router();
    let mut a = worker(&router, WORKER_A);
    a.open(router.hal());
    a.start_close(router.hal()).unwrap();

    router.run_batch();
    assert!(a.poll_closed(router.hal()));
    let semaphore_addr = router.config().memory_map().connection_semaphore(0);
    assert_eq!(
        TypedView::<u32>::at(semaphore_addr).load(router.hal()),
        semaphore::UNUSED
    );
}

#[test]
fn closing_twice_is_an_error() {
    let mut router = router();
    let mut a = worker(&router, WORKER_A);
    assert!(a.start_close(router.hal()).is_err());
    a.open(router.hal());
    close(&mut router, &mut a);
    assert!(a.start_close(router.hal()).is_err());
}
