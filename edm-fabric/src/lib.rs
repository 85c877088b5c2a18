// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

#![doc(test(attr(warn(unused))))]

//! `EDM` - The Ethernet Data Mover fabric router
//!
//! This library provides the [router](crate::router::Router) that runs at
//! each end of an Ethernet link between two chips and moves packets across
//! it. A router services:
//!  - **sender channels** fed by workers (channel 0) or by the routers of the
//!    same chip, which send packets over the link under credit flow control.
//!  - **receiver channels**, one per virtual channel, which deliver packets
//!    that arrive from the link to workers on the chip and forward them to the
//!    next router along their route.
//!
//! Routers never touch hardware directly: everything goes through the
//! [`Hal`](crate::hal::Hal) traits so the same router runs on a simulated
//! substrate (see the `edm-models` crate) or against the
//! [`MockHal`](crate::test_helpers::MockHal) in tests.
//!
//! # Simple Application
//!
//! A router whose link loops back to itself delivers a worker's packet to
//! its own L1:
//!
//! ```rust
//! use edm_fabric::adapter::{FabricSender, WorkerConnectionAddrs};
//! use edm_fabric::config::{RouterConfig, RouterWiring};
//! use edm_fabric::hal::{LocalMemory, NocInterface};
//! use edm_fabric::header::{NocCommand, PacketHeader};
//! use edm_fabric::layout::TERMINATION_SIGNAL_ADDR;
//! use edm_fabric::router::Router;
//! use edm_fabric::routing::{LineRouting, RoutingFields};
//! use edm_fabric::test_helpers::{MockHal, test_entity};
//! use edm_fabric::types::{NocAddr, TerminationSignal};
//! use edm_fabric::view::TypedView;
//!
//! let config = RouterConfig {
//!     slot_size_bytes: 256,
//!     enable_ethernet_handshake: false,
//!     ..RouterConfig::default()
//! };
//! let map = config.memory_map();
//! let mut router: Router<MockHal> =
//!     Router::new(&test_entity(), "edm", MockHal::loopback(), config, RouterWiring::default())
//!         .expect("should be able to build a `Router`");
//! router.initialize();
//!
//! let hal = router.hal();
//! let mut worker = FabricSender::transient(
//!     map.endpoint(hal.my_core(), 0),
//!     WorkerConnectionAddrs::packed(0x30000),
//! );
//! worker.open(hal);
//! hal.write_l1(0x31000, &[0xab; 16]);
//! let header = PacketHeader::new(
//!     NocCommand::UnicastWrite { dest: NocAddr::new(hal.my_core(), 0x38000) },
//!     16,
//!     RoutingFields::Line(LineRouting::unicast(1).expect("valid distance")),
//! );
//! worker.send_packet(hal, &header, 0x31000).expect("packet fits a slot");
//!
//! TypedView::at(TERMINATION_SIGNAL_ADDR).write(hal, &TerminationSignal::GracefullyTerminate);
//! let telemetry = router.run().expect("router should run to completion");
//! assert_eq!(telemetry.received.packets, 1);
//!
//! let mut delivered = [0; 16];
//! router.hal().read_l1(0x38000, &mut delivered);
//! assert_eq!(delivered, [0xab; 16]);
//! ```

pub mod adapter;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod counters;
pub mod direction;
pub mod hal;
pub mod handshake;
pub mod header;
pub mod layout;
pub mod receiver;
pub mod router;
pub mod routing;
pub mod sender;
pub mod telemetry;
pub mod test_helpers;
pub mod trid;
pub mod types;
pub mod view;

pub use router::Router;
pub use types::{FabricError, FabricResult};
