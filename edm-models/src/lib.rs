// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A simulated substrate for running EDM routers.
//!
//! Chips are a set of [cores](crate::chip::SimCore), each with an L1 and a
//! file of stream registers, and the Ethernet links between chips are pairs
//! of [`SimHal`](crate::hal::SimHal)s that copy bytes straight into the far
//! router's L1. Every router runs on its own thread, as it would on its own
//! Ethernet core, so everything shared is atomic or behind a lock.
//!
//! A [`Topology`](crate::topology::Topology) (a line or a 2D mesh) decides
//! which chips are linked and how packets are routed between them. A
//! [`FabricRun`](crate::run::FabricRun) builds the routers of a topology,
//! brings them up, drives a [`TrafficPattern`](crate::traffic::TrafficPattern)
//! through them with [workers](crate::worker::Worker) and checks that every
//! byte arrived.

pub mod chip;
pub mod fabric;
pub mod hal;
pub mod memory;
pub mod run;
pub mod topology;
pub mod traffic;
pub mod worker;
