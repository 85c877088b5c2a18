// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Run traffic over a simulated fabric of EDM routers.
//!
//! The `edm-sim` binary builds a line or a mesh of chips, runs a router on
//! a thread for every link end, injects a traffic pattern and reports what
//! each router did. Everything it does is configured by a [`SimConfig`].
//!
//! ```text
//! edm-sim --topology mesh --rows 3 --cols 3 --pattern broadcast --progress
//! ```

pub mod config;

use std::sync::Arc;

use edm_fabric::types::FabricResult;
use edm_models::run::FabricReport;
use edm_track::entity::Entity;
use edm_track::tracker::log_bridge::init_term_logger;
use edm_track::tracker::{EntityManager, LogTracker};
use edm_track::{Tracker, info, value};

pub use crate::config::{Cli, SimConfig};

/// A tracker forwarding to a terminal logger.
///
/// When a filter is given only the entities it matches log at `level`, the
/// others report errors alone.
pub fn term_tracker(level: log::Level, filter_regex: &str) -> FabricResult<Tracker> {
    let manager = if filter_regex.is_empty() {
        EntityManager::new(level)
    } else {
        let mut manager = EntityManager::new(log::Level::Error);
        manager.add_entity_level_filter(filter_regex, level)?;
        manager
    };
    init_term_logger(level)?;
    let tracker: Tracker = Arc::new(LogTracker::new(manager));
    Ok(tracker)
}

/// Log the outcome of a run.
pub fn report(top: &Arc<Entity>, report: &FabricReport) {
    let seconds = report.elapsed.as_secs_f64().max(f64::EPSILON);
    info!(top ; "Pass: {} flows delivered {} packets ({} bytes) in {:.3}s",
        report.flows, report.packets_delivered, report.bytes_delivered, seconds);
    let mib_per_second = report.bytes_delivered as f64 / seconds / (1024.0 * 1024.0);
    info!(top ; "Payload rate {mib_per_second:.2} MiB/s");
    value!(top ; "bytes_delivered", report.bytes_delivered);

    for (name, telemetry) in &report.routers {
        info!(top ; "{name}: sent {} packets ({} bytes), received {} packets, {} of {} batches \
            active",
            telemetry.sent.packets,
            telemetry.sent.bytes,
            telemetry.received.packets,
            telemetry.active_tx_batches.max(telemetry.active_rx_batches),
            telemetry.batches);
    }
}
