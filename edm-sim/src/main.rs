// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Simulate a fabric of chips joined by EDM routers.
//!
//! See `lib.rs` for details.

use clap::Parser;
use edm_fabric::types::FabricError;
use edm_models::run::FabricRun;
use edm_sim::{Cli, SimConfig, report, term_tracker};
use edm_track::entity::toplevel;
use edm_track::{error, info};
use indicatif::ProgressBar;

fn main() -> Result<(), FabricError> {
    let cli = Cli::parse();
    let config = SimConfig::load(&cli)?;
    let tracker = term_tracker(config.log_level, &config.log_filter_regex)?;
    let top = toplevel(&tracker, "top");

    let topology = config.topology()?;
    let settings = config.run_settings();
    info!(top ; "{} routed with {:?}, {} packets of {} bytes per flow",
        topology, config.routing_mode(), settings.num_packets, settings.payload_bytes);

    let run = FabricRun::new(
        &top,
        topology,
        config.router_config()?,
        config.fabric_options(),
        &settings,
    )?;

    let progress_bar = if config.progress {
        ProgressBar::new(run.expected_arrivals() as u64)
    } else {
        ProgressBar::hidden()
    };
    let result = run.run(|delivered, _| progress_bar.set_position(delivered as u64));
    progress_bar.finish();

    match result {
        Ok(fabric_report) => {
            report(&top, &fabric_report);
            tracker.shutdown();
            Ok(())
        }
        Err(e) => {
            error!(top ; "{e}");
            tracker.shutdown();
            Err(e)
        }
    }
}
