// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use clap::Parser;
use edm_fabric::test_helpers::start_test;
use edm_models::run::FabricRun;
use edm_sim::{Cli, SimConfig, report};
use serial_test::serial;

fn run_cli(args: &[&str]) -> usize {
    let top = start_test(file!());
    let cli = Cli::parse_from(std::iter::once("edm-sim").chain(args.iter().copied()));
    let config = SimConfig::load(&cli).unwrap();
    let run = FabricRun::new(
        &top,
        config.topology().unwrap(),
        config.router_config().unwrap(),
        config.fabric_options(),
        &config.run_settings(),
    )
    .unwrap();
    let fabric_report = run.run(|_, _| {}).unwrap();
    report(&top, &fabric_report);
    fabric_report.packets_delivered
}

#[test]
#[serial]
fn line_from_the_command_line() {
    let delivered = run_cli(&[
        "--chips",
        "3",
        "--pattern",
        "all-to-all",
        "--num-packets",
        "4",
        "--payload-bytes",
        "64",
    ]);
    assert_eq!(delivered, 6 * 4);
}

#[test]
#[serial]
fn mesh_broadcast_from_the_command_line() {
    let delivered = run_cli(&[
        "--topology",
        "mesh",
        "--rows",
        "2",
        "--cols",
        "3",
        "--pattern",
        "broadcast",
        "--num-packets",
        "2",
        "--payload-bytes",
        "128",
        "--num-riscs",
        "2",
    ]);
    assert_eq!(delivered, 6 * 5 * 2);
}
