// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::fs;

use edm_fabric::config::RouterConfig;
use edm_fabric::routing::RoutingMode;
use serial_test::serial;

#[test]
#[serial]
fn toml_file_then_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("router.toml");
    fs::write(
        &path,
        r#"
routing_mode = "low_latency_line"
slot_size_bytes = 1088
receiver_num_buffers = [8, 8]

[[sender_channels]]
num_buffers = 4
vc = 0

[[sender_channels]]
num_buffers = 4
vc = 1
"#,
    )
    .unwrap();

    // SAFETY: tests touching the environment run serially.
    unsafe { std::env::set_var("EDM_NUM_TRANSACTION_IDS", "8") };
    let config = RouterConfig::load(Some(path.as_path()));
    unsafe { std::env::remove_var("EDM_NUM_TRANSACTION_IDS") };

    let config = config.unwrap();
    assert_eq!(config.routing_mode, RoutingMode::LowLatencyLine);
    assert_eq!(config.slot_size_bytes, 1088);
    assert_eq!(config.num_receiver_channels(), 2);
    assert_eq!(config.sender_channels[1].vc, 1);
    assert_eq!(config.num_transaction_ids, 8);
    assert_eq!(config.iterations_between_ctx_switch, 32);
}

#[test]
#[serial]
fn invalid_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("router.toml");
    fs::write(&path, "slot_size_bytes = 100\n").unwrap();
    assert!(RouterConfig::load(Some(path.as_path())).is_err());

    fs::write(&path, "slot_size_bytes = \"big\"\n").unwrap();
    assert!(RouterConfig::load(Some(path.as_path())).is_err());
}

#[test]
#[serial]
fn defaults_without_a_file() {
    let config = RouterConfig::load(None).unwrap();
    assert_eq!(config, RouterConfig::default());
}
