// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Simulator configuration.
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//!  1. the defaults of [`SimConfig`]
//!  2. the TOML file given with `--config-file`
//!  3. `EDM_SIM_` prefixed environment variables
//!  4. the command line
//!
//! The routers are configured separately by the `router_config` TOML file
//! and `EDM_` prefixed environment variables, see
//! [`RouterConfig::figment`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use edm_fabric::config::RouterConfig;
use edm_fabric::direction::NUM_DIRECTIONS;
use edm_fabric::fabric_error;
use edm_fabric::routing::RoutingMode;
use edm_fabric::types::FabricResult;
use edm_models::fabric::FabricOptions;
use edm_models::run::RunSettings;
use edm_models::topology::{LineFabric, MeshFabric, Topology};
use edm_models::traffic::TrafficPattern;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    /// Chips joined east to west.
    #[default]
    Line,
    /// Chips on a grid, linked in all four directions.
    Mesh,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[default]
    Neighbour,
    AllToAll,
    Random,
    Broadcast,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub topology: TopologyKind,
    /// Chips of a line.
    pub chips: usize,
    /// Shape of a mesh.
    pub rows: usize,
    pub cols: usize,
    /// Route a line with the per-hop command encoding.
    pub low_latency: bool,

    pub pattern: PatternKind,
    pub random_flows: usize,
    pub seed: u64,
    pub num_packets: usize,
    pub payload_bytes: usize,
    pub timeout_ms: u64,

    pub num_riscs: usize,
    pub flush_delay_polls: usize,
    /// TOML file with the configuration shared by every router.
    pub router_config: Option<PathBuf>,

    pub log_level: log::Level,
    /// Entities matching this are logged at `log_level`, others only report
    /// errors. Empty logs every entity at `log_level`.
    pub log_filter_regex: String,
    pub progress: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        let run = RunSettings::default();
        let options = FabricOptions::default();
        Self {
            topology: TopologyKind::Line,
            chips: 4,
            rows: 2,
            cols: 2,
            low_latency: false,
            pattern: PatternKind::Neighbour,
            random_flows: 16,
            seed: 1,
            num_packets: run.num_packets,
            payload_bytes: run.payload_bytes,
            timeout_ms: run.timeout_ms,
            num_riscs: options.num_riscs,
            flush_delay_polls: options.flush_delay_polls,
            router_config: None,
            log_level: log::Level::Info,
            log_filter_regex: String::new(),
            progress: false,
        }
    }
}

/// Command-line arguments. Anything left unset keeps the value from the
/// configuration file, the environment or the defaults.
#[derive(Debug, Default, Parser, Serialize)]
#[command(about = "Run traffic over a simulated fabric of EDM routers")]
pub struct Cli {
    /// TOML file of simulator settings.
    #[arg(long)]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologyKind>,

    /// Number of chips in a line.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chips: Option<usize>,

    /// Rows of a mesh.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,

    /// Columns of a mesh.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<usize>,

    /// Use low latency routing on a line.
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub low_latency: bool,

    /// Which chips send to which.
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<PatternKind>,

    /// Number of flows of the random pattern.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_flows: Option<usize>,

    /// Seed of the random pattern.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Packets sent by each flow.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_packets: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_bytes: Option<usize>,

    /// Give up on a fabric that has not delivered everything after this long.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Cores per router.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_riscs: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_delay_polls: Option<usize>,

    /// TOML file of router settings.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_config: Option<PathBuf>,

    /// Level of log message to display.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<log::Level>,

    /// Only entities matching this regular expression log below `Error`.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_filter_regex: Option<String>,

    /// Show a progress bar of the packets delivered.
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub progress: bool,
}

impl SimConfig {
    /// The defaults with a configuration file (when given) and the
    /// environment layered over them.
    #[must_use]
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(SimConfig::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("EDM_SIM_"))
    }

    /// Resolve the configuration from every source, `cli` taking priority.
    pub fn load(cli: &Cli) -> FabricResult<Self> {
        if let Some(path) = &cli.config_file {
            if !path.is_file() {
                fabric_error!(format!("config file {} not found", path.display()));
            }
        }
        let config: SimConfig = Self::figment(cli.config_file.as_deref())
            .merge(Serialized::defaults(cli))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FabricResult {
        if self.num_packets == 0 || self.payload_bytes == 0 {
            fabric_error!("flows must send at least one byte");
        }
        if self.low_latency && self.topology == TopologyKind::Mesh {
            fabric_error!("low latency routing only applies to a line");
        }
        Ok(())
    }

    #[must_use]
    pub fn routing_mode(&self) -> RoutingMode {
        match (self.topology, self.low_latency) {
            (TopologyKind::Mesh, _) => RoutingMode::Mesh,
            (TopologyKind::Line, true) => RoutingMode::LowLatencyLine,
            (TopologyKind::Line, false) => RoutingMode::Line,
        }
    }

    pub fn topology(&self) -> FabricResult<Arc<dyn Topology>> {
        Ok(match self.topology {
            TopologyKind::Line => Arc::new(LineFabric::new(self.chips, self.routing_mode())?),
            TopologyKind::Mesh => Arc::new(MeshFabric::new(self.rows, self.cols)?),
        })
    }

    /// The router configuration with its routing matched to the topology.
    ///
    /// A mesh router forwards into a sender channel per other direction, so
    /// missing channels are added with the geometry of the last one.
    pub fn router_config(&self) -> FabricResult<RouterConfig> {
        let mut config: RouterConfig =
            RouterConfig::figment(self.router_config.as_deref()).extract()?;
        config.routing_mode = self.routing_mode();
        if let (RoutingMode::Mesh, Some(last)) =
            (config.routing_mode, config.sender_channels.last().copied())
        {
            let missing = NUM_DIRECTIONS.saturating_sub(config.sender_channels.len());
            config
                .sender_channels
                .extend(std::iter::repeat_n(last, missing));
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn fabric_options(&self) -> FabricOptions {
        FabricOptions {
            num_riscs: self.num_riscs,
            flush_delay_polls: self.flush_delay_polls,
            ..FabricOptions::default()
        }
    }

    #[must_use]
    pub fn run_settings(&self) -> RunSettings {
        let pattern = match self.pattern {
            PatternKind::Neighbour => TrafficPattern::Neighbour,
            PatternKind::AllToAll => TrafficPattern::AllToAll,
            PatternKind::Random => TrafficPattern::Random {
                flows: self.random_flows,
                seed: self.seed,
            },
            PatternKind::Broadcast => TrafficPattern::Broadcast,
        };
        RunSettings {
            pattern,
            num_packets: self.num_packets,
            payload_bytes: self.payload_bytes,
            timeout_ms: self.timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_defaults() {
        let cli = Cli::parse_from([
            "edm-sim",
            "--topology",
            "mesh",
            "--rows",
            "3",
            "--progress",
        ]);
        let config = SimConfig::load(&cli).unwrap();
        assert_eq!(config.topology, TopologyKind::Mesh);
        assert_eq!(config.rows, 3);
        assert_eq!(config.cols, SimConfig::default().cols);
        assert!(config.progress);
        assert_eq!(config.routing_mode(), RoutingMode::Mesh);
    }

    #[test]
    fn mesh_routers_get_a_channel_per_direction() {
        let config = SimConfig {
            topology: TopologyKind::Mesh,
            ..SimConfig::default()
        };
        let router = config.router_config().unwrap();
        assert_eq!(router.routing_mode, RoutingMode::Mesh);
        assert_eq!(router.sender_channels.len(), NUM_DIRECTIONS);
    }

    #[test]
    fn random_pattern_takes_its_seed() {
        let config = SimConfig {
            pattern: PatternKind::Random,
            random_flows: 5,
            seed: 9,
            ..SimConfig::default()
        };
        assert_eq!(
            config.run_settings().pattern,
            TrafficPattern::Random { flows: 5, seed: 9 }
        );
    }

    #[test]
    fn low_latency_mesh_is_rejected() {
        let config = SimConfig {
            topology: TopologyKind::Mesh,
            low_latency: true,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
