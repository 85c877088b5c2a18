// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use crate::tracker::{EntityManager, Track};
use crate::{Id, TrackConfigError};

/// A tracker that forwards events into the [`log`] facade.
///
/// Each message is logged with the full entity name as its target so that
/// any installed logger can filter on it.
pub struct LogTracker {
    entity_manager: EntityManager,
}

impl LogTracker {
    /// Create a new [`LogTracker`] with an [`EntityManager`].
    #[must_use]
    pub fn new(entity_manager: EntityManager) -> Self {
        Self { entity_manager }
    }

    fn target(&self, id: Id) -> String {
        self.entity_manager
            .name_of(id)
            .unwrap_or_else(|| format!("edm::{id}"))
    }
}

impl Track for LogTracker {
    fn unique_id(&self) -> Id {
        self.entity_manager.unique_id()
    }

    fn is_entity_enabled(&self, id: Id, level: log::Level) -> bool {
        self.entity_manager.is_log_enabled_at_level(id, level)
    }

    fn add_entity(&self, id: Id, entity_name: &str) {
        self.entity_manager.add_entity(id, entity_name);
    }

    fn value(&self, id: Id, name: &str, value: f64) {
        let target = self.target(id);
        log::info!(target: target.as_str(), "{name} = {value}");
    }

    fn log(&self, id: Id, level: log::Level, msg: std::fmt::Arguments) {
        let target = self.target(id);
        log::log!(target: target.as_str(), level, "{msg}");
    }

    fn shutdown(&self) {
        log::logger().flush();
    }
}

/// Install a terminal logger for the [`log`] facade.
///
/// Used by binaries in combination with a [`LogTracker`].
pub fn init_term_logger(level: log::Level) -> Result<(), TrackConfigError> {
    let config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .build();
    TermLogger::init(
        level.to_level_filter(),
        config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .map_err(|e| TrackConfigError(format!("Failed to install logger: {e}")))
}
