// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Define the [`Track`] trait and a number of [`Tracker`]s.

/// Include the /dev/null tracker.
pub mod dev_null;
/// Include the tracker that forwards to the `log` crate.
pub mod log_bridge;
/// Include the text-based tracker.
pub mod text;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub use dev_null::DevNullTracker;
pub use log_bridge::LogTracker;
use regex::Regex;
pub use text::TextTracker;

use crate::{Id, ROOT, TrackConfigError};

/// This is the interface that is supported by all [`Tracker`]s.
pub trait Track {
    /// Allocate a new global id
    fn unique_id(&self) -> Id;

    /// Determine whether events at `level` are enabled for an entity.
    fn is_entity_enabled(&self, id: Id, level: log::Level) -> bool;

    /// Register a new entity with its full hierarchical name.
    fn add_entity(&self, id: Id, entity_name: &str);

    /// Track a named value.
    fn value(&self, id: Id, name: &str, value: f64);

    /// Track a log message of the given level.
    fn log(&self, msg_by: Id, level: log::Level, msg: std::fmt::Arguments);

    /// Perform any pre-exit shutdown/cleanup
    fn shutdown(&self);
}

/// The type of a [`Tracker`] that is shared across entities and threads.
pub type Tracker = Arc<dyn Track + Send + Sync>;

/// Create a [`Tracker`] that prints all track events to `stdout`.
#[must_use]
pub fn stdout_tracker(level: log::Level) -> Tracker {
    let entity_manager = EntityManager::new(level);
    let stdout_writer = Box::new(std::io::BufWriter::new(io::stdout()));
    let tracker: Tracker = Arc::new(TextTracker::new(entity_manager, stdout_writer));
    tracker
}

/// Create a [`Tracker`] that suppresses all track events.
#[must_use]
pub fn dev_null_tracker() -> Tracker {
    let tracker: Tracker = Arc::new(DevNullTracker {});
    tracker
}

/// The [`EntityManager`] is responsible for determining entity log levels.
///
/// This is shared by the [`Text`](crate::tracker::text) and
/// [`Log`](crate::tracker::log_bridge) trackers.
///
/// This manager is also used to allocate unique [`Id`] values.
pub struct EntityManager {
    /// Level of events to output when no filter matches.
    default_entity_level: log::Level,

    /// List of regular expressions mapping entity names to log levels.
    regex_to_entity_level: Vec<(Regex, log::Level)>,

    /// Used to assign unique IDs.
    unique_id: AtomicU64,

    /// Keep track of entities that have a level different to the default.
    log_entity_lookup: Mutex<HashMap<Id, log::Level>>,

    /// Keep the names of entities for trackers that print them.
    names: Mutex<HashMap<Id, String>>,
}

impl EntityManager {
    /// Constructor with default [`log::Level`]
    #[must_use]
    pub fn new(default_entity_level: log::Level) -> Self {
        Self {
            default_entity_level,
            regex_to_entity_level: Vec::new(),
            unique_id: AtomicU64::new(ROOT.0 + 1),
            log_entity_lookup: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
        }
    }

    fn unique_id(&self) -> Id {
        Id(self.unique_id.fetch_add(1, Ordering::SeqCst))
    }

    fn is_log_enabled_at_level(&self, id: Id, level: log::Level) -> bool {
        let lookup = self
            .log_entity_lookup
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match lookup.get(&id) {
            None => level <= self.default_entity_level,
            Some(entity_level) => level <= *entity_level,
        }
    }

    fn add_entity(&self, id: Id, entity_name: &str) {
        let entity_level = self.log_level_for(entity_name);
        if entity_level != self.default_entity_level {
            self.log_entity_lookup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, entity_level);
        }
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entity_name.to_string());
    }

    fn name_of(&self, id: Id) -> Option<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn log_level_for(&self, entity_name: &str) -> log::Level {
        for (regex, level) in &self.regex_to_entity_level {
            if regex.is_match(entity_name) {
                return *level;
            }
        }
        self.default_entity_level
    }

    /// Add a filter regular expression to set matching entities to a given
    /// level.
    ///
    /// The first filter added that matches an entity takes priority.
    ///
    /// # Example
    ///
    /// ```rust
    /// use edm_track::tracker::EntityManager;
    /// let mut manager = EntityManager::new(log::Level::Warn);
    /// manager
    ///     .add_entity_level_filter(".*edm_east.*", log::Level::Trace)
    ///     .unwrap();
    /// ```
    pub fn add_entity_level_filter(
        &mut self,
        regex_str: &str,
        level: log::Level,
    ) -> Result<(), TrackConfigError> {
        match Regex::new(regex_str) {
            Ok(regex) => self.regex_to_entity_level.push((regex, level)),
            Err(e) => {
                return Err(TrackConfigError(format!(
                    "Failed to parse regex {regex_str}:\n{e}\n"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;

    fn entity_paths() -> Vec<&'static str> {
        vec![
            "top",
            "top::chip0",
            "top::chip0::edm_east",
            "top::chip0::edm_west",
        ]
    }

    #[test]
    fn no_filters() {
        let manager = EntityManager::new(Level::Error);
        for p in entity_paths() {
            assert_eq!(manager.log_level_for(p), Level::Error);
        }
    }

    #[test]
    fn filter_chip_trace() {
        let mut manager = EntityManager::new(Level::Error);
        manager
            .add_entity_level_filter(r".*chip0.*", Level::Trace)
            .unwrap();

        let expected_levels = [Level::Error, Level::Trace, Level::Trace, Level::Trace];
        for (i, p) in entity_paths().iter().enumerate() {
            assert_eq!(manager.log_level_for(p), expected_levels[i]);
        }
    }

    #[test]
    fn first_filter_wins() {
        let mut manager = EntityManager::new(Level::Error);
        manager
            .add_entity_level_filter(r".*east", Level::Info)
            .unwrap();
        manager
            .add_entity_level_filter(r".*chip0.*", Level::Trace)
            .unwrap();
        manager
            .add_entity_level_filter(r"top.*", Level::Warn)
            .unwrap();

        let expected_levels = [Level::Warn, Level::Trace, Level::Info, Level::Trace];
        for (i, p) in entity_paths().iter().enumerate() {
            assert_eq!(manager.log_level_for(p), expected_levels[i]);
        }
    }

    #[test]
    fn bad_regex_is_reported() {
        let mut manager = EntityManager::new(Level::Error);
        assert!(manager.add_entity_level_filter(r"(", Level::Info).is_err());
    }

    #[test]
    fn enabled_by_registered_level() {
        let mut manager = EntityManager::new(Level::Warn);
        manager
            .add_entity_level_filter(r".*west", Level::Debug)
            .unwrap();
        let east = manager.unique_id();
        let west = manager.unique_id();
        manager.add_entity(east, "top::chip0::edm_east");
        manager.add_entity(west, "top::chip0::edm_west");

        assert!(!manager.is_log_enabled_at_level(east, Level::Debug));
        assert!(manager.is_log_enabled_at_level(east, Level::Warn));
        assert!(manager.is_log_enabled_at_level(west, Level::Debug));
        assert!(!manager.is_log_enabled_at_level(west, Level::Trace));
    }

    #[test]
    fn ids() {
        let manager = EntityManager::new(Level::Error);
        for i in 0..10 {
            assert_eq!(manager.unique_id(), Id(i + ROOT.0 + 1));
        }
    }
}
