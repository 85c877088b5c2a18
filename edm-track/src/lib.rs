// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! This crate provides the _track_ capabilities for the EDM fabric router.
//!
//! _Track_ is the combination of _log_ and _value_ events where:
//!
//!   - _log_ are text-based human-readable messages emitted at various levels
//!     of verbosity (from `Trace` through to `Error`).
//!   - _value_ events report a named quantity (a heartbeat, a packet count)
//!     for an [`Entity`](crate::entity::Entity).
//!
//! Every event is emitted against an [`Entity`](crate::entity::Entity) so
//! that the level can be controlled per router, per channel or per worker
//! using regular expressions over the entity hierarchy.
//!
//! Routers run on their own threads so all [`Tracker`]s are `Send + Sync`.

// Enable warnings for missing documentation
#![warn(missing_docs)]

use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub use log;

pub mod entity;
pub mod id;
pub mod test_helpers;
pub mod tracker;

pub use id::Id;
pub use tracker::{Track, Tracker};

/// A type alias for objects that receive _log_ / _value_ events.
///
/// The writer must implement Send in order to be shared between threads.
pub type Writer = Box<dyn std::io::Write + Send>;
type SharedWriter = Arc<Mutex<Writer>>;

/// Id value which indicates where there is no valid id
pub const NO_ID: Id = Id(0);

/// The root id from which all other ids are derived
pub const ROOT: Id = Id(1);

/// Error returned when a tracker cannot be configured.
#[derive(Debug)]
pub struct TrackConfigError(pub String);

impl std::fmt::Display for TrackConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Track config error: {}", self.0)
    }
}

impl std::error::Error for TrackConfigError {}

/// Take the command-line string and convert it to a Level
pub fn str_to_level(lvl: &str) -> Result<log::Level, TrackConfigError> {
    log::Level::from_str(lvl)
        .map_err(|_| TrackConfigError(format!("Unable to parse level string '{lvl}'")))
}

/// Base macro for log messages of all level.
///
/// The message is only formatted when the entity is enabled at the given
/// level so that disabled messages cost a single lookup.
#[macro_export]
macro_rules! log_base {
    ($entity:expr ; $lvl:expr, $($arg:tt)+) => (
        if $entity.tracker.is_entity_enabled($entity.id, $lvl) {
            $entity.tracker.log($entity.id, $lvl, format_args!($($arg)+));
        }
    );
}

/// The `trace` macro logs at level `log::Level::Trace`
#[macro_export]
macro_rules! trace {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Trace, $($arg)+);
    );
}

/// The `debug` macro logs at level `log::Level::Debug`
#[macro_export]
macro_rules! debug {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Debug, $($arg)+);
    );
}

/// The `info` macro logs at level `log::Level::Info`
#[macro_export]
macro_rules! info {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Info, $($arg)+);
    );
}

/// The `warn` macro logs at level `log::Level::Warn`
#[macro_export]
macro_rules! warn {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Warn, $($arg)+);
    );
}

/// The `error` macro logs at level `log::Level::Error`
#[macro_export]
macro_rules! error {
    ($entity:expr ; $($arg:tt)+) => (
        $crate::log_base!($entity ; $crate::log::Level::Error, $($arg)+);
    );
}

/// Report a named value for an entity.
///
/// Values are emitted at `Info` level.
#[macro_export]
macro_rules! value {
    ($entity:expr ; $name:expr, $value:expr) => {
        if $entity
            .tracker
            .is_entity_enabled($entity.id, $crate::log::Level::Info)
        {
            $entity.tracker.value($entity.id, $name, $value as f64);
        }
    };
}
