// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! This module provides helper functions for testing logging output
//!
//! The aim of this module is to provide commonly-used functions that enable the
//! testing of the output that should appear from logging macros.
//!
//! *Note:* tests sharing a [`TestTracker`] across threads should be run in a
//! [serial](https://docs.rs/serial_test) manner to give predictable results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use regex::Regex;

use crate::{Id, Track};

/// A tracker that keeps track events.
pub struct TestTracker {
    events: Mutex<Vec<String>>,

    unique_id: AtomicU64,
}

impl TestTracker {
    /// Create a new [`Tracker`](crate::Tracker) for the tests.
    ///
    /// This keeps the track events in memory for checking later.
    #[must_use]
    pub fn new(initial_id: u64) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            unique_id: AtomicU64::new(initial_id),
        }
    }

    fn add_event(&self, event: String) {
        println!("{event}");
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.push(event);
    }

    /// Return a copy of the events seen so far.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Track for TestTracker {
    fn unique_id(&self) -> Id {
        Id(self.unique_id.fetch_add(1, Ordering::SeqCst))
    }

    fn is_entity_enabled(&self, _id: Id, _level: log::Level) -> bool {
        true
    }

    fn add_entity(&self, _id: Id, _entity_name: &str) {
        // Do nothing
    }

    fn value(&self, id: Id, name: &str, value: f64) {
        self.add_event(format!("{id}: {name} = {value}"));
    }

    fn log(&self, id: Id, level: log::Level, msg: std::fmt::Arguments) {
        self.add_event(format!("{id}:{level}: {msg}"));
    }

    fn shutdown(&self) {
        // Do nothing
    }
}

/// Initialise a [`TestTracker`] for tests
///
/// Returns both the concrete [`TestTracker`] (for checking) and the same
/// object as a [`Tracker`](crate::Tracker) (for building entities).
///
/// *Note*: this is called `test_init` because macros are exported at the root
/// of the crate.
///
/// # Examples
///
/// ```
/// use edm_track::test_helpers;
///
/// let (test_tracker, tracker) = edm_track::test_init!(10);
/// let top = edm_track::entity::toplevel(&tracker, "top");
/// edm_track::info!(top ; "hello");
/// test_helpers::check_and_clear(&test_tracker, &["10:INFO: hello"]);
/// ```
#[macro_export]
macro_rules! test_init {
    ($start_id:expr) => {{
        let test_tracker = std::sync::Arc::new($crate::test_helpers::TestTracker::new($start_id));
        let tracker: $crate::Tracker = test_tracker.clone();
        (test_tracker, tracker)
    }};
}

/// Check and clear the recorded output
///
/// This function asserts that the output lines seen since the start or the
/// last time this function was called match the expected regular
/// expressions, then clears the recorded output.
///
/// # Panics
///
/// Panics if the number of lines or any line does not match. This is only
/// intended for use in tests.
pub fn check_and_clear(tracker: &TestTracker, expected: &[&str]) {
    let mut log_contents = tracker
        .events
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    println!("Checking {:?} matches {:?}", expected, *log_contents);

    assert_eq!(expected.len(), log_contents.len());
    for (log_expect, actual) in expected.iter().zip(log_contents.iter()) {
        let re = Regex::new(log_expect).unwrap_or_else(|e| panic!("Bad regex {log_expect}: {e}"));
        println!("Checking {log_expect:?} matches {actual:?}");
        assert!(re.is_match(actual));
    }

    log_contents.clear();
}

/// Check that some recorded line matches a regular expression.
///
/// # Panics
///
/// Panics if no line matches. This is only intended for use in tests.
pub fn assert_seen(tracker: &TestTracker, expected: &str) {
    let re = Regex::new(expected).unwrap_or_else(|e| panic!("Bad regex {expected}: {e}"));
    let events = tracker.events();
    assert!(
        events.iter().any(|event| re.is_match(event)),
        "{expected:?} not found in {events:?}"
    );
}
