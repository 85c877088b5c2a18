// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A fabric entity.
//!
//! Every router, channel and worker contains an entity in order to maintain a
//! hierarchy of names (`top::chip1::edm_west::rx0`). Each entity has a unique
//! id used to decide which of its messages are emitted.

use std::fmt;
use std::sync::Arc;

use crate::{Id, Tracker};

/// A fabric entity
///
/// An entity is a part of a hierarchy in which it must have a parent. The
/// top-level should be created using [`toplevel`].
pub struct Entity {
    /// Name of this entity.
    pub name: String,

    /// Optional parent entity (only the top-level should be None).
    pub parent: Option<Arc<Entity>>,

    /// Unique identifier used for log messages.
    pub id: Id,

    /// [`Tracker`] used to handle log/value events.
    pub tracker: Tracker,
}

static JOIN: &str = "::";

impl Entity {
    /// Create a new entity.
    #[must_use]
    pub fn new(parent: &Arc<Entity>, name: &str) -> Self {
        let mut full_name = parent.full_name();
        full_name.push_str(JOIN);
        full_name.push_str(name);

        let tracker = parent.tracker.clone();
        let id = tracker.unique_id();
        tracker.add_entity(id, &full_name);

        Self {
            name: String::from(name),
            parent: Some(parent.clone()),
            id,
            tracker,
        }
    }

    /// Returns the full hierarchical name of this entity
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.parent {
            Some(parent) => {
                let mut name = parent.full_name();
                name.push_str(JOIN);
                name.push_str(self.name.as_str());
                name
            }
            None => self.name.clone(),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("id", &self.id)
            .finish()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            parent.fmt(f)?;
            write!(f, "{}{}", JOIN, self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Create the top-level entity. This should be the only entity without a
/// parent.
pub fn toplevel(tracker: &Tracker, name: &str) -> Arc<Entity> {
    let id = tracker.unique_id();
    tracker.add_entity(id, name);
    Arc::new(Entity {
        parent: None,
        name: String::from(name),
        id,
        tracker: tracker.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::dev_null_tracker;

    #[test]
    fn hierarchical_names() {
        let tracker = dev_null_tracker();
        let top = toplevel(&tracker, "top");
        let chip = Arc::new(Entity::new(&top, "chip0"));
        let edm = Entity::new(&chip, "edm_east");
        assert_eq!(edm.full_name(), "top::chip0::edm_east");
        assert_eq!(format!("{edm}"), "top::chip0::edm_east");
    }
}
