//! Decoding of row-change notification payloads.
//!
//! The triggers publish one payload per statement, grouped by virtual
//! storage:
//!
//! ```json
//! [{"virtual_storage": "default", "relative_paths": ["a.git", "b.git"]}]
//! ```
//!
//! Older triggers published the full rows instead, as
//! `{"old": [row, ...], "new": [row, ...]}`. Both forms are accepted and
//! unknown keys are ignored.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

/// Paths touched by one statement, keyed by virtual storage.
pub type ChangedPaths = BTreeMap<String, BTreeSet<String>>;

/// Error raised when a payload matches neither known form.
#[derive(Debug, thiserror::Error)]
#[error("malformed change notification payload: {0}")]
pub struct PayloadError(#[from] serde_json::Error);

#[derive(Debug, Deserialize)]
struct ChangedRepositories {
    virtual_storage: String,
    #[serde(default)]
    relative_paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChangedRow {
    virtual_storage: String,
    relative_path: String,
}

#[derive(Debug, Deserialize)]
struct RowImages {
    #[serde(default)]
    old: Option<Vec<ChangedRow>>,
    #[serde(default)]
    new: Option<Vec<ChangedRow>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Payload {
    Grouped(Vec<ChangedRepositories>),
    RowImages(RowImages),
}

/// Decode a notification payload into the touched paths.
pub fn parse_changed_paths(payload: &str) -> Result<ChangedPaths, PayloadError> {
    let mut changed = ChangedPaths::new();
    match serde_json::from_str::<Payload>(payload)? {
        Payload::Grouped(groups) => {
            for group in groups {
                changed
                    .entry(group.virtual_storage)
                    .or_default()
                    .extend(group.relative_paths);
            }
        }
        Payload::RowImages(images) => {
            let rows = images
                .old
                .into_iter()
                .flatten()
                .chain(images.new.into_iter().flatten());
            for row in rows {
                changed
                    .entry(row.virtual_storage)
                    .or_default()
                    .insert(row.relative_path);
            }
        }
    }
    Ok(changed)
}
