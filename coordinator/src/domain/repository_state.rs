//! Pure rules over a repository's recorded copies.
//!
//! Both the in-memory and the PostgreSQL stores load the relevant rows and
//! delegate the decision to these functions, so the two adapters cannot drift
//! apart on generation semantics.

use std::collections::{BTreeMap, BTreeSet};

use super::Generation;
use super::ports::RepositoryStoreError;

/// Rows recorded for one logical repository.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepositorySnapshot {
    /// Path relative to the storage root.
    pub relative_path: String,
    /// Per-repository primary, if one was recorded.
    pub primary: Option<String>,
    /// Repository-level generation.
    pub generation: Generation,
    /// Generation of every recorded copy keyed by storage.
    pub copies: BTreeMap<String, Generation>,
    /// Storages explicitly assigned to host the repository.
    pub assignments: BTreeSet<String>,
}

impl RepositorySnapshot {
    /// Highest generation across the recorded copies.
    pub fn max_copy_generation(&self) -> Option<Generation> {
        self.copies.values().copied().max()
    }

    /// Storages whose copy holds the highest recorded generation.
    pub fn consistent_storages(&self) -> BTreeSet<String> {
        consistent_storages(&self.copies)
    }

    /// Whether `storage` holds the highest recorded generation.
    pub fn is_consistent(&self, storage: &str) -> bool {
        match (self.copies.get(storage), self.max_copy_generation()) {
            (Some(generation), Some(latest)) => *generation == latest,
            _ => false,
        }
    }
}

/// Storages whose generation equals the maximum across `copies`.
pub fn consistent_storages(copies: &BTreeMap<String, Generation>) -> BTreeSet<String> {
    let Some(latest) = copies.values().copied().max() else {
        return BTreeSet::new();
    };
    copies
        .iter()
        .filter(|(_, generation)| **generation == latest)
        .map(|(storage, _)| storage.clone())
        .collect()
}

/// Guard a replication from `source` to `target` against downgrades.
///
/// Returns the source's generation when the target trails it. Unknown
/// generations compare as `-1`.
pub fn replicated_generation(
    virtual_storage: &str,
    relative_path: &str,
    target: &str,
    source_generation: Generation,
    target_generation: Generation,
) -> Result<Generation, RepositoryStoreError> {
    if target_generation >= source_generation {
        return Err(RepositoryStoreError::downgrade_attempted(
            virtual_storage,
            relative_path,
            target,
            target_generation.as_i64(),
            source_generation.as_i64(),
        ));
    }
    Ok(source_generation)
}

/// Storages advanced by an increment, given the pre-increment copies.
///
/// The primary is always advanced. A secondary is advanced only when its
/// generation equals the primary's pre-increment generation; a primary
/// without a record advances alone.
pub fn increment_targets(
    copies: &BTreeMap<String, Generation>,
    primary: &str,
    secondaries: &[String],
) -> BTreeSet<String> {
    let mut targets = BTreeSet::from([primary.to_owned()]);
    let Some(base) = copies.get(primary) else {
        return targets;
    };
    targets.extend(
        secondaries
            .iter()
            .filter(|secondary| copies.get(secondary.as_str()) == Some(base))
            .cloned(),
    );
    targets
}

/// Generation installed on the increment targets.
///
/// Mirrors the repository-level upsert: an absent or unknown repository
/// generation starts at 0.
pub fn incremented_generation(repository_generation: Option<Generation>) -> Generation {
    repository_generation.unwrap_or(Generation::UNKNOWN).next()
}
