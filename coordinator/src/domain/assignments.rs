//! Host assignment rules.
//!
//! A repository with no assignment rows is hosted by every configured
//! storage of its virtual storage. Once rows exist they restrict the desired
//! hosts to exactly those storages.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use super::Generation;
use super::ports::RepositoryStoreError;

/// Physical storages configured for each virtual storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfiguredStorages {
    by_virtual_storage: BTreeMap<String, Vec<String>>,
}

impl ConfiguredStorages {
    /// Build the map from `(virtual_storage, storages)` pairs.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        Self {
            by_virtual_storage: entries
                .into_iter()
                .map(|(name, storages)| (name.into(), storages))
                .collect(),
        }
    }

    /// Storages of `virtual_storage`, or `VirtualStorageNotFound`.
    pub fn storages(&self, virtual_storage: &str) -> Result<&[String], RepositoryStoreError> {
        self.by_virtual_storage
            .get(virtual_storage)
            .map(Vec::as_slice)
            .ok_or_else(|| RepositoryStoreError::virtual_storage_not_found(virtual_storage))
    }

    /// Configured virtual storage names in order.
    pub fn virtual_storages(&self) -> impl Iterator<Item = &str> {
        self.by_virtual_storage.keys().map(String::as_str)
    }

    /// Whether no virtual storage is configured.
    pub fn is_empty(&self) -> bool {
        self.by_virtual_storage.is_empty()
    }
}

/// Assigned storages after applying the fallback rule.
///
/// Rows naming storages that are no longer configured are ignored.
pub fn effective_assignments(assigned: &BTreeSet<String>, configured: &[String]) -> Vec<String> {
    let restricted: Vec<String> = configured
        .iter()
        .filter(|storage| assigned.contains(storage.as_str()))
        .cloned()
        .collect();
    if restricted.is_empty() {
        configured.to_vec()
    } else {
        restricted
    }
}

/// Validate a requested replication factor against the configured storages.
pub fn validate_replication_factor(
    factor: usize,
    configured: &[String],
) -> Result<(), RepositoryStoreError> {
    if factor < 1 {
        return Err(RepositoryStoreError::invalid_argument(
            "replication factor must be at least 1",
        ));
    }
    if factor > configured.len() {
        return Err(RepositoryStoreError::invalid_argument(format!(
            "replication factor {factor} exceeds the {} configured storages",
            configured.len()
        )));
    }
    Ok(())
}

/// Inputs for choosing the storages that host a repository.
#[derive(Debug, Clone, Copy)]
pub struct AssignmentInputs<'a> {
    /// Storages configured for the virtual storage.
    pub configured: &'a [String],
    /// Current assignment rows.
    pub current: &'a BTreeSet<String>,
    /// The repository's primary, if recorded.
    pub primary: Option<&'a str>,
    /// Generations of the recorded copies.
    pub copies: &'a BTreeMap<String, Generation>,
}

/// Choose exactly `factor` storages to host a repository.
///
/// Storages are ranked primary first, then already assigned storages, then by
/// descending generation and finally by name, and the top `factor` are kept.
/// The primary is therefore never unassigned, and up-to-date copies are
/// preferred when new hosts are added.
pub fn select_assignments(
    inputs: AssignmentInputs<'_>,
    factor: usize,
) -> Result<BTreeSet<String>, RepositoryStoreError> {
    validate_replication_factor(factor, inputs.configured)?;

    let mut ranked: Vec<&String> = inputs.configured.iter().collect();
    ranked.sort_by_key(|storage| {
        (
            Reverse(inputs.primary == Some(storage.as_str())),
            Reverse(inputs.current.contains(storage.as_str())),
            Reverse(
                inputs
                    .copies
                    .get(storage.as_str())
                    .copied()
                    .unwrap_or(Generation::UNKNOWN),
            ),
            storage.as_str(),
        )
    });

    Ok(ranked.into_iter().take(factor).cloned().collect())
}

/// Rows to insert and delete to move from `current` to `desired`.
pub fn assignment_changes(
    current: &BTreeSet<String>,
    desired: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let added = desired.difference(current).cloned().collect();
    let removed = current.difference(desired).cloned().collect();
    (added, removed)
}
