//! Outdated-repository reporting.
//!
//! Operators use this report to find repositories whose assigned copies lag
//! behind the latest generation, and in particular repositories whose primary
//! is outdated and which therefore cannot accept writes.

use serde::Serialize;

use super::assignments::effective_assignments;
use super::repository_state::RepositorySnapshot;

/// One copy of an outdated repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedStorage {
    /// Storage name.
    pub name: String,
    /// Generations the copy trails the latest by; missing copies count from -1.
    pub behind_by: u64,
    /// Whether the storage is assigned to host the repository.
    pub assigned: bool,
}

/// A repository with at least one assigned copy behind the latest generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedRepository {
    /// Path relative to the storage root.
    pub relative_path: String,
    /// Primary used for the report.
    pub primary: Option<String>,
    /// Whether the primary is outdated, leaving the repository read-only.
    pub read_only: bool,
    /// Every recorded or assigned copy, ordered by storage name.
    pub storages: Vec<OutdatedStorage>,
}

/// Whether the repository cannot take writes because `primary` is outdated.
pub fn is_read_only(snapshot: &RepositorySnapshot, primary: Option<&str>) -> bool {
    primary.is_none_or(|primary| !snapshot.is_consistent(primary))
}

/// Build the outdated report for one repository, if any assigned copy lags.
pub fn outdated_repository(
    snapshot: &RepositorySnapshot,
    configured: &[String],
    primary: Option<&str>,
) -> Option<OutdatedRepository> {
    let latest = snapshot.max_copy_generation()?;
    let assigned = effective_assignments(&snapshot.assignments, configured);

    let mut names: Vec<&str> = snapshot
        .copies
        .keys()
        .map(String::as_str)
        .chain(assigned.iter().map(String::as_str))
        .collect();
    names.sort_unstable();
    names.dedup();

    let storages: Vec<OutdatedStorage> = names
        .into_iter()
        .map(|name| OutdatedStorage {
            name: name.to_owned(),
            behind_by: snapshot
                .copies
                .get(name)
                .copied()
                .unwrap_or_default()
                .behind(latest),
            assigned: assigned.iter().any(|storage| storage == name),
        })
        .collect();

    let lagging = storages
        .iter()
        .any(|storage| storage.assigned && storage.behind_by > 0);
    if !lagging {
        return None;
    }

    Some(OutdatedRepository {
        relative_path: snapshot.relative_path.clone(),
        primary: primary.map(str::to_owned),
        read_only: is_read_only(snapshot, primary),
        storages,
    })
}
