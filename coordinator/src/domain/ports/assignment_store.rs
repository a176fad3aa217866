//! Port for host assignments and repository status reporting.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::OutdatedRepository;

use super::RepositoryStoreError;

/// Host assignment management.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Storages assigned to host the repository.
    ///
    /// Rows are restricted to configured storages. Without rows every
    /// configured storage is returned.
    async fn get_host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<String>, RepositoryStoreError>;

    /// Adjust assignment rows so exactly `factor` storages host the repository.
    ///
    /// Returns the resulting assigned storages in name order.
    async fn set_replication_factor(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        factor: usize,
    ) -> Result<Vec<String>, RepositoryStoreError>;
}

/// Read-only reporting over the repository state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryStatusQuery: Send + Sync {
    /// Repositories with at least one assigned copy behind the latest generation.
    ///
    /// With `use_virtual_storage_primary` the shard primary of the virtual
    /// storage is reported; otherwise each repository's own primary is.
    async fn partially_replicated_repositories(
        &self,
        virtual_storage: &str,
        use_virtual_storage_primary: bool,
    ) -> Result<Vec<OutdatedRepository>, RepositoryStoreError>;

    /// Number of read-only repositories per configured virtual storage.
    ///
    /// Every configured virtual storage is present, with 0 when none is read-only.
    async fn read_only_counts(
        &self,
        use_virtual_storage_primary: bool,
    ) -> Result<BTreeMap<String, u64>, RepositoryStoreError>;
}
