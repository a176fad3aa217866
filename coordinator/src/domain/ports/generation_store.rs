//! Port for per-copy generation bookkeeping.
//!
//! The [`GenerationStore`] records which physical copy of a repository is at
//! which generation. It is the write path of the state store: every accepted
//! write increments generations, and every replication acknowledgement sets
//! the target's generation to the source's.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::Generation;

use super::define_port_error;

define_port_error! {
    /// Errors raised by the repository state store adapters.
    pub enum RepositoryStoreError {
        /// The store could not be reached.
        Connection { message: String } => "repository store connection failed: {message}",
        /// Query or mutation failed during execution.
        Query { message: String } => "repository store query failed: {message}",
        /// The repository has no record for the requested operation.
        RepositoryNotFound { virtual_storage: String, relative_path: String } =>
            "repository not found: {virtual_storage}/{relative_path}",
        /// The virtual storage is not configured.
        VirtualStorageNotFound { virtual_storage: String } =>
            "unknown virtual storage: {virtual_storage}",
        /// A caller-supplied argument is out of range.
        InvalidArgument { message: String } => "invalid argument: {message}",
        /// Replication would overwrite a copy at the same or newer generation.
        DowngradeAttempted {
            virtual_storage: String,
            relative_path: String,
            storage: String,
            current_generation: i64,
            attempted_generation: i64,
        } => "attempted downgrading {virtual_storage}/{relative_path} on {storage} from generation {current_generation} to {attempted_generation}",
        /// The virtual storage has no writable shard primary.
        NoPrimary { virtual_storage: String } =>
            "virtual storage {virtual_storage} has no primary",
    }
}

impl RepositoryStoreError {
    /// Whether the error means the repository or virtual storage is unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RepositoryNotFound { .. } | Self::VirtualStorageNotFound { .. }
        )
    }
}

/// Generation bookkeeping for physical repository copies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationStore: Send + Sync {
    /// Generation of `storage`'s copy, or [`Generation::UNKNOWN`] without a record.
    async fn get_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<Generation, RepositoryStoreError>;

    /// Increment the primary's generation after a successful write.
    ///
    /// The repository record is created at generation 0 when absent. Each
    /// secondary whose generation equalled the primary's before the call is
    /// advanced in lock-step; other secondaries are left untouched.
    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<(), RepositoryStoreError>;

    /// Record `generation` for `storage`'s copy unconditionally.
    ///
    /// The repository-level generation only ever moves up.
    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: Generation,
    ) -> Result<(), RepositoryStoreError>;

    /// Generation a replication from `source` to `target` would install.
    ///
    /// Fails with [`RepositoryStoreError::DowngradeAttempted`] when the target
    /// is already at or beyond the source's generation.
    async fn get_replicated_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        source: &str,
        target: &str,
    ) -> Result<Generation, RepositoryStoreError>;

    /// Remove the repository record and `storage`'s copy record.
    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError>;

    /// Remove `storage`'s copy record, and the repository record if no copy remains.
    async fn delete_invalid_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError>;

    /// Move the repository record and `storage`'s copy record to `new_relative_path`.
    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        new_relative_path: &str,
    ) -> Result<(), RepositoryStoreError>;

    /// Whether the repository exists in the virtual storage.
    async fn repository_exists(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<bool, RepositoryStoreError>;

    /// Make `storage` the only up-to-date copy, accepting data loss elsewhere.
    async fn set_authoritative_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError>;
}

/// Read side used to route reads to up-to-date copies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsistentStoragesGetter: Send + Sync {
    /// Storages holding the latest generation; empty when no copy is recorded.
    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>, RepositoryStoreError>;
}
