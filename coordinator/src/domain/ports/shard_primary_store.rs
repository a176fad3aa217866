//! Ports over virtual-storage primaries.

use async_trait::async_trait;

use crate::domain::ShardPrimary;

use super::RepositoryStoreError;

/// Resolves the current primary of a virtual storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrimaryGetter: Send + Sync {
    /// Storage name of the non-demoted primary, if one is elected.
    async fn get_primary(&self, virtual_storage: &str)
    -> Result<Option<String>, RepositoryStoreError>;
}

/// Management of the `shard_primaries` records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShardPrimaryStore: Send + Sync {
    /// Current primary record of the virtual storage.
    async fn get_shard_primary(
        &self,
        virtual_storage: &str,
    ) -> Result<Option<ShardPrimary>, RepositoryStoreError>;

    /// Elect `node_name` as primary of the virtual storage.
    async fn set_shard_primary(
        &self,
        virtual_storage: &str,
        node_name: &str,
        elected_by: &str,
    ) -> Result<ShardPrimary, RepositoryStoreError>;

    /// Clear the read-only flag of the virtual storage's primary.
    ///
    /// Fails with [`RepositoryStoreError::NoPrimary`] when no non-demoted
    /// primary exists.
    async fn enable_writes(&self, virtual_storage: &str) -> Result<(), RepositoryStoreError>;
}
