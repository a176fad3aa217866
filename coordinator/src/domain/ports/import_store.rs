//! Port used to bootstrap the state store from on-disk repositories.

use async_trait::async_trait;

use super::RepositoryStoreError;

/// Persistence operations of the repository importer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImportStore: Send + Sync {
    /// Whether the virtual storage finished importing.
    ///
    /// Records the virtual storage as not imported when it is seen for the
    /// first time.
    async fn is_imported(&self, virtual_storage: &str) -> Result<bool, RepositoryStoreError>;

    /// Insert repository and primary copy records at generation 0.
    ///
    /// Both inserts run in one transaction and skip existing rows. Returns the
    /// paths whose repository record was created by this call.
    async fn import_batch(
        &self,
        virtual_storage: &str,
        primary: &str,
        relative_paths: &[String],
    ) -> Result<Vec<String>, RepositoryStoreError>;

    /// Flag the virtual storage as imported.
    async fn mark_imported(&self, virtual_storage: &str) -> Result<(), RepositoryStoreError>;
}
