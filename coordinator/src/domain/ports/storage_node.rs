//! Ports over the backend storage nodes that hold repository copies.
//!
//! The data plane lives on the nodes; the coordinator only asks them to list
//! repositories, compute checksums and answer health checks.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use super::define_port_error;

define_port_error! {
    /// Errors raised by storage node adapters.
    pub enum BackendError {
        /// The node could not be reached.
        Unavailable { storage: String, message: String } =>
            "storage {storage} is unavailable: {message}",
        /// The repository does not exist on the node.
        NotFound { storage: String, relative_path: String } =>
            "repository {relative_path} not found on {storage}",
        /// The node answered with an error.
        Rpc { storage: String, message: String } => "storage {storage} failed: {message}",
    }
}

impl BackendError {
    /// Whether the repository is absent on the node.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Stream of repository relative paths.
pub type RepositoryPaths = BoxStream<'static, Result<String, BackendError>>;

/// Lists the repositories present on a storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryWalker: Send + Sync {
    /// Stream every repository's relative path on `storage`.
    async fn walk_repos(
        &self,
        virtual_storage: &str,
        storage: &str,
    ) -> Result<RepositoryPaths, BackendError>;
}

/// Computes content checksums of repository copies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChecksumSource: Send + Sync {
    /// Checksum of the copy on `storage`; [`BackendError::NotFound`] when absent.
    async fn checksum(
        &self,
        virtual_storage: &str,
        storage: &str,
        relative_path: &str,
    ) -> Result<String, BackendError>;
}

/// Health check of storage nodes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeDialer: Send + Sync {
    /// Succeeds when `storage` answers its health check.
    async fn dial(&self, virtual_storage: &str, storage: &str) -> Result<(), BackendError>;
}
