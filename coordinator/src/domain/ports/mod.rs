//! Domain ports and supporting types for the hexagonal boundary.

mod macros;
pub(crate) use macros::define_port_error;

mod assignment_store;
mod generation_store;
mod import_store;
mod notifications;
mod replication_queue;
mod shard_primary_store;
mod storage_node;
mod storage_provider_metrics;

#[cfg(test)]
pub use assignment_store::{MockAssignmentStore, MockRepositoryStatusQuery};
pub use assignment_store::{AssignmentStore, RepositoryStatusQuery};
#[cfg(test)]
pub use generation_store::{MockConsistentStoragesGetter, MockGenerationStore};
pub use generation_store::{ConsistentStoragesGetter, GenerationStore, RepositoryStoreError};
#[cfg(test)]
pub use import_store::MockImportStore;
pub use import_store::ImportStore;
#[cfg(test)]
pub use notifications::MockListenerHandler;
pub use notifications::{
    ListenerHandler, Notification, NotificationConnection, NotificationConnector,
    NotificationError, REPOSITORIES_CHANNEL, STORAGE_REPOSITORIES_CHANNEL,
};
#[cfg(test)]
pub use replication_queue::{MockQueueReader, MockQueueWriter};
pub use replication_queue::{
    QueueReader, QueueWriter, ReplicationQueueError, ensure_acknowledgement,
};
#[cfg(test)]
pub use shard_primary_store::{MockPrimaryGetter, MockShardPrimaryStore};
pub use shard_primary_store::{PrimaryGetter, ShardPrimaryStore};
#[cfg(test)]
pub use storage_node::{MockChecksumSource, MockNodeDialer, MockRepositoryWalker};
pub use storage_node::{
    BackendError, ChecksumSource, NodeDialer, RepositoryPaths, RepositoryWalker,
};
#[cfg(test)]
pub use storage_provider_metrics::MockStorageProviderMetrics;
pub use storage_provider_metrics::{
    NoOpStorageProviderMetrics, StorageProviderMetrics, StorageProviderMetricsError,
};

/// Channels carrying repository state changes, in subscription order.
pub fn state_change_channels() -> Vec<String> {
    vec![
        REPOSITORIES_CHANNEL.to_owned(),
        STORAGE_REPOSITORIES_CHANNEL.to_owned(),
    ]
}
