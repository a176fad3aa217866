//! Process-local adapters for the state store and replication queue.

mod replication_queue;
mod repository_store;

pub use replication_queue::MemoryReplicationQueue;
pub use repository_store::MemoryRepositoryStore;
