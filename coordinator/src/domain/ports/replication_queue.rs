//! Ports over the durable replication event queue.
//!
//! Writers enqueue [`ReplicationJob`]s; workers dequeue events for one
//! `(virtual_storage, target_storage)` pair, replicate, and acknowledge. Every
//! event holds its lock while `in_progress`, so at most one event per lock is
//! ever in flight.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{JobState, ReplicationEvent, ReplicationJob, RepositoryKey};

use super::define_port_error;

define_port_error! {
    /// Errors raised by replication queue adapters.
    pub enum ReplicationQueueError {
        /// Queue storage could not be reached.
        Connection { message: String } => "replication queue connection failed: {message}",
        /// Query or mutation failed during execution.
        Query { message: String } => "replication queue query failed: {message}",
        /// A job payload could not be encoded or decoded.
        Serialization { message: String } => "replication job serialization failed: {message}",
        /// The requested acknowledgement state is not an outcome.
        InvalidState { state: String } => "cannot acknowledge replication events as {state}",
    }
}

/// Producer side of the queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueWriter: Send + Sync {
    /// Persist a new `ready` event for `job` with the full attempt budget.
    ///
    /// Enqueueing the same job twice yields two events sharing one lock.
    async fn enqueue(&self, job: ReplicationJob) -> Result<ReplicationEvent, ReplicationQueueError>;
}

/// Worker side of the queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueReader: Send + Sync {
    /// Take up to `count` events targeting `target_storage`.
    ///
    /// Picks the oldest `ready` or `failed` event with attempts left for every
    /// lock that is free, marks it `in_progress` and acquires the lock.
    /// Concurrent callers skip each other's rows instead of blocking.
    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>, ReplicationQueueError>;

    /// Move `in_progress` events in `ids` to `state` and release their locks.
    ///
    /// Returns the ids that were acknowledged; other ids are ignored. A
    /// failure without attempts left is stored as `dead`.
    async fn acknowledge(
        &self,
        state: JobState,
        ids: &[u64],
    ) -> Result<Vec<u64>, ReplicationQueueError>;

    /// Refresh the liveness timestamp of the given in-flight events.
    ///
    /// Returns the number of events still holding their lock.
    async fn health_update(
        &self,
        events: &[ReplicationEvent],
    ) -> Result<usize, ReplicationQueueError>;

    /// Reclaim events whose liveness timestamp is older than `older_than`.
    ///
    /// Reclaimed events become `failed`, or `dead` when no attempt is left,
    /// and release their locks. Returns the number of reclaimed events.
    async fn acknowledge_stale(&self, older_than: Duration) -> Result<u64, ReplicationQueueError>;

    /// Count `dead` events created in `[from, to)` per repository.
    async fn count_dead_replication_jobs(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<RepositoryKey, u64>, ReplicationQueueError>;
}

/// Reject acknowledgement states that are not outcomes of a replication.
pub fn ensure_acknowledgement(state: JobState) -> Result<(), ReplicationQueueError> {
    if state.is_acknowledgement() {
        Ok(())
    } else {
        Err(ReplicationQueueError::invalid_state(state.as_str()))
    }
}
