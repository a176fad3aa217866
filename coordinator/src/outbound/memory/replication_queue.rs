//! In-memory replication event queue.
//!
//! Mirrors the lock bookkeeping of the PostgreSQL queue: one lock per target
//! copy, acquired while an event bound to it is in flight.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use mockable::Clock;

use crate::domain::ports::{
    QueueReader, QueueWriter, ReplicationQueueError, ensure_acknowledgement,
};
use crate::domain::{
    DEFAULT_ATTEMPTS, JobState, LockId, ReplicationEvent, ReplicationJob, RepositoryKey,
};

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    events: BTreeMap<u64, ReplicationEvent>,
    /// `true` while an event bound to the lock is in flight.
    locks: BTreeMap<LockId, bool>,
    /// In-flight event id to its lock and last liveness time.
    job_locks: BTreeMap<u64, (LockId, DateTime<Utc>)>,
}

impl QueueState {
    fn release(&mut self, id: u64) {
        let Some((lock_id, _)) = self.job_locks.remove(&id) else {
            return;
        };
        let still_held = self.job_locks.values().any(|(held, _)| *held == lock_id);
        if !still_held {
            self.locks.insert(lock_id, false);
        }
    }

    fn is_acquired(&self, lock_id: &LockId) -> bool {
        self.locks.get(lock_id).copied().unwrap_or(false)
    }
}

/// Replication queue backed by process memory.
pub struct MemoryReplicationQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl MemoryReplicationQueue {
    /// Create an empty queue.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>, ReplicationQueueError> {
        self.state
            .lock()
            .map_err(|_| ReplicationQueueError::query("in-memory queue lock poisoned"))
    }

    /// Snapshot of a stored event.
    pub fn event(&self, id: u64) -> Result<Option<ReplicationEvent>, ReplicationQueueError> {
        Ok(self.state()?.events.get(&id).cloned())
    }

    /// Whether the lock is currently held by an in-flight event.
    pub fn is_locked(&self, lock_id: &LockId) -> Result<bool, ReplicationQueueError> {
        Ok(self.state()?.is_acquired(lock_id))
    }
}

#[async_trait]
impl QueueWriter for MemoryReplicationQueue {
    async fn enqueue(&self, job: ReplicationJob) -> Result<ReplicationEvent, ReplicationQueueError> {
        let mut state = self.state()?;
        state.next_id += 1;
        let lock_id = job.lock_id();
        state.locks.entry(lock_id.clone()).or_insert(false);

        let event = ReplicationEvent {
            id: state.next_id,
            state: JobState::Ready,
            attempt: DEFAULT_ATTEMPTS,
            lock_id,
            created_at: self.clock.utc(),
            updated_at: None,
            job,
        };
        state.events.insert(event.id, event.clone());
        Ok(event)
    }
}

#[async_trait]
impl QueueReader for MemoryReplicationQueue {
    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>, ReplicationQueueError> {
        let now = self.clock.utc();
        let mut state = self.state()?;

        let mut candidates: Vec<&ReplicationEvent> = state
            .events
            .values()
            .filter(|event| {
                event.attempt > 0
                    && event.state.is_dequeueable()
                    && event.job.virtual_storage == virtual_storage
                    && event.job.target_node_storage == target_storage
                    && !state.is_acquired(&event.lock_id)
            })
            .collect();
        candidates.sort_by_key(|event| (event.created_at, event.id));

        let mut picked: Vec<u64> = Vec::new();
        let mut claimed: Vec<&LockId> = Vec::new();
        for event in candidates {
            if picked.len() == count {
                break;
            }
            if claimed.contains(&&event.lock_id) {
                continue;
            }
            claimed.push(&event.lock_id);
            picked.push(event.id);
        }

        let mut dequeued = Vec::with_capacity(picked.len());
        for id in picked {
            let Some(event) = state.events.get_mut(&id) else {
                continue;
            };
            event.attempt -= 1;
            event.state = JobState::InProgress;
            event.updated_at = Some(now);
            let event = event.clone();

            state.locks.insert(event.lock_id.clone(), true);
            state
                .job_locks
                .insert(event.id, (event.lock_id.clone(), now));
            dequeued.push(event);
        }
        Ok(dequeued)
    }

    async fn acknowledge(
        &self,
        state: JobState,
        ids: &[u64],
    ) -> Result<Vec<u64>, ReplicationQueueError> {
        ensure_acknowledgement(state)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.utc();
        let mut queue = self.state()?;

        let mut acknowledged = Vec::new();
        for id in ids {
            let Some(event) = queue.events.get_mut(id) else {
                continue;
            };
            if event.state != JobState::InProgress {
                continue;
            }
            event.state = state.acknowledged(event.attempt);
            event.updated_at = Some(now);
            queue.release(*id);
            acknowledged.push(*id);
        }
        acknowledged.sort_unstable();
        acknowledged.dedup();
        Ok(acknowledged)
    }

    async fn health_update(
        &self,
        events: &[ReplicationEvent],
    ) -> Result<usize, ReplicationQueueError> {
        let now = self.clock.utc();
        let mut state = self.state()?;
        let mut locked = 0;
        for event in events {
            if let Some((lock_id, triggered_at)) = state.job_locks.get_mut(&event.id) {
                if *lock_id == event.lock_id {
                    *triggered_at = now;
                    locked += 1;
                }
            }
        }
        Ok(locked)
    }

    async fn acknowledge_stale(&self, older_than: Duration) -> Result<u64, ReplicationQueueError> {
        let threshold = TimeDelta::from_std(older_than)
            .map_err(|err| ReplicationQueueError::query(err.to_string()))?;
        let now = self.clock.utc();
        let cutoff = now - threshold;
        let mut state = self.state()?;

        let stale: Vec<u64> = state
            .job_locks
            .iter()
            .filter(|(_, (_, triggered_at))| *triggered_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(event) = state.events.get_mut(id) {
                event.state = JobState::Failed.acknowledged(event.attempt);
                event.updated_at = Some(now);
            }
            state.release(*id);
        }
        Ok(u64::try_from(stale.len()).unwrap_or(u64::MAX))
    }

    async fn count_dead_replication_jobs(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<RepositoryKey, u64>, ReplicationQueueError> {
        let state = self.state()?;
        let mut counts = HashMap::new();
        for event in state.events.values().filter(|event| {
            event.state == JobState::Dead && event.created_at >= from && event.created_at < to
        }) {
            let key = RepositoryKey::new(
                event.job.virtual_storage.as_str(),
                event.job.relative_path.as_str(),
            );
            *counts.entry(key).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
