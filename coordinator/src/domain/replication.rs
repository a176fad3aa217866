//! Replication jobs and the events that track them through the queue.
//!
//! The job payload serialises to the JSON document stored in the queue's
//! `job` column:
//!
//! ```json
//! {"change": "rename", "relative_path": "a/b.git",
//!  "target_node_storage": "gitaly-2", "source_node_storage": "gitaly-1",
//!  "virtual_storage": "default", "params": {"RelativePath": "a/c.git"}}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of dequeues an event is allowed before it is exhausted.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Separator used when deriving lock identifiers.
const LOCK_ID_SEPARATOR: char = '|';

/// Kind of change a replication job propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Bring the target up to date with the source.
    Update,
    /// Remove the repository from the target.
    Delete,
    /// Move the repository on the target to the path in `params`.
    Rename,
}

impl ChangeType {
    /// Stable string form used in payloads and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Rename => "rename",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a replication event.
///
/// ```text
/// ready ──dequeue──▶ in_progress ──ack(completed)──▶ completed
///                        ├──ack(failed), attempts left ──▶ failed ──dequeue──▶ in_progress
///                        ├──ack(failed), exhausted ──▶ dead
///                        ├──ack(cancelled) ──▶ cancelled
///                        └──stale reclaim ──▶ failed | dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its first dequeue.
    Ready,
    /// Dequeued and locked by a worker.
    InProgress,
    /// Replicated successfully.
    Completed,
    /// Aborted externally.
    Cancelled,
    /// Failed with attempts remaining.
    Failed,
    /// Failed with no attempts remaining.
    Dead,
}

impl JobState {
    /// Stable string form stored in the `state` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Whether no further transition can leave this state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Dead)
    }

    /// Whether a dequeue may pick an event in this state.
    pub const fn is_dequeueable(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Whether the state is a valid acknowledgement outcome.
    pub const fn is_acknowledgement(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Dead | Self::Cancelled
        )
    }

    /// Resolve the stored state for an acknowledgement with `attempt` left.
    ///
    /// A failure acknowledged after the last attempt lands in `dead`.
    pub const fn acknowledged(self, attempt: u32) -> Self {
        match self {
            Self::Failed if attempt == 0 => Self::Dead,
            other => other,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised when parsing an unknown job state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown replication job state: {0}")]
pub struct ParseJobStateError(pub String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(ParseJobStateError(other.to_owned())),
        }
    }
}

/// Free-form job parameters, e.g. `{"RelativePath": "new/path"}` for renames.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Parameter key carrying the destination path of a rename.
pub const RENAME_PATH_PARAM: &str = "RelativePath";

/// One unit of replication work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationJob {
    /// Kind of change to replicate.
    pub change: ChangeType,
    /// Repository path relative to the storage root.
    pub relative_path: String,
    /// Storage receiving the change.
    pub target_node_storage: String,
    /// Storage providing the up-to-date copy.
    #[serde(default)]
    pub source_node_storage: String,
    /// Virtual storage the repository belongs to.
    pub virtual_storage: String,
    /// Change-specific parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl ReplicationJob {
    /// Build an update job replicating `relative_path` from `source` to `target`.
    pub fn update(
        virtual_storage: impl Into<String>,
        relative_path: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            change: ChangeType::Update,
            relative_path: relative_path.into(),
            target_node_storage: target.into(),
            source_node_storage: source.into(),
            virtual_storage: virtual_storage.into(),
            params: None,
        }
    }

    /// Lock serialising replication to this job's target copy.
    pub fn lock_id(&self) -> LockId {
        LockId::new(
            &self.virtual_storage,
            &self.target_node_storage,
            &self.relative_path,
        )
    }

    /// Destination path of a rename job, if present.
    pub fn rename_destination(&self) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|params| params.get(RENAME_PATH_PARAM))
            .and_then(serde_json::Value::as_str)
    }
}

/// Advisory lock identifier `virtual_storage|target_storage|relative_path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(String);

impl LockId {
    /// Derive the lock identifier for a target copy.
    pub fn new(virtual_storage: &str, target_storage: &str, relative_path: &str) -> Self {
        Self(format!(
            "{virtual_storage}{LOCK_ID_SEPARATOR}{target_storage}{LOCK_ID_SEPARATOR}{relative_path}"
        ))
    }

    /// Wrap a lock identifier read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A queued replication job and its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationEvent {
    /// Monotonic identifier assigned on enqueue.
    pub id: u64,
    /// Current lifecycle state.
    pub state: JobState,
    /// Dequeues left before the event is exhausted.
    pub attempt: u32,
    /// Lock derived from the job.
    pub lock_id: LockId,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Time of the last state change, if any.
    pub updated_at: Option<DateTime<Utc>>,
    /// The replication work itself.
    pub job: ReplicationJob,
}

/// Identifies a logical repository within a virtual storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryKey {
    /// Virtual storage name.
    pub virtual_storage: String,
    /// Path relative to the storage root.
    pub relative_path: String,
}

impl RepositoryKey {
    /// Construct a key.
    pub fn new(virtual_storage: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            virtual_storage: virtual_storage.into(),
            relative_path: relative_path.into(),
        }
    }
}
