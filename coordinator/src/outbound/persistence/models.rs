//! Internal Diesel row structs for database operations.
//!
//! These types are implementation details of the persistence layer and must
//! never be exposed to the domain. They exist solely to satisfy Diesel's
//! type requirements for queries and mutations.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Jsonb, Nullable, Text, Timestamptz};

use crate::domain::ports::ReplicationQueueError;
use crate::domain::{Generation, JobState, LockId, ReplicationEvent, ShardPrimary};

use super::schema::{repositories, shard_primaries, storage_repositories};

/// Row struct for reading from the repositories table.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = repositories)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct RepositoryRow {
    pub relative_path: String,
    pub generation: Option<i64>,
    pub primary: Option<String>,
}

/// Row struct for reading copies from the storage_repositories table.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = storage_repositories)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub(crate) struct StorageRepositoryRow {
    pub relative_path: String,
    pub storage: String,
    pub generation: i64,
}

impl StorageRepositoryRow {
    pub fn generation(&self) -> Generation {
        Generation::from_raw(self.generation)
    }
}

/// Row struct for the shard_primaries table, used for reads and upserts.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = shard_primaries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(treat_none_as_null = true)]
pub(crate) struct ShardPrimaryRow {
    pub shard_name: String,
    pub node_name: String,
    pub elected_by: String,
    pub elected_at: DateTime<Utc>,
    pub read_only: bool,
    pub demoted: bool,
    pub previous_writable_primary: Option<String>,
}

impl From<ShardPrimaryRow> for ShardPrimary {
    fn from(row: ShardPrimaryRow) -> Self {
        Self {
            virtual_storage: row.shard_name,
            node_name: row.node_name,
            elected_by: row.elected_by,
            elected_at: row.elected_at,
            read_only: row.read_only,
            demoted: row.demoted,
            previous_writable_primary: row.previous_writable_primary,
        }
    }
}

impl From<ShardPrimary> for ShardPrimaryRow {
    fn from(primary: ShardPrimary) -> Self {
        Self {
            shard_name: primary.virtual_storage,
            node_name: primary.node_name,
            elected_by: primary.elected_by,
            elected_at: primary.elected_at,
            read_only: primary.read_only,
            demoted: primary.demoted,
            previous_writable_primary: primary.previous_writable_primary,
        }
    }
}

/// Replication event returned by the queue's raw SQL statements.
#[derive(Debug, Clone, QueryableByName)]
pub(crate) struct ReplicationEventRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Text)]
    pub state: String,
    #[diesel(sql_type = Timestamptz)]
    pub created_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub updated_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = Text)]
    pub lock_id: String,
    #[diesel(sql_type = Integer)]
    pub attempt: i32,
    #[diesel(sql_type = Jsonb)]
    pub job: serde_json::Value,
}

impl TryFrom<ReplicationEventRow> for ReplicationEvent {
    type Error = ReplicationQueueError;

    fn try_from(row: ReplicationEventRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|err| ReplicationQueueError::serialization(err.to_string()))?;
        let job = serde_json::from_value(row.job).map_err(|err| {
            ReplicationQueueError::serialization(format!("event {}: {err}", row.id))
        })?;
        let id = u64::try_from(row.id).map_err(|_| {
            ReplicationQueueError::serialization(format!("negative event id {}", row.id))
        })?;
        let attempt = u32::try_from(row.attempt).map_err(|_| {
            ReplicationQueueError::serialization(format!("negative attempt for event {id}"))
        })?;

        Ok(Self {
            id,
            state,
            attempt,
            lock_id: LockId::from_stored(row.lock_id),
            created_at: row.created_at,
            updated_at: row.updated_at,
            job,
        })
    }
}

/// Single id column.
#[derive(Debug, Clone, Copy, QueryableByName)]
pub(crate) struct IdRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
}

/// Repository generation returned by an upsert.
#[derive(Debug, Clone, Copy, QueryableByName)]
pub(crate) struct GenerationRow {
    #[diesel(sql_type = Nullable<BigInt>)]
    pub generation: Option<i64>,
}

/// Single count column.
#[derive(Debug, Clone, Copy, QueryableByName)]
pub(crate) struct CountRow {
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

/// Single relative path column.
#[derive(Debug, Clone, QueryableByName)]
pub(crate) struct RelativePathRow {
    #[diesel(sql_type = Text)]
    pub relative_path: String,
}

/// Single import flag column.
#[derive(Debug, Clone, Copy, QueryableByName)]
pub(crate) struct ImportedRow {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    pub repositories_imported: bool,
}

/// Dead events grouped per repository.
#[derive(Debug, Clone, QueryableByName)]
pub(crate) struct DeadJobCountRow {
    #[diesel(sql_type = Text)]
    pub virtual_storage: String,
    #[diesel(sql_type = Text)]
    pub relative_path: String,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

/// Result of `SHOW server_version_num`.
#[derive(Debug, Clone, QueryableByName)]
pub(crate) struct ServerVersionRow {
    #[diesel(sql_type = Text)]
    pub server_version_num: String,
}
