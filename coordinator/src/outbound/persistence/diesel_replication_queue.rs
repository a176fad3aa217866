//! PostgreSQL-backed replication queue.
//!
//! Every event carries a lock named after its target copy. Dequeue picks the
//! oldest eligible event per free lock with `FOR UPDATE SKIP LOCKED`, so
//! concurrent coordinators never block on or double-claim each other's rows.
//! The lock is released when the last in-flight event bound to it is
//! acknowledged or reclaimed.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Double, Integer, Jsonb, Text, Timestamptz};
use diesel_async::scoped_futures::ScopedFutureExt as _;
use diesel_async::{AsyncConnection as _, RunQueryDsl};
use tracing::debug;

use crate::domain::ports::{
    QueueReader, QueueWriter, ReplicationQueueError, ensure_acknowledgement,
};
use crate::domain::{DEFAULT_ATTEMPTS, JobState, ReplicationEvent, ReplicationJob, RepositoryKey};

use super::diesel_helpers::{count_from_db, ids_for_db};
use super::models::{CountRow, DeadJobCountRow, IdRow, ReplicationEventRow};
use super::pool::DbPool;

/// Diesel-backed implementation of the queue ports.
#[derive(Clone)]
pub struct DieselReplicationQueue {
    pool: DbPool,
}

impl DieselReplicationQueue {
    /// Create a queue over `pool`.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const INSERT_LOCK_SQL: &str = r#"
INSERT INTO replication_queue_lock (id)
VALUES ($1)
ON CONFLICT (id) DO NOTHING
"#;

const INSERT_EVENT_SQL: &str = r#"
INSERT INTO replication_queue (lock_id, attempt, job)
VALUES ($1, $2, $3)
RETURNING id, state, created_at, updated_at, lock_id, attempt, job
"#;

const DEQUEUE_SQL: &str = r#"
WITH free_lock AS (
    SELECT id
    FROM replication_queue_lock
    WHERE NOT acquired
    AND LEFT(id, LENGTH($1 || '|' || $2 || '|')) = $1 || '|' || $2 || '|'
    FOR UPDATE SKIP LOCKED
), candidate AS (
    SELECT id
    FROM replication_queue
    WHERE id IN (
        SELECT DISTINCT FIRST_VALUE(queue.id) OVER (
            PARTITION BY queue.lock_id
            ORDER BY queue.created_at, queue.id
        )
        FROM replication_queue AS queue
        JOIN free_lock ON free_lock.id = queue.lock_id
        WHERE queue.state IN ('ready', 'failed')
        AND queue.attempt > 0
        AND queue.job ->> 'virtual_storage' = $1
        AND queue.job ->> 'target_node_storage' = $2
    )
    ORDER BY created_at, id
    LIMIT $3
    FOR UPDATE SKIP LOCKED
), job AS (
    UPDATE replication_queue AS queue
    SET attempt = queue.attempt - 1,
        state = 'in_progress',
        updated_at = NOW()
    FROM candidate
    WHERE queue.id = candidate.id
    RETURNING queue.id, queue.state, queue.created_at, queue.updated_at,
              queue.lock_id, queue.attempt, queue.job
), job_lock AS (
    INSERT INTO replication_queue_job_lock (job_id, lock_id, triggered_at)
    SELECT id, lock_id, NOW() FROM job
    RETURNING lock_id
), acquired AS (
    UPDATE replication_queue_lock AS queue_lock
    SET acquired = TRUE
    FROM job_lock
    WHERE queue_lock.id = job_lock.lock_id
)
SELECT id, state, created_at, updated_at, lock_id, attempt, job
FROM job
ORDER BY created_at, id
"#;

const ACKNOWLEDGE_SQL: &str = r#"
WITH existing AS (
    SELECT id, lock_id, attempt
    FROM replication_queue
    WHERE id = ANY($1::BIGINT[])
    AND state = 'in_progress'
    FOR UPDATE
), acknowledged AS (
    UPDATE replication_queue AS queue
    SET state = CASE
            WHEN $2 = 'failed' AND existing.attempt = 0 THEN 'dead'
            ELSE $2
        END,
        updated_at = NOW()
    FROM existing
    WHERE queue.id = existing.id
    RETURNING queue.id, queue.lock_id
), removed_job_lock AS (
    DELETE FROM replication_queue_job_lock AS job_lock
    USING acknowledged
    WHERE job_lock.job_id = acknowledged.id
    AND job_lock.lock_id = acknowledged.lock_id
    RETURNING job_lock.lock_id
), released AS (
    UPDATE replication_queue_lock
    SET acquired = FALSE
    WHERE id IN (
        SELECT removed.lock_id
        FROM (
            SELECT lock_id, COUNT(*) AS amount
            FROM removed_job_lock
            GROUP BY lock_id
        ) AS removed
        JOIN (
            SELECT lock_id, COUNT(*) AS amount
            FROM replication_queue_job_lock
            WHERE lock_id IN (SELECT lock_id FROM removed_job_lock)
            GROUP BY lock_id
        ) AS held ON held.lock_id = removed.lock_id
        WHERE removed.amount = held.amount
    )
)
SELECT id FROM acknowledged ORDER BY id
"#;

const HEALTH_UPDATE_SQL: &str = r#"
UPDATE replication_queue_job_lock
SET triggered_at = NOW()
WHERE (job_id, lock_id) IN (
    SELECT UNNEST($1::BIGINT[]), UNNEST($2::TEXT[])
)
"#;

const ACKNOWLEDGE_STALE_SQL: &str = r#"
WITH stale_job_lock AS (
    DELETE FROM replication_queue_job_lock
    WHERE triggered_at < NOW() - MAKE_INTERVAL(secs => $1)
    RETURNING job_id, lock_id
), reclaimed AS (
    UPDATE replication_queue AS queue
    SET state = CASE WHEN queue.attempt = 0 THEN 'dead' ELSE 'failed' END,
        updated_at = NOW()
    FROM stale_job_lock
    WHERE queue.id = stale_job_lock.job_id
    RETURNING queue.id
), released AS (
    UPDATE replication_queue_lock AS queue_lock
    SET acquired = FALSE
    WHERE queue_lock.id IN (SELECT lock_id FROM stale_job_lock)
    AND NOT EXISTS (
        SELECT 1
        FROM replication_queue_job_lock AS job_lock
        WHERE job_lock.lock_id = queue_lock.id
        AND job_lock.job_id NOT IN (SELECT job_id FROM stale_job_lock)
    )
)
SELECT COUNT(*) AS count FROM reclaimed
"#;

const COUNT_DEAD_SQL: &str = r#"
SELECT job ->> 'virtual_storage' AS virtual_storage,
       job ->> 'relative_path' AS relative_path,
       COUNT(*) AS count
FROM replication_queue
WHERE state = 'dead'
AND created_at >= $1
AND created_at < $2
GROUP BY 1, 2
"#;

fn to_events(
    rows: Vec<ReplicationEventRow>,
) -> Result<Vec<ReplicationEvent>, ReplicationQueueError> {
    rows.into_iter().map(ReplicationEvent::try_from).collect()
}

#[async_trait]
impl QueueWriter for DieselReplicationQueue {
    async fn enqueue(&self, job: ReplicationJob) -> Result<ReplicationEvent, ReplicationQueueError> {
        let lock_id = job.lock_id();
        let payload = serde_json::to_value(&job)
            .map_err(|err| ReplicationQueueError::serialization(err.to_string()))?;
        let attempt = i32::try_from(DEFAULT_ATTEMPTS).unwrap_or(i32::MAX);
        let mut conn = self.pool.get().await?;

        let row = conn
            .transaction::<_, ReplicationQueueError, _>(|conn| {
                async move {
                    sql_query(INSERT_LOCK_SQL)
                        .bind::<Text, _>(lock_id.as_str())
                        .execute(conn)
                        .await?;
                    let row: ReplicationEventRow = sql_query(INSERT_EVENT_SQL)
                        .bind::<Text, _>(lock_id.as_str())
                        .bind::<Integer, _>(attempt)
                        .bind::<Jsonb, _>(&payload)
                        .get_result(conn)
                        .await?;
                    Ok(row)
                }
                .scope_boxed()
            })
            .await?;

        let event = ReplicationEvent::try_from(row)?;
        debug!(event_id = event.id, lock_id = %event.lock_id, "replication event enqueued");
        Ok(event)
    }
}

#[async_trait]
impl QueueReader for DieselReplicationQueue {
    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>, ReplicationQueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        let mut conn = self.pool.get().await?;

        let rows: Vec<ReplicationEventRow> = sql_query(DEQUEUE_SQL)
            .bind::<Text, _>(virtual_storage)
            .bind::<Text, _>(target_storage)
            .bind::<BigInt, _>(limit)
            .load(&mut conn)
            .await?;
        to_events(rows)
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
        let ids = ids_for_db(ids);
        let mut conn = self.pool.get().await?;

        let rows: Vec<IdRow> = sql_query(ACKNOWLEDGE_SQL)
            .bind::<Array<BigInt>, _>(&ids)
            .bind::<Text, _>(state.as_str())
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| u64::try_from(row.id).ok())
            .collect())
    }

    async fn health_update(
        &self,
        events: &[ReplicationEvent],
    ) -> Result<usize, ReplicationQueueError> {
        if events.is_empty() {
            return Ok(0);
        }
        let (ids, lock_ids): (Vec<i64>, Vec<String>) = events
            .iter()
            .filter_map(|event| {
                i64::try_from(event.id)
                    .ok()
                    .map(|id| (id, event.lock_id.as_str().to_owned()))
            })
            .unzip();
        let mut conn = self.pool.get().await?;

        let updated = sql_query(HEALTH_UPDATE_SQL)
            .bind::<Array<BigInt>, _>(&ids)
            .bind::<Array<Text>, _>(&lock_ids)
            .execute(&mut conn)
            .await?;
        Ok(updated)
    }

    async fn acknowledge_stale(&self, older_than: Duration) -> Result<u64, ReplicationQueueError> {
        let mut conn = self.pool.get().await?;

        let row: CountRow = sql_query(ACKNOWLEDGE_STALE_SQL)
            .bind::<Double, _>(older_than.as_secs_f64())
            .get_result(&mut conn)
            .await?;
        Ok(count_from_db(row.count))
    }

    async fn count_dead_replication_jobs(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<RepositoryKey, u64>, ReplicationQueueError> {
        let mut conn = self.pool.get().await?;

        let rows: Vec<DeadJobCountRow> = sql_query(COUNT_DEAD_SQL)
            .bind::<Timestamptz, _>(from)
            .bind::<Timestamptz, _>(to)
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    RepositoryKey::new(row.virtual_storage, row.relative_path),
                    count_from_db(row.count),
                )
            })
            .collect())
    }
}
