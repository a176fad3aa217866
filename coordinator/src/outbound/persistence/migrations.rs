//! Embedded schema migrations and the database version check.
//!
//! Diesel's migration harness only drives synchronous connections, so the
//! migration commands run on a blocking task with their own connection. The
//! ping uses an async connection and bounds the version query with
//! [`PING_TIMEOUT`].

use std::collections::BTreeSet;
use std::time::Duration;

use diesel::migration::MigrationSource;
use diesel::pg::{Pg, PgConnection};
use diesel::{Connection, sql_query};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::{debug, info};

use super::models::ServerVersionRow;

/// Migrations compiled from the crate's `migrations/` directory.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Oldest PostgreSQL release the queue and notification SQL supports.
pub const MINIMUM_SERVER_VERSION: i64 = 90600;

/// Deadline for the version query issued by [`ping`].
pub const PING_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors raised by schema management and the version check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The database could not be reached.
    #[error("failed to connect to database: {message}")]
    Connection { message: String },

    /// A migration could not be listed, applied, or reverted.
    #[error("migration failed: {message}")]
    Migration { message: String },

    /// The version query failed.
    #[error("database query failed: {message}")]
    Query { message: String },

    /// The version query did not finish within the deadline.
    #[error("database did not answer within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The server is older than [`MINIMUM_SERVER_VERSION`].
    #[error("unsupported database version {found}, need at least {minimum}")]
    UnsupportedVersion { found: i64, minimum: i64 },
}

impl SchemaError {
    /// Create a connection error with the given message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a migration error with the given message.
    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    /// Create a query error with the given message.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Create a timeout error for `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Whether one embedded migration has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: String,
    pub applied: bool,
}

/// Versions of every embedded migration, oldest first.
pub fn known_versions() -> Result<Vec<String>, SchemaError> {
    let migrations = MigrationSource::<Pg>::migrations(&MIGRATIONS)
        .map_err(|err| SchemaError::migration(err.to_string()))?;
    let mut versions: Vec<String> = migrations
        .iter()
        .map(|migration| migration.name().version().to_string())
        .collect();
    versions.sort();
    Ok(versions)
}

fn status_rows(known: Vec<String>, applied: &BTreeSet<String>) -> Vec<MigrationStatus> {
    known
        .into_iter()
        .map(|version| MigrationStatus {
            applied: applied.contains(&version),
            version,
        })
        .collect()
}

/// The `count` most recently applied versions, newest first.
fn revert_plan(applied: &BTreeSet<String>, count: usize) -> Vec<String> {
    applied.iter().rev().take(count).cloned().collect()
}

fn parse_server_version(raw: &str) -> Result<i64, SchemaError> {
    let version = raw
        .trim()
        .parse::<i64>()
        .map_err(|err| SchemaError::query(format!("server_version_num {raw:?}: {err}")))?;
    if version < MINIMUM_SERVER_VERSION {
        return Err(SchemaError::UnsupportedVersion {
            found: version,
            minimum: MINIMUM_SERVER_VERSION,
        });
    }
    Ok(version)
}

async fn with_blocking_connection<T, F>(database_url: &str, work: F) -> Result<T, SchemaError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, SchemaError> + Send + 'static,
{
    let url = database_url.to_owned();
    tokio::task::spawn_blocking(move || {
        let mut conn =
            PgConnection::establish(&url).map_err(|err| SchemaError::connection(err.to_string()))?;
        work(&mut conn)
    })
    .await
    .map_err(|err| SchemaError::migration(format!("migration task failed: {err}")))?
}

fn applied_versions(conn: &mut PgConnection) -> Result<BTreeSet<String>, SchemaError> {
    let applied = conn
        .applied_migrations()
        .map_err(|err| SchemaError::migration(err.to_string()))?;
    Ok(applied.iter().map(ToString::to_string).collect())
}

/// Report every embedded migration with its applied flag.
pub async fn migration_status(database_url: &str) -> Result<Vec<MigrationStatus>, SchemaError> {
    let known = known_versions()?;
    with_blocking_connection(database_url, move |conn| {
        let applied = applied_versions(conn)?;
        Ok(status_rows(known, &applied))
    })
    .await
}

/// Apply every pending migration and return the applied versions.
pub async fn run_migrations(database_url: &str) -> Result<Vec<String>, SchemaError> {
    let applied = with_blocking_connection(database_url, |conn| {
        let versions = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| SchemaError::migration(err.to_string()))?;
        Ok(versions.iter().map(ToString::to_string).collect::<Vec<_>>())
    })
    .await?;
    info!(count = applied.len(), "migrations applied");
    Ok(applied)
}

/// Revert up to `count` applied migrations, newest first.
///
/// Without `force` nothing is reverted; the returned versions are the ones a
/// forced run would revert.
pub async fn revert_migrations(
    database_url: &str,
    count: usize,
    force: bool,
) -> Result<Vec<String>, SchemaError> {
    let plan = with_blocking_connection(database_url, move |conn| {
        let plan = revert_plan(&applied_versions(conn)?, count);
        if !force {
            return Ok(plan);
        }
        for expected in &plan {
            let reverted = conn
                .revert_last_migration(MIGRATIONS)
                .map_err(|err| SchemaError::migration(err.to_string()))?;
            debug!(version = %reverted, expected = %expected, "migration reverted");
        }
        Ok(plan)
    })
    .await?;
    if force {
        info!(count = plan.len(), "migrations reverted");
    }
    Ok(plan)
}

/// Check the database answers and runs a supported version.
///
/// Returns the numeric server version.
pub async fn ping(database_url: &str) -> Result<i64, SchemaError> {
    let mut conn = AsyncPgConnection::establish(database_url)
        .await
        .map_err(|err| SchemaError::connection(err.to_string()))?;
    let row: ServerVersionRow = tokio::time::timeout(
        PING_TIMEOUT,
        sql_query("SHOW server_version_num").get_result(&mut conn),
    )
    .await
    .map_err(|_| SchemaError::timeout(PING_TIMEOUT))?
    .map_err(|err| SchemaError::query(err.to_string()))?;
    parse_server_version(&row.server_version_num)
}
