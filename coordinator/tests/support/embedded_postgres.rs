//! Per-test databases cloned from a migrated template.
//!
//! The template is named after a hash of `migrations/`, so a schema change
//! provisions a fresh template while unchanged schemas reuse the existing
//! one. Each test then gets its own database cloned from it.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use coordinator::outbound::persistence::{MIGRATIONS, SchemaError};
use diesel::Connection;
use diesel::pg::PgConnection;
use diesel_migrations::MigrationHarness;
use pg_embedded_setup_unpriv::test_support::hash_directory;
use pg_embedded_setup_unpriv::{ClusterHandle, TemporaryDatabase};
use postgres::types::FromSqlOwned;
use postgres::{Client, NoTls};
use uuid::Uuid;

use super::format_postgres_error;

static TEMPLATE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

const TEMPLATE_NAME_PREFIX: &str = "coordinator_template";
const PROVISION_ATTEMPTS: usize = 5;
const PROVISION_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A migrated database dropped with the value.
pub type TestDatabase = TemporaryDatabase;

fn migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

fn template_database_name() -> Result<String, SchemaError> {
    let hash = hash_directory(migrations_dir())
        .map_err(|err| SchemaError::migration(format!("hash migrations: {err}")))?;
    let short_hash = hash.get(..8).unwrap_or(&hash);
    Ok(format!("{TEMPLATE_NAME_PREFIX}_{short_hash}"))
}

/// Create the template database on first use and return its name.
fn ensure_template_database(cluster: &ClusterHandle) -> Result<String, SchemaError> {
    let template_name = template_database_name()?;
    let _lock = TEMPLATE_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|err| err.into_inner());

    let exists = cluster
        .database_exists(template_name.as_str())
        .map_err(|err| SchemaError::query(format!("template check: {err:?}")))?;
    if !exists {
        cluster
            .create_database(template_name.as_str())
            .map_err(|err| SchemaError::query(format!("create template: {err:?}")))?;
        migrate_schema(&cluster.connection().database_url(&template_name))?;
    }
    Ok(template_name)
}

fn provision_attempt(cluster: &ClusterHandle) -> Result<TemporaryDatabase, SchemaError> {
    let template_name = ensure_template_database(cluster)?;
    let db_name = format!("test_{}", Uuid::new_v4().simple());
    cluster
        .temporary_database_from_template(db_name.as_str(), template_name.as_str())
        .map_err(|err| SchemaError::query(format!("create database from template: {err:?}")))
}

/// Provision a temporary database carrying the current schema.
pub fn provision_template_database(
    cluster: &ClusterHandle,
) -> Result<TemporaryDatabase, SchemaError> {
    let mut attempt = 1;
    loop {
        match provision_attempt(cluster) {
            Ok(database) => return Ok(database),
            Err(err) if attempt >= PROVISION_ATTEMPTS => {
                return Err(SchemaError::query(format!(
                    "attempt {attempt}/{PROVISION_ATTEMPTS}: {err}"
                )));
            }
            Err(_) => {
                std::thread::sleep(PROVISION_RETRY_DELAY);
                attempt += 1;
            }
        }
    }
}

/// Create an empty database with no migrations applied and return its URL.
pub fn provision_empty_database(cluster: &ClusterHandle) -> Result<String, SchemaError> {
    let db_name = format!("empty_{}", Uuid::new_v4().simple());
    cluster
        .create_database(db_name.as_str())
        .map_err(|err| SchemaError::query(format!("create database: {err:?}")))?;
    Ok(cluster.connection().database_url(&db_name))
}

/// Apply every pending migration to the database at `url`.
pub fn migrate_schema(url: &str) -> Result<(), SchemaError> {
    let mut conn =
        PgConnection::establish(url).map_err(|err| SchemaError::connection(err.to_string()))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| SchemaError::migration(err.to_string()))?;
    Ok(())
}

/// Run raw SQL against `url`, for fixtures the ports cannot express.
pub fn execute_sql(url: &str, sql: &str) -> Result<(), SchemaError> {
    let mut client = Client::connect(url, NoTls)
        .map_err(|err| SchemaError::connection(format_postgres_error(&err)))?;
    client
        .batch_execute(sql)
        .map_err(|err| SchemaError::query(format_postgres_error(&err)))
}

/// First column of the single row returned by `sql`.
pub fn query_scalar<T: FromSqlOwned>(url: &str, sql: &str) -> Result<T, SchemaError> {
    let mut client = Client::connect(url, NoTls)
        .map_err(|err| SchemaError::connection(format_postgres_error(&err)))?;
    let row = client
        .query_one(sql, &[])
        .map_err(|err| SchemaError::query(format_postgres_error(&err)))?;
    row.try_get::<_, T>(0)
        .map_err(|err| SchemaError::query(format_postgres_error(&err)))
}
