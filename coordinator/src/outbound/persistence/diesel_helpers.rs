//! Shared error mapping for the Diesel adapters.
//!
//! Pool failures become connection errors. Diesel failures become query
//! errors, except a closed connection. The database error kind is logged at
//! debug level before it is folded into the port error.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use tracing::debug;

use crate::domain::ports::{ReplicationQueueError, RepositoryStoreError};

use super::pool::PoolError;

/// Extract a readable message from a pool error.
pub fn map_pool_error_message(error: PoolError) -> String {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => message,
    }
}

/// Classification of a Diesel failure.
enum Failure {
    Connection(String),
    Query(String),
}

fn classify(error: DieselError) -> Failure {
    match &error {
        DieselError::DatabaseError(kind, info) => {
            debug!(?kind, message = info.message(), "diesel operation failed");
        }
        _ => debug!(
            error_type = %std::any::type_name_of_val(&error),
            "diesel operation failed"
        ),
    }

    match error {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
            Failure::Connection(info.message().to_owned())
        }
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            Failure::Query(format!("conflicting record: {}", info.message()))
        }
        other => Failure::Query(other.to_string()),
    }
}

impl From<PoolError> for RepositoryStoreError {
    fn from(error: PoolError) -> Self {
        Self::connection(map_pool_error_message(error))
    }
}

impl From<DieselError> for RepositoryStoreError {
    fn from(error: DieselError) -> Self {
        match classify(error) {
            Failure::Connection(message) => Self::connection(message),
            Failure::Query(message) => Self::query(message),
        }
    }
}

impl From<PoolError> for ReplicationQueueError {
    fn from(error: PoolError) -> Self {
        Self::connection(map_pool_error_message(error))
    }
}

impl From<DieselError> for ReplicationQueueError {
    fn from(error: DieselError) -> Self {
        match classify(error) {
            Failure::Connection(message) => Self::connection(message),
            Failure::Query(message) => Self::query(message),
        }
    }
}

/// Convert a count reported by PostgreSQL.
pub fn count_from_db(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

/// Convert event ids for binding as `BIGINT[]`.
pub fn ids_for_db(ids: &[u64]) -> Vec<i64> {
    ids.iter()
        .filter_map(|id| i64::try_from(*id).ok())
        .collect()
}
