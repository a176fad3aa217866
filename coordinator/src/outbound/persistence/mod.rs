//! PostgreSQL persistence adapters using Diesel ORM.
//!
//! This module provides the relational implementations of the repository
//! state and replication queue ports, backed by PostgreSQL via Diesel with
//! async support through `diesel-async` and `bb8` connection pooling.
//!
//! # Architecture
//!
//! - **One store, many roles**: [`DieselRepositoryStore`] implements every
//!   repository-state port; [`DieselReplicationQueue`] implements both queue
//!   ports. Callers depend on the narrow port they need.
//! - **Internal models**: Diesel row structs (`models.rs`) and schema
//!   definitions (`schema.rs`) are internal implementation details, never
//!   exposed to the domain layer.
//! - **Locking lives in SQL**: generation bumps lock copy rows and the queue
//!   claims rows with `FOR UPDATE SKIP LOCKED`, so several coordinators can
//!   share one database.
//! - **Strongly typed errors**: All database errors are mapped to port error
//!   types.
//!
//! # Example
//!
//! ```ignore
//! use coordinator::outbound::persistence::{DbPool, DieselReplicationQueue, PoolConfig};
//!
//! let config = PoolConfig::new("postgres://localhost/coordinator");
//! let pool = DbPool::new(config).await?;
//! let queue = DieselReplicationQueue::new(pool);
//! ```

pub(crate) mod diesel_helpers;
mod diesel_replication_queue;
mod diesel_repository_status;
mod diesel_repository_store;
mod migrations;
mod models;
mod pool;
mod schema;

pub use diesel_replication_queue::DieselReplicationQueue;
pub use diesel_repository_store::DieselRepositoryStore;
pub use migrations::{
    MIGRATIONS, MINIMUM_SERVER_VERSION, MigrationStatus, PING_TIMEOUT, SchemaError,
    known_versions, migration_status, ping, revert_migrations, run_migrations,
};
pub use pool::{DbPool, PoolConfig, PoolError};
