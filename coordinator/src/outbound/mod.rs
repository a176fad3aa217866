//! Outbound adapters implementing domain ports for external infrastructure.
//!
//! This module follows the hexagonal architecture pattern, providing concrete
//! implementations of domain port traits:
//!
//! - **memory**: mutex-guarded in-process store and queue for tests and
//!   single-node tooling
//! - **persistence**: PostgreSQL-backed store and queue using Diesel ORM
//! - **notifications**: `LISTEN`/`NOTIFY` connections via sqlx
//! - **storage**: storage nodes mounted on the local filesystem
//! - **metrics**: Prometheus-backed metrics exporters (feature-gated)
//!
//! Adapters are thin translators that convert between domain types and
//! infrastructure-specific representations. Shared rules live in the domain.

pub mod memory;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod notifications;
pub mod persistence;
pub mod storage;
