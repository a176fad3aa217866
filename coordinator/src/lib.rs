//! Control plane for a cluster of replicated repository storages.
//!
//! The [`domain`] module holds generations, the replication queue model and
//! the services built on its ports; [`outbound`] provides the PostgreSQL,
//! filesystem and in-memory adapters; [`inbound`] is the operator CLI.
#![cfg_attr(not(any(test, doctest)), deny(clippy::unwrap_used))]
#![cfg_attr(not(any(test, doctest)), deny(clippy::expect_used))]

pub mod domain;
pub mod inbound;
pub mod outbound;
#[cfg(test)]
mod test_support;
