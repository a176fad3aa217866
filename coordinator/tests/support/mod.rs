//! Shared helpers for coordinator integration tests.
//!
//! Integration tests compile as separate crates, so each suite pulls these
//! helpers in with `mod support;`. Not every suite uses every helper.
#![allow(dead_code)]

pub mod atexit_cleanup;
pub mod cluster_skip;
pub mod embedded_postgres;
pub mod pg_embed;

pub use cluster_skip::handle_cluster_setup_failure;
pub use embedded_postgres::{TestDatabase, provision_template_database};
pub use pg_embed::shared_cluster;

/// `postgres` error text carrying the server message and SQLSTATE.
///
/// The plain `Display` of a database error is just "db error".
pub fn format_postgres_error(error: &postgres::Error) -> String {
    let Some(db) = error.as_db_error() else {
        return error.to_string();
    };
    let mut parts = vec![format!("{} ({})", db.message(), db.code().code())];
    parts.extend(db.detail().map(|detail| format!("detail: {detail}")));
    parts.extend(db.hint().map(|hint| format!("hint: {hint}")));
    parts.join("; ")
}
