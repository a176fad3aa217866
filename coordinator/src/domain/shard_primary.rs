//! Virtual-storage level primaries.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Primary elected for a virtual storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardPrimary {
    /// Virtual storage the primary serves.
    pub virtual_storage: String,
    /// Storage acting as primary.
    pub node_name: String,
    /// Coordinator that performed the election.
    pub elected_by: String,
    /// Election time.
    pub elected_at: DateTime<Utc>,
    /// Writes are refused until an operator enables them.
    pub read_only: bool,
    /// The primary was demoted and must not be used.
    pub demoted: bool,
    /// Last primary that accepted writes.
    pub previous_writable_primary: Option<String>,
}

impl ShardPrimary {
    /// Whether the primary accepts writes.
    pub fn is_writable(&self) -> bool {
        !self.read_only && !self.demoted
    }

    /// Storage that last accepted writes, including this one if writable.
    pub fn last_writable(&self) -> Option<&str> {
        if self.is_writable() {
            Some(&self.node_name)
        } else {
            self.previous_writable_primary.as_deref()
        }
    }
}

/// Record `node_name` as the primary of `virtual_storage`.
///
/// A failover away from the last writable primary leaves the shard read-only
/// so that an operator can inspect data loss before enabling writes. Electing
/// the first primary, or re-electing the last writable one, keeps it writable.
pub fn elect_shard_primary(
    previous: Option<&ShardPrimary>,
    virtual_storage: &str,
    node_name: &str,
    elected_by: &str,
    elected_at: DateTime<Utc>,
) -> ShardPrimary {
    let last_writable = previous.and_then(ShardPrimary::last_writable);
    ShardPrimary {
        virtual_storage: virtual_storage.to_owned(),
        node_name: node_name.to_owned(),
        elected_by: elected_by.to_owned(),
        elected_at,
        read_only: last_writable.is_some_and(|last| last != node_name),
        demoted: false,
        previous_writable_primary: last_writable.map(str::to_owned),
    }
}
