//! Domain primitives, rules and services of the replication control plane.
//!
//! Purpose: model repository generations, replication jobs and their queue
//! lifecycle, and host the services built on the ports in [`ports`]. Pure
//! rules shared by every store adapter live here so the in-memory and
//! PostgreSQL adapters agree on semantics.
//!
//! Public surface:
//! - Generation: per-copy version number with an unknown sentinel.
//! - ReplicationJob / ReplicationEvent / JobState: queue payload and lifecycle.
//! - OutdatedRepository: the data-loss report row.
//! - ConsistencyChecker, RepositoryImporter, ChangeListener: services.

pub mod assignments;
pub mod change_listener;
pub mod consistency_check;
pub mod dataloss;
pub mod generation;
pub mod importer;
pub mod job_maintenance;
pub mod notification_payload;
pub mod ports;
pub mod replication;
pub mod repository_state;
pub mod shard_primary;
pub mod storage_provider;

pub use self::assignments::{
    AssignmentInputs, ConfiguredStorages, assignment_changes, effective_assignments,
    select_assignments, validate_replication_factor,
};
pub use self::change_listener::{ChangeListener, ListenerConfig, ListenerError};
pub use self::consistency_check::{
    ConsistencyCheckError, ConsistencyCheckRequest, ConsistencyCheckResponse, ConsistencyChecker,
};
pub use self::dataloss::{OutdatedRepository, OutdatedStorage, is_read_only, outdated_repository};
pub use self::generation::Generation;
pub use self::importer::{
    DEFAULT_BATCH_INTERVAL, IMPORT_BATCH_SIZE, ImportError, ImportResult, RepositoryImporter,
};
pub use self::job_maintenance::{
    DEFAULT_HEALTH_UPDATE_PERIOD, DEFAULT_STALE_THRESHOLD, StaleJobReclaimer, run_health_updates,
};
pub use self::notification_payload::{ChangedPaths, PayloadError, parse_changed_paths};
pub use self::replication::{
    ChangeType, DEFAULT_ATTEMPTS, JobState, LockId, Params, ParseJobStateError,
    RENAME_PATH_PARAM, ReplicationEvent, ReplicationJob, RepositoryKey,
};
pub use self::repository_state::{
    RepositorySnapshot, consistent_storages, increment_targets, incremented_generation,
    replicated_generation,
};
pub use self::shard_primary::{ShardPrimary, elect_shard_primary};
pub use self::storage_provider::{
    CachingStoragesGetter, DEFAULT_CACHE_CAPACITY, DirectStorageProvider, StorageProvider,
};
