//! Diesel table definitions for the PostgreSQL schema.
//!
//! These definitions must match the migrations under `migrations/` exactly.
//! The `diesel print-schema` command can regenerate them from a live
//! database.

diesel::table! {
    /// Import progress per virtual storage.
    virtual_storages (virtual_storage) {
        virtual_storage -> Text,
        /// Set once the primary's repositories were imported.
        repositories_imported -> Bool,
    }
}

diesel::table! {
    /// One row per logical repository.
    repositories (virtual_storage, relative_path) {
        virtual_storage -> Text,
        relative_path -> Text,
        /// Latest generation of the repository; `NULL` when never written.
        generation -> Nullable<Int8>,
        /// Per-repository primary storage.
        primary -> Nullable<Text>,
    }
}

diesel::table! {
    /// One row per physical copy of a repository.
    storage_repositories (virtual_storage, relative_path, storage) {
        virtual_storage -> Text,
        relative_path -> Text,
        storage -> Text,
        generation -> Int8,
    }
}

diesel::table! {
    /// Storages explicitly assigned to host a repository.
    repository_assignments (virtual_storage, relative_path, storage) {
        virtual_storage -> Text,
        relative_path -> Text,
        storage -> Text,
    }
}

diesel::table! {
    /// Elected primary per virtual storage.
    shard_primaries (shard_name) {
        shard_name -> Text,
        node_name -> Text,
        elected_by -> Text,
        elected_at -> Timestamptz,
        read_only -> Bool,
        demoted -> Bool,
        previous_writable_primary -> Nullable<Text>,
    }
}

diesel::table! {
    /// Advisory lock per target copy.
    replication_queue_lock (id) {
        id -> Text,
        acquired -> Bool,
    }
}

diesel::table! {
    /// Replication events.
    replication_queue (id) {
        id -> Int8,
        state -> Text,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
        attempt -> Int4,
        lock_id -> Text,
        job -> Jsonb,
    }
}

diesel::table! {
    /// In-flight events and their liveness.
    replication_queue_job_lock (job_id, lock_id) {
        job_id -> Int8,
        lock_id -> Text,
        triggered_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    repositories,
    storage_repositories,
    repository_assignments,
    replication_queue,
    replication_queue_lock,
    replication_queue_job_lock,
);
