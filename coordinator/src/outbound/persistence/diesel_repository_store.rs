//! PostgreSQL-backed repository state store using Diesel ORM.
//!
//! The adapter loads the rows a decision depends on, locking them where a
//! concurrent writer could interfere, and delegates the decision itself to
//! the domain rules shared with the in-memory store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Text};
use diesel_async::scoped_futures::ScopedFutureExt as _;
use diesel_async::{AsyncConnection as _, AsyncPgConnection, RunQueryDsl};
use mockable::Clock;
use tracing::debug;

use crate::domain::ports::{
    AssignmentStore, ConsistentStoragesGetter, GenerationStore, ImportStore, RepositoryStoreError,
};
use crate::domain::{
    AssignmentInputs, ConfiguredStorages, Generation, assignment_changes, consistent_storages,
    effective_assignments, increment_targets, replicated_generation, select_assignments,
};

use super::models::{GenerationRow, ImportedRow, RelativePathRow, StorageRepositoryRow};
use super::pool::DbPool;
use super::schema::{repositories, repository_assignments, storage_repositories, virtual_storages};

/// Diesel-backed implementation of the repository state store ports.
#[derive(Clone)]
pub struct DieselRepositoryStore {
    pub(super) pool: DbPool,
    pub(super) configured: Arc<ConfiguredStorages>,
    pub(super) clock: Arc<dyn Clock>,
}

impl DieselRepositoryStore {
    /// Create a store over `pool` for the configured storages.
    pub fn new(pool: DbPool, configured: ConfiguredStorages, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            configured: Arc::new(configured),
            clock,
        }
    }
}

const UPSERT_REPOSITORY_GENERATION_SQL: &str = r#"
INSERT INTO repositories (virtual_storage, relative_path, generation)
VALUES ($1, $2, 0)
ON CONFLICT (virtual_storage, relative_path)
DO UPDATE SET generation = COALESCE(repositories.generation, -1) + 1
RETURNING generation
"#;

const SET_COPY_GENERATIONS_SQL: &str = r#"
INSERT INTO storage_repositories (virtual_storage, relative_path, storage, generation)
SELECT $1, $2, UNNEST($3::TEXT[]), $4
ON CONFLICT (virtual_storage, relative_path, storage)
DO UPDATE SET generation = EXCLUDED.generation
"#;

const RAISE_REPOSITORY_GENERATION_SQL: &str = r#"
INSERT INTO repositories (virtual_storage, relative_path, generation)
VALUES ($1, $2, $3)
ON CONFLICT (virtual_storage, relative_path)
DO UPDATE SET generation = GREATEST(COALESCE(repositories.generation, -1), EXCLUDED.generation)
"#;

const DELETE_ORPHANED_REPOSITORY_SQL: &str = r#"
DELETE FROM repositories
WHERE virtual_storage = $1
AND relative_path = $2
AND NOT EXISTS (
    SELECT 1 FROM storage_repositories
    WHERE virtual_storage = $1
    AND relative_path = $2
)
"#;

const IS_IMPORTED_SQL: &str = r#"
WITH inserted AS (
    INSERT INTO virtual_storages (virtual_storage)
    VALUES ($1)
    ON CONFLICT (virtual_storage) DO NOTHING
    RETURNING repositories_imported
)
SELECT repositories_imported FROM inserted
UNION ALL
SELECT repositories_imported FROM virtual_storages WHERE virtual_storage = $1
"#;

const IMPORT_BATCH_SQL: &str = r#"
WITH imported AS (
    INSERT INTO repositories (virtual_storage, relative_path, generation, "primary")
    SELECT $1, UNNEST($3::TEXT[]), 0, $2
    ON CONFLICT (virtual_storage, relative_path) DO NOTHING
    RETURNING relative_path
), copies AS (
    INSERT INTO storage_repositories (virtual_storage, relative_path, storage, generation)
    SELECT $1, relative_path, $2, 0 FROM imported
    ON CONFLICT (virtual_storage, relative_path, storage) DO NOTHING
)
SELECT relative_path FROM imported
"#;

/// Load the generation of every copy of a repository.
pub(super) async fn load_copies(
    conn: &mut AsyncPgConnection,
    virtual_storage: &str,
    relative_path: &str,
) -> Result<BTreeMap<String, Generation>, diesel::result::Error> {
    let rows: Vec<StorageRepositoryRow> = storage_repositories::table
        .filter(storage_repositories::virtual_storage.eq(virtual_storage))
        .filter(storage_repositories::relative_path.eq(relative_path))
        .select(StorageRepositoryRow::as_select())
        .load(conn)
        .await?;
    Ok(copies_by_storage(rows))
}

/// Load and lock the copies held by `storages`.
async fn lock_copies(
    conn: &mut AsyncPgConnection,
    virtual_storage: &str,
    relative_path: &str,
    storages: &[String],
) -> Result<BTreeMap<String, Generation>, diesel::result::Error> {
    let rows: Vec<StorageRepositoryRow> = storage_repositories::table
        .filter(storage_repositories::virtual_storage.eq(virtual_storage))
        .filter(storage_repositories::relative_path.eq(relative_path))
        .filter(storage_repositories::storage.eq_any(storages))
        .select(StorageRepositoryRow::as_select())
        .for_update()
        .load(conn)
        .await?;
    Ok(copies_by_storage(rows))
}

fn copies_by_storage(rows: Vec<StorageRepositoryRow>) -> BTreeMap<String, Generation> {
    rows.into_iter()
        .map(|row| {
            let generation = row.generation();
            (row.storage, generation)
        })
        .collect()
}

async fn load_assignments(
    conn: &mut AsyncPgConnection,
    virtual_storage: &str,
    relative_path: &str,
) -> Result<BTreeSet<String>, diesel::result::Error> {
    let rows: Vec<String> = repository_assignments::table
        .filter(repository_assignments::virtual_storage.eq(virtual_storage))
        .filter(repository_assignments::relative_path.eq(relative_path))
        .select(repository_assignments::storage)
        .load(conn)
        .await?;
    Ok(rows.into_iter().collect())
}

#[async_trait]
impl GenerationStore for DieselRepositoryStore {
    async fn get_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<Generation, RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        let generation: Option<i64> = storage_repositories::table
            .filter(storage_repositories::virtual_storage.eq(virtual_storage))
            .filter(storage_repositories::relative_path.eq(relative_path))
            .filter(storage_repositories::storage.eq(storage))
            .select(storage_repositories::generation)
            .first(&mut conn)
            .await
            .optional()?;

        Ok(Generation::from_optional(generation))
    }

    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<(), RepositoryStoreError> {
        let mut involved = Vec::with_capacity(secondaries.len() + 1);
        involved.push(primary.to_owned());
        involved.extend(secondaries.iter().cloned());
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, RepositoryStoreError, _>(|conn| {
            async move {
                // Lock order: repository row, then copy rows.
                let upserted: GenerationRow = sql_query(UPSERT_REPOSITORY_GENERATION_SQL)
                    .bind::<Text, _>(virtual_storage)
                    .bind::<Text, _>(relative_path)
                    .get_result(conn)
                    .await?;
                let next = Generation::from_optional(upserted.generation);

                let copies = lock_copies(conn, virtual_storage, relative_path, &involved).await?;

                let targets: Vec<String> = increment_targets(&copies, primary, secondaries)
                    .into_iter()
                    .collect();
                sql_query(SET_COPY_GENERATIONS_SQL)
                    .bind::<Text, _>(virtual_storage)
                    .bind::<Text, _>(relative_path)
                    .bind::<Array<Text>, _>(&targets)
                    .bind::<BigInt, _>(next.as_i64())
                    .execute(conn)
                    .await?;

                debug!(
                    virtual_storage,
                    relative_path,
                    generation = %next,
                    storages = ?targets,
                    "generation incremented"
                );
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: Generation,
    ) -> Result<(), RepositoryStoreError> {
        let storages = vec![storage.to_owned()];
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, RepositoryStoreError, _>(|conn| {
            async move {
                sql_query(RAISE_REPOSITORY_GENERATION_SQL)
                    .bind::<Text, _>(virtual_storage)
                    .bind::<Text, _>(relative_path)
                    .bind::<BigInt, _>(generation.as_i64())
                    .execute(conn)
                    .await?;
                sql_query(SET_COPY_GENERATIONS_SQL)
                    .bind::<Text, _>(virtual_storage)
                    .bind::<Text, _>(relative_path)
                    .bind::<Array<Text>, _>(&storages)
                    .bind::<BigInt, _>(generation.as_i64())
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn get_replicated_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        source: &str,
        target: &str,
    ) -> Result<Generation, RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        let copies = load_copies(&mut conn, virtual_storage, relative_path).await?;
        let generation_of =
            |storage: &str| copies.get(storage).copied().unwrap_or(Generation::UNKNOWN);

        replicated_generation(
            virtual_storage,
            relative_path,
            target,
            generation_of(source),
            generation_of(target),
        )
    }

    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, RepositoryStoreError, _>(|conn| {
            async move {
                let repositories_deleted = diesel::delete(
                    repositories::table
                        .filter(repositories::virtual_storage.eq(virtual_storage))
                        .filter(repositories::relative_path.eq(relative_path)),
                )
                .execute(conn)
                .await?;
                let copies_deleted = diesel::delete(
                    storage_repositories::table
                        .filter(storage_repositories::virtual_storage.eq(virtual_storage))
                        .filter(storage_repositories::relative_path.eq(relative_path))
                        .filter(storage_repositories::storage.eq(storage)),
                )
                .execute(conn)
                .await?;

                if repositories_deleted == 0 && copies_deleted == 0 {
                    return Err(RepositoryStoreError::repository_not_found(
                        virtual_storage,
                        relative_path,
                    ));
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn delete_invalid_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, RepositoryStoreError, _>(|conn| {
            async move {
                repositories::table
                    .filter(repositories::virtual_storage.eq(virtual_storage))
                    .filter(repositories::relative_path.eq(relative_path))
                    .select(repositories::relative_path)
                    .for_update()
                    .load::<String>(conn)
                    .await?;
                diesel::delete(
                    storage_repositories::table
                        .filter(storage_repositories::virtual_storage.eq(virtual_storage))
                        .filter(storage_repositories::relative_path.eq(relative_path))
                        .filter(storage_repositories::storage.eq(storage)),
                )
                .execute(conn)
                .await?;
                sql_query(DELETE_ORPHANED_REPOSITORY_SQL)
                    .bind::<Text, _>(virtual_storage)
                    .bind::<Text, _>(relative_path)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        new_relative_path: &str,
    ) -> Result<(), RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, RepositoryStoreError, _>(|conn| {
            async move {
                let repositories_renamed = diesel::update(
                    repositories::table
                        .filter(repositories::virtual_storage.eq(virtual_storage))
                        .filter(repositories::relative_path.eq(relative_path)),
                )
                .set(repositories::relative_path.eq(new_relative_path))
                .execute(conn)
                .await?;
                let copies_renamed = diesel::update(
                    storage_repositories::table
                        .filter(storage_repositories::virtual_storage.eq(virtual_storage))
                        .filter(storage_repositories::relative_path.eq(relative_path))
                        .filter(storage_repositories::storage.eq(storage)),
                )
                .set(storage_repositories::relative_path.eq(new_relative_path))
                .execute(conn)
                .await?;

                if repositories_renamed == 0 && copies_renamed == 0 {
                    return Err(RepositoryStoreError::repository_not_found(
                        virtual_storage,
                        relative_path,
                    ));
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn repository_exists(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<bool, RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        let exists: bool = diesel::select(diesel::dsl::exists(
            repositories::table
                .filter(repositories::virtual_storage.eq(virtual_storage))
                .filter(repositories::relative_path.eq(relative_path)),
        ))
        .get_result(&mut conn)
        .await?;

        Ok(exists)
    }

    async fn set_authoritative_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError> {
        let storages = vec![storage.to_owned()];
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, RepositoryStoreError, _>(|conn| {
            async move {
                let repository_generation: Option<Option<i64>> = repositories::table
                    .filter(repositories::virtual_storage.eq(virtual_storage))
                    .filter(repositories::relative_path.eq(relative_path))
                    .select(repositories::generation)
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;
                let Some(repository_generation) = repository_generation else {
                    return Err(RepositoryStoreError::repository_not_found(
                        virtual_storage,
                        relative_path,
                    ));
                };

                let copies = load_copies(conn, virtual_storage, relative_path).await?;
                let latest = copies
                    .values()
                    .copied()
                    .max()
                    .unwrap_or(Generation::UNKNOWN)
                    .max(Generation::from_optional(repository_generation));
                let authoritative = latest.next();

                sql_query(SET_COPY_GENERATIONS_SQL)
                    .bind::<Text, _>(virtual_storage)
                    .bind::<Text, _>(relative_path)
                    .bind::<Array<Text>, _>(&storages)
                    .bind::<BigInt, _>(authoritative.as_i64())
                    .execute(conn)
                    .await?;
                diesel::update(
                    repositories::table
                        .filter(repositories::virtual_storage.eq(virtual_storage))
                        .filter(repositories::relative_path.eq(relative_path)),
                )
                .set(repositories::generation.eq(Some(authoritative.as_i64())))
                .execute(conn)
                .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }
}

#[async_trait]
impl ConsistentStoragesGetter for DieselRepositoryStore {
    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>, RepositoryStoreError> {
        let mut conn = self.pool.get().await?;
        let copies = load_copies(&mut conn, virtual_storage, relative_path).await?;
        Ok(consistent_storages(&copies))
    }
}

#[async_trait]
impl AssignmentStore for DieselRepositoryStore {
    async fn get_host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<String>, RepositoryStoreError> {
        let configured = self.configured.storages(virtual_storage)?;
        let mut conn = self.pool.get().await?;

        let assigned = load_assignments(&mut conn, virtual_storage, relative_path).await?;
        Ok(effective_assignments(&assigned, configured))
    }

    async fn set_replication_factor(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        factor: usize,
    ) -> Result<Vec<String>, RepositoryStoreError> {
        let configured = self.configured.storages(virtual_storage)?;
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, RepositoryStoreError, _>(|conn| {
            async move {
                let primary: Option<Option<String>> = repositories::table
                    .filter(repositories::virtual_storage.eq(virtual_storage))
                    .filter(repositories::relative_path.eq(relative_path))
                    .select(repositories::primary)
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;
                let Some(primary) = primary else {
                    return Err(RepositoryStoreError::repository_not_found(
                        virtual_storage,
                        relative_path,
                    ));
                };

                let current = load_assignments(conn, virtual_storage, relative_path).await?;
                let copies = load_copies(conn, virtual_storage, relative_path).await?;
                let desired = select_assignments(
                    AssignmentInputs {
                        configured,
                        current: &current,
                        primary: primary.as_deref(),
                        copies: &copies,
                    },
                    factor,
                )?;

                let (added, removed) = assignment_changes(&current, &desired);
                if !removed.is_empty() {
                    diesel::delete(
                        repository_assignments::table
                            .filter(repository_assignments::virtual_storage.eq(virtual_storage))
                            .filter(repository_assignments::relative_path.eq(relative_path))
                            .filter(repository_assignments::storage.eq_any(&removed)),
                    )
                    .execute(conn)
                    .await?;
                }
                if !added.is_empty() {
                    let rows: Vec<_> = added
                        .iter()
                        .map(|storage| {
                            (
                                repository_assignments::virtual_storage.eq(virtual_storage),
                                repository_assignments::relative_path.eq(relative_path),
                                repository_assignments::storage.eq(storage),
                            )
                        })
                        .collect();
                    diesel::insert_into(repository_assignments::table)
                        .values(&rows)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;
                }

                Ok(desired.into_iter().collect())
            }
            .scope_boxed()
        })
        .await
    }
}

#[async_trait]
impl ImportStore for DieselRepositoryStore {
    async fn is_imported(&self, virtual_storage: &str) -> Result<bool, RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        let row: ImportedRow = sql_query(IS_IMPORTED_SQL)
            .bind::<Text, _>(virtual_storage)
            .get_result(&mut conn)
            .await?;
        Ok(row.repositories_imported)
    }

    async fn import_batch(
        &self,
        virtual_storage: &str,
        primary: &str,
        relative_paths: &[String],
    ) -> Result<Vec<String>, RepositoryStoreError> {
        if relative_paths.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;

        let rows: Vec<RelativePathRow> = sql_query(IMPORT_BATCH_SQL)
            .bind::<Text, _>(virtual_storage)
            .bind::<Text, _>(primary)
            .bind::<Array<Text>, _>(relative_paths)
            .load(&mut conn)
            .await?;
        let inserted: BTreeSet<String> = rows.into_iter().map(|row| row.relative_path).collect();

        Ok(relative_paths
            .iter()
            .filter(|path| inserted.contains(path.as_str()))
            .cloned()
            .collect())
    }

    async fn mark_imported(&self, virtual_storage: &str) -> Result<(), RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(virtual_storages::table)
            .values((
                virtual_storages::virtual_storage.eq(virtual_storage),
                virtual_storages::repositories_imported.eq(true),
            ))
            .on_conflict(virtual_storages::virtual_storage)
            .do_update()
            .set(virtual_storages::repositories_imported.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
