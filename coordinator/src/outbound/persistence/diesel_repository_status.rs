//! Status reporting and virtual-storage primaries for [`DieselRepositoryStore`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt as _;
use diesel_async::{AsyncConnection as _, AsyncPgConnection, RunQueryDsl};
use tracing::info;

use crate::domain::ports::{
    PrimaryGetter, RepositoryStatusQuery, RepositoryStoreError, ShardPrimaryStore,
};
use crate::domain::{
    Generation, OutdatedRepository, RepositorySnapshot, ShardPrimary, elect_shard_primary,
    is_read_only, outdated_repository,
};

use super::diesel_repository_store::DieselRepositoryStore;
use super::models::{RepositoryRow, ShardPrimaryRow, StorageRepositoryRow};
use super::schema::{repositories, repository_assignments, shard_primaries, storage_repositories};

/// Load every repository of a virtual storage with its copies and assignments.
async fn load_snapshots(
    conn: &mut AsyncPgConnection,
    virtual_storage: &str,
) -> Result<Vec<RepositorySnapshot>, diesel::result::Error> {
    let repository_rows: Vec<RepositoryRow> = repositories::table
        .filter(repositories::virtual_storage.eq(virtual_storage))
        .select(RepositoryRow::as_select())
        .order_by(repositories::relative_path)
        .load(conn)
        .await?;
    let copy_rows: Vec<StorageRepositoryRow> = storage_repositories::table
        .filter(storage_repositories::virtual_storage.eq(virtual_storage))
        .select(StorageRepositoryRow::as_select())
        .load(conn)
        .await?;
    let assignment_rows: Vec<(String, String)> = repository_assignments::table
        .filter(repository_assignments::virtual_storage.eq(virtual_storage))
        .select((
            repository_assignments::relative_path,
            repository_assignments::storage,
        ))
        .load(conn)
        .await?;

    let mut snapshots: BTreeMap<String, RepositorySnapshot> = repository_rows
        .into_iter()
        .map(|row| {
            let snapshot = RepositorySnapshot {
                relative_path: row.relative_path.clone(),
                primary: row.primary,
                generation: Generation::from_optional(row.generation),
                copies: BTreeMap::new(),
                assignments: BTreeSet::new(),
            };
            (row.relative_path, snapshot)
        })
        .collect();
    for row in copy_rows {
        let generation = row.generation();
        if let Some(snapshot) = snapshots.get_mut(&row.relative_path) {
            snapshot.copies.insert(row.storage, generation);
        }
    }
    for (relative_path, storage) in assignment_rows {
        if let Some(snapshot) = snapshots.get_mut(&relative_path) {
            snapshot.assignments.insert(storage);
        }
    }
    Ok(snapshots.into_values().collect())
}

async fn writable_primary(
    conn: &mut AsyncPgConnection,
    virtual_storage: &str,
) -> Result<Option<String>, diesel::result::Error> {
    shard_primaries::table
        .filter(shard_primaries::shard_name.eq(virtual_storage))
        .filter(shard_primaries::demoted.eq(false))
        .select(shard_primaries::node_name)
        .first(conn)
        .await
        .optional()
}

/// Primary to report for `snapshot`.
fn report_primary(
    snapshot: &RepositorySnapshot,
    shard_primary: Option<&String>,
    use_virtual_storage_primary: bool,
) -> Option<String> {
    if use_virtual_storage_primary {
        shard_primary.cloned()
    } else {
        snapshot.primary.clone()
    }
}

#[async_trait]
impl RepositoryStatusQuery for DieselRepositoryStore {
    async fn partially_replicated_repositories(
        &self,
        virtual_storage: &str,
        use_virtual_storage_primary: bool,
    ) -> Result<Vec<OutdatedRepository>, RepositoryStoreError> {
        let configured = self.configured.storages(virtual_storage)?;
        let mut conn = self.pool.get().await?;

        let shard_primary = writable_primary(&mut conn, virtual_storage).await?;
        let snapshots = load_snapshots(&mut conn, virtual_storage).await?;

        Ok(snapshots
            .iter()
            .filter_map(|snapshot| {
                let primary =
                    report_primary(snapshot, shard_primary.as_ref(), use_virtual_storage_primary);
                outdated_repository(snapshot, configured, primary.as_deref())
            })
            .collect())
    }

    async fn read_only_counts(
        &self,
        use_virtual_storage_primary: bool,
    ) -> Result<BTreeMap<String, u64>, RepositoryStoreError> {
        let mut conn = self.pool.get().await?;
        let mut counts = BTreeMap::new();

        for virtual_storage in self.configured.virtual_storages() {
            let shard_primary = writable_primary(&mut conn, virtual_storage).await?;
            let snapshots = load_snapshots(&mut conn, virtual_storage).await?;
            let read_only = snapshots
                .iter()
                .filter(|snapshot| {
                    let primary = report_primary(
                        snapshot,
                        shard_primary.as_ref(),
                        use_virtual_storage_primary,
                    );
                    is_read_only(snapshot, primary.as_deref())
                })
                .count();
            counts.insert(
                virtual_storage.to_owned(),
                u64::try_from(read_only).unwrap_or(u64::MAX),
            );
        }
        Ok(counts)
    }
}

#[async_trait]
impl PrimaryGetter for DieselRepositoryStore {
    async fn get_primary(
        &self,
        virtual_storage: &str,
    ) -> Result<Option<String>, RepositoryStoreError> {
        let mut conn = self.pool.get().await?;
        Ok(writable_primary(&mut conn, virtual_storage).await?)
    }
}

#[async_trait]
impl ShardPrimaryStore for DieselRepositoryStore {
    async fn get_shard_primary(
        &self,
        virtual_storage: &str,
    ) -> Result<Option<ShardPrimary>, RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        let row: Option<ShardPrimaryRow> = shard_primaries::table
            .filter(shard_primaries::shard_name.eq(virtual_storage))
            .select(ShardPrimaryRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(ShardPrimary::from))
    }

    async fn set_shard_primary(
        &self,
        virtual_storage: &str,
        node_name: &str,
        elected_by: &str,
    ) -> Result<ShardPrimary, RepositoryStoreError> {
        let elected_at = self.clock.utc();
        let mut conn = self.pool.get().await?;

        let elected = conn
            .transaction::<_, RepositoryStoreError, _>(|conn| {
                async move {
                    let previous: Option<ShardPrimaryRow> = shard_primaries::table
                        .filter(shard_primaries::shard_name.eq(virtual_storage))
                        .select(ShardPrimaryRow::as_select())
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;
                    let previous = previous.map(ShardPrimary::from);

                    let elected = elect_shard_primary(
                        previous.as_ref(),
                        virtual_storage,
                        node_name,
                        elected_by,
                        elected_at,
                    );
                    let row = ShardPrimaryRow::from(elected.clone());
                    diesel::insert_into(shard_primaries::table)
                        .values(&row)
                        .on_conflict(shard_primaries::shard_name)
                        .do_update()
                        .set(&row)
                        .execute(conn)
                        .await?;
                    Ok(elected)
                }
                .scope_boxed()
            })
            .await?;

        info!(
            virtual_storage,
            node = node_name,
            read_only = elected.read_only,
            "shard primary elected"
        );
        Ok(elected)
    }

    async fn enable_writes(&self, virtual_storage: &str) -> Result<(), RepositoryStoreError> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            shard_primaries::table
                .filter(shard_primaries::shard_name.eq(virtual_storage))
                .filter(shard_primaries::demoted.eq(false)),
        )
        .set(shard_primaries::read_only.eq(false))
        .execute(&mut conn)
        .await?;

        if updated == 0 {
            return Err(RepositoryStoreError::no_primary(virtual_storage));
        }
        info!(virtual_storage, "writes enabled");
        Ok(())
    }
}
