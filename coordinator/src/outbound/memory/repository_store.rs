//! In-memory repository state store.
//!
//! Implements every state-store port over plain maps guarded by a single
//! mutex. Suitable for tests and single-process tooling; it provides none of
//! the cross-process guarantees of the PostgreSQL store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use mockable::Clock;

use crate::domain::ports::{
    AssignmentStore, ConsistentStoragesGetter, GenerationStore, ImportStore, PrimaryGetter,
    RepositoryStatusQuery, RepositoryStoreError, ShardPrimaryStore,
};
use crate::domain::{
    AssignmentInputs, ConfiguredStorages, Generation, OutdatedRepository, RepositoryKey,
    RepositorySnapshot, ShardPrimary, assignment_changes, consistent_storages,
    effective_assignments, elect_shard_primary, increment_targets, incremented_generation,
    is_read_only, outdated_repository, replicated_generation, select_assignments,
};

#[derive(Debug, Clone, Default)]
struct RepositoryRecord {
    generation: Generation,
    primary: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    repositories: BTreeMap<RepositoryKey, RepositoryRecord>,
    copies: BTreeMap<RepositoryKey, BTreeMap<String, Generation>>,
    assignments: BTreeMap<RepositoryKey, BTreeSet<String>>,
    virtual_storages: BTreeMap<String, bool>,
    shard_primaries: BTreeMap<String, ShardPrimary>,
}

impl State {
    fn copies(&self, key: &RepositoryKey) -> BTreeMap<String, Generation> {
        self.copies.get(key).cloned().unwrap_or_default()
    }

    fn copy_generation(&self, key: &RepositoryKey, storage: &str) -> Generation {
        self.copies
            .get(key)
            .and_then(|copies| copies.get(storage))
            .copied()
            .unwrap_or(Generation::UNKNOWN)
    }

    fn set_copy(&mut self, key: &RepositoryKey, storage: &str, generation: Generation) {
        self.copies
            .entry(key.clone())
            .or_default()
            .insert(storage.to_owned(), generation);
    }

    fn remove_copy(&mut self, key: &RepositoryKey, storage: &str) -> bool {
        let Some(copies) = self.copies.get_mut(key) else {
            return false;
        };
        let removed = copies.remove(storage).is_some();
        if copies.is_empty() {
            self.copies.remove(key);
        }
        removed
    }

    fn remove_repository(&mut self, key: &RepositoryKey) -> bool {
        self.assignments.remove(key);
        self.repositories.remove(key).is_some()
    }

    fn snapshot(&self, key: &RepositoryKey, record: &RepositoryRecord) -> RepositorySnapshot {
        RepositorySnapshot {
            relative_path: key.relative_path.clone(),
            primary: record.primary.clone(),
            generation: record.generation,
            copies: self.copies(key),
            assignments: self.assignments.get(key).cloned().unwrap_or_default(),
        }
    }

    fn snapshots<'a>(
        &'a self,
        virtual_storage: &'a str,
    ) -> impl Iterator<Item = RepositorySnapshot> + 'a {
        self.repositories
            .iter()
            .filter(move |(key, _)| key.virtual_storage == virtual_storage)
            .map(|(key, record)| self.snapshot(key, record))
    }

    fn writable_primary(&self, virtual_storage: &str) -> Option<&ShardPrimary> {
        self.shard_primaries
            .get(virtual_storage)
            .filter(|primary| !primary.demoted)
    }

    fn report_primary(
        &self,
        virtual_storage: &str,
        snapshot: &RepositorySnapshot,
        use_virtual_storage_primary: bool,
    ) -> Option<String> {
        if use_virtual_storage_primary {
            self.writable_primary(virtual_storage)
                .map(|primary| primary.node_name.clone())
        } else {
            snapshot.primary.clone()
        }
    }
}

/// Repository state store backed by process memory.
pub struct MemoryRepositoryStore {
    configured: ConfiguredStorages,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryRepositoryStore {
    /// Create an empty store for the configured storages.
    pub fn new(configured: ConfiguredStorages, clock: Arc<dyn Clock>) -> Self {
        Self {
            configured,
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, RepositoryStoreError> {
        self.state
            .lock()
            .map_err(|_| RepositoryStoreError::query("in-memory state lock poisoned"))
    }
}

#[async_trait]
impl GenerationStore for MemoryRepositoryStore {
    async fn get_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<Generation, RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        Ok(self.state()?.copy_generation(&key, storage))
    }

    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<(), RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let mut state = self.state()?;

        let previous = state.repositories.get(&key).map(|record| record.generation);
        let next = incremented_generation(previous);
        state.repositories.entry(key.clone()).or_default().generation = next;

        let targets = increment_targets(&state.copies(&key), primary, secondaries);
        for storage in targets {
            state.set_copy(&key, &storage, next);
        }
        Ok(())
    }

    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: Generation,
    ) -> Result<(), RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let mut state = self.state()?;

        let record = state.repositories.entry(key.clone()).or_default();
        record.generation = record.generation.max(generation);
        state.set_copy(&key, storage, generation);
        Ok(())
    }

    async fn get_replicated_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        source: &str,
        target: &str,
    ) -> Result<Generation, RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let state = self.state()?;
        replicated_generation(
            virtual_storage,
            relative_path,
            target,
            state.copy_generation(&key, source),
            state.copy_generation(&key, target),
        )
    }

    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let mut state = self.state()?;

        let removed_repository = state.remove_repository(&key);
        let removed_copy = state.remove_copy(&key, storage);
        if !removed_repository && !removed_copy {
            return Err(RepositoryStoreError::repository_not_found(
                virtual_storage,
                relative_path,
            ));
        }
        Ok(())
    }

    async fn delete_invalid_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let mut state = self.state()?;

        state.remove_copy(&key, storage);
        if !state.copies.contains_key(&key) {
            state.remove_repository(&key);
        }
        Ok(())
    }

    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        new_relative_path: &str,
    ) -> Result<(), RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let new_key = RepositoryKey::new(virtual_storage, new_relative_path);
        let mut state = self.state()?;

        if state.repositories.contains_key(&key) && state.repositories.contains_key(&new_key) {
            return Err(RepositoryStoreError::query(format!(
                "repository {virtual_storage}/{new_relative_path} already exists"
            )));
        }

        let record = state.repositories.remove(&key);
        let moved_repository = record.is_some();
        if let Some(record) = record {
            state.repositories.insert(new_key.clone(), record);
            if let Some(assigned) = state.assignments.remove(&key) {
                state.assignments.insert(new_key.clone(), assigned);
            }
        }

        let generation = state
            .copies
            .get(&key)
            .and_then(|copies| copies.get(storage))
            .copied();
        let moved_copy = generation.is_some();
        if let Some(generation) = generation {
            state.remove_copy(&key, storage);
            state.set_copy(&new_key, storage, generation);
        }

        if !moved_repository && !moved_copy {
            return Err(RepositoryStoreError::repository_not_found(
                virtual_storage,
                relative_path,
            ));
        }
        Ok(())
    }

    async fn repository_exists(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<bool, RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        Ok(self.state()?.repositories.contains_key(&key))
    }

    async fn set_authoritative_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let mut state = self.state()?;

        let Some(record) = state.repositories.get(&key) else {
            return Err(RepositoryStoreError::repository_not_found(
                virtual_storage,
                relative_path,
            ));
        };
        let latest = state
            .copies(&key)
            .values()
            .copied()
            .max()
            .unwrap_or(Generation::UNKNOWN)
            .max(record.generation);
        let authoritative = latest.next();

        state.set_copy(&key, storage, authoritative);
        if let Some(record) = state.repositories.get_mut(&key) {
            record.generation = authoritative;
        }
        Ok(())
    }
}

#[async_trait]
impl ConsistentStoragesGetter for MemoryRepositoryStore {
    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>, RepositoryStoreError> {
        let key = RepositoryKey::new(virtual_storage, relative_path);
        Ok(consistent_storages(&self.state()?.copies(&key)))
    }
}

#[async_trait]
impl AssignmentStore for MemoryRepositoryStore {
    async fn get_host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<String>, RepositoryStoreError> {
        let configured = self.configured.storages(virtual_storage)?;
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let state = self.state()?;
        let assigned = state.assignments.get(&key).cloned().unwrap_or_default();
        Ok(effective_assignments(&assigned, configured))
    }

    async fn set_replication_factor(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        factor: usize,
    ) -> Result<Vec<String>, RepositoryStoreError> {
        let configured = self.configured.storages(virtual_storage)?;
        let key = RepositoryKey::new(virtual_storage, relative_path);
        let mut state = self.state()?;

        let Some(record) = state.repositories.get(&key) else {
            return Err(RepositoryStoreError::repository_not_found(
                virtual_storage,
                relative_path,
            ));
        };
        let current = state.assignments.get(&key).cloned().unwrap_or_default();
        let copies = state.copies(&key);
        let desired = select_assignments(
            AssignmentInputs {
                configured,
                current: &current,
                primary: record.primary.as_deref(),
                copies: &copies,
            },
            factor,
        )?;

        let (added, removed) = assignment_changes(&current, &desired);
        let assigned = state.assignments.entry(key).or_default();
        for storage in removed {
            assigned.remove(&storage);
        }
        assigned.extend(added);
        Ok(desired.into_iter().collect())
    }
}

#[async_trait]
impl RepositoryStatusQuery for MemoryRepositoryStore {
    async fn partially_replicated_repositories(
        &self,
        virtual_storage: &str,
        use_virtual_storage_primary: bool,
    ) -> Result<Vec<OutdatedRepository>, RepositoryStoreError> {
        let configured = self.configured.storages(virtual_storage)?;
        let state = self.state()?;
        Ok(state
            .snapshots(virtual_storage)
            .filter_map(|snapshot| {
                let primary =
                    state.report_primary(virtual_storage, &snapshot, use_virtual_storage_primary);
                outdated_repository(&snapshot, configured, primary.as_deref())
            })
            .collect())
    }

    async fn read_only_counts(
        &self,
        use_virtual_storage_primary: bool,
    ) -> Result<BTreeMap<String, u64>, RepositoryStoreError> {
        let state = self.state()?;
        Ok(self
            .configured
            .virtual_storages()
            .map(|virtual_storage| {
                let count = state
                    .snapshots(virtual_storage)
                    .filter(|snapshot| {
                        let primary = state.report_primary(
                            virtual_storage,
                            snapshot,
                            use_virtual_storage_primary,
                        );
                        is_read_only(snapshot, primary.as_deref())
                    })
                    .count();
                (
                    virtual_storage.to_owned(),
                    u64::try_from(count).unwrap_or(u64::MAX),
                )
            })
            .collect())
    }
}

#[async_trait]
impl ImportStore for MemoryRepositoryStore {
    async fn is_imported(&self, virtual_storage: &str) -> Result<bool, RepositoryStoreError> {
        let mut state = self.state()?;
        Ok(*state
            .virtual_storages
            .entry(virtual_storage.to_owned())
            .or_insert(false))
    }

    async fn import_batch(
        &self,
        virtual_storage: &str,
        primary: &str,
        relative_paths: &[String],
    ) -> Result<Vec<String>, RepositoryStoreError> {
        let mut state = self.state()?;
        let mut inserted = Vec::new();
        for relative_path in relative_paths {
            let key = RepositoryKey::new(virtual_storage, relative_path.as_str());
            if state.repositories.contains_key(&key) {
                continue;
            }
            state.repositories.insert(
                key.clone(),
                RepositoryRecord {
                    generation: Generation::new(0),
                    primary: Some(primary.to_owned()),
                },
            );
            let has_copy = state
                .copies
                .get(&key)
                .is_some_and(|copies| copies.contains_key(primary));
            if !has_copy {
                state.set_copy(&key, primary, Generation::new(0));
            }
            inserted.push(relative_path.clone());
        }
        Ok(inserted)
    }

    async fn mark_imported(&self, virtual_storage: &str) -> Result<(), RepositoryStoreError> {
        self.state()?
            .virtual_storages
            .insert(virtual_storage.to_owned(), true);
        Ok(())
    }
}

#[async_trait]
impl PrimaryGetter for MemoryRepositoryStore {
    async fn get_primary(
        &self,
        virtual_storage: &str,
    ) -> Result<Option<String>, RepositoryStoreError> {
        Ok(self
            .state()?
            .writable_primary(virtual_storage)
            .map(|primary| primary.node_name.clone()))
    }
}

#[async_trait]
impl ShardPrimaryStore for MemoryRepositoryStore {
    async fn get_shard_primary(
        &self,
        virtual_storage: &str,
    ) -> Result<Option<ShardPrimary>, RepositoryStoreError> {
        Ok(self.state()?.shard_primaries.get(virtual_storage).cloned())
    }

    async fn set_shard_primary(
        &self,
        virtual_storage: &str,
        node_name: &str,
        elected_by: &str,
    ) -> Result<ShardPrimary, RepositoryStoreError> {
        let mut state = self.state()?;
        let elected = elect_shard_primary(
            state.shard_primaries.get(virtual_storage),
            virtual_storage,
            node_name,
            elected_by,
            self.clock.utc(),
        );
        state
            .shard_primaries
            .insert(virtual_storage.to_owned(), elected.clone());
        Ok(elected)
    }

    async fn enable_writes(&self, virtual_storage: &str) -> Result<(), RepositoryStoreError> {
        let mut state = self.state()?;
        match state
            .shard_primaries
            .get_mut(virtual_storage)
            .filter(|primary| !primary.demoted)
        {
            Some(primary) => {
                primary.read_only = false;
                Ok(())
            }
            None => Err(RepositoryStoreError::no_primary(virtual_storage)),
        }
    }
}
