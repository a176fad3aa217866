//! Read routing: which copies of a repository may serve a read.
//!
//! [`DirectStorageProvider`] asks a [`ConsistentStoragesGetter`] and falls back
//! to the primary alone when the lookup fails. [`CachingStoragesGetter`]
//! memoises lookups and is kept fresh by the change listener.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use lru::LruCache;
use tracing::{debug, warn};

use crate::domain::notification_payload::parse_changed_paths;
use crate::domain::ports::{
    ConsistentStoragesGetter, ListenerHandler, Notification, NotificationError,
    RepositoryStoreError, StorageProviderMetrics,
};

/// Default number of repositories kept by [`CachingStoragesGetter`].
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Chooses the storages that may serve a read.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Storages safe to read `relative_path` from; never empty.
    async fn storages_for_read(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
    ) -> BTreeSet<String>;
}

/// Storage provider reading consistent storages from a getter.
pub struct DirectStorageProvider<G, M> {
    getter: Arc<G>,
    metrics: Arc<M>,
}

impl<G, M> DirectStorageProvider<G, M> {
    /// Create a provider over `getter`, recording fallbacks in `metrics`.
    pub fn new(getter: Arc<G>, metrics: Arc<M>) -> Self {
        Self { getter, metrics }
    }
}

#[async_trait]
impl<G, M> StorageProvider for DirectStorageProvider<G, M>
where
    G: ConsistentStoragesGetter,
    M: StorageProviderMetrics,
{
    async fn storages_for_read(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
    ) -> BTreeSet<String> {
        match self
            .getter
            .get_consistent_storages(virtual_storage, relative_path)
            .await
        {
            Ok(mut storages) => {
                storages.insert(primary.to_owned());
                storages
            }
            Err(err) => {
                warn!(
                    error = %err,
                    virtual_storage,
                    relative_path,
                    "consistent storages lookup failed; reading from primary only"
                );
                if let Err(metrics_err) = self.metrics.record_lookup_failure(virtual_storage).await
                {
                    warn!(error = %metrics_err, "failed to record storage provider fallback");
                }
                BTreeSet::from([primary.to_owned()])
            }
        }
    }
}

type CacheKey = (String, String);

/// Cached entries and the count of invalidations seen so far.
struct CacheState {
    entries: LruCache<CacheKey, BTreeSet<String>>,
    epoch: u64,
}

impl CacheState {
    fn invalidate_all(&mut self) {
        self.entries.clear();
        self.epoch += 1;
    }
}

enum Lookup {
    Hit(BTreeSet<String>),
    /// Not cached; `epoch` must still be current when the result is stored.
    Miss { epoch: u64 },
    Bypass,
}

/// Consistent-storages getter memoising results per repository.
///
/// The cache starts disabled and is enabled by the listener's `connected`
/// event. A disconnect clears and disables it, since notifications may have
/// been missed. When full, the least recently used repository is dropped.
///
/// A lookup that raced an invalidation is returned to its caller but not
/// cached.
pub struct CachingStoragesGetter<G> {
    inner: Arc<G>,
    enabled: AtomicBool,
    state: Mutex<Option<CacheState>>,
}

impl<G> CachingStoragesGetter<G> {
    /// Wrap `inner` with a cache of at most `capacity` repositories. A zero
    /// capacity never caches.
    pub fn new(inner: Arc<G>, capacity: usize) -> Self {
        let state = NonZeroUsize::new(capacity).map(|capacity| CacheState {
            entries: LruCache::new(capacity),
            epoch: 0,
        });
        Self {
            inner,
            enabled: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    /// Whether lookups are currently served from the cache.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn state(&self) -> MutexGuard<'_, Option<CacheState>> {
        // A panic while holding the lock leaves a cache that is still valid.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lookup(&self, virtual_storage: &str, relative_path: &str) -> Lookup {
        if !self.is_enabled() {
            return Lookup::Bypass;
        }
        let mut guard = self.state();
        let Some(state) = guard.as_mut() else {
            return Lookup::Bypass;
        };
        let key = (virtual_storage.to_owned(), relative_path.to_owned());
        match state.entries.get(&key) {
            Some(storages) => Lookup::Hit(storages.clone()),
            None => Lookup::Miss { epoch: state.epoch },
        }
    }

    fn store(
        &self,
        epoch: u64,
        virtual_storage: &str,
        relative_path: &str,
        storages: &BTreeSet<String>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut guard = self.state();
        let Some(state) = guard.as_mut() else {
            return;
        };
        if state.epoch != epoch {
            debug!(virtual_storage, relative_path, "skipping cache fill after invalidation");
            return;
        }
        state.entries.put(
            (virtual_storage.to_owned(), relative_path.to_owned()),
            storages.clone(),
        );
    }

    fn evict(&self, notification: &Notification) {
        let mut guard = self.state();
        let Some(state) = guard.as_mut() else {
            return;
        };
        let changed = match parse_changed_paths(&notification.payload) {
            Ok(changed) => changed,
            Err(err) => {
                warn!(error = %err, channel = %notification.channel, "dropping cached storages");
                state.invalidate_all();
                return;
            }
        };
        state.epoch += 1;
        for (virtual_storage, paths) in changed {
            for relative_path in paths {
                state.entries.pop(&(virtual_storage.clone(), relative_path));
            }
        }
    }

    fn clear(&self) {
        if let Some(state) = self.state().as_mut() {
            state.invalidate_all();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state().as_ref().map_or(0, |state| state.entries.len())
    }
}

#[async_trait]
impl<G> ConsistentStoragesGetter for CachingStoragesGetter<G>
where
    G: ConsistentStoragesGetter,
{
    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>, RepositoryStoreError> {
        let epoch = match self.lookup(virtual_storage, relative_path) {
            Lookup::Hit(storages) => {
                debug!(virtual_storage, relative_path, "consistent storages cache hit");
                return Ok(storages);
            }
            Lookup::Miss { epoch } => Some(epoch),
            Lookup::Bypass => None,
        };
        let storages = self
            .inner
            .get_consistent_storages(virtual_storage, relative_path)
            .await?;
        if let Some(epoch) = epoch {
            self.store(epoch, virtual_storage, relative_path, &storages);
        }
        Ok(storages)
    }
}

impl<G> ListenerHandler for CachingStoragesGetter<G>
where
    G: Send + Sync,
{
    fn notification(&self, notification: &Notification) {
        self.evict(notification);
    }

    fn disconnect(&self, error: &NotificationError) {
        debug!(error = %error, "disabling consistent storages cache");
        self.enabled.store(false, Ordering::Release);
        self.clear();
    }

    fn connected(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests;
