//! Bootstraps the state store from repositories already on the primaries.
//!
//! For each virtual storage not yet imported, the importer walks its primary,
//! inserts the listed repositories in batches, and flags the virtual storage
//! as imported once the walk completes. A failure in one virtual storage is
//! reported and the importer moves on to the next one.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::domain::ports::{
    BackendError, ImportStore, PrimaryGetter, RepositoryStoreError, RepositoryWalker,
    define_port_error,
};

/// Repositories inserted per transaction.
pub const IMPORT_BATCH_SIZE: usize = 25;
/// Default delay between batches.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

define_port_error! {
    /// Errors that stop the import of one virtual storage.
    pub enum ImportError {
        /// No primary is elected to walk.
        NoPrimary { virtual_storage: String } =>
            "virtual storage {virtual_storage} has no primary to import from",
        /// The state store failed.
        Store { message: String } <- RepositoryStoreError =>
            "import state store operation failed: {message}",
        /// Walking the primary failed.
        Backend { message: String } <- BackendError => "import walk failed: {message}",
    }
}

/// Progress report of the importer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    /// Virtual storage being imported.
    pub virtual_storage: String,
    /// Paths whose records were created by one batch.
    pub relative_paths: Vec<String>,
    /// Set when the virtual storage's import stopped.
    pub error: Option<ImportError>,
}

impl ImportResult {
    fn imported(virtual_storage: &str, relative_paths: Vec<String>) -> Self {
        Self {
            virtual_storage: virtual_storage.to_owned(),
            relative_paths,
            error: None,
        }
    }

    fn failed(virtual_storage: &str, error: ImportError) -> Self {
        Self {
            virtual_storage: virtual_storage.to_owned(),
            relative_paths: Vec::new(),
            error: Some(error),
        }
    }
}

/// Outcome of feeding one virtual storage.
enum Progress {
    Done,
    ReceiverGone,
}

/// Imports on-disk repositories of every configured virtual storage.
pub struct RepositoryImporter<S, W, P> {
    store: Arc<S>,
    walker: Arc<W>,
    primaries: Arc<P>,
    virtual_storages: Vec<String>,
    batch_interval: Duration,
}

impl<S, W, P> RepositoryImporter<S, W, P> {
    /// Create an importer for `virtual_storages`.
    pub fn new(
        store: Arc<S>,
        walker: Arc<W>,
        primaries: Arc<P>,
        virtual_storages: Vec<String>,
    ) -> Self {
        Self {
            store,
            walker,
            primaries,
            virtual_storages,
            batch_interval: DEFAULT_BATCH_INTERVAL,
        }
    }

    /// Override the delay between batches.
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }
}

impl<S, W, P> RepositoryImporter<S, W, P>
where
    S: ImportStore + 'static,
    W: RepositoryWalker + 'static,
    P: PrimaryGetter + 'static,
{
    /// Start importing in the background.
    ///
    /// The returned receiver must be drained; the import stops early when it
    /// is dropped.
    pub fn run(self) -> mpsc::Receiver<ImportResult> {
        let (tx, rx) = mpsc::channel(self.virtual_storages.len().max(1));
        tokio::spawn(async move { self.import_all(tx).await });
        rx
    }

    async fn import_all(&self, results: mpsc::Sender<ImportResult>) {
        let mut pacing = time::interval(self.batch_interval.max(Duration::from_millis(1)));
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for virtual_storage in &self.virtual_storages {
            let outcome = match self.import(virtual_storage, &mut pacing, &results).await {
                Ok(progress) => progress,
                Err(err) => {
                    warn!(virtual_storage = %virtual_storage, error = %err, "repository import failed");
                    match results.send(ImportResult::failed(virtual_storage, err)).await {
                        Ok(()) => Progress::Done,
                        Err(_) => Progress::ReceiverGone,
                    }
                }
            };
            if matches!(outcome, Progress::ReceiverGone) {
                info!("import results receiver dropped; stopping import");
                return;
            }
        }
    }

    async fn import(
        &self,
        virtual_storage: &str,
        pacing: &mut time::Interval,
        results: &mpsc::Sender<ImportResult>,
    ) -> Result<Progress, ImportError> {
        let imported = self.store.is_imported(virtual_storage).await?;
        if imported {
            info!(virtual_storage, "repositories already imported");
            return Ok(Progress::Done);
        }

        let primary = self
            .primaries
            .get_primary(virtual_storage)
            .await?
            .ok_or_else(|| ImportError::no_primary(virtual_storage))?;
        info!(virtual_storage, primary = %primary, "importing repositories");

        let mut paths = self.walker.walk_repos(virtual_storage, &primary).await?;
        let mut batch = Vec::with_capacity(IMPORT_BATCH_SIZE);
        let mut total = 0;

        loop {
            let next = paths.next().await.transpose()?;
            let exhausted = next.is_none();
            batch.extend(next);

            if batch.len() == IMPORT_BATCH_SIZE || (exhausted && !batch.is_empty()) {
                pacing.tick().await;
                let inserted = self
                    .store
                    .import_batch(virtual_storage, &primary, &batch)
                    .await?;
                batch.clear();
                total += inserted.len();
                if !inserted.is_empty()
                    && results
                        .send(ImportResult::imported(virtual_storage, inserted))
                        .await
                        .is_err()
                {
                    return Ok(Progress::ReceiverGone);
                }
            }

            if exhausted {
                break;
            }
        }

        self.store.mark_imported(virtual_storage).await?;
        info!(virtual_storage, imported = total, "repository import completed");
        Ok(Progress::Done)
    }
}
