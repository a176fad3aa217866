//! Gauge of read-only repositories per virtual storage.
//!
//! Prometheus collectors are synchronous while the state store is not, so
//! the gauge is refreshed by [`ReadOnlyRepositoriesGauge::refresh`] right
//! before each scrape is encoded.

use std::sync::Arc;

use prometheus::{IntGaugeVec, Opts, Registry};
use tracing::debug;

use crate::domain::ports::{RepositoryStatusQuery, RepositoryStoreError};

/// Exports `coordinator_read_only_repositories{virtual_storage}`.
pub struct ReadOnlyRepositoriesGauge {
    gauge: IntGaugeVec,
    status: Arc<dyn RepositoryStatusQuery>,
    use_virtual_storage_primary: bool,
}

impl ReadOnlyRepositoriesGauge {
    /// Create and register the gauge with `registry`.
    ///
    /// `use_virtual_storage_primary` selects whose primary decides whether a
    /// repository is read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric with the same name is already registered.
    pub fn new(
        registry: &Registry,
        status: Arc<dyn RepositoryStatusQuery>,
        use_virtual_storage_primary: bool,
    ) -> Result<Self, prometheus::Error> {
        let gauge = IntGaugeVec::new(
            Opts::new(
                "coordinator_read_only_repositories",
                "Repositories whose primary is not on the latest generation",
            ),
            &["virtual_storage"],
        )?;
        registry.register(Box::new(gauge.clone()))?;
        Ok(Self {
            gauge,
            status,
            use_virtual_storage_primary,
        })
    }

    /// Query the store and update one gauge per virtual storage.
    pub async fn refresh(&self) -> Result<(), RepositoryStoreError> {
        let counts = self
            .status
            .read_only_counts(self.use_virtual_storage_primary)
            .await?;
        for (virtual_storage, count) in &counts {
            self.gauge
                .with_label_values(&[virtual_storage.as_str()])
                .set(i64::try_from(*count).unwrap_or(i64::MAX));
        }
        debug!(virtual_storages = counts.len(), "read-only gauge refreshed");
        Ok(())
    }
}
