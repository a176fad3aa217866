//! Prometheus adapter for storage-provider lookup failures.

use async_trait::async_trait;
use prometheus::{IntCounterVec, Opts, Registry};

use crate::domain::ports::{StorageProviderMetrics, StorageProviderMetricsError};

/// Counts consistent-storage lookups that fell back to the primary.
///
/// # Metric Specification
///
/// - **Name**: `coordinator_storage_provider_lookup_failures_total`
/// - **Type**: Counter
/// - **Labels**: `virtual_storage`
pub struct PrometheusStorageProviderMetrics {
    lookup_failures_total: IntCounterVec,
}

impl PrometheusStorageProviderMetrics {
    /// Create and register the counter with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric with the same name is already registered.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let lookup_failures_total = IntCounterVec::new(
            Opts::new(
                "coordinator_storage_provider_lookup_failures_total",
                "Consistent storage lookups that fell back to the primary",
            ),
            &["virtual_storage"],
        )?;
        registry.register(Box::new(lookup_failures_total.clone()))?;
        Ok(Self {
            lookup_failures_total,
        })
    }
}

#[async_trait]
impl StorageProviderMetrics for PrometheusStorageProviderMetrics {
    async fn record_lookup_failure(
        &self,
        virtual_storage: &str,
    ) -> Result<(), StorageProviderMetricsError> {
        self.lookup_failures_total
            .with_label_values(&[virtual_storage])
            .inc();
        Ok(())
    }
}
