//! Domain port for recording storage-provider lookup failures.
//!
//! Implementations may export to Prometheus or simply discard the events in
//! tests.

use async_trait::async_trait;

use super::define_port_error;

define_port_error! {
    /// Errors exposed when recording storage-provider metrics.
    pub enum StorageProviderMetricsError {
        /// Metric exporter rejected the write.
        Export { message: String } => "storage provider metrics exporter failed: {message}",
    }
}

/// Metrics recording port for consistent-storage lookups.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProviderMetrics: Send + Sync {
    /// Record a failed lookup that fell back to the primary.
    async fn record_lookup_failure(
        &self,
        virtual_storage: &str,
    ) -> Result<(), StorageProviderMetricsError>;
}

/// No-op implementation for when metrics are disabled or in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStorageProviderMetrics;

#[async_trait]
impl StorageProviderMetrics for NoOpStorageProviderMetrics {
    async fn record_lookup_failure(
        &self,
        _virtual_storage: &str,
    ) -> Result<(), StorageProviderMetricsError> {
        Ok(())
    }
}
