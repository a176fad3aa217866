//! Outbound adapters for metrics exporting.
//!
//! Prometheus-backed implementations of the coordinator's metrics. All
//! adapters here are feature-gated behind the `metrics` feature.

mod prometheus_read_only;
mod prometheus_storage_provider;

use prometheus::{Encoder as _, Registry, TextEncoder};

pub use prometheus_read_only::ReadOnlyRepositoriesGauge;
pub use prometheus_storage_provider::PrometheusStorageProviderMetrics;

/// Encode every metric in `registry` in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
}
