//! Long-running control plane started by `coordinator serve`.
//!
//! Seeds virtual-storage primaries from the topology, imports repositories
//! already on disk, keeps the consistent-storages cache coherent through the
//! change listener, and reclaims stale replication events. Read routing over
//! that cache and the Prometheus registry are served over HTTP. Everything
//! stops on SIGINT.

use std::sync::Arc;

use actix_web::web;
use mockable::DefaultClock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[cfg(not(feature = "metrics"))]
use crate::domain::ports::NoOpStorageProviderMetrics;
use crate::domain::ports::{
    ConsistentStoragesGetter, ListenerHandler, RepositoryStatusQuery, ShardPrimaryStore,
    state_change_channels,
};
use crate::domain::{
    CachingStoragesGetter, ChangeListener, DEFAULT_CACHE_CAPACITY, DEFAULT_HEALTH_UPDATE_PERIOD,
    DirectStorageProvider, ImportResult, RepositoryImporter, StaleJobReclaimer,
};
use crate::inbound::http::{HttpDependencies, HttpState, create_server};
use crate::outbound::notifications::PgNotificationConnector;
use crate::outbound::persistence::{
    DbPool, DieselReplicationQueue, DieselRepositoryStore, PoolConfig,
};

use super::{CliError, CoordinatorSettings, Topology};

/// Name recorded as the elector of primaries seeded from the topology.
const TOPOLOGY_ELECTOR: &str = "topology";

pub(super) async fn serve(
    settings: &CoordinatorSettings,
    database_url: &str,
    topology: &Topology,
) -> Result<(), CliError> {
    let listener_config = settings.listener_config()?;
    let http_addr = settings.http_listen_addr()?;
    let pool = DbPool::new(PoolConfig::new(database_url)).await?;
    let store = Arc::new(DieselRepositoryStore::new(
        pool.clone(),
        topology.configured_storages(),
        Arc::new(DefaultClock),
    ));
    let queue = Arc::new(DieselReplicationQueue::new(pool));

    seed_primaries(store.as_ref(), topology).await?;

    let consistent = Arc::new(CachingStoragesGetter::new(
        Arc::clone(&store),
        DEFAULT_CACHE_CAPACITY,
    ));
    let deps = http_dependencies(
        consistent.clone(),
        Arc::clone(&store) as Arc<dyn RepositoryStatusQuery>,
        settings.use_virtual_storage_primary(),
    )?;
    let server = create_server(deps, http_addr).map_err(CliError::Http)?;
    let server_handle = server.handle();
    let http = tokio::spawn(server);

    let handler: Arc<dyn ListenerHandler> = consistent.clone();
    let listener = ChangeListener::start(
        Arc::new(PgNotificationConnector::new(database_url)),
        state_change_channels(),
        handler,
        listener_config,
    )
    .await?;

    let virtual_storages = topology
        .virtual_storages
        .iter()
        .map(|virtual_storage| virtual_storage.name.clone())
        .collect();
    let importer = RepositoryImporter::new(
        Arc::clone(&store),
        Arc::new(topology.filesystem_storages()),
        Arc::clone(&store),
        virtual_storages,
    )
    .with_batch_interval(settings.import_batch_interval());
    let imports = tokio::spawn(drain_imports(importer.run()));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let reclaimer = StaleJobReclaimer::new(
        queue,
        settings.stale_job_threshold(),
        DEFAULT_HEALTH_UPDATE_PERIOD,
    );
    let reclaim = tokio::spawn(async move { reclaimer.run(shutdown_rx).await });

    info!(
        cache_enabled = consistent.is_enabled(),
        http_addr = %http_addr,
        "coordinator serving"
    );
    let signal = tokio::signal::ctrl_c().await;

    info!("shutting down");
    server_handle.stop(true).await;
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "HTTP server stopped with an error"),
        Err(err) => warn!(error = %err, "HTTP server ended abnormally"),
    }
    // The reclaimer may already have stopped; nothing is left to signal then.
    let _ = shutdown.send(true);
    if let Err(err) = reclaim.await {
        warn!(error = %err, "stale job reclaimer ended abnormally");
    }
    listener.close().await;
    imports.abort();

    signal.map_err(CliError::Signal)
}

/// Read routing over `consistent`, counting fallbacks and exposing the
/// read-only gauge in the serving registry.
#[cfg(feature = "metrics")]
fn http_dependencies<G>(
    consistent: Arc<G>,
    status: Arc<dyn RepositoryStatusQuery>,
    use_virtual_storage_primary: bool,
) -> Result<HttpDependencies, CliError>
where
    G: ConsistentStoragesGetter + 'static,
{
    use crate::inbound::http::MetricsEndpoint;
    use crate::outbound::metrics::{PrometheusStorageProviderMetrics, ReadOnlyRepositoriesGauge};

    let metrics_error = |err: prometheus::Error| CliError::Metrics {
        message: err.to_string(),
    };
    let registry = prometheus::Registry::new();
    let lookup_failures = PrometheusStorageProviderMetrics::new(&registry).map_err(metrics_error)?;
    let read_only = ReadOnlyRepositoriesGauge::new(&registry, status, use_virtual_storage_primary)
        .map_err(metrics_error)?;
    let provider = DirectStorageProvider::new(consistent, Arc::new(lookup_failures));

    Ok(HttpDependencies {
        state: web::Data::new(HttpState::new(Arc::new(provider))),
        metrics: web::Data::new(MetricsEndpoint::new(registry, read_only)),
    })
}

/// Read routing over `consistent` without metrics.
#[cfg(not(feature = "metrics"))]
fn http_dependencies<G>(
    consistent: Arc<G>,
    _status: Arc<dyn RepositoryStatusQuery>,
    _use_virtual_storage_primary: bool,
) -> Result<HttpDependencies, CliError>
where
    G: ConsistentStoragesGetter + 'static,
{
    let provider = DirectStorageProvider::new(consistent, Arc::new(NoOpStorageProviderMetrics));
    Ok(HttpDependencies {
        state: web::Data::new(HttpState::new(Arc::new(provider))),
    })
}

/// Elect the topology's flagged primary where no primary is recorded yet.
async fn seed_primaries<S>(store: &S, topology: &Topology) -> Result<(), CliError>
where
    S: ShardPrimaryStore + ?Sized,
{
    for virtual_storage in &topology.virtual_storages {
        let name = virtual_storage.name.as_str();
        let Some(primary) = topology.configured_primary(name) else {
            continue;
        };
        if store.get_shard_primary(name).await?.is_some() {
            debug!(virtual_storage = name, "shard primary already recorded");
            continue;
        }
        store
            .set_shard_primary(name, primary, TOPOLOGY_ELECTOR)
            .await?;
        info!(virtual_storage = name, primary, "seeded shard primary");
    }
    Ok(())
}

async fn drain_imports(mut results: mpsc::Receiver<ImportResult>) {
    while let Some(result) = results.recv().await {
        match result.error {
            Some(err) => debug!(
                virtual_storage = %result.virtual_storage,
                error = %err,
                "import stopped"
            ),
            None => info!(
                virtual_storage = %result.virtual_storage,
                imported = result.relative_paths.len(),
                "repositories imported"
            ),
        }
    }
    info!("repository import finished");
}
