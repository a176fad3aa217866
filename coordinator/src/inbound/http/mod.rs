//! HTTP surface of `coordinator serve`.
//!
//! ```text
//! GET /v1/storages/{virtual_storage}/{relative_path}?primary=<storage>
//! GET /metrics
//! ```
//!
//! Read routing goes through the [`StorageProvider`] built by `serve`, so
//! lookups hit the consistent-storages cache kept fresh by the change
//! listener. `/metrics` is only mounted with the `metrics` feature.

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod storages;

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{App, HttpServer, web};

use crate::domain::StorageProvider;

#[cfg(feature = "metrics")]
pub use self::metrics::MetricsEndpoint;
pub use self::storages::{ReadStoragesQuery, ReadStoragesResponse, read_storages};

/// Shared handler state.
#[derive(Clone)]
pub struct HttpState {
    pub provider: Arc<dyn StorageProvider>,
}

impl HttpState {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self { provider }
    }
}

/// Everything the HTTP workers share.
#[derive(Clone)]
pub struct HttpDependencies {
    pub state: web::Data<HttpState>,
    #[cfg(feature = "metrics")]
    pub metrics: web::Data<MetricsEndpoint>,
}

/// Register handlers and their state on an app or test service.
pub fn configure(deps: HttpDependencies) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(deps.state).service(read_storages);
        #[cfg(feature = "metrics")]
        cfg.app_data(deps.metrics).service(metrics::scrape);
    }
}

/// Bind the HTTP server. The returned [`Server`] must be awaited to serve.
///
/// Signal handling is left to the caller.
///
/// # Errors
///
/// Propagates [`std::io::Error`] when binding the socket fails.
pub fn create_server(deps: HttpDependencies, bind_addr: SocketAddr) -> std::io::Result<Server> {
    let server = HttpServer::new(move || App::new().configure(configure(deps.clone())))
        .disable_signals()
        .bind(bind_addr)?
        .run();
    Ok(server)
}
