//! Prometheus scrape endpoint.

use actix_web::{HttpResponse, get, web};
use prometheus::Registry;
use tracing::warn;

use crate::outbound::metrics::{ReadOnlyRepositoriesGauge, encode_text};

/// Registry of the serving process and the gauge refreshed on every scrape.
pub struct MetricsEndpoint {
    registry: Registry,
    read_only: ReadOnlyRepositoriesGauge,
}

impl MetricsEndpoint {
    pub fn new(registry: Registry, read_only: ReadOnlyRepositoriesGauge) -> Self {
        Self {
            registry,
            read_only,
        }
    }
}

/// Text exposition of every registered collector.
///
/// A failed gauge refresh keeps the previous values and is only logged.
#[get("/metrics")]
pub async fn scrape(endpoint: web::Data<MetricsEndpoint>) -> HttpResponse {
    if let Err(err) = endpoint.read_only.refresh().await {
        warn!(error = %err, "read-only gauge refresh failed");
    }
    match encode_text(&endpoint.registry) {
        Ok(text) => HttpResponse::Ok()
            .content_type(prometheus::TEXT_FORMAT)
            .body(text),
        Err(err) => {
            warn!(error = %err, "metrics encoding failed");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use actix_web::http::StatusCode;
    use actix_web::{App, test};

    use super::*;
    use crate::domain::ports::{MockRepositoryStatusQuery, RepositoryStoreError};

    fn endpoint(status: MockRepositoryStatusQuery) -> web::Data<MetricsEndpoint> {
        let registry = Registry::new();
        let gauge = ReadOnlyRepositoriesGauge::new(&registry, Arc::new(status), true)
            .expect("gauge registration");
        web::Data::new(MetricsEndpoint::new(registry, gauge))
    }

    #[actix_web::test]
    async fn scrape_refreshes_the_read_only_gauge() {
        let mut status = MockRepositoryStatusQuery::new();
        status
            .expect_read_only_counts()
            .times(1)
            .returning(|_| Ok(BTreeMap::from([("default".to_owned(), 2)])));
        let app =
            test::init_service(App::new().app_data(endpoint(status)).service(scrape)).await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).expect("utf-8 exposition");

        assert!(text.contains("coordinator_read_only_repositories{virtual_storage=\"default\"} 2"));
    }

    #[actix_web::test]
    async fn refresh_failure_still_answers() {
        let mut status = MockRepositoryStatusQuery::new();
        status
            .expect_read_only_counts()
            .returning(|_| Err(RepositoryStoreError::connection("db down")));
        let app =
            test::init_service(App::new().app_data(endpoint(status)).service(scrape)).await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::OK);
    }
}
