//! Read routing endpoint.

use actix_web::{HttpResponse, get, web};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::HttpState;

/// Query string of [`read_storages`].
#[derive(Debug, Deserialize)]
pub struct ReadStoragesQuery {
    /// Current primary of the repository; always part of the answer.
    pub primary: String,
}

/// Storages that may serve a read of one repository.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStoragesResponse {
    pub virtual_storage: String,
    pub relative_path: String,
    pub storages: Vec<String>,
}

/// Storages safe to read a repository from.
///
/// Lookup failures are absorbed by the provider, which answers with the
/// primary alone, so this handler never fails once the request is valid.
#[get("/v1/storages/{virtual_storage}/{relative_path:.*}")]
pub async fn read_storages(
    state: web::Data<HttpState>,
    path: web::Path<(String, String)>,
    query: web::Query<ReadStoragesQuery>,
) -> HttpResponse {
    let (virtual_storage, relative_path) = path.into_inner();
    let primary = query.primary.trim();
    if primary.is_empty() || relative_path.is_empty() {
        return HttpResponse::BadRequest()
            .json(json!({ "message": "relative path and primary must not be empty" }));
    }

    let storages = state
        .provider
        .storages_for_read(&virtual_storage, &relative_path, primary)
        .await;
    HttpResponse::Ok().json(ReadStoragesResponse {
        virtual_storage,
        relative_path,
        storages: storages.into_iter().collect(),
    })
}
