//! Read-only upstream lookups behind `/api/status` and `/api/models`.

use serde::Deserialize;

use crate::error::CoreResult;
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::ModelEntry;

/// Fetch the status document and hand it back untouched.
pub async fn fetch_status(http: &HttpClient, url: &str) -> CoreResult<serde_json::Value> {
    let ctx = RequestCtx {
        relay: Some("status"),
        request_id: None,
    };
    let (doc, latency_ms) = http.get_json::<serde_json::Value>(url, &[], &ctx).await?;
    tracing::debug!(latency_ms, "status fetched");
    Ok(doc)
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Catalog {
    data: Vec<CatalogEntry>,
}

/// Fetch the model catalog and keep the chat models.
pub async fn fetch_chat_models(http: &HttpClient, url: &str) -> CoreResult<Vec<ModelEntry>> {
    let ctx = RequestCtx {
        relay: Some("models"),
        request_id: None,
    };
    let (catalog, _) = http.get_json::<Catalog>(url, &[], &ctx).await?;
    Ok(catalog
        .data
        .into_iter()
        .filter(|m| m.kind.as_deref() == Some("chat"))
        .map(|m| ModelEntry {
            name: m.id.clone(),
            id: m.id,
        })
        .collect())
}
