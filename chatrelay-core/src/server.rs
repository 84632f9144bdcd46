//! HTTP surface: one route per configured relay plus the auxiliary endpoints.

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::{HeaderMap, StatusCode, header};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::blocks::{Block, parse_blocks, parse_chunks};
use crate::config::{Config, RelayMethod};
use crate::error::{CoreResult, RelayError};
use crate::http_client::HttpClient;
use crate::model::{ChatCompletionChunk, ModelEntry, RelayBody};
use crate::prettify::{Prettified, prettify};
use crate::upstream::{fetch_chat_models, fetch_status};
use crate::registry::RelayRegistry;
use crate::relay::{ChatRelay, RelayOutput, RelayRequest};

/// The only error text a caller ever sees.
pub const GENERIC_ERROR: &str = "There was an error processing your request";

/// Language extracted by `/api/prettify` when the body names none.
pub const DEFAULT_PRETTIFY_LANGUAGE: &str = "js";

#[derive(Clone)]
pub struct AppState {
    pub relays: Arc<RelayRegistry>,
    pub http: HttpClient,
    pub status_url: Option<String>,
    pub models_url: Option<String>,
}

impl AppState {
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Self::from_config_with(cfg, &|k| std::env::var(k).ok())
    }

    pub fn from_config_with(
        cfg: &Config,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> CoreResult<Self> {
        let http = HttpClient::new(&cfg.http)?;
        let relays = RelayRegistry::from_config_with(cfg, &http, env)?;
        Ok(Self {
            relays: Arc::new(relays),
            status_url: cfg.status.as_ref().and_then(|u| u.resolve(env)),
            models_url: cfg.models.as_ref().and_then(|u| u.resolve(env)),
            http,
        })
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        tracing::error!(error.kind = self.kind(), error = %self, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": GENERIC_ERROR })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PromptParams {
    prompt: Option<String>,
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlocksBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    chunks: Option<Vec<ChatCompletionChunk>>,
}

#[derive(Debug, Deserialize)]
struct PrettifyBody {
    text: String,
    #[serde(default)]
    language: Option<String>,
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> CoreResult<T> {
    serde_json::from_slice(body).map_err(|e| RelayError::Validation(format!("request body: {e}")))
}

fn relay_response(out: RelayOutput) -> Response {
    match out {
        RelayOutput::Stream(stream) => (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(stream),
        )
            .into_response(),
        RelayOutput::Json(value) => Json(value).into_response(),
    }
}

async fn relay_post(
    relay: Arc<dyn ChatRelay>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let body: RelayBody = decode_body(&body)?;
    let req = RelayRequest::messages(body.messages).with_request_id(request_id(&headers));
    Ok(relay_response(relay.relay(req).await?))
}

async fn relay_get(
    relay: Arc<dyn ChatRelay>,
    headers: HeaderMap,
    params: PromptParams,
) -> Result<Response, RelayError> {
    let req = RelayRequest::prompt(params.prompt, params.conversation_id)
        .with_request_id(request_id(&headers));
    Ok(relay_response(relay.relay(req).await?))
}

async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, RelayError> {
    let url = state
        .status_url
        .as_deref()
        .ok_or_else(|| RelayError::Config("status URL is not set".into()))?;
    Ok(Json(fetch_status(&state.http, url).await?))
}

async fn models(State(state): State<AppState>) -> Result<Json<Vec<ModelEntry>>, RelayError> {
    let url = state
        .models_url
        .as_deref()
        .ok_or_else(|| RelayError::Config("models URL is not set".into()))?;
    Ok(Json(fetch_chat_models(&state.http, url).await?))
}

async fn blocks(body: Bytes) -> Result<Json<Vec<Block>>, RelayError> {
    let body: BlocksBody = decode_body(&body)?;
    let blocks = match (body.chunks, body.text) {
        (Some(chunks), _) => parse_chunks(&chunks),
        (None, Some(text)) => parse_blocks(&text),
        (None, None) => {
            return Err(RelayError::Validation("expected `text` or `chunks`".into()));
        }
    };
    Ok(Json(blocks))
}

async fn prettify_text(body: Bytes) -> Result<Json<Prettified>, RelayError> {
    let body: PrettifyBody = decode_body(&body)?;
    let language = body.language.as_deref().unwrap_or(DEFAULT_PRETTIFY_LANGUAGE);
    Ok(Json(prettify(&body.text, language)))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the router: one route per relay, then the fixed endpoints.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new();
    for relay in state.relays.iter() {
        let route = relay.route().to_string();
        let relay = relay.clone();
        tracing::debug!(relay = relay.name(), %route, method = ?relay.method(), "mounting relay");
        router = match relay.method() {
            RelayMethod::Post => router.route(
                &route,
                post(move |headers: HeaderMap, body: Bytes| relay_post(relay, headers, body)),
            ),
            RelayMethod::Get => router.route(
                &route,
                get(move |headers: HeaderMap, Query(params): Query<PromptParams>| {
                    relay_get(relay, headers, params)
                }),
            ),
        };
    }

    router
        .route("/api/status", get(status))
        .route("/api/models", get(models))
        .route("/api/blocks", post(blocks))
        .route("/api/prettify", post(prettify_text))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server<F>(state: AppState, addr: SocketAddr, shutdown: F) -> CoreResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let relays = state.relays.len();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, relays, "chatrelay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
