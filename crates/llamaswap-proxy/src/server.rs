//! Axum HTTP surface over the swap coordinator.
//!
//! The manager sits behind an `ArcSwap` so a config reload can replace it
//! atomically while requests keep flowing to whichever instance they
//! started on.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use axum::body::{Body, to_bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProxyError;
use crate::manager::ProxyManager;

/// Largest request body accepted (audio/image payloads included).
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Shared handler state: the current manager, swappable on reload.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<ArcSwap<ProxyManager>>,
}

impl AppState {
    pub fn new(manager: Arc<ProxyManager>) -> Self {
        Self {
            manager: Arc::new(ArcSwap::from(manager)),
        }
    }

    /// The manager serving new requests right now.
    pub fn manager(&self) -> Arc<ProxyManager> {
        self.manager.load_full()
    }

    /// Install a new manager; returns the old one so the caller can drain
    /// and shut it down.
    pub fn swap(&self, next: Arc<ProxyManager>) -> Arc<ProxyManager> {
        self.manager.swap(next)
    }
}

/// Build the full router. `/health` stays open; everything else passes the
/// API-key check when keys are configured.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/running", get(running))
        .route("/logs", get(logs))
        .route("/v1/models", get(list_models))
        .route("/models/unload", post(unload_all))
        .route("/models/unload/:model", post(unload_one))
        .route("/upstream/:model/*path", any(upstream))
        .route("/v1/chat/completions", post(inference))
        .route("/v1/completions", post(inference))
        .route("/v1/embeddings", post(inference))
        .route("/v1/rerank", post(inference))
        .route("/v1/responses", post(inference))
        .route("/v1/messages", post(inference))
        .route("/v1/audio/*rest", post(inference))
        .route("/v1/images/*rest", post(inference))
        .route("/infill", post(inference))
        .route("/completion", post(inference))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .merge(protected)
}

/// Liveness of the proxy itself, not of any upstream.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let manager = state.manager();
    let keys = &manager.config().api_keys;
    if keys.is_empty() || header_key_matches(request.headers(), keys) {
        return next.run(request).await;
    }
    ProxyError::BadRequest("invalid or missing API key".to_string())
        .into_response_with_status(StatusCode::UNAUTHORIZED)
}

fn header_key_matches(headers: &HeaderMap, keys: &[String]) -> bool {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));
    presented.is_some_and(|key| keys.iter().any(|k| k == key))
}

/// Shared inference entry: pull `model` out of the JSON body and relay the
/// whole request to whichever upstream owns it.
async fn inference(State(state): State<AppState>, request: Request) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::BadRequest(format!("failed to read body: {e}")))?;

    let model = extract_model(&bytes)?;
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    debug!(model = %model, path = %path, "inference request");

    state
        .manager()
        .proxy_request(&model, parts.method, &path, &parts.headers, bytes)
        .await
}

fn extract_model(body: &Bytes) -> Result<String, ProxyError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("invalid JSON body: {e}")))?;
    value
        .get("model")
        .and_then(|m| m.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| ProxyError::BadRequest("missing 'model' field".to_string()))
}

/// Ensure the model is ready and forward the path suffix upstream.
async fn upstream(
    State(state): State<AppState>,
    Path((model, rest)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::BadRequest(format!("failed to read body: {e}")))?;

    let mut suffix = format!("/{rest}");
    if let Some(query) = parts.uri.query() {
        suffix.push('?');
        suffix.push_str(query);
    }

    state
        .manager()
        .proxy_request(&model, parts.method, &suffix, &parts.headers, bytes)
        .await
}

#[derive(Debug, Default, Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    include_aliases: bool,
}

/// One entry in the `/v1/models` listing.
#[derive(Debug, Serialize)]
struct ModelRecord {
    id: String,
    object: &'static str,
    created: u64,
    owned_by: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    llamaswap_meta: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelRecord>,
}

async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Json<ModelsResponse> {
    let manager = state.manager();
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());

    let mut data = Vec::new();
    for (id, model) in &manager.config().models {
        if model.unlisted {
            continue;
        }
        data.push(ModelRecord {
            id: id.clone(),
            object: "model",
            created,
            owned_by: "llama-swap",
            name: (!model.name.is_empty()).then(|| model.name.clone()),
            description: (!model.description.is_empty()).then(|| model.description.clone()),
            llamaswap_meta: model.metadata_json(),
        });
        if query.include_aliases {
            for alias in &model.aliases {
                data.push(ModelRecord {
                    id: alias.clone(),
                    object: "model",
                    created,
                    owned_by: "llama-swap",
                    name: None,
                    description: None,
                    llamaswap_meta: None,
                });
            }
        }
    }
    data.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ModelsResponse {
        object: "list",
        data,
    })
}

#[derive(Debug, Serialize)]
struct RunningResponse {
    running: Vec<crate::manager::RunningInfo>,
}

async fn running(State(state): State<AppState>) -> Json<RunningResponse> {
    Json(RunningResponse {
        running: state.manager().list_running(),
    })
}

/// Recent proxy/upstream log output from the byte ring.
async fn logs(State(state): State<AppState>) -> Response {
    let bytes = state.manager().monitor().snapshot();
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from(bytes),
    )
        .into_response()
}

async fn unload_all(State(state): State<AppState>) -> impl IntoResponse {
    state.manager().unload_all().await;
    Json(serde_json::json!({ "status": "ok" }))
}

async fn unload_one(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Response, ProxyError> {
    state.manager().unload(&model).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

impl ProxyError {
    /// Render with an overridden status (auth middleware wants 401).
    fn into_response_with_status(self, status: StatusCode) -> Response {
        let mut response = self.into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_model() {
        let bytes = Bytes::from(r#"{"model":"m1","prompt":"hi"}"#);
        assert_eq!(extract_model(&bytes).unwrap(), "m1");

        let missing = Bytes::from(r#"{"prompt":"hi"}"#);
        assert!(matches!(
            extract_model(&missing),
            Err(ProxyError::BadRequest(_))
        ));

        let invalid = Bytes::from_static(b"nope");
        assert!(matches!(
            extract_model(&invalid),
            Err(ProxyError::BadRequest(_))
        ));
    }

    #[test]
    fn test_header_key_matches() {
        let keys = vec!["secret".to_string()];
        let mut headers = HeaderMap::new();
        assert!(!header_key_matches(&headers, &keys));

        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(header_key_matches(&headers, &keys));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret".parse().unwrap());
        assert!(header_key_matches(&headers, &keys));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "wrong".parse().unwrap());
        assert!(!header_key_matches(&headers, &keys));
    }
}
