/// HTTP surface of the gateway: the sync chat path, the async run API, the
/// admin key catalog and the stats endpoints. Handlers stay thin — the core
/// lives in `dispatch`, `runs`, `pool` and `timeseries`.
use anyhow::Result;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{AUTHORIZATION, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::dispatch::{DispatchError, dispatch_with_failover};
use crate::errors::GatewayError;
use crate::providers::base::{ChatRequest, ChatResponse};
use crate::runs;
use crate::state::AppState;
use crate::store::{KeyStatus, KeyUpdate, NewKey, ProviderKey, Run};

/// Retry-After sent on pool-exhaustion 429s when no upstream provided a
/// hint.
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// JSON error envelope with an HTTP status (and optional Retry-After).
pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::Client(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Transient(_) | GatewayError::Auth(_) | GatewayError::NoKey { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::RateLimited { retry_after } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: "All keys are rate-limited, please retry later.".into(),
                retry_after: Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
            },
            DispatchError::Unavailable { .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "LLM request failed after retries.",
            ),
            DispatchError::NoKeys { provider } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("No available keys for provider '{}'.", provider),
            ),
            DispatchError::Client { message } => Self::new(StatusCode::BAD_REQUEST, message),
            DispatchError::Internal(e) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error: {}", e),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, Json(json!({"error": self.message}))).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Static bearer-token check for the API surface. No token configured
/// means auth is disabled (dev mode).
async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.settings.api_auth_token else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {}", expected));

    if authorized {
        next.run(request).await
    } else {
        ApiError::new(StatusCode::UNAUTHORIZED, "invalid or missing bearer token")
            .into_response()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/llm/chat", post(chat))
        .route("/v1/agent/runs", post(create_run))
        .route("/v1/agent/runs/{id}", get(get_run))
        .route("/v1/agent/runs/{id}/cancel", post(cancel_run))
        .route("/v1/admin/keys", get(list_keys).post(create_key))
        .route(
            "/v1/admin/keys/{id}",
            get(get_key).patch(update_key).delete(delete_key),
        )
        .route("/v1/stats/keys/{id}/timeseries", get(key_timeseries))
        .route("/v1/stats/providers", get(provider_stats))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(api)
        .route("/api/health", get(health))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&state.settings.bind_addr).await?;
    info!("gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": crate::VERSION}))
}

/// POST /v1/llm/chat — the sync chat path with in-request failover.
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    let provider_name = request.provider.clone().unwrap_or_else(|| "openai".into());

    // Attachment checks happen before any key is consumed
    let file_ids = request.attachment_file_ids();
    let stored_files = if file_ids.is_empty() {
        None
    } else {
        let provider = state.registry.get(&provider_name)?;
        if !provider.supports_attachments() {
            return Err(ApiError::bad_request(format!(
                "Attachments are not supported for provider '{}' yet.",
                provider_name
            )));
        }
        state.resolve_stored_files(&file_ids, true)?
    };

    let max_attempts = state.settings.sync_llm_max_retries + 1;
    let success = dispatch_with_failover(
        &state.pool,
        &state.registry,
        &state.timeseries,
        &state.counters,
        &provider_name,
        &request,
        stored_files.as_ref(),
        max_attempts,
    )
    .await?;
    Ok(Json(success.response))
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<runs::CreateRunRequest>,
) -> Result<(StatusCode, Json<runs::RunTicket>), ApiError> {
    let ticket = runs::create_run(&state, &payload)?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(runs::get_run(&state, id)?))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(runs::cancel_run(&state, id)?))
}

#[derive(Debug, Deserialize)]
struct KeyListQuery {
    provider: Option<String>,
    /// Named `key_status` to keep it distinct from any HTTP-level `status`
    /// parameter semantics.
    key_status: Option<KeyStatus>,
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyListQuery>,
) -> Result<Json<Vec<ProviderKey>>, ApiError> {
    let keys = state
        .store
        .list_keys(query.provider.as_deref(), query.key_status)
        .map_err(GatewayError::Internal)?;
    Ok(Json(keys))
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(new_key): Json<NewKey>,
) -> Result<(StatusCode, Json<ProviderKey>), ApiError> {
    let key = state
        .store
        .insert_key(&new_key, chrono::Utc::now())
        .map_err(GatewayError::Internal)?;
    Ok((StatusCode::CREATED, Json(key)))
}

async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProviderKey>, ApiError> {
    state
        .store
        .get_key(id)
        .map_err(GatewayError::Internal)?
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound("Key not found".into()).into())
}

async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(update): Json<KeyUpdate>,
) -> Result<Json<ProviderKey>, ApiError> {
    state
        .store
        .update_key(id, &update, chrono::Utc::now())
        .map_err(GatewayError::Internal)?
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound("Key not found".into()).into())
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .store
        .delete_key(id)
        .map_err(GatewayError::Internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound("Key not found".into()).into())
    }
}

fn default_window_minutes() -> u64 {
    60
}

fn default_step_seconds() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
struct TimeSeriesQuery {
    #[serde(default = "default_window_minutes")]
    window_minutes: u64,
    #[serde(default = "default_step_seconds")]
    step_seconds: u64,
}

async fn key_timeseries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<TimeSeriesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.step_seconds == 0 {
        return Err(ApiError::bad_request("step_seconds must be positive"));
    }
    let points = state
        .timeseries
        .query(id, query.window_minutes, query.step_seconds, chrono::Utc::now())
        .map_err(GatewayError::Internal)?;
    Ok(Json(json!({"key_id": id, "points": points})))
}

async fn provider_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "requests": state.counters.request_counts(),
        "key_errors": state.counters.key_error_counts(),
    }))
}
