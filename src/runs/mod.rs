use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::providers::base::ChatMessage;
use crate::state::AppState;
use crate::store::{Run, RunStatus};

/// Request body for creating an async run.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// What the producer hands back: enough to poll the run.
#[derive(Debug, Clone, Serialize)]
pub struct RunTicket {
    pub run_id: Uuid,
    pub status: RunStatus,
}

/// Create a run and enqueue its first processing attempt.
///
/// A matching `idempotency_key` short-circuits to the existing run, exactly
/// as stored — no second job is enqueued. Enqueue failure flips the fresh
/// run straight to failed so it never sits in pending forever.
pub fn create_run(state: &AppState, payload: &CreateRunRequest) -> Result<RunTicket, GatewayError> {
    if payload.messages.is_empty() {
        return Err(GatewayError::Client("messages must not be empty".into()));
    }

    if let Some(idempotency_key) = payload.idempotency_key.as_deref()
        && let Some(existing) = state
            .store
            .find_run_by_idempotency_key(idempotency_key)
            .map_err(GatewayError::Internal)?
    {
        info!(
            "found existing run {} for idempotency_key {}",
            existing.id, idempotency_key
        );
        return Ok(RunTicket {
            run_id: existing.id,
            status: existing.status,
        });
    }

    let provider = payload.provider.as_deref().unwrap_or("openai");
    let messages_json =
        serde_json::to_value(&payload.messages).map_err(|e| GatewayError::Internal(e.into()))?;

    let now = Utc::now();
    let run = state
        .store
        .insert_run(
            provider,
            payload.model.as_deref(),
            payload.max_tokens,
            &messages_json,
            payload.idempotency_key.as_deref(),
            now,
        )
        .map_err(GatewayError::Internal)?;

    if let Err(e) = state.queue.enqueue(run.id, 1, now) {
        error!("failed to enqueue run {}: {}", run.id, e);
        state
            .store
            .mark_run_failed(run.id, &format!("Failed to enqueue job: {}", e), 0, None, now)
            .map_err(GatewayError::Internal)?;
        return Err(GatewayError::Internal(e));
    }

    state
        .store
        .mark_run_queued(run.id, now)
        .map_err(GatewayError::Internal)?;
    info!("enqueued run {} for processing", run.id);

    Ok(RunTicket {
        run_id: run.id,
        status: RunStatus::Queued,
    })
}

pub fn get_run(state: &AppState, id: Uuid) -> Result<Run, GatewayError> {
    state
        .store
        .get_run(id)
        .map_err(GatewayError::Internal)?
        .ok_or_else(|| GatewayError::NotFound("Run not found".into()))
}

/// Cancel a non-terminal run. The worker observes the transition at its
/// next status check; in-flight upstream calls are not preempted.
pub fn cancel_run(state: &AppState, id: Uuid) -> Result<Run, GatewayError> {
    let run = get_run(state, id)?;
    if run.status.is_terminal() {
        return Err(GatewayError::Client(format!(
            "Cannot cancel run with status: {}",
            run.status
        )));
    }

    state
        .store
        .mark_run_canceled(id, Utc::now())
        .map_err(GatewayError::Internal)?;
    info!("canceled run {}", id);
    get_run(state, id)
}
