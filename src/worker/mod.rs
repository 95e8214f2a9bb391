use anyhow::Result;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppSettings;
use crate::dispatch::dispatch_with_failover;
use crate::providers::base::{ChatMessage, ChatRequest};
use crate::state::AppState;
use crate::store::RunStatus;

/// Poll the queue and process due jobs until the task is aborted. Claim
/// errors are logged and retried on the next tick — the worker must outlive
/// a transiently unhappy database.
pub async fn run_worker_loop(state: Arc<AppState>) {
    info!(
        "worker started (poll interval {}ms, max attempts {})",
        state.settings.worker_poll_interval_ms, state.settings.worker_max_attempts
    );
    let mut interval =
        tokio::time::interval(StdDuration::from_millis(state.settings.worker_poll_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        loop {
            match state.queue.claim_due(Utc::now()) {
                Ok(Some(job)) => process_run_job(&state, job.run_id, job.attempt).await,
                Ok(None) => break,
                Err(e) => {
                    error!("failed to claim job: {}", e);
                    break;
                }
            }
        }
    }
}

/// Process one attempt of a run. Never returns an error: every failure
/// path lands in the run record, which is the only user-visible surface.
pub async fn process_run_job(state: &AppState, run_id: Uuid, attempt: u32) {
    if let Err(e) = try_process(state, run_id, attempt).await {
        error!("unexpected error processing run {}: {}", run_id, e);
        let _ = state.store.mark_run_failed(
            run_id,
            &format!("Worker error: {}", e),
            attempt,
            None,
            Utc::now(),
        );
    }
}

async fn try_process(state: &AppState, run_id: Uuid, attempt: u32) -> Result<()> {
    let Some(run) = state.store.get_run(run_id)? else {
        error!("run {} not found in database", run_id);
        return Ok(());
    };
    if run.status == RunStatus::Canceled {
        info!("run {} was canceled, skipping", run_id);
        return Ok(());
    }

    state.store.mark_run_running(run_id, Utc::now())?;
    info!("run {} started processing (attempt {})", run_id, attempt);

    let messages: Vec<ChatMessage> = serde_json::from_value(run.input_messages.clone())?;
    let request = ChatRequest {
        messages,
        model: run.model.clone(),
        temperature: None,
        max_tokens: run.max_tokens,
        provider: Some(run.provider.clone()),
    };

    // Lenient resolution: files deleted since the run was created degrade
    // inside the adapters instead of failing the run
    let stored_files = match state.resolve_stored_files(&request.attachment_file_ids(), false) {
        Ok(files) => files,
        Err(e) => {
            warn!("run {}: attachment resolution failed: {}", run_id, e);
            None
        }
    };

    let max_key_attempts = state.settings.sync_llm_max_retries + 1;
    let outcome = dispatch_with_failover(
        &state.pool,
        &state.registry,
        &state.timeseries,
        &state.counters,
        &run.provider,
        &request,
        stored_files.as_ref(),
        max_key_attempts,
    )
    .await;

    let now = Utc::now();
    match outcome {
        Ok(success) => {
            let output = serde_json::to_value(&success.response.message)?;
            state
                .store
                .mark_run_succeeded(run_id, &output, attempt - 1, now)?;
            info!("run {} completed successfully after {} attempt(s)", run_id, attempt);
        }
        Err(err) if err.is_retryable() && attempt < state.settings.worker_max_attempts => {
            let delay = backoff_delay(&state.settings, attempt, err.retry_after());
            let reason = err.summary();
            warn!(
                "run {} attempt {}: {} — requeuing with {}s delay",
                run_id, attempt, reason, delay
            );
            state.store.mark_run_retrying(run_id, attempt, &reason, now)?;
            state
                .queue
                .enqueue_in(Duration::seconds(delay as i64), run_id, attempt + 1, now)?;
        }
        Err(err) if err.is_retryable() => {
            let reason = err.summary();
            error!(
                "run {} failed after {} attempts: {}",
                run_id, state.settings.worker_max_attempts, reason
            );
            state.store.mark_run_failed(
                run_id,
                &format!(
                    "{} after {} attempts",
                    reason, state.settings.worker_max_attempts
                ),
                attempt,
                Some(&reason),
                now,
            )?;
        }
        Err(err) => {
            let reason = err.summary();
            error!("run {} attempt {}: non-retriable: {}", run_id, attempt, reason);
            state
                .store
                .mark_run_failed(run_id, &reason, attempt, Some(&reason), now)?;
        }
    }
    Ok(())
}

/// Re-enqueue delay for a failed attempt: an upstream Retry-After hint wins,
/// otherwise exponential backoff from the base — both capped.
pub fn backoff_delay(settings: &AppSettings, attempt: u32, retry_after: Option<u64>) -> u64 {
    let delay = match retry_after {
        Some(hint) => hint,
        None => {
            let exponent = attempt.saturating_sub(1).min(32);
            settings.worker_base_backoff_seconds.saturating_mul(1 << exponent)
        }
    };
    delay.min(settings.worker_max_backoff_seconds)
}

#[cfg(test)]
mod tests;
