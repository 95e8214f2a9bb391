use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::store::{QueuedJob, Store};

/// Durable run-processing queue with delayed enqueue, backed by the shared
/// store. The producer enqueues, workers poll [`JobQueue::claim_due`]; a job
/// survives process restarts until a worker claims it.
pub struct JobQueue {
    store: Arc<Store>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Enqueue for immediate processing.
    pub fn enqueue(&self, run_id: Uuid, attempt: u32, now: DateTime<Utc>) -> Result<()> {
        self.enqueue_in(Duration::zero(), run_id, attempt, now)
    }

    /// Enqueue to become due after `delay`.
    pub fn enqueue_in(
        &self,
        delay: Duration,
        run_id: Uuid,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let available_at = now + delay;
        self.store.enqueue_job(run_id, attempt, available_at, now)?;
        debug!(
            "enqueued run {} (attempt {}) due at {}",
            run_id, attempt, available_at
        );
        Ok(())
    }

    /// Claim the earliest due job, removing it from the queue.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        self.store.claim_due_job(now)
    }

    /// Jobs waiting in the queue (due or not). Debug/test aid.
    pub fn pending(&self) -> Result<Vec<(Uuid, u32, DateTime<Utc>)>> {
        self.store.pending_jobs()
    }
}
