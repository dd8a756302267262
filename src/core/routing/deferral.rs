use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::types::{RoutingDecision, RoutingRequest};
use crate::core::clock::Clock;
use crate::core::store::{DeferredStatus, DeferredTask, Store};

/// Durable queue of work parked for a later attempt.
pub struct DeferralQueue {
    store: Store,
    clock: Arc<dyn Clock>,
    default_delay: Duration,
}

impl DeferralQueue {
    pub fn new(store: Store, clock: Arc<dyn Clock>, default_delay: Duration) -> Self {
        Self {
            store,
            clock,
            default_delay,
        }
    }

    /// Park a request; it becomes due after `delay` (default one hour).
    pub async fn defer(
        &self,
        request: &RoutingRequest,
        decision: &RoutingDecision,
        delay: Option<Duration>,
    ) -> Result<String> {
        let now = self.clock.epoch_ms();
        let delay = delay.unwrap_or(self.default_delay);
        let mut decision = decision.clone();
        decision.deferred = true;
        let task = DeferredTask {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.clone(),
            decision,
            created_at: now,
            scheduled_for: now + delay.as_millis() as i64,
            attempts: 0,
            last_error: None,
            status: DeferredStatus::Pending,
        };
        self.store.insert_deferred(&task).await?;
        info!(
            task_id = %task.id,
            executor = %task.decision.executor,
            "Deferred task for {}s",
            delay.as_secs()
        );
        Ok(task.id)
    }

    /// Due entries, earliest schedule first.
    pub async fn get_pending(&self, limit: usize) -> Result<Vec<DeferredTask>> {
        self.store.due_deferred(self.clock.epoch_ms(), limit).await
    }

    /// Records an attempt outcome and returns the attempt count so far.
    pub async fn update_status(
        &self,
        id: &str,
        status: DeferredStatus,
        error: Option<&str>,
    ) -> Result<Option<i64>> {
        self.store.update_deferred_status(id, status, error).await
    }

    /// Make a failed task due again at the next batch.
    pub async fn requeue(&self, id: &str) -> Result<bool> {
        self.store
            .requeue_deferred(id, self.clock.epoch_ms())
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.delete_deferred(id).await
    }

    pub async fn list(&self, status: Option<DeferredStatus>) -> Result<Vec<DeferredTask>> {
        self.store.list_deferred(status).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeferredTask>> {
        self.store.get_deferred(id).await
    }
}
