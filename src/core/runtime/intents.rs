use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{error, info, warn};

use super::alerts::{exhaustion_alert, failure_alert};
use super::{RuntimeState, TransitionError, UnifiedRuntime};
use crate::core::events::RuntimeEvent;
use crate::core::executors::TRANSPORT_EXIT_CODE;
use crate::core::routing::driver::ExecuteOptions;
use crate::core::routing::{ExecutorResult, RoutingRequest, TaskCategory, Urgency};
use crate::core::store::{Intent, IntentStatus, NewIntent, Priority, Run, RunStatus};

/// How one `execute_intent` call ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub intent_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub executor: Option<String>,
    pub exhausted: bool,
}

/// Removes the intent from the in-flight set however execution ends.
struct InFlight<'a> {
    state: &'a parking_lot::Mutex<RuntimeState>,
    intent_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.intent_id);
    }
}

pub fn category_for(intent_type: &str) -> TaskCategory {
    match intent_type.to_ascii_lowercase().as_str() {
        "code" | "code-change" => TaskCategory::CodeChange,
        "research" | "discovery" => TaskCategory::Discovery,
        "review" | "verification" => TaskCategory::Verification,
        "batch" => TaskCategory::Batch,
        "long-context" => TaskCategory::LongContext,
        _ => TaskCategory::General,
    }
}

pub fn urgency_for(priority: Priority) -> Urgency {
    match priority {
        Priority::Critical | Priority::High => Urgency::Immediate,
        Priority::Normal => Urgency::Soon,
        Priority::Low | Priority::Batch => Urgency::Batch,
    }
}

fn routing_request(intent: &Intent) -> RoutingRequest {
    let mut request = RoutingRequest::new(&intent.query)
        .category(category_for(&intent.intent_type))
        .urgency(urgency_for(intent.priority))
        .intent_id(&intent.id);
    if let Some(dir) = &intent.working_dir {
        request = request.working_dir(dir);
    }
    if let Some(executor) = &intent.executor_preference {
        request = request.force_executor(executor);
    }
    request
}

impl UnifiedRuntime {
    pub async fn create_intent(&self, new: NewIntent) -> Result<Intent> {
        let query = if new.query.trim().is_empty() {
            new.title.clone()
        } else {
            new.query
        };
        if query.trim().is_empty() {
            bail!("intent needs a title or a query");
        }
        let now = self.now();
        let intent = Intent {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            intent_type: new.intent_type,
            risk_level: new.risk_level,
            priority: new.priority.unwrap_or(Priority::Normal),
            scheduled_for: new.scheduled_for,
            deadline: new.deadline,
            lane: new.lane,
            executor_preference: new.executor_preference,
            query,
            working_dir: new.working_dir,
            source_proposal_id: new.source_proposal_id,
            status: IntentStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.store().insert_intent(&intent).await?;
        info!(intent_id = %intent.id, priority = %intent.priority, "Intent created: {}", intent.title);
        Ok(intent)
    }

    /// Failed intents go back to pending for the next check.
    pub async fn retry_intent(&self, id: &str) -> Result<Intent> {
        self.transition(id, IntentStatus::Failed, IntentStatus::Pending, "retry")
            .await
    }

    /// Stops future scheduling. A running intent is left to finish.
    pub async fn cancel_intent(&self, id: &str) -> Result<Intent> {
        self.transition(id, IntentStatus::Pending, IntentStatus::Cancelled, "cancel")
            .await
    }

    async fn transition(
        &self,
        id: &str,
        from: IntentStatus,
        to: IntentStatus,
        action: &'static str,
    ) -> Result<Intent> {
        let now = self.now();
        if !self.store().transition_intent(id, from, to, now).await? {
            let Some(intent) = self.store().get_intent(id).await? else {
                return Err(TransitionError::UnknownIntent(id.to_string()).into());
            };
            return Err(TransitionError::Intent {
                id: id.to_string(),
                status: intent.status,
                action,
            }
            .into());
        }
        info!(intent_id = id, "Intent {} -> {}", from, to);
        self.store()
            .get_intent(id)
            .await?
            .ok_or_else(|| TransitionError::UnknownIntent(id.to_string()).into())
    }

    pub async fn list_intents(&self, status: Option<IntentStatus>) -> Result<Vec<Intent>> {
        self.store().list_intents(status).await
    }

    pub async fn intent_runs(&self, id: &str) -> Result<Vec<Run>> {
        self.store().runs_for_intent(id).await
    }

    /// Run one intent through the router. Returns `None` when it was not
    /// started: already in flight, not pending, or no capacity left.
    pub async fn execute_intent(&self, id: &str) -> Result<Option<ExecutionOutcome>> {
        {
            let mut state = self.state.lock();
            if state.in_flight.contains(id) {
                info!(intent_id = id, "Intent already running, skipping");
                return Ok(None);
            }
            if state.in_flight.len() >= self.config.max_concurrent_runs {
                info!(intent_id = id, "At max concurrent runs, leaving intent pending");
                return Ok(None);
            }
            state.in_flight.insert(id.to_string());
        }
        let _guard = InFlight {
            state: &self.state,
            intent_id: id.to_string(),
        };

        if !self.store().try_start_intent(id, self.now()).await? {
            info!(intent_id = id, "Intent is not pending, skipping");
            return Ok(None);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        match self.run_started_intent(id, &run_id).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                error!(intent_id = id, run_id = %run_id, "Intent execution aborted: {:#}", e);
                self.fail_stranded(id, &run_id, &format!("{:#}", e)).await;
                Err(e)
            }
        }
    }

    /// Everything after the intent was claimed as running.
    async fn run_started_intent(&self, id: &str, run_id: &str) -> Result<ExecutionOutcome> {
        let Some(intent) = self.store().get_intent(id).await? else {
            return Err(TransitionError::UnknownIntent(id.to_string()).into());
        };

        self.store().start_run(run_id, id, self.now()).await?;
        self.emit(RuntimeEvent::IntentStarted {
            intent_id: id.to_string(),
            run_id: run_id.to_string(),
        });
        info!(intent_id = id, run_id = %run_id, "Executing intent: {}", intent.title);

        let request = routing_request(&intent);
        let options = ExecuteOptions {
            run_id: Some(run_id.to_string()),
            cancel: self.shutdown.child_token(),
        };
        match self.router.execute_with(&request, options).await {
            Ok(result) if result.success => self.on_success(&intent, run_id, result).await,
            Ok(result) if result.cancelled => self.on_cancelled(&intent, run_id, result).await,
            Ok(result) if result.exhausted => {
                self.on_exhausted(&intent, run_id, &request, result).await
            }
            Ok(result) => {
                let executor = result.executor.clone();
                self.on_failure(&intent, run_id, Some(&executor), result.exit_code, &result.output)
                    .await
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.on_failure(&intent, run_id, None, TRANSPORT_EXIT_CODE, &message)
                    .await
            }
        }
    }

    /// Leave no intent stuck in `running` when bookkeeping fails midway.
    async fn fail_stranded(&self, id: &str, run_id: &str, message: &str) {
        let now = self.now();
        let recorded = async {
            self.store()
                .set_intent_status(id, IntentStatus::Failed, now)
                .await?;
            let exists = self
                .store()
                .runs_for_intent(id)
                .await?
                .iter()
                .any(|run| run.id == run_id);
            if !exists {
                self.store().start_run(run_id, id, now).await?;
            }
            self.store()
                .finish_run(
                    run_id,
                    RunStatus::Failed,
                    None,
                    Some(message),
                    Some(TRANSPORT_EXIT_CODE),
                    false,
                    now,
                )
                .await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = recorded {
            error!(intent_id = id, "Could not record the failed run: {:#}", e);
        }
    }

    async fn on_success(
        &self,
        intent: &Intent,
        run_id: &str,
        result: ExecutorResult,
    ) -> Result<ExecutionOutcome> {
        let now = self.now();
        self.store()
            .finish_run(
                run_id,
                RunStatus::Completed,
                Some(&result.executor),
                Some(&result.output),
                Some(result.exit_code),
                false,
                now,
            )
            .await?;
        self.store()
            .set_intent_status(&intent.id, IntentStatus::Completed, now)
            .await?;
        info!(intent_id = %intent.id, executor = %result.executor, cost_usd = result.cost_usd, "Intent completed");
        self.emit(RuntimeEvent::IntentCompleted {
            intent_id: intent.id.clone(),
            run_id: run_id.to_string(),
            executor: result.executor.clone(),
        });
        Ok(ExecutionOutcome {
            intent_id: intent.id.clone(),
            run_id: run_id.to_string(),
            status: RunStatus::Completed,
            executor: Some(result.executor),
            exhausted: false,
        })
    }

    async fn on_cancelled(
        &self,
        intent: &Intent,
        run_id: &str,
        result: ExecutorResult,
    ) -> Result<ExecutionOutcome> {
        let now = self.now();
        self.store()
            .finish_run(
                run_id,
                RunStatus::Cancelled,
                Some(&result.executor),
                Some(&result.output),
                None,
                false,
                now,
            )
            .await?;
        self.store()
            .set_intent_status(&intent.id, IntentStatus::Cancelled, now)
            .await?;
        warn!(intent_id = %intent.id, "Intent run cancelled");
        Ok(ExecutionOutcome {
            intent_id: intent.id.clone(),
            run_id: run_id.to_string(),
            status: RunStatus::Cancelled,
            executor: Some(result.executor),
            exhausted: false,
        })
    }

    async fn on_failure(
        &self,
        intent: &Intent,
        run_id: &str,
        executor: Option<&str>,
        exit_code: i32,
        output: &str,
    ) -> Result<ExecutionOutcome> {
        let now = self.now();
        self.store()
            .finish_run(
                run_id,
                RunStatus::Failed,
                executor,
                Some(output),
                Some(exit_code),
                false,
                now,
            )
            .await?;
        self.store()
            .set_intent_status(&intent.id, IntentStatus::Failed, now)
            .await?;
        warn!(intent_id = %intent.id, exit_code, "Intent failed");
        self.emit(RuntimeEvent::IntentFailed {
            intent_id: intent.id.clone(),
            run_id: run_id.to_string(),
            exit_code,
            exhausted: false,
        });
        self.send_alert(failure_alert(
            intent,
            executor.unwrap_or("none"),
            exit_code,
            output,
        ))
        .await;
        Ok(ExecutionOutcome {
            intent_id: intent.id.clone(),
            run_id: run_id.to_string(),
            status: RunStatus::Failed,
            executor: executor.map(str::to_string),
            exhausted: false,
        })
    }

    /// Fail loud: fail the run and intent, pause pulling work for the
    /// cooldown window, park the request if the decision allowed it, and
    /// alert at most once per window.
    async fn on_exhausted(
        &self,
        intent: &Intent,
        run_id: &str,
        request: &RoutingRequest,
        result: ExecutorResult,
    ) -> Result<ExecutionOutcome> {
        let now = self.now();
        self.store()
            .finish_run(
                run_id,
                RunStatus::Failed,
                Some(&result.executor),
                Some(&result.output),
                Some(result.exit_code),
                true,
                now,
            )
            .await?;
        self.store()
            .set_intent_status(&intent.id, IntentStatus::Failed, now)
            .await?;

        let cooldown_ms = self.cooldown().as_millis() as i64;
        let until = now + cooldown_ms;
        self.state.lock().exhausted_until = Some(until);
        warn!(intent_id = %intent.id, tried = ?result.tried(), "All executors exhausted, cooling down");
        self.emit(RuntimeEvent::IntentFailed {
            intent_id: intent.id.clone(),
            run_id: run_id.to_string(),
            exit_code: result.exit_code,
            exhausted: true,
        });
        self.emit(RuntimeEvent::ExhaustionEntered {
            intent_id: intent.id.clone(),
            until_ms: until,
        });

        if result.decision.can_defer {
            let task_id = self
                .router
                .defer(request, &result.decision, None)
                .await?;
            self.emit(RuntimeEvent::TaskDeferred {
                task_id,
                intent_id: Some(intent.id.clone()),
            });
        }

        let mut pools = Vec::new();
        for executor in result.decision.chain() {
            if self.router.accounts().has_accounts(executor).await? {
                pools.push(self.router.accounts().get_pool_status(executor).await?);
            }
        }
        let text = exhaustion_alert(intent, &result.tried(), &pools, cooldown_ms);
        self.send_rate_limited_alert(text).await;

        Ok(ExecutionOutcome {
            intent_id: intent.id.clone(),
            run_id: run_id.to_string(),
            status: RunStatus::Failed,
            executor: Some(result.executor),
            exhausted: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_types_map_to_categories() {
        assert_eq!(category_for("code"), TaskCategory::CodeChange);
        assert_eq!(category_for("Code-Change"), TaskCategory::CodeChange);
        assert_eq!(category_for("research"), TaskCategory::Discovery);
        assert_eq!(category_for("review"), TaskCategory::Verification);
        assert_eq!(category_for("batch"), TaskCategory::Batch);
        assert_eq!(category_for("long-context"), TaskCategory::LongContext);
        assert_eq!(category_for("chore"), TaskCategory::General);
        assert_eq!(category_for(""), TaskCategory::General);
    }

    #[test]
    fn priorities_map_to_urgency() {
        assert_eq!(urgency_for(Priority::Critical), Urgency::Immediate);
        assert_eq!(urgency_for(Priority::High), Urgency::Immediate);
        assert_eq!(urgency_for(Priority::Normal), Urgency::Soon);
        assert_eq!(urgency_for(Priority::Low), Urgency::Batch);
        assert_eq!(urgency_for(Priority::Batch), Urgency::Batch);
    }
}
