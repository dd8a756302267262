use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::cost::CostCorrelation;
use super::types::{RoutingDecision, RoutingRequest, Urgency};
use super::Router;
use crate::core::executors::{AdapterOutput, InvokeRequest, QUOTA_EXIT_CODE, TRANSPORT_EXIT_CODE};
use crate::core::store::{DeferredStatus, IntentStatus, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Backend reported quota exhaustion; the account was cooled down.
    Quota,
    /// Non-zero exit or transport error.
    Failed,
    /// Nothing was invoked: no adapter, or no selectable account.
    Unavailable,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub executor: String,
    pub account: Option<String>,
    pub outcome: AttemptOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub detail: String,
}

/// Outcome of walking one decision's chain.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorResult {
    /// Executor that produced the final outcome (the primary if none ran).
    pub executor: String,
    pub account: Option<String>,
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub success: bool,
    /// No candidate succeeded and the chain had nothing left to try. A lone
    /// candidate that ran and failed is an ordinary failure instead.
    pub exhausted: bool,
    pub cancelled: bool,
    pub attempts: Vec<AttemptRecord>,
    pub decision: RoutingDecision,
}

impl ExecutorResult {
    /// Executors that were actually tried, in order, without repeats.
    pub fn tried(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for attempt in &self.attempts {
            if !names.contains(&attempt.executor.as_str()) {
                names.push(&attempt.executor);
            }
        }
        names
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub run_id: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeferredBatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub removed: usize,
    /// Removed without running because their intent had moved on.
    pub dropped: usize,
}

impl Router {
    pub async fn execute(&self, request: &RoutingRequest) -> Result<ExecutorResult> {
        self.execute_with(request, ExecuteOptions::default()).await
    }

    pub async fn execute_with(
        &self,
        request: &RoutingRequest,
        options: ExecuteOptions,
    ) -> Result<ExecutorResult> {
        let decision = self.decide(request).await?;
        info!(
            executor = %decision.executor,
            fallbacks = ?decision.fallbacks,
            "Routing: {}",
            decision.reason
        );
        self.execute_decision(request, decision, options).await
    }

    /// Walk `[primary, ...fallbacks]`: quota failures cool the account down
    /// and move on, generic failures move on while fallbacks remain.
    pub async fn execute_decision(
        &self,
        request: &RoutingRequest,
        decision: RoutingDecision,
        options: ExecuteOptions,
    ) -> Result<ExecutorResult> {
        let chain: Vec<String> = decision.chain().into_iter().map(str::to_string).collect();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut total_cost = 0.0;
        let mut last: Option<(String, Option<String>, AdapterOutput)> = None;

        for (idx, name) in chain.iter().enumerate() {
            let has_more = idx + 1 < chain.len();

            let Some(adapter) = self.executors.get(name) else {
                warn!(executor = %name, "No adapter registered, skipping");
                attempts.push(unavailable(name, "no adapter registered"));
                continue;
            };

            let account = if self.accounts.has_accounts(name).await? {
                match self.accounts.get_next_available(name).await? {
                    Some(account) => Some(account),
                    None => {
                        warn!(executor = %name, "Account pool exhausted, skipping");
                        attempts.push(unavailable(name, "no available account"));
                        continue;
                    }
                }
            } else {
                None
            };
            let identity = account.as_ref().map(|a| a.identity.clone());

            let invoke = InvokeRequest {
                query: &request.query,
                context: request.context.as_ref(),
                model: request.model.as_deref(),
                working_dir: request.working_dir.as_deref(),
                account: identity.as_deref(),
                cancel: options.cancel.clone(),
            };
            let invoked = adapter.invoke(&invoke).await;

            if options.cancel.is_cancelled() {
                info!(executor = %name, "Execution cancelled");
                attempts.push(AttemptRecord {
                    executor: name.clone(),
                    account: identity.clone(),
                    outcome: AttemptOutcome::Cancelled,
                    exit_code: None,
                    duration_ms: 0,
                    cost_usd: 0.0,
                    detail: "cancelled".to_string(),
                });
                return Ok(ExecutorResult {
                    executor: name.clone(),
                    account: identity,
                    output: "cancelled".to_string(),
                    exit_code: TRANSPORT_EXIT_CODE,
                    duration_ms: attempts.iter().map(|a| a.duration_ms).sum(),
                    cost_usd: total_cost,
                    success: false,
                    exhausted: false,
                    cancelled: true,
                    attempts,
                    decision,
                });
            }

            let (output, invoked_ok) = match invoked {
                Ok(output) => (output, true),
                Err(e) => {
                    warn!(executor = %name, "Adapter error: {:#}", e);
                    (
                        AdapterOutput {
                            output: format!("{:#}", e),
                            exit_code: TRANSPORT_EXIT_CODE,
                            duration_ms: 0,
                            input_tokens: 0,
                            output_tokens: 0,
                        },
                        false,
                    )
                }
            };

            let mut cost_usd = 0.0;
            if invoked_ok {
                if !self.costs.is_free(name) {
                    cost_usd = self
                        .costs
                        .track(
                            name,
                            output.input_tokens,
                            output.output_tokens,
                            CostCorrelation {
                                account: identity.clone(),
                                job_id: request.job_id.clone(),
                                intent_id: request.intent_id.clone(),
                                run_id: options.run_id.clone(),
                                query: Some(request.query.clone()),
                            },
                        )
                        .await?;
                    total_cost += cost_usd;
                }
                if let Some(account) = &account {
                    self.accounts
                        .increment_token_usage(account.id, output.input_tokens + output.output_tokens)
                        .await?;
                }
            }

            let outcome = if output.is_success() {
                AttemptOutcome::Success
            } else if output.is_quota() {
                AttemptOutcome::Quota
            } else {
                AttemptOutcome::Failed
            };
            match (&account, outcome) {
                (Some(account), AttemptOutcome::Success) => {
                    self.accounts.report_success(account.id).await?
                }
                (Some(account), AttemptOutcome::Quota) => {
                    self.accounts.report_quota_error(account.id).await?
                }
                (Some(account), _) => self.accounts.report_error(account.id).await?,
                (None, _) => {}
            }

            attempts.push(AttemptRecord {
                executor: name.clone(),
                account: identity.clone(),
                outcome,
                exit_code: Some(output.exit_code),
                duration_ms: output.duration_ms,
                cost_usd,
                detail: summarize(&output.output),
            });

            let success = outcome == AttemptOutcome::Success;
            last = Some((name.clone(), identity, output));
            if success {
                break;
            }
            if outcome == AttemptOutcome::Failed && has_more {
                warn!(executor = %name, "Executor failed, trying next fallback");
            }
        }

        let duration_ms = attempts.iter().map(|a| a.duration_ms).sum();
        let result = match last {
            Some((executor, account, output)) if output.is_success() => ExecutorResult {
                executor,
                account,
                output: output.output,
                exit_code: 0,
                duration_ms,
                cost_usd: total_cost,
                success: true,
                exhausted: false,
                cancelled: false,
                attempts,
                decision,
            },
            other => {
                // A lone candidate that ran and failed is an ordinary failure;
                // anything else means the chain has nothing left to offer.
                let exhausted = chain.len() > 1
                    || !matches!(&other, Some((_, _, output)) if !output.is_quota());
                let (executor, account, output, exit_code) = match other {
                    Some((executor, account, output)) => {
                        (executor, account, output.output, output.exit_code)
                    }
                    None => (
                        decision.executor.clone(),
                        None,
                        "all executors exhausted".to_string(),
                        QUOTA_EXIT_CODE,
                    ),
                };
                if exhausted {
                    error!(chain = ?chain, "Executor chain exhausted");
                } else {
                    warn!(executor = %executor, exit_code, "Executor failed with no fallback");
                }
                ExecutorResult {
                    executor,
                    account,
                    output,
                    exit_code,
                    duration_ms,
                    cost_usd: total_cost,
                    success: false,
                    exhausted,
                    cancelled: false,
                    attempts,
                    decision,
                }
            }
        };
        Ok(result)
    }

    /// Re-attempt due deferred tasks with urgency forced to immediate so they
    /// cannot re-defer. Completed tasks and tasks out of attempts are removed.
    pub async fn process_deferred_batch(&self, limit: usize) -> Result<DeferredBatchReport> {
        self.process_deferred_batch_with(limit, &StoreOnly).await
    }

    /// Like `process_deferred_batch`, with intent claims shared with a
    /// runtime. A task whose intent has moved on since it was parked
    /// (cancelled, retried, completed or in flight) is dropped unexecuted.
    pub async fn process_deferred_batch_with(
        &self,
        limit: usize,
        claims: &dyn IntentClaims,
    ) -> Result<DeferredBatchReport> {
        let mut report = DeferredBatchReport::default();
        let tasks = self.deferral.get_pending(limit).await?;
        let max_attempts = self.config.deferral.max_attempts;

        for task in tasks {
            report.processed += 1;
            let request = task.request.clone().urgency(Urgency::Immediate);

            let rerun = match &request.intent_id {
                Some(intent_id) => match self.claim_deferred_intent(intent_id, claims).await? {
                    Some(rerun) => Some(rerun),
                    None => {
                        self.deferral.remove(&task.id).await?;
                        report.dropped += 1;
                        report.removed += 1;
                        info!(task_id = %task.id, intent_id = %intent_id, "Intent moved on, deferred task dropped");
                        continue;
                    }
                },
                None => None,
            };

            let options = ExecuteOptions {
                run_id: rerun.as_ref().map(|r| r.run_id.clone()),
                cancel: CancellationToken::new(),
            };
            let executed = self.execute_with(&request, options).await;
            if let Some(rerun) = &rerun {
                self.settle_deferred_intent(rerun, &executed).await?;
            }
            drop(rerun);

            let outcome = match executed {
                Ok(result) if result.success => Ok(result),
                Ok(result) => Err(format!(
                    "{} (exit {}): {}",
                    result.executor,
                    result.exit_code,
                    summarize(&result.output)
                )),
                Err(e) => Err(format!("{:#}", e)),
            };

            match outcome {
                Ok(result) => {
                    report.succeeded += 1;
                    self.deferral
                        .update_status(&task.id, DeferredStatus::Completed, None)
                        .await?;
                    self.deferral.remove(&task.id).await?;
                    report.removed += 1;
                    info!(task_id = %task.id, executor = %result.executor, "Deferred task completed");
                }
                Err(message) => {
                    report.failed += 1;
                    let attempts = self
                        .deferral
                        .update_status(&task.id, DeferredStatus::Failed, Some(&message))
                        .await?
                        .unwrap_or(max_attempts);
                    if attempts >= max_attempts {
                        self.deferral.remove(&task.id).await?;
                        report.removed += 1;
                        error!(
                            task_id = %task.id,
                            attempts,
                            "Deferred task dropped after final attempt: {}",
                            message
                        );
                    } else {
                        self.deferral.requeue(&task.id).await?;
                        warn!(task_id = %task.id, attempts, "Deferred task failed: {}", message);
                    }
                }
            }
        }
        if report.processed > 0 {
            info!(?report, "Deferred batch processed");
        }
        Ok(report)
    }

    /// Take a failed intent back to running and open its run before the
    /// re-run starts. `None` when the intent is held elsewhere or is no
    /// longer failed.
    async fn claim_deferred_intent<'a>(
        &self,
        intent_id: &str,
        claims: &'a dyn IntentClaims,
    ) -> Result<Option<DeferredRerun<'a>>> {
        if !claims.try_claim(intent_id) {
            return Ok(None);
        }
        let claim = Claim {
            claims,
            intent_id: intent_id.to_string(),
        };
        let now = self.clock.epoch_ms();
        if !self
            .store
            .transition_intent(intent_id, IntentStatus::Failed, IntentStatus::Running, now)
            .await?
        {
            return Ok(None);
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.store.start_run(&run_id, intent_id, now).await {
            self.store
                .set_intent_status(intent_id, IntentStatus::Failed, now)
                .await?;
            return Err(e);
        }
        Ok(Some(DeferredRerun { claim, run_id }))
    }

    async fn settle_deferred_intent(
        &self,
        rerun: &DeferredRerun<'_>,
        executed: &Result<ExecutorResult>,
    ) -> Result<()> {
        let now = self.clock.epoch_ms();
        let message;
        let (status, executor, output, exit_code, exhausted) = match executed {
            Ok(result) => (
                if result.success {
                    RunStatus::Completed
                } else {
                    RunStatus::Failed
                },
                Some(result.executor.as_str()),
                result.output.as_str(),
                result.exit_code,
                !result.success && result.exhausted,
            ),
            Err(e) => {
                message = format!("{:#}", e);
                (RunStatus::Failed, None, message.as_str(), TRANSPORT_EXIT_CODE, false)
            }
        };
        let intent_id = &rerun.claim.intent_id;
        self.store
            .finish_run(&rerun.run_id, status, executor, Some(output), Some(exit_code), exhausted, now)
            .await?;
        let intent_status = if status == RunStatus::Completed {
            IntentStatus::Completed
        } else {
            IntentStatus::Failed
        };
        self.store.set_intent_status(intent_id, intent_status, now).await?;
        info!(intent_id = %intent_id, run_id = %rerun.run_id, "Deferred re-run of intent: {}", intent_status);
        Ok(())
    }
}

/// Exclusive in-flight claims on intents. The runtime holds one per
/// executing intent; deferred re-runs take one before touching the intent.
pub trait IntentClaims: Send + Sync {
    /// `false` when the intent is already held.
    fn try_claim(&self, intent_id: &str) -> bool;
    fn release(&self, intent_id: &str);
}

/// No in-memory claims; the store's conditional status update still applies.
struct StoreOnly;

impl IntentClaims for StoreOnly {
    fn try_claim(&self, _intent_id: &str) -> bool {
        true
    }

    fn release(&self, _intent_id: &str) {}
}

/// Releases the claim however the re-run ends.
struct Claim<'a> {
    claims: &'a dyn IntentClaims,
    intent_id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.release(&self.intent_id);
    }
}

struct DeferredRerun<'a> {
    claim: Claim<'a>,
    run_id: String,
}

fn unavailable(executor: &str, detail: &str) -> AttemptRecord {
    AttemptRecord {
        executor: executor.to_string(),
        account: None,
        outcome: AttemptOutcome::Unavailable,
        exit_code: None,
        duration_ms: 0,
        cost_usd: 0.0,
        detail: detail.to_string(),
    }
}

/// First line of output, capped for logs and attempt records.
fn summarize(output: &str) -> String {
    let line = output.lines().next().unwrap_or_default();
    line.chars().take(200).collect()
}
