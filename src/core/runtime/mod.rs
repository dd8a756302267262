pub mod alerts;
mod intents;
mod proposals;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::core::config::RuntimeConfig;
use crate::core::events::{EventBus, RuntimeEvent, Signal, SignalHandler, SignalType};
use crate::core::notify::NotificationSink;
use crate::core::routing::{DeferredBatchReport, IntentClaims, Router};
use crate::core::store::{IntentStatus, Store};

pub use intents::ExecutionOutcome;
pub use proposals::ApprovalOutcome;

/// Lifecycle rule violations. Wrapped in `anyhow::Error`; callers can
/// `downcast_ref` to tell them apart from storage failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("unknown intent '{0}'")]
    UnknownIntent(String),
    #[error("cannot {action} intent '{id}' while it is {status}")]
    Intent {
        id: String,
        status: IntentStatus,
        action: &'static str,
    },
    #[error("unknown proposal '{0}'")]
    UnknownProposal(String),
    #[error("proposal '{0}' was rejected")]
    ProposalRejected(String),
    #[error("proposal '{0}' is closed")]
    ProposalClosed(String),
}

/// In-memory runtime state. Everything durable lives in the store.
#[derive(Debug, Default)]
pub struct RuntimeState {
    in_flight: HashSet<String>,
    exhausted_until: Option<i64>,
    last_alert_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub in_flight: Vec<String>,
    pub exhausted_until: Option<i64>,
}

/// Turns signals into intent executions, tracks runs and proposals, and
/// raises alerts when every executor is exhausted.
pub struct UnifiedRuntime {
    router: Arc<Router>,
    bus: Arc<EventBus>,
    notifier: Arc<dyn NotificationSink>,
    config: RuntimeConfig,
    state: Mutex<RuntimeState>,
    shutdown: CancellationToken,
}

impl UnifiedRuntime {
    pub fn new(
        router: Arc<Router>,
        bus: Arc<EventBus>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        let config = router.config().runtime.clone();
        Arc::new(Self {
            router,
            bus,
            notifier,
            config,
            state: Mutex::new(RuntimeState::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe to the signal types the runtime consumes.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn SignalHandler> = Arc::new(RuntimeSignals(self.clone()));
        for signal_type in [SignalType::Time, SignalType::Internal, SignalType::Telegram] {
            self.bus.on_signal(signal_type, handler.clone());
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Store {
        self.router.store()
    }

    fn now(&self) -> i64 {
        self.router.clock().epoch_ms()
    }

    pub fn status(&self) -> RuntimeStatus {
        let state = self.state.lock();
        let mut in_flight: Vec<String> = state.in_flight.iter().cloned().collect();
        in_flight.sort();
        RuntimeStatus {
            in_flight,
            exhausted_until: state.exhausted_until,
        }
    }

    /// Remaining exhaustion cooldown, if one is active.
    pub fn exhaustion_remaining_ms(&self) -> Option<i64> {
        let now = self.now();
        self.state
            .lock()
            .exhausted_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Stop waiting on in-progress adapter calls; their runs end as cancelled.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Start as many due intents as capacity allows. Returns the spawned
    /// executions so callers can wait on them; the signal loop does not.
    pub async fn check_pending_work(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        if let Some(remaining) = self.exhaustion_remaining_ms() {
            debug!(remaining_ms = remaining, "In exhaustion cooldown, not pulling work");
            return Ok(Vec::new());
        }
        let capacity = self
            .config
            .max_concurrent_runs
            .saturating_sub(self.state.lock().in_flight.len());
        if capacity == 0 {
            debug!("At max concurrent runs, deferring to next check");
            return Ok(Vec::new());
        }

        let intents = self
            .store()
            .next_eligible_intents(self.now(), capacity)
            .await?;
        let mut handles = Vec::with_capacity(intents.len());
        for intent in intents {
            handles.push(self.spawn_intent(intent.id));
        }
        Ok(handles)
    }

    fn spawn_intent(self: &Arc<Self>, intent_id: String) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.execute_intent(&intent_id).await {
                error!(intent_id = %intent_id, "Intent execution error: {:#}", e);
            }
        })
    }

    pub async fn process_deferred(&self) -> Result<DeferredBatchReport> {
        let limit = self.router.config().deferral.batch_size;
        self.router.process_deferred_batch_with(limit, self).await
    }

    /// Reset daily token counters, then retry deferred work.
    pub async fn daily_maintenance(&self) -> Result<DeferredBatchReport> {
        info!("Running daily maintenance");
        self.router.accounts().reset_daily_token_counts().await?;
        self.process_deferred().await
    }

    pub async fn handle_signal(self: &Arc<Self>, signal: &Signal) -> Result<()> {
        debug!(signal_id = %signal.id, signal_type = %signal.signal_type, source = %signal.source, "Handling signal");
        match signal.signal_type {
            SignalType::Time => match signal.data_str("intent_id") {
                Some(intent_id) => {
                    if let Some(remaining) = self.exhaustion_remaining_ms() {
                        info!(
                            intent_id,
                            remaining_ms = remaining,
                            "In exhaustion cooldown, leaving intent pending"
                        );
                    } else {
                        self.spawn_intent(intent_id.to_string());
                    }
                }
                None => {
                    self.check_pending_work().await?;
                }
            },
            SignalType::Internal => match signal.data_str("action") {
                Some("check_work") => {
                    self.check_pending_work().await?;
                }
                Some("process_deferred") => {
                    self.process_deferred().await?;
                }
                Some("daily_maintenance") => {
                    self.daily_maintenance().await?;
                }
                other => warn!(action = ?other, "Unknown internal signal action"),
            },
            SignalType::Telegram => self.handle_user_action(signal).await?,
            SignalType::File | SignalType::Webhook => {
                debug!(signal_type = %signal.signal_type, "Signal type not consumed by runtime");
            }
        }
        Ok(())
    }

    async fn handle_user_action(self: &Arc<Self>, signal: &Signal) -> Result<()> {
        let (Some(action), Some(id)) = (signal.data_str("action"), signal.data_str("id")) else {
            warn!(signal_id = %signal.id, "User action signal without action/id");
            return Ok(());
        };
        match action {
            "approve" => {
                self.approve_proposal(id).await?;
            }
            "reject" => {
                self.reject_proposal(id, signal.data_str("reason")).await?;
            }
            "retry" => {
                self.retry_intent(id).await?;
            }
            "cancel" => {
                self.cancel_intent(id).await?;
            }
            other => warn!(action = other, "Unknown user action"),
        }
        Ok(())
    }

    /// Send at most one alert per exhaustion cooldown window.
    async fn send_rate_limited_alert(&self, text: String) {
        let now = self.now();
        let window = (self.config.exhaustion_cooldown_secs * 1000) as i64;
        {
            let mut state = self.state.lock();
            if let Some(last) = state.last_alert_at
                && now - last < window
            {
                debug!("Alert suppressed, one already sent in this window");
                return;
            }
            state.last_alert_at = Some(now);
        }
        self.send_alert(text).await;
    }

    async fn send_alert(&self, text: String) {
        if let Err(e) = self.notifier.send_message(&text).await {
            error!("Failed to send alert: {:#}", e);
        }
    }

    fn emit(&self, event: RuntimeEvent) {
        self.bus.emit(&event);
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.exhaustion_cooldown_secs)
    }
}

impl IntentClaims for UnifiedRuntime {
    fn try_claim(&self, intent_id: &str) -> bool {
        self.state.lock().in_flight.insert(intent_id.to_string())
    }

    fn release(&self, intent_id: &str) {
        self.state.lock().in_flight.remove(intent_id);
    }
}

/// Bridges bus signals into the runtime.
struct RuntimeSignals(Arc<UnifiedRuntime>);

#[async_trait]
impl SignalHandler for RuntimeSignals {
    async fn handle(&self, signal: &Signal) -> Result<()> {
        self.0.handle_signal(signal).await
    }
}

#[cfg(test)]
mod tests;
