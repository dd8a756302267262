pub mod signal;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::core::store::Priority;

pub use signal::{Signal, SignalQueue, SignalType};

/// Subscription key that matches every event type.
pub const WILDCARD: &str = "*";

/// Lifecycle events published by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    IntentStarted {
        intent_id: String,
        run_id: String,
    },
    IntentCompleted {
        intent_id: String,
        run_id: String,
        executor: String,
    },
    IntentFailed {
        intent_id: String,
        run_id: String,
        exit_code: i32,
        exhausted: bool,
    },
    ExhaustionEntered {
        intent_id: String,
        until_ms: i64,
    },
    ProposalApproved {
        proposal_id: String,
        stage: String,
        intent_id: Option<String>,
    },
    ProposalRejected {
        proposal_id: String,
        reason: Option<String>,
    },
    TaskDeferred {
        task_id: String,
        intent_id: Option<String>,
    },
}

impl RuntimeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RuntimeEvent::IntentStarted { .. } => "intent.started",
            RuntimeEvent::IntentCompleted { .. } => "intent.completed",
            RuntimeEvent::IntentFailed { .. } => "intent.failed",
            RuntimeEvent::ExhaustionEntered { .. } => "exhaustion.entered",
            RuntimeEvent::ProposalApproved { .. } => "proposal.approved",
            RuntimeEvent::ProposalRejected { .. } => "proposal.rejected",
            RuntimeEvent::TaskDeferred { .. } => "task.deferred",
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&RuntimeEvent) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: EventHandler,
}

/// Consumer of dequeued signals.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, signal: &Signal) -> Result<()>;
}

/// Typed pub/sub for lifecycle events plus the priority signal queue.
pub struct EventBus {
    clock: Arc<dyn Clock>,
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    next_subscription: AtomicU64,
    queue: Mutex<SignalQueue>,
    signal_handlers: RwLock<HashMap<SignalType, Vec<Arc<dyn SignalHandler>>>>,
    wakeup: Notify,
    idle_sleep: Duration,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>, idle_sleep: Duration) -> Self {
        Self {
            clock,
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            queue: Mutex::new(SignalQueue::new()),
            signal_handlers: RwLock::new(HashMap::new()),
            wakeup: Notify::new(),
            idle_sleep,
        }
    }

    // ── pub/sub ──

    /// Subscribe to one event type, or to all with [`WILDCARD`].
    pub fn on(&self, event_type: &str, handler: EventHandler) -> SubscriptionId {
        self.subscribe(event_type, handler, false)
    }

    /// Like [`EventBus::on`], removed after the first delivery.
    pub fn once(&self, event_type: &str, handler: EventHandler) -> SubscriptionId {
        self.subscribe(event_type, handler, true)
    }

    fn subscribe(&self, event_type: &str, handler: EventHandler, once: bool) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push(Subscription { id, once, handler });
        id
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let mut removed = false;
        for subs in subscribers.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        subscribers.retain(|_, subs| !subs.is_empty());
        removed
    }

    /// Deliver to exact-type subscribers then wildcard subscribers. A failing
    /// or panicking handler is logged and never stops the others.
    pub fn emit(&self, event: &RuntimeEvent) -> usize {
        let event_type = event.event_type();
        let handlers: Vec<EventHandler> = {
            let mut subscribers = self.subscribers.lock();
            let mut handlers = Vec::new();
            for key in [event_type, WILDCARD] {
                if let Some(subs) = subscribers.get_mut(key) {
                    handlers.extend(subs.iter().map(|s| s.handler.clone()));
                    subs.retain(|s| !s.once);
                }
            }
            subscribers.retain(|_, subs| !subs.is_empty());
            handlers
        };

        debug!(event_type, subscribers = handlers.len(), "Emitting event");
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event_type, "Event handler failed: {:#}", e),
                Err(_) => error!(event_type, "Event handler panicked"),
            }
        }
        handlers.len()
    }

    // ── signals ──

    pub fn on_signal(&self, signal_type: SignalType, handler: Arc<dyn SignalHandler>) {
        self.signal_handlers
            .write()
            .entry(signal_type)
            .or_default()
            .push(handler);
    }

    /// Enqueue a signal and wake the processing loop. Returns the signal id.
    pub fn signal(
        &self,
        signal_type: SignalType,
        source: &str,
        data: serde_json::Value,
        priority: Priority,
    ) -> String {
        let signal = Signal {
            id: uuid::Uuid::new_v4().to_string(),
            signal_type,
            priority,
            source: source.to_string(),
            data,
            timestamp: self.clock.epoch_ms(),
        };
        let id = signal.id.clone();
        debug!(signal_id = %id, %signal_type, %priority, source, "Signal queued");
        self.queue.lock().push(signal);
        self.wakeup.notify_one();
        id
    }

    pub fn pending_signals(&self) -> usize {
        self.queue.lock().len()
    }

    /// Dequeue one signal and run its handlers to completion. The handlers
    /// run in their own task, aborted if `cancel` fires first. Returns false
    /// when the queue was empty.
    pub async fn process_next(&self, cancel: &CancellationToken) -> bool {
        let next = self.queue.lock().pop();
        let Some(signal) = next else {
            return false;
        };
        let handlers = self
            .signal_handlers
            .read()
            .get(&signal.signal_type)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(signal_id = %signal.id, signal_type = %signal.signal_type, "No handler for signal");
            return true;
        }

        let signal_id = signal.id.clone();
        let task = tokio::spawn(async move {
            for handler in handlers {
                if let Err(e) = handler.handle(&signal).await {
                    warn!(
                        signal_id = %signal.id,
                        signal_type = %signal.signal_type,
                        "Signal handler failed: {:#}",
                        e
                    );
                }
            }
        });
        let abort = task.abort_handle();
        tokio::select! {
            joined = task => {
                if let Err(e) = joined && e.is_panic() {
                    error!(signal_id = %signal_id, "Signal handler panicked");
                }
            }
            _ = cancel.cancelled() => {
                abort.abort();
                info!(signal_id = %signal_id, "Signal handling aborted by shutdown");
            }
        }
        true
    }

    /// Processing loop: one dequeue at a time until cancelled, idling on a
    /// wakeup or `idle_sleep` when the queue is empty.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Event bus loop started");
        while !cancel.is_cancelled() {
            if self.process_next(&cancel).await {
                continue;
            }
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.idle_sleep) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!("Event bus loop stopped");
    }
}
