use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::LifecycleComponent;
use crate::core::clock::Clock;
use crate::core::events::{EventBus, SignalType};
use crate::core::runtime::UnifiedRuntime;
use crate::core::store::Priority;

/// Owns the background loops of the daemon: the signal bus and the two
/// tickers that feed it.
pub struct RuntimeComponent {
    runtime: Arc<UnifiedRuntime>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeComponent {
    pub fn new(runtime: Arc<UnifiedRuntime>) -> Self {
        Self {
            runtime,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    fn spawn_ticker(&mut self, every: Duration, action: &'static str) {
        let bus: Arc<EventBus> = self.runtime.bus().clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        bus.signal(
                            SignalType::Internal,
                            "ticker",
                            json!({"action": action}),
                            Priority::Normal,
                        );
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl LifecycleComponent for RuntimeComponent {
    async fn on_init(&mut self) -> Result<()> {
        let now = self.runtime.router().clock().epoch_ms();
        let orphaned = self.runtime.store().cancel_orphaned_runs(now).await?;
        if orphaned > 0 {
            info!(orphaned, "Cancelled runs left over from a previous process");
        }
        self.runtime.router().seed_accounts().await?;
        self.runtime.register();
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let bus = self.runtime.bus().clone();
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move { bus.run(cancel).await }));

        let config = self.runtime.router().config();
        let check_every = Duration::from_secs(config.runtime.check_interval_secs.max(1));
        let deferred_every = Duration::from_secs(config.deferral.process_interval_secs.max(1));
        self.spawn_ticker(check_every, "check_work");
        self.spawn_ticker(deferred_every, "process_deferred");
        info!(
            check_secs = check_every.as_secs(),
            deferred_secs = deferred_every.as_secs(),
            "Runtime loops started"
        );
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.runtime.cancel_all();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Runtime loops stopped");
        Ok(())
    }
}
