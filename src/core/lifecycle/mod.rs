mod loops;

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;
use tracing::{error, info, warn};

use crate::core::events::{EventBus, SignalType};
use crate::core::store::Priority;

pub use loops::RuntimeComponent;

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    ConnectInterfaces,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    /// Queue an internal `daily_maintenance` signal on the given cron schedule.
    pub async fn schedule_maintenance(&mut self, cron: &str, bus: Arc<EventBus>) -> Result<()> {
        match tokio_cron_scheduler::Job::new_async(cron, move |_uuid, mut _l| {
            let bus = bus.clone();
            Box::pin(async move {
                bus.signal(
                    SignalType::Internal,
                    "cron",
                    json!({"action": "daily_maintenance"}),
                    Priority::Low,
                );
            })
        }) {
            Ok(job) => {
                self.scheduler.add(job).await?;
                info!(cron, "Daily maintenance scheduled");
            }
            Err(e) => {
                error!(cron, "Failed to create maintenance cron: {}", e);
            }
        }
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Connect Interfaces");
        self.state = LifecycleState::ConnectInterfaces;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;

        Ok(())
    }

    /// Components shut down in reverse attach order.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}
