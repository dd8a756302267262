mod exhaustion;
mod intents;
mod proposals;
mod signals;

use std::sync::Arc;
use std::time::Duration;

use super::UnifiedRuntime;
use crate::core::clock::FakeClock;
use crate::core::config::DispatchConfig;
use crate::core::events::EventBus;
use crate::core::executors::ExecutorRegistry;
use crate::core::executors::fake::FakeAdapter;
use crate::core::notify::RecordingNotifier;
use crate::core::routing::Router;
use crate::core::store::{NewIntent, Store};

pub(super) struct Harness {
    pub runtime: Arc<UnifiedRuntime>,
    pub clock: FakeClock,
    pub notifier: RecordingNotifier,
}

pub(super) fn harness(adapters: &[&FakeAdapter]) -> Harness {
    harness_with(DispatchConfig::default(), adapters)
}

pub(super) fn harness_with(config: DispatchConfig, adapters: &[&FakeAdapter]) -> Harness {
    let clock = FakeClock::new();
    let mut registry = ExecutorRegistry::new();
    for adapter in adapters {
        registry.register(Arc::new((*adapter).clone()));
    }
    let router = Arc::new(Router::new(
        Store::open_in_memory().unwrap(),
        Arc::new(clock.clone()),
        config,
        registry,
    ));
    let bus = Arc::new(EventBus::new(
        Arc::new(clock.clone()),
        Duration::from_millis(5),
    ));
    let notifier = RecordingNotifier::default();
    let runtime = UnifiedRuntime::new(router, bus, Arc::new(notifier.clone()));
    runtime.register();
    Harness {
        runtime,
        clock,
        notifier,
    }
}

pub(super) fn new_intent(title: &str) -> NewIntent {
    NewIntent {
        title: title.to_string(),
        query: format!("do: {}", title),
        ..Default::default()
    }
}

/// Wait for every execution spawned by a check.
pub(super) async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        handle.await.unwrap();
    }
}
