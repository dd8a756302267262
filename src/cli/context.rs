use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::DispatchConfig;
use crate::core::events::EventBus;
use crate::core::executors::ExecutorRegistry;
use crate::core::notify::{LogNotifier, NotificationSink};
use crate::core::routing::Router;
use crate::core::runtime::UnifiedRuntime;
use crate::core::store::Store;
use crate::interfaces::telegram::TelegramNotifier;
use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE: &str = "config.toml";
pub const DB_FILE: &str = "switchyard.db";

/// Everything a command needs, wired from `<data_dir>/config.toml`.
pub struct AppContext {
    pub data_dir: PathBuf,
    pub config: DispatchConfig,
    pub runtime: Arc<UnifiedRuntime>,
}

impl AppContext {
    pub fn data_dir() -> PathBuf {
        NativePlatform::data_dir()
    }

    pub fn run_dir() -> PathBuf {
        Self::data_dir().join("run")
    }

    pub fn load_config() -> Result<DispatchConfig> {
        DispatchConfig::load(&Self::data_dir().join(CONFIG_FILE))
    }

    pub async fn open(config: DispatchConfig) -> Result<Self> {
        let data_dir = Self::data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        NativePlatform::restrict_dir_permissions(&data_dir);

        let store = Store::open(&data_dir.join(DB_FILE))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let executors = ExecutorRegistry::from_config(&config.executors)?;
        let router = Arc::new(Router::new(
            store,
            clock.clone(),
            config.clone(),
            executors,
        ));
        let bus = Arc::new(EventBus::new(
            clock,
            Duration::from_millis(config.runtime.idle_sleep_ms),
        ));
        let runtime = UnifiedRuntime::new(router, bus, notifier(&config));
        Ok(Self {
            data_dir,
            config,
            runtime,
        })
    }

    pub fn router(&self) -> &Router {
        self.runtime.router()
    }
}

/// Bot token from the configured env var, if set.
pub fn telegram_token(config: &DispatchConfig) -> Option<String> {
    std::env::var(&config.notify.telegram_token_env)
        .ok()
        .filter(|t| !t.trim().is_empty())
}

fn notifier(config: &DispatchConfig) -> Arc<dyn NotificationSink> {
    match (telegram_token(config), config.notify.chat_id) {
        (Some(token), Some(chat_id)) => {
            info!(chat_id, "Alerts go to telegram");
            Arc::new(TelegramNotifier::new(&token, chat_id))
        }
        _ => Arc::new(LogNotifier),
    }
}
