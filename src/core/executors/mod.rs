pub mod cli;
#[cfg(test)]
pub mod fake;
pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::ExecutorDef;

pub use cli::CliAdapter;
pub use http::HttpApiAdapter;

/// Exit code an adapter reports when the backend refused the call for quota
/// reasons (EX_TEMPFAIL). The driver cools the account down and falls back.
pub const QUOTA_EXIT_CODE: i32 = 75;

/// Exit code used for transport errors that never produced a process exit.
pub const TRANSPORT_EXIT_CODE: i32 = -1;

/// What one adapter call is asked to do.
#[derive(Debug, Clone)]
pub struct InvokeRequest<'a> {
    pub query: &'a str,
    pub context: Option<&'a serde_json::Value>,
    pub model: Option<&'a str>,
    pub working_dir: Option<&'a str>,
    /// Identity of the claimed account, if the executor is pool-backed.
    pub account: Option<&'a str>,
    pub cancel: CancellationToken,
}

impl InvokeRequest<'_> {
    /// Query with the context appended, as sent to the backend.
    pub fn prompt(&self) -> String {
        match self.context {
            Some(ctx) => {
                let rendered = serde_json::to_string_pretty(ctx).unwrap_or_default();
                format!("{}\n\nContext:\n{}", self.query, rendered)
            }
            None => self.query.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AdapterOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn is_quota(&self) -> bool {
        self.exit_code == QUOTA_EXIT_CODE
    }
}

/// One backend. Adapters own their transport; routing never spawns or
/// calls the network itself.
#[async_trait]
pub trait ExecutorAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, request: &InvokeRequest<'_>) -> Result<AdapterOutput>;
}

/// Executor name to adapter.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    adapters: HashMap<String, Arc<dyn ExecutorAdapter>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(defs: &[ExecutorDef]) -> Result<Self> {
        let mut registry = Self::new();
        for def in defs {
            let adapter: Arc<dyn ExecutorAdapter> = match def {
                ExecutorDef::Cli { .. } => Arc::new(CliAdapter::from_def(def)?),
                ExecutorDef::Http { .. } => Arc::new(HttpApiAdapter::from_def(def)?),
            };
            registry.register(adapter);
        }
        info!("Registered {} executor adapters", registry.adapters.len());
        Ok(registry)
    }

    /// Adds or replaces the adapter under its own name.
    pub fn register(&mut self, adapter: Arc<dyn ExecutorAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutorAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_registers_every_executor() {
        let defs = crate::core::config::DispatchConfig::default().executors;
        let registry = ExecutorRegistry::from_config(&defs).unwrap();
        assert_eq!(
            registry.names(),
            vec!["anthropic-api", "claude-code", "codex", "gemini"]
        );
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn prompt_appends_context() {
        let ctx = serde_json::json!({"file": "a.rs"});
        let req = InvokeRequest {
            query: "fix it",
            context: Some(&ctx),
            model: None,
            working_dir: None,
            account: None,
            cancel: CancellationToken::new(),
        };
        let prompt = req.prompt();
        assert!(prompt.starts_with("fix it\n\nContext:\n"));
        assert!(prompt.contains("a.rs"));
    }
}
