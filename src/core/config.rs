use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Process-level configuration. Every field has a default, so a missing or
/// partial `config.toml` is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub log_level: String,
    pub routing: RoutingRoles,
    /// USD per 1K tokens. Executors missing from this table are free.
    pub rates: BTreeMap<String, Rate>,
    pub accounts: AccountsConfig,
    pub deferral: DeferralConfig,
    pub runtime: RuntimeConfig,
    pub executors: Vec<ExecutorDef>,
    pub notify: NotifyConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let mut rates = BTreeMap::new();
        rates.insert(
            "anthropic-api".to_string(),
            Rate {
                input_per_1k: 0.003,
                output_per_1k: 0.015,
            },
        );
        Self {
            log_level: "info".to_string(),
            routing: RoutingRoles::default(),
            rates,
            accounts: AccountsConfig::default(),
            deferral: DeferralConfig::default(),
            runtime: RuntimeConfig::default(),
            executors: default_executors(),
            notify: NotifyConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn rate_for(&self, executor: &str) -> Rate {
        self.rates.get(executor).copied().unwrap_or_default()
    }
}

/// Which executor plays each routing role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingRoles {
    /// Free provider with rotating accounts, used for discovery/general work.
    pub rotating_pool: String,
    pub long_context: String,
    /// The only executor allowed to change files.
    pub tool_capable: String,
    pub deep_reasoning: String,
    pub general_purpose: String,
    pub batch: String,
    pub metered: String,
    pub long_context_threshold_tokens: u64,
}

impl Default for RoutingRoles {
    fn default() -> Self {
        Self {
            rotating_pool: "gemini".to_string(),
            long_context: "gemini".to_string(),
            tool_capable: "claude-code".to_string(),
            deep_reasoning: "codex".to_string(),
            general_purpose: "anthropic-api".to_string(),
            batch: "gemini".to_string(),
            metered: "anthropic-api".to_string(),
            long_context_threshold_tokens: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Rate {
    pub fn is_free(&self) -> bool {
        self.input_per_1k == 0.0 && self.output_per_1k == 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    pub max_consecutive_failures: i64,
    pub quota_cooldown_secs: u64,
    pub seed: Vec<SeedAccount>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            quota_cooldown_secs: 3600,
            seed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAccount {
    pub executor: String,
    pub identity: String,
    #[serde(default)]
    pub daily_token_limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferralConfig {
    pub default_delay_secs: u64,
    pub max_attempts: i64,
    pub batch_size: usize,
    pub process_interval_secs: u64,
}

impl Default for DeferralConfig {
    fn default() -> Self {
        Self {
            default_delay_secs: 3600,
            max_attempts: 3,
            batch_size: 10,
            process_interval_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_concurrent_runs: usize,
    pub exhaustion_cooldown_secs: u64,
    pub check_interval_secs: u64,
    pub idle_sleep_ms: u64,
    /// Six-field cron expression (with seconds) for daily maintenance.
    pub maintenance_cron: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 3,
            exhaustion_cooldown_secs: 300,
            check_interval_secs: 30,
            idle_sleep_ms: 100,
            maintenance_cron: "0 0 0 * * *".to_string(),
        }
    }
}

/// Backend adapter definition, keyed by executor name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorDef {
    Cli {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        quota_patterns: Vec<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Http {
        name: String,
        base_url: String,
        api_key_env: String,
        model: String,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl ExecutorDef {
    pub fn name(&self) -> &str {
        match self {
            ExecutorDef::Cli { name, .. } | ExecutorDef::Http { name, .. } => name,
        }
    }
}

fn default_timeout_secs() -> u64 {
    900
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_executors() -> Vec<ExecutorDef> {
    vec![
        ExecutorDef::Cli {
            name: "gemini".to_string(),
            command: "gemini".to_string(),
            args: vec!["--yolo".to_string()],
            quota_patterns: Vec::new(),
            timeout_secs: default_timeout_secs(),
        },
        ExecutorDef::Cli {
            name: "claude-code".to_string(),
            command: "claude".to_string(),
            args: vec!["-p".to_string(), "--output-format".to_string(), "text".to_string()],
            quota_patterns: Vec::new(),
            timeout_secs: default_timeout_secs(),
        },
        ExecutorDef::Cli {
            name: "codex".to_string(),
            command: "codex".to_string(),
            args: vec!["exec".to_string(), "-".to_string()],
            quota_patterns: Vec::new(),
            timeout_secs: default_timeout_secs(),
        },
        ExecutorDef::Http {
            name: "anthropic-api".to_string(),
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: default_max_tokens(),
            timeout_secs: 300,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub telegram_token_env: String,
    pub chat_id: Option<i64>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            telegram_token_env: "TELEGRAM_BOT_TOKEN".to_string(),
            chat_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = DispatchConfig::from_toml("").unwrap();
        assert_eq!(cfg.runtime.max_concurrent_runs, 3);
        assert_eq!(cfg.accounts.max_consecutive_failures, 5);
        assert_eq!(cfg.deferral.max_attempts, 3);
        assert_eq!(cfg.routing.long_context_threshold_tokens, 60_000);
        assert_eq!(cfg.executors.len(), 4);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = DispatchConfig::from_toml(
            r#"
            [runtime]
            max_concurrent_runs = 7

            [rates.openai-api]
            input_per_1k = 0.0025
            output_per_1k = 0.01

            [[accounts.seed]]
            executor = "gemini"
            identity = "alt-1@example.com"
            daily_token_limit = 100000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.runtime.max_concurrent_runs, 7);
        assert_eq!(cfg.runtime.exhaustion_cooldown_secs, 300);
        assert_eq!(cfg.rate_for("openai-api").output_per_1k, 0.01);
        assert_eq!(cfg.accounts.seed[0].daily_token_limit, Some(100_000));
    }

    #[test]
    fn executors_parse_by_kind() {
        let cfg = DispatchConfig::from_toml(
            r#"
            [[executors]]
            kind = "cli"
            name = "local"
            command = "echo"

            [[executors]]
            kind = "http"
            name = "api"
            base_url = "http://localhost:9999"
            api_key_env = "KEY"
            model = "m"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.executors.len(), 2);
        assert_eq!(cfg.executors[0].name(), "local");
        assert!(matches!(cfg.executors[1], ExecutorDef::Http { max_tokens: 8192, .. }));
    }

    #[test]
    fn unknown_executor_is_free() {
        let cfg = DispatchConfig::default();
        assert!(cfg.rate_for("gemini").is_free());
        assert!(!cfg.rate_for("anthropic-api").is_free());
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DispatchConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg.log_level, "info");
    }
}
