use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::config::AccountsConfig;
use crate::core::store::{ExecutorAccount, Store};

/// Availability snapshot for one executor's accounts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub executor: String,
    pub total: usize,
    pub available: usize,
    /// Time until the earliest cooling-down account frees up, if none is available now.
    pub next_available_in_ms: Option<i64>,
}

/// Rotation, cooldown and quota bookkeeping for executor accounts.
/// Every mutation is written straight to the store.
pub struct AccountPool {
    store: Store,
    clock: Arc<dyn Clock>,
    max_failures: i64,
    quota_cooldown: Duration,
}

impl AccountPool {
    pub fn new(store: Store, clock: Arc<dyn Clock>, config: &AccountsConfig) -> Self {
        Self {
            store,
            clock,
            max_failures: config.max_consecutive_failures,
            quota_cooldown: Duration::from_secs(config.quota_cooldown_secs),
        }
    }

    pub async fn upsert_account(
        &self,
        executor: &str,
        identity: &str,
        daily_token_limit: Option<i64>,
    ) -> Result<i64> {
        self.store
            .upsert_account(executor, identity, daily_token_limit)
            .await
    }

    pub async fn list_accounts(&self, executor: Option<&str>) -> Result<Vec<ExecutorAccount>> {
        self.store.list_accounts(executor).await
    }

    /// Executors without registered accounts are not pool-backed.
    pub async fn has_accounts(&self, executor: &str) -> Result<bool> {
        Ok(self.store.count_accounts(executor).await? > 0)
    }

    /// Claim the least-recently-used selectable account.
    pub async fn get_next_available(&self, executor: &str) -> Result<Option<ExecutorAccount>> {
        self.store
            .claim_next_account(executor, self.clock.epoch_ms(), self.max_failures)
            .await
    }

    pub async fn report_success(&self, account_id: i64) -> Result<()> {
        self.store
            .record_account_success(account_id, self.clock.epoch_ms())
            .await?;
        Ok(())
    }

    pub async fn report_quota_error(&self, account_id: i64) -> Result<()> {
        let until = self.clock.epoch_ms() + self.quota_cooldown.as_millis() as i64;
        self.store
            .record_account_quota_error(account_id, until)
            .await?;
        warn!(account_id, cooldown_until = until, "Account hit quota, cooling down");
        Ok(())
    }

    pub async fn report_error(&self, account_id: i64) -> Result<()> {
        self.store.record_account_error(account_id).await?;
        Ok(())
    }

    pub async fn increment_token_usage(&self, account_id: i64, tokens: u64) -> Result<()> {
        self.store
            .add_account_tokens(account_id, tokens as i64)
            .await?;
        Ok(())
    }

    pub async fn reset_all_cooldowns(&self, executor: &str) -> Result<usize> {
        let count = self.store.reset_account_cooldowns(executor).await?;
        info!(executor, count, "Account cooldowns reset");
        Ok(count)
    }

    pub async fn reset_daily_token_counts(&self) -> Result<usize> {
        let count = self.store.reset_daily_token_counts().await?;
        info!(count, "Daily token counts reset");
        Ok(count)
    }

    pub async fn get_pool_status(&self, executor: &str) -> Result<PoolStatus> {
        let now = self.clock.epoch_ms();
        let accounts = self.store.list_accounts(Some(executor)).await?;
        let available = accounts
            .iter()
            .filter(|a| a.is_selectable(now, self.max_failures))
            .count();
        let next_available_in_ms = if available > 0 {
            None
        } else {
            accounts
                .iter()
                .filter(|a| a.consecutive_failures < self.max_failures)
                .filter_map(|a| a.cooldown_until)
                .filter(|until| *until > now)
                .min()
                .map(|until| until - now)
        };
        Ok(PoolStatus {
            executor: executor.to_string(),
            total: accounts.len(),
            available,
            next_available_in_ms,
        })
    }
}
