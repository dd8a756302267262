pub mod accounts;
pub mod cost;
pub mod decision;
pub mod deferral;
pub mod driver;
pub mod types;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::clock::Clock;
use crate::core::config::DispatchConfig;
use crate::core::executors::ExecutorRegistry;
use crate::core::store::Store;

pub use accounts::{AccountPool, PoolStatus};
pub use cost::{CostCorrelation, CostLedger};
pub use deferral::DeferralQueue;
pub use driver::{
    AttemptOutcome, AttemptRecord, DeferredBatchReport, ExecutorResult, IntentClaims,
};
pub use types::*;

/// Routing state: one instance per process, shared as `Arc<Router>`.
pub struct Router {
    store: Store,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    accounts: AccountPool,
    costs: CostLedger,
    deferral: DeferralQueue,
    executors: ExecutorRegistry,
}

impl Router {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
        executors: ExecutorRegistry,
    ) -> Self {
        let accounts = AccountPool::new(store.clone(), clock.clone(), &config.accounts);
        let costs = CostLedger::new(store.clone(), clock.clone(), config.rates.clone());
        let deferral = DeferralQueue::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(config.deferral.default_delay_secs),
        );
        Self {
            store,
            clock,
            config,
            accounts,
            costs,
            deferral,
            executors,
        }
    }

    /// Upsert the accounts listed in the config.
    pub async fn seed_accounts(&self) -> Result<usize> {
        for seed in &self.config.accounts.seed {
            self.accounts
                .upsert_account(&seed.executor, &seed.identity, seed.daily_token_limit)
                .await?;
        }
        if !self.config.accounts.seed.is_empty() {
            info!("Seeded {} executor accounts", self.config.accounts.seed.len());
        }
        Ok(self.config.accounts.seed.len())
    }

    /// Fresh decision for a request. Reads pool availability only when the
    /// rotating-pool rule is reached.
    pub async fn decide(&self, request: &RoutingRequest) -> Result<RoutingDecision> {
        let roles = &self.config.routing;
        let pool_available = if decision::needs_pool_check(roles, request) {
            self.is_pool_available(&roles.rotating_pool).await?
        } else {
            false
        };
        Ok(decision::decide(roles, request, pool_available, |executor| {
            self.costs.estimate_cost(
                executor,
                request.estimated_tokens,
                decision::ESTIMATED_OUTPUT_TOKENS,
            )
        }))
    }

    /// An executor without registered accounts counts as available.
    async fn is_pool_available(&self, executor: &str) -> Result<bool> {
        let status = self.accounts.get_pool_status(executor).await?;
        Ok(status.total == 0 || status.available > 0)
    }

    pub async fn defer(
        &self,
        request: &RoutingRequest,
        decision: &RoutingDecision,
        delay: Option<Duration>,
    ) -> Result<String> {
        self.deferral.defer(request, decision, delay).await
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn accounts(&self) -> &AccountPool {
        &self.accounts
    }

    pub fn costs(&self) -> &CostLedger {
        &self.costs
    }

    pub fn deferral(&self) -> &DeferralQueue {
        &self.deferral
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FakeClock;

    #[tokio::test]
    async fn decide_reads_current_pool_state() {
        let router = Router::new(
            Store::open_in_memory().unwrap(),
            Arc::new(FakeClock::new()),
            DispatchConfig::default(),
            ExecutorRegistry::new(),
        );
        let req = RoutingRequest::new("general question");

        // no accounts registered: the CLI's own login is used
        assert_eq!(router.decide(&req).await.unwrap().executor, "gemini");

        let id = router.accounts().upsert_account("gemini", "a", None).await.unwrap();
        assert_eq!(router.decide(&req).await.unwrap().executor, "gemini");

        router.accounts().report_quota_error(id).await.unwrap();
        let d = router.decide(&req).await.unwrap();
        assert_eq!(d.executor, "anthropic-api");
        assert!(d.fallbacks.is_empty());
        assert!(!d.can_defer);
        assert!(d.estimated_cost_usd > 0.0);
    }

    #[tokio::test]
    async fn seed_accounts_is_idempotent() {
        let mut config = DispatchConfig::default();
        config.accounts.seed.push(crate::core::config::SeedAccount {
            executor: "gemini".into(),
            identity: "a@example.com".into(),
            daily_token_limit: Some(1_000_000),
        });
        let router = Router::new(
            Store::open_in_memory().unwrap(),
            Arc::new(FakeClock::new()),
            config,
            ExecutorRegistry::new(),
        );
        router.seed_accounts().await.unwrap();
        router.seed_accounts().await.unwrap();
        assert_eq!(router.accounts().list_accounts(None).await.unwrap().len(), 1);
    }
}
