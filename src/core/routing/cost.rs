use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::clock::{Clock, date_bucket, week_buckets};
use crate::core::config::Rate;
use crate::core::store::{DailyCost, ExecutorCostSummary, NewCostRecord, Store};

/// Correlation ids attached to a charge. The raw query is hashed, never stored.
#[derive(Debug, Clone, Default)]
pub struct CostCorrelation {
    pub account: Option<String>,
    pub job_id: Option<String>,
    pub intent_id: Option<String>,
    pub run_id: Option<String>,
    pub query: Option<String>,
}

/// Append-only ledger of executor charges.
pub struct CostLedger {
    store: Store,
    clock: Arc<dyn Clock>,
    rates: BTreeMap<String, Rate>,
}

impl CostLedger {
    pub fn new(store: Store, clock: Arc<dyn Clock>, rates: BTreeMap<String, Rate>) -> Self {
        Self {
            store,
            clock,
            rates,
        }
    }

    pub fn rate_for(&self, executor: &str) -> Rate {
        self.rates.get(executor).copied().unwrap_or_default()
    }

    pub fn is_free(&self, executor: &str) -> bool {
        self.rate_for(executor).is_free()
    }

    /// Cost in USD without writing anything.
    pub fn estimate_cost(&self, executor: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let rate = self.rate_for(executor);
        (input_tokens as f64 / 1000.0) * rate.input_per_1k
            + (output_tokens as f64 / 1000.0) * rate.output_per_1k
    }

    /// Record one charge and return it.
    pub async fn track(
        &self,
        executor: &str,
        input_tokens: u64,
        output_tokens: u64,
        correlation: CostCorrelation,
    ) -> Result<f64> {
        let cost_usd = self.estimate_cost(executor, input_tokens, output_tokens);
        let now = self.clock.epoch_ms();
        let record = NewCostRecord {
            executor: executor.to_string(),
            account: correlation.account,
            input_tokens: input_tokens as i64,
            output_tokens: output_tokens as i64,
            cost_usd,
            created_at: now,
            date_bucket: date_bucket(now),
            job_id: correlation.job_id,
            intent_id: correlation.intent_id,
            run_id: correlation.run_id,
            query_hash: correlation.query.as_deref().map(query_hash),
        };
        self.store.insert_cost_record(&record).await?;
        debug!(executor, cost_usd, input_tokens, output_tokens, "Cost tracked");
        Ok(cost_usd)
    }

    /// Total spend for `date` (`YYYY-MM-DD`), today when `None`.
    pub async fn get_daily_cost(&self, date: Option<&str>) -> Result<f64> {
        let bucket = self.bucket_or_today(date);
        self.store.sum_cost_for_date(&bucket).await
    }

    pub async fn get_daily_summary(&self, date: Option<&str>) -> Result<Vec<ExecutorCostSummary>> {
        let bucket = self.bucket_or_today(date);
        self.store.cost_summary_for_date(&bucket).await
    }

    /// The last seven days including today, oldest first, days without charges omitted.
    pub async fn get_weekly_costs(&self) -> Result<Vec<DailyCost>> {
        let buckets = week_buckets(self.clock.epoch_ms());
        let days = self.store.cost_by_dates(&buckets).await?;
        Ok(days.into_iter().filter(|d| d.calls > 0).collect())
    }

    fn bucket_or_today(&self, date: Option<&str>) -> String {
        match date {
            Some(d) => d.to_string(),
            None => date_bucket(self.clock.epoch_ms()),
        }
    }
}

pub fn query_hash(query: &str) -> String {
    hex::encode(Sha256::digest(query.as_bytes()))
}
