use anyhow::Result;
use rusqlite::params;

use super::Store;
use super::types::{CostRecord, DailyCost, ExecutorCostSummary};

/// Row to insert into the cost ledger; `id` is assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewCostRecord {
    pub executor: String,
    pub account: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub created_at: i64,
    pub date_bucket: String,
    pub job_id: Option<String>,
    pub intent_id: Option<String>,
    pub run_id: Option<String>,
    pub query_hash: Option<String>,
}

impl Store {
    pub async fn insert_cost_record(&self, record: &NewCostRecord) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO cost_records (executor, account, input_tokens, output_tokens, cost_usd,
                created_at, date_bucket, job_id, intent_id, run_id, query_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.executor,
                record.account,
                record.input_tokens,
                record.output_tokens,
                record.cost_usd,
                record.created_at,
                record.date_bucket,
                record.job_id,
                record.intent_id,
                record.run_id,
                record.query_hash,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn list_cost_records(&self, date_bucket: &str) -> Result<Vec<CostRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, executor, account, input_tokens, output_tokens, cost_usd, created_at,
                    date_bucket, job_id, intent_id, run_id, query_hash
             FROM cost_records WHERE date_bucket = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![date_bucket], |row| {
            Ok(CostRecord {
                id: row.get(0)?,
                executor: row.get(1)?,
                account: row.get(2)?,
                input_tokens: row.get(3)?,
                output_tokens: row.get(4)?,
                cost_usd: row.get(5)?,
                created_at: row.get(6)?,
                date_bucket: row.get(7)?,
                job_id: row.get(8)?,
                intent_id: row.get(9)?,
                run_id: row.get(10)?,
                query_hash: row.get(11)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn sum_cost_for_date(&self, date_bucket: &str) -> Result<f64> {
        let db = self.db.lock().await;
        let total = db.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_records WHERE date_bucket = ?1",
            params![date_bucket],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub async fn cost_summary_for_date(&self, date_bucket: &str) -> Result<Vec<ExecutorCostSummary>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT executor, COUNT(*), COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0), COALESCE(SUM(cost_usd), 0.0)
             FROM cost_records WHERE date_bucket = ?1
             GROUP BY executor ORDER BY executor",
        )?;
        let rows = stmt.query_map(params![date_bucket], |row| {
            Ok(ExecutorCostSummary {
                executor: row.get(0)?,
                calls: row.get(1)?,
                input_tokens: row.get(2)?,
                output_tokens: row.get(3)?,
                cost_usd: row.get(4)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// One entry per requested bucket, zero-filled for days without records.
    pub async fn cost_by_dates(&self, buckets: &[String]) -> Result<Vec<DailyCost>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT COUNT(*), COALESCE(SUM(cost_usd), 0.0) FROM cost_records WHERE date_bucket = ?1",
        )?;
        let mut results = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            let (calls, cost_usd) =
                stmt.query_row(params![bucket], |row| Ok((row.get(0)?, row.get(1)?)))?;
            results.push(DailyCost {
                date: bucket.clone(),
                calls,
                cost_usd,
            });
        }
        Ok(results)
    }
}
