use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::{AccountStatus, ExecutorAccount};
use super::{Store, text_col};

const ACCOUNT_COLUMNS: &str = "id, executor, identity, status, cooldown_until, consecutive_failures, \
     daily_token_limit, tokens_used_today, last_used_at";

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutorAccount> {
    Ok(ExecutorAccount {
        id: row.get(0)?,
        executor: row.get(1)?,
        identity: row.get(2)?,
        status: text_col(row, 3)?,
        cooldown_until: row.get(4)?,
        consecutive_failures: row.get(5)?,
        daily_token_limit: row.get(6)?,
        tokens_used_today: row.get(7)?,
        last_used_at: row.get(8)?,
    })
}

impl Store {
    /// Insert an account, or update its daily limit if it already exists.
    pub async fn upsert_account(
        &self,
        executor: &str,
        identity: &str,
        daily_token_limit: Option<i64>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO executor_accounts (executor, identity, daily_token_limit) VALUES (?1, ?2, ?3)
             ON CONFLICT(executor, identity) DO UPDATE SET daily_token_limit = excluded.daily_token_limit",
            params![executor, identity, daily_token_limit],
        )?;
        let id = db.query_row(
            "SELECT id FROM executor_accounts WHERE executor = ?1 AND identity = ?2",
            params![executor, identity],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<ExecutorAccount>> {
        let db = self.db.lock().await;
        let account = db
            .query_row(
                &format!("SELECT {} FROM executor_accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                params![id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    pub async fn list_accounts(&self, executor: Option<&str>) -> Result<Vec<ExecutorAccount>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM executor_accounts WHERE ?1 IS NULL OR executor = ?1 ORDER BY executor, id",
            ACCOUNT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![executor], account_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn count_accounts(&self, executor: &str) -> Result<i64> {
        let db = self.db.lock().await;
        let count = db.query_row(
            "SELECT COUNT(*) FROM executor_accounts WHERE executor = ?1",
            params![executor],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Select the least-recently-used selectable account and stamp it as used,
    /// inside one transaction so two callers can never claim the same slot
    /// from the same snapshot.
    pub async fn claim_next_account(
        &self,
        executor: &str,
        now_ms: i64,
        max_failures: i64,
    ) -> Result<Option<ExecutorAccount>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let candidate = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM executor_accounts
                 WHERE executor = ?1 AND status IN ('active', 'rate_limited')
                 ORDER BY last_used_at IS NOT NULL, last_used_at ASC, id ASC",
                ACCOUNT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![executor], account_from_row)?;
            let mut found = None;
            for row in rows {
                let account = row?;
                if account.is_selectable(now_ms, max_failures) {
                    found = Some(account);
                    break;
                }
            }
            found
        };
        let Some(mut account) = candidate else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE executor_accounts SET last_used_at = ?1 WHERE id = ?2",
            params![now_ms, account.id],
        )?;
        tx.commit()?;
        account.last_used_at = Some(now_ms);
        Ok(Some(account))
    }

    /// Reset the failure streak, clear any expired cooldown and stamp last-used.
    pub async fn record_account_success(&self, id: i64, now_ms: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE executor_accounts
             SET consecutive_failures = 0,
                 last_used_at = ?1,
                 cooldown_until = NULL,
                 status = CASE WHEN status = 'rate_limited' THEN 'active' ELSE status END
             WHERE id = ?2",
            params![now_ms, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn record_account_quota_error(&self, id: i64, cooldown_until: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE executor_accounts
             SET status = ?1,
                 cooldown_until = ?2,
                 consecutive_failures = consecutive_failures + 1
             WHERE id = ?3",
            params![AccountStatus::RateLimited.as_str(), cooldown_until, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn record_account_error(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE executor_accounts SET consecutive_failures = consecutive_failures + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    pub async fn add_account_tokens(&self, id: i64, tokens: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE executor_accounts SET tokens_used_today = tokens_used_today + ?1 WHERE id = ?2",
            params![tokens, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn set_account_status(&self, id: i64, status: AccountStatus) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE executor_accounts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(rows > 0)
    }

    /// Clear cooldowns and failure streaks for every non-disabled account of an executor.
    pub async fn reset_account_cooldowns(&self, executor: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE executor_accounts
             SET cooldown_until = NULL, consecutive_failures = 0, status = 'active'
             WHERE executor = ?1 AND status != 'disabled'",
            params![executor],
        )?;
        Ok(rows)
    }

    pub async fn reset_daily_token_counts(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute("UPDATE executor_accounts SET tokens_used_today = 0", [])?;
        Ok(rows)
    }
}
