mod accounts;
mod costs;
mod deferred;
mod intents;
mod proposals;
mod runs;
pub mod types;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

pub use costs::NewCostRecord;
pub use types::*;

/// Single source of truth for accounts, costs, deferred tasks, intents,
/// proposals and runs. Every operation is one lock acquisition, so each
/// statement group is atomic with respect to other callers.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
            NativePlatform::restrict_dir_permissions(parent);
        }
        let db = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        NativePlatform::restrict_file_permissions(path);
        init_schema(&db)?;
        info!("Store opened at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Raw SQL against the live connection, for breaking the store in tests.
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.db.lock().await.execute_batch(sql)?;
        Ok(())
    }
}

/// Parse a TEXT column through the enum's `FromStr`.
fn text_col<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS executor_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            executor TEXT NOT NULL,
            identity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            cooldown_until INTEGER,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            daily_token_limit INTEGER,
            tokens_used_today INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER,
            UNIQUE (executor, identity)
        );

        CREATE TABLE IF NOT EXISTS cost_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            executor TEXT NOT NULL,
            account TEXT,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            cost_usd REAL NOT NULL,
            created_at INTEGER NOT NULL,
            date_bucket TEXT NOT NULL,
            job_id TEXT,
            intent_id TEXT,
            run_id TEXT,
            query_hash TEXT
        );

        CREATE TABLE IF NOT EXISTS deferred_tasks (
            id TEXT PRIMARY KEY,
            request_json TEXT NOT NULL,
            decision_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            scheduled_for INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE TABLE IF NOT EXISTS proposals (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            stage TEXT NOT NULL DEFAULT 'idea',
            proposal_type TEXT NOT NULL DEFAULT '',
            risk_level TEXT NOT NULL DEFAULT '',
            approval_status TEXT NOT NULL DEFAULT 'pending',
            snooze_until INTEGER,
            rejection_reason TEXT,
            source TEXT,
            source_ref TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS intents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            intent_type TEXT NOT NULL DEFAULT '',
            risk_level TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 2,
            scheduled_for INTEGER,
            deadline INTEGER,
            lane TEXT,
            executor_preference TEXT,
            query TEXT NOT NULL,
            working_dir TEXT,
            source_proposal_id TEXT REFERENCES proposals(id),
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            intent_id TEXT NOT NULL REFERENCES intents(id),
            executor TEXT,
            status TEXT NOT NULL,
            output TEXT,
            exit_code INTEGER,
            exhausted INTEGER NOT NULL DEFAULT 0,
            attempt INTEGER NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_accounts_executor ON executor_accounts(executor, status);
        CREATE INDEX IF NOT EXISTS idx_costs_date ON cost_records(date_bucket, executor);
        CREATE INDEX IF NOT EXISTS idx_deferred_due ON deferred_tasks(status, scheduled_for);
        CREATE INDEX IF NOT EXISTS idx_intents_status ON intents(status, priority, created_at);
        CREATE INDEX IF NOT EXISTS idx_runs_intent ON runs(intent_id, attempt);
        CREATE INDEX IF NOT EXISTS idx_proposals_stage ON proposals(stage, approval_status);",
    )?;
    Ok(())
}
