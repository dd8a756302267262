use anyhow::Result;
use rusqlite::params;

use super::types::{Run, RunStatus};
use super::{Store, text_col};

const RUN_COLUMNS: &str =
    "id, intent_id, executor, status, output, exit_code, exhausted, attempt, started_at, finished_at";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        intent_id: row.get(1)?,
        executor: row.get(2)?,
        status: text_col(row, 3)?,
        output: row.get(4)?,
        exit_code: row.get(5)?,
        exhausted: row.get(6)?,
        attempt: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

impl Store {
    /// Open a `running` run for an intent, numbered after its previous attempts.
    pub async fn start_run(&self, id: &str, intent_id: &str, now_ms: i64) -> Result<Run> {
        let db = self.db.lock().await;
        let attempt: i64 = db.query_row(
            "SELECT COALESCE(MAX(attempt), 0) + 1 FROM runs WHERE intent_id = ?1",
            params![intent_id],
            |row| row.get(0),
        )?;
        db.execute(
            "INSERT INTO runs (id, intent_id, status, attempt, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, intent_id, RunStatus::Running.as_str(), attempt, now_ms],
        )?;
        Ok(Run {
            id: id.to_string(),
            intent_id: intent_id.to_string(),
            executor: None,
            status: RunStatus::Running,
            output: None,
            exit_code: None,
            exhausted: false,
            attempt,
            started_at: now_ms,
            finished_at: None,
        })
    }

    /// Close a running run. A run that is already finished is left untouched.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        executor: Option<&str>,
        output: Option<&str>,
        exit_code: Option<i32>,
        exhausted: bool,
        now_ms: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE runs
             SET status = ?1, executor = ?2, output = ?3, exit_code = ?4, exhausted = ?5,
                 finished_at = ?6
             WHERE id = ?7 AND status = 'running'",
            params![status.as_str(), executor, output, exit_code, exhausted, now_ms, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn runs_for_intent(&self, intent_id: &str) -> Result<Vec<Run>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM runs WHERE intent_id = ?1 ORDER BY attempt ASC",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![intent_id], run_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn count_active_runs(&self, intent_id: &str) -> Result<i64> {
        let db = self.db.lock().await;
        let count = db.query_row(
            "SELECT COUNT(*) FROM runs WHERE intent_id = ?1 AND status = 'running'",
            params![intent_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Runs left `running` by a previous process are marked cancelled at boot.
    pub async fn cancel_orphaned_runs(&self, now_ms: i64) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE runs SET status = 'cancelled', finished_at = ?1 WHERE status = 'running'",
            params![now_ms],
        )?;
        db.execute(
            "UPDATE intents SET status = 'failed', updated_at = ?1 WHERE status = 'running'",
            params![now_ms],
        )?;
        Ok(rows)
    }
}
