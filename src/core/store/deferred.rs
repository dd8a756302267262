use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::types::{DeferredStatus, DeferredTask};
use super::{Store, text_col};

const DEFERRED_COLUMNS: &str =
    "id, request_json, decision_json, created_at, scheduled_for, attempts, last_error, status";

/// Raw row before the JSON payloads are decoded.
struct DeferredRow {
    id: String,
    request_json: String,
    decision_json: String,
    created_at: i64,
    scheduled_for: i64,
    attempts: i64,
    last_error: Option<String>,
    status: DeferredStatus,
}

impl DeferredRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_json: row.get(1)?,
            decision_json: row.get(2)?,
            created_at: row.get(3)?,
            scheduled_for: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            status: text_col(row, 7)?,
        })
    }

    fn decode(self) -> Result<DeferredTask> {
        let request = serde_json::from_str(&self.request_json)
            .with_context(|| format!("decoding request of deferred task {}", self.id))?;
        let decision = serde_json::from_str(&self.decision_json)
            .with_context(|| format!("decoding decision of deferred task {}", self.id))?;
        Ok(DeferredTask {
            id: self.id,
            request,
            decision,
            created_at: self.created_at,
            scheduled_for: self.scheduled_for,
            attempts: self.attempts,
            last_error: self.last_error,
            status: self.status,
        })
    }
}

impl Store {
    pub async fn insert_deferred(&self, task: &DeferredTask) -> Result<()> {
        let request_json = serde_json::to_string(&task.request)?;
        let decision_json = serde_json::to_string(&task.decision)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO deferred_tasks (id, request_json, decision_json, created_at, scheduled_for,
                attempts, last_error, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                request_json,
                decision_json,
                task.created_at,
                task.scheduled_for,
                task.attempts,
                task.last_error,
                task.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_deferred(&self, id: &str) -> Result<Option<DeferredTask>> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                &format!("SELECT {} FROM deferred_tasks WHERE id = ?1", DEFERRED_COLUMNS),
                params![id],
                DeferredRow::from_row,
            )
            .optional()?
        };
        row.map(DeferredRow::decode).transpose()
    }

    /// Pending tasks whose scheduled time has passed, oldest schedule first.
    pub async fn due_deferred(&self, now_ms: i64, limit: usize) -> Result<Vec<DeferredTask>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM deferred_tasks
                 WHERE status = 'pending' AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC, created_at ASC
                 LIMIT ?2",
                DEFERRED_COLUMNS
            ))?;
            let mapped = stmt.query_map(params![now_ms, limit as i64], DeferredRow::from_row)?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };
        rows.into_iter().map(DeferredRow::decode).collect()
    }

    pub async fn list_deferred(&self, status: Option<DeferredStatus>) -> Result<Vec<DeferredTask>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM deferred_tasks WHERE ?1 IS NULL OR status = ?1
                 ORDER BY scheduled_for ASC",
                DEFERRED_COLUMNS
            ))?;
            let mapped = stmt.query_map(
                params![status.map(DeferredStatus::as_str)],
                DeferredRow::from_row,
            )?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };
        rows.into_iter().map(DeferredRow::decode).collect()
    }

    /// Set the status, bump the attempt counter and record the latest error.
    /// Returns the new attempt count, or `None` if the task does not exist.
    pub async fn update_deferred_status(
        &self,
        id: &str,
        status: DeferredStatus,
        error: Option<&str>,
    ) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE deferred_tasks
             SET status = ?1, attempts = attempts + 1, last_error = COALESCE(?2, last_error)
             WHERE id = ?3",
            params![status.as_str(), error, id],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        let attempts = db.query_row(
            "SELECT attempts FROM deferred_tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(attempts))
    }

    /// Put a task back in the pending state for another attempt at `scheduled_for`.
    pub async fn requeue_deferred(&self, id: &str, scheduled_for: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE deferred_tasks SET status = 'pending', scheduled_for = ?1 WHERE id = ?2",
            params![scheduled_for, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn delete_deferred(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM deferred_tasks WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}
