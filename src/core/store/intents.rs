use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::{Intent, IntentStatus, Priority};
use super::{Store, text_col};

const INTENT_COLUMNS: &str = "id, title, description, intent_type, risk_level, priority, \
     scheduled_for, deadline, lane, executor_preference, query, working_dir, source_proposal_id, \
     status, created_at, updated_at";

fn intent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Intent> {
    Ok(Intent {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        intent_type: row.get(3)?,
        risk_level: row.get(4)?,
        priority: Priority::from_rank(row.get(5)?),
        scheduled_for: row.get(6)?,
        deadline: row.get(7)?,
        lane: row.get(8)?,
        executor_preference: row.get(9)?,
        query: row.get(10)?,
        working_dir: row.get(11)?,
        source_proposal_id: row.get(12)?,
        status: text_col(row, 13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl Store {
    pub async fn insert_intent(&self, intent: &Intent) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO intents (id, title, description, intent_type, risk_level, priority,
                scheduled_for, deadline, lane, executor_preference, query, working_dir,
                source_proposal_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                intent.id,
                intent.title,
                intent.description,
                intent.intent_type,
                intent.risk_level,
                intent.priority.rank() as i64,
                intent.scheduled_for,
                intent.deadline,
                intent.lane,
                intent.executor_preference,
                intent.query,
                intent.working_dir,
                intent.source_proposal_id,
                intent.status.as_str(),
                intent.created_at,
                intent.updated_at,
            ],
        )?;
        Ok(())
    }

    pub async fn get_intent(&self, id: &str) -> Result<Option<Intent>> {
        let db = self.db.lock().await;
        let intent = db
            .query_row(
                &format!("SELECT {} FROM intents WHERE id = ?1", INTENT_COLUMNS),
                params![id],
                intent_from_row,
            )
            .optional()?;
        Ok(intent)
    }

    /// Move an intent from `from` to `to` only if it is currently in `from`.
    /// Returns false when another caller got there first.
    pub async fn transition_intent(
        &self,
        id: &str,
        from: IntentStatus,
        to: IntentStatus,
        now_ms: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE intents SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), now_ms, id, from.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// Claim a pending intent for execution.
    pub async fn try_start_intent(&self, id: &str, now_ms: i64) -> Result<bool> {
        self.transition_intent(id, IntentStatus::Pending, IntentStatus::Running, now_ms)
            .await
    }

    pub async fn set_intent_status(&self, id: &str, status: IntentStatus, now_ms: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE intents SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_ms, id],
        )?;
        Ok(rows > 0)
    }

    /// Pending intents that are due, highest priority first then oldest first.
    pub async fn next_eligible_intents(&self, now_ms: i64, limit: usize) -> Result<Vec<Intent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM intents
             WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
             ORDER BY priority ASC, created_at ASC, id ASC
             LIMIT ?2",
            INTENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now_ms, limit as i64], intent_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn list_intents(&self, status: Option<IntentStatus>) -> Result<Vec<Intent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM intents WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at DESC, id ASC",
            INTENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.map(IntentStatus::as_str)], intent_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn intents_for_proposal(&self, proposal_id: &str) -> Result<Vec<Intent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM intents WHERE source_proposal_id = ?1 ORDER BY created_at ASC",
            INTENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![proposal_id], intent_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
