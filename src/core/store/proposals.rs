use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::{ApprovalStatus, Proposal, ProposalStage};
use super::{Store, text_col};

const PROPOSAL_COLUMNS: &str = "id, title, summary, content, stage, proposal_type, risk_level, \
     approval_status, snooze_until, rejection_reason, source, source_ref, created_at, updated_at";

fn proposal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Proposal> {
    Ok(Proposal {
        id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        content: row.get(3)?,
        stage: text_col(row, 4)?,
        proposal_type: row.get(5)?,
        risk_level: row.get(6)?,
        approval_status: text_col(row, 7)?,
        snooze_until: row.get(8)?,
        rejection_reason: row.get(9)?,
        source: row.get(10)?,
        source_ref: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl Store {
    pub async fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO proposals (id, title, summary, content, stage, proposal_type, risk_level,
                approval_status, snooze_until, rejection_reason, source, source_ref,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                proposal.id,
                proposal.title,
                proposal.summary,
                proposal.content,
                proposal.stage.as_str(),
                proposal.proposal_type,
                proposal.risk_level,
                proposal.approval_status.as_str(),
                proposal.snooze_until,
                proposal.rejection_reason,
                proposal.source,
                proposal.source_ref,
                proposal.created_at,
                proposal.updated_at,
            ],
        )?;
        Ok(())
    }

    pub async fn get_proposal(&self, id: &str) -> Result<Option<Proposal>> {
        let db = self.db.lock().await;
        let proposal = db
            .query_row(
                &format!("SELECT {} FROM proposals WHERE id = ?1", PROPOSAL_COLUMNS),
                params![id],
                proposal_from_row,
            )
            .optional()?;
        Ok(proposal)
    }

    /// Move a proposal to `to` only if it is still at `from`, so two concurrent
    /// approvals cannot both advance the same stage.
    pub async fn advance_proposal(
        &self,
        id: &str,
        from: ProposalStage,
        to: ProposalStage,
        approval: ApprovalStatus,
        now_ms: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE proposals
             SET stage = ?1, approval_status = ?2, snooze_until = NULL, updated_at = ?3
             WHERE id = ?4 AND stage = ?5",
            params![to.as_str(), approval.as_str(), now_ms, id, from.as_str()],
        )?;
        Ok(rows > 0)
    }

    pub async fn reject_proposal(&self, id: &str, reason: Option<&str>, now_ms: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE proposals
             SET stage = 'rejected', approval_status = 'rejected', rejection_reason = ?1,
                 updated_at = ?2
             WHERE id = ?3",
            params![reason, now_ms, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn snooze_proposal(&self, id: &str, until_ms: i64, now_ms: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE proposals SET snooze_until = ?1, updated_at = ?2
             WHERE id = ?3 AND stage NOT IN ('rejected', 'archived')",
            params![until_ms, now_ms, id],
        )?;
        Ok(rows > 0)
    }

    /// Proposals still awaiting a decision: not rejected, not archived, not snoozed.
    pub async fn list_open_proposals(&self, now_ms: i64) -> Result<Vec<Proposal>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM proposals
             WHERE stage NOT IN ('rejected', 'archived')
               AND (snooze_until IS NULL OR snooze_until <= ?1)
             ORDER BY created_at ASC, id ASC",
            PROPOSAL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now_ms], proposal_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn list_proposals(&self) -> Result<Vec<Proposal>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM proposals ORDER BY created_at ASC, id ASC",
            PROPOSAL_COLUMNS
        ))?;
        let rows = stmt.query_map([], proposal_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
