use anyhow::{Result, bail};
use serde::Serialize;
use tracing::info;

use super::{TransitionError, UnifiedRuntime};
use crate::core::events::RuntimeEvent;
use crate::core::store::{ApprovalStatus, Intent, NewIntent, NewProposal, Proposal, ProposalStage};

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub proposal: Proposal,
    /// Set only when this approval archived the proposal.
    pub intent: Option<Intent>,
}

/// Query text for the intent created from a fully approved proposal.
fn synthesize_query(proposal: &Proposal) -> String {
    [&proposal.title, &proposal.summary, &proposal.content]
        .into_iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl UnifiedRuntime {
    pub async fn create_proposal(&self, new: NewProposal) -> Result<Proposal> {
        if new.title.trim().is_empty() {
            bail!("proposal needs a title");
        }
        let now = self.now();
        let proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            summary: new.summary,
            content: new.content,
            stage: ProposalStage::Idea,
            proposal_type: new.proposal_type,
            risk_level: new.risk_level,
            approval_status: ApprovalStatus::Pending,
            snooze_until: None,
            rejection_reason: None,
            source: new.source,
            source_ref: new.source_ref,
            created_at: now,
            updated_at: now,
        };
        self.store().insert_proposal(&proposal).await?;
        info!(proposal_id = %proposal.id, "Proposal created: {}", proposal.title);
        Ok(proposal)
    }

    /// Advance one stage. Reaching `archived` from `plan` creates the intent;
    /// approving an archived proposal changes nothing.
    pub async fn approve_proposal(&self, id: &str) -> Result<ApprovalOutcome> {
        let Some(proposal) = self.store().get_proposal(id).await? else {
            return Err(TransitionError::UnknownProposal(id.to_string()).into());
        };
        let from = proposal.stage;
        let Some(to) = from.next_on_approval() else {
            return Err(TransitionError::ProposalRejected(id.to_string()).into());
        };
        if from == ProposalStage::Archived {
            return Ok(ApprovalOutcome {
                proposal,
                intent: None,
            });
        }

        let approval = if to == ProposalStage::Archived {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Pending
        };
        let now = self.now();
        if !self
            .store()
            .advance_proposal(id, from, to, approval, now)
            .await?
        {
            // Another approval moved it first; report where it is now.
            let proposal = self
                .store()
                .get_proposal(id)
                .await?
                .ok_or_else(|| TransitionError::UnknownProposal(id.to_string()))?;
            return Ok(ApprovalOutcome {
                proposal,
                intent: None,
            });
        }
        info!(proposal_id = id, "Proposal approved: {} -> {}", from, to);

        let intent = if to == ProposalStage::Archived {
            let intent = self
                .create_intent(NewIntent {
                    title: proposal.title.clone(),
                    description: proposal.summary.clone(),
                    intent_type: proposal.proposal_type.clone(),
                    risk_level: proposal.risk_level.clone(),
                    query: synthesize_query(&proposal),
                    source_proposal_id: Some(proposal.id.clone()),
                    ..Default::default()
                })
                .await?;
            Some(intent)
        } else {
            None
        };

        self.emit(RuntimeEvent::ProposalApproved {
            proposal_id: id.to_string(),
            stage: to.to_string(),
            intent_id: intent.as_ref().map(|i| i.id.clone()),
        });
        let proposal = self
            .store()
            .get_proposal(id)
            .await?
            .ok_or_else(|| TransitionError::UnknownProposal(id.to_string()))?;
        Ok(ApprovalOutcome { proposal, intent })
    }

    /// Terminal from any stage. Never creates an intent.
    pub async fn reject_proposal(&self, id: &str, reason: Option<&str>) -> Result<Proposal> {
        let now = self.now();
        if !self.store().reject_proposal(id, reason, now).await? {
            return Err(TransitionError::UnknownProposal(id.to_string()).into());
        }
        info!(proposal_id = id, reason = ?reason, "Proposal rejected");
        self.emit(RuntimeEvent::ProposalRejected {
            proposal_id: id.to_string(),
            reason: reason.map(str::to_string),
        });
        self.store()
            .get_proposal(id)
            .await?
            .ok_or_else(|| TransitionError::UnknownProposal(id.to_string()).into())
    }

    /// Hide a proposal from the open list until `until_ms`.
    pub async fn snooze_proposal(&self, id: &str, until_ms: i64) -> Result<Proposal> {
        let now = self.now();
        if !self.store().snooze_proposal(id, until_ms, now).await? {
            return match self.store().get_proposal(id).await? {
                None => Err(TransitionError::UnknownProposal(id.to_string()).into()),
                Some(_) => Err(TransitionError::ProposalClosed(id.to_string()).into()),
            };
        }
        self.store()
            .get_proposal(id)
            .await?
            .ok_or_else(|| TransitionError::UnknownProposal(id.to_string()).into())
    }

    pub async fn list_open_proposals(&self) -> Result<Vec<Proposal>> {
        self.store().list_open_proposals(self.now()).await
    }
}
