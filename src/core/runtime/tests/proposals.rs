use std::time::Duration;

use super::harness;
use crate::core::clock::Clock;
use crate::core::runtime::TransitionError;
use crate::core::store::{ApprovalStatus, IntentStatus, NewProposal, ProposalStage};

fn new_proposal(title: &str) -> NewProposal {
    NewProposal {
        title: title.to_string(),
        summary: "Weekly digest of merged PRs".to_string(),
        content: "Collect merged PRs and summarize them.".to_string(),
        proposal_type: "research".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn three_approvals_archive_and_create_one_intent() {
    let h = harness(&[]);
    let rt = &h.runtime;
    let proposal = rt.create_proposal(new_proposal("PR digest")).await.unwrap();
    assert_eq!(proposal.stage, ProposalStage::Idea);

    let first = rt.approve_proposal(&proposal.id).await.unwrap();
    assert_eq!(first.proposal.stage, ProposalStage::Research);
    assert_eq!(first.proposal.approval_status, ApprovalStatus::Pending);
    assert!(first.intent.is_none());

    let second = rt.approve_proposal(&proposal.id).await.unwrap();
    assert_eq!(second.proposal.stage, ProposalStage::Plan);
    assert!(second.intent.is_none());

    let third = rt.approve_proposal(&proposal.id).await.unwrap();
    assert_eq!(third.proposal.stage, ProposalStage::Archived);
    assert_eq!(third.proposal.approval_status, ApprovalStatus::Approved);
    let intent = third.intent.unwrap();
    assert_eq!(intent.source_proposal_id.as_deref(), Some(proposal.id.as_str()));
    assert_eq!(intent.status, IntentStatus::Pending);
    assert_eq!(intent.intent_type, "research");
    assert!(intent.query.starts_with("PR digest\n\nWeekly digest of merged PRs"));

    // Approving again keeps it archived and adds nothing.
    let again = rt.approve_proposal(&proposal.id).await.unwrap();
    assert_eq!(again.proposal.stage, ProposalStage::Archived);
    assert!(again.intent.is_none());
    assert_eq!(rt.store().intents_for_proposal(&proposal.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rejection_is_terminal_and_creates_nothing() {
    let h = harness(&[]);
    let rt = &h.runtime;
    let proposal = rt.create_proposal(new_proposal("Rewrite in Go")).await.unwrap();
    rt.approve_proposal(&proposal.id).await.unwrap();

    let rejected = rt
        .reject_proposal(&proposal.id, Some("not worth it"))
        .await
        .unwrap();
    assert_eq!(rejected.stage, ProposalStage::Rejected);
    assert_eq!(rejected.approval_status, ApprovalStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("not worth it"));

    let err = rt.approve_proposal(&proposal.id).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<TransitionError>(),
        Some(&TransitionError::ProposalRejected(proposal.id.clone()))
    );
    assert!(rt.store().intents_for_proposal(&proposal.id).await.unwrap().is_empty());
    assert!(rt.list_open_proposals().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_proposal_is_an_error() {
    let h = harness(&[]);
    let err = h.runtime.approve_proposal("nope").await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<TransitionError>(),
        Some(&TransitionError::UnknownProposal("nope".to_string()))
    );
    assert!(h.runtime.reject_proposal("nope", None).await.is_err());
}

#[tokio::test]
async fn snoozed_proposal_is_hidden_until_it_wakes() {
    let h = harness(&[]);
    let rt = &h.runtime;
    let proposal = rt.create_proposal(new_proposal("Later")).await.unwrap();

    let until = h.clock.epoch_ms() + 3_600_000;
    rt.snooze_proposal(&proposal.id, until).await.unwrap();
    assert!(rt.list_open_proposals().await.unwrap().is_empty());

    h.clock.advance(Duration::from_secs(3_600));
    let open = rt.list_open_proposals().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, proposal.id);

    rt.reject_proposal(&proposal.id, None).await.unwrap();
    let err = rt.snooze_proposal(&proposal.id, until).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<TransitionError>(),
        Some(&TransitionError::ProposalClosed(proposal.id.clone()))
    );
}

#[tokio::test]
async fn proposal_requires_title() {
    let h = harness(&[]);
    assert!(h.runtime.create_proposal(NewProposal::default()).await.is_err());
}
