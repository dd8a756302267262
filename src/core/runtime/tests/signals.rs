use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{harness, join_all, new_intent};
use crate::core::events::SignalType;
use crate::core::executors::fake::FakeAdapter;
use crate::core::store::{IntentStatus, NewProposal, Priority, ProposalStage};

async fn wait_for_status(
    h: &super::Harness,
    id: &str,
    status: IntentStatus,
) {
    for _ in 0..200 {
        let intent = h.runtime.store().get_intent(id).await.unwrap().unwrap();
        if intent.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("intent {} never reached {}", id, status);
}

#[tokio::test]
async fn telegram_approval_advances_proposal() {
    let h = harness(&[]);
    let rt = &h.runtime;
    let proposal = rt
        .create_proposal(NewProposal {
            title: "Nightly backup check".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    rt.bus().signal(
        SignalType::Telegram,
        "chat",
        json!({"action": "approve", "id": proposal.id}),
        Priority::High,
    );
    let cancel = CancellationToken::new();
    assert!(rt.bus().process_next(&cancel).await);

    let proposal = rt.store().get_proposal(&proposal.id).await.unwrap().unwrap();
    assert_eq!(proposal.stage, ProposalStage::Research);
}

#[tokio::test]
async fn telegram_reject_carries_reason() {
    let h = harness(&[]);
    let rt = &h.runtime;
    let proposal = rt
        .create_proposal(NewProposal {
            title: "Buy more GPUs".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    rt.bus().signal(
        SignalType::Telegram,
        "chat",
        json!({"action": "reject", "id": proposal.id, "reason": "budget"}),
        Priority::High,
    );
    rt.bus().process_next(&CancellationToken::new()).await;

    let proposal = rt.store().get_proposal(&proposal.id).await.unwrap().unwrap();
    assert_eq!(proposal.stage, ProposalStage::Rejected);
    assert_eq!(proposal.rejection_reason.as_deref(), Some("budget"));
}

#[tokio::test]
async fn internal_check_work_runs_pending_intents() {
    let gemini = FakeAdapter::ok("gemini");
    let h = harness(&[&gemini]);
    let rt = &h.runtime;
    let intent = rt.create_intent(new_intent("digest")).await.unwrap();

    rt.bus().signal(
        SignalType::Internal,
        "ticker",
        json!({"action": "check_work"}),
        Priority::Normal,
    );
    rt.bus().process_next(&CancellationToken::new()).await;
    wait_for_status(&h, &intent.id, IntentStatus::Completed).await;
}

#[tokio::test]
async fn time_signal_targets_one_intent() {
    let gemini = FakeAdapter::ok("gemini");
    let h = harness(&[&gemini]);
    let rt = &h.runtime;
    let target = rt.create_intent(new_intent("target")).await.unwrap();
    let other = rt.create_intent(new_intent("other")).await.unwrap();

    rt.bus().signal(
        SignalType::Time,
        "scheduler",
        json!({"intent_id": target.id}),
        Priority::Normal,
    );
    rt.bus().process_next(&CancellationToken::new()).await;
    wait_for_status(&h, &target.id, IntentStatus::Completed).await;
    assert_eq!(
        rt.store().get_intent(&other.id).await.unwrap().unwrap().status,
        IntentStatus::Pending
    );
}

#[tokio::test]
async fn time_signal_waits_out_exhaustion_cooldown() {
    let gemini = FakeAdapter::quota("gemini");
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness(&[&gemini, &api]);
    let rt = &h.runtime;
    rt.create_intent(new_intent("first")).await.unwrap();
    join_all(rt.check_pending_work().await.unwrap()).await;
    assert!(rt.exhaustion_remaining_ms().is_some());

    let target = rt.create_intent(new_intent("target")).await.unwrap();
    let signal_target = || {
        rt.bus().signal(
            SignalType::Time,
            "scheduler",
            json!({"intent_id": target.id}),
            Priority::Normal,
        )
    };
    signal_target();
    rt.bus().process_next(&CancellationToken::new()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        rt.store().get_intent(&target.id).await.unwrap().unwrap().status,
        IntentStatus::Pending
    );
    assert_eq!(gemini.calls(), 1);

    h.clock.advance(Duration::from_secs(301));
    signal_target();
    rt.bus().process_next(&CancellationToken::new()).await;
    wait_for_status(&h, &target.id, IntentStatus::Failed).await;
    assert_eq!(gemini.calls(), 2);
}

#[tokio::test]
async fn daily_maintenance_signal_resets_token_counts() {
    let gemini = FakeAdapter::ok("gemini");
    let h = harness(&[&gemini]);
    let rt = &h.runtime;
    let account = rt
        .router()
        .accounts()
        .upsert_account("gemini", "acct", Some(100_000))
        .await
        .unwrap();
    rt.router()
        .accounts()
        .increment_token_usage(account, 5_000)
        .await
        .unwrap();

    rt.bus().signal(
        SignalType::Internal,
        "cron",
        json!({"action": "daily_maintenance"}),
        Priority::Low,
    );
    rt.bus().process_next(&CancellationToken::new()).await;

    let account = rt.store().get_account(account).await.unwrap().unwrap();
    assert_eq!(account.tokens_used_today, 0);
}

#[tokio::test]
async fn failed_user_action_does_not_stop_the_bus() {
    let h = harness(&[]);
    let rt = &h.runtime;
    rt.bus().signal(
        SignalType::Telegram,
        "chat",
        json!({"action": "retry", "id": "missing"}),
        Priority::High,
    );
    rt.bus().signal(
        SignalType::Telegram,
        "chat",
        json!({"action": "cancel"}),
        Priority::High,
    );
    let cancel = CancellationToken::new();
    assert!(rt.bus().process_next(&cancel).await);
    assert!(rt.bus().process_next(&cancel).await);
    assert!(!rt.bus().process_next(&cancel).await);
}
