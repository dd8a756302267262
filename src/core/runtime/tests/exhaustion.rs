use std::time::Duration;

use super::{harness, harness_with, join_all, new_intent};
use crate::core::config::DispatchConfig;
use crate::core::executors::fake::{FakeAdapter, FakeResponse};
use crate::core::store::{DeferredStatus, IntentStatus, RunStatus};

/// Gemini refuses on quota first, then answers.
fn recovering_gemini() -> FakeAdapter {
    FakeAdapter::new("gemini", FakeResponse::Ok("gemini done".to_string())).then(FakeResponse::Quota)
}

#[tokio::test]
async fn exhausted_chain_fails_intent_and_alerts_once() {
    let gemini = FakeAdapter::quota("gemini");
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness(&[&gemini, &api]);
    let rt = &h.runtime;

    let intent = rt.create_intent(new_intent("summarize inbox")).await.unwrap();
    join_all(rt.check_pending_work().await.unwrap()).await;

    let intent = rt.store().get_intent(&intent.id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Failed);
    let runs = rt.intent_runs(&intent.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].exhausted);

    let alerts = h.notifier.messages();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("All executors exhausted"));
    assert!(alerts[0].contains("Tried: gemini, anthropic-api"));

    // Normal priority allows deferral, so the request is parked for later.
    let deferred = rt.router().deferral().list(Some(DeferredStatus::Pending)).await.unwrap();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].request.intent_id.as_deref(), Some(intent.id.as_str()));
}

#[tokio::test]
async fn cooldown_stops_pulling_work_until_it_expires() {
    let gemini = FakeAdapter::quota("gemini");
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness(&[&gemini, &api]);
    let rt = &h.runtime;

    rt.create_intent(new_intent("first")).await.unwrap();
    join_all(rt.check_pending_work().await.unwrap()).await;
    assert_eq!(rt.exhaustion_remaining_ms(), Some(300_000));

    let second = rt.create_intent(new_intent("second")).await.unwrap();
    for _ in 0..3 {
        assert!(rt.check_pending_work().await.unwrap().is_empty());
    }
    assert_eq!(
        rt.store().get_intent(&second.id).await.unwrap().unwrap().status,
        IntentStatus::Pending
    );
    assert_eq!(h.notifier.messages().len(), 1);

    h.clock.advance(Duration::from_secs(301));
    assert_eq!(rt.exhaustion_remaining_ms(), None);
    join_all(rt.check_pending_work().await.unwrap()).await;
    assert_eq!(
        rt.store().get_intent(&second.id).await.unwrap().unwrap().status,
        IntentStatus::Failed
    );
    // A new window opened, so the second exhaustion alerts again.
    assert_eq!(h.notifier.messages().len(), 2);
}

#[tokio::test]
async fn simultaneous_exhaustions_share_one_alert() {
    let gemini = FakeAdapter::quota("gemini");
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness(&[&gemini, &api]);
    let rt = &h.runtime;

    for title in ["a", "b", "c"] {
        rt.create_intent(new_intent(title)).await.unwrap();
    }
    let handles = rt.check_pending_work().await.unwrap();
    assert_eq!(handles.len(), 3);
    join_all(handles).await;

    let failed = rt.list_intents(Some(IntentStatus::Failed)).await.unwrap();
    assert_eq!(failed.len(), 3);
    assert_eq!(h.notifier.messages().len(), 1);
}

#[tokio::test]
async fn immediate_intent_is_not_deferred() {
    let gemini = FakeAdapter::quota("gemini");
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness(&[&gemini, &api]);
    let rt = &h.runtime;

    let mut new = new_intent("urgent");
    new.priority = Some(crate::core::store::Priority::Critical);
    rt.create_intent(new).await.unwrap();
    join_all(rt.check_pending_work().await.unwrap()).await;

    assert!(rt.router().deferral().list(None).await.unwrap().is_empty());
    assert_eq!(h.notifier.messages().len(), 1);
}

#[tokio::test]
async fn alert_lists_pool_state_for_account_backed_executors() {
    let gemini = FakeAdapter::quota("gemini");
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness_with(DispatchConfig::default(), &[&gemini, &api]);
    let rt = &h.runtime;
    rt.router()
        .accounts()
        .upsert_account("gemini", "acct-1", None)
        .await
        .unwrap();

    rt.create_intent(new_intent("scan feeds")).await.unwrap();
    join_all(rt.check_pending_work().await.unwrap()).await;

    let alerts = h.notifier.messages();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains(" - gemini: 0/1 available, next in 1h 0m"));
}

#[tokio::test]
async fn deferred_success_completes_the_exhausted_intent() {
    let gemini = recovering_gemini();
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness(&[&gemini, &api]);
    let rt = &h.runtime;

    let intent = rt.create_intent(new_intent("digest feeds")).await.unwrap();
    join_all(rt.check_pending_work().await.unwrap()).await;
    assert_eq!(
        rt.store().get_intent(&intent.id).await.unwrap().unwrap().status,
        IntentStatus::Failed
    );

    // Not due yet.
    assert_eq!(rt.process_deferred().await.unwrap().processed, 0);

    h.clock.advance(Duration::from_secs(3601));
    let report = rt.process_deferred().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.dropped, 0);

    let intent = rt.store().get_intent(&intent.id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Completed);
    let runs = rt.intent_runs(&intent.id).await.unwrap();
    let summary: Vec<(i64, RunStatus, bool)> =
        runs.iter().map(|r| (r.attempt, r.status, r.exhausted)).collect();
    assert_eq!(
        summary,
        vec![(1, RunStatus::Failed, true), (2, RunStatus::Completed, false)]
    );
    assert_eq!(runs[1].output.as_deref(), Some("gemini done"));
    assert!(rt.router().deferral().list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn deferred_task_is_dropped_once_its_intent_is_cancelled() {
    let gemini = recovering_gemini();
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness(&[&gemini, &api]);
    let rt = &h.runtime;

    let intent = rt.create_intent(new_intent("digest feeds")).await.unwrap();
    join_all(rt.check_pending_work().await.unwrap()).await;
    rt.retry_intent(&intent.id).await.unwrap();
    rt.cancel_intent(&intent.id).await.unwrap();
    let calls = (gemini.calls(), api.calls());

    h.clock.advance(Duration::from_secs(3601));
    let report = rt.process_deferred().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.succeeded, 0);

    assert_eq!((gemini.calls(), api.calls()), calls);
    assert_eq!(
        rt.store().get_intent(&intent.id).await.unwrap().unwrap().status,
        IntentStatus::Cancelled
    );
    assert_eq!(rt.intent_runs(&intent.id).await.unwrap().len(), 1);
    assert!(rt.router().deferral().list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn deferred_task_yields_to_a_running_retry() {
    let gemini = recovering_gemini().with_delay(Duration::from_millis(300));
    let api = FakeAdapter::quota("anthropic-api");
    let h = harness(&[&gemini, &api]);
    let rt = h.runtime.clone();

    let intent = rt.create_intent(new_intent("digest feeds")).await.unwrap();
    join_all(rt.check_pending_work().await.unwrap()).await;
    rt.retry_intent(&intent.id).await.unwrap();
    h.clock.advance(Duration::from_secs(3601));

    let runner = rt.clone();
    let id = intent.id.clone();
    let retry = tokio::spawn(async move { runner.execute_intent(&id).await });
    while gemini.calls() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = rt.process_deferred().await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(gemini.calls(), 2);

    let outcome = retry.await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(gemini.calls(), 2);
    let runs = rt.intent_runs(&intent.id).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(
        runs.iter().filter(|r| r.status == RunStatus::Completed).count(),
        1
    );
    assert!(runs.iter().all(|r| r.status != RunStatus::Running));
    assert_eq!(
        rt.store().get_intent(&intent.id).await.unwrap().unwrap().status,
        IntentStatus::Completed
    );
}
