use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;

use super::{harness, harness_with, join_all, new_intent};
use crate::core::clock::Clock;
use crate::core::config::DispatchConfig;
use crate::core::events::RuntimeEvent;
use crate::core::executors::fake::FakeAdapter;
use crate::core::runtime::TransitionError;
use crate::core::store::{IntentStatus, Priority, RunStatus};

#[tokio::test]
async fn successful_intent_completes_with_one_run() {
    let gemini = FakeAdapter::ok("gemini");
    let h = harness(&[&gemini]);
    let rt = &h.runtime;
    let completed = Arc::new(AtomicUsize::new(0));
    let seen = completed.clone();
    rt.bus().on(
        "intent.completed",
        Arc::new(move |_: &RuntimeEvent| -> Result<()> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let intent = rt.create_intent(new_intent("triage issues")).await.unwrap();
    let outcome = rt.execute_intent(&intent.id).await.unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.executor.as_deref(), Some("gemini"));
    assert!(!outcome.exhausted);

    let intent = rt.store().get_intent(&intent.id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Completed);
    let runs = rt.intent_runs(&intent.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].output.as_deref(), Some("gemini done"));
    assert_eq!(runs[0].attempt, 1);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(h.notifier.messages().is_empty());
    assert!(rt.status().in_flight.is_empty());
}

#[tokio::test]
async fn concurrent_execution_of_same_intent_runs_once() {
    let gemini = FakeAdapter::ok("gemini").with_delay(Duration::from_millis(50));
    let h = harness(&[&gemini]);
    let rt = &h.runtime;

    let intent = rt.create_intent(new_intent("once")).await.unwrap();
    let (a, b) = tokio::join!(rt.execute_intent(&intent.id), rt.execute_intent(&intent.id));
    let started = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(started, 1);
    assert_eq!(rt.intent_runs(&intent.id).await.unwrap().len(), 1);
    assert_eq!(gemini.calls(), 1);
}

#[tokio::test]
async fn finished_intent_is_not_executed_again() {
    let gemini = FakeAdapter::ok("gemini");
    let h = harness(&[&gemini]);
    let rt = &h.runtime;

    let intent = rt.create_intent(new_intent("once")).await.unwrap();
    assert!(rt.execute_intent(&intent.id).await.unwrap().is_some());
    assert!(rt.execute_intent(&intent.id).await.unwrap().is_none());
    assert_eq!(gemini.calls(), 1);
}

#[tokio::test]
async fn check_respects_max_concurrent_runs() {
    let gemini = FakeAdapter::ok("gemini");
    let mut config = DispatchConfig::default();
    config.runtime.max_concurrent_runs = 1;
    let h = harness_with(config, &[&gemini]);
    let rt = &h.runtime;

    for title in ["a", "b", "c"] {
        rt.create_intent(new_intent(title)).await.unwrap();
    }
    let handles = rt.check_pending_work().await.unwrap();
    assert_eq!(handles.len(), 1);
    join_all(handles).await;
    assert_eq!(rt.list_intents(Some(IntentStatus::Pending)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn higher_priority_runs_first() {
    let gemini = FakeAdapter::ok("gemini");
    let api = FakeAdapter::ok("anthropic-api");
    let mut config = DispatchConfig::default();
    config.runtime.max_concurrent_runs = 1;
    let h = harness_with(config, &[&gemini, &api]);
    let rt = &h.runtime;

    let mut low = new_intent("low");
    low.priority = Some(Priority::Low);
    rt.create_intent(low).await.unwrap();
    h.clock.advance(Duration::from_secs(1));
    let mut high = new_intent("high");
    high.priority = Some(Priority::High);
    let high = rt.create_intent(high).await.unwrap();

    join_all(rt.check_pending_work().await.unwrap()).await;
    let completed = rt.list_intents(Some(IntentStatus::Completed)).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, high.id);
}

#[tokio::test]
async fn scheduled_intent_waits_for_its_time() {
    let gemini = FakeAdapter::ok("gemini");
    let h = harness(&[&gemini]);
    let rt = &h.runtime;

    let mut later = new_intent("later");
    later.scheduled_for = Some(h.clock.epoch_ms() + 60_000);
    let later = rt.create_intent(later).await.unwrap();
    assert!(rt.check_pending_work().await.unwrap().is_empty());

    h.clock.advance(Duration::from_secs(61));
    join_all(rt.check_pending_work().await.unwrap()).await;
    assert_eq!(
        rt.store().get_intent(&later.id).await.unwrap().unwrap().status,
        IntentStatus::Completed
    );
}

#[tokio::test]
async fn forced_executor_comes_from_preference() {
    let gemini = FakeAdapter::ok("gemini");
    let codex = FakeAdapter::ok("codex");
    let h = harness(&[&gemini, &codex]);
    let rt = &h.runtime;

    let mut new = new_intent("review diff");
    new.executor_preference = Some("codex".to_string());
    let intent = rt.create_intent(new).await.unwrap();
    let outcome = rt.execute_intent(&intent.id).await.unwrap().unwrap();
    assert_eq!(outcome.executor.as_deref(), Some("codex"));
    assert_eq!(gemini.calls(), 0);
}

#[tokio::test]
async fn retry_and_cancel_follow_status_rules() {
    let claude = FakeAdapter::failing("claude-code");
    let h = harness(&[&claude]);
    let rt = &h.runtime;

    let mut new = new_intent("refactor");
    new.intent_type = "code".to_string();
    let intent = rt.create_intent(new).await.unwrap();

    let err = rt.retry_intent(&intent.id).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<TransitionError>(),
        Some(&TransitionError::Intent {
            id: intent.id.clone(),
            status: IntentStatus::Pending,
            action: "retry",
        })
    );

    rt.execute_intent(&intent.id).await.unwrap();
    assert_eq!(
        rt.store().get_intent(&intent.id).await.unwrap().unwrap().status,
        IntentStatus::Failed
    );
    assert!(rt.cancel_intent(&intent.id).await.is_err());

    let retried = rt.retry_intent(&intent.id).await.unwrap();
    assert_eq!(retried.status, IntentStatus::Pending);
    let cancelled = rt.cancel_intent(&intent.id).await.unwrap();
    assert_eq!(cancelled.status, IntentStatus::Cancelled);
    assert!(rt.execute_intent(&intent.id).await.unwrap().is_none());

    let err = rt.retry_intent("missing").await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<TransitionError>(),
        Some(&TransitionError::UnknownIntent("missing".to_string()))
    );
}

#[tokio::test]
async fn retried_intent_gets_a_second_attempt() {
    let claude = FakeAdapter::failing("claude-code");
    let h = harness(&[&claude]);
    let rt = &h.runtime;

    let mut new = new_intent("refactor");
    new.intent_type = "code".to_string();
    let intent = rt.create_intent(new).await.unwrap();
    rt.execute_intent(&intent.id).await.unwrap();
    rt.retry_intent(&intent.id).await.unwrap();
    rt.execute_intent(&intent.id).await.unwrap();

    let runs = rt.intent_runs(&intent.id).await.unwrap();
    let attempts: Vec<i64> = runs.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn shutdown_cancels_in_progress_run() {
    let gemini = FakeAdapter::ok("gemini").with_delay(Duration::from_secs(30));
    let h = harness(&[&gemini]);
    let rt = h.runtime.clone();

    let intent = rt.create_intent(new_intent("slow")).await.unwrap();
    let runner = rt.clone();
    let id = intent.id.clone();
    let task = tokio::spawn(async move { runner.execute_intent(&id).await });
    while gemini.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    rt.cancel_all();

    let outcome = task.await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(
        rt.store().get_intent(&intent.id).await.unwrap().unwrap().status,
        IntentStatus::Cancelled
    );
    assert!(h.notifier.messages().is_empty());
}

#[tokio::test]
async fn intent_without_text_is_rejected() {
    let h = harness(&[]);
    assert!(h.runtime.create_intent(Default::default()).await.is_err());
}

#[tokio::test]
async fn lone_executor_failure_alerts_without_cooldown() {
    let claude = FakeAdapter::failing("claude-code");
    let h = harness(&[&claude]);
    let rt = &h.runtime;

    let mut new = new_intent("refactor");
    new.intent_type = "code".to_string();
    let intent = rt.create_intent(new).await.unwrap();
    let outcome = rt.execute_intent(&intent.id).await.unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(!outcome.exhausted);

    let runs = rt.intent_runs(&intent.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].exit_code, Some(1));
    assert!(!runs[0].exhausted);

    let alerts = h.notifier.messages();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].starts_with("❌ Intent failed"));
    assert!(alerts[0].contains("Executor: claude-code"));
    assert_eq!(rt.exhaustion_remaining_ms(), None);
    assert!(rt.router().deferral().list(None).await.unwrap().is_empty());

    // Other work keeps flowing.
    rt.create_intent(new_intent("next")).await.unwrap();
    let handles = rt.check_pending_work().await.unwrap();
    assert_eq!(handles.len(), 1);
    join_all(handles).await;
}

#[tokio::test]
async fn storage_failure_after_claim_fails_the_intent() {
    let gemini = FakeAdapter::ok("gemini");
    let h = harness(&[&gemini]);
    let rt = &h.runtime;
    let intent = rt.create_intent(new_intent("triage issues")).await.unwrap();
    rt.store()
        .execute_batch(
            "CREATE TRIGGER no_runs BEFORE INSERT ON runs
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .await
        .unwrap();

    let err = rt.execute_intent(&intent.id).await.unwrap_err();
    assert!(format!("{:#}", err).contains("disk full"));
    assert_eq!(gemini.calls(), 0);
    assert_eq!(
        rt.store().get_intent(&intent.id).await.unwrap().unwrap().status,
        IntentStatus::Failed
    );

    // The claim is released, so a retry can run once storage recovers.
    rt.store().execute_batch("DROP TRIGGER no_runs;").await.unwrap();
    rt.retry_intent(&intent.id).await.unwrap();
    let outcome = rt.execute_intent(&intent.id).await.unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
}
