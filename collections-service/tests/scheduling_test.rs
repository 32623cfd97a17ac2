//! Scheduler tests: one instance per (subscription, period), due-date
//! clamping and notice-driven period selection.

mod common;

use collections_service::models::PaymentStatus;
use common::{at, date, TestHarness};

#[tokio::test]
async fn repeated_runs_create_exactly_one_instance_per_period() {
    let h = TestHarness::new();
    let (subscription, _) = h.active_subscription(28, at(2026, 11, 2)).await;

    let first = h.engine.scheduler.run(at(2026, 11, 2)).await.unwrap();
    assert_eq!(first.instances_created, 1);

    for _ in 0..5 {
        let again = h.engine.scheduler.run(at(2026, 11, 2)).await.unwrap();
        assert_eq!(again.instances_created, 0);
    }

    let payments = h.payments(subscription.subscription_id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].period_key.to_string(), "2026-11");
    assert_eq!(payments[0].status, PaymentStatus::Scheduled);
}

#[tokio::test]
async fn anchor_31_clamps_to_last_day_of_30_day_month() {
    let h = TestHarness::new();
    let (subscription, _) = h.active_subscription(31, at(2026, 11, 1)).await;

    h.engine.scheduler.run(at(2026, 11, 1)).await.unwrap();

    let payments = h.payments(subscription.subscription_id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].due_date, date(2026, 11, 30));
    assert_eq!(payments[0].notify_by, date(2026, 11, 16));
}

#[tokio::test]
async fn period_with_insufficient_notice_moves_to_next_period() {
    let h = TestHarness::new();
    let (subscription, _) = h.active_subscription(5, at(2026, 11, 2)).await;

    h.engine.scheduler.run(at(2026, 11, 2)).await.unwrap();

    let payments = h.payments(subscription.subscription_id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].period_key.to_string(), "2026-12");
    assert_eq!(payments[0].due_date, date(2026, 12, 5));
    assert!(payments[0].notify_by >= date(2026, 11, 2));
}

#[tokio::test]
async fn pending_mandate_is_not_scheduled() {
    let h = TestHarness::new();
    let activation = h.activation(28, date(2026, 1, 1));
    let subscription = h
        .engine
        .lifecycle
        .activate(&activation, at(2026, 11, 2))
        .await
        .unwrap();

    let report = h.engine.scheduler.run(at(2026, 11, 2)).await.unwrap();

    assert_eq!(report.instances_created, 0);
    assert!(h.payments(subscription.subscription_id).await.is_empty());
}

#[tokio::test]
async fn suspended_mandate_is_not_scheduled() {
    let h = TestHarness::new();
    let (subscription, mandate) = h.active_subscription(28, at(2026, 11, 2)).await;
    h.engine
        .mandates
        .suspend(mandate.mandate_id, "bank query", at(2026, 11, 2))
        .await
        .unwrap();

    h.engine.scheduler.run(at(2026, 11, 2)).await.unwrap();

    assert!(h.payments(subscription.subscription_id).await.is_empty());
}

#[tokio::test]
async fn paused_subscription_is_skipped_and_resume_restores_scheduling() {
    let h = TestHarness::new();
    let (subscription, _) = h.active_subscription(28, at(2026, 11, 2)).await;

    h.engine
        .lifecycle
        .pause_subscription(subscription.subscription_id, at(2026, 11, 2))
        .await
        .unwrap();
    h.engine.scheduler.run(at(2026, 11, 2)).await.unwrap();
    assert!(h.payments(subscription.subscription_id).await.is_empty());

    h.engine
        .lifecycle
        .resume_subscription(subscription.subscription_id, at(2026, 11, 3))
        .await
        .unwrap();
    h.engine.scheduler.run(at(2026, 11, 3)).await.unwrap();
    assert_eq!(h.payments(subscription.subscription_id).await.len(), 1);
}

#[tokio::test]
async fn next_period_is_scheduled_once_current_notice_has_passed() {
    let h = TestHarness::new();
    let (subscription, _) = h.active_subscription(28, at(2026, 11, 2)).await;

    h.engine.scheduler.run(at(2026, 11, 2)).await.unwrap();
    h.engine.scheduler.run(at(2026, 11, 20)).await.unwrap();
    h.engine.scheduler.run(at(2026, 11, 21)).await.unwrap();

    let periods: Vec<String> = h
        .payments(subscription.subscription_id)
        .await
        .iter()
        .map(|p| p.period_key.to_string())
        .collect();
    assert_eq!(periods, vec!["2026-11", "2026-12"]);
}
