//! Dunning escalation: staged overdue reminders, cool-down, expiry and
//! renewal alerts.

mod common;

use collections_service::services::EndingContract;
use common::{at, date, TestHarness};
use uuid::Uuid;

/// A November instance returned for insufficient funds, due 2026-11-28.
async fn returned_payment(h: &TestHarness) {
    let (_, _, payment) = h.submitted_payment().await;
    let gateway_id = payment.gateway_payment_id.unwrap();
    h.deliver("EV1", "payment.returned", &gateway_id, Some("AM04"), at(2026, 11, 29))
        .await;
}

#[tokio::test]
async fn overdue_payment_alerts_once_per_stage() {
    let h = TestHarness::new();
    returned_payment(&h).await;

    let first = h.engine.dunning.run(at(2026, 11, 30)).await.unwrap();
    assert_eq!(first.alerts_raised, 1);

    let same_stage = h.engine.dunning.run(at(2026, 12, 4)).await.unwrap();
    assert_eq!(same_stage.alerts_raised, 0);
    assert_eq!(same_stage.suppressed, 1);

    let sent = h.notifier.sent();
    let overdue: Vec<_> = sent
        .iter()
        .filter(|r| r.template.as_str() == "payment_overdue")
        .collect();
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].recipient, "anna.schmidt@example.com");
    assert_eq!(overdue[0].data["stage"], "initial");
    assert_eq!(overdue[0].data["days_overdue"], 2);
}

#[tokio::test]
async fn stage_change_inside_cool_down_is_suppressed() {
    let h = TestHarness::new();
    returned_payment(&h).await;

    h.engine.dunning.run(at(2026, 11, 30)).await.unwrap();

    // Day 8 is the followup stage, but only six days have passed.
    let early = h.engine.dunning.run(at(2026, 12, 6)).await.unwrap();
    assert_eq!(early.alerts_raised, 0);
    assert_eq!(early.suppressed, 1);

    let after_cool_down = h.engine.dunning.run(at(2026, 12, 7)).await.unwrap();
    assert_eq!(after_cool_down.alerts_raised, 1);
    assert_eq!(h.notifier.sent_with_template("payment_overdue"), 2);
}

#[tokio::test]
async fn failed_delivery_is_retried_on_next_run() {
    let h = TestHarness::new();
    returned_payment(&h).await;

    h.notifier.fail_next(1);
    let failed = h.engine.dunning.run(at(2026, 11, 30)).await.unwrap();
    assert_eq!(failed.alerts_raised, 0);
    assert_eq!(failed.errors, 1);

    let retried = h.engine.dunning.run(at(2026, 12, 1)).await.unwrap();
    assert_eq!(retried.alerts_raised, 1);
}

#[tokio::test]
async fn payment_due_today_is_not_overdue() {
    let h = TestHarness::new();
    returned_payment(&h).await;

    let report = h.engine.dunning.run(at(2026, 11, 28)).await.unwrap();

    assert_eq!(report.alerts_raised, 0);
    assert_eq!(h.notifier.sent_with_template("payment_overdue"), 0);
}

#[tokio::test]
async fn approaching_mandate_expiry_is_announced() {
    let h = TestHarness::new();
    let mut activation = h.activation(15, date(2026, 1, 1));
    activation.mandate_expires_on = Some(date(2027, 1, 20));
    h.activate(&activation, at(2026, 11, 1)).await;

    // 61 days left: inside the horizon, initial stage.
    let report = h.engine.dunning.run(at(2026, 11, 20)).await.unwrap();
    assert_eq!(report.alerts_raised, 1);

    let alerts: Vec<_> = h
        .notifier
        .sent()
        .into_iter()
        .filter(|r| r.template.as_str() == "mandate_expiry")
        .collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].data["stage"], "initial");
    assert_eq!(alerts[0].data["days_left"], 61);

    // Seven days left is critical.
    let report = h.engine.dunning.run(at(2027, 1, 13)).await.unwrap();
    assert_eq!(report.alerts_raised, 1);
    assert_eq!(h.notifier.sent_with_template("mandate_expiry"), 2);
}

#[tokio::test]
async fn mandate_without_expiry_is_never_announced() {
    let h = TestHarness::new();
    h.active_subscription(15, at(2026, 11, 1)).await;

    let report = h.engine.dunning.run(at(2026, 11, 20)).await.unwrap();

    assert_eq!(report.alerts_raised, 0);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn ending_contracts_get_renewal_reminders() {
    let h = TestHarness::new();
    let contract_id = Uuid::new_v4();
    h.contracts.ending.lock().unwrap().extend([
        EndingContract {
            contract_id,
            customer_id: Uuid::new_v4(),
            recipient: "renewals@example.com".to_string(),
            ends_on: date(2026, 12, 10),
        },
        EndingContract {
            contract_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            recipient: "later@example.com".to_string(),
            ends_on: date(2027, 6, 1),
        },
    ]);

    let report = h.engine.dunning.run(at(2026, 11, 20)).await.unwrap();
    assert_eq!(report.alerts_raised, 1);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template.as_str(), "contract_renewal");
    assert_eq!(sent[0].recipient, "renewals@example.com");
    assert_eq!(sent[0].data["stage"], "urgent");
    assert_eq!(
        sent[0].dedup_key,
        format!("contract_renewal_{}_urgent", contract_id)
    );

    let again = h.engine.dunning.run(at(2026, 11, 22)).await.unwrap();
    assert_eq!(again.alerts_raised, 0);
    assert_eq!(again.suppressed, 1);
}
