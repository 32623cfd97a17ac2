//! Gateway webhook handling: replay, ordering, deduplication and the HTTP
//! entry point.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use collections_service::models::{MandateStatus, PaymentStatus};
use collections_service::services::gateway::{sign_webhook_body, WEBHOOK_SIGNATURE_HEADER};
use collections_service::services::{CollectionsStore, WebhookClaim, WEBHOOK_CLAIM_LEASE_SECS};
use collections_service::startup::{build_router, AppState};
use common::{at, envelope, event, TestHarness, WEBHOOK_SECRET};
use http_body_util::BodyExt;
use secrecy::Secret;
use tower::ServiceExt;

#[tokio::test]
async fn paid_webhook_replay_has_no_duplicate_side_effects() {
    let h = TestHarness::new();
    let (subscription, _, payment) = h.submitted_payment().await;
    let gateway_id = payment.gateway_payment_id.clone().unwrap();
    let notifications_before = h.notifier.sent().len();

    let first = h
        .deliver("EV100", "payment.paid", &gateway_id, None, at(2026, 11, 30))
        .await;
    assert_eq!(first.applied, 1);

    // Same delivery again, and the same fact under a new event id.
    let replay = h
        .deliver("EV100", "payment.paid", &gateway_id, None, at(2026, 11, 30))
        .await;
    assert_eq!(replay.duplicates, 1);
    let redelivered = h
        .deliver("EV101", "payment.paid", &gateway_id, None, at(2026, 12, 1))
        .await;
    assert_eq!(redelivered.applied, 0);
    assert_eq!(redelivered.absorbed, 1);

    assert_eq!(h.payment(payment.payment_id).await.status, PaymentStatus::Paid);
    assert_eq!(h.notifier.sent().len(), notifications_before);
    assert_eq!(h.contracts.first_payments(), vec![subscription.contract_id]);
}

#[tokio::test]
async fn confirmed_then_paid_reports_first_payment_once() {
    let h = TestHarness::new();
    let (subscription, _, payment) = h.submitted_payment().await;
    let gateway_id = payment.gateway_payment_id.clone().unwrap();

    h.deliver("EV1", "payment.confirmed", &gateway_id, None, at(2026, 11, 28))
        .await;
    h.deliver("EV2", "payment.paid", &gateway_id, None, at(2026, 12, 2))
        .await;

    assert_eq!(h.payment(payment.payment_id).await.status, PaymentStatus::Paid);
    assert_eq!(h.contracts.first_payments(), vec![subscription.contract_id]);
}

#[tokio::test]
async fn returned_before_confirmed_stays_returned() {
    let h = TestHarness::new();
    let (_, mandate, payment) = h.submitted_payment().await;
    let gateway_id = payment.gateway_payment_id.clone().unwrap();

    let returned = h
        .deliver("EV1", "payment.returned", &gateway_id, Some("AM04"), at(2026, 11, 29))
        .await;
    assert_eq!(returned.applied, 1);

    let late_confirm = h
        .deliver("EV2", "payment.confirmed", &gateway_id, None, at(2026, 11, 30))
        .await;
    assert_eq!(late_confirm.applied, 0);
    assert_eq!(late_confirm.absorbed, 1);
    assert_eq!(late_confirm.failed, 0);

    let stored = h.payment(payment.payment_id).await;
    assert_eq!(stored.status, PaymentStatus::Returned);
    assert_eq!(stored.return_code.as_deref(), Some("AM04"));
    assert!(h.contracts.first_payments().is_empty());
    assert_eq!(
        h.engine.mandates.get(mandate.mandate_id).await.unwrap().status,
        MandateStatus::Active
    );
}

#[tokio::test]
async fn unknown_resources_and_event_types_are_absorbed() {
    let h = TestHarness::new();
    let batch = envelope(vec![
        event("EV1", "payment.paid", "PM-unknown", None),
        event("EV2", "mandate.activated", "MD-unknown", None),
        event("EV3", "payout.paid", "PO1", None),
    ]);

    let report = h.engine.process_webhook(&batch, at(2026, 11, 2)).await.unwrap();

    assert_eq!(report.absorbed, 3);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn mandate_activation_webhook_is_idempotent() {
    let h = TestHarness::new();
    let activation = h.activation(28, common::date(2026, 1, 1));
    let subscription = h
        .engine
        .lifecycle
        .activate(&activation, at(2026, 11, 2))
        .await
        .unwrap();
    let mandate = h.engine.mandates.get(subscription.mandate_id).await.unwrap();
    assert_eq!(mandate.status, MandateStatus::PendingCustomerApproval);

    let first = h
        .deliver("EV1", "mandate.activated", &mandate.gateway_mandate_id, None, at(2026, 11, 3))
        .await;
    let second = h
        .deliver("EV2", "mandate.activated", &mandate.gateway_mandate_id, None, at(2026, 11, 4))
        .await;

    assert_eq!(first.applied, 1);
    assert_eq!(second.absorbed, 1);
    assert_eq!(
        h.engine.mandates.get(mandate.mandate_id).await.unwrap().status,
        MandateStatus::Active
    );
}

#[tokio::test]
async fn abandoned_claim_is_taken_over_after_the_lease() {
    let h = TestHarness::new();
    let (_, _, payment) = h.submitted_payment().await;
    let gateway_id = payment.gateway_payment_id.clone().unwrap();

    // A delivery claims the event and dies before completing it.
    let claimed_at = at(2026, 11, 30);
    let claim = h
        .store
        .claim_webhook_event("EV9", "payment.paid", claimed_at)
        .await
        .unwrap();
    assert_eq!(claim, WebhookClaim::Claimed);

    let within_lease = h
        .deliver("EV9", "payment.paid", &gateway_id, None, claimed_at + Duration::seconds(60))
        .await;
    assert_eq!(within_lease.in_progress, 1);
    assert_eq!(within_lease.duplicates, 0);
    assert_eq!(h.payment(payment.payment_id).await.status, PaymentStatus::Submitted);

    let after_lease = claimed_at + Duration::seconds(WEBHOOK_CLAIM_LEASE_SECS + 1);
    let report = h
        .deliver("EV9", "payment.paid", &gateway_id, None, after_lease)
        .await;
    assert_eq!(report.applied, 1);
    assert_eq!(h.payment(payment.payment_id).await.status, PaymentStatus::Paid);

    let replay = h
        .deliver("EV9", "payment.paid", &gateway_id, None, after_lease)
        .await;
    assert_eq!(replay.duplicates, 1);
}

fn app(h: &TestHarness) -> axum::Router {
    build_router(AppState::new(
        h.ctx.clone(),
        Secret::new(WEBHOOK_SECRET.to_string()),
    ))
}

fn webhook_request(body: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/gateway")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(WEBHOOK_SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn webhook_endpoint_rejects_bad_signatures() {
    let h = TestHarness::new();
    let body = r#"{"events":[]}"#;

    let unsigned = app(&h).oneshot(webhook_request(body, None)).await.unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let forged = sign_webhook_body("some-other-secret", body.as_bytes());
    let response = app(&h)
        .oneshot(webhook_request(body, Some(forged)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_endpoint_applies_signed_batches() {
    let h = TestHarness::new();
    let (_, _, payment) = h.submitted_payment().await;
    let gateway_id = payment.gateway_payment_id.clone().unwrap();
    let body = serde_json::json!({
        "events": [
            { "id": "EV9", "type": "payment.confirmed", "resource_id": gateway_id }
        ]
    })
    .to_string();
    let signature = sign_webhook_body(WEBHOOK_SECRET, body.as_bytes());

    let response = app(&h)
        .oneshot(webhook_request(&body, Some(signature.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let report: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(report["applied"], 1);

    let replay = app(&h)
        .oneshot(webhook_request(&body, Some(signature)))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(
        h.payment(payment.payment_id).await.status,
        PaymentStatus::Confirmed
    );
}

#[tokio::test]
async fn webhook_endpoint_asks_for_redelivery_while_event_is_claimed() {
    let h = TestHarness::new();
    let (_, _, payment) = h.submitted_payment().await;
    let gateway_id = payment.gateway_payment_id.clone().unwrap();
    h.store
        .claim_webhook_event("EV12", "payment.paid", Utc::now())
        .await
        .unwrap();
    let body = serde_json::json!({
        "events": [
            { "id": "EV12", "type": "payment.paid", "resource_id": gateway_id }
        ]
    })
    .to_string();
    let signature = sign_webhook_body(WEBHOOK_SECRET, body.as_bytes());

    let response = app(&h)
        .oneshot(webhook_request(&body, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(h.payment(payment.payment_id).await.status, PaymentStatus::Submitted);
}

#[tokio::test]
async fn webhook_endpoint_rejects_malformed_payloads() {
    let h = TestHarness::new();
    let body = r#"{"not_events": true}"#;
    let signature = sign_webhook_body(WEBHOOK_SECRET, body.as_bytes());

    let response = app(&h)
        .oneshot(webhook_request(body, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
