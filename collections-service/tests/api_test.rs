//! REST surface: contract activation, operator actions, health and job
//! triggers, driven through the router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use collections_service::startup::{build_router, AppState};
use common::{date, TestHarness, BAD_CHECKSUM_IBAN, WEBHOOK_SECRET};
use http_body_util::BodyExt;
use secrecy::Secret;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

fn app(h: &TestHarness) -> Router {
    build_router(AppState::new(
        h.ctx.clone(),
        Secret::new(WEBHOOK_SECRET.to_string()),
    ))
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_check_works() {
    let h = TestHarness::new();

    let (status, body) = send(app(&h), "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "collections-service");
}

#[tokio::test]
async fn activation_creates_subscription() {
    let h = TestHarness::new();
    let activation = h.activation(28, date(2026, 1, 1));

    let (status, body) = send(
        app(&h),
        "POST",
        "/contracts/activations",
        Some(serde_json::to_value(&activation).unwrap()),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["contract_id"], activation.contract_id.to_string());
    assert_eq!(body["status"], "active");
    assert_eq!(body["currency"], "EUR");
}

#[tokio::test]
async fn activation_with_bad_iban_is_unprocessable() {
    let h = TestHarness::new();
    let mut activation = h.activation(28, date(2026, 1, 1));
    activation.bank_details.iban = BAD_CHECKSUM_IBAN.to_string();

    let (status, _) = send(
        app(&h),
        "POST",
        "/contracts/activations",
        Some(serde_json::to_value(&activation).unwrap()),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn activation_with_invalid_anchor_day_is_unprocessable() {
    let h = TestHarness::new();
    let mut activation = h.activation(28, date(2026, 1, 1));
    activation.anchor_day = 32;

    let (status, body) = send(
        app(&h),
        "POST",
        "/contracts/activations",
        Some(serde_json::to_value(&activation).unwrap()),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "Validation error");
}

#[tokio::test]
async fn unknown_mandate_is_not_found() {
    let h = TestHarness::new();

    let (status, _) = send(
        app(&h),
        "GET",
        &format!("/mandates/{}", Uuid::new_v4()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn operator_can_cancel_mandate() {
    let h = TestHarness::new();
    let (_, mandate) = h.active_subscription(28, common::at(2026, 11, 2)).await;
    let uri = format!("/mandates/{}/cancel", mandate.mandate_id);

    let (status, _) = send(
        app(&h),
        "POST",
        &uri,
        Some(serde_json::json!({ "reason": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(
        app(&h),
        "POST",
        &uri,
        Some(serde_json::json!({ "reason": "payer closed account" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["status_reason"], "payer closed account");

    let (status, _) = send(
        app(&h),
        "POST",
        &format!("/mandates/{}/reactivate", mandate.mandate_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn contract_end_cancels_subscription() {
    let h = TestHarness::new();
    let (subscription, _) = h.active_subscription(28, common::at(2026, 11, 2)).await;

    let (status, body) = send(
        app(&h),
        "POST",
        &format!("/contracts/{}/ended", subscription.contract_id),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["status"], "cancelled");
}

#[tokio::test]
async fn payments_of_unknown_subscription_are_not_found() {
    let h = TestHarness::new();

    let (status, _) = send(
        app(&h),
        "GET",
        &format!("/subscriptions/{}/payments", Uuid::new_v4()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn job_triggers_return_run_reports() {
    let h = TestHarness::new();

    let (status, body) = send(app(&h), "POST", "/jobs/schedule", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instances_created"], 0);

    let (status, body) = send(app(&h), "POST", "/jobs/dunning", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alerts_raised"], 0);
}
