//! HTTP gateway adapter against a mock provider.

use chrono::NaiveDate;
use collections_service::config::GatewayConfig;
use collections_service::models::DirectDebitScheme;
use collections_service::services::{
    GatewayError, HttpGateway, NewGatewayMandate, NewGatewayPayment, PaymentGateway,
    RetryingGateway,
};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::retry::RetryConfig;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway(server: &MockServer) -> HttpGateway {
    HttpGateway::new(&GatewayConfig {
        base_url: server.uri(),
        access_token: Secret::new("test-token".to_string()),
        webhook_secret: Secret::new("whsec".to_string()),
        timeout: Duration::from_secs(2),
    })
    .unwrap()
}

fn payment_request() -> NewGatewayPayment {
    NewGatewayPayment {
        idempotency_key: "pay_0f3c2d_2026-11".to_string(),
        gateway_mandate_id: "MD0001".to_string(),
        amount: Decimal::new(95000, 2),
        currency: "EUR".to_string(),
        charge_date: NaiveDate::from_ymd_opt(2026, 11, 28).unwrap(),
        reference: "DD0F3C-2026-11".to_string(),
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        add_jitter: false,
        attempt_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn create_payment_sends_minor_units_and_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payments"))
        .and(header("Authorization", "Bearer test-token"))
        .and(header("Idempotency-Key", "pay_0f3c2d_2026-11"))
        .and(body_partial_json(serde_json::json!({
            "mandate": "MD0001",
            "amount": 95000,
            "currency": "EUR",
            "charge_date": "2026-11-28"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": "PM0042" })))
        .expect(1)
        .mount(&server)
        .await;

    let id = gateway(&server)
        .create_payment(&payment_request())
        .await
        .unwrap();

    assert_eq!(id, "PM0042");
}

#[tokio::test]
async fn business_refusal_is_rejected_with_provider_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mandates"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "error": { "code": "invalid_iban", "message": "bank account not found" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = gateway(&server)
        .create_mandate(&NewGatewayMandate {
            gateway_customer_id: "CU0001".to_string(),
            account_holder: "Anna Schmidt".to_string(),
            iban: "DE89370400440532013000".to_string(),
            scheme: DirectDebitScheme::SepaCore,
            reference: "DD0F3C".to_string(),
        })
        .await;

    match result {
        Err(GatewayError::Rejected { code, message }) => {
            assert_eq!(code, "invalid_iban");
            assert_eq!(message, "bank account not found");
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payments"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let result = gateway(&server).create_payment(&payment_request()).await;

    assert!(matches!(result, Err(GatewayError::Transient(_))));
}

#[tokio::test]
async fn retrying_gateway_recovers_from_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payments"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/payments"))
        .and(header("Idempotency-Key", "pay_0f3c2d_2026-11"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": "PM0043" })))
        .expect(1)
        .mount(&server)
        .await;

    let retrying = RetryingGateway::new(gateway(&server), fast_retry());
    let id = retrying.create_payment(&payment_request()).await.unwrap();

    assert_eq!(id, "PM0043");
}

#[tokio::test]
async fn retrying_gateway_does_not_retry_rejections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payments"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "error": { "code": "mandate_not_active", "message": "mandate is cancelled" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let retrying = RetryingGateway::new(gateway(&server), fast_retry());
    let result = retrying.create_payment(&payment_request()).await;

    assert!(matches!(result, Err(GatewayError::Rejected { .. })));
}

#[tokio::test]
async fn cancel_mandate_accepts_empty_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mandates/MD0001/actions/cancel"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    gateway(&server).cancel_mandate("MD0001").await.unwrap();
}
