//! Direct-debit gateway port, its HTTP adapter and the inbound webhook format.
//!
//! The engine only talks to [`PaymentGateway`]. [`HttpGateway`] speaks the
//! provider's REST API; [`RetryingGateway`] adds per-call timeouts and
//! exponential backoff on transient failures to any implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::observability::TracedRequestExt;
use service_core::retry::{retry_call, Classify, ErrorClass, RetryConfig};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::models::{Customer, DirectDebitScheme};
use crate::services::metrics::record_gateway_call;

/// Header carrying the hex HMAC-SHA256 of the webhook body.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "webhook-signature";

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Network failure, timeout, 5xx or rate limit.
    #[error("gateway unavailable: {0}")]
    Transient(String),

    /// The gateway refused the request on business grounds.
    #[error("gateway rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl GatewayError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl Classify for GatewayError {
    fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Transient(_) => ErrorClass::Retryable,
            GatewayError::Rejected { .. } => ErrorClass::Permanent,
        }
    }

    fn timed_out(after: Duration) -> Self {
        GatewayError::Transient(format!("no response within {:?}", after))
    }
}

/// Request to register a mandate for a gateway customer.
#[derive(Debug, Clone, Serialize)]
pub struct NewGatewayMandate {
    pub gateway_customer_id: String,
    pub account_holder: String,
    pub iban: String,
    pub scheme: DirectDebitScheme,
    pub reference: String,
}

/// Request to collect one payment against a mandate.
#[derive(Debug, Clone)]
pub struct NewGatewayPayment {
    /// Derived from the payment instance id; the gateway collapses repeats.
    pub idempotency_key: String,
    pub gateway_mandate_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub charge_date: NaiveDate,
    pub reference: String,
}

/// Port to the direct-debit provider. Implementations must be idempotent by key.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Register the payer. Returns the gateway customer id.
    async fn create_customer(&self, customer: &Customer) -> Result<String, GatewayError>;

    /// Request a mandate. Returns the gateway mandate id.
    async fn create_mandate(&self, request: &NewGatewayMandate) -> Result<String, GatewayError>;

    /// Submit a collection. Returns the gateway payment id.
    async fn create_payment(&self, request: &NewGatewayPayment) -> Result<String, GatewayError>;

    async fn cancel_mandate(&self, gateway_mandate_id: &str) -> Result<(), GatewayError>;
}

/// Convert a decimal amount to minor currency units.
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .filter(|units| *units > 0)
        .ok_or_else(|| GatewayError::rejected("invalid_amount", format!("cannot collect {}", amount)))
}

// =========================================================================
// HTTP adapter
// =========================================================================

#[derive(Debug, Serialize)]
struct CreateCustomerBody<'a> {
    email: &'a str,
    name: &'a str,
    country_code: &'a str,
    metadata: CustomerMetadata,
}

#[derive(Debug, Serialize)]
struct CustomerMetadata {
    customer_id: String,
}

#[derive(Debug, Serialize)]
struct CreateMandateBody<'a> {
    customer: &'a str,
    account_holder_name: &'a str,
    iban: &'a str,
    scheme: &'a str,
    reference: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePaymentBody<'a> {
    mandate: &'a str,
    amount: i64,
    currency: &'a str,
    charge_date: NaiveDate,
    reference: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// REST client for the direct-debit provider.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    access_token: Secret<String>,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        })
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        idempotency_key: Option<&str>,
        body: &B,
    ) -> Result<Option<CreatedResource>, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .json(body)
            .with_trace_context();
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        tracing::debug!(status = %status, path = %path, "Gateway response");

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(None);
            }
            let created: CreatedResource = serde_json::from_str(&text).map_err(|e| {
                GatewayError::Transient(format!("unreadable gateway response: {}", e))
            })?;
            return Ok(Some(created));
        }

        Err(classify_status(status, &text))
    }

    fn require_id(created: Option<CreatedResource>) -> Result<String, GatewayError> {
        created
            .map(|c| c.id)
            .ok_or_else(|| GatewayError::Transient("gateway response carried no id".to_string()))
    }
}

fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return GatewayError::Transient(format!("gateway returned {}", status));
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => GatewayError::rejected(parsed.error.code, parsed.error.message),
        Err(_) => GatewayError::rejected(status.as_u16().to_string(), body.to_string()),
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_customer(&self, customer: &Customer) -> Result<String, GatewayError> {
        let body = CreateCustomerBody {
            email: &customer.email,
            name: &customer.legal_name,
            country_code: &customer.country,
            metadata: CustomerMetadata {
                customer_id: customer.customer_id.to_string(),
            },
        };
        let key = format!("cus_{}", customer.customer_id.simple());
        Self::require_id(self.post("/customers", Some(&key), &body).await?)
    }

    async fn create_mandate(&self, request: &NewGatewayMandate) -> Result<String, GatewayError> {
        let body = CreateMandateBody {
            customer: &request.gateway_customer_id,
            account_holder_name: &request.account_holder,
            iban: &request.iban,
            scheme: request.scheme.as_str(),
            reference: &request.reference,
        };
        Self::require_id(self.post("/mandates", Some(&request.reference), &body).await?)
    }

    async fn create_payment(&self, request: &NewGatewayPayment) -> Result<String, GatewayError> {
        let body = CreatePaymentBody {
            mandate: &request.gateway_mandate_id,
            amount: to_minor_units(request.amount)?,
            currency: &request.currency,
            charge_date: request.charge_date,
            reference: &request.reference,
        };
        Self::require_id(
            self.post("/payments", Some(&request.idempotency_key), &body)
                .await?,
        )
    }

    async fn cancel_mandate(&self, gateway_mandate_id: &str) -> Result<(), GatewayError> {
        let path = format!("/mandates/{}/actions/cancel", gateway_mandate_id);
        self.post(&path, None, &serde_json::json!({})).await?;
        Ok(())
    }
}

// =========================================================================
// Retry decorator
// =========================================================================

/// Wraps a gateway with timeouts and backoff on [`GatewayError::Transient`].
pub struct RetryingGateway<G> {
    inner: G,
    config: RetryConfig,
}

impl<G: PaymentGateway> RetryingGateway<G> {
    pub fn new(inner: G, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let result = retry_call(&self.config, operation, f).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(GatewayError::Rejected { .. }) => "rejected",
            Err(GatewayError::Transient(_)) => "exhausted",
        };
        record_gateway_call(operation, outcome);
        result
    }
}

#[async_trait]
impl<G: PaymentGateway> PaymentGateway for RetryingGateway<G> {
    async fn create_customer(&self, customer: &Customer) -> Result<String, GatewayError> {
        self.call("create_customer", || self.inner.create_customer(customer))
            .await
    }

    async fn create_mandate(&self, request: &NewGatewayMandate) -> Result<String, GatewayError> {
        self.call("create_mandate", || self.inner.create_mandate(request))
            .await
    }

    async fn create_payment(&self, request: &NewGatewayPayment) -> Result<String, GatewayError> {
        self.call("create_payment", || self.inner.create_payment(request))
            .await
    }

    async fn cancel_mandate(&self, gateway_mandate_id: &str) -> Result<(), GatewayError> {
        self.call("cancel_mandate", || self.inner.cancel_mandate(gateway_mandate_id))
            .await
    }
}

// =========================================================================
// Webhooks
// =========================================================================

/// Batch of events delivered in one webhook call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub events: Vec<GatewayEvent>,
}

/// One gateway event. `resource_id` is the gateway's own mandate or payment id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub reason_code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Event types the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEventKind {
    MandateActivated,
    MandateCancelled,
    MandateExpired,
    MandateReactivated,
    PaymentConfirmed,
    PaymentPaid,
    PaymentFailed,
    PaymentReturned,
}

impl GatewayEvent {
    pub fn kind(&self) -> Option<GatewayEventKind> {
        let kind = match self.event_type.as_str() {
            "mandate.activated" => GatewayEventKind::MandateActivated,
            "mandate.cancelled" => GatewayEventKind::MandateCancelled,
            "mandate.expired" => GatewayEventKind::MandateExpired,
            "mandate.reactivated" => GatewayEventKind::MandateReactivated,
            "payment.confirmed" => GatewayEventKind::PaymentConfirmed,
            "payment.paid" => GatewayEventKind::PaymentPaid,
            "payment.failed" => GatewayEventKind::PaymentFailed,
            "payment.returned" => GatewayEventKind::PaymentReturned,
            _ => return None,
        };
        Some(kind)
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_webhook_body(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of the `Webhook-Signature` header.
pub fn verify_webhook_signature(secret: &Secret<String>, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_round_half_even() {
        assert_eq!(to_minor_units(Decimal::new(95000, 2)).unwrap(), 95000);
        assert_eq!(to_minor_units(Decimal::new(12345, 3)).unwrap(), 1234);
        assert!(to_minor_units(Decimal::ZERO).is_err());
    }

    #[test]
    fn classification_of_http_statuses() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, "").class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "").class(),
            ErrorClass::Retryable
        );
        let rejected = classify_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":{"code":"invalid_iban","message":"bad checksum"}}"#,
        );
        match rejected {
            GatewayError::Rejected { code, .. } => assert_eq!(code, "invalid_iban"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn signature_round_trip() {
        let secret = Secret::new("whsec_test".to_string());
        let body = br#"{"events":[]}"#;
        let signature = sign_webhook_body("whsec_test", body);

        assert!(verify_webhook_signature(&secret, body, &signature));
        assert!(!verify_webhook_signature(&secret, b"{}", &signature));
        assert!(!verify_webhook_signature(&secret, body, "not-hex"));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let event: GatewayEvent = serde_json::from_str(
            r#"{"id":"EV1","type":"payout.paid","resource_id":"PO1"}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), None);
    }
}
