//! Outbound notification capability (email/SMS delivery lives elsewhere).
//!
//! The engine passes a template identifier and structured data; it never
//! renders content itself.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use service_core::observability::TracedRequestExt;
use service_core::retry::{retry_call, Classify, ErrorClass, RetryConfig};
use std::time::Duration;
use thiserror::Error;

use crate::config::NotificationConfig;
use crate::services::metrics::record_notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Advance notice of an upcoming direct debit.
    DebitPreNotification,
    PaymentOverdue,
    ContractRenewal,
    MandateExpiry,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::DebitPreNotification => "debit_pre_notification",
            TemplateKind::PaymentOverdue => "payment_overdue",
            TemplateKind::ContractRenewal => "contract_renewal",
            TemplateKind::MandateExpiry => "mandate_expiry",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRequest {
    pub recipient: String,
    pub template: TemplateKind,
    pub data: serde_json::Value,
    /// Lets the delivery service drop repeats of the same message.
    pub dedup_key: String,
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("notification service unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl Classify for NotifyError {
    fn class(&self) -> ErrorClass {
        match self {
            NotifyError::Unavailable(_) => ErrorClass::Retryable,
            NotifyError::Rejected(_) => ErrorClass::Permanent,
        }
    }

    fn timed_out(after: Duration) -> Self {
        NotifyError::Unavailable(format!("no response within {:?}", after))
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotifyError>;
}

/// Client for the notification service's HTTP API.
#[derive(Clone)]
pub struct HttpNotifier {
    client: Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NotifyError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let url = format!("{}/notifications", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.dedup_key)
            .json(request)
            .with_trace_context()
            .send()
            .await
            .map_err(|e| NotifyError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(NotifyError::Unavailable(format!("{}: {}", status, body)))
        } else {
            Err(NotifyError::Rejected(format!("{}: {}", status, body)))
        }
    }
}

/// Wraps a notifier with timeouts and backoff on [`NotifyError::Unavailable`].
pub struct RetryingNotifier<N> {
    inner: N,
    config: RetryConfig,
}

impl<N: Notifier> RetryingNotifier<N> {
    pub fn new(inner: N, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<N: Notifier> Notifier for RetryingNotifier<N> {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let result = retry_call(&self.config, "send_notification", || self.inner.send(request)).await;
        record_notification(
            request.template.as_str(),
            if result.is_ok() { "sent" } else { "failed" },
        );
        result
    }
}
