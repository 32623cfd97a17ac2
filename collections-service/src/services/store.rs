//! Persistence port for the collections engine.
//!
//! Every status mutation is a compare-and-set: the `update_*` methods write
//! only when the stored status still equals `expected` and report whether
//! they did. Payment instances are additionally guarded by their row version,
//! so a write based on a stale read of a `scheduled` instance cannot undo an
//! amount merged in meanwhile. Inserts on a unique key never overwrite.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    Customer, EscalationAlert, Mandate, MandateStatus, PaymentInstance, PaymentStatus, PeriodKey,
    SubjectType, Subscription, SubscriptionStatus,
};

/// How long a `processing` claim on a webhook event holds before another
/// delivery may take it over. Covers a worker dying mid-event.
pub const WEBHOOK_CLAIM_LEASE_SECS: i64 = 300;

pub fn webhook_lease_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(WEBHOOK_CLAIM_LEASE_SECS)
}

/// Outcome of claiming a webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    /// The caller owns the event and must complete it.
    Claimed,
    /// Already processed.
    Processed,
    /// Another delivery holds a live claim.
    InProgress,
}

#[async_trait]
pub trait CollectionsStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Customers

    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError>;

    /// Insert or refresh contact fields. Legal identity is not overwritten.
    async fn upsert_customer(&self, customer: &Customer) -> Result<Customer, AppError>;

    // Mandates

    /// Fails with `AppError::Conflict` when it would create a second active
    /// mandate for the same (customer, contract).
    async fn insert_mandate(&self, mandate: &Mandate) -> Result<(), AppError>;

    async fn get_mandate(&self, mandate_id: Uuid) -> Result<Option<Mandate>, AppError>;

    async fn find_mandate_by_gateway_id(
        &self,
        gateway_mandate_id: &str,
    ) -> Result<Option<Mandate>, AppError>;

    async fn mandates_for_contract(
        &self,
        customer_id: Uuid,
        contract_id: Uuid,
    ) -> Result<Vec<Mandate>, AppError>;

    async fn list_mandates(&self, status: MandateStatus) -> Result<Vec<Mandate>, AppError>;

    async fn update_mandate(
        &self,
        mandate: &Mandate,
        expected: MandateStatus,
    ) -> Result<bool, AppError>;

    // Subscriptions

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), AppError>;

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;

    /// The live (not cancelled) subscription for a contract, if any.
    async fn subscription_for_contract(
        &self,
        contract_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;

    async fn subscriptions_for_mandate(
        &self,
        mandate_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError>;

    async fn list_subscriptions(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<Subscription>, AppError>;

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
    ) -> Result<bool, AppError>;

    // Payment instances

    /// Insert unless an instance already exists for (subscription, period).
    /// Returns the stored instance and whether this call created it.
    async fn insert_payment_if_absent(
        &self,
        payment: &PaymentInstance,
    ) -> Result<(PaymentInstance, bool), AppError>;

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<PaymentInstance>, AppError>;

    async fn find_payment_by_gateway_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<PaymentInstance>, AppError>;

    async fn payment_for_period(
        &self,
        subscription_id: Uuid,
        period_key: PeriodKey,
    ) -> Result<Option<PaymentInstance>, AppError>;

    /// Ordered by due date.
    async fn list_payments(&self, status: PaymentStatus)
        -> Result<Vec<PaymentInstance>, AppError>;

    /// Ordered by period.
    async fn payments_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<PaymentInstance>, AppError>;

    /// Writes only when both the stored status equals `expected` and the
    /// stored version equals `payment.version`; the version is then bumped.
    async fn update_payment(
        &self,
        payment: &PaymentInstance,
        expected: PaymentStatus,
    ) -> Result<bool, AppError>;

    // Escalation alerts

    async fn latest_alert(
        &self,
        subject_type: SubjectType,
        subject_id: Uuid,
    ) -> Result<Option<EscalationAlert>, AppError>;

    async fn insert_alert(&self, alert: &EscalationAlert) -> Result<(), AppError>;

    // Webhook deduplication

    /// Claim an event for processing. Failed events, and events whose
    /// `processing` claim is older than the lease, can be claimed again.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookClaim, AppError>;

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        error: Option<&str>,
    ) -> Result<(), AppError>;
}
