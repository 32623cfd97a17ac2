//! The collections engine.
//!
//! Each component is a small struct holding the collaborators it needs; all
//! durable state lives behind [`CollectionsStore`]. Periodic runs take `now`
//! explicitly and are safe to repeat.

pub mod compliance;
pub mod contracts;
pub mod dunning;
pub mod mandates;
pub mod payments;
pub mod reversals;
pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::retry::RetryConfig;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::CollectionPolicy;
use crate::error::CollectionsError;
use crate::models::{
    PaymentEvent, PaymentInstance, PaymentStatus, Subscription, SubscriptionEvent,
    SubscriptionStatus, Transition,
};
use crate::services::metrics::{record_payment_transition, record_webhook_event};
use crate::services::{
    CollectionsStore, ContractService, GatewayEvent, GatewayEventKind, Notifier, PaymentGateway,
    WebhookClaim, WebhookEnvelope,
};

pub use compliance::{ComplianceNotifier, NotifyReport};
pub use contracts::{ContractLifecycle, SyncReport};
pub use dunning::{DunningEscalator, DunningReport};
pub use mandates::{ExpiryReport, MandateRegistry};
pub use payments::{PaymentStateMachine, SubmitReport};
pub use reversals::ReversalHandler;
pub use scheduler::{CollectionScheduler, ScheduleReport};

/// Times a compare-and-set is retried after losing a race before giving up.
const CAS_ATTEMPTS: usize = 3;

/// Collaborators shared by every engine component.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn CollectionsStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub contracts: Arc<dyn ContractService>,
    pub policy: CollectionPolicy,
    /// Used for calls that are not already wrapped in a retrying decorator.
    pub retry: RetryConfig,
}

/// Result of a guarded payment transition.
#[derive(Debug, Clone)]
pub enum PaymentChange {
    Applied {
        from: PaymentStatus,
        payment: PaymentInstance,
    },
    /// Already in the target state; nothing was written.
    Unchanged(PaymentInstance),
}

impl PaymentChange {
    pub fn payment(&self) -> &PaymentInstance {
        match self {
            PaymentChange::Applied { payment, .. } | PaymentChange::Unchanged(payment) => payment,
        }
    }

    pub fn into_payment(self) -> PaymentInstance {
        match self {
            PaymentChange::Applied { payment, .. } | PaymentChange::Unchanged(payment) => payment,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, PaymentChange::Applied { .. })
    }
}

pub(crate) fn stale(event: PaymentEvent, actual: PaymentStatus) -> CollectionsError {
    let expected = event
        .sources()
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|");
    CollectionsError::StaleTransition {
        entity: "payment_instance",
        expected,
        actual: actual.as_str().to_string(),
    }
}

/// Apply `event` to a stored payment under compare-and-set.
///
/// A lost race re-reads the row and re-runs the transition function, so the
/// write only ever lands on the state it was validated against.
pub(crate) async fn transition_payment<F>(
    store: &dyn CollectionsStore,
    payment_id: Uuid,
    event: PaymentEvent,
    now: DateTime<Utc>,
    mutate: F,
) -> Result<PaymentChange, CollectionsError>
where
    F: Fn(&mut PaymentInstance) + Send + Sync,
{
    let mut last_seen = None;
    for _ in 0..CAS_ATTEMPTS {
        let mut payment = store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("payment_instance", payment_id))?;

        let (from, to) = match payment.status.apply(event) {
            Ok(Transition::Applied { from, to }) => (from, to),
            Ok(Transition::Unchanged(_)) => return Ok(PaymentChange::Unchanged(payment)),
            Err(_) => return Err(stale(event, payment.status)),
        };

        payment.status = to;
        payment.updated_utc = now;
        mutate(&mut payment);

        if store.update_payment(&payment, from).await? {
            payment.version += 1;
            record_payment_transition(from.as_str(), to.as_str());
            info!(
                payment_id = %payment.payment_id,
                period = %payment.period_key,
                from = %from,
                to = %to,
                "Payment transitioned"
            );
            return Ok(PaymentChange::Applied { from, payment });
        }
        last_seen = Some(from);
    }

    Err(CollectionsError::StaleTransition {
        entity: "payment_instance",
        expected: last_seen.map(|s| s.as_str()).unwrap_or("unknown").to_string(),
        actual: "concurrently modified".to_string(),
    })
}

/// Apply `event` to a stored subscription under compare-and-set.
pub(crate) async fn transition_subscription(
    store: &dyn CollectionsStore,
    subscription_id: Uuid,
    event: SubscriptionEvent,
    now: DateTime<Utc>,
) -> Result<(Subscription, bool), CollectionsError> {
    for _ in 0..CAS_ATTEMPTS {
        let mut subscription = store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("subscription", subscription_id))?;

        let (from, to) = match subscription.status.apply(event)? {
            Transition::Applied { from, to } => (from, to),
            Transition::Unchanged(_) => return Ok((subscription, false)),
        };

        subscription.status = to;
        subscription.updated_utc = now;
        if to == SubscriptionStatus::Cancelled {
            subscription.cancelled_utc = Some(now);
        }

        if store.update_subscription(&subscription, from).await? {
            info!(
                subscription_id = %subscription.subscription_id,
                from = %from,
                to = %to,
                "Subscription transitioned"
            );
            return Ok((subscription, true));
        }
    }

    Err(CollectionsError::StaleTransition {
        entity: "subscription",
        expected: "unchanged".to_string(),
        actual: "concurrently modified".to_string(),
    })
}

/// Cancel every not-yet-submitted instance of a subscription. In-flight
/// instances are left to resolve at the gateway.
pub(crate) async fn withdraw_pending_payments(
    store: &dyn CollectionsStore,
    subscription_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<usize, CollectionsError> {
    let mut withdrawn = 0;
    for payment in store.payments_for_subscription(subscription_id).await? {
        if !payment.status.is_cancellable() {
            continue;
        }
        let result = transition_payment(store, payment.payment_id, PaymentEvent::Cancel, now, |p| {
            p.last_error = Some(reason.to_string());
        })
        .await;
        match result {
            Ok(change) if change.is_applied() => withdrawn += 1,
            Ok(_) => {}
            // Submitted concurrently; it resolves at the gateway.
            Err(CollectionsError::StaleTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(withdrawn)
}

/// Cancel a subscription and withdraw its pending instances. Safe to repeat.
pub(crate) async fn cancel_subscription(
    store: &dyn CollectionsStore,
    subscription_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Subscription, CollectionsError> {
    let (subscription, _) =
        transition_subscription(store, subscription_id, SubscriptionEvent::Cancel, now).await?;
    let withdrawn = withdraw_pending_payments(store, subscription_id, reason, now).await?;
    if withdrawn > 0 {
        info!(subscription_id = %subscription_id, withdrawn, "Pending payments withdrawn");
    }
    Ok(subscription)
}

/// How one webhook event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    /// Same transition already applied.
    Unchanged,
    /// Event arrived after the record had moved past it.
    Stale,
    /// The gateway id is not known locally.
    UnknownResource,
    /// Event type the engine does not act on.
    Ignored,
    /// Event id already processed.
    Duplicate,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Unchanged => "unchanged",
            EventOutcome::Stale => "stale",
            EventOutcome::UnknownResource => "unknown_resource",
            EventOutcome::Ignored => "ignored",
            EventOutcome::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WebhookReport {
    pub applied: usize,
    pub absorbed: usize,
    pub duplicates: usize,
    /// Held by a concurrent delivery; the gateway should redeliver.
    pub in_progress: usize,
    pub failed: usize,
}

/// All engine components wired against one set of collaborators.
pub struct CollectionsEngine {
    pub mandates: MandateRegistry,
    pub scheduler: CollectionScheduler,
    pub compliance: ComplianceNotifier,
    pub payments: PaymentStateMachine,
    pub dunning: DunningEscalator,
    pub lifecycle: ContractLifecycle,
    store: Arc<dyn CollectionsStore>,
}

impl CollectionsEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let mandates = MandateRegistry::new(ctx.clone());
        let lifecycle = ContractLifecycle::new(ctx.clone(), mandates.clone());
        let reversals = ReversalHandler::new(ctx.clone(), mandates.clone());
        Self {
            scheduler: CollectionScheduler::new(ctx.clone()),
            compliance: ComplianceNotifier::new(ctx.clone()),
            payments: PaymentStateMachine::new(ctx.clone(), reversals, lifecycle.clone()),
            dunning: DunningEscalator::new(ctx.clone()),
            store: ctx.store.clone(),
            mandates,
            lifecycle,
        }
    }

    /// Deduplicate and dispatch a batch of gateway events.
    ///
    /// Infrastructure failures mark the event failed so a redelivery can claim
    /// it again; they are counted, not propagated, so one bad event does not
    /// block the rest of the batch. A claim left behind by a crashed delivery
    /// can be taken over once its lease runs out.
    #[instrument(skip(self, envelope), fields(events = envelope.events.len()))]
    pub async fn process_webhook(
        &self,
        envelope: &WebhookEnvelope,
        now: DateTime<Utc>,
    ) -> Result<WebhookReport, CollectionsError> {
        let mut report = WebhookReport::default();

        for event in &envelope.events {
            match self
                .store
                .claim_webhook_event(&event.id, &event.event_type, now)
                .await?
            {
                WebhookClaim::Claimed => {}
                WebhookClaim::Processed => {
                    info!(event_id = %event.id, event_type = %event.event_type, "Duplicate webhook event");
                    record_webhook_event(&event.event_type, EventOutcome::Duplicate.as_str());
                    report.duplicates += 1;
                    continue;
                }
                WebhookClaim::InProgress => {
                    info!(event_id = %event.id, "Webhook event claimed by another delivery");
                    report.in_progress += 1;
                    continue;
                }
            }

            match self.dispatch(event, now).await {
                Ok(outcome) => {
                    self.store.complete_webhook_event(&event.id, None).await?;
                    record_webhook_event(&event.event_type, outcome.as_str());
                    if outcome == EventOutcome::Applied {
                        report.applied += 1;
                    } else {
                        report.absorbed += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        kind = e.kind(),
                        error = %e,
                        "Webhook event processing failed"
                    );
                    let message = e.to_string();
                    self.store
                        .complete_webhook_event(&event.id, Some(&message))
                        .await?;
                    record_webhook_event(&event.event_type, e.kind());
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn dispatch(
        &self,
        event: &GatewayEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(kind) = event.kind() else {
            info!(event_id = %event.id, event_type = %event.event_type, "Ignoring unhandled event type");
            return Ok(EventOutcome::Ignored);
        };
        let resource = event.resource_id.as_str();
        let reason = event
            .description
            .clone()
            .or_else(|| event.reason_code.clone());

        let result = match kind {
            GatewayEventKind::MandateActivated => {
                self.mandates.on_mandate_activated(resource, now).await
            }
            GatewayEventKind::MandateCancelled => {
                self.mandates.on_mandate_cancelled(resource, reason, now).await
            }
            GatewayEventKind::MandateExpired => {
                self.mandates.on_mandate_expired(resource, now).await
            }
            GatewayEventKind::MandateReactivated => {
                self.mandates.on_mandate_reactivated(resource, now).await
            }
            GatewayEventKind::PaymentConfirmed => {
                self.payments.on_gateway_confirmed(resource, now).await
            }
            GatewayEventKind::PaymentPaid => self.payments.on_gateway_paid(resource, now).await,
            GatewayEventKind::PaymentFailed => {
                self.payments
                    .on_gateway_failed(resource, event.reason_code.as_deref(), reason, now)
                    .await
            }
            GatewayEventKind::PaymentReturned => {
                let code = event.reason_code.as_deref().unwrap_or("");
                self.payments.on_gateway_returned(resource, code, now).await
            }
        };

        match result {
            Err(CollectionsError::StaleTransition {
                entity,
                expected,
                actual,
            }) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    entity,
                    expected = %expected,
                    actual = %actual,
                    "Absorbing out-of-order webhook event"
                );
                Ok(EventOutcome::Stale)
            }
            Err(CollectionsError::IllegalTransition(e)) => {
                warn!(event_id = %event.id, error = %e, "Absorbing out-of-order webhook event");
                Ok(EventOutcome::Stale)
            }
            other => other,
        }
    }
}
