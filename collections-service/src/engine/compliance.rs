//! Pre-notification of upcoming debits.
//!
//! A charge may only reach the gateway after the payer was told about it with
//! the scheme's full advance notice. Instances whose notice deadline passes
//! without a delivered notification are withdrawn and their amount moves to
//! the next collectible period.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::scheduler::{collectible, new_instance};
use super::{stale, transition_payment, EngineContext, CAS_ATTEMPTS};
use crate::error::CollectionsError;
use crate::models::{PaymentEvent, PaymentInstance, PaymentStatus, SubscriptionStatus};
use crate::services::metrics::record_payment_transition;
use crate::services::{NotificationRequest, TemplateKind};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifyReport {
    pub notified: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub carried_forward: usize,
    pub waiting: usize,
    /// Amount grew while the notice was in flight; re-notified next run.
    pub renotify: usize,
}

enum Handled {
    Notified,
    NotifyFailed,
    Withdrawn { carried: bool },
    Waiting,
    AmountChanged,
}

pub struct ComplianceNotifier {
    ctx: EngineContext,
}

impl ComplianceNotifier {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Notify every scheduled instance whose notice window is open.
    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<NotifyReport, CollectionsError> {
        let mut report = NotifyReport::default();

        for payment in self.ctx.store.list_payments(PaymentStatus::Scheduled).await? {
            match self.handle(&payment, now).await {
                Ok(Handled::Notified) => report.notified += 1,
                Ok(Handled::NotifyFailed) => report.failed += 1,
                Ok(Handled::Withdrawn { carried }) => {
                    report.cancelled += 1;
                    if carried {
                        report.carried_forward += 1;
                    }
                }
                Ok(Handled::Waiting) => report.waiting += 1,
                Ok(Handled::AmountChanged) => report.renotify += 1,
                Err(CollectionsError::StaleTransition { .. }) => {}
                Err(e) => {
                    warn!(payment_id = %payment.payment_id, error = %e, "Pre-notification failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            notified = report.notified,
            failed = report.failed,
            cancelled = report.cancelled,
            "Compliance run complete"
        );
        Ok(report)
    }

    async fn handle(
        &self,
        payment: &PaymentInstance,
        now: DateTime<Utc>,
    ) -> Result<Handled, CollectionsError> {
        let today = now.date_naive();

        if today > payment.notify_by {
            let reason = format!(
                "pre-notification not delivered by {} after {} attempt(s)",
                payment.notify_by, payment.notify_attempts
            );
            let carried = withdraw_and_carry_forward(&self.ctx, payment, &reason, now).await?;
            return Ok(Handled::Withdrawn { carried });
        }

        let window_opens = payment.notify_by - Duration::days(self.ctx.policy.notice_window_days);
        if today < window_opens {
            return Ok(Handled::Waiting);
        }

        let store = self.ctx.store.as_ref();
        let subscription = store
            .get_subscription(payment.subscription_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("subscription", payment.subscription_id))?;
        if subscription.status == SubscriptionStatus::Cancelled {
            transition_payment(store, payment.payment_id, PaymentEvent::Cancel, now, |p| {
                p.last_error = Some("subscription cancelled".to_string());
            })
            .await?;
            return Ok(Handled::Withdrawn { carried: false });
        }
        if subscription.status != SubscriptionStatus::Active {
            return Ok(Handled::Waiting);
        }

        let mandate = store
            .get_mandate(subscription.mandate_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("mandate", subscription.mandate_id))?;
        if mandate.status.is_terminal() {
            transition_payment(store, payment.payment_id, PaymentEvent::Cancel, now, |p| {
                p.last_error = Some(format!("mandate {}", mandate.status));
            })
            .await?;
            return Ok(Handled::Withdrawn { carried: false });
        }
        if !mandate.status.can_collect() {
            // Suspended or still pending; retried until the deadline passes.
            return Ok(Handled::Waiting);
        }

        let customer = store
            .get_customer(mandate.customer_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("customer", mandate.customer_id))?;

        // The listing is a snapshot; an earlier withdrawal in this run may have
        // merged its amount into this instance since.
        let current = store
            .get_payment(payment.payment_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("payment_instance", payment.payment_id))?;
        if current.status != PaymentStatus::Scheduled {
            return Err(stale(PaymentEvent::Notify, current.status));
        }

        let request = NotificationRequest {
            recipient: customer.email.clone(),
            template: TemplateKind::DebitPreNotification,
            data: json!({
                "customer_name": customer.legal_name,
                "amount": current.amount.to_string(),
                "currency": current.currency,
                "due_date": current.due_date.to_string(),
                "period": current.period_key.to_string(),
                "mandate_reference": mandate.reference,
            }),
            // A changed amount is a new notice.
            dedup_key: format!("prenotify_{}_{}", current.payment_id, current.amount),
        };

        match self.ctx.notifier.send(&request).await {
            Ok(()) => mark_notified(&self.ctx, &current, now).await,
            Err(e) => {
                warn!(
                    payment_id = %current.payment_id,
                    notify_by = %current.notify_by,
                    error = %e,
                    "Pre-notification not delivered"
                );
                record_notify_failure(&self.ctx, current.payment_id, &e.to_string(), now).await?;
                Ok(Handled::NotifyFailed)
            }
        }
    }
}

/// Mark the instance `notified`, provided the stored amount is still
/// the one the payer was told about. Otherwise the instance stays `scheduled`
/// and the next run sends a notice for the new amount.
async fn mark_notified(
    ctx: &EngineContext,
    notified: &PaymentInstance,
    now: DateTime<Utc>,
) -> Result<Handled, CollectionsError> {
    let store = ctx.store.as_ref();
    let mut current = notified.clone();
    for _ in 0..CAS_ATTEMPTS {
        match current.status {
            PaymentStatus::Notified => return Ok(Handled::Notified),
            PaymentStatus::Scheduled => {}
            other => return Err(stale(PaymentEvent::Notify, other)),
        }
        if current.amount != notified.amount {
            info!(
                payment_id = %current.payment_id,
                notified_amount = %notified.amount,
                amount = %current.amount,
                "Amount changed while notifying, notice will be resent"
            );
            return Ok(Handled::AmountChanged);
        }

        let mut next = current.clone();
        next.status = PaymentStatus::Notified;
        next.notified_utc = Some(now);
        next.last_error = None;
        next.updated_utc = now;
        if store.update_payment(&next, PaymentStatus::Scheduled).await? {
            record_payment_transition(
                PaymentStatus::Scheduled.as_str(),
                PaymentStatus::Notified.as_str(),
            );
            info!(
                payment_id = %next.payment_id,
                period = %next.period_key,
                amount = %next.amount,
                "Payment transitioned to notified"
            );
            return Ok(Handled::Notified);
        }

        current = store
            .get_payment(notified.payment_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("payment_instance", notified.payment_id))?;
    }

    Err(stale(PaymentEvent::Notify, current.status))
}

/// Count a failed delivery against a still-`scheduled` instance. Only the
/// attempt counter and last error are touched.
async fn record_notify_failure(
    ctx: &EngineContext,
    payment_id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), CollectionsError> {
    let store = ctx.store.as_ref();
    for _ in 0..CAS_ATTEMPTS {
        let Some(mut current) = store.get_payment(payment_id).await? else {
            return Err(CollectionsError::not_found("payment_instance", payment_id));
        };
        if current.status != PaymentStatus::Scheduled {
            return Ok(());
        }
        current.notify_attempts += 1;
        current.last_error = Some(error.to_string());
        current.updated_utc = now;
        if store.update_payment(&current, PaymentStatus::Scheduled).await? {
            return Ok(());
        }
    }
    warn!(payment_id = %payment_id, "Could not record notification failure after concurrent updates");
    Ok(())
}

/// Cancel a not-yet-submitted instance and move its amount to the next period
/// that can still be collected with full notice. Returns whether the amount
/// was placed.
///
/// The amount is only moved by the call that wins the cancellation, so
/// repeated runs never carry it twice.
pub(crate) async fn withdraw_and_carry_forward(
    ctx: &EngineContext,
    payment: &PaymentInstance,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool, CollectionsError> {
    let store = ctx.store.as_ref();
    let change = transition_payment(store, payment.payment_id, PaymentEvent::Cancel, now, |p| {
        p.last_error = Some(reason.to_string());
    })
    .await?;
    if !change.is_applied() {
        return Ok(false);
    }
    let cancelled = change.into_payment();

    let Some(subscription) = store.get_subscription(cancelled.subscription_id).await? else {
        return Ok(false);
    };
    if subscription.status != SubscriptionStatus::Active {
        return Ok(false);
    }
    let Some(mandate) = store.get_mandate(subscription.mandate_id).await? else {
        return Ok(false);
    };
    if mandate.status.is_terminal() {
        return Ok(false);
    }

    let today = now.date_naive();
    let mut period = cancelled.period_key.next();
    for _ in 0..ctx.policy.carry_forward_periods.max(1) {
        let Some(slot) = collectible(&subscription, mandate.scheme, &ctx.policy, period, today)
        else {
            period = period.next();
            continue;
        };

        for _ in 0..CAS_ATTEMPTS {
            let existing = match store.payment_for_period(subscription.subscription_id, period).await? {
                Some(existing) => existing,
                None => {
                    let candidate = new_instance(
                        &subscription,
                        slot,
                        subscription.amount + cancelled.amount,
                        now,
                    );
                    let (stored, created) = store.insert_payment_if_absent(&candidate).await?;
                    if created {
                        info!(
                            from_period = %cancelled.period_key,
                            to_period = %stored.period_key,
                            amount = %stored.amount,
                            "Amount carried forward to new instance"
                        );
                        return Ok(true);
                    }
                    stored
                }
            };

            if existing.status != PaymentStatus::Scheduled {
                break;
            }
            let mut merged = existing.clone();
            merged.amount += cancelled.amount;
            merged.updated_utc = now;
            if store.update_payment(&merged, PaymentStatus::Scheduled).await? {
                info!(
                    from_period = %cancelled.period_key,
                    to_period = %merged.period_key,
                    amount = %merged.amount,
                    "Amount carried forward"
                );
                return Ok(true);
            }
        }
        period = period.next();
    }

    warn!(
        payment_id = %cancelled.payment_id,
        amount = %cancelled.amount,
        "No collectible period found to carry amount forward"
    );
    Ok(false)
}
