//! Submission of notified instances and gateway-driven settlement.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::compliance::withdraw_and_carry_forward;
use super::{
    stale, transition_payment, ContractLifecycle, EngineContext, EventOutcome, PaymentChange,
    ReversalHandler,
};
use crate::error::CollectionsError;
use crate::models::{PaymentEvent, PaymentInstance, PaymentStatus};
use crate::services::gateway::{GatewayError, NewGatewayPayment};
use crate::services::metrics::record_operator_alert;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmitReport {
    pub submitted: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub deferred: usize,
    pub errors: usize,
}

/// What a submission attempt did.
#[derive(Debug)]
enum Submission {
    Submitted(PaymentInstance),
    /// Gateway refused the charge, or stayed unreachable through every retry.
    Rejected(PaymentInstance),
    /// Withdrawn because it can no longer be collected as notified.
    Withdrawn(String),
    /// Not collectible right now; left `notified`.
    Deferred(String),
}

pub struct PaymentStateMachine {
    ctx: EngineContext,
    reversals: ReversalHandler,
    lifecycle: ContractLifecycle,
}

impl PaymentStateMachine {
    pub fn new(ctx: EngineContext, reversals: ReversalHandler, lifecycle: ContractLifecycle) -> Self {
        Self {
            ctx,
            reversals,
            lifecycle,
        }
    }

    pub async fn get(&self, payment_id: Uuid) -> Result<PaymentInstance, CollectionsError> {
        self.ctx
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("payment_instance", payment_id))
    }

    /// Hand a notified instance to the gateway.
    ///
    /// Synchronous rejection leaves the instance `failed` and is returned as
    /// `Ok`; the period is not retried. Instances that are not yet notified
    /// are refused with `PreconditionFailed`.
    #[instrument(skip(self))]
    pub async fn submit(
        &self,
        payment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentInstance, CollectionsError> {
        match self.attempt(payment_id, now).await? {
            Submission::Submitted(payment) | Submission::Rejected(payment) => Ok(payment),
            Submission::Withdrawn(reason) | Submission::Deferred(reason) => {
                Err(CollectionsError::PreconditionFailed(reason))
            }
        }
    }

    async fn attempt(
        &self,
        payment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Submission, CollectionsError> {
        let payment = self.get(payment_id).await?;
        match payment.status {
            PaymentStatus::Notified => {}
            PaymentStatus::Submitted => return Ok(Submission::Submitted(payment)),
            PaymentStatus::Scheduled => {
                return Err(CollectionsError::PreconditionFailed(format!(
                    "payment {} has not been pre-notified",
                    payment_id
                )));
            }
            other => return Err(stale(PaymentEvent::Submit, other)),
        }

        let notified_utc = payment.notified_utc.ok_or_else(|| {
            CollectionsError::PreconditionFailed(format!(
                "payment {} has no notification timestamp",
                payment_id
            ))
        })?;
        if notified_utc >= now || notified_utc.date_naive() > payment.notify_by {
            return Err(CollectionsError::PreconditionFailed(format!(
                "payment {} was not notified with sufficient advance notice",
                payment_id
            )));
        }

        let today = now.date_naive();
        if today > payment.due_date {
            let reason = format!("due date {} passed before submission", payment.due_date);
            withdraw_and_carry_forward(&self.ctx, &payment, &reason, now).await?;
            return Ok(Submission::Withdrawn(reason));
        }

        let store = self.ctx.store.as_ref();
        let subscription = store
            .get_subscription(payment.subscription_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("subscription", payment.subscription_id))?;
        let mandate = store
            .get_mandate(subscription.mandate_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("mandate", subscription.mandate_id))?;

        if mandate.status.is_terminal() {
            let reason = format!("mandate {}", mandate.status);
            transition_payment(store, payment_id, PaymentEvent::Cancel, now, |p| {
                p.last_error = Some(reason.clone());
            })
            .await?;
            return Ok(Submission::Withdrawn(reason));
        }
        if !mandate.status.can_collect() {
            return Ok(Submission::Deferred(format!("mandate {}", mandate.status)));
        }

        let request = NewGatewayPayment {
            idempotency_key: payment.idempotency_key(),
            gateway_mandate_id: mandate.gateway_mandate_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            charge_date: payment.due_date,
            reference: format!("{}-{}", mandate.reference, payment.period_key),
        };

        match self.ctx.gateway.create_payment(&request).await {
            Ok(gateway_payment_id) => {
                let recorded = transition_payment(store, payment_id, PaymentEvent::Submit, now, |p| {
                    p.gateway_payment_id = Some(gateway_payment_id.clone());
                    p.submitted_utc = Some(now);
                    p.last_error = None;
                })
                .await;
                match recorded {
                    Ok(change) => Ok(Submission::Submitted(change.into_payment())),
                    Err(e) => {
                        record_operator_alert("submitted_payment_not_recorded");
                        error!(
                            payment_id = %payment_id,
                            gateway_payment_id = %gateway_payment_id,
                            error = %e,
                            "Gateway accepted payment but local state could not be updated"
                        );
                        Err(e)
                    }
                }
            }
            Err(GatewayError::Rejected { code, message }) => {
                let change = transition_payment(store, payment_id, PaymentEvent::Reject, now, |p| {
                    p.last_error = Some(format!("{}: {}", code, message));
                })
                .await?;
                warn!(payment_id = %payment_id, code = %code, "Gateway rejected payment");
                Ok(Submission::Rejected(change.into_payment()))
            }
            Err(e @ GatewayError::Transient(_)) => {
                record_operator_alert("gateway_retries_exhausted");
                error!(
                    payment_id = %payment_id,
                    error = %e,
                    "Gateway unreachable after retries, marking payment failed for review"
                );
                let change = transition_payment(store, payment_id, PaymentEvent::Reject, now, |p| {
                    p.last_error = Some(e.to_string());
                })
                .await?;
                Ok(Submission::Rejected(change.into_payment()))
            }
        }
    }

    /// Submit every notified instance whose due date is inside the lead window.
    #[instrument(skip(self))]
    pub async fn run_submissions(&self, now: DateTime<Utc>) -> Result<SubmitReport, CollectionsError> {
        let mut report = SubmitReport::default();
        let horizon = now.date_naive() + Duration::days(self.ctx.policy.submission_lead_days);

        for payment in self.ctx.store.list_payments(PaymentStatus::Notified).await? {
            if payment.due_date > horizon {
                continue;
            }
            match self.attempt(payment.payment_id, now).await {
                Ok(Submission::Submitted(_)) => report.submitted += 1,
                Ok(Submission::Rejected(_)) => report.rejected += 1,
                Ok(Submission::Withdrawn(_)) => report.cancelled += 1,
                Ok(Submission::Deferred(reason)) => {
                    info!(payment_id = %payment.payment_id, reason = %reason, "Submission deferred");
                    report.deferred += 1;
                }
                Err(e) => {
                    warn!(payment_id = %payment.payment_id, error = %e, "Submission failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            submitted = report.submitted,
            rejected = report.rejected,
            deferred = report.deferred,
            "Submission run complete"
        );
        Ok(report)
    }

    async fn find_by_gateway_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<PaymentInstance>, CollectionsError> {
        let payment = self
            .ctx
            .store
            .find_payment_by_gateway_id(gateway_payment_id)
            .await?;
        if payment.is_none() {
            warn!(gateway_payment_id, "Webhook for unknown payment discarded");
        }
        Ok(payment)
    }

    /// `payment.confirmed`.
    #[instrument(skip(self))]
    pub async fn on_gateway_confirmed(
        &self,
        gateway_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(payment) = self.find_by_gateway_id(gateway_payment_id).await? else {
            return Ok(EventOutcome::UnknownResource);
        };
        let change = transition_payment(
            self.ctx.store.as_ref(),
            payment.payment_id,
            PaymentEvent::Confirm,
            now,
            |_| {},
        )
        .await?;
        match change {
            PaymentChange::Applied { payment, .. } => {
                self.lifecycle.on_first_payment_confirmed(&payment).await?;
                Ok(EventOutcome::Applied)
            }
            PaymentChange::Unchanged(_) => Ok(EventOutcome::Unchanged),
        }
    }

    /// `payment.paid`. Accepted straight from `submitted` as well.
    #[instrument(skip(self))]
    pub async fn on_gateway_paid(
        &self,
        gateway_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(payment) = self.find_by_gateway_id(gateway_payment_id).await? else {
            return Ok(EventOutcome::UnknownResource);
        };
        let change = transition_payment(
            self.ctx.store.as_ref(),
            payment.payment_id,
            PaymentEvent::Settle,
            now,
            |_| {},
        )
        .await?;
        match change {
            PaymentChange::Applied { from, payment } => {
                if from == PaymentStatus::Submitted {
                    self.lifecycle.on_first_payment_confirmed(&payment).await?;
                }
                Ok(EventOutcome::Applied)
            }
            PaymentChange::Unchanged(_) => Ok(EventOutcome::Unchanged),
        }
    }

    /// `payment.failed`. A reason code is classified like a return.
    #[instrument(skip(self, reason))]
    pub async fn on_gateway_failed(
        &self,
        gateway_payment_id: &str,
        reason_code: Option<&str>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(payment) = self.find_by_gateway_id(gateway_payment_id).await? else {
            return Ok(EventOutcome::UnknownResource);
        };
        let change = transition_payment(
            self.ctx.store.as_ref(),
            payment.payment_id,
            PaymentEvent::Fail,
            now,
            |p| {
                p.return_code = reason_code.map(str::to_string);
                p.last_error = reason.clone().or_else(|| reason_code.map(str::to_string));
            },
        )
        .await?;
        let outcome = if change.is_applied() {
            EventOutcome::Applied
        } else {
            EventOutcome::Unchanged
        };
        if let Some(code) = reason_code {
            self.reversals
                .handle_return(change.payment(), code, now)
                .await?;
        }
        Ok(outcome)
    }

    /// `payment.returned`. Accepted from `submitted`, `confirmed` and `paid`.
    ///
    /// The reversal runs on replays too; every mandate action it takes is
    /// idempotent, so a retry after a partial failure completes it.
    #[instrument(skip(self))]
    pub async fn on_gateway_returned(
        &self,
        gateway_payment_id: &str,
        return_code: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(payment) = self.find_by_gateway_id(gateway_payment_id).await? else {
            return Ok(EventOutcome::UnknownResource);
        };
        let change = transition_payment(
            self.ctx.store.as_ref(),
            payment.payment_id,
            PaymentEvent::Return,
            now,
            |p| {
                p.return_code = Some(return_code.to_string());
                p.last_error = Some(format!("returned: {}", return_code));
            },
        )
        .await?;
        self.reversals
            .handle_return(change.payment(), return_code, now)
            .await?;
        Ok(if change.is_applied() {
            EventOutcome::Applied
        } else {
            EventOutcome::Unchanged
        })
    }
}
