//! Staged reminders for overdue payments and approaching expiries.
//!
//! Both subject families run through [`EscalationLadder`]; only the threshold
//! table and template differ. An alert is raised when a subject enters a new
//! stage and the previous alert is outside the cool-down window.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::EngineContext;
use crate::error::CollectionsError;
use crate::models::{
    alert_due, EscalationAlert, EscalationLadder, EscalationStage, MandateStatus, PaymentInstance,
    PaymentStatus, SubjectType,
};
use crate::services::metrics::record_escalation_alert;
use crate::services::{NotificationRequest, TemplateKind};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DunningReport {
    pub alerts_raised: usize,
    pub suppressed: usize,
    pub errors: usize,
}

/// Something that may need a reminder.
struct Subject {
    subject_id: Uuid,
    subject_type: SubjectType,
    stage: EscalationStage,
    recipient: String,
    template: TemplateKind,
    data: Value,
}

pub struct DunningEscalator {
    ctx: EngineContext,
    overdue: EscalationLadder,
    expiry: EscalationLadder,
}

impl DunningEscalator {
    pub fn new(ctx: EngineContext) -> Self {
        let expiry = EscalationLadder::expiry(ctx.policy.expiry_horizon_days);
        Self {
            ctx,
            overdue: EscalationLadder::overdue(),
            expiry,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<DunningReport, CollectionsError> {
        let mut report = DunningReport::default();

        for status in [PaymentStatus::Failed, PaymentStatus::Returned] {
            for payment in self.ctx.store.list_payments(status).await? {
                match self.overdue_subject(&payment, now).await {
                    Ok(Some(subject)) => self.raise(subject, now, &mut report).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(payment_id = %payment.payment_id, error = %e, "Failed to evaluate overdue payment");
                        report.errors += 1;
                    }
                }
            }
        }

        self.mandate_expiries(now, &mut report).await?;
        self.contract_renewals(now, &mut report).await;

        info!(
            raised = report.alerts_raised,
            suppressed = report.suppressed,
            errors = report.errors,
            "Dunning run complete"
        );
        Ok(report)
    }

    async fn overdue_subject(
        &self,
        payment: &PaymentInstance,
        now: DateTime<Utc>,
    ) -> Result<Option<Subject>, CollectionsError> {
        let days_overdue = (now.date_naive() - payment.due_date).num_days();
        let Some(stage) = self.overdue.stage_for(days_overdue) else {
            return Ok(None);
        };

        let store = self.ctx.store.as_ref();
        let subscription = store
            .get_subscription(payment.subscription_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("subscription", payment.subscription_id))?;
        let mandate = store
            .get_mandate(subscription.mandate_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("mandate", subscription.mandate_id))?;
        let customer = store
            .get_customer(mandate.customer_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("customer", mandate.customer_id))?;

        Ok(Some(Subject {
            subject_id: payment.payment_id,
            subject_type: SubjectType::PaymentInstance,
            stage,
            recipient: customer.email,
            template: TemplateKind::PaymentOverdue,
            data: json!({
                "customer_name": customer.legal_name,
                "amount": payment.amount.to_string(),
                "currency": payment.currency,
                "due_date": payment.due_date.to_string(),
                "period": payment.period_key.to_string(),
                "days_overdue": days_overdue,
                "stage": stage.as_str(),
            }),
        }))
    }

    async fn mandate_expiries(
        &self,
        now: DateTime<Utc>,
        report: &mut DunningReport,
    ) -> Result<(), CollectionsError> {
        let today = now.date_naive();
        for status in [MandateStatus::Active, MandateStatus::Suspended] {
            for mandate in self.ctx.store.list_mandates(status).await? {
                let Some(expires_on) = mandate.expires_on else {
                    continue;
                };
                let days_left = (expires_on - today).num_days();
                let Some(stage) = self.expiry.stage_for(days_left) else {
                    continue;
                };
                let customer = match self.ctx.store.get_customer(mandate.customer_id).await? {
                    Some(customer) => customer,
                    None => {
                        warn!(mandate_id = %mandate.mandate_id, "Mandate without customer");
                        report.errors += 1;
                        continue;
                    }
                };
                let subject = Subject {
                    subject_id: mandate.mandate_id,
                    subject_type: SubjectType::MandateExpiry,
                    stage,
                    recipient: customer.email,
                    template: TemplateKind::MandateExpiry,
                    data: json!({
                        "customer_name": customer.legal_name,
                        "mandate_reference": mandate.reference,
                        "expires_on": expires_on.to_string(),
                        "days_left": days_left,
                        "stage": stage.as_str(),
                    }),
                };
                self.raise(subject, now, report).await;
            }
        }
        Ok(())
    }

    async fn contract_renewals(&self, now: DateTime<Utc>, report: &mut DunningReport) {
        let today = now.date_naive();
        let until = today + Duration::days(self.ctx.policy.expiry_horizon_days);
        let ending = match self.ctx.contracts.contracts_ending_between(today, until).await {
            Ok(ending) => ending,
            Err(e) => {
                warn!(error = %e, "Could not fetch ending contracts");
                report.errors += 1;
                return;
            }
        };

        for contract in ending {
            let days_left = (contract.ends_on - today).num_days();
            let Some(stage) = self.expiry.stage_for(days_left) else {
                continue;
            };
            let subject = Subject {
                subject_id: contract.contract_id,
                subject_type: SubjectType::ContractRenewal,
                stage,
                recipient: contract.recipient,
                template: TemplateKind::ContractRenewal,
                data: json!({
                    "contract_id": contract.contract_id,
                    "ends_on": contract.ends_on.to_string(),
                    "days_left": days_left,
                    "stage": stage.as_str(),
                }),
            };
            self.raise(subject, now, report).await;
        }
    }

    async fn raise(&self, subject: Subject, now: DateTime<Utc>, report: &mut DunningReport) {
        if let Err(e) = self.try_raise(&subject, now, report).await {
            warn!(
                subject_id = %subject.subject_id,
                subject_type = subject.subject_type.as_str(),
                error = %e,
                "Escalation alert failed"
            );
            report.errors += 1;
        }
    }

    async fn try_raise(
        &self,
        subject: &Subject,
        now: DateTime<Utc>,
        report: &mut DunningReport,
    ) -> Result<(), CollectionsError> {
        let last = self
            .ctx
            .store
            .latest_alert(subject.subject_type, subject.subject_id)
            .await?;
        if !alert_due(last.as_ref(), subject.stage, now, self.ctx.policy.dunning_cool_down()) {
            debug!(
                subject_id = %subject.subject_id,
                stage = subject.stage.as_str(),
                "Escalation suppressed"
            );
            report.suppressed += 1;
            return Ok(());
        }

        self.ctx
            .notifier
            .send(&NotificationRequest {
                recipient: subject.recipient.clone(),
                template: subject.template,
                data: subject.data.clone(),
                dedup_key: format!(
                    "{}_{}_{}",
                    subject.subject_type.as_str(),
                    subject.subject_id,
                    subject.stage.as_str()
                ),
            })
            .await?;

        let alert = EscalationAlert {
            alert_id: Uuid::new_v4(),
            subject_id: subject.subject_id,
            subject_type: subject.subject_type,
            stage: subject.stage,
            sent_utc: now,
        };
        self.ctx.store.insert_alert(&alert).await?;
        record_escalation_alert(subject.subject_type.as_str(), subject.stage.as_str());
        info!(
            subject_id = %subject.subject_id,
            subject_type = subject.subject_type.as_str(),
            stage = subject.stage.as_str(),
            "Escalation alert sent"
        );
        report.alerts_raised += 1;
        Ok(())
    }
}
