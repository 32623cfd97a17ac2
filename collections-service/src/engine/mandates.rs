//! Mandate lifecycle: enrollment, gateway-driven status changes, cancellation
//! cascade and expiry.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use service_core::error::AppError;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{cancel_subscription, EngineContext, EventOutcome, CAS_ATTEMPTS};
use crate::error::CollectionsError;
use crate::models::{
    BankDetails, Customer, Mandate, MandateEvent, MandateStatus, SubscriptionStatus, Transition,
};
use crate::services::gateway::{GatewayError, NewGatewayMandate};
use crate::services::metrics::record_operator_alert;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpiryReport {
    pub examined: usize,
    pub expired: usize,
    pub errors: usize,
}

/// Registers, activates, suspends and retires mandates.
#[derive(Clone)]
pub struct MandateRegistry {
    ctx: EngineContext,
}

/// SEPA mandate references are limited to 35 characters.
fn mandate_reference(mandate_id: Uuid) -> String {
    format!("DD{}", mandate_id.simple()).to_uppercase()
}

impl MandateRegistry {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Register a mandate request for (customer, contract).
    ///
    /// Re-enrolling while a request is still pending returns that request.
    /// Nothing is persisted unless the gateway accepted both the customer and
    /// the mandate.
    #[instrument(skip(self, customer, bank), fields(customer_id = %customer.customer_id, contract_id = %contract_id))]
    pub async fn enroll(
        &self,
        customer: &Customer,
        contract_id: Uuid,
        bank: &BankDetails,
        expires_on: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<Mandate, CollectionsError> {
        bank.validate()
            .map_err(CollectionsError::InvalidBankDetails)?;

        let existing = self
            .ctx
            .store
            .mandates_for_contract(customer.customer_id, contract_id)
            .await?;
        if existing.iter().any(|m| m.status == MandateStatus::Active) {
            return Err(CollectionsError::DuplicateActiveMandate {
                customer_id: customer.customer_id,
                contract_id,
            });
        }
        if let Some(pending) = existing
            .into_iter()
            .find(|m| m.status == MandateStatus::PendingCustomerApproval)
        {
            info!(mandate_id = %pending.mandate_id, "Mandate request already pending");
            return Ok(pending);
        }

        let stored = self.ctx.store.get_customer(customer.customer_id).await?;
        let gateway_customer_id = match stored.and_then(|c| c.gateway_customer_id) {
            Some(id) => id,
            None => self.ctx.gateway.create_customer(customer).await?,
        };

        let mandate_id = Uuid::new_v4();
        let reference = mandate_reference(mandate_id);
        let request = NewGatewayMandate {
            gateway_customer_id: gateway_customer_id.clone(),
            account_holder: bank.account_holder.trim().to_string(),
            iban: bank.normalized_iban(),
            scheme: bank.scheme,
            reference: reference.clone(),
        };
        let gateway_mandate_id = match self.ctx.gateway.create_mandate(&request).await {
            Ok(id) => id,
            Err(GatewayError::Rejected { code, message }) => {
                return Err(CollectionsError::InvalidBankDetails(format!(
                    "{} ({})",
                    message, code
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let customer = Customer {
            gateway_customer_id: Some(gateway_customer_id),
            updated_utc: now,
            ..customer.clone()
        };
        self.ctx.store.upsert_customer(&customer).await?;

        let mandate = Mandate {
            mandate_id,
            customer_id: customer.customer_id,
            contract_id,
            gateway_mandate_id,
            reference,
            scheme: bank.scheme,
            status: MandateStatus::PendingCustomerApproval,
            status_reason: None,
            expires_on,
            created_utc: now,
            updated_utc: now,
            cancelled_utc: None,
        };
        self.ctx.store.insert_mandate(&mandate).await?;

        info!(
            mandate_id = %mandate.mandate_id,
            gateway_mandate_id = %mandate.gateway_mandate_id,
            scheme = bank.scheme.as_str(),
            "Mandate enrolled"
        );
        Ok(mandate)
    }

    pub async fn get(&self, mandate_id: Uuid) -> Result<Mandate, CollectionsError> {
        self.ctx
            .store
            .get_mandate(mandate_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("mandate", mandate_id))
    }

    /// Apply `event` under compare-and-set. Returns the mandate and whether it changed.
    async fn transition(
        &self,
        mandate_id: Uuid,
        event: MandateEvent,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Mandate, bool), CollectionsError> {
        for _ in 0..CAS_ATTEMPTS {
            let mut mandate = self.get(mandate_id).await?;
            let (from, to) = match mandate.status.apply(event)? {
                Transition::Applied { from, to } => (from, to),
                Transition::Unchanged(_) => return Ok((mandate, false)),
            };

            mandate.status = to;
            mandate.updated_utc = now;
            if reason.is_some() {
                mandate.status_reason = reason.clone();
            }
            if to == MandateStatus::Cancelled {
                mandate.cancelled_utc = Some(now);
            }

            match self.ctx.store.update_mandate(&mandate, from).await {
                Ok(true) => {
                    info!(
                        mandate_id = %mandate.mandate_id,
                        from = %from,
                        to = %to,
                        reason = ?mandate.status_reason,
                        "Mandate transitioned"
                    );
                    return Ok((mandate, true));
                }
                Ok(false) => continue,
                Err(AppError::Conflict(_)) => {
                    return Err(CollectionsError::DuplicateActiveMandate {
                        customer_id: mandate.customer_id,
                        contract_id: mandate.contract_id,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CollectionsError::StaleTransition {
            entity: "mandate",
            expected: "unchanged".to_string(),
            actual: "concurrently modified".to_string(),
        })
    }

    async fn find_by_gateway_id(
        &self,
        gateway_mandate_id: &str,
    ) -> Result<Option<Mandate>, CollectionsError> {
        let mandate = self
            .ctx
            .store
            .find_mandate_by_gateway_id(gateway_mandate_id)
            .await?;
        if mandate.is_none() {
            warn!(gateway_mandate_id, "Webhook for unknown mandate discarded");
        }
        Ok(mandate)
    }

    fn outcome(changed: bool) -> EventOutcome {
        if changed {
            EventOutcome::Applied
        } else {
            EventOutcome::Unchanged
        }
    }

    /// `mandate.activated`. No-op when already active.
    #[instrument(skip(self))]
    pub async fn on_mandate_activated(
        &self,
        gateway_mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(mandate) = self.find_by_gateway_id(gateway_mandate_id).await? else {
            return Ok(EventOutcome::UnknownResource);
        };
        let (_, changed) = self
            .transition(mandate.mandate_id, MandateEvent::Activate, None, now)
            .await?;
        Ok(Self::outcome(changed))
    }

    /// `mandate.reactivated`: the payer or bank resolved the problem.
    #[instrument(skip(self))]
    pub async fn on_mandate_reactivated(
        &self,
        gateway_mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(mandate) = self.find_by_gateway_id(gateway_mandate_id).await? else {
            return Ok(EventOutcome::UnknownResource);
        };
        let (_, changed) = self
            .transition(mandate.mandate_id, MandateEvent::Reactivate, None, now)
            .await?;
        Ok(Self::outcome(changed))
    }

    /// `mandate.cancelled`: revoked at the gateway, so no gateway call back.
    #[instrument(skip(self))]
    pub async fn on_mandate_cancelled(
        &self,
        gateway_mandate_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(mandate) = self.find_by_gateway_id(gateway_mandate_id).await? else {
            return Ok(EventOutcome::UnknownResource);
        };
        let reason = reason.unwrap_or_else(|| "cancelled at gateway".to_string());
        let (_, changed) = self
            .retire(mandate.mandate_id, MandateEvent::Cancel, &reason, false, now)
            .await?;
        Ok(Self::outcome(changed))
    }

    /// `mandate.expired`.
    #[instrument(skip(self))]
    pub async fn on_mandate_expired(
        &self,
        gateway_mandate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, CollectionsError> {
        let Some(mandate) = self.find_by_gateway_id(gateway_mandate_id).await? else {
            return Ok(EventOutcome::UnknownResource);
        };
        let (_, changed) = self
            .retire(mandate.mandate_id, MandateEvent::Expire, "expired at gateway", false, now)
            .await?;
        Ok(Self::outcome(changed))
    }

    /// Cancel the mandate and everything collecting against it. Irreversible.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        mandate_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Mandate, CollectionsError> {
        let (mandate, _) = self
            .retire(mandate_id, MandateEvent::Cancel, reason, true, now)
            .await?;
        Ok(mandate)
    }

    /// Block new submissions without touching subscriptions.
    #[instrument(skip(self))]
    pub async fn suspend(
        &self,
        mandate_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Mandate, CollectionsError> {
        let (mandate, _) = self
            .transition(mandate_id, MandateEvent::Suspend, Some(reason.to_string()), now)
            .await?;
        Ok(mandate)
    }

    #[instrument(skip(self))]
    pub async fn reactivate(
        &self,
        mandate_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Mandate, CollectionsError> {
        let (mandate, _) = self
            .transition(mandate_id, MandateEvent::Reactivate, None, now)
            .await?;
        Ok(mandate)
    }

    /// Move the mandate to a terminal state and cascade to its subscriptions.
    ///
    /// The cascade also runs when the mandate was already terminal so that an
    /// interrupted earlier attempt is completed.
    async fn retire(
        &self,
        mandate_id: Uuid,
        event: MandateEvent,
        reason: &str,
        cancel_at_gateway: bool,
        now: DateTime<Utc>,
    ) -> Result<(Mandate, bool), CollectionsError> {
        let (mandate, changed) = self
            .transition(mandate_id, event, Some(reason.to_string()), now)
            .await?;

        for subscription in self
            .ctx
            .store
            .subscriptions_for_mandate(mandate.mandate_id)
            .await?
        {
            if subscription.status == SubscriptionStatus::Cancelled {
                continue;
            }
            cancel_subscription(
                self.ctx.store.as_ref(),
                subscription.subscription_id,
                reason,
                now,
            )
            .await?;
        }

        if changed && cancel_at_gateway {
            if let Err(e) = self
                .ctx
                .gateway
                .cancel_mandate(&mandate.gateway_mandate_id)
                .await
            {
                record_operator_alert("gateway_mandate_cancel_failed");
                error!(
                    mandate_id = %mandate.mandate_id,
                    gateway_mandate_id = %mandate.gateway_mandate_id,
                    error = %e,
                    "Mandate cancelled locally but gateway cancellation failed"
                );
            }
        }

        Ok((mandate, changed))
    }

    /// Expire every mandate whose `expires_on` is before today.
    #[instrument(skip(self))]
    pub async fn expire_mandates(&self, now: DateTime<Utc>) -> Result<ExpiryReport, CollectionsError> {
        let today = now.date_naive();
        let mut report = ExpiryReport::default();

        for status in [
            MandateStatus::PendingCustomerApproval,
            MandateStatus::Active,
            MandateStatus::Suspended,
        ] {
            for mandate in self.ctx.store.list_mandates(status).await? {
                report.examined += 1;
                let Some(expires_on) = mandate.expires_on else {
                    continue;
                };
                if expires_on >= today {
                    continue;
                }
                match self
                    .retire(mandate.mandate_id, MandateEvent::Expire, "mandate expired", true, now)
                    .await
                {
                    Ok((_, true)) => report.expired += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(mandate_id = %mandate.mandate_id, error = %e, "Failed to expire mandate");
                        report.errors += 1;
                    }
                }
            }
        }

        info!(expired = report.expired, "Mandate expiry run complete");
        Ok(report)
    }
}
