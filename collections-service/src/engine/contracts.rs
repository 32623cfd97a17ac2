//! Contract-driven subscription lifecycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use service_core::retry::retry_call;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{
    cancel_subscription, transition_subscription, withdraw_pending_payments, EngineContext,
    MandateRegistry,
};
use crate::error::CollectionsError;
use crate::models::{
    Cadence, Customer, MandateStatus, PaymentInstance, PaymentStatus, Subscription,
    SubscriptionEvent, SubscriptionStatus,
};
use crate::services::metrics::record_operator_alert;
use crate::services::ContractActivation;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub activated: usize,
    pub already_known: usize,
    pub failed: usize,
}

/// Binds contracts to mandates and subscriptions.
#[derive(Clone)]
pub struct ContractLifecycle {
    ctx: EngineContext,
    mandates: MandateRegistry,
}

impl ContractLifecycle {
    pub fn new(ctx: EngineContext, mandates: MandateRegistry) -> Self {
        Self { ctx, mandates }
    }

    /// Enroll the mandate and create the subscription for a contract that went
    /// live with direct debit. Returns the existing subscription on repeat.
    ///
    /// The subscription starts `active`; nothing is scheduled until the
    /// mandate is activated by the gateway.
    #[instrument(skip(self, activation), fields(contract_id = %activation.contract_id))]
    pub async fn activate(
        &self,
        activation: &ContractActivation,
        now: DateTime<Utc>,
    ) -> Result<Subscription, CollectionsError> {
        activation.validate().map_err(AppError::from)?;

        if activation.amount <= rust_decimal::Decimal::ZERO {
            return Err(CollectionsError::InvalidAmount(format!(
                "amount must be positive, got {}",
                activation.amount
            )));
        }
        let scheme = activation.bank_details.scheme;
        let currency = activation
            .currency
            .as_deref()
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| scheme.currency().to_string());
        if currency != scheme.currency() {
            return Err(CollectionsError::InvalidAmount(format!(
                "{} debits are collected in {}, not {}",
                scheme.as_str(),
                scheme.currency(),
                currency
            )));
        }

        let store = self.ctx.store.as_ref();
        if let Some(existing) = store.subscription_for_contract(activation.contract_id).await? {
            info!(subscription_id = %existing.subscription_id, "Contract already has a subscription");
            return Ok(existing);
        }

        let payer = &activation.payer;
        let customer = Customer {
            customer_id: payer.customer_id,
            legal_name: payer.legal_name.trim().to_string(),
            email: payer.email.trim().to_string(),
            country: payer.country.to_ascii_uppercase(),
            gateway_customer_id: None,
            created_utc: now,
            updated_utc: now,
        };

        let mandate = match self
            .mandates
            .enroll(
                &customer,
                activation.contract_id,
                &activation.bank_details,
                activation.mandate_expires_on,
                now,
            )
            .await
        {
            Ok(mandate) => mandate,
            Err(CollectionsError::DuplicateActiveMandate {
                customer_id,
                contract_id,
            }) => store
                .mandates_for_contract(customer_id, contract_id)
                .await?
                .into_iter()
                .find(|m| m.status == MandateStatus::Active)
                .ok_or_else(|| CollectionsError::not_found("mandate", contract_id))?,
            Err(e) => return Err(e),
        };

        let subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            mandate_id: mandate.mandate_id,
            contract_id: activation.contract_id,
            amount: activation.amount,
            currency,
            cadence: Cadence::Monthly,
            anchor_day: activation.anchor_day,
            starts_on: activation.starts_on,
            status: SubscriptionStatus::Active,
            created_utc: now,
            updated_utc: now,
            cancelled_utc: None,
        };

        match store.insert_subscription(&subscription).await {
            Ok(()) => {
                info!(
                    subscription_id = %subscription.subscription_id,
                    mandate_id = %mandate.mandate_id,
                    amount = %subscription.amount,
                    anchor_day = subscription.anchor_day,
                    "Subscription created"
                );
                Ok(subscription)
            }
            Err(AppError::Conflict(_)) => store
                .subscription_for_contract(activation.contract_id)
                .await?
                .ok_or_else(|| CollectionsError::not_found("subscription", activation.contract_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel the contract's subscription and its not-yet-submitted
    /// instances. In-flight instances resolve normally.
    #[instrument(skip(self))]
    pub async fn on_contract_ended(
        &self,
        contract_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, CollectionsError> {
        let store = self.ctx.store.as_ref();
        let Some(subscription) = store.subscription_for_contract(contract_id).await? else {
            info!("No live subscription for ended contract");
            return Ok(None);
        };
        let cancelled =
            cancel_subscription(store, subscription.subscription_id, "contract ended", now).await?;
        Ok(Some(cancelled))
    }

    /// Activate every contract the contract service reports as still needing
    /// a mandate.
    #[instrument(skip(self))]
    pub async fn sync_contracts(&self, now: DateTime<Utc>) -> Result<SyncReport, CollectionsError> {
        let contracts = retry_call(&self.ctx.retry, "active_contracts_needing_mandate", || {
            self.ctx.contracts.active_contracts_needing_mandate()
        })
        .await?;

        let mut report = SyncReport::default();
        for activation in contracts {
            if self
                .ctx
                .store
                .subscription_for_contract(activation.contract_id)
                .await?
                .is_some()
            {
                report.already_known += 1;
                continue;
            }
            match self.activate(&activation, now).await {
                Ok(_) => report.activated += 1,
                Err(e) => {
                    warn!(contract_id = %activation.contract_id, error = %e, "Contract activation failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            activated = report.activated,
            known = report.already_known,
            failed = report.failed,
            "Contract sync complete"
        );
        Ok(report)
    }

    /// Stop scheduling new periods. Pending instances are withdrawn.
    #[instrument(skip(self))]
    pub async fn pause_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Subscription, CollectionsError> {
        let store = self.ctx.store.as_ref();
        let (subscription, changed) =
            transition_subscription(store, subscription_id, SubscriptionEvent::Pause, now).await?;
        if changed {
            withdraw_pending_payments(store, subscription_id, "subscription paused", now).await?;
        }
        Ok(subscription)
    }

    #[instrument(skip(self))]
    pub async fn resume_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Subscription, CollectionsError> {
        let (subscription, _) = transition_subscription(
            self.ctx.store.as_ref(),
            subscription_id,
            SubscriptionEvent::Resume,
            now,
        )
        .await?;
        Ok(subscription)
    }

    /// Tell the contract service about the first collected payment of a
    /// subscription. Delivery failures are alerted, not propagated.
    pub async fn on_first_payment_confirmed(
        &self,
        payment: &PaymentInstance,
    ) -> Result<(), CollectionsError> {
        let store = self.ctx.store.as_ref();
        let subscription = store
            .get_subscription(payment.subscription_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("subscription", payment.subscription_id))?;

        let earlier = store
            .payments_for_subscription(subscription.subscription_id)
            .await?
            .into_iter()
            .any(|p| {
                p.payment_id != payment.payment_id
                    && matches!(p.status, PaymentStatus::Confirmed | PaymentStatus::Paid)
            });
        if earlier {
            return Ok(());
        }

        let contract_id = subscription.contract_id;
        match retry_call(&self.ctx.retry, "first_payment_confirmed", || {
            self.ctx.contracts.first_payment_confirmed(contract_id)
        })
        .await
        {
            Ok(()) => {
                info!(contract_id = %contract_id, "First payment reported to contract service");
            }
            Err(e) => {
                record_operator_alert("first_payment_report_failed");
                warn!(contract_id = %contract_id, error = %e, "Could not report first payment");
            }
        }
        Ok(())
    }
}
