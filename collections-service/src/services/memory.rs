//! In-process [`CollectionsStore`] for tests and local runs.
//!
//! Enforces the same unique keys and compare-and-set semantics as the
//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::{
    Customer, EscalationAlert, Mandate, MandateStatus, PaymentInstance, PaymentStatus, PeriodKey,
    SubjectType, Subscription, SubscriptionStatus,
};
use crate::services::store::{webhook_lease_cutoff, CollectionsStore, WebhookClaim};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebhookState {
    Processing { claimed_utc: DateTime<Utc> },
    Processed,
    Failed,
}

#[derive(Default)]
struct Tables {
    customers: HashMap<Uuid, Customer>,
    mandates: HashMap<Uuid, Mandate>,
    subscriptions: HashMap<Uuid, Subscription>,
    payments: HashMap<Uuid, PaymentInstance>,
    alerts: Vec<EscalationAlert>,
    webhook_events: HashMap<String, WebhookState>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        self.tables
            .lock()
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }
}

fn active_conflict(tables: &Tables, candidate: &Mandate) -> bool {
    candidate.status == MandateStatus::Active
        && tables.mandates.values().any(|m| {
            m.mandate_id != candidate.mandate_id
                && m.customer_id == candidate.customer_id
                && m.contract_id == candidate.contract_id
                && m.status == MandateStatus::Active
        })
}

fn duplicate_active(candidate: &Mandate) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "active mandate already exists for customer {} contract {}",
        candidate.customer_id,
        candidate.contract_id
    ))
}

#[async_trait]
impl CollectionsStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.lock().map(|_| ())
    }

    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        Ok(self.lock()?.customers.get(&customer_id).cloned())
    }

    async fn upsert_customer(&self, customer: &Customer) -> Result<Customer, AppError> {
        let mut tables = self.lock()?;
        let stored = tables
            .customers
            .entry(customer.customer_id)
            .and_modify(|existing| {
                existing.email = customer.email.clone();
                if customer.gateway_customer_id.is_some() {
                    existing.gateway_customer_id = customer.gateway_customer_id.clone();
                }
                existing.updated_utc = customer.updated_utc;
            })
            .or_insert_with(|| customer.clone());
        Ok(stored.clone())
    }

    async fn insert_mandate(&self, mandate: &Mandate) -> Result<(), AppError> {
        let mut tables = self.lock()?;
        if tables.mandates.contains_key(&mandate.mandate_id)
            || tables
                .mandates
                .values()
                .any(|m| m.gateway_mandate_id == mandate.gateway_mandate_id)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "mandate {} already exists",
                mandate.mandate_id
            )));
        }
        if active_conflict(&tables, mandate) {
            return Err(duplicate_active(mandate));
        }
        tables.mandates.insert(mandate.mandate_id, mandate.clone());
        Ok(())
    }

    async fn get_mandate(&self, mandate_id: Uuid) -> Result<Option<Mandate>, AppError> {
        Ok(self.lock()?.mandates.get(&mandate_id).cloned())
    }

    async fn find_mandate_by_gateway_id(
        &self,
        gateway_mandate_id: &str,
    ) -> Result<Option<Mandate>, AppError> {
        Ok(self
            .lock()?
            .mandates
            .values()
            .find(|m| m.gateway_mandate_id == gateway_mandate_id)
            .cloned())
    }

    async fn mandates_for_contract(
        &self,
        customer_id: Uuid,
        contract_id: Uuid,
    ) -> Result<Vec<Mandate>, AppError> {
        let mut mandates: Vec<Mandate> = self
            .lock()?
            .mandates
            .values()
            .filter(|m| m.customer_id == customer_id && m.contract_id == contract_id)
            .cloned()
            .collect();
        mandates.sort_by_key(|m| m.created_utc);
        Ok(mandates)
    }

    async fn list_mandates(&self, status: MandateStatus) -> Result<Vec<Mandate>, AppError> {
        let mut mandates: Vec<Mandate> = self
            .lock()?
            .mandates
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        mandates.sort_by_key(|m| m.created_utc);
        Ok(mandates)
    }

    async fn update_mandate(
        &self,
        mandate: &Mandate,
        expected: MandateStatus,
    ) -> Result<bool, AppError> {
        let mut tables = self.lock()?;
        match tables.mandates.get(&mandate.mandate_id) {
            Some(current) if current.status == expected => {}
            _ => return Ok(false),
        }
        if active_conflict(&tables, mandate) {
            return Err(duplicate_active(mandate));
        }
        tables.mandates.insert(mandate.mandate_id, mandate.clone());
        Ok(true)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        let mut tables = self.lock()?;
        let live_for_contract = tables.subscriptions.values().any(|s| {
            s.contract_id == subscription.contract_id && s.status != SubscriptionStatus::Cancelled
        });
        if live_for_contract || tables.subscriptions.contains_key(&subscription.subscription_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "contract {} already has a live subscription",
                subscription.contract_id
            )));
        }
        tables
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self.lock()?.subscriptions.get(&subscription_id).cloned())
    }

    async fn subscription_for_contract(
        &self,
        contract_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .find(|s| s.contract_id == contract_id && s.status != SubscriptionStatus::Cancelled)
            .cloned())
    }

    async fn subscriptions_for_mandate(
        &self,
        mandate_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.mandate_id == mandate_id)
            .cloned()
            .collect())
    }

    async fn list_subscriptions(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<Subscription>, AppError> {
        let mut subscriptions: Vec<Subscription> = self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created_utc);
        Ok(subscriptions)
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
    ) -> Result<bool, AppError> {
        let mut tables = self.lock()?;
        match tables.subscriptions.get_mut(&subscription.subscription_id) {
            Some(current) if current.status == expected => {
                *current = subscription.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_payment_if_absent(
        &self,
        payment: &PaymentInstance,
    ) -> Result<(PaymentInstance, bool), AppError> {
        let mut tables = self.lock()?;
        if let Some(existing) = tables.payments.values().find(|p| {
            p.subscription_id == payment.subscription_id && p.period_key == payment.period_key
        }) {
            return Ok((existing.clone(), false));
        }
        tables.payments.insert(payment.payment_id, payment.clone());
        Ok((payment.clone(), true))
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<PaymentInstance>, AppError> {
        Ok(self.lock()?.payments.get(&payment_id).cloned())
    }

    async fn find_payment_by_gateway_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<PaymentInstance>, AppError> {
        Ok(self
            .lock()?
            .payments
            .values()
            .find(|p| p.gateway_payment_id.as_deref() == Some(gateway_payment_id))
            .cloned())
    }

    async fn payment_for_period(
        &self,
        subscription_id: Uuid,
        period_key: PeriodKey,
    ) -> Result<Option<PaymentInstance>, AppError> {
        Ok(self
            .lock()?
            .payments
            .values()
            .find(|p| p.subscription_id == subscription_id && p.period_key == period_key)
            .cloned())
    }

    async fn list_payments(
        &self,
        status: PaymentStatus,
    ) -> Result<Vec<PaymentInstance>, AppError> {
        let mut payments: Vec<PaymentInstance> = self
            .lock()?
            .payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.due_date, p.created_utc));
        Ok(payments)
    }

    async fn payments_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<PaymentInstance>, AppError> {
        let mut payments: Vec<PaymentInstance> = self
            .lock()?
            .payments
            .values()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.period_key);
        Ok(payments)
    }

    async fn update_payment(
        &self,
        payment: &PaymentInstance,
        expected: PaymentStatus,
    ) -> Result<bool, AppError> {
        let mut tables = self.lock()?;
        if let Some(gateway_id) = payment.gateway_payment_id.as_deref() {
            let taken = tables.payments.values().any(|p| {
                p.payment_id != payment.payment_id
                    && p.gateway_payment_id.as_deref() == Some(gateway_id)
            });
            if taken {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "gateway payment {} already linked",
                    gateway_id
                )));
            }
        }
        match tables.payments.get_mut(&payment.payment_id) {
            Some(current) if current.status == expected && current.version == payment.version => {
                *current = PaymentInstance {
                    version: payment.version + 1,
                    ..payment.clone()
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn latest_alert(
        &self,
        subject_type: SubjectType,
        subject_id: Uuid,
    ) -> Result<Option<EscalationAlert>, AppError> {
        Ok(self
            .lock()?
            .alerts
            .iter()
            .filter(|a| a.subject_type == subject_type && a.subject_id == subject_id)
            .max_by_key(|a| a.sent_utc)
            .cloned())
    }

    async fn insert_alert(&self, alert: &EscalationAlert) -> Result<(), AppError> {
        self.lock()?.alerts.push(alert.clone());
        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookClaim, AppError> {
        let mut tables = self.lock()?;
        match tables.webhook_events.get(event_id) {
            Some(WebhookState::Processed) => return Ok(WebhookClaim::Processed),
            Some(WebhookState::Processing { claimed_utc })
                if *claimed_utc >= webhook_lease_cutoff(now) =>
            {
                return Ok(WebhookClaim::InProgress)
            }
            _ => {}
        }
        tables.webhook_events.insert(
            event_id.to_string(),
            WebhookState::Processing { claimed_utc: now },
        );
        Ok(WebhookClaim::Claimed)
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let state = if error.is_some() {
            WebhookState::Failed
        } else {
            WebhookState::Processed
        };
        self.lock()?
            .webhook_events
            .insert(event_id.to_string(), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use rust_decimal::Decimal;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 11, 15, 9, 0, 0).unwrap()
    }

    fn scheduled() -> PaymentInstance {
        PaymentInstance {
            payment_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            period_key: PeriodKey::new(2026, 12).unwrap(),
            amount: Decimal::new(95000, 2),
            currency: "EUR".to_string(),
            due_date: NaiveDate::from_ymd_opt(2026, 12, 28).unwrap(),
            notify_by: NaiveDate::from_ymd_opt(2026, 12, 14).unwrap(),
            status: PaymentStatus::Scheduled,
            gateway_payment_id: None,
            last_error: None,
            return_code: None,
            notify_attempts: 0,
            notified_utc: None,
            submitted_utc: None,
            created_utc: now(),
            updated_utc: now(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn write_from_a_stale_read_is_rejected() {
        let store = MemoryStore::new();
        let (stale, _) = store.insert_payment_if_absent(&scheduled()).await.unwrap();

        let mut merged = stale.clone();
        merged.amount = Decimal::new(190000, 2);
        assert!(store.update_payment(&merged, PaymentStatus::Scheduled).await.unwrap());

        let mut bumped = stale.clone();
        bumped.notify_attempts = 1;
        assert!(!store.update_payment(&bumped, PaymentStatus::Scheduled).await.unwrap());

        let stored = store.get_payment(stale.payment_id).await.unwrap().unwrap();
        assert_eq!(stored.amount, Decimal::new(190000, 2));
        assert_eq!(stored.notify_attempts, 0);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn webhook_claims_follow_processing_state() {
        let store = MemoryStore::new();
        let claim = |at: DateTime<Utc>| store.claim_webhook_event("EV1", "payment.paid", at);

        assert_eq!(claim(now()).await.unwrap(), WebhookClaim::Claimed);
        assert_eq!(claim(now()).await.unwrap(), WebhookClaim::InProgress);

        store.complete_webhook_event("EV1", Some("store down")).await.unwrap();
        assert_eq!(claim(now()).await.unwrap(), WebhookClaim::Claimed);

        store.complete_webhook_event("EV1", None).await.unwrap();
        let much_later = now() + Duration::days(1);
        assert_eq!(claim(much_later).await.unwrap(), WebhookClaim::Processed);
    }
}
