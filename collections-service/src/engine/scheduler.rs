//! Creates one `scheduled` payment instance per subscription and period.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::EngineContext;
use crate::config::CollectionPolicy;
use crate::error::CollectionsError;
use crate::models::{
    DirectDebitScheme, PaymentInstance, PaymentStatus, PeriodKey, Subscription,
    SubscriptionStatus,
};
use crate::services::metrics::record_instance_scheduled;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleReport {
    pub subscriptions_examined: usize,
    pub instances_created: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// A period that can still be collected with full advance notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CollectiblePeriod {
    pub period: PeriodKey,
    pub due_date: NaiveDate,
    pub notify_by: NaiveDate,
}

/// Due date and notice deadline for `period`, or `None` when the period
/// precedes the subscription start or its notice deadline has passed.
pub(crate) fn collectible(
    subscription: &Subscription,
    scheme: DirectDebitScheme,
    policy: &CollectionPolicy,
    period: PeriodKey,
    today: NaiveDate,
) -> Option<CollectiblePeriod> {
    let due_date = period.due_date(subscription.anchor_day);
    if due_date < subscription.starts_on {
        return None;
    }
    let notify_by = due_date - Duration::days(policy.advance_notice_days(scheme));
    if notify_by < today {
        return None;
    }
    Some(CollectiblePeriod {
        period,
        due_date,
        notify_by,
    })
}

/// First period from `start` onward that can be collected without cutting the
/// notice short. Searches at most `carry_forward_periods` periods.
pub(crate) fn first_collectible(
    subscription: &Subscription,
    scheme: DirectDebitScheme,
    policy: &CollectionPolicy,
    start: PeriodKey,
    today: NaiveDate,
) -> Option<CollectiblePeriod> {
    let mut period = start;
    for _ in 0..policy.carry_forward_periods.max(1) {
        if let Some(found) = collectible(subscription, scheme, policy, period, today) {
            return Some(found);
        }
        period = period.next();
    }
    None
}

pub(crate) fn new_instance(
    subscription: &Subscription,
    slot: CollectiblePeriod,
    amount: Decimal,
    now: DateTime<Utc>,
) -> PaymentInstance {
    PaymentInstance {
        payment_id: Uuid::new_v4(),
        subscription_id: subscription.subscription_id,
        period_key: slot.period,
        amount,
        currency: subscription.currency.clone(),
        due_date: slot.due_date,
        notify_by: slot.notify_by,
        status: PaymentStatus::Scheduled,
        gateway_payment_id: None,
        last_error: None,
        return_code: None,
        notify_attempts: 0,
        notified_utc: None,
        submitted_utc: None,
        created_utc: now,
        updated_utc: now,
        version: 0,
    }
}

pub struct CollectionScheduler {
    ctx: EngineContext,
}

impl CollectionScheduler {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Schedule the next collectible period for every active subscription.
    ///
    /// Creation is keyed on (subscription, period), so running this any number
    /// of times on the same day creates at most one instance per period.
    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ScheduleReport, CollectionsError> {
        let mut report = ScheduleReport::default();

        for subscription in self
            .ctx
            .store
            .list_subscriptions(SubscriptionStatus::Active)
            .await?
        {
            report.subscriptions_examined += 1;
            match self.schedule_one(&subscription, now).await {
                Ok(true) => report.instances_created += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.subscription_id,
                        error = %e,
                        "Failed to schedule subscription"
                    );
                    report.errors += 1;
                }
            }
        }

        info!(
            examined = report.subscriptions_examined,
            created = report.instances_created,
            "Scheduler run complete"
        );
        Ok(report)
    }

    async fn schedule_one(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool, CollectionsError> {
        let mandate = self
            .ctx
            .store
            .get_mandate(subscription.mandate_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("mandate", subscription.mandate_id))?;
        if !mandate.status.can_collect() {
            debug!(
                subscription_id = %subscription.subscription_id,
                mandate_status = %mandate.status,
                "Mandate not active, not scheduling"
            );
            return Ok(false);
        }

        let today = now.date_naive();
        let start = PeriodKey::containing(today.max(subscription.starts_on));
        let Some(slot) =
            first_collectible(subscription, mandate.scheme, &self.ctx.policy, start, today)
        else {
            return Ok(false);
        };

        let candidate = new_instance(subscription, slot, subscription.amount, now);
        let (payment, created) = self.ctx.store.insert_payment_if_absent(&candidate).await?;
        if created {
            record_instance_scheduled(mandate.scheme.as_str());
            info!(
                payment_id = %payment.payment_id,
                subscription_id = %subscription.subscription_id,
                period = %payment.period_key,
                due_date = %payment.due_date,
                notify_by = %payment.notify_by,
                "Payment instance scheduled"
            );
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cadence;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn subscription(anchor_day: u32, starts_on: NaiveDate) -> Subscription {
        let now = Utc::now();
        Subscription {
            subscription_id: Uuid::new_v4(),
            mandate_id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            amount: Decimal::new(95000, 2),
            currency: "EUR".to_string(),
            cadence: Cadence::Monthly,
            anchor_day,
            starts_on,
            status: SubscriptionStatus::Active,
            created_utc: now,
            updated_utc: now,
            cancelled_utc: None,
        }
    }

    #[test]
    fn keeps_current_period_when_notice_fits() {
        let sub = subscription(28, date(2026, 1, 1));
        let policy = CollectionPolicy::default();
        let slot = first_collectible(
            &sub,
            DirectDebitScheme::SepaCore,
            &policy,
            PeriodKey::new(2026, 11).unwrap(),
            date(2026, 11, 2),
        )
        .unwrap();
        assert_eq!(slot.period.to_string(), "2026-11");
        assert_eq!(slot.due_date, date(2026, 11, 28));
        assert_eq!(slot.notify_by, date(2026, 11, 14));
    }

    #[test]
    fn pushes_to_next_period_when_notice_has_passed() {
        let sub = subscription(5, date(2026, 1, 1));
        let policy = CollectionPolicy::default();
        let slot = first_collectible(
            &sub,
            DirectDebitScheme::SepaCore,
            &policy,
            PeriodKey::new(2026, 11).unwrap(),
            date(2026, 11, 2),
        )
        .unwrap();
        assert_eq!(slot.period.to_string(), "2026-12");
        assert_eq!(slot.due_date, date(2026, 12, 5));
    }

    #[test]
    fn anchor_31_clamps_to_month_end() {
        let sub = subscription(31, date(2026, 1, 1));
        let policy = CollectionPolicy::default();
        let slot = first_collectible(
            &sub,
            DirectDebitScheme::Bacs,
            &policy,
            PeriodKey::new(2026, 11).unwrap(),
            date(2026, 11, 1),
        )
        .unwrap();
        assert_eq!(slot.due_date, date(2026, 11, 30));
        assert_eq!(slot.notify_by, date(2026, 11, 20));
    }

    #[test]
    fn skips_periods_before_start() {
        let sub = subscription(1, date(2026, 11, 15));
        let policy = CollectionPolicy::default();
        let slot = first_collectible(
            &sub,
            DirectDebitScheme::SepaCore,
            &policy,
            PeriodKey::new(2026, 11).unwrap(),
            date(2026, 11, 1),
        )
        .unwrap();
        assert_eq!(slot.period.to_string(), "2026-12");
    }
}
