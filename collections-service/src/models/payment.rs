//! Payment instance model and the payment state machine.
//!
//! ```text
//! scheduled -> notified -> submitted -> confirmed -> paid
//!     |            |            |            |         |
//!     v            v            v            +---------+--> returned
//! cancelled    cancelled      failed
//!                  |
//!                  v
//!                failed (synchronous rejection)
//! ```
//!
//! `returned` is also accepted straight from `submitted`, and `paid` from
//! `submitted`, because gateways may skip or reorder the confirmation event.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::period::PeriodKey;
use super::state::{IllegalTransition, Transition};

/// Payment instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Scheduled,
    Notified,
    Submitted,
    Confirmed,
    Paid,
    Failed,
    Returned,
    Cancelled,
}

/// Events applied to a payment instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEvent {
    /// Pre-notification delivered to the payer.
    Notify,
    /// Gateway accepted the submission.
    Submit,
    /// Gateway rejected the submission synchronously, or retries ran out.
    Reject,
    /// `payment.confirmed` webhook.
    Confirm,
    /// `payment.paid` webhook.
    Settle,
    /// `payment.failed` webhook.
    Fail,
    /// `payment.returned` webhook.
    Return,
    /// Withdrawn locally before reaching the gateway.
    Cancel,
}

impl PaymentEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEvent::Notify => "notify",
            PaymentEvent::Submit => "submit",
            PaymentEvent::Reject => "reject",
            PaymentEvent::Confirm => "confirm",
            PaymentEvent::Settle => "settle",
            PaymentEvent::Fail => "fail",
            PaymentEvent::Return => "return",
            PaymentEvent::Cancel => "cancel",
        }
    }

    pub fn target(&self) -> PaymentStatus {
        match self {
            PaymentEvent::Notify => PaymentStatus::Notified,
            PaymentEvent::Submit => PaymentStatus::Submitted,
            PaymentEvent::Reject | PaymentEvent::Fail => PaymentStatus::Failed,
            PaymentEvent::Confirm => PaymentStatus::Confirmed,
            PaymentEvent::Settle => PaymentStatus::Paid,
            PaymentEvent::Return => PaymentStatus::Returned,
            PaymentEvent::Cancel => PaymentStatus::Cancelled,
        }
    }

    /// States the event may legally be applied from.
    pub fn sources(&self) -> &'static [PaymentStatus] {
        use PaymentStatus::*;
        match self {
            PaymentEvent::Notify => &[Scheduled],
            PaymentEvent::Submit => &[Notified],
            PaymentEvent::Reject => &[Notified],
            PaymentEvent::Confirm => &[Submitted],
            PaymentEvent::Settle => &[Submitted, Confirmed],
            PaymentEvent::Fail => &[Submitted],
            PaymentEvent::Return => &[Submitted, Confirmed, Paid],
            PaymentEvent::Cancel => &[Scheduled, Notified],
        }
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Scheduled => "scheduled",
            PaymentStatus::Notified => "notified",
            PaymentStatus::Submitted => "submitted",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Returned => "returned",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    /// Not yet handed to the gateway, so it can still be withdrawn.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, PaymentStatus::Scheduled | PaymentStatus::Notified)
    }

    /// The single authoritative transition function for payment instances.
    pub fn apply(self, event: PaymentEvent) -> Result<Transition<PaymentStatus>, IllegalTransition> {
        let target = event.target();
        if self == target {
            return Ok(Transition::Unchanged(self));
        }

        if event.sources().contains(&self) {
            Ok(Transition::Applied {
                from: self,
                to: target,
            })
        } else {
            Err(IllegalTransition {
                entity: "payment_instance",
                from: self.as_str(),
                event: event.as_str(),
            })
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(PaymentStatus::Scheduled),
            "notified" => Ok(PaymentStatus::Notified),
            "submitted" => Ok(PaymentStatus::Submitted),
            "confirmed" => Ok(PaymentStatus::Confirmed),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "returned" => Ok(PaymentStatus::Returned),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(format!("unknown payment status '{}'", other)),
        }
    }
}

/// One billing-period charge attempt. Unique per (subscription, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstance {
    pub payment_id: Uuid,
    pub subscription_id: Uuid,
    pub period_key: PeriodKey,
    pub amount: Decimal,
    pub currency: String,
    pub due_date: NaiveDate,
    /// Last day on which the pre-notification still gives enough notice.
    pub notify_by: NaiveDate,
    pub status: PaymentStatus,
    pub gateway_payment_id: Option<String>,
    pub last_error: Option<String>,
    pub return_code: Option<String>,
    pub notify_attempts: i32,
    pub notified_utc: Option<DateTime<Utc>>,
    pub submitted_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    /// Row version; every stored update must carry the version it read.
    pub version: i32,
}

impl PaymentInstance {
    /// Idempotency key sent with the gateway submission.
    pub fn idempotency_key(&self) -> String {
        format!("pi_{}", self.payment_id.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PaymentEvent::*;
    use PaymentStatus::*;

    #[test]
    fn happy_path() {
        let mut status = Scheduled;
        for event in [Notify, Submit, Confirm, Settle] {
            status = status.apply(event).unwrap().state();
        }
        assert_eq!(status, Paid);
    }

    #[test]
    fn submission_requires_notification() {
        let err = Scheduled.apply(Submit).unwrap_err();
        assert_eq!(err.from, "scheduled");
        assert_eq!(err.event, "submit");
    }

    #[test]
    fn replayed_terminal_transition_is_unchanged() {
        assert_eq!(Paid.apply(Settle).unwrap(), Transition::Unchanged(Paid));
        assert_eq!(Returned.apply(Return).unwrap(), Transition::Unchanged(Returned));
        assert_eq!(Failed.apply(Fail).unwrap(), Transition::Unchanged(Failed));
    }

    #[test]
    fn out_of_order_confirmation_is_rejected() {
        assert!(Returned.apply(Confirm).is_err());
        assert!(Paid.apply(Confirm).is_err());
        assert!(Failed.apply(Settle).is_err());
    }

    #[test]
    fn submitted_and_later_cannot_be_cancelled() {
        for status in [Submitted, Confirmed, Paid] {
            assert!(status.apply(Cancel).is_err());
        }
        assert!(Notified.apply(Cancel).is_ok());
    }

    #[test]
    fn idempotency_key_is_stable() {
        let id = Uuid::parse_str("7c9e6679-7425-40de-944b-e07fc1f90ae7").unwrap();
        let now = Utc::now();
        let instance = PaymentInstance {
            payment_id: id,
            subscription_id: Uuid::new_v4(),
            period_key: PeriodKey::new(2026, 5).unwrap(),
            amount: Decimal::new(95000, 2),
            currency: "EUR".to_string(),
            due_date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            notify_by: NaiveDate::from_ymd_opt(2026, 4, 17).unwrap(),
            status: Scheduled,
            gateway_payment_id: None,
            last_error: None,
            return_code: None,
            notify_attempts: 0,
            notified_utc: None,
            submitted_utc: None,
            created_utc: now,
            updated_utc: now,
            version: 0,
        };
        assert_eq!(instance.idempotency_key(), "pi_7c9e6679742540de944be07fc1f90ae7");
    }
}
