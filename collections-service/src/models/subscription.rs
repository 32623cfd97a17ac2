//! Subscription model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::state::{IllegalTransition, Transition};

/// Billing cadence. Direct-debit rent collection is monthly only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Monthly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Monthly => "monthly",
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(Cadence::Monthly),
            other => Err(format!("unknown cadence '{}'", other)),
        }
    }
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Pause,
    Resume,
    Cancel,
}

impl SubscriptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionEvent::Pause => "pause",
            SubscriptionEvent::Resume => "resume",
            SubscriptionEvent::Cancel => "cancel",
        }
    }
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn apply(
        self,
        event: SubscriptionEvent,
    ) -> Result<Transition<SubscriptionStatus>, IllegalTransition> {
        use SubscriptionStatus::*;

        let target = match event {
            SubscriptionEvent::Pause => Paused,
            SubscriptionEvent::Resume => Active,
            SubscriptionEvent::Cancel => Cancelled,
        };
        if self == target {
            return Ok(Transition::Unchanged(self));
        }

        let legal = match event {
            SubscriptionEvent::Pause => self == Active,
            SubscriptionEvent::Resume => self == Paused,
            SubscriptionEvent::Cancel => matches!(self, Active | Paused),
        };

        if legal {
            Ok(Transition::Applied {
                from: self,
                to: target,
            })
        } else {
            Err(IllegalTransition {
                entity: "subscription",
                from: self.as_str(),
                event: event.as_str(),
            })
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "paused" => Ok(SubscriptionStatus::Paused),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(format!("unknown subscription status '{}'", other)),
        }
    }
}

/// Recurring billing plan bound to one mandate and one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub mandate_id: Uuid,
    pub contract_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub cadence: Cadence,
    pub anchor_day: u32,
    /// No period before the one containing this date is collected.
    pub starts_on: NaiveDate,
    pub status: SubscriptionStatus,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub cancelled_utc: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_resume_cancel() {
        use SubscriptionEvent::*;
        use SubscriptionStatus::*;

        assert_eq!(Active.apply(Pause).unwrap().state(), Paused);
        assert_eq!(Paused.apply(Resume).unwrap().state(), Active);
        assert_eq!(Paused.apply(Cancel).unwrap().state(), Cancelled);
        assert!(Cancelled.apply(Resume).is_err());
        assert_eq!(Cancelled.apply(Cancel).unwrap(), Transition::Unchanged(Cancelled));
    }
}
