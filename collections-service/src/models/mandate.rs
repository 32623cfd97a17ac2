//! Mandate model and its lifecycle.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::state::{IllegalTransition, Transition};

/// Direct-debit scheme the mandate is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectDebitScheme {
    /// SEPA Core Direct Debit.
    SepaCore,
    /// UK Bacs Direct Debit.
    Bacs,
}

const SEPA_COUNTRIES: &[&str] = &[
    "AD", "AT", "BE", "BG", "CH", "CY", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GB", "GI",
    "GR", "HR", "HU", "IE", "IS", "IT", "LI", "LT", "LU", "LV", "MC", "MT", "NL", "NO", "PL",
    "PT", "RO", "SE", "SI", "SK", "SM", "VA",
];

impl DirectDebitScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectDebitScheme::SepaCore => "sepa_core",
            DirectDebitScheme::Bacs => "bacs",
        }
    }

    /// Currency the scheme settles in.
    pub fn currency(&self) -> &'static str {
        match self {
            DirectDebitScheme::SepaCore => "EUR",
            DirectDebitScheme::Bacs => "GBP",
        }
    }

    pub fn accepts_country(&self, country: &str) -> bool {
        match self {
            DirectDebitScheme::SepaCore => SEPA_COUNTRIES.contains(&country),
            DirectDebitScheme::Bacs => country == "GB",
        }
    }
}

impl FromStr for DirectDebitScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sepa_core" => Ok(DirectDebitScheme::SepaCore),
            "bacs" => Ok(DirectDebitScheme::Bacs),
            other => Err(format!("unknown direct-debit scheme '{}'", other)),
        }
    }
}

/// Mandate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MandateStatus {
    PendingCustomerApproval,
    Active,
    Suspended,
    Cancelled,
    Expired,
}

/// Events that move a mandate through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MandateEvent {
    Activate,
    Suspend,
    Reactivate,
    Cancel,
    Expire,
}

impl MandateEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MandateEvent::Activate => "activate",
            MandateEvent::Suspend => "suspend",
            MandateEvent::Reactivate => "reactivate",
            MandateEvent::Cancel => "cancel",
            MandateEvent::Expire => "expire",
        }
    }

    fn target(&self) -> MandateStatus {
        match self {
            MandateEvent::Activate | MandateEvent::Reactivate => MandateStatus::Active,
            MandateEvent::Suspend => MandateStatus::Suspended,
            MandateEvent::Cancel => MandateStatus::Cancelled,
            MandateEvent::Expire => MandateStatus::Expired,
        }
    }
}

impl MandateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MandateStatus::PendingCustomerApproval => "pending_customer_approval",
            MandateStatus::Active => "active",
            MandateStatus::Suspended => "suspended",
            MandateStatus::Cancelled => "cancelled",
            MandateStatus::Expired => "expired",
        }
    }

    /// Whether new collections may be submitted against the mandate.
    pub fn can_collect(&self) -> bool {
        matches!(self, MandateStatus::Active)
    }

    /// Whether the mandate can never collect again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MandateStatus::Cancelled | MandateStatus::Expired)
    }

    /// The single authoritative transition function for mandates.
    ///
    /// Forward only, except `active -> suspended -> active`. Every state may be
    /// cancelled; cancelled is terminal.
    pub fn apply(self, event: MandateEvent) -> Result<Transition<MandateStatus>, IllegalTransition> {
        use MandateStatus::*;

        let target = event.target();
        if self == target {
            return Ok(Transition::Unchanged(self));
        }

        let legal = match event {
            MandateEvent::Activate => self == PendingCustomerApproval,
            MandateEvent::Suspend => self == Active,
            MandateEvent::Reactivate => self == Suspended,
            MandateEvent::Expire => matches!(self, PendingCustomerApproval | Active | Suspended),
            MandateEvent::Cancel => self != Cancelled,
        };

        if legal {
            Ok(Transition::Applied {
                from: self,
                to: target,
            })
        } else {
            Err(IllegalTransition {
                entity: "mandate",
                from: self.as_str(),
                event: event.as_str(),
            })
        }
    }
}

impl fmt::Display for MandateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MandateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_customer_approval" => Ok(MandateStatus::PendingCustomerApproval),
            "active" => Ok(MandateStatus::Active),
            "suspended" => Ok(MandateStatus::Suspended),
            "cancelled" => Ok(MandateStatus::Cancelled),
            "expired" => Ok(MandateStatus::Expired),
            other => Err(format!("unknown mandate status '{}'", other)),
        }
    }
}

/// Bank debit authorization registered at the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mandate {
    pub mandate_id: Uuid,
    pub customer_id: Uuid,
    pub contract_id: Uuid,
    pub gateway_mandate_id: String,
    /// Reference shown to the payer on pre-notifications and bank statements.
    pub reference: String,
    pub scheme: DirectDebitScheme,
    pub status: MandateStatus,
    pub status_reason: Option<String>,
    pub expires_on: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub cancelled_utc: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use MandateEvent::*;
    use MandateStatus::*;

    #[test]
    fn activation_is_idempotent() {
        assert!(PendingCustomerApproval.apply(Activate).unwrap().is_applied());
        assert_eq!(Active.apply(Activate).unwrap(), Transition::Unchanged(Active));
    }

    #[test]
    fn suspension_round_trip() {
        assert_eq!(Active.apply(Suspend).unwrap().state(), Suspended);
        assert_eq!(Suspended.apply(Reactivate).unwrap().state(), Active);
    }

    #[test]
    fn cancelled_is_terminal() {
        for from in [PendingCustomerApproval, Active, Suspended, Expired] {
            assert_eq!(from.apply(Cancel).unwrap().state(), Cancelled);
        }
        assert!(Cancelled.apply(Activate).is_err());
        assert!(Cancelled.apply(Reactivate).is_err());
        assert_eq!(Cancelled.apply(Cancel).unwrap(), Transition::Unchanged(Cancelled));
    }

    #[test]
    fn only_forward_transitions() {
        assert!(Active.apply(Reactivate).unwrap() == Transition::Unchanged(Active));
        assert!(Suspended.apply(Activate).is_err());
        assert!(Expired.apply(Activate).is_err());
        assert!(PendingCustomerApproval.apply(Suspend).is_err());
    }
}
