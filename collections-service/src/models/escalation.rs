//! Dunning escalation: alerts and the ladder that stages them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Escalation stage, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStage {
    Initial,
    Followup,
    Urgent,
    Critical,
}

impl EscalationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStage::Initial => "initial",
            EscalationStage::Followup => "followup",
            EscalationStage::Urgent => "urgent",
            EscalationStage::Critical => "critical",
        }
    }
}

impl fmt::Display for EscalationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(EscalationStage::Initial),
            "followup" => Ok(EscalationStage::Followup),
            "urgent" => Ok(EscalationStage::Urgent),
            "critical" => Ok(EscalationStage::Critical),
            other => Err(format!("unknown escalation stage '{}'", other)),
        }
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    /// An unpaid (failed or returned) payment instance.
    PaymentInstance,
    /// A contract approaching its end date.
    ContractRenewal,
    /// A mandate approaching its expiry date.
    MandateExpiry,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::PaymentInstance => "payment_instance",
            SubjectType::ContractRenewal => "contract_renewal",
            SubjectType::MandateExpiry => "mandate_expiry",
        }
    }
}

impl FromStr for SubjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment_instance" => Ok(SubjectType::PaymentInstance),
            "contract_renewal" => Ok(SubjectType::ContractRenewal),
            "mandate_expiry" => Ok(SubjectType::MandateExpiry),
            other => Err(format!("unknown subject type '{}'", other)),
        }
    }
}

/// Record of a dunning notice. Derived, never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationAlert {
    pub alert_id: Uuid,
    pub subject_id: Uuid,
    pub subject_type: SubjectType,
    pub stage: EscalationStage,
    pub sent_utc: DateTime<Utc>,
}

/// One rung: a stage and its inclusive day range. Open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rung {
    pub stage: EscalationStage,
    pub from_days: Option<i64>,
    pub to_days: Option<i64>,
}

impl Rung {
    fn contains(&self, days: i64) -> bool {
        self.from_days.map_or(true, |from| days >= from) && self.to_days.map_or(true, |to| days <= to)
    }
}

/// Threshold table mapping a day count to a stage.
///
/// The same type drives both payment dunning (days overdue) and expiry
/// alerting (days until expiry); only the table differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationLadder {
    rungs: Vec<Rung>,
}

impl EscalationLadder {
    pub fn new(rungs: Vec<Rung>) -> Self {
        Self { rungs }
    }

    /// Ladder over days overdue. Not yet overdue means no stage.
    ///
    /// Unlike the expiry ladder, where a subject that has already lapsed is
    /// `critical` at once, an overdue payment starts at `initial` and climbs
    /// as it ages, so the payer gets reminders before the final notice.
    pub fn overdue() -> Self {
        Self::new(vec![
            rung(EscalationStage::Initial, Some(1), Some(7)),
            rung(EscalationStage::Followup, Some(8), Some(30)),
            rung(EscalationStage::Urgent, Some(31), Some(60)),
            rung(EscalationStage::Critical, Some(61), None),
        ])
    }

    /// Ladder over days until expiry. Anything beyond `horizon_days` is not
    /// yet worth an alert; already expired counts as critical.
    pub fn expiry(horizon_days: i64) -> Self {
        Self::new(vec![
            rung(EscalationStage::Critical, None, Some(7)),
            rung(EscalationStage::Urgent, Some(8), Some(30)),
            rung(EscalationStage::Followup, Some(31), Some(60)),
            rung(EscalationStage::Initial, Some(61), Some(horizon_days)),
        ])
    }

    pub fn stage_for(&self, days: i64) -> Option<EscalationStage> {
        self.rungs.iter().find(|r| r.contains(days)).map(|r| r.stage)
    }
}

fn rung(stage: EscalationStage, from_days: Option<i64>, to_days: Option<i64>) -> Rung {
    Rung {
        stage,
        from_days,
        to_days,
    }
}

/// A new alert is due when the subject has crossed into a stage it was not
/// last alerted for, and the previous alert is outside the cool-down window.
pub fn alert_due(
    last: Option<&EscalationAlert>,
    stage: EscalationStage,
    now: DateTime<Utc>,
    cool_down: Duration,
) -> bool {
    match last {
        None => true,
        Some(alert) => alert.stage != stage && now - alert.sent_utc >= cool_down,
    }
}
