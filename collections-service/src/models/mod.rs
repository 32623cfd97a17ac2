//! Domain models for collections-service.

mod customer;
mod escalation;
mod mandate;
mod payment;
mod period;
mod return_code;
mod state;
mod subscription;

pub use customer::{normalize_iban, validate_iban, BankDetails, Customer};
pub use escalation::{
    alert_due, EscalationAlert, EscalationLadder, EscalationStage, Rung, SubjectType,
};
pub use mandate::{DirectDebitScheme, Mandate, MandateEvent, MandateStatus};
pub use payment::{PaymentEvent, PaymentInstance, PaymentStatus};
pub use period::{InvalidPeriodKey, PeriodKey};
pub use return_code::{classify_return, ReturnClass};
pub use state::{IllegalTransition, Transition};
pub use subscription::{Cadence, Subscription, SubscriptionEvent, SubscriptionStatus};
