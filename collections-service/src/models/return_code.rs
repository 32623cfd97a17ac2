//! Return-code classification per direct-debit scheme.
//!
//! SEPA codes are ISO 20022 reason codes carried on R-transactions. Bacs codes
//! are ARUDD (Automated Return of Unpaid Direct Debit) reason codes. A code
//! missing from the table of its scheme is treated as [`ReturnClass::MandateFatal`].

use serde::Serialize;

use super::DirectDebitScheme;

/// What a returned collection means for the mandate it was drawn against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnClass {
    /// The payer's account is fine; only this collection failed.
    Transient,
    /// The mandate needs attention before the next collection.
    SuspendMandate,
    /// The mandate can never be collected against again.
    MandateFatal,
}

impl ReturnClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnClass::Transient => "transient",
            ReturnClass::SuspendMandate => "suspend_mandate",
            ReturnClass::MandateFatal => "mandate_fatal",
        }
    }
}

const SEPA_CORE: &[(&str, ReturnClass)] = &[
    ("AC01", ReturnClass::MandateFatal),   // incorrect account number
    ("AC04", ReturnClass::MandateFatal),   // account closed
    ("AC06", ReturnClass::SuspendMandate), // account blocked
    ("AC13", ReturnClass::MandateFatal),   // debtor account is a consumer account
    ("AG01", ReturnClass::MandateFatal),   // direct debit forbidden on this account
    ("AG02", ReturnClass::Transient),      // invalid bank operation code
    ("AM04", ReturnClass::Transient),      // insufficient funds
    ("AM05", ReturnClass::Transient),      // duplicate collection
    ("BE05", ReturnClass::MandateFatal),   // creditor identifier unknown to the bank
    ("CNOR", ReturnClass::Transient),      // creditor bank not reachable
    ("DNOR", ReturnClass::MandateFatal),   // debtor bank not reachable
    ("FF01", ReturnClass::Transient),      // invalid file format
    ("MD01", ReturnClass::MandateFatal),   // no mandate
    ("MD02", ReturnClass::SuspendMandate), // mandate data missing or incorrect
    ("MD06", ReturnClass::Transient),      // refund requested by payer
    ("MD07", ReturnClass::MandateFatal),   // payer deceased
    ("MS02", ReturnClass::SuspendMandate), // refused by payer, no reason given
    ("MS03", ReturnClass::Transient),      // refused by bank, no reason given
    ("RC01", ReturnClass::MandateFatal),   // bank identifier incorrect
    ("RR01", ReturnClass::SuspendMandate), // regulatory: debtor account missing
    ("RR02", ReturnClass::SuspendMandate), // regulatory: debtor name missing
    ("RR03", ReturnClass::SuspendMandate), // regulatory: creditor name missing
    ("RR04", ReturnClass::SuspendMandate), // regulatory reason
    ("SL01", ReturnClass::SuspendMandate), // blocked by debtor bank service
];

const BACS_ARUDD: &[(&str, ReturnClass)] = &[
    ("0", ReturnClass::Transient),      // refer to payer
    ("1", ReturnClass::MandateFatal),   // instruction cancelled by payer
    ("2", ReturnClass::MandateFatal),   // payer deceased
    ("3", ReturnClass::SuspendMandate), // account transferred
    ("4", ReturnClass::SuspendMandate), // advance notice disputed
    ("5", ReturnClass::MandateFatal),   // no account
    ("6", ReturnClass::MandateFatal),   // no instruction
    ("7", ReturnClass::SuspendMandate), // amount differs
    ("8", ReturnClass::Transient),      // amount not yet due
    ("9", ReturnClass::Transient),      // presentation overdue
    ("A", ReturnClass::MandateFatal),   // service user differs
    ("B", ReturnClass::MandateFatal),   // account closed
];

fn table(scheme: DirectDebitScheme) -> &'static [(&'static str, ReturnClass)] {
    match scheme {
        DirectDebitScheme::SepaCore => SEPA_CORE,
        DirectDebitScheme::Bacs => BACS_ARUDD,
    }
}

/// Classify a return code for the given scheme.
pub fn classify_return(scheme: DirectDebitScheme, code: &str) -> ReturnClass {
    let code = code.trim().to_ascii_uppercase();
    table(scheme)
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, class)| *class)
        .unwrap_or(ReturnClass::MandateFatal)
}
