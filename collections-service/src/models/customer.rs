//! Customer (payer) and bank account details.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DirectDebitScheme;

/// The payer. Immutable after creation except contact fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: Uuid,
    pub legal_name: String,
    pub email: String,
    pub country: String,
    pub gateway_customer_id: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Bank account the mandate will debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub account_holder: String,
    pub iban: String,
    pub scheme: DirectDebitScheme,
}

impl BankDetails {
    /// IBAN without spaces, upper-cased.
    pub fn normalized_iban(&self) -> String {
        normalize_iban(&self.iban)
    }

    /// Validate the account against the scheme. Returns a tenant-facing reason.
    pub fn validate(&self) -> Result<(), String> {
        if self.account_holder.trim().is_empty() {
            return Err("Account holder name is required".to_string());
        }
        validate_iban(&self.iban)?;
        let country = &self.normalized_iban()[..2];
        if !self.scheme.accepts_country(country) {
            return Err(format!(
                "Accounts from {} cannot be debited under the {} scheme",
                country,
                self.scheme.as_str()
            ));
        }
        Ok(())
    }
}

pub fn normalize_iban(iban: &str) -> String {
    iban.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// ISO 13616 IBAN length by country.
fn iban_length(country: &str) -> Option<usize> {
    let len = match country {
        "AD" => 24,
        "AT" => 20,
        "BE" => 16,
        "BG" => 22,
        "CH" => 21,
        "CY" => 28,
        "CZ" => 24,
        "DE" => 22,
        "DK" => 18,
        "EE" => 20,
        "ES" => 24,
        "FI" => 18,
        "FR" => 27,
        "GB" => 22,
        "GI" => 23,
        "GR" => 27,
        "HR" => 21,
        "HU" => 28,
        "IE" => 22,
        "IS" => 26,
        "IT" => 27,
        "LI" => 21,
        "LT" => 20,
        "LU" => 20,
        "LV" => 21,
        "MC" => 27,
        "MT" => 31,
        "NL" => 18,
        "NO" => 15,
        "PL" => 28,
        "PT" => 25,
        "RO" => 24,
        "SE" => 24,
        "SI" => 19,
        "SK" => 24,
        "SM" => 27,
        "VA" => 22,
        _ => return None,
    };
    Some(len)
}

/// Country length check plus the mod-97 checksum.
pub fn validate_iban(raw: &str) -> Result<(), String> {
    let iban = normalize_iban(raw);
    if iban.len() < 5 || !iban.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("IBAN is malformed".to_string());
    }

    let country = &iban[..2];
    let expected = iban_length(country)
        .ok_or_else(|| format!("IBAN country '{}' is not supported", country))?;
    if iban.len() != expected {
        return Err(format!(
            "IBAN for {} must be {} characters, got {}",
            country,
            expected,
            iban.len()
        ));
    }
    if !iban[2..4].chars().all(|c| c.is_ascii_digit()) {
        return Err("IBAN check digits are malformed".to_string());
    }

    let rearranged = iban[4..].chars().chain(iban[..4].chars());
    let mut remainder: u32 = 0;
    for c in rearranged {
        let value = c.to_digit(36).ok_or_else(|| "IBAN is malformed".to_string())?;
        remainder = if value >= 10 {
            (remainder * 100 + value) % 97
        } else {
            (remainder * 10 + value) % 97
        };
    }

    if remainder == 1 {
        Ok(())
    } else {
        Err("IBAN checksum is invalid".to_string())
    }
}
