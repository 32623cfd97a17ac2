//! Client for the external contract service.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::observability::TracedRequestExt;
use service_core::retry::{Classify, ErrorClass};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use crate::config::ContractServiceConfig;
use crate::models::BankDetails;

#[derive(Debug, Clone, Error)]
pub enum ContractError {
    #[error("contract service unavailable: {0}")]
    Unavailable(String),

    #[error("contract service rejected request: {0}")]
    Rejected(String),
}

impl Classify for ContractError {
    fn class(&self) -> ErrorClass {
        match self {
            ContractError::Unavailable(_) => ErrorClass::Retryable,
            ContractError::Rejected(_) => ErrorClass::Permanent,
        }
    }

    fn timed_out(after: Duration) -> Self {
        ContractError::Unavailable(format!("no response within {:?}", after))
    }
}

/// The payer as known to the contract service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PayerProfile {
    pub customer_id: Uuid,
    #[validate(length(min = 1, max = 140))]
    pub legal_name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(equal = 2))]
    pub country: String,
}

/// A contract that has gone live with direct debit enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ContractActivation {
    pub contract_id: Uuid,
    #[validate(nested)]
    pub payer: PayerProfile,
    pub bank_details: BankDetails,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[validate(range(min = 1, max = 31))]
    pub anchor_day: u32,
    pub starts_on: NaiveDate,
    #[serde(default)]
    pub mandate_expires_on: Option<NaiveDate>,
}

/// A contract approaching its end date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingContract {
    pub contract_id: Uuid,
    pub customer_id: Uuid,
    pub recipient: String,
    pub ends_on: NaiveDate,
}

#[async_trait]
pub trait ContractService: Send + Sync {
    async fn active_contracts_needing_mandate(
        &self,
    ) -> Result<Vec<ContractActivation>, ContractError>;

    async fn first_payment_confirmed(&self, contract_id: Uuid) -> Result<(), ContractError>;

    /// Contracts whose end date falls in `[from, to]`.
    async fn contracts_ending_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<EndingContract>, ContractError>;
}

#[derive(Clone)]
pub struct HttpContractService {
    client: Client,
    base_url: String,
}

impl HttpContractService {
    pub fn new(config: &ContractServiceConfig) -> Result<Self, ContractError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ContractError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ContractError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(ContractError::Unavailable(format!("{}: {}", status, body)))
        } else {
            Err(ContractError::Rejected(format!("{}: {}", status, body)))
        }
    }
}

fn unavailable(e: reqwest::Error) -> ContractError {
    ContractError::Unavailable(e.to_string())
}

#[async_trait]
impl ContractService for HttpContractService {
    async fn active_contracts_needing_mandate(
        &self,
    ) -> Result<Vec<ContractActivation>, ContractError> {
        let url = format!("{}/contracts/needing-mandate", self.base_url);
        let response = self
            .client
            .get(&url)
            .with_trace_context()
            .send()
            .await
            .map_err(unavailable)?;
        Self::check(response).await?.json().await.map_err(unavailable)
    }

    async fn first_payment_confirmed(&self, contract_id: Uuid) -> Result<(), ContractError> {
        let url = format!(
            "{}/contracts/{}/first-payment-confirmed",
            self.base_url, contract_id
        );
        let response = self
            .client
            .post(&url)
            .with_trace_context()
            .send()
            .await
            .map_err(unavailable)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn contracts_ending_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<EndingContract>, ContractError> {
        let url = format!("{}/contracts/ending", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("from", from.to_string()), ("to", to.to_string())])
            .with_trace_context()
            .send()
            .await
            .map_err(unavailable)?;
        Self::check(response).await?.json().await.map_err(unavailable)
    }
}
