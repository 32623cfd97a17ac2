//! Engine-facing error taxonomy.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::IllegalTransition;
use crate::services::contracts::ContractError;
use crate::services::gateway::GatewayError;
use crate::services::notification::NotifyError;

#[derive(Debug, Error)]
pub enum CollectionsError {
    #[error("Invalid bank details: {0}")]
    InvalidBankDetails(String),

    #[error("An active mandate already exists for customer {customer_id} and contract {contract_id}")]
    DuplicateActiveMandate { customer_id: Uuid, contract_id: Uuid },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The record moved on before the update could be applied.
    #[error("Stale transition on {entity}: expected '{expected}', found '{actual}'")]
    StaleTransition {
        entity: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotifyError),

    #[error("Contract service error: {0}")]
    Contracts(#[from] ContractError),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl CollectionsError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CollectionsError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectionsError::InvalidBankDetails(_) => "invalid_bank_details",
            CollectionsError::DuplicateActiveMandate { .. } => "duplicate_active_mandate",
            CollectionsError::InvalidAmount(_) => "invalid_amount",
            CollectionsError::NotFound { .. } => "not_found",
            CollectionsError::StaleTransition { .. } => "stale_transition",
            CollectionsError::PreconditionFailed(_) => "precondition_failed",
            CollectionsError::IllegalTransition(_) => "illegal_transition",
            CollectionsError::Gateway(_) => "gateway",
            CollectionsError::Notification(_) => "notification",
            CollectionsError::Contracts(_) => "contracts",
            CollectionsError::Store(_) => "store",
        }
    }
}

impl From<CollectionsError> for AppError {
    fn from(err: CollectionsError) -> Self {
        match err {
            CollectionsError::InvalidBankDetails(_) | CollectionsError::InvalidAmount(_) => {
                AppError::Unprocessable(anyhow::Error::new(err))
            }
            CollectionsError::DuplicateActiveMandate { .. } => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            CollectionsError::NotFound { .. } => AppError::NotFound(anyhow::Error::new(err)),
            CollectionsError::StaleTransition { .. } | CollectionsError::IllegalTransition(_) => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            CollectionsError::PreconditionFailed(_) => {
                AppError::PreconditionFailed(anyhow::Error::new(err))
            }
            CollectionsError::Gateway(e) => AppError::BadGateway(e.to_string()),
            CollectionsError::Notification(e) => AppError::BadGateway(e.to_string()),
            CollectionsError::Contracts(e) => AppError::BadGateway(e.to_string()),
            CollectionsError::Store(e) => e,
        }
    }
}
