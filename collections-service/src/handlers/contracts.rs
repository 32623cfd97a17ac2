use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::Subscription;
use crate::services::ContractActivation;
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct ContractEndedResponse {
    pub contract_id: Uuid,
    pub subscription: Option<Subscription>,
}

/// A contract went live with direct debit enabled.
#[tracing::instrument(skip(state, request), fields(contract_id = %request.contract_id))]
pub async fn activate_contract(
    State(state): State<AppState>,
    Json(request): Json<ContractActivation>,
) -> Result<(StatusCode, Json<Subscription>), AppError> {
    let subscription = state.engine.lifecycle.activate(&request, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

#[tracing::instrument(skip(state))]
pub async fn contract_ended(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
) -> Result<Json<ContractEndedResponse>, AppError> {
    let subscription = state
        .engine
        .lifecycle
        .on_contract_ended(contract_id, Utc::now())
        .await?;
    Ok(Json(ContractEndedResponse {
        contract_id,
        subscription,
    }))
}
