//! Operator actions on mandates and subscriptions.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Mandate, PaymentInstance, Subscription};
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CancelMandateRequest {
    #[validate(length(min = 1, max = 500, message = "Reason must be 1-500 characters"))]
    pub reason: String,
}

#[tracing::instrument(skip(state))]
pub async fn get_mandate(
    State(state): State<AppState>,
    Path(mandate_id): Path<Uuid>,
) -> Result<Json<Mandate>, AppError> {
    Ok(Json(state.engine.mandates.get(mandate_id).await?))
}

#[tracing::instrument(skip(state, request))]
pub async fn cancel_mandate(
    State(state): State<AppState>,
    Path(mandate_id): Path<Uuid>,
    Json(request): Json<CancelMandateRequest>,
) -> Result<Json<Mandate>, AppError> {
    request.validate()?;
    let mandate = state
        .engine
        .mandates
        .cancel(mandate_id, &request.reason, Utc::now())
        .await?;
    Ok(Json(mandate))
}

#[tracing::instrument(skip(state))]
pub async fn reactivate_mandate(
    State(state): State<AppState>,
    Path(mandate_id): Path<Uuid>,
) -> Result<Json<Mandate>, AppError> {
    Ok(Json(
        state.engine.mandates.reactivate(mandate_id, Utc::now()).await?,
    ))
}

#[tracing::instrument(skip(state))]
pub async fn pause_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    Ok(Json(
        state
            .engine
            .lifecycle
            .pause_subscription(subscription_id, Utc::now())
            .await?,
    ))
}

#[tracing::instrument(skip(state))]
pub async fn resume_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    Ok(Json(
        state
            .engine
            .lifecycle
            .resume_subscription(subscription_id, Utc::now())
            .await?,
    ))
}

/// Payment history of a subscription, oldest period first.
#[tracing::instrument(skip(state))]
pub async fn list_subscription_payments(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentInstance>>, AppError> {
    if state.store.get_subscription(subscription_id).await?.is_none() {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "subscription {} not found",
            subscription_id
        )));
    }
    Ok(Json(
        state.store.payments_for_subscription(subscription_id).await?,
    ))
}
