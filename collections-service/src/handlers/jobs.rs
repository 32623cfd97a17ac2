//! Job triggers for the external scheduler. Every run is safe to repeat.

use axum::{extract::State, Json};
use chrono::Utc;
use service_core::error::AppError;

use crate::engine::{
    DunningReport, ExpiryReport, NotifyReport, ScheduleReport, SubmitReport, SyncReport,
};
use crate::startup::AppState;

#[tracing::instrument(skip(state))]
pub async fn run_schedule(State(state): State<AppState>) -> Result<Json<ScheduleReport>, AppError> {
    Ok(Json(state.engine.scheduler.run(Utc::now()).await?))
}

#[tracing::instrument(skip(state))]
pub async fn run_notify(State(state): State<AppState>) -> Result<Json<NotifyReport>, AppError> {
    Ok(Json(state.engine.compliance.run(Utc::now()).await?))
}

#[tracing::instrument(skip(state))]
pub async fn run_submit(State(state): State<AppState>) -> Result<Json<SubmitReport>, AppError> {
    Ok(Json(state.engine.payments.run_submissions(Utc::now()).await?))
}

#[tracing::instrument(skip(state))]
pub async fn run_dunning(State(state): State<AppState>) -> Result<Json<DunningReport>, AppError> {
    Ok(Json(state.engine.dunning.run(Utc::now()).await?))
}

#[tracing::instrument(skip(state))]
pub async fn run_expire_mandates(
    State(state): State<AppState>,
) -> Result<Json<ExpiryReport>, AppError> {
    Ok(Json(state.engine.mandates.expire_mandates(Utc::now()).await?))
}

#[tracing::instrument(skip(state))]
pub async fn run_sync_contracts(
    State(state): State<AppState>,
) -> Result<Json<SyncReport>, AppError> {
    Ok(Json(state.engine.lifecycle.sync_contracts(Utc::now()).await?))
}
