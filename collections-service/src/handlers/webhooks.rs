use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use service_core::error::AppError;

use crate::engine::WebhookReport;
use crate::services::gateway::{verify_webhook_signature, WEBHOOK_SIGNATURE_HEADER};
use crate::services::WebhookEnvelope;
use crate::startup::AppState;

/// Receive a batch of gateway events.
///
/// Duplicates and unknown resources are acknowledged with 200. Any event that
/// failed on infrastructure yields a 500, and any event still claimed by
/// another delivery a 503, so the gateway redelivers the batch; events
/// already processed are skipped on redelivery.
#[tracing::instrument(skip_all)]
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookReport>, AppError> {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing webhook signature")))?;

    if !verify_webhook_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!("Rejected webhook with invalid signature");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook signature"
        )));
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload: {}", e)))?;

    let report = state.engine.process_webhook(&envelope, Utc::now()).await?;
    if report.failed > 0 {
        return Err(AppError::InternalError(anyhow::anyhow!(
            "{} of {} webhook events failed",
            report.failed,
            envelope.events.len()
        )));
    }
    if report.in_progress > 0 {
        tracing::info!(in_progress = report.in_progress, "Webhook events still being processed");
        return Err(AppError::ServiceUnavailable);
    }

    Ok(Json(report))
}
