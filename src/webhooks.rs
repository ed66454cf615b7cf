use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use tracing::{info, warn};

use crate::billing::webhook::SIGNATURE_HEADER;
use crate::billing::{parse_event, BillingEventProcessor, ProcessOutcome, WebhookVerifier};
use crate::error::{AppError, AppResult};

/// key: webhooks-billing -> verify, parse, reconcile
///
/// A non-success status makes the provider redeliver, so only transient
/// faults map to 5xx; anything redelivery cannot fix is acknowledged.
pub async fn billing_webhook(
    Extension(verifier): Extension<WebhookVerifier>,
    Extension(processor): Extension<BillingEventProcessor>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<ProcessOutcome>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    verifier
        .verify(signature, &body, Utc::now())
        .map_err(|err| {
            warn!(%err, "rejecting billing webhook");
            AppError::BadRequest(err.to_string())
        })?;

    let event = match parse_event(&body) {
        Ok(Some(event)) => event,
        Ok(None) => return Ok((StatusCode::OK, Json(ProcessOutcome::Ignored))),
        Err(err) => {
            warn!(%err, "discarding unparseable billing webhook");
            return Ok((
                StatusCode::OK,
                Json(ProcessOutcome::Discarded {
                    reason: err.to_string(),
                }),
            ));
        }
    };

    info!(event_id = %event.id, kind = ?event.kind, "billing webhook received");
    match processor.process(event).await {
        Ok(outcome) => Ok((StatusCode::OK, Json(outcome))),
        Err(err) => Err(AppError::Message(format!("billing event processing failed: {err}"))),
    }
}
