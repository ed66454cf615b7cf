use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::AppResult;
use crate::extractor::AuthUser;

use super::{
    AdmissionOutcome, DenialReason, SubscriptionRecord, TierCatalog, TierDefinition, ToolKey,
    UsageEvaluator, UsageNotifier, UsageStatus,
};

/// key: billing-api -> entitlement query
pub async fn usage_status(
    Extension(evaluator): Extension<UsageEvaluator>,
    AuthUser { user_id, .. }: AuthUser,
    Path(tool): Path<String>,
) -> Json<UsageStatus> {
    let tool = ToolKey::new(tool);
    Json(evaluator.can_perform(&user_id, &tool, Utc::now()).await)
}

/// key: billing-api -> admission+consume, called once right before the gated action
pub async fn attempt_usage(
    Extension(evaluator): Extension<UsageEvaluator>,
    AuthUser { user_id, .. }: AuthUser,
    Path(tool): Path<String>,
) -> (StatusCode, Json<AdmissionOutcome>) {
    let tool = ToolKey::new(tool);
    let outcome = evaluator.attempt(&user_id, &tool, Utc::now()).await;
    let status = if outcome.admitted {
        StatusCode::OK
    } else {
        match outcome.status.reason {
            Some(DenialReason::StoreUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
            Some(DenialReason::ToolNotMetered) => StatusCode::FORBIDDEN,
            _ => StatusCode::TOO_MANY_REQUESTS,
        }
    };
    (status, Json(outcome))
}

pub async fn stream_usage(
    Extension(notifier): Extension<UsageNotifier>,
    AuthUser { user_id, .. }: AuthUser,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(notifier.subscribe()).filter_map(move |entry| {
        let user_id = user_id.clone();
        async move {
            match entry {
                Ok(change) if change.user_id == user_id => match Event::default()
                    .event("usage")
                    .json_data(&change)
                {
                    Ok(event) => Some(Ok(event)),
                    Err(err) => {
                        tracing::error!(?err, "failed to serialize usage change");
                        None
                    }
                },
                _ => None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn get_subscription(
    Extension(evaluator): Extension<UsageEvaluator>,
    AuthUser { user_id, .. }: AuthUser,
) -> AppResult<Json<SubscriptionRecord>> {
    let record = evaluator.subscription(&user_id, Utc::now()).await?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct TierListing {
    #[serde(flatten)]
    pub definition: TierDefinition,
    pub rank: u8,
}

pub async fn list_tiers(Extension(catalog): Extension<Arc<TierCatalog>>) -> Json<Vec<TierListing>> {
    let listing = catalog
        .tiers()
        .map(|definition| TierListing {
            rank: catalog.rank_of(definition.tier),
            definition: definition.clone(),
        })
        .collect();
    Json(listing)
}
