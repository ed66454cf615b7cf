use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use axum_prometheus::PrometheusMetricLayer;

use crate::auth::{self, IdentityVerifier};
use crate::billing::{
    self, BillingEventProcessor, TierCatalog, UsageEvaluator, UsageNotifier, WebhookVerifier,
};
use crate::webhooks;

/// Long-lived service objects, built once at bootstrap and handed to handlers.
#[derive(Clone)]
pub struct Services {
    pub catalog: Arc<TierCatalog>,
    pub evaluator: UsageEvaluator,
    pub notifier: UsageNotifier,
    pub processor: BillingEventProcessor,
    pub identity: Arc<dyn IdentityVerifier>,
    pub webhook_verifier: WebhookVerifier,
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/me", get(auth::current_user))
        .route("/api/tiers", get(billing::billing_list_tiers))
        .route("/api/subscription", get(billing::billing_get_subscription))
        .route("/api/usage/:tool", get(billing::billing_usage_status))
        .route("/api/usage/:tool/attempt", post(billing::billing_attempt_usage))
        .route("/api/events/usage", get(billing::billing_stream_usage))
        .route("/api/billing/webhook", post(webhooks::billing_webhook))
}

pub fn build_router(services: Services) -> Router {
    api_routes()
        .layer(Extension(services.catalog))
        .layer(Extension(services.evaluator))
        .layer(Extension(services.notifier))
        .layer(Extension(services.processor))
        .layer(Extension(services.identity))
        .layer(Extension(services.webhook_verifier))
}

pub async fn root() -> &'static str {
    "Tiergate API"
}

/// Full application: liveness, Prometheus scrape endpoint and the API.
/// Installs the global metrics recorder, so call it once per process.
pub fn build_app(services: Services) -> Router {
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    Router::new()
        .route("/", get(root))
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .merge(build_router(services))
        .layer(prometheus_layer)
}
