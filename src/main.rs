use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use tiergate::auth::{IdentityVerifier, JwtIdentityVerifier};
use tiergate::billing::{
    BillingEventProcessor, BillingProviderAdapter, PgSubscriptionStore, PgUsageStore,
    StripeLikeAdapter, SubscriptionStore, UsageEvaluator, UsageNotifier, UsageStore,
    WebhookVerifier,
};
use tiergate::config;
use tiergate::routes::{build_app, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let jwt_secret = config::JWT_SECRET.as_str();
    let webhook_secret = config::BILLING_WEBHOOK_SECRET
        .clone()
        .context("BILLING_WEBHOOK_SECRET or BILLING_WEBHOOK_SECRET_FILE must be set")?;
    let catalog = Arc::new(config::load_tier_catalog()?);

    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .acquire_timeout(*config::STORE_TIMEOUT)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to Postgres")?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error.into());
        }
    }

    let usage: Arc<dyn UsageStore> = Arc::new(PgUsageStore::new(pool.clone()));
    let subscriptions: Arc<dyn SubscriptionStore> =
        Arc::new(PgSubscriptionStore::new(pool.clone()));
    let notifier = UsageNotifier::default();
    let evaluator = UsageEvaluator::new(
        catalog.clone(),
        usage,
        subscriptions.clone(),
        notifier.clone(),
    )
    .with_store_timeout(*config::STORE_TIMEOUT)
    .with_expiry_grace(*config::SUBSCRIPTION_EXPIRY_GRACE);

    let provider: Arc<dyn BillingProviderAdapter> = Arc::new(StripeLikeAdapter::new(
        config::BILLING_PROVIDER_API_BASE.as_str(),
        config::BILLING_PROVIDER_API_KEY.clone(),
        std::time::Duration::from_secs(10),
    )?);
    let processor = BillingEventProcessor::new(catalog.clone(), subscriptions, provider);
    let identity: Arc<dyn IdentityVerifier> = Arc::new(JwtIdentityVerifier::new(jwt_secret));
    let webhook_verifier =
        WebhookVerifier::new(webhook_secret.into_bytes(), *config::BILLING_WEBHOOK_TOLERANCE);

    let services = Services {
        catalog,
        evaluator,
        notifier,
        processor,
        identity,
        webhook_verifier,
    };

    let app = build_app(services);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
