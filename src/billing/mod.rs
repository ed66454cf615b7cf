pub mod adapters;
pub mod api;
pub mod catalog;
pub mod error;
pub mod models;
pub mod notify;
pub mod reconciliation;
pub mod service;
pub mod subscriptions;
pub mod usage;
pub mod webhook;
pub mod window;

pub use adapters::{BillingProviderAdapter, ProviderSubscription, StripeLikeAdapter};
pub use api::{
    attempt_usage as billing_attempt_usage, get_subscription as billing_get_subscription,
    list_tiers as billing_list_tiers, stream_usage as billing_stream_usage,
    usage_status as billing_usage_status, TierListing,
};
pub use catalog::{
    PeriodLength, Quota, ResetPolicy, Tier, TierCatalog, TierDefinition, ToolKey, ToolLimits,
};
pub use error::{ProcessError, ProviderError, StoreError};
pub use models::{
    AdmissionOutcome, BillingEvent, BillingEventKind, DenialReason, SubscriptionRecord,
    SubscriptionStatus, UsageChanged, UsageCounter, UsageStatus,
};
pub use notify::UsageNotifier;
pub use reconciliation::{BillingEventProcessor, ProcessOutcome};
pub use service::UsageEvaluator;
pub use subscriptions::{
    MemorySubscriptionStore, PgSubscriptionStore, SkipReason, SubscriptionStore,
    SubscriptionWrite, WriteOutcome,
};
pub use usage::{IncrementOutcome, MemoryUsageStore, PgUsageStore, UsageStore};
pub use webhook::{parse_event, MalformedEvent, SignatureError, WebhookVerifier};
