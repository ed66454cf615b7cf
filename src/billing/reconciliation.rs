use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::adapters::{BillingProviderAdapter, ProviderSubscription};
use super::catalog::{Tier, TierCatalog};
use super::error::ProcessError;
use super::models::{BillingEvent, BillingEventKind, SubscriptionStatus};
use super::subscriptions::{SkipReason, SubscriptionStore, SubscriptionWrite, WriteOutcome};

/// What happened to one billing event. Every variant is a successful
/// processing result; transient faults are [`ProcessError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ProcessOutcome {
    Applied {
        tier: Tier,
        /// Set when the price had no tier mapping and the user was degraded to free.
        unmapped_price: Option<String>,
    },
    Skipped {
        reason: SkipReason,
    },
    /// Recognised but deliberately not acted on.
    Ignored,
    /// Not actionable; redelivery would not help.
    Discarded {
        reason: String,
    },
}

/// Subscription state an event asks us to mirror.
struct Snapshot {
    subscription_id: String,
    customer_id: Option<String>,
    price_id: Option<String>,
    status: Option<SubscriptionStatus>,
    current_period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    user_id: Option<String>,
}

impl From<ProviderSubscription> for Snapshot {
    fn from(value: ProviderSubscription) -> Self {
        Self {
            subscription_id: value.id,
            customer_id: value.customer_id,
            price_id: value.price_id,
            status: value.status,
            current_period_end: value.current_period_end,
            cancel_at_period_end: value.cancel_at_period_end,
            user_id: value.user_id,
        }
    }
}

impl Snapshot {
    /// Live and not winding down; only such a subscription may replace the
    /// one a user record currently tracks.
    fn is_live(&self) -> bool {
        let running = self.status.map_or(true, |status| {
            matches!(status, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
        });
        running && !self.cancel_at_period_end
    }
}

/// key: billing-reconciliation -> billing events to subscription record transitions
#[derive(Clone)]
pub struct BillingEventProcessor {
    catalog: Arc<TierCatalog>,
    subscriptions: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProviderAdapter>,
}

impl BillingEventProcessor {
    pub fn new(
        catalog: Arc<TierCatalog>,
        subscriptions: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProviderAdapter>,
    ) -> Self {
        Self {
            catalog,
            subscriptions,
            provider,
        }
    }

    pub async fn process(&self, event: BillingEvent) -> Result<ProcessOutcome, ProcessError> {
        let outcome = match event.kind {
            BillingEventKind::PaymentFailed => {
                warn!(
                    event_id = %event.id,
                    user_id = ?event.user_id,
                    subscription = ?event.subscription_id,
                    "payment failed; tier unchanged until the provider cancels"
                );
                Ok(ProcessOutcome::Ignored)
            }
            BillingEventKind::SubscriptionCreated | BillingEventKind::SubscriptionUpdated => {
                match snapshot_from_event(&event) {
                    Some(snapshot) => self.mirror(&event, snapshot).await,
                    None => Ok(discard(&event, "subscription id missing")),
                }
            }
            BillingEventKind::SubscriptionDeleted => match event.subscription_id.clone() {
                Some(subscription_id) => {
                    let Some(user_id) = event.user_id.clone() else {
                        return Ok(discard(&event, "user_id metadata missing"));
                    };
                    self.downgrade(&event, user_id, subscription_id, event.customer_id.clone())
                        .await
                }
                None => Ok(discard(&event, "subscription id missing")),
            },
            BillingEventKind::PaymentSucceeded => self.refresh(&event).await,
        };

        match &outcome {
            Ok(result) => {
                info!(event_id = %event.id, kind = ?event.kind, ?result, "billing event processed")
            }
            Err(err) => error!(
                event_id = %event.id,
                kind = ?event.kind,
                ?err,
                "billing event failed; awaiting redelivery"
            ),
        }
        outcome
    }

    /// Payment success can carry a renewal or plan change that only the
    /// provider's current subscription state reflects.
    async fn refresh(&self, event: &BillingEvent) -> Result<ProcessOutcome, ProcessError> {
        let Some(subscription_id) = event.subscription_id.as_deref() else {
            return Ok(discard(event, "invoice is not tied to a subscription"));
        };
        let current = self.provider.retrieve_subscription(subscription_id).await?;
        let mut snapshot = Snapshot::from(current);
        if snapshot.user_id.is_none() {
            snapshot.user_id = event.user_id.clone();
        }
        self.mirror(event, snapshot).await
    }

    async fn mirror(
        &self,
        event: &BillingEvent,
        snapshot: Snapshot,
    ) -> Result<ProcessOutcome, ProcessError> {
        let Some(user_id) = snapshot.user_id.clone().or_else(|| event.user_id.clone()) else {
            return Ok(discard(event, "user_id metadata missing"));
        };

        if snapshot.status.map_or(false, |status| status.is_terminal()) {
            return self
                .downgrade(event, user_id, snapshot.subscription_id, snapshot.customer_id)
                .await;
        }

        let takes_over = event.kind == BillingEventKind::SubscriptionCreated || snapshot.is_live();
        let require_subscription = if takes_over {
            None
        } else {
            Some(snapshot.subscription_id.clone())
        };

        let Some(price_id) = snapshot.price_id else {
            return Ok(discard(event, "price id missing"));
        };

        let (tier, unmapped_price) = match self.catalog.resolve_price(&price_id) {
            Some(tier) => (tier, None),
            None => {
                warn!(
                    event_id = %event.id,
                    %user_id,
                    price_id = %price_id,
                    "price has no tier mapping; degrading to free"
                );
                (self.catalog.tier_for_price(&price_id), Some(price_id))
            }
        };

        let write = SubscriptionWrite {
            user_id,
            tier,
            billing_customer_id: snapshot.customer_id,
            billing_subscription_id: Some(snapshot.subscription_id),
            current_period_end: snapshot.current_period_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
            event_id: event.id.clone(),
            occurred_at: event.occurred_at,
            require_subscription,
        };

        Ok(match self.subscriptions.apply_if_newer(write).await? {
            WriteOutcome::Applied(record) => ProcessOutcome::Applied {
                tier: record.tier,
                unmapped_price,
            },
            WriteOutcome::Skipped(reason) => ProcessOutcome::Skipped { reason },
        })
    }

    async fn downgrade(
        &self,
        event: &BillingEvent,
        user_id: String,
        subscription_id: String,
        customer_id: Option<String>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let write = SubscriptionWrite {
            user_id,
            tier: Tier::Free,
            billing_customer_id: customer_id,
            billing_subscription_id: None,
            current_period_end: None,
            cancel_at_period_end: false,
            event_id: event.id.clone(),
            occurred_at: event.occurred_at,
            require_subscription: Some(subscription_id),
        };

        Ok(match self.subscriptions.apply_if_newer(write).await? {
            WriteOutcome::Applied(record) => ProcessOutcome::Applied {
                tier: record.tier,
                unmapped_price: None,
            },
            WriteOutcome::Skipped(reason) => ProcessOutcome::Skipped { reason },
        })
    }
}

fn snapshot_from_event(event: &BillingEvent) -> Option<Snapshot> {
    Some(Snapshot {
        subscription_id: event.subscription_id.clone()?,
        customer_id: event.customer_id.clone(),
        price_id: event.price_id.clone(),
        status: event.status,
        current_period_end: event.current_period_end,
        cancel_at_period_end: event.cancel_at_period_end,
        user_id: event.user_id.clone(),
    })
}

fn discard(event: &BillingEvent, reason: &str) -> ProcessOutcome {
    warn!(
        event_id = %event.id,
        kind = ?event.kind,
        reason,
        "billing event not actionable; discarding"
    );
    ProcessOutcome::Discarded {
        reason: reason.to_string(),
    }
}
