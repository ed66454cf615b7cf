use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::catalog::{Quota, Tier, TierCatalog, ToolKey, ToolLimits};
use super::error::StoreError;
use super::models::{
    AdmissionOutcome, DenialReason, SubscriptionRecord, UsageChanged, UsageStatus,
};
use super::notify::UsageNotifier;
use super::subscriptions::SubscriptionStore;
use super::usage::UsageStore;
use super::window::{self, Evaluation};

/// key: usage-evaluator -> admission decisions and quota displays
#[derive(Clone)]
pub struct UsageEvaluator {
    catalog: Arc<TierCatalog>,
    usage: Arc<dyn UsageStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    notifier: UsageNotifier,
    store_timeout: StdDuration,
    expiry_grace: Duration,
}

enum Resolved {
    Unlimited(Tier),
    Limited {
        tier: Tier,
        limit: u32,
        limits: ToolLimits,
    },
}

impl UsageEvaluator {
    pub fn new(
        catalog: Arc<TierCatalog>,
        usage: Arc<dyn UsageStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        notifier: UsageNotifier,
    ) -> Self {
        Self {
            catalog,
            usage,
            subscriptions,
            notifier,
            store_timeout: StdDuration::from_secs(2),
            expiry_grace: Duration::hours(72),
        }
    }

    pub fn with_store_timeout(mut self, timeout: StdDuration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_expiry_grace(mut self, grace: Duration) -> Self {
        self.expiry_grace = grace;
        self
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// The user's record, or a free default when none was ever written.
    pub async fn subscription(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError> {
        let record = self.guarded(self.subscriptions.get(user_id)).await?;
        Ok(record.unwrap_or_else(|| SubscriptionRecord::free(user_id, now)))
    }

    pub async fn current_tier(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Tier, StoreError> {
        let record = self.subscription(user_id, now).await?;
        Ok(record.effective_tier(now, self.expiry_grace))
    }

    /// Read-only status; never consumes quota.
    pub async fn can_perform(
        &self,
        user_id: &str,
        tool: &ToolKey,
        now: DateTime<Utc>,
    ) -> UsageStatus {
        let (tier, limit, limits) = match self.resolve(user_id, tool, now).await {
            Ok(Resolved::Unlimited(tier)) => return UsageStatus::unlimited(tool, tier),
            Ok(Resolved::Limited { tier, limit, limits }) => (tier, limit, limits),
            Err(status) => return status,
        };

        match self.guarded(self.usage.get(user_id, tool, now)).await {
            Ok(counter) => {
                let evaluation = window::evaluate(&counter, limit, limits.reset, now);
                limited_status(tool, tier, limit, &evaluation)
            }
            Err(err) => {
                warn!(?err, %user_id, %tool, "usage read failed; reporting as unavailable");
                store_unavailable(tool, Some(tier))
            }
        }
    }

    /// Admission and consumption in one step. Callers perform the gated action
    /// only when `admitted` is true, and call this once per action.
    pub async fn attempt(
        &self,
        user_id: &str,
        tool: &ToolKey,
        now: DateTime<Utc>,
    ) -> AdmissionOutcome {
        let (tier, limit, limits) = match self.resolve(user_id, tool, now).await {
            Ok(Resolved::Unlimited(tier)) => {
                debug!(%user_id, %tool, %tier, "unlimited tier admitted without counting");
                return AdmissionOutcome {
                    admitted: true,
                    status: UsageStatus::unlimited(tool, tier),
                };
            }
            Ok(Resolved::Limited { tier, limit, limits }) => (tier, limit, limits),
            Err(status) => {
                return AdmissionOutcome {
                    admitted: false,
                    status,
                }
            }
        };

        let outcome = match self
            .guarded(
                self.usage
                    .try_increment_if_under_limit(user_id, tool, limit, limits.reset, now),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(?err, %user_id, %tool, "usage increment failed; denying");
                return AdmissionOutcome {
                    admitted: false,
                    status: store_unavailable(tool, Some(tier)),
                };
            }
        };

        let evaluation = window::evaluate(&outcome.counter, limit, limits.reset, now);
        let mut status = limited_status(tool, tier, limit, &evaluation);

        if outcome.admitted {
            // `allowed` now speaks for the next attempt; nothing refused this one.
            status.reason = None;
            info!(
                %user_id,
                %tool,
                %tier,
                used = outcome.counter.count,
                limit,
                "usage admitted"
            );
            self.notifier.publish(UsageChanged {
                user_id: user_id.to_string(),
                tool: tool.clone(),
                used: status.used,
                remaining: status.remaining,
                reset_at: status.reset_at,
                at: now,
            });
        } else {
            // The stored counter is unchanged; report why this attempt was refused.
            status.allowed = false;
            status.can_generate_now = false;
            if status.reason.is_none() {
                status.reason = Some(DenialReason::QuotaExhausted);
            }
            info!(%user_id, %tool, %tier, reason = ?status.reason, "usage denied");
        }

        AdmissionOutcome {
            admitted: outcome.admitted,
            status,
        }
    }

    async fn resolve(
        &self,
        user_id: &str,
        tool: &ToolKey,
        now: DateTime<Utc>,
    ) -> Result<Resolved, UsageStatus> {
        let tier = match self.current_tier(user_id, now).await {
            Ok(tier) => tier,
            Err(err) => {
                warn!(?err, %user_id, %tool, "subscription lookup failed; failing closed");
                return Err(store_unavailable(tool, None));
            }
        };

        let Some(limits) = self.catalog.limits_for(tier, tool.as_str()) else {
            return Err(UsageStatus::denied(
                tool,
                Some(tier),
                DenialReason::ToolNotMetered,
                format!("billing:tool-not-metered:{tool}"),
            ));
        };

        Ok(match limits.quota {
            Quota::Unlimited => Resolved::Unlimited(tier),
            Quota::Limited(limit) => Resolved::Limited { tier, limit, limits },
        })
    }

    async fn guarded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.store_timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }
}

fn store_unavailable(tool: &ToolKey, tier: Option<Tier>) -> UsageStatus {
    UsageStatus::denied(
        tool,
        tier,
        DenialReason::StoreUnavailable,
        "billing:store-unavailable".to_string(),
    )
}

fn limited_status(tool: &ToolKey, tier: Tier, limit: u32, evaluation: &Evaluation) -> UsageStatus {
    let used = evaluation.counter.count;
    let allowed = evaluation.can_use_now();
    let reason = evaluation.denial();

    let mut notes = vec![format!("billing:quota:{tool}:{used}/{limit}")];
    match reason {
        Some(DenialReason::QuotaExhausted) => notes.push(format!("billing:quota-exceeded:{tool}")),
        Some(DenialReason::CooldownActive) => notes.push(format!("billing:cooldown:{tool}")),
        _ => {}
    }

    UsageStatus {
        tool: tool.clone(),
        tier: Some(tier),
        allowed,
        used,
        limit: Quota::Limited(limit),
        remaining: Quota::Limited(evaluation.remaining),
        percentage: percentage(used, limit),
        reset_at: evaluation.reset_at,
        can_generate_now: allowed,
        reason,
        notes,
    }
}

fn percentage(used: u32, limit: u32) -> u32 {
    if limit == 0 {
        return 100;
    }
    let pct = u64::from(used) * 100 / u64::from(limit);
    pct.min(100) as u32
}
