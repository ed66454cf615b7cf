use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::catalog::{Quota, Tier, ToolKey};

/// key: billing-usage-counter -> per (user, tool) usage in the current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub user_id: String,
    pub tool: ToolKey,
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl UsageCounter {
    /// Zero-valued counter anchored at `now`; what a user who never used the tool sees.
    pub fn fresh(user_id: &str, tool: &ToolKey, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            tool: tool.clone(),
            count: 0,
            window_start: now,
            last_used_at: None,
        }
    }
}

/// key: billing-subscription-record -> locally cached entitlement per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub tier: Tier,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    /// Provider timestamp of the last applied billing event.
    pub updated_at: DateTime<Utc>,
    pub last_event_id: Option<String>,
}

impl SubscriptionRecord {
    pub fn free(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            tier: Tier::Free,
            billing_customer_id: None,
            billing_subscription_id: None,
            current_period_end: None,
            cancel_at_period_end: false,
            updated_at: now,
            last_event_id: None,
        }
    }

    /// Tier to enforce at `now`. A paid period that ended more than `grace`
    /// ago without a renewal or deletion event reads as free.
    pub fn effective_tier(&self, now: DateTime<Utc>, grace: Duration) -> Tier {
        if self.tier == Tier::Free {
            return Tier::Free;
        }
        match self.current_period_end {
            Some(end) if end.checked_add_signed(grace).map_or(false, |cutoff| cutoff < now) => {
                Tier::Free
            }
            _ => self.tier,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BillingEventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PaymentSucceeded,
    PaymentFailed,
}

impl BillingEventKind {
    /// Map a provider event type; `None` for types this service does not act on.
    pub fn from_provider(event_type: &str) -> Option<Self> {
        match event_type {
            "customer.subscription.created" => Some(Self::SubscriptionCreated),
            "customer.subscription.updated" => Some(Self::SubscriptionUpdated),
            "customer.subscription.deleted" => Some(Self::SubscriptionDeleted),
            "invoice.payment_succeeded" | "invoice.paid" => Some(Self::PaymentSucceeded),
            "invoice.payment_failed" => Some(Self::PaymentFailed),
            _ => None,
        }
    }
}

/// Provider-side lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Canceled,
    Paused,
}

impl SubscriptionStatus {
    /// Terminal statuses are applied like a deletion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled
                | SubscriptionStatus::Unpaid
                | SubscriptionStatus::IncompleteExpired
        )
    }
}

/// key: billing-event -> normalized provider webhook message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: String,
    pub kind: BillingEventKind,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialReason {
    QuotaExhausted,
    CooldownActive,
    ToolNotMetered,
    StoreUnavailable,
}

/// key: billing-usage-status -> entitlement query response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub tool: ToolKey,
    /// `None` when the tier could not be resolved.
    pub tier: Option<Tier>,
    pub allowed: bool,
    pub used: u32,
    pub limit: Quota,
    pub remaining: Quota,
    pub percentage: u32,
    pub reset_at: Option<DateTime<Utc>>,
    pub can_generate_now: bool,
    pub reason: Option<DenialReason>,
    pub notes: Vec<String>,
}

impl UsageStatus {
    pub(crate) fn denied(
        tool: &ToolKey,
        tier: Option<Tier>,
        reason: DenialReason,
        note: String,
    ) -> Self {
        Self {
            tool: tool.clone(),
            tier,
            allowed: false,
            used: 0,
            limit: Quota::Limited(0),
            remaining: Quota::Limited(0),
            percentage: 100,
            reset_at: None,
            can_generate_now: false,
            reason: Some(reason),
            notes: vec![note],
        }
    }

    pub(crate) fn unlimited(tool: &ToolKey, tier: Tier) -> Self {
        Self {
            tool: tool.clone(),
            tier: Some(tier),
            allowed: true,
            used: 0,
            limit: Quota::Unlimited,
            remaining: Quota::Unlimited,
            percentage: 0,
            reset_at: None,
            can_generate_now: true,
            reason: None,
            notes: vec![format!("billing:quota:{tool}:unlimited")],
        }
    }
}

/// key: billing-admission -> result of an attempt; gate the action on `admitted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionOutcome {
    pub admitted: bool,
    /// Counter state after this attempt. On an admitted attempt `allowed` and
    /// `canGenerateNow` describe the next one, and `reason` is always empty.
    #[serde(flatten)]
    pub status: UsageStatus,
}

/// Published after an admitted attempt changes a counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageChanged {
    pub user_id: String,
    pub tool: ToolKey,
    pub used: u32,
    pub remaining: Quota,
    pub reset_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn paid_record(end: DateTime<Utc>) -> SubscriptionRecord {
        SubscriptionRecord {
            tier: Tier::Tier2,
            current_period_end: Some(end),
            billing_subscription_id: Some("sub_1".into()),
            ..SubscriptionRecord::free("u1", end)
        }
    }

    #[test]
    fn lapsed_period_reads_as_free_after_grace() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let record = paid_record(end);
        let grace = Duration::hours(72);
        assert_eq!(record.effective_tier(end + Duration::hours(71), grace), Tier::Tier2);
        assert_eq!(record.effective_tier(end + Duration::hours(73), grace), Tier::Free);
    }

    #[test]
    fn provider_event_types_map_to_kinds() {
        assert_eq!(
            BillingEventKind::from_provider("invoice.paid"),
            Some(BillingEventKind::PaymentSucceeded)
        );
        assert_eq!(BillingEventKind::from_provider("charge.refunded"), None);
    }

    #[test]
    fn status_serializes_limits() {
        let status = UsageStatus::unlimited(&ToolKey::new("articles"), Tier::Unrestricted);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["limit"], "unlimited");
        assert_eq!(value["canGenerateNow"], true);
        assert_eq!(value["tier"], "unrestricted");
    }
}
