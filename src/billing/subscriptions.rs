use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::catalog::Tier;
use super::error::StoreError;
use super::models::SubscriptionRecord;

/// A record write derived from one billing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionWrite {
    pub user_id: String,
    pub tier: Tier,
    /// `None` keeps whatever customer id is already stored.
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    /// Apply only while the stored record tracks this subscription (or none).
    pub require_subscription: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// Not newer than the event the record already reflects.
    Stale,
    /// The same event was already applied.
    Duplicate,
    /// The user has since moved to a different subscription.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied(SubscriptionRecord),
    Skipped(SkipReason),
}

/// key: subscription-store -> per-user record with timestamp-conditioned writes
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, StoreError>;

    /// Write unless the stored record is as new or newer, already reflects this
    /// event, or tracks a different subscription than `require_subscription`.
    async fn apply_if_newer(&self, write: SubscriptionWrite) -> Result<WriteOutcome, StoreError>;
}

/// Ordering rule shared by every store implementation.
pub fn check_write(existing: &SubscriptionRecord, write: &SubscriptionWrite) -> Option<SkipReason> {
    if existing.last_event_id.as_deref() == Some(write.event_id.as_str()) {
        return Some(SkipReason::Duplicate);
    }
    // Provider timestamps are whole seconds, so a tie is not proof of order.
    if write.occurred_at <= existing.updated_at {
        return Some(SkipReason::Stale);
    }
    match (&write.require_subscription, &existing.billing_subscription_id) {
        (Some(required), Some(current)) if required != current => Some(SkipReason::Superseded),
        _ => None,
    }
}

fn merged(existing: Option<&SubscriptionRecord>, write: SubscriptionWrite) -> SubscriptionRecord {
    SubscriptionRecord {
        billing_customer_id: write
            .billing_customer_id
            .or_else(|| existing.and_then(|record| record.billing_customer_id.clone())),
        user_id: write.user_id,
        tier: write.tier,
        billing_subscription_id: write.billing_subscription_id,
        current_period_end: write.current_period_end,
        cancel_at_period_end: write.cancel_at_period_end,
        updated_at: write.occurred_at,
        last_event_id: Some(write.event_id),
    }
}

#[derive(Clone, Default)]
pub struct MemorySubscriptionStore {
    records: Arc<DashMap<String, SubscriptionRecord>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        Ok(self.records.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn apply_if_newer(&self, write: SubscriptionWrite) -> Result<WriteOutcome, StoreError> {
        match self.records.entry(write.user_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(reason) = check_write(occupied.get(), &write) {
                    return Ok(WriteOutcome::Skipped(reason));
                }
                let record = merged(Some(occupied.get()), write);
                occupied.insert(record.clone());
                Ok(WriteOutcome::Applied(record))
            }
            Entry::Vacant(vacant) => {
                let record = merged(None, write);
                vacant.insert(record.clone());
                Ok(WriteOutcome::Applied(record))
            }
        }
    }
}

/// key: subscription-store-postgres -> conditional upsert keyed by user
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                user_id,
                tier,
                billing_customer_id,
                billing_subscription_id,
                current_period_end,
                cancel_at_period_end,
                updated_at,
                last_event_id
            FROM subscription_records
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row))
    }

    async fn apply_if_newer(&self, write: SubscriptionWrite) -> Result<WriteOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO subscription_records (
                user_id,
                tier,
                billing_customer_id,
                billing_subscription_id,
                current_period_end,
                cancel_at_period_end,
                updated_at,
                last_event_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id)
            DO UPDATE SET
                tier = EXCLUDED.tier,
                billing_customer_id = COALESCE(
                    EXCLUDED.billing_customer_id,
                    subscription_records.billing_customer_id
                ),
                billing_subscription_id = EXCLUDED.billing_subscription_id,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_at = EXCLUDED.updated_at,
                last_event_id = EXCLUDED.last_event_id,
                stored_at = NOW()
            WHERE subscription_records.last_event_id IS DISTINCT FROM EXCLUDED.last_event_id
              AND subscription_records.updated_at < EXCLUDED.updated_at
              AND (
                  $9::TEXT IS NULL
                  OR subscription_records.billing_subscription_id IS NULL
                  OR subscription_records.billing_subscription_id = $9
              )
            RETURNING
                user_id,
                tier,
                billing_customer_id,
                billing_subscription_id,
                current_period_end,
                cancel_at_period_end,
                updated_at,
                last_event_id
            "#,
        )
        .bind(&write.user_id)
        .bind(write.tier.as_str())
        .bind(&write.billing_customer_id)
        .bind(&write.billing_subscription_id)
        .bind(write.current_period_end)
        .bind(write.cancel_at_period_end)
        .bind(write.occurred_at)
        .bind(&write.event_id)
        .bind(&write.require_subscription)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(WriteOutcome::Applied(record_from_row(&row)));
        }

        // The conditional update declined; classify for the caller's logs.
        let reason = self
            .get(&write.user_id)
            .await?
            .and_then(|existing| check_write(&existing, &write))
            .unwrap_or(SkipReason::Stale);
        Ok(WriteOutcome::Skipped(reason))
    }
}

fn record_from_row(row: &PgRow) -> SubscriptionRecord {
    let tier: String = row.get("tier");
    SubscriptionRecord {
        user_id: row.get("user_id"),
        tier: Tier::from_stored(&tier),
        billing_customer_id: row.get("billing_customer_id"),
        billing_subscription_id: row.get("billing_subscription_id"),
        current_period_end: row.get("current_period_end"),
        cancel_at_period_end: row.get("cancel_at_period_end"),
        updated_at: row.get("updated_at"),
        last_event_id: row.get("last_event_id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn write(event_id: &str, occurred_at: DateTime<Utc>, tier: Tier) -> SubscriptionWrite {
        SubscriptionWrite {
            user_id: "u1".into(),
            tier,
            billing_customer_id: Some("cus_1".into()),
            billing_subscription_id: Some("sub_1".into()),
            current_period_end: None,
            cancel_at_period_end: false,
            event_id: event_id.into(),
            occurred_at,
            require_subscription: None,
        }
    }

    #[tokio::test]
    async fn equal_timestamp_from_another_event_is_stale() {
        let store = MemorySubscriptionStore::new();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        store.apply_if_newer(write("evt_a", t, Tier::Tier3)).await.unwrap();
        let outcome = store.apply_if_newer(write("evt_b", t, Tier::Tier1)).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Skipped(SkipReason::Stale));
        assert_eq!(store.get("u1").await.unwrap().unwrap().tier, Tier::Tier3);
    }

    #[tokio::test]
    async fn customer_id_survives_writes_without_one() {
        let store = MemorySubscriptionStore::new();
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        store.apply_if_newer(write("evt_a", t, Tier::Tier1)).await.unwrap();
        let mut next = write("evt_b", t + Duration::minutes(1), Tier::Free);
        next.billing_customer_id = None;
        store.apply_if_newer(next).await.unwrap();
        let record = store.get("u1").await.unwrap().unwrap();
        assert_eq!(record.billing_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(record.tier, Tier::Free);
    }

    #[test]
    fn check_write_orders_duplicate_before_stale() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let existing = merged(None, write("evt_a", t, Tier::Tier1));
        assert_eq!(
            check_write(&existing, &write("evt_a", t, Tier::Tier1)),
            Some(SkipReason::Duplicate)
        );
        assert_eq!(
            check_write(&existing, &write("evt_old", t - Duration::seconds(1), Tier::Tier3)),
            Some(SkipReason::Stale)
        );
        let mut other = write("evt_del", t + Duration::seconds(1), Tier::Free);
        other.require_subscription = Some("sub_0".into());
        assert_eq!(check_write(&existing, &other), Some(SkipReason::Superseded));
    }
}
