use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::catalog::{ResetPolicy, ToolKey};
use super::error::StoreError;
use super::models::UsageCounter;
use super::window;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementOutcome {
    pub admitted: bool,
    pub counter: UsageCounter,
}

/// key: usage-store -> per (user, tool) counters with an atomic admit-and-increment
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Current counter, or a zero counter anchored at `now` if none was ever written.
    async fn get(
        &self,
        user_id: &str,
        tool: &ToolKey,
        now: DateTime<Utc>,
    ) -> Result<UsageCounter, StoreError>;

    /// Read, roll the window forward, compare against `limit` and increment,
    /// as one indivisible operation.
    async fn try_increment_if_under_limit(
        &self,
        user_id: &str,
        tool: &ToolKey,
        limit: u32,
        reset: ResetPolicy,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError>;
}

/// Counters held in process memory. Each increment runs under the map's
/// per-key write lock.
#[derive(Clone, Default)]
pub struct MemoryUsageStore {
    counters: Arc<DashMap<(String, ToolKey), UsageCounter>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get(
        &self,
        user_id: &str,
        tool: &ToolKey,
        now: DateTime<Utc>,
    ) -> Result<UsageCounter, StoreError> {
        let key = (user_id.to_string(), tool.clone());
        Ok(self
            .counters
            .get(&key)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| UsageCounter::fresh(user_id, tool, now)))
    }

    async fn try_increment_if_under_limit(
        &self,
        user_id: &str,
        tool: &ToolKey,
        limit: u32,
        reset: ResetPolicy,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError> {
        let mut entry = self
            .counters
            .entry((user_id.to_string(), tool.clone()))
            .or_insert_with(|| UsageCounter::fresh(user_id, tool, now));
        let (admitted, next) = window::admit(entry.value(), limit, reset, now);
        *entry.value_mut() = next.clone();
        Ok(IncrementOutcome {
            admitted,
            counter: next,
        })
    }
}

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// key: usage-store-postgres -> row-locked read-modify-write in one transaction
#[derive(Clone)]
pub struct PgUsageStore {
    pool: PgPool,
    max_attempts: u32,
}

impl PgUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: 5,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn increment_once(
        &self,
        user_id: &str,
        tool: &ToolKey,
        limit: u32,
        reset: ResetPolicy,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO usage_counters (user_id, tool, count, window_start, last_used_at)
            VALUES ($1, $2, 0, $3, NULL)
            ON CONFLICT (user_id, tool) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(tool.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT user_id, tool, count, window_start, last_used_at
            FROM usage_counters
            WHERE user_id = $1 AND tool = $2
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(tool.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let current = counter_from_row(&row);
        let (admitted, next) = window::admit(&current, limit, reset, now);

        if next != current {
            sqlx::query(
                r#"
                UPDATE usage_counters
                SET count = $3,
                    window_start = $4,
                    last_used_at = $5,
                    updated_at = NOW()
                WHERE user_id = $1 AND tool = $2
                "#,
            )
            .bind(user_id)
            .bind(tool.as_str())
            .bind(i32::try_from(next.count).unwrap_or(i32::MAX))
            .bind(next.window_start)
            .bind(next.last_used_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(IncrementOutcome {
            admitted,
            counter: next,
        })
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn get(
        &self,
        user_id: &str,
        tool: &ToolKey,
        now: DateTime<Utc>,
    ) -> Result<UsageCounter, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, tool, count, window_start, last_used_at
            FROM usage_counters
            WHERE user_id = $1 AND tool = $2
            "#,
        )
        .bind(user_id)
        .bind(tool.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .as_ref()
            .map(counter_from_row)
            .unwrap_or_else(|| UsageCounter::fresh(user_id, tool, now)))
    }

    async fn try_increment_if_under_limit(
        &self,
        user_id: &str,
        tool: &ToolKey,
        limit: u32,
        reset: ResetPolicy,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.increment_once(user_id, tool, limit, reset, now).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_conflict(&err) => {
                    if attempt >= self.max_attempts {
                        return Err(StoreError::Conflict { attempts: attempt });
                    }
                    debug!(%user_id, %tool, attempt, "usage increment conflicted; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn is_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
        ),
        _ => false,
    }
}

fn counter_from_row(row: &PgRow) -> UsageCounter {
    let count: i32 = row.get("count");
    let tool: String = row.get("tool");
    UsageCounter {
        user_id: row.get("user_id"),
        tool: ToolKey::new(tool),
        count: u32::try_from(count).unwrap_or(0),
        window_start: row.get("window_start"),
        last_used_at: row.get("last_used_at"),
    }
}
