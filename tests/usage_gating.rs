use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tiergate::billing::{
    DenialReason, IncrementOutcome, MemorySubscriptionStore, MemoryUsageStore, Quota,
    ResetPolicy, StoreError, SubscriptionStore, SubscriptionWrite, Tier, TierCatalog, ToolKey,
    UsageCounter, UsageEvaluator, UsageNotifier, UsageStore, WriteOutcome,
};

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, day, hour, minute, 0).unwrap()
}

fn articles() -> ToolKey {
    ToolKey::new("articles")
}

struct Harness {
    evaluator: UsageEvaluator,
    subscriptions: Arc<MemorySubscriptionStore>,
    notifier: UsageNotifier,
}

fn harness() -> Harness {
    let subscriptions = Arc::new(MemorySubscriptionStore::new());
    let notifier = UsageNotifier::default();
    let evaluator = UsageEvaluator::new(
        Arc::new(TierCatalog::default()),
        Arc::new(MemoryUsageStore::new()),
        subscriptions.clone(),
        notifier.clone(),
    );
    Harness {
        evaluator,
        subscriptions,
        notifier,
    }
}

async fn subscribe(
    store: &MemorySubscriptionStore,
    user_id: &str,
    tier: Tier,
    period_end: DateTime<Utc>,
) {
    let outcome = store
        .apply_if_newer(SubscriptionWrite {
            user_id: user_id.to_string(),
            tier,
            billing_customer_id: Some("cus_1".into()),
            billing_subscription_id: Some("sub_1".into()),
            current_period_end: Some(period_end),
            cancel_at_period_end: false,
            event_id: format!("evt_{user_id}"),
            occurred_at: at(1, 0, 0),
            require_subscription: None,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Applied(_)));
}

#[tokio::test]
async fn free_tier_rolls_over_after_a_full_day() {
    let h = harness();
    let tool = articles();

    let first = h.evaluator.attempt("reader", &tool, at(10, 12, 0)).await;
    assert!(first.admitted);
    assert_eq!(first.status.tier, Some(Tier::Free));
    assert_eq!(first.status.used, 1);
    assert_eq!(first.status.remaining, Quota::Limited(0));
    assert!(!first.status.can_generate_now);
    assert_eq!(first.status.reason, None);

    let almost = h.evaluator.can_perform("reader", &tool, at(11, 11, 59)).await;
    assert!(!almost.can_generate_now);
    assert_eq!(almost.reset_at, Some(at(11, 12, 0)));
    assert!(almost.notes.contains(&"billing:cooldown:articles".to_string()));

    let refused = h.evaluator.attempt("reader", &tool, at(11, 11, 59)).await;
    assert!(!refused.admitted);

    let next_day = h.evaluator.attempt("reader", &tool, at(11, 12, 0)).await;
    assert!(next_day.admitted);
    assert_eq!(next_day.status.used, 1);
}

#[tokio::test]
async fn monthly_quota_blocks_the_sixteenth_article() {
    let h = harness();
    subscribe(&h.subscriptions, "writer", Tier::Tier1, at(31, 0, 0) + Duration::days(60)).await;
    let tool = articles();
    let start = at(10, 9, 0);

    for n in 1..=15u32 {
        let outcome = h
            .evaluator
            .attempt("writer", &tool, start + Duration::minutes(i64::from(n)))
            .await;
        assert!(outcome.admitted, "attempt {n}");
        assert_eq!(outcome.status.used, n);
    }

    let denied = h.evaluator.attempt("writer", &tool, start + Duration::hours(2)).await;
    assert!(!denied.admitted);
    assert_eq!(denied.status.remaining, Quota::Limited(0));
    assert_eq!(denied.status.percentage, 100);
    assert_eq!(denied.status.reason, Some(DenialReason::QuotaExhausted));
    assert!(denied
        .status
        .notes
        .contains(&"billing:quota-exceeded:articles".to_string()));

    let status = h.evaluator.can_perform("writer", &tool, start + Duration::hours(3)).await;
    assert_eq!(status.used, 15);
    assert!(!status.allowed);

    let next_period = Utc.with_ymd_and_hms(2025, 2, 10, 9, 1, 0).unwrap();
    let renewed = h.evaluator.attempt("writer", &tool, next_period).await;
    assert!(renewed.admitted);
    assert_eq!(renewed.status.used, 1);
    assert_eq!(renewed.status.remaining, Quota::Limited(14));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_never_exceed_the_limit() {
    let h = harness();
    subscribe(&h.subscriptions, "burst", Tier::Tier1, at(31, 0, 0)).await;
    let now = at(10, 9, 0);

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let evaluator = h.evaluator.clone();
            tokio::spawn(async move {
                evaluator.attempt("burst", &articles(), now).await.admitted
            })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 15);

    let status = h.evaluator.can_perform("burst", &articles(), now).await;
    assert_eq!(status.used, 15);
}

#[tokio::test]
async fn unrestricted_tier_is_never_counted() {
    let h = harness();
    subscribe(&h.subscriptions, "vip", Tier::Unrestricted, at(31, 0, 0)).await;

    for minute in 0..200 {
        let now = at(10, 9, 0) + Duration::seconds(minute);
        let outcome = h.evaluator.attempt("vip", &articles(), now).await;
        assert!(outcome.admitted);
        assert_eq!(outcome.status.limit, Quota::Unlimited);
        assert_eq!(outcome.status.used, 0);
    }
}

#[tokio::test]
async fn checking_status_does_not_consume() {
    let h = harness();
    for _ in 0..5 {
        let status = h.evaluator.can_perform("reader", &articles(), at(10, 9, 0)).await;
        assert!(status.allowed);
        assert_eq!(status.used, 0);
        assert_eq!(status.limit, Quota::Limited(1));
        assert_eq!(status.reset_at, None);
    }
    assert!(h.evaluator.attempt("reader", &articles(), at(10, 9, 0)).await.admitted);
}

#[tokio::test]
async fn unmetered_tool_is_denied() {
    let h = harness();
    let outcome = h.evaluator.attempt("reader", &ToolKey::new("Videos"), at(10, 9, 0)).await;
    assert!(!outcome.admitted);
    assert_eq!(outcome.status.reason, Some(DenialReason::ToolNotMetered));
    assert_eq!(outcome.status.notes, vec!["billing:tool-not-metered:videos".to_string()]);
}

#[tokio::test]
async fn lapsed_subscription_falls_back_to_free() {
    let h = harness();
    subscribe(&h.subscriptions, "lapsed", Tier::Tier2, at(5, 0, 0)).await;

    assert_eq!(h.evaluator.current_tier("lapsed", at(7, 0, 0)).await.unwrap(), Tier::Tier2);
    assert_eq!(h.evaluator.current_tier("lapsed", at(8, 0, 1)).await.unwrap(), Tier::Free);

    let status = h.evaluator.can_perform("lapsed", &articles(), at(9, 0, 0)).await;
    assert_eq!(status.tier, Some(Tier::Free));
    assert_eq!(status.limit, Quota::Limited(1));
}

#[tokio::test]
async fn admitted_attempts_are_broadcast() {
    let h = harness();
    let mut receiver = h.notifier.subscribe();

    assert!(h.evaluator.attempt("reader", &articles(), at(10, 9, 0)).await.admitted);
    let change = receiver.recv().await.unwrap();
    assert_eq!(change.user_id, "reader");
    assert_eq!(change.used, 1);
    assert_eq!(change.remaining, Quota::Limited(0));

    assert!(!h.evaluator.attempt("reader", &articles(), at(10, 9, 1)).await.admitted);
    assert!(receiver.try_recv().is_err());
}

/// A store whose calls never complete.
struct HangingUsageStore;

#[async_trait]
impl UsageStore for HangingUsageStore {
    async fn get(
        &self,
        _user_id: &str,
        _tool: &ToolKey,
        _now: DateTime<Utc>,
    ) -> Result<UsageCounter, StoreError> {
        std::future::pending().await
    }

    async fn try_increment_if_under_limit(
        &self,
        _user_id: &str,
        _tool: &ToolKey,
        _limit: u32,
        _reset: ResetPolicy,
        _now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn unavailable_store_fails_closed() {
    let evaluator = UsageEvaluator::new(
        Arc::new(TierCatalog::default()),
        Arc::new(HangingUsageStore),
        Arc::new(MemorySubscriptionStore::new()),
        UsageNotifier::default(),
    )
    .with_store_timeout(StdDuration::from_millis(50));

    let outcome = evaluator.attempt("reader", &articles(), at(10, 9, 0)).await;
    assert!(!outcome.admitted);
    assert_eq!(outcome.status.reason, Some(DenialReason::StoreUnavailable));
    assert_eq!(outcome.status.notes, vec!["billing:store-unavailable".to_string()]);

    let status = evaluator.can_perform("reader", &articles(), at(10, 9, 0)).await;
    assert!(!status.can_generate_now);
    assert_eq!(status.reason, Some(DenialReason::StoreUnavailable));
}
