use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::error::ProviderError;
use super::models::SubscriptionStatus;

/// Metadata keys the checkout flow stores the user identifier under.
const USER_ID_METADATA_KEYS: [&str; 2] = ["user_id", "userId"];

/// Provider view of a subscription, reduced to what tier resolution needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub price_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub user_id: Option<String>,
}

/// key: billing-adapter -> provider integration used for re-fetching state
#[async_trait]
pub trait BillingProviderAdapter: Send + Sync {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError>;
}

/// key: billing-adapter-stripe -> REST client for Stripe-compatible APIs
#[derive(Clone)]
pub struct StripeLikeAdapter {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl StripeLikeAdapter {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl BillingProviderAdapter for StripeLikeAdapter {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProviderSubscription, ProviderError> {
        let url = format!("{}/v1/subscriptions/{subscription_id}", self.api_base);
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let payload: Value = response.json().await?;
        parse_subscription_object(&payload).map_err(ProviderError::Decode)
    }
}

/// Decode a provider subscription object (as returned by the API and embedded
/// in subscription webhooks).
pub fn parse_subscription_object(object: &Value) -> Result<ProviderSubscription, String> {
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| "subscription id missing".to_string())?;

    let status = match object.get("status").and_then(Value::as_str) {
        Some(raw) => Some(
            serde_json::from_value::<SubscriptionStatus>(Value::String(raw.to_string()))
                .map_err(|_| format!("unrecognised subscription status `{raw}`"))?,
        ),
        None => None,
    };

    let first_item = object.pointer("/items/data/0");
    let price_id = first_item
        .and_then(|item| item.pointer("/price/id"))
        .or_else(|| object.pointer("/plan/id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let current_period_end = object
        .get("current_period_end")
        .or_else(|| first_item.and_then(|item| item.get("current_period_end")))
        .and_then(Value::as_i64)
        .and_then(unix_timestamp);

    Ok(ProviderSubscription {
        id: id.to_string(),
        customer_id: expandable_id(object.get("customer")),
        status,
        price_id,
        current_period_end,
        cancel_at_period_end: object
            .get("cancel_at_period_end")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        user_id: metadata_user_id(object.get("metadata")),
    })
}

/// Provider references are either a bare id or an expanded object carrying one.
pub fn expandable_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

pub fn metadata_user_id(metadata: Option<&Value>) -> Option<String> {
    let metadata = metadata?;
    USER_ID_METADATA_KEYS
        .iter()
        .find_map(|key| metadata.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn unix_timestamp(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}
