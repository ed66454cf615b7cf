use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use super::adapters::{expandable_id, metadata_user_id, parse_subscription_object, unix_timestamp};
use super::models::{BillingEvent, BillingEventKind};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature header malformed")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature does not match payload")]
    Mismatch,
}

/// Shared secret and replay tolerance for inbound billing webhooks.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Check a `t=<unix>,v1=<hex>` header against HMAC-SHA256 of `"<t>.<payload>"`.
    pub fn verify(
        &self,
        header: Option<&str>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let header = header.ok_or(SignatureError::Missing)?;
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
        if candidates.is_empty() {
            return Err(SignatureError::Malformed);
        }

        let signed_at = unix_timestamp(timestamp).ok_or(SignatureError::Malformed)?;
        if (now - signed_at).num_seconds().abs() > self.tolerance.num_seconds() {
            return Err(SignatureError::Expired);
        }

        let matched = candidates.into_iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(&self.secret) else {
                return false;
            };
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(payload);
            mac.verify_slice(&expected).is_ok()
        });

        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Header value for `payload` signed at `at`. Used by tests and local tooling.
    pub fn sign(&self, payload: &[u8], at: DateTime<Utc>) -> String {
        let timestamp = at.timestamp();
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.secret).expect("HMAC can use any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed billing event: {0}")]
pub struct MalformedEvent(pub String);

/// Decode a verified provider payload. `Ok(None)` for event types this
/// service does not act on.
pub fn parse_event(payload: &[u8]) -> Result<Option<BillingEvent>, MalformedEvent> {
    let envelope: Value =
        serde_json::from_slice(payload).map_err(|err| MalformedEvent(err.to_string()))?;
    let field = |name: &str| envelope.get(name).and_then(Value::as_str);

    let event_type = field("type").ok_or_else(|| MalformedEvent("type missing".into()))?;
    let Some(kind) = BillingEventKind::from_provider(event_type) else {
        return Ok(None);
    };
    let id = field("id").ok_or_else(|| MalformedEvent("id missing".into()))?;
    let occurred_at = envelope
        .get("created")
        .and_then(Value::as_i64)
        .and_then(unix_timestamp)
        .ok_or_else(|| MalformedEvent("created timestamp missing".into()))?;
    let object = envelope
        .pointer("/data/object")
        .ok_or_else(|| MalformedEvent("data.object missing".into()))?;

    let event = match kind {
        BillingEventKind::SubscriptionCreated
        | BillingEventKind::SubscriptionUpdated
        | BillingEventKind::SubscriptionDeleted => {
            let subscription = parse_subscription_object(object).map_err(MalformedEvent)?;
            BillingEvent {
                id: id.to_string(),
                kind,
                subscription_id: Some(subscription.id),
                customer_id: subscription.customer_id,
                price_id: subscription.price_id,
                user_id: subscription.user_id,
                status: subscription.status,
                current_period_end: subscription.current_period_end,
                cancel_at_period_end: subscription.cancel_at_period_end,
                occurred_at,
            }
        }
        BillingEventKind::PaymentSucceeded | BillingEventKind::PaymentFailed => BillingEvent {
            id: id.to_string(),
            kind,
            subscription_id: expandable_id(object.get("subscription")).or_else(|| {
                expandable_id(object.pointer("/parent/subscription_details/subscription"))
            }),
            customer_id: expandable_id(object.get("customer")),
            price_id: None,
            user_id: metadata_user_id(object.pointer("/subscription_details/metadata"))
                .or_else(|| {
                    metadata_user_id(object.pointer("/parent/subscription_details/metadata"))
                })
                .or_else(|| metadata_user_id(object.get("metadata"))),
            status: None,
            current_period_end: None,
            cancel_at_period_end: false,
            occurred_at,
        },
    };

    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new("whsec_test", Duration::seconds(300))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn signed_payload_verifies() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = verifier().sign(payload, now());
        assert_eq!(verifier().verify(Some(&header), payload, now()), Ok(()));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let header = verifier().sign(br#"{"id":"evt_1"}"#, now());
        assert_eq!(
            verifier().verify(Some(&header), br#"{"id":"evt_2"}"#, now()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = WebhookVerifier::new("other", Duration::seconds(300)).sign(payload, now());
        assert_eq!(
            verifier().verify(Some(&header), payload, now()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn old_signatures_expire() {
        let payload = br#"{}"#;
        let header = verifier().sign(payload, now() - Duration::minutes(10));
        assert_eq!(
            verifier().verify(Some(&header), payload, now()),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn missing_and_malformed_headers() {
        assert_eq!(verifier().verify(None, b"{}", now()), Err(SignatureError::Missing));
        assert_eq!(
            verifier().verify(Some("v1=abcd"), b"{}", now()),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn any_matching_v1_candidate_is_accepted() {
        let payload = br#"{"id":"evt_1"}"#;
        let good = verifier().sign(payload, now());
        let rotated = format!("{good},v1=deadbeef");
        assert_eq!(verifier().verify(Some(&rotated), payload, now()), Ok(()));
    }

    #[test]
    fn subscription_event_parses() {
        let payload = json!({
            "id": "evt_10",
            "type": "customer.subscription.updated",
            "created": 1717243200,
            "data": {"object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "items": {"data": [{"price": {"id": "price_growth"}}]},
                "current_period_end": 1719835200,
                "metadata": {"user_id": "user-1"}
            }}
        });
        let event = parse_event(payload.to_string().as_bytes()).unwrap().unwrap();
        assert_eq!(event.kind, BillingEventKind::SubscriptionUpdated);
        assert_eq!(event.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(event.price_id.as_deref(), Some("price_growth"));
        assert_eq!(event.user_id.as_deref(), Some("user-1"));
        assert_eq!(event.occurred_at, unix_timestamp(1_717_243_200).unwrap());
    }

    #[test]
    fn invoice_event_parses_subscription_reference() {
        let payload = json!({
            "id": "evt_11",
            "type": "invoice.payment_succeeded",
            "created": 1717243200,
            "data": {"object": {
                "id": "in_1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "subscription_details": {"metadata": {"user_id": "user-1"}}
            }}
        });
        let event = parse_event(payload.to_string().as_bytes()).unwrap().unwrap();
        assert_eq!(event.kind, BillingEventKind::PaymentSucceeded);
        assert_eq!(event.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(event.user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn unrelated_event_types_are_skipped() {
        let payload = json!({
            "id": "evt_12",
            "type": "charge.refunded",
            "created": 1,
            "data": {"object": {}}
        });
        assert_eq!(parse_event(payload.to_string().as_bytes()), Ok(None));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(parse_event(b"not json").is_err());
    }
}
