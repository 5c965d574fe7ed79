//! Stripe payload adapter
//!
//! Stripe objects are read as raw JSON and normalized here into the
//! snapshots the rest of the crate works with. Shapes from both older
//! (pre 2025-03) and newer API versions are accepted:
//!
//! - subscription period bounds at the top level or on the first item
//! - invoice subscription ids under `subscription` or `parent.subscription_details`
//! - invoice line prices under `price` or `pricing.price_details.price`
//! - expandable references as either an id string or an object

use std::collections::HashMap;

use atasura_shared::SubscriptionStatus;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::PriceRef;

/// Metadata key carrying the Supabase user id
pub const META_USER_ID: &str = "userId";
/// Metadata key carrying the purchased plan id
pub const META_PLAN_ID: &str = "planId";

/// Verified webhook envelope
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: Option<OffsetDateTime>,
    pub api_version: Option<String>,
    pub object: Value,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        let value: Value = serde_json::from_str(payload)?;

        let id = str_field(&value, "id")
            .ok_or_else(|| BillingError::MalformedPayload("event has no id".to_string()))?;
        let event_type = str_field(&value, "type")
            .ok_or_else(|| BillingError::MalformedPayload("event has no type".to_string()))?;
        let object = value
            .pointer("/data/object")
            .cloned()
            .ok_or_else(|| BillingError::MalformedPayload("event has no data.object".to_string()))?;

        Ok(Self {
            id,
            event_type,
            created: timestamp_field(&value, "created"),
            api_version: str_field(&value, "api_version"),
            object,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub item_id: Option<String>,
    pub price: Option<PriceRef>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub schedule_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl SubscriptionSnapshot {
    pub fn from_value(value: &Value) -> BillingResult<Self> {
        let id = str_field(value, "id")
            .ok_or_else(|| BillingError::MalformedPayload("subscription has no id".to_string()))?;
        let first_item = value.pointer("/items/data/0");

        let price = first_item
            .and_then(|item| item.get("price"))
            .and_then(price_ref);

        // Newer API versions moved the period onto subscription items
        let current_period_start = timestamp_field(value, "current_period_start").or_else(|| {
            first_item.and_then(|item| timestamp_field(item, "current_period_start"))
        });
        let current_period_end = timestamp_field(value, "current_period_end")
            .or_else(|| first_item.and_then(|item| timestamp_field(item, "current_period_end")));

        Ok(Self {
            id,
            customer_id: value.get("customer").and_then(expandable_id),
            status: str_field(value, "status")
                .map(|s| SubscriptionStatus::from_str_lossy(&s))
                .unwrap_or(SubscriptionStatus::Incomplete),
            item_id: first_item.and_then(|item| str_field(item, "id")),
            price,
            current_period_start,
            current_period_end,
            cancel_at_period_end: value
                .get("cancel_at_period_end")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            schedule_id: value.get("schedule").and_then(expandable_id),
            metadata: metadata(value),
        })
    }

    pub fn price_id(&self) -> Option<&str> {
        self.price.as_ref().map(|p| p.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionSnapshot {
    pub id: String,
    pub client_reference_id: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Present when the subscription was expanded in the payload
    pub subscription: Option<SubscriptionSnapshot>,
    pub payment_status: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionSnapshot {
    pub fn from_value(value: &Value) -> BillingResult<Self> {
        let id = str_field(value, "id").ok_or_else(|| {
            BillingError::MalformedPayload("checkout session has no id".to_string())
        })?;

        let subscription = match value.get("subscription") {
            Some(sub @ Value::Object(_)) => Some(SubscriptionSnapshot::from_value(sub)?),
            _ => None,
        };

        Ok(Self {
            id,
            client_reference_id: str_field(value, "client_reference_id"),
            customer_id: value.get("customer").and_then(expandable_id),
            subscription_id: value.get("subscription").and_then(expandable_id),
            subscription,
            payment_status: str_field(value, "payment_status"),
            metadata: metadata(value),
        })
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    /// Owner from metadata, falling back to `client_reference_id`
    pub fn owner(&self) -> Option<Uuid> {
        user_id_from_metadata(&self.metadata).or_else(|| {
            self.client_reference_id
                .as_deref()
                .and_then(|s| Uuid::parse_str(s).ok())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceSnapshot {
    pub id: String,
    pub billing_reason: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Subscription metadata copied onto the invoice
    pub subscription_metadata: HashMap<String, String>,
    pub line_period_start: Option<OffsetDateTime>,
    pub line_period_end: Option<OffsetDateTime>,
    pub line_price: Option<PriceRef>,
}

impl InvoiceSnapshot {
    pub fn from_value(value: &Value) -> BillingResult<Self> {
        let id = str_field(value, "id")
            .ok_or_else(|| BillingError::MalformedPayload("invoice has no id".to_string()))?;

        let parent_details = value.pointer("/parent/subscription_details");
        let subscription_id = value
            .get("subscription")
            .and_then(expandable_id)
            .or_else(|| parent_details.and_then(|d| d.get("subscription")).and_then(expandable_id));

        let subscription_metadata = value
            .get("subscription_details")
            .or(parent_details)
            .map(metadata)
            .unwrap_or_default();

        let line = subscription_line(value, subscription_id.as_deref());
        let line_price = line.and_then(|l| {
            l.get("price")
                .and_then(price_ref)
                .or_else(|| l.pointer("/pricing/price_details/price").and_then(price_ref))
        });

        Ok(Self {
            id,
            billing_reason: str_field(value, "billing_reason"),
            customer_id: value.get("customer").and_then(expandable_id),
            subscription_id,
            subscription_metadata,
            line_period_start: line.and_then(|l| l.pointer("/period/start")).and_then(as_timestamp),
            line_period_end: line.and_then(|l| l.pointer("/period/end")).and_then(as_timestamp),
            line_price,
        })
    }

    pub fn is_subscription_cycle(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_cycle")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePhase {
    pub price_ids: Vec<String>,
    pub start_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSnapshot {
    pub id: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub status: Option<String>,
    pub phases: Vec<SchedulePhase>,
    pub metadata: HashMap<String, String>,
}

impl ScheduleSnapshot {
    pub fn from_value(value: &Value) -> BillingResult<Self> {
        let id = str_field(value, "id")
            .ok_or_else(|| BillingError::MalformedPayload("schedule has no id".to_string()))?;

        let phases = value
            .get("phases")
            .and_then(Value::as_array)
            .map(|phases| {
                phases
                    .iter()
                    .map(|phase| SchedulePhase {
                        price_ids: phase
                            .get("items")
                            .and_then(Value::as_array)
                            .map(|items| {
                                items
                                    .iter()
                                    .filter_map(|item| item.get("price").and_then(expandable_id))
                                    .collect()
                            })
                            .unwrap_or_default(),
                        start_date: timestamp_field(phase, "start_date"),
                        end_date: timestamp_field(phase, "end_date"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            subscription_id: value.get("subscription").and_then(expandable_id),
            customer_id: value.get("customer").and_then(expandable_id),
            status: str_field(value, "status"),
            phases,
            metadata: metadata(value),
        })
    }

    /// Price of the final phase, i.e. what the subscription becomes
    pub fn final_price_id(&self) -> Option<&str> {
        self.phases
            .last()
            .and_then(|p| p.price_ids.first())
            .map(String::as_str)
    }

    pub fn current_phase_start(&self) -> Option<OffsetDateTime> {
        self.phases.first().and_then(|p| p.start_date)
    }
}

pub fn user_id_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get(META_USER_ID)
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
}

/// Subscription line of an invoice, matching the subscription id when known
fn subscription_line<'a>(invoice: &'a Value, subscription_id: Option<&str>) -> Option<&'a Value> {
    let lines = invoice.pointer("/lines/data")?.as_array()?;

    let is_subscription_line = |line: &&Value| {
        str_field(line, "type").as_deref() == Some("subscription")
            || line.pointer("/parent/type").and_then(Value::as_str)
                == Some("subscription_item_details")
    };
    let line_subscription = |line: &Value| {
        line.get("subscription").and_then(expandable_id).or_else(|| {
            line.pointer("/parent/subscription_item_details/subscription")
                .and_then(expandable_id)
        })
    };

    lines
        .iter()
        .filter(is_subscription_line)
        .find(|line| match subscription_id {
            Some(id) => line_subscription(line).as_deref() == Some(id),
            None => true,
        })
        .or_else(|| lines.iter().find(is_subscription_line))
}

fn price_ref(value: &Value) -> Option<PriceRef> {
    match value {
        Value::String(id) => Some(PriceRef::new(id.clone())),
        Value::Object(_) => Some(PriceRef {
            id: str_field(value, "id")?,
            lookup_key: str_field(value, "lookup_key"),
        }),
        _ => None,
    }
}

fn expandable_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(_) => str_field(value, "id"),
        _ => None,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn timestamp_field(value: &Value, key: &str) -> Option<OffsetDateTime> {
    value.get(key).and_then(as_timestamp)
}

fn as_timestamp(value: &Value) -> Option<OffsetDateTime> {
    value
        .as_i64()
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
}

fn metadata(value: &Value) -> HashMap<String, String> {
    value
        .get("metadata")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_envelope() {
        let body = json!({
            "id": "evt_1",
            "type": "invoice.paid",
            "created": 1_700_000_000,
            "api_version": "2024-06-20",
            "data": { "object": { "id": "in_1" } }
        })
        .to_string();

        let event = WebhookEvent::parse(&body).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "invoice.paid");
        assert_eq!(event.created.map(|t| t.unix_timestamp()), Some(1_700_000_000));
        assert_eq!(event.object["id"], "in_1");
    }

    #[test]
    fn test_event_without_object_is_malformed() {
        let body = json!({ "id": "evt_1", "type": "x", "data": {} }).to_string();
        assert!(matches!(
            WebhookEvent::parse(&body),
            Err(BillingError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_legacy_subscription_shape() {
        let value = json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "cancel_at_period_end": false,
            "schedule": null,
            "metadata": { "userId": "7d0b4b8e-0f3f-4d43-9c52-5b3f3c1f5e10", "planId": "basic" },
            "items": { "data": [
                { "id": "si_1", "price": { "id": "price_basic", "lookup_key": "basic_monthly" } }
            ]}
        });

        let sub = SubscriptionSnapshot::from_value(&value).unwrap();
        assert_eq!(sub.customer_id.as_deref(), Some("cus_1"));
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.item_id.as_deref(), Some("si_1"));
        assert_eq!(sub.price_id(), Some("price_basic"));
        assert_eq!(
            sub.price.as_ref().and_then(|p| p.lookup_key.as_deref()),
            Some("basic_monthly")
        );
        assert_eq!(
            sub.current_period_end.map(|t| t.unix_timestamp()),
            Some(1_702_592_000)
        );
        assert_eq!(sub.schedule_id, None);
        assert!(user_id_from_metadata(&sub.metadata).is_some());
    }

    #[test]
    fn test_modern_subscription_period_on_items() {
        let value = json!({
            "id": "sub_2",
            "customer": { "id": "cus_2", "object": "customer" },
            "status": "past_due",
            "schedule": "sub_sched_1",
            "items": { "data": [{
                "id": "si_2",
                "price": { "id": "price_starter" },
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000
            }]}
        });

        let sub = SubscriptionSnapshot::from_value(&value).unwrap();
        assert_eq!(sub.customer_id.as_deref(), Some("cus_2"));
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.schedule_id.as_deref(), Some("sub_sched_1"));
        assert_eq!(
            sub.current_period_start.map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_checkout_owner_falls_back_to_client_reference() {
        let user = Uuid::new_v4();
        let value = json!({
            "id": "cs_1",
            "client_reference_id": user.to_string(),
            "subscription": "sub_1",
            "payment_status": "paid",
            "metadata": {}
        });

        let session = CheckoutSessionSnapshot::from_value(&value).unwrap();
        assert_eq!(session.owner(), Some(user));
        assert_eq!(session.subscription_id.as_deref(), Some("sub_1"));
        assert!(session.subscription.is_none());
        assert!(session.is_paid());
    }

    #[test]
    fn test_checkout_metadata_owner_wins() {
        let meta_user = Uuid::new_v4();
        let value = json!({
            "id": "cs_2",
            "client_reference_id": Uuid::new_v4().to_string(),
            "payment_status": "unpaid",
            "metadata": { "userId": meta_user.to_string() }
        });

        let session = CheckoutSessionSnapshot::from_value(&value).unwrap();
        assert_eq!(session.owner(), Some(meta_user));
        assert!(!session.is_paid());
    }

    #[test]
    fn test_legacy_invoice_shape() {
        let value = json!({
            "id": "in_1",
            "billing_reason": "subscription_cycle",
            "customer": "cus_1",
            "subscription": "sub_1",
            "subscription_details": { "metadata": { "userId": "u" } },
            "lines": { "data": [
                { "type": "invoiceitem", "period": { "start": 1, "end": 2 } },
                {
                    "type": "subscription",
                    "subscription": "sub_1",
                    "period": { "start": 1_700_000_000, "end": 1_702_592_000 },
                    "price": { "id": "price_basic" }
                }
            ]}
        });

        let invoice = InvoiceSnapshot::from_value(&value).unwrap();
        assert!(invoice.is_subscription_cycle());
        assert_eq!(invoice.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(invoice.subscription_metadata.get("userId").map(String::as_str), Some("u"));
        assert_eq!(
            invoice.line_period_end.map(|t| t.unix_timestamp()),
            Some(1_702_592_000)
        );
        assert_eq!(invoice.line_price.map(|p| p.id), Some("price_basic".to_string()));
    }

    #[test]
    fn test_modern_invoice_shape() {
        let value = json!({
            "id": "in_2",
            "billing_reason": "subscription_create",
            "customer": "cus_2",
            "parent": {
                "type": "subscription_details",
                "subscription_details": {
                    "subscription": "sub_2",
                    "metadata": { "planId": "creator" }
                }
            },
            "lines": { "data": [{
                "parent": {
                    "type": "subscription_item_details",
                    "subscription_item_details": { "subscription": "sub_2" }
                },
                "period": { "start": 1_700_000_000, "end": 1_702_592_000 },
                "pricing": { "price_details": { "price": "price_creator" } }
            }]}
        });

        let invoice = InvoiceSnapshot::from_value(&value).unwrap();
        assert!(!invoice.is_subscription_cycle());
        assert_eq!(invoice.subscription_id.as_deref(), Some("sub_2"));
        assert_eq!(
            invoice.subscription_metadata.get("planId").map(String::as_str),
            Some("creator")
        );
        assert_eq!(
            invoice.line_period_start.map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!(invoice.line_price.map(|p| p.id), Some("price_creator".to_string()));
    }

    #[test]
    fn test_schedule_final_price() {
        let value = json!({
            "id": "sub_sched_1",
            "subscription": "sub_1",
            "status": "active",
            "phases": [
                { "start_date": 100, "end_date": 200, "items": [{ "price": "price_creator" }] },
                { "start_date": 200, "end_date": 300, "items": [{ "price": { "id": "price_basic" } }] }
            ]
        });

        let schedule = ScheduleSnapshot::from_value(&value).unwrap();
        assert_eq!(schedule.phases.len(), 2);
        assert_eq!(schedule.final_price_id(), Some("price_basic"));
        assert_eq!(schedule.current_phase_start().map(|t| t.unix_timestamp()), Some(100));
    }
}
