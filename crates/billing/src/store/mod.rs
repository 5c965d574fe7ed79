//! Persistence for billing state
//!
//! [`BillingStore`] is the seam between the billing services and the
//! database. [`PgBillingStore`] is used in production and
//! [`MemoryBillingStore`] backs tests and local runs without Postgres.

mod memory;
mod postgres;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use atasura_shared::{GenerationAction, PlanId, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Events stuck in `processing` longer than this may be claimed again
pub const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Local mirror of a user's subscription and credit balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub plan: PlanId,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub pending_price_id: Option<String>,
    pub credits_limit: i32,
    pub credits_remaining: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub credits_reset_at: Option<OffsetDateTime>,
    pub monthly_usage_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Row as it looks before the user has bought anything
    pub fn empty(user_id: Uuid) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            user_id,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            price_id: None,
            plan: PlanId::Free,
            status: SubscriptionStatus::Inactive,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            pending_price_id: None,
            credits_limit: 0,
            credits_remaining: 0,
            credits_reset_at: None,
            monthly_usage_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whether the stored row already reflects this Stripe subscription
    pub fn is_synced_with(&self, stripe_subscription_id: &str) -> bool {
        self.is_active() && self.stripe_subscription_id.as_deref() == Some(stripe_subscription_id)
    }
}

/// Credits reset to a new monthly allotment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditReset {
    pub limit: i32,
}

/// Partial update applied as an upsert keyed by user id
///
/// `None` leaves the stored value alone. For nullable columns the inner
/// option carries the new value, so `Some(None)` clears the column.
/// `credits` sets limit and remaining together, stamps `credits_reset_at`
/// and zeroes `monthly_usage_count`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPatch {
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub price_id: Option<Option<String>>,
    pub plan: Option<PlanId>,
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub pending_price_id: Option<Option<String>>,
    pub credits: Option<CreditReset>,
}

impl SubscriptionPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply to an in-memory record
    pub fn apply_to(&self, record: &mut SubscriptionRecord, now: OffsetDateTime) {
        if let Some(v) = &self.stripe_customer_id {
            record.stripe_customer_id = Some(v.clone());
        }
        if let Some(v) = &self.stripe_subscription_id {
            record.stripe_subscription_id = Some(v.clone());
        }
        if let Some(v) = &self.price_id {
            record.price_id = v.clone();
        }
        if let Some(v) = self.plan {
            record.plan = v;
        }
        if let Some(v) = self.status {
            record.status = v;
        }
        if let Some(v) = self.current_period_start {
            record.current_period_start = Some(v);
        }
        if let Some(v) = self.current_period_end {
            record.current_period_end = Some(v);
        }
        if let Some(v) = self.cancel_at_period_end {
            record.cancel_at_period_end = v;
        }
        if let Some(v) = &self.pending_price_id {
            record.pending_price_id = v.clone();
        }
        if let Some(reset) = self.credits {
            record.credits_limit = reset.limit;
            record.credits_remaining = reset.limit;
            record.credits_reset_at = Some(now);
            record.monthly_usage_count = 0;
        }
        record.updated_at = now;
    }
}

/// One AI call for token accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationLogEntry {
    pub session_id: Option<String>,
    pub user_id: Uuid,
    pub action: GenerationAction,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub model: String,
    pub prompt_length: i32,
    pub response_length: i32,
    pub duration_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Refund request queued for manual review
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequestRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub reason: String,
    pub details: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of trying to claim a webhook event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClaim {
    /// This caller owns processing of the event
    Claimed,
    /// Already processed, or currently held by another worker
    Duplicate { processing_result: Option<String> },
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscriptions

    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>>;

    async fn find_user_by_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>>;

    /// Upsert keyed by user id, returning the stored row
    async fn apply_patch(
        &self,
        user_id: Uuid,
        patch: &SubscriptionPatch,
    ) -> BillingResult<SubscriptionRecord>;

    // Credits

    /// Decrement credits only if the balance covers `amount`.
    ///
    /// Returns the new balance, or `None` when the balance was too low (or
    /// the user has no row). Must be a single atomic check-and-decrement.
    async fn consume_credits(&self, user_id: Uuid, amount: i32) -> BillingResult<Option<i32>>;

    async fn free_script_uses(&self, user_id: Uuid) -> BillingResult<i32>;

    /// Returns the count after incrementing
    async fn increment_free_script_uses(&self, user_id: Uuid) -> BillingResult<i32>;

    // Side channels

    async fn insert_generation_log(&self, entry: &GenerationLogEntry) -> BillingResult<()>;

    async fn insert_refund_request(&self, request: &RefundRequestRecord) -> BillingResult<()>;

    // Webhook ledger

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_created_at: Option<OffsetDateTime>,
    ) -> BillingResult<EventClaim>;

    /// Record the outcome; `Err` holds the failure message
    async fn finish_webhook_event(
        &self,
        event_id: &str,
        outcome: Result<(), String>,
    ) -> BillingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_patch_is_empty() {
        assert!(SubscriptionPatch::default().is_empty());
        let patch = SubscriptionPatch {
            cancel_at_period_end: Some(false),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_patch_keeps_unset_fields() {
        let user = Uuid::new_v4();
        let mut record = SubscriptionRecord::empty(user);
        record.price_id = Some("price_a".to_string());
        record.pending_price_id = Some("price_b".to_string());
        record.credits_remaining = 42;

        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::PastDue),
            ..Default::default()
        };
        patch.apply_to(&mut record, OffsetDateTime::now_utc());

        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert_eq!(record.price_id.as_deref(), Some("price_a"));
        assert_eq!(record.pending_price_id.as_deref(), Some("price_b"));
        assert_eq!(record.credits_remaining, 42);
    }

    #[test]
    fn test_patch_clears_nullable_and_resets_credits() {
        let mut record = SubscriptionRecord::empty(Uuid::new_v4());
        record.pending_price_id = Some("price_b".to_string());
        record.monthly_usage_count = 9;
        record.credits_remaining = 3;

        let now = OffsetDateTime::now_utc();
        let patch = SubscriptionPatch {
            pending_price_id: Some(None),
            credits: Some(CreditReset { limit: 300 }),
            ..Default::default()
        };
        patch.apply_to(&mut record, now);

        assert_eq!(record.pending_price_id, None);
        assert_eq!(record.credits_limit, 300);
        assert_eq!(record.credits_remaining, 300);
        assert_eq!(record.monthly_usage_count, 0);
        assert_eq!(record.credits_reset_at, Some(now));
    }
}
