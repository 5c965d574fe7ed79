//! In-memory billing store
//!
//! All state sits behind one mutex, so the credit check-and-decrement is
//! atomic in the same way the conditional UPDATE is in Postgres.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BillingStore, EventClaim, GenerationLogEntry, RefundRequestRecord, SubscriptionPatch,
    SubscriptionRecord, WEBHOOK_PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone)]
struct WebhookEventRow {
    processing_result: String,
    processing_started_at: OffsetDateTime,
    error_message: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    free_usage: HashMap<Uuid, i32>,
    generation_logs: Vec<GenerationLogEntry>,
    refund_requests: Vec<RefundRequestRecord>,
    webhook_events: HashMap<String, WebhookEventRow>,
}

#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a database error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Database("connection refused".to_string()));
        }
        Ok(())
    }

    /// Replace a stored row wholesale
    pub async fn put_subscription(&self, record: SubscriptionRecord) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(record.user_id, record);
    }

    pub async fn generation_logs(&self) -> Vec<GenerationLogEntry> {
        self.state.lock().await.generation_logs.clone()
    }

    pub async fn refund_requests(&self) -> Vec<RefundRequestRecord> {
        self.state.lock().await.refund_requests.clone()
    }

    pub async fn webhook_event_result(&self, event_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .webhook_events
            .get(event_id)
            .map(|e| e.processing_result.clone())
    }

    pub async fn webhook_event_error(&self, event_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .webhook_events
            .get(event_id)
            .and_then(|e| e.error_message.clone())
    }

    /// Backdate an in-flight event, as if its worker died
    pub async fn age_webhook_event(&self, event_id: &str, by: Duration) {
        if let Some(row) = self.state.lock().await.webhook_events.get_mut(event_id) {
            row.processing_started_at -= by;
        }
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        self.check_available()?;
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|r| r.stripe_customer_id.as_deref() == Some(customer_id))
            .map(|r| r.user_id))
    }

    async fn find_user_by_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|r| r.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .map(|r| r.user_id))
    }

    async fn apply_patch(
        &self,
        user_id: Uuid,
        patch: &SubscriptionPatch,
    ) -> BillingResult<SubscriptionRecord> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let record = state
            .subscriptions
            .entry(user_id)
            .or_insert_with(|| SubscriptionRecord::empty(user_id));
        patch.apply_to(record, OffsetDateTime::now_utc());
        Ok(record.clone())
    }

    async fn consume_credits(&self, user_id: Uuid, amount: i32) -> BillingResult<Option<i32>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(&user_id) {
            Some(record) if record.credits_remaining >= amount => {
                record.credits_remaining -= amount;
                record.monthly_usage_count += 1;
                record.updated_at = OffsetDateTime::now_utc();
                Ok(Some(record.credits_remaining))
            }
            _ => Ok(None),
        }
    }

    async fn free_script_uses(&self, user_id: Uuid) -> BillingResult<i32> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .free_usage
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn increment_free_script_uses(&self, user_id: Uuid) -> BillingResult<i32> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let uses = state.free_usage.entry(user_id).or_insert(0);
        *uses += 1;
        Ok(*uses)
    }

    async fn insert_generation_log(&self, entry: &GenerationLogEntry) -> BillingResult<()> {
        self.check_available()?;
        self.state.lock().await.generation_logs.push(entry.clone());
        Ok(())
    }

    async fn insert_refund_request(&self, request: &RefundRequestRecord) -> BillingResult<()> {
        self.check_available()?;
        self.state.lock().await.refund_requests.push(request.clone());
        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_created_at: Option<OffsetDateTime>,
    ) -> BillingResult<EventClaim> {
        self.check_available()?;
        let now = OffsetDateTime::now_utc();
        let stale_before = now - Duration::minutes(WEBHOOK_PROCESSING_TIMEOUT_MINUTES.into());
        let mut state = self.state.lock().await;

        match state.webhook_events.get_mut(event_id) {
            None => {
                state.webhook_events.insert(
                    event_id.to_string(),
                    WebhookEventRow {
                        processing_result: "processing".to_string(),
                        processing_started_at: now,
                        error_message: None,
                    },
                );
                Ok(EventClaim::Claimed)
            }
            Some(row)
                if row.processing_result == "error"
                    || (row.processing_result == "processing"
                        && row.processing_started_at < stale_before) =>
            {
                row.processing_result = "processing".to_string();
                row.processing_started_at = now;
                row.error_message = None;
                Ok(EventClaim::Claimed)
            }
            Some(row) => Ok(EventClaim::Duplicate {
                processing_result: Some(row.processing_result.clone()),
            }),
        }
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        outcome: Result<(), String>,
    ) -> BillingResult<()> {
        self.check_available()?;
        if let Some(row) = self.state.lock().await.webhook_events.get_mut(event_id) {
            match outcome {
                Ok(()) => {
                    row.processing_result = "success".to_string();
                    row.error_message = None;
                }
                Err(message) => {
                    row.processing_result = "error".to_string();
                    row.error_message = Some(message);
                }
            }
        }
        Ok(())
    }
}
