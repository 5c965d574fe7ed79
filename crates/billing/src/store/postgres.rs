//! Postgres-backed billing store

use async_trait::async_trait;
use atasura_shared::{PlanId, SubscriptionStatus};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, EventClaim, GenerationLogEntry, RefundRequestRecord, SubscriptionPatch,
    SubscriptionRecord, WEBHOOK_PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::BillingResult;

const SUBSCRIPTION_COLUMNS: &str = r#"
    user_id, stripe_customer_id, stripe_subscription_id, price_id, plan, status,
    current_period_start, current_period_end, cancel_at_period_end, pending_price_id,
    credits_limit, credits_remaining, credits_reset_at, monthly_usage_count,
    created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    price_id: Option<String>,
    plan: String,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    pending_price_id: Option<String>,
    credits_limit: i32,
    credits_remaining: i32,
    credits_reset_at: Option<OffsetDateTime>,
    monthly_usage_count: i32,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            user_id: row.user_id,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            price_id: row.price_id,
            plan: PlanId::from_str_lossy(&row.plan),
            status: SubscriptionStatus::from_str_lossy(&row.status),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            pending_price_id: row.pending_price_id,
            credits_limit: row.credits_limit,
            credits_remaining: row.credits_remaining,
            credits_reset_at: row.credits_reset_at,
            monthly_usage_count: row.monthly_usage_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM subscriptions WHERE stripe_customer_id = $1 LIMIT 1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn find_user_by_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM subscriptions WHERE stripe_subscription_id = $1 LIMIT 1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn apply_patch(
        &self,
        user_id: Uuid,
        patch: &SubscriptionPatch,
    ) -> BillingResult<SubscriptionRecord> {
        // Nullable columns use a flag + value pair so NULL can be written explicitly
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                user_id, stripe_customer_id, stripe_subscription_id, price_id, plan, status,
                current_period_start, current_period_end, cancel_at_period_end, pending_price_id,
                credits_limit, credits_remaining, credits_reset_at, monthly_usage_count
            ) VALUES (
                $1, $2, $3, $5, COALESCE($6, 'free'), COALESCE($7, 'inactive'),
                $8, $9, COALESCE($10, FALSE), $12,
                COALESCE($13, 0), COALESCE($13, 0),
                CASE WHEN $13::INT4 IS NULL THEN NULL ELSE NOW() END, 0
            )
            ON CONFLICT (user_id) DO UPDATE SET
                stripe_customer_id = COALESCE($2, subscriptions.stripe_customer_id),
                stripe_subscription_id = COALESCE($3, subscriptions.stripe_subscription_id),
                price_id = CASE WHEN $4 THEN $5 ELSE subscriptions.price_id END,
                plan = COALESCE($6, subscriptions.plan),
                status = COALESCE($7, subscriptions.status),
                current_period_start = COALESCE($8, subscriptions.current_period_start),
                current_period_end = COALESCE($9, subscriptions.current_period_end),
                cancel_at_period_end = COALESCE($10, subscriptions.cancel_at_period_end),
                pending_price_id = CASE WHEN $11 THEN $12 ELSE subscriptions.pending_price_id END,
                credits_limit = COALESCE($13, subscriptions.credits_limit),
                credits_remaining = COALESCE($13, subscriptions.credits_remaining),
                credits_reset_at = CASE WHEN $13::INT4 IS NULL
                    THEN subscriptions.credits_reset_at ELSE NOW() END,
                monthly_usage_count = CASE WHEN $13::INT4 IS NULL
                    THEN subscriptions.monthly_usage_count ELSE 0 END,
                updated_at = NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(patch.stripe_customer_id.as_deref())
        .bind(patch.stripe_subscription_id.as_deref())
        .bind(patch.price_id.is_some())
        .bind(patch.price_id.clone().flatten())
        .bind(patch.plan.map(|p| p.as_str()))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.cancel_at_period_end)
        .bind(patch.pending_price_id.is_some())
        .bind(patch.pending_price_id.clone().flatten())
        .bind(patch.credits.map(|c| c.limit))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn consume_credits(&self, user_id: Uuid, amount: i32) -> BillingResult<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET credits_remaining = credits_remaining - $2,
                monthly_usage_count = monthly_usage_count + 1,
                updated_at = NOW()
            WHERE user_id = $1 AND credits_remaining >= $2
            RETURNING credits_remaining
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(remaining,)| remaining))
    }

    async fn free_script_uses(&self, user_id: Uuid) -> BillingResult<i32> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT script_uses FROM free_plan_usage WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(uses,)| uses).unwrap_or(0))
    }

    async fn increment_free_script_uses(&self, user_id: Uuid) -> BillingResult<i32> {
        let (uses,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO free_plan_usage (user_id, script_uses, updated_at)
            VALUES ($1, 1, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                script_uses = free_plan_usage.script_uses + 1,
                updated_at = NOW()
            RETURNING script_uses
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(uses)
    }

    async fn insert_generation_log(&self, entry: &GenerationLogEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO generation_logs (
                session_id, user_id, action_type, input_tokens, output_tokens, total_tokens,
                model, prompt_length, response_length, duration_ms, success, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.session_id.as_deref())
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(entry.input_tokens)
        .bind(entry.output_tokens)
        .bind(entry.total_tokens)
        .bind(&entry.model)
        .bind(entry.prompt_length)
        .bind(entry.response_length)
        .bind(entry.duration_ms)
        .bind(entry.success)
        .bind(entry.error_message.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_refund_request(&self, request: &RefundRequestRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refund_requests (
                id, user_id, email, stripe_customer_id, reason, details, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.email.as_deref())
        .bind(request.stripe_customer_id.as_deref())
        .bind(&request.reason)
        .bind(&request.details)
        .bind(&request.status)
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_created_at: Option<OffsetDateTime>,
    ) -> BillingResult<EventClaim> {
        // Only one concurrent caller gets a row back. Failed events and events
        // stuck in processing can be reclaimed on redelivery.
        let claimed: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_created_at, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_created_at)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(EventClaim::Duplicate {
            processing_result: existing.map(|(r,)| r),
        })
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        outcome: Result<(), String>,
    ) -> BillingResult<()> {
        let (result, error_message) = match outcome {
            Ok(()) => ("success", None),
            Err(message) => ("error", Some(message)),
        };

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
