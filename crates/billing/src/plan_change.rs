//! Subscription plan changes
//!
//! Upgrades take effect immediately with proration. Downgrades are placed on
//! a subscription schedule so the current plan runs to the end of the paid
//! period. Local state for upgrades is written by the webhook; downgrades,
//! cancellation and reactivation also update the local row once Stripe has
//! accepted the change.

use std::sync::Arc;

use atasura_shared::{PlanId, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payload::SubscriptionSnapshot;
use crate::plans::{display_name, is_downgrade, is_upgrade, parse_plan, PlanRegistry};
use crate::provider::{BillingProvider, PhaseSpec};
use crate::store::{BillingStore, SubscriptionPatch, SubscriptionRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangeResult {
    pub plan: PlanId,
    /// When the new plan takes over; `None` means immediately
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_date: Option<OffsetDateTime>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPlan {
    pub plan: PlanId,
    pub price_id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_date: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub plan: PlanId,
    pub plan_name: &'static str,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub credits_remaining: i32,
    pub credits_limit: i32,
    pub has_customer: bool,
    pub pending: Option<PendingPlan>,
}

pub struct PlanChangeService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn BillingProvider>,
    registry: PlanRegistry,
}

impl PlanChangeService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn BillingProvider>,
        registry: PlanRegistry,
    ) -> Self {
        Self {
            store,
            provider,
            registry,
        }
    }

    pub async fn get_subscription_view(&self, user_id: Uuid) -> BillingResult<SubscriptionView> {
        let record = self
            .store
            .get_subscription(user_id)
            .await?
            .unwrap_or_else(|| SubscriptionRecord::empty(user_id));

        let pending = record.pending_price_id.as_ref().and_then(|price_id| {
            let plan = self.registry.plan_for_price_id(price_id);
            (!plan.is_free()).then(|| PendingPlan {
                plan,
                price_id: price_id.clone(),
                effective_date: record.current_period_end,
            })
        });

        Ok(SubscriptionView {
            plan: record.plan,
            plan_name: display_name(record.plan),
            status: record.status,
            current_period_start: record.current_period_start,
            current_period_end: record.current_period_end,
            cancel_at_period_end: record.cancel_at_period_end,
            credits_remaining: record.credits_remaining,
            credits_limit: record.credits_limit,
            has_customer: record.stripe_customer_id.is_some(),
            pending,
        })
    }

    /// Move to a higher plan now, with prorations
    pub async fn upgrade(&self, user_id: Uuid, target: &str) -> BillingResult<PlanChangeResult> {
        let target = parse_plan(target)?;
        let (record, subscription) = self.active_subscription(user_id).await?;

        if !is_upgrade(record.plan, target) {
            return Err(BillingError::InvalidRequest(format!(
                "{} is not an upgrade from {}",
                target.as_str(),
                record.plan.as_str()
            )));
        }
        let price_id = self.registry.resolve_price_id_for_plan(target)?;
        let item_id = subscription.item_id.as_deref().ok_or_else(|| {
            BillingError::StripeApi(format!("subscription {} has no items", subscription.id))
        })?;

        self.release_attached_schedule(&subscription).await?;
        self.provider
            .change_subscription_price(&subscription.id, item_id, price_id, target)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            from = %record.plan,
            to = %target,
            "Upgraded subscription"
        );

        Ok(PlanChangeResult {
            plan: target,
            effective_date: None,
            message: format!("Upgraded to {}", display_name(target)),
        })
    }

    /// Switch to a lower plan at the end of the current period
    pub async fn downgrade(&self, user_id: Uuid, target: &str) -> BillingResult<PlanChangeResult> {
        let target = parse_plan(target)?;
        if target.is_free() {
            return Err(BillingError::InvalidRequest(
                "To move to the free plan, cancel your subscription instead".to_string(),
            ));
        }
        let (record, subscription) = self.active_subscription(user_id).await?;

        if !is_downgrade(record.plan, target) {
            return Err(BillingError::InvalidRequest(format!(
                "{} is not a downgrade from {}",
                target.as_str(),
                record.plan.as_str()
            )));
        }
        let new_price = self.registry.resolve_price_id_for_plan(target)?.to_string();
        let current_price = subscription
            .price_id()
            .map(str::to_string)
            .ok_or_else(|| {
                BillingError::StripeApi(format!("subscription {} has no price", subscription.id))
            })?;

        self.release_attached_schedule(&subscription).await?;
        let schedule = self
            .provider
            .create_schedule_from_subscription(&subscription.id)
            .await?;

        let period_end = subscription.current_period_end;
        let phases = [
            PhaseSpec {
                price_id: current_price,
                start_date: schedule
                    .current_phase_start()
                    .or(subscription.current_period_start),
                end_date: period_end,
                iterations: None,
            },
            PhaseSpec {
                price_id: new_price.clone(),
                start_date: None,
                end_date: None,
                iterations: Some(1),
            },
        ];
        self.provider
            .update_schedule_phases(&schedule.id, &phases, target)
            .await?;

        self.store
            .apply_patch(
                user_id,
                &SubscriptionPatch {
                    pending_price_id: Some(Some(new_price)),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            schedule_id = %schedule.id,
            from = %record.plan,
            to = %target,
            effective_date = ?period_end,
            "Scheduled subscription downgrade for period end"
        );

        Ok(PlanChangeResult {
            plan: target,
            effective_date: period_end,
            message: format!(
                "Your plan will change to {} at the end of the current period",
                display_name(target)
            ),
        })
    }

    /// Stop renewal at period end. The plan stays usable until then.
    pub async fn cancel(&self, user_id: Uuid) -> BillingResult<PlanChangeResult> {
        let (record, subscription) = self.active_subscription(user_id).await?;

        self.release_attached_schedule(&subscription).await?;
        self.provider
            .set_cancel_at_period_end(&subscription.id, true)
            .await?;

        self.store
            .apply_patch(
                user_id,
                &SubscriptionPatch {
                    cancel_at_period_end: Some(true),
                    pending_price_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Subscription set to cancel at period end"
        );

        Ok(PlanChangeResult {
            plan: record.plan,
            effective_date: subscription.current_period_end,
            message: "Your subscription will end at the close of the current period".to_string(),
        })
    }

    /// Undo a pending cancellation
    pub async fn reactivate(&self, user_id: Uuid) -> BillingResult<PlanChangeResult> {
        let (record, subscription) = self.active_subscription(user_id).await?;

        self.provider
            .set_cancel_at_period_end(&subscription.id, false)
            .await?;

        self.store
            .apply_patch(
                user_id,
                &SubscriptionPatch {
                    cancel_at_period_end: Some(false),
                    pending_price_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Subscription reactivated"
        );

        Ok(PlanChangeResult {
            plan: record.plan,
            effective_date: None,
            message: "Your subscription will renew as usual".to_string(),
        })
    }

    async fn active_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<(SubscriptionRecord, SubscriptionSnapshot)> {
        let record = self
            .store
            .get_subscription(user_id)
            .await?
            .filter(SubscriptionRecord::is_active)
            .ok_or(BillingError::NoActiveSubscription)?;
        let subscription_id = record
            .stripe_subscription_id
            .as_deref()
            .ok_or(BillingError::NoActiveSubscription)?;

        let subscription = self.provider.retrieve_subscription(subscription_id).await?;
        Ok((record, subscription))
    }

    async fn release_attached_schedule(
        &self,
        subscription: &SubscriptionSnapshot,
    ) -> BillingResult<()> {
        if let Some(schedule_id) = subscription.schedule_id.as_deref() {
            self.provider.release_schedule(schedule_id).await?;
            tracing::info!(
                subscription_id = %subscription.id,
                schedule_id = %schedule_id,
                "Released existing subscription schedule"
            );
        }
        Ok(())
    }
}
