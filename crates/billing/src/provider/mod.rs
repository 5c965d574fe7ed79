//! Billing provider client
//!
//! Everything the billing services ask of Stripe goes through
//! [`BillingProvider`]. The live implementation is [`StripeProvider`];
//! tests script a [`FakeBillingProvider`].

#[cfg(any(test, feature = "testing"))]
mod fake;
mod live;

#[cfg(any(test, feature = "testing"))]
pub use fake::{active_subscription, FakeBillingProvider, FakeFailure, ProviderCall};
pub use live::StripeProvider;

use async_trait::async_trait;
use atasura_shared::PlanId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::payload::{CheckoutSessionSnapshot, ScheduleSnapshot, SubscriptionSnapshot};

/// Hosted checkout request for a single monthly plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub plan: PlanId,
    pub price_id: String,
    /// Existing customer, reused when known
    pub customer_id: Option<String>,
    /// Used to prefill checkout when there is no customer yet
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// One phase of a subscription schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub price_id: String,
    pub start_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
    pub iterations: Option<u32>,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CreatedCheckoutSession>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSnapshot>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;

    /// Swap the single item's price, prorating, and stamp `planId` metadata
    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        plan: PlanId,
    ) -> BillingResult<SubscriptionSnapshot>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionSnapshot>;

    async fn retrieve_schedule(&self, schedule_id: &str) -> BillingResult<ScheduleSnapshot>;

    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ScheduleSnapshot>;

    /// Replace the schedule's phases; the schedule releases after the last one
    async fn update_schedule_phases(
        &self,
        schedule_id: &str,
        phases: &[PhaseSpec],
        plan: PlanId,
    ) -> BillingResult<ScheduleSnapshot>;

    /// Detach the schedule, leaving the subscription as it currently is
    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()>;

    /// Returns the portal URL
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String>;
}
