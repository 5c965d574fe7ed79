//! Scriptable in-process billing provider
//!
//! Holds subscriptions, schedules and checkout sessions in memory, applies
//! mutations the way Stripe would, and records every mutating call so tests
//! can assert on exactly what was sent.

use std::collections::HashMap;

use async_trait::async_trait;
use atasura_shared::{PlanId, SubscriptionStatus};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{BillingProvider, CheckoutRequest, CreatedCheckoutSession, PhaseSpec};
use crate::error::{BillingError, BillingResult};
use crate::payload::{
    CheckoutSessionSnapshot, SchedulePhase, ScheduleSnapshot, SubscriptionSnapshot, META_PLAN_ID,
    META_USER_ID,
};
use crate::plans::PriceRef;

/// Mutating calls observed by the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CreateCheckoutSession(CheckoutRequest),
    ChangeSubscriptionPrice {
        subscription_id: String,
        price_id: String,
    },
    SetCancelAtPeriodEnd {
        subscription_id: String,
        cancel: bool,
    },
    CreateSchedule {
        subscription_id: String,
    },
    UpdateSchedulePhases {
        schedule_id: String,
        phases: Vec<PhaseSpec>,
    },
    ReleaseSchedule {
        schedule_id: String,
    },
    CreatePortalSession {
        customer_id: String,
    },
}

/// Failure injected into the next provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeFailure {
    /// Behaves like a 5xx or timeout
    Unavailable,
    /// Behaves like a 4xx with this message
    Rejected(String),
}

#[derive(Default)]
struct FakeState {
    subscriptions: HashMap<String, SubscriptionSnapshot>,
    schedules: HashMap<String, ScheduleSnapshot>,
    sessions: HashMap<String, CheckoutSessionSnapshot>,
    calls: Vec<ProviderCall>,
    next_failure: Option<FakeFailure>,
    counter: u64,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}_{}", self.counter)
    }

    fn take_failure(&mut self) -> BillingResult<()> {
        match self.next_failure.take() {
            None => Ok(()),
            Some(FakeFailure::Unavailable) => Err(BillingError::ProviderUnavailable(
                "injected outage".to_string(),
            )),
            Some(FakeFailure::Rejected(message)) => Err(BillingError::StripeApi(message)),
        }
    }

    fn subscription_mut(&mut self, id: &str) -> BillingResult<&mut SubscriptionSnapshot> {
        self.subscriptions
            .get_mut(id)
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: '{id}'")))
    }
}

#[derive(Default)]
pub struct FakeBillingProvider {
    state: Mutex<FakeState>,
}

impl FakeBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_subscription(&self, subscription: SubscriptionSnapshot) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn insert_schedule(&self, schedule: ScheduleSnapshot) {
        self.state
            .lock()
            .await
            .schedules
            .insert(schedule.id.clone(), schedule);
    }

    pub async fn insert_checkout_session(&self, session: CheckoutSessionSnapshot) {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    pub async fn subscription(&self, id: &str) -> Option<SubscriptionSnapshot> {
        self.state.lock().await.subscriptions.get(id).cloned()
    }

    pub async fn schedule(&self, id: &str) -> Option<ScheduleSnapshot> {
        self.state.lock().await.schedules.get(id).cloned()
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn fail_next(&self, failure: FakeFailure) {
        self.state.lock().await.next_failure = Some(failure);
    }

    /// Simulate the customer paying for a session created earlier
    pub async fn mark_session_paid(&self, session_id: &str, subscription_id: &str) {
        if let Some(session) = self.state.lock().await.sessions.get_mut(session_id) {
            session.payment_status = Some("paid".to_string());
            session.subscription_id = Some(subscription_id.to_string());
        }
    }
}

#[async_trait]
impl BillingProvider for FakeBillingProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CreatedCheckoutSession> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state
            .calls
            .push(ProviderCall::CreateCheckoutSession(request.clone()));

        let id = state.next_id("cs_test");
        let metadata = HashMap::from([
            (META_USER_ID.to_string(), request.user_id.to_string()),
            (META_PLAN_ID.to_string(), request.plan.as_str().to_string()),
        ]);
        state.sessions.insert(
            id.clone(),
            CheckoutSessionSnapshot {
                id: id.clone(),
                client_reference_id: Some(request.user_id.to_string()),
                customer_id: request.customer_id.clone(),
                subscription_id: None,
                subscription: None,
                payment_status: Some("unpaid".to_string()),
                metadata,
            },
        );

        Ok(CreatedCheckoutSession {
            url: Some(format!("https://checkout.stripe.test/c/pay/{id}")),
            id,
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.sessions.get(session_id).cloned().ok_or_else(|| {
            BillingError::StripeApi(format!("No such checkout.session: '{session_id}'"))
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.subscription_mut(subscription_id).map(|s| s.clone())
    }

    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        _item_id: &str,
        price_id: &str,
        plan: PlanId,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.calls.push(ProviderCall::ChangeSubscriptionPrice {
            subscription_id: subscription_id.to_string(),
            price_id: price_id.to_string(),
        });

        let subscription = state.subscription_mut(subscription_id)?;
        subscription.price = Some(PriceRef::new(price_id));
        subscription
            .metadata
            .insert(META_PLAN_ID.to_string(), plan.as_str().to_string());
        Ok(subscription.clone())
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.calls.push(ProviderCall::SetCancelAtPeriodEnd {
            subscription_id: subscription_id.to_string(),
            cancel,
        });

        let subscription = state.subscription_mut(subscription_id)?;
        subscription.cancel_at_period_end = cancel;
        Ok(subscription.clone())
    }

    async fn retrieve_schedule(&self, schedule_id: &str) -> BillingResult<ScheduleSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.schedules.get(schedule_id).cloned().ok_or_else(|| {
            BillingError::StripeApi(format!("No such subscription_schedule: '{schedule_id}'"))
        })
    }

    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ScheduleSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.calls.push(ProviderCall::CreateSchedule {
            subscription_id: subscription_id.to_string(),
        });

        let schedule_id = state.next_id("sub_sched_test");
        let subscription = state.subscription_mut(subscription_id)?;
        if subscription.schedule_id.is_some() {
            return Err(BillingError::StripeApi(
                "subscription is already attached to a schedule".to_string(),
            ));
        }
        subscription.schedule_id = Some(schedule_id.clone());

        let schedule = ScheduleSnapshot {
            id: schedule_id.clone(),
            subscription_id: Some(subscription.id.clone()),
            customer_id: subscription.customer_id.clone(),
            status: Some("active".to_string()),
            phases: vec![SchedulePhase {
                price_ids: subscription
                    .price_id()
                    .map(|p| vec![p.to_string()])
                    .unwrap_or_default(),
                start_date: subscription.current_period_start,
                end_date: subscription.current_period_end,
            }],
            metadata: HashMap::new(),
        };
        state.schedules.insert(schedule_id, schedule.clone());
        Ok(schedule)
    }

    async fn update_schedule_phases(
        &self,
        schedule_id: &str,
        phases: &[PhaseSpec],
        plan: PlanId,
    ) -> BillingResult<ScheduleSnapshot> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.calls.push(ProviderCall::UpdateSchedulePhases {
            schedule_id: schedule_id.to_string(),
            phases: phases.to_vec(),
        });

        let schedule = state.schedules.get_mut(schedule_id).ok_or_else(|| {
            BillingError::StripeApi(format!("No such subscription_schedule: '{schedule_id}'"))
        })?;

        let mut previous_end: Option<OffsetDateTime> = None;
        schedule.phases = phases
            .iter()
            .map(|spec| {
                let start = spec.start_date.or(previous_end);
                previous_end = spec.end_date;
                SchedulePhase {
                    price_ids: vec![spec.price_id.clone()],
                    start_date: start,
                    end_date: spec.end_date,
                }
            })
            .collect();
        schedule
            .metadata
            .insert(META_PLAN_ID.to_string(), plan.as_str().to_string());
        Ok(schedule.clone())
    }

    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.calls.push(ProviderCall::ReleaseSchedule {
            schedule_id: schedule_id.to_string(),
        });

        let subscription_id = match state.schedules.get_mut(schedule_id) {
            Some(schedule) => {
                schedule.status = Some("released".to_string());
                schedule.subscription_id.clone()
            }
            None => {
                return Err(BillingError::StripeApi(format!(
                    "No such subscription_schedule: '{schedule_id}'"
                )))
            }
        };

        if let Some(sub_id) = subscription_id {
            if let Some(subscription) = state.subscriptions.get_mut(&sub_id) {
                subscription.schedule_id = None;
            }
        }
        Ok(())
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.calls.push(ProviderCall::CreatePortalSession {
            customer_id: customer_id.to_string(),
        });
        Ok(format!("https://billing.stripe.test/p/session/{customer_id}"))
    }
}

/// Active monthly subscription used as a starting point in tests
pub fn active_subscription(
    id: &str,
    customer_id: &str,
    price_id: &str,
    metadata: HashMap<String, String>,
) -> SubscriptionSnapshot {
    let now = OffsetDateTime::now_utc();
    let start = now.replace_nanosecond(0).unwrap_or(now);
    SubscriptionSnapshot {
        id: id.to_string(),
        customer_id: Some(customer_id.to_string()),
        status: SubscriptionStatus::Active,
        item_id: Some(format!("si_{id}")),
        price: Some(PriceRef::new(price_id)),
        current_period_start: Some(start),
        current_period_end: Some(start + time::Duration::days(30)),
        cancel_at_period_end: false,
        schedule_id: None,
        metadata,
    }
}
