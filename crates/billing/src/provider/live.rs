//! Stripe implementation of [`BillingProvider`]
//!
//! Requests go through async-stripe's `Client` with our own form structs,
//! and responses are read as JSON and normalized by [`crate::payload`].
//! The generated request types lag behind the API version our account is
//! pinned to, so they are not used here.

use std::collections::HashMap;

use async_trait::async_trait;
use atasura_shared::PlanId;
use serde::Serialize;
use serde_json::Value;

use super::{BillingProvider, CheckoutRequest, CreatedCheckoutSession, PhaseSpec};
use crate::config::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::payload::{
    CheckoutSessionSnapshot, ScheduleSnapshot, SubscriptionSnapshot, META_PLAN_ID, META_USER_ID,
};

#[derive(Debug, Serialize)]
struct LineItemForm<'a> {
    price: &'a str,
    quantity: u64,
}

#[derive(Debug, Serialize)]
struct SubscriptionDataForm {
    metadata: HashMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
struct CreateCheckoutSessionForm<'a> {
    mode: &'static str,
    line_items: Vec<LineItemForm<'a>>,
    success_url: &'a str,
    cancel_url: &'a str,
    client_reference_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_email: Option<&'a str>,
    metadata: HashMap<&'static str, String>,
    subscription_data: SubscriptionDataForm,
}

#[derive(Debug, Serialize)]
struct SubscriptionItemForm<'a> {
    id: &'a str,
    price: &'a str,
}

#[derive(Debug, Serialize)]
struct ChangePriceForm<'a> {
    items: Vec<SubscriptionItemForm<'a>>,
    proration_behavior: &'static str,
    metadata: HashMap<&'static str, &'a str>,
}

#[derive(Debug, Serialize)]
struct CancelAtPeriodEndForm {
    cancel_at_period_end: bool,
}

#[derive(Debug, Serialize)]
struct FromSubscriptionForm<'a> {
    from_subscription: &'a str,
}

#[derive(Debug, Serialize)]
struct PhaseForm<'a> {
    items: Vec<LineItemForm<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iterations: Option<u32>,
}

#[derive(Debug, Serialize)]
struct UpdateScheduleForm<'a> {
    end_behavior: &'static str,
    phases: Vec<PhaseForm<'a>>,
    metadata: HashMap<&'static str, &'a str>,
}

#[derive(Debug, Serialize)]
struct PortalSessionForm<'a> {
    customer: &'a str,
    return_url: &'a str,
}

/// Live Stripe client
#[derive(Clone)]
pub struct StripeProvider {
    client: stripe::Client,
}

impl StripeProvider {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: stripe::Client::new(config.secret_key.clone()),
        }
    }
}

#[async_trait]
impl BillingProvider for StripeProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CreatedCheckoutSession> {
        let metadata = HashMap::from([
            (META_USER_ID, request.user_id.to_string()),
            (META_PLAN_ID, request.plan.as_str().to_string()),
        ]);

        let form = CreateCheckoutSessionForm {
            mode: "subscription",
            line_items: vec![LineItemForm {
                price: &request.price_id,
                quantity: 1,
            }],
            success_url: &request.success_url,
            cancel_url: &request.cancel_url,
            client_reference_id: request.user_id.to_string(),
            customer: request.customer_id.as_deref(),
            // Stripe rejects customer and customer_email together
            customer_email: if request.customer_id.is_some() {
                None
            } else {
                request.customer_email.as_deref()
            },
            metadata: metadata.clone(),
            subscription_data: SubscriptionDataForm { metadata },
        };

        let session: Value = self.client.post_form("/checkout/sessions", &form).await?;

        let id = session
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::MalformedPayload("checkout session has no id".into()))?
            .to_string();
        let url = session
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(CreatedCheckoutSession { id, url })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSnapshot> {
        let session: Value = self
            .client
            .get(&format!("/checkout/sessions/{session_id}"))
            .await?;
        CheckoutSessionSnapshot::from_value(&session)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let subscription: Value = self
            .client
            .get(&format!("/subscriptions/{subscription_id}"))
            .await?;
        SubscriptionSnapshot::from_value(&subscription)
    }

    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        plan: PlanId,
    ) -> BillingResult<SubscriptionSnapshot> {
        let form = ChangePriceForm {
            items: vec![SubscriptionItemForm {
                id: item_id,
                price: price_id,
            }],
            proration_behavior: "create_prorations",
            metadata: HashMap::from([(META_PLAN_ID, plan.as_str())]),
        };

        let subscription: Value = self
            .client
            .post_form(&format!("/subscriptions/{subscription_id}"), &form)
            .await?;
        SubscriptionSnapshot::from_value(&subscription)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        let subscription: Value = self
            .client
            .post_form(
                &format!("/subscriptions/{subscription_id}"),
                &CancelAtPeriodEndForm {
                    cancel_at_period_end: cancel,
                },
            )
            .await?;
        SubscriptionSnapshot::from_value(&subscription)
    }

    async fn retrieve_schedule(&self, schedule_id: &str) -> BillingResult<ScheduleSnapshot> {
        let schedule: Value = self
            .client
            .get(&format!("/subscription_schedules/{schedule_id}"))
            .await?;
        ScheduleSnapshot::from_value(&schedule)
    }

    async fn create_schedule_from_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ScheduleSnapshot> {
        let schedule: Value = self
            .client
            .post_form(
                "/subscription_schedules",
                &FromSubscriptionForm {
                    from_subscription: subscription_id,
                },
            )
            .await?;
        ScheduleSnapshot::from_value(&schedule)
    }

    async fn update_schedule_phases(
        &self,
        schedule_id: &str,
        phases: &[PhaseSpec],
        plan: PlanId,
    ) -> BillingResult<ScheduleSnapshot> {
        let form = UpdateScheduleForm {
            end_behavior: "release",
            phases: phases
                .iter()
                .map(|phase| PhaseForm {
                    items: vec![LineItemForm {
                        price: &phase.price_id,
                        quantity: 1,
                    }],
                    start_date: phase.start_date.map(|t| t.unix_timestamp()),
                    end_date: phase.end_date.map(|t| t.unix_timestamp()),
                    iterations: phase.iterations,
                })
                .collect(),
            metadata: HashMap::from([(META_PLAN_ID, plan.as_str())]),
        };

        let schedule: Value = self
            .client
            .post_form(&format!("/subscription_schedules/{schedule_id}"), &form)
            .await?;
        ScheduleSnapshot::from_value(&schedule)
    }

    async fn release_schedule(&self, schedule_id: &str) -> BillingResult<()> {
        let _: Value = self
            .client
            .post(&format!("/subscription_schedules/{schedule_id}/release"))
            .await?;
        Ok(())
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let session: Value = self
            .client
            .post_form(
                "/billing_portal/sessions",
                &PortalSessionForm {
                    customer: customer_id,
                    return_url,
                },
            )
            .await?;

        session
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BillingError::MalformedPayload("portal session has no url".into()))
    }
}
