//! Stripe Checkout session creation

use std::sync::Arc;

use atasura_shared::PlanId;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::{parse_plan, PlanRegistry};
use crate::provider::{BillingProvider, CheckoutRequest};
use crate::store::BillingStore;

/// Where to send the customer after checkout
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn BillingProvider>,
    registry: PlanRegistry,
    app_base_url: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn BillingProvider>,
        registry: PlanRegistry,
        app_base_url: String,
    ) -> Self {
        Self {
            store,
            provider,
            registry,
            app_base_url,
        }
    }

    pub fn success_url(&self) -> String {
        format!(
            "{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.app_base_url
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/pricing?canceled=true", self.app_base_url)
    }

    /// Start a monthly subscription checkout for `plan`.
    ///
    /// Reuses the stored Stripe customer when there is one so repeat buyers
    /// don't end up with duplicate customers.
    pub async fn create_checkout_session(
        &self,
        plan: &str,
        user_id: Uuid,
        email: Option<&str>,
    ) -> BillingResult<CheckoutResponse> {
        let plan = parse_plan(plan)?;
        if plan == PlanId::Free {
            return Err(BillingError::InvalidPlan(
                "free plan cannot be purchased".to_string(),
            ));
        }
        let price_id = self.registry.resolve_price_id_for_plan(plan)?.to_string();

        let customer_id = self
            .store
            .get_subscription(user_id)
            .await?
            .and_then(|r| r.stripe_customer_id);

        let request = CheckoutRequest {
            user_id,
            plan,
            price_id,
            customer_email: if customer_id.is_none() {
                email.map(str::to_string)
            } else {
                None
            },
            customer_id,
            success_url: self.success_url(),
            cancel_url: self.cancel_url(),
        };

        let session = self.provider.create_checkout_session(&request).await?;
        let url = session.url.ok_or_else(|| {
            BillingError::StripeApi("checkout session has no redirect url".to_string())
        })?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            session_id = %session.id,
            existing_customer = request.customer_id.is_some(),
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id,
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceIds;
    use crate::provider::{FakeBillingProvider, ProviderCall};
    use crate::store::{MemoryBillingStore, SubscriptionPatch};

    fn service() -> (CheckoutService, Arc<MemoryBillingStore>, Arc<FakeBillingProvider>) {
        let store = Arc::new(MemoryBillingStore::new());
        let provider = Arc::new(FakeBillingProvider::new());
        let registry = PlanRegistry::new(PriceIds {
            starter: Some("price_starter".to_string()),
            basic: Some("price_basic".to_string()),
            creator: None,
        });
        let service = CheckoutService::new(
            store.clone(),
            provider.clone(),
            registry,
            "https://app.test".to_string(),
        );
        (service, store, provider)
    }

    #[tokio::test]
    async fn test_checkout_for_new_customer_uses_email() {
        let (service, _, provider) = service();
        let user = Uuid::new_v4();

        let response = service
            .create_checkout_session("basic", user, Some("a@example.com"))
            .await
            .unwrap();
        assert!(response.url.contains(&response.session_id));

        let calls = provider.calls().await;
        let ProviderCall::CreateCheckoutSession(request) = &calls[0] else {
            panic!("expected checkout call");
        };
        assert_eq!(request.price_id, "price_basic");
        assert_eq!(request.customer_email.as_deref(), Some("a@example.com"));
        assert_eq!(request.customer_id, None);
        assert_eq!(
            request.success_url,
            "https://app.test/checkout/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(request.cancel_url, "https://app.test/pricing?canceled=true");
    }

    #[tokio::test]
    async fn test_checkout_reuses_customer() {
        let (service, store, provider) = service();
        let user = Uuid::new_v4();
        store
            .apply_patch(
                user,
                &SubscriptionPatch {
                    stripe_customer_id: Some("cus_existing".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        service
            .create_checkout_session("starter", user, Some("a@example.com"))
            .await
            .unwrap();

        let calls = provider.calls().await;
        let ProviderCall::CreateCheckoutSession(request) = &calls[0] else {
            panic!("expected checkout call");
        };
        assert_eq!(request.customer_id.as_deref(), Some("cus_existing"));
        assert_eq!(request.customer_email, None);
    }

    #[tokio::test]
    async fn test_invalid_and_unconfigured_plans() {
        let (service, _, provider) = service();
        let user = Uuid::new_v4();

        for plan in ["enterprise", "free"] {
            assert!(matches!(
                service.create_checkout_session(plan, user, None).await,
                Err(BillingError::InvalidPlan(_))
            ));
        }
        // creator has no configured price
        assert!(service
            .create_checkout_session("creator", user, None)
            .await
            .is_err());
        assert!(provider.calls().await.is_empty());
    }
}
