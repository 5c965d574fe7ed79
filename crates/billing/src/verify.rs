//! Checkout session verification
//!
//! Called from the checkout success page. If the webhook has not landed yet,
//! this performs the same upsert so the user sees their plan immediately.
//! Running both paths for the same session is harmless.

use std::sync::Arc;

use atasura_shared::PlanId;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::PlanRegistry;
use crate::provider::BillingProvider;
use crate::reconcile::ReconcileOutcome;
use crate::store::BillingStore;
use crate::webhooks::sync_checkout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Ok,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifySessionResponse {
    pub status: VerifyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanId>,
    pub message: String,
}

pub struct SessionVerifier {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn BillingProvider>,
    registry: PlanRegistry,
}

impl SessionVerifier {
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

    pub async fn verify_session(
        &self,
        session_id: &str,
        caller: Option<Uuid>,
    ) -> BillingResult<VerifySessionResponse> {
        let caller = caller.ok_or(BillingError::Unauthorized)?;
        if session_id.trim().is_empty() {
            return Err(BillingError::InvalidRequest(
                "session_id is required".to_string(),
            ));
        }

        let session = self.provider.retrieve_checkout_session(session_id).await?;

        match session.owner() {
            Some(owner) if owner == caller => {}
            owner => {
                tracing::warn!(
                    session_id = %session_id,
                    caller = %caller,
                    owner = ?owner,
                    "Checkout session verification by non-owner"
                );
                return Err(BillingError::Forbidden(
                    "checkout session belongs to another user".to_string(),
                ));
            }
        }

        if !session.is_paid() {
            return Ok(VerifySessionResponse {
                status: VerifyStatus::Pending,
                plan: None,
                message: "Payment is still processing".to_string(),
            });
        }

        let subscription = match (&session.subscription, &session.subscription_id) {
            (Some(sub), _) => sub.clone(),
            (None, Some(id)) => self.provider.retrieve_subscription(id).await?,
            (None, None) => {
                return Ok(VerifySessionResponse {
                    status: VerifyStatus::Pending,
                    plan: None,
                    message: "Subscription is not created yet".to_string(),
                })
            }
        };

        let outcome = sync_checkout(
            self.store.as_ref(),
            &self.registry,
            caller,
            session.customer_id.as_deref(),
            &subscription,
        )
        .await?;

        let plan = self
            .store
            .get_subscription(caller)
            .await?
            .map(|r| r.plan);

        let message = match outcome {
            ReconcileOutcome::AlreadySynced { .. } => "Subscription already active",
            _ => "Subscription activated",
        };

        Ok(VerifySessionResponse {
            status: VerifyStatus::Ok,
            plan,
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceIds;
    use crate::payload::{CheckoutSessionSnapshot, META_USER_ID};
    use crate::provider::{active_subscription, FakeBillingProvider};
    use crate::store::MemoryBillingStore;
    use std::collections::HashMap;

    struct Fixture {
        verifier: SessionVerifier,
        store: Arc<MemoryBillingStore>,
        provider: Arc<FakeBillingProvider>,
        user: Uuid,
    }

    async fn fixture(paid: bool) -> Fixture {
        let store = Arc::new(MemoryBillingStore::new());
        let provider = Arc::new(FakeBillingProvider::new());
        let user = Uuid::new_v4();
        let metadata = HashMap::from([(META_USER_ID.to_string(), user.to_string())]);

        provider
            .insert_subscription(active_subscription(
                "sub_1",
                "cus_1",
                "price_basic",
                metadata.clone(),
            ))
            .await;
        provider
            .insert_checkout_session(CheckoutSessionSnapshot {
                id: "cs_1".to_string(),
                client_reference_id: Some(user.to_string()),
                customer_id: Some("cus_1".to_string()),
                subscription_id: paid.then(|| "sub_1".to_string()),
                subscription: None,
                payment_status: Some(if paid { "paid" } else { "unpaid" }.to_string()),
                metadata,
            })
            .await;

        let registry = PlanRegistry::new(PriceIds {
            starter: Some("price_starter".to_string()),
            basic: Some("price_basic".to_string()),
            creator: Some("price_creator".to_string()),
        });
        Fixture {
            verifier: SessionVerifier::new(store.clone(), provider.clone(), registry),
            store,
            provider,
            user,
        }
    }

    #[tokio::test]
    async fn test_requires_caller() {
        let f = fixture(true).await;
        assert!(matches!(
            f.verifier.verify_session("cs_1", None).await,
            Err(BillingError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_rejects_other_user() {
        let f = fixture(true).await;
        assert!(matches!(
            f.verifier.verify_session("cs_1", Some(Uuid::new_v4())).await,
            Err(BillingError::Forbidden(_))
        ));
        assert!(f.store.get_subscription(f.user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpaid_is_pending_without_write() {
        let f = fixture(false).await;
        let response = f.verifier.verify_session("cs_1", Some(f.user)).await.unwrap();
        assert_eq!(response.status, VerifyStatus::Pending);
        assert!(f.store.get_subscription(f.user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_paid_session_backfills_then_short_circuits() {
        let f = fixture(true).await;

        let first = f.verifier.verify_session("cs_1", Some(f.user)).await.unwrap();
        assert_eq!(first.status, VerifyStatus::Ok);
        assert_eq!(first.plan, Some(PlanId::Basic));

        let record = f.store.get_subscription(f.user).await.unwrap().unwrap();
        assert_eq!(record.credits_remaining, 300);
        assert_eq!(record.stripe_customer_id.as_deref(), Some("cus_1"));

        f.store.consume_credits(f.user, 10).await.unwrap();

        let second = f.verifier.verify_session("cs_1", Some(f.user)).await.unwrap();
        assert_eq!(second.status, VerifyStatus::Ok);
        assert_eq!(second.message, "Subscription already active");

        let record = f.store.get_subscription(f.user).await.unwrap().unwrap();
        assert_eq!(record.credits_remaining, 290);
    }

    #[tokio::test]
    async fn test_provider_outage_surfaces() {
        let f = fixture(true).await;
        f.provider
            .fail_next(crate::provider::FakeFailure::Unavailable)
            .await;
        let err = f
            .verifier
            .verify_session("cs_1", Some(f.user))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
