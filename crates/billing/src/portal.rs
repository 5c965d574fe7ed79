//! Stripe customer portal

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::BillingStore;

pub struct PortalService {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn BillingProvider>,
    app_base_url: String,
}

impl PortalService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn BillingProvider>,
        app_base_url: String,
    ) -> Self {
        Self {
            store,
            provider,
            app_base_url,
        }
    }

    /// Portal URL for the user's Stripe customer. Fails with `NoCustomer`
    /// for users who never completed a checkout.
    pub async fn create_portal_session(
        &self,
        user_id: Uuid,
        return_url: Option<&str>,
    ) -> BillingResult<String> {
        let customer_id = self
            .store
            .get_subscription(user_id)
            .await?
            .and_then(|r| r.stripe_customer_id)
            .ok_or(BillingError::NoCustomer)?;

        let return_url = self.resolve_return_url(return_url);

        let url = self
            .provider
            .create_portal_session(&customer_id, &return_url)
            .await?;

        tracing::info!(user_id = %user_id, customer_id = %customer_id, "Created portal session");
        Ok(url)
    }

    /// Only same-origin return URLs are passed through; anything else
    /// falls back to the settings page
    pub fn resolve_return_url(&self, requested: Option<&str>) -> String {
        let base = self.app_base_url.trim_end_matches('/');
        match requested.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) if url == base || url.starts_with(&format!("{base}/")) => url.to_string(),
            Some(url) => {
                tracing::warn!(return_url = %url, "Rejected portal return URL outside the app");
                format!("{base}/settings")
            }
            None => format!("{base}/settings"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FakeBillingProvider, ProviderCall};
    use crate::store::{MemoryBillingStore, SubscriptionPatch};

    #[tokio::test]
    async fn test_portal_requires_customer() {
        let store = Arc::new(MemoryBillingStore::new());
        let provider = Arc::new(FakeBillingProvider::new());
        let service = PortalService::new(store.clone(), provider.clone(), "https://app.test".into());
        let user = Uuid::new_v4();

        assert!(matches!(
            service.create_portal_session(user, None).await,
            Err(BillingError::NoCustomer)
        ));

        store
            .apply_patch(
                user,
                &SubscriptionPatch {
                    stripe_customer_id: Some("cus_9".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let url = service.create_portal_session(user, Some("")).await.unwrap();
        assert!(url.contains("cus_9"));
        assert_eq!(
            provider.calls().await,
            vec![ProviderCall::CreatePortalSession {
                customer_id: "cus_9".to_string()
            }]
        );
    }

    #[test]
    fn test_return_url_must_stay_on_app_origin() {
        let service = PortalService::new(
            Arc::new(MemoryBillingStore::new()),
            Arc::new(FakeBillingProvider::new()),
            "https://app.test/".into(),
        );

        assert_eq!(
            service.resolve_return_url(Some("https://app.test/billing?tab=plan")),
            "https://app.test/billing?tab=plan"
        );
        assert_eq!(service.resolve_return_url(None), "https://app.test/settings");
        assert_eq!(service.resolve_return_url(Some("  ")), "https://app.test/settings");

        for hostile in [
            "https://evil.example/phish",
            "https://app.test.evil.example/",
            "//evil.example",
            "javascript:alert(1)",
        ] {
            assert_eq!(
                service.resolve_return_url(Some(hostile)),
                "https://app.test/settings",
                "{hostile}"
            );
        }
    }
}
