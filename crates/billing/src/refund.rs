//! Refund requests
//!
//! Refunds are not issued automatically. A request is stored with status
//! `pending` for manual review, together with the Stripe customer so support
//! can find the charge.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, RefundRequestRecord};

/// Upper bound on free-text fields
pub const MAX_DETAILS_LEN: usize = 2000;

pub struct RefundService {
    store: Arc<dyn BillingStore>,
}

impl RefundService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn submit_request(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        reason: &str,
        details: &str,
    ) -> BillingResult<RefundRequestRecord> {
        let reason = reason.trim();
        let details = details.trim();
        if reason.is_empty() || details.is_empty() {
            return Err(BillingError::InvalidRequest(
                "reason and details are required".to_string(),
            ));
        }
        if details.chars().count() > MAX_DETAILS_LEN {
            return Err(BillingError::InvalidRequest(format!(
                "details must be at most {MAX_DETAILS_LEN} characters"
            )));
        }

        let stripe_customer_id = self
            .store
            .get_subscription(user_id)
            .await?
            .and_then(|r| r.stripe_customer_id);

        let request = RefundRequestRecord {
            id: Uuid::new_v4(),
            user_id,
            email: email.map(str::to_string),
            stripe_customer_id,
            reason: reason.to_string(),
            details: details.to_string(),
            status: "pending".to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_refund_request(&request).await?;

        tracing::info!(
            user_id = %user_id,
            refund_request_id = %request.id,
            reason = %request.reason,
            "Refund request submitted"
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBillingStore;

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let store = Arc::new(MemoryBillingStore::new());
        let service = RefundService::new(store.clone());
        let user = Uuid::new_v4();

        for (reason, details) in [("", "x"), ("x", "  "), ("", "")] {
            assert!(matches!(
                service.submit_request(user, None, reason, details).await,
                Err(BillingError::InvalidRequest(_))
            ));
        }
        assert!(store.refund_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_stored_as_pending() {
        let store = Arc::new(MemoryBillingStore::new());
        let service = RefundService::new(store.clone());
        let user = Uuid::new_v4();

        let request = service
            .submit_request(user, Some("a@example.com"), "not_satisfied", " quality issues ")
            .await
            .unwrap();
        assert_eq!(request.status, "pending");
        assert_eq!(request.details, "quality issues");

        let stored = store.refund_requests().await;
        assert_eq!(stored, vec![request]);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let store = Arc::new(MemoryBillingStore::new());
        store.set_failing(true);
        let service = RefundService::new(store);
        assert!(matches!(
            service
                .submit_request(Uuid::new_v4(), None, "r", "d")
                .await,
            Err(BillingError::Database(_))
        ));
    }
}
