//! Stripe webhook handling
//!
//! Verifies the signature over the raw body, claims the event id in the
//! webhook ledger, then dispatches to a handler by event type. Handlers
//! re-derive local state from the snapshot embedded in the event instead of
//! applying deltas, since Stripe does not guarantee delivery order.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payload::{
    user_id_from_metadata, CheckoutSessionSnapshot, InvoiceSnapshot, ScheduleSnapshot,
    SubscriptionSnapshot, WebhookEvent,
};
use crate::plans::PlanRegistry;
use crate::provider::BillingProvider;
use crate::reconcile::{self, CheckoutSync, ReconcileOutcome};
use crate::store::{BillingStore, EventClaim};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Handled event families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    SubscriptionChanged,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    ScheduleEnded,
}

const DISPATCH: &[(&str, EventKind)] = &[
    ("checkout.session.completed", EventKind::CheckoutCompleted),
    ("customer.subscription.created", EventKind::SubscriptionChanged),
    ("customer.subscription.updated", EventKind::SubscriptionChanged),
    ("customer.subscription.deleted", EventKind::SubscriptionDeleted),
    ("invoice.payment_succeeded", EventKind::InvoicePaid),
    ("invoice.payment_failed", EventKind::InvoicePaymentFailed),
    ("subscription_schedule.canceled", EventKind::ScheduleEnded),
    ("subscription_schedule.released", EventKind::ScheduleEnded),
];

pub fn event_kind(event_type: &str) -> Option<EventKind> {
    DISPATCH
        .iter()
        .find(|(name, _)| *name == event_type)
        .map(|(_, kind)| *kind)
}

/// Check a `Stripe-Signature` header (`t=...,v1=...`) against the raw body
pub fn verify_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Build a valid signature header, for tests and local tooling
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let signature = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(format!("{timestamp}.{payload}").as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    };
    format!("t={timestamp},v1={signature}")
}

pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn BillingProvider>,
    registry: PlanRegistry,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn BillingProvider>,
        registry: PlanRegistry,
        webhook_secret: String,
    ) -> Self {
        Self {
            store,
            provider,
            registry,
            webhook_secret,
        }
    }

    /// Verify and parse a webhook body. Nothing is parsed before the
    /// signature checks out.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(&self.webhook_secret, payload, signature, now)?;

        let event = WebhookEvent::parse(payload)?;
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            api_version = ?event.api_version,
            "Verified Stripe webhook"
        );
        Ok(event)
    }

    /// Process a verified event at most once per event id.
    ///
    /// Errors are recorded in the ledger and returned so the caller answers
    /// with a 5xx and Stripe redelivers.
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<ReconcileOutcome> {
        let Some(kind) = event_kind(&event.event_type) else {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring unhandled Stripe event type"
            );
            return Ok(ReconcileOutcome::Ignored {
                event_type: event.event_type.clone(),
            });
        };

        match self
            .store
            .claim_webhook_event(&event.id, &event.event_type, event.created)
            .await?
        {
            EventClaim::Claimed => {}
            EventClaim::Duplicate { processing_result } => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    processing_result = ?processing_result,
                    "Duplicate webhook event"
                );
                return Ok(ReconcileOutcome::Duplicate);
            }
        }

        let result = self.process(kind, event).await;

        let recorded = match &result {
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = self.store.finish_webhook_event(&event.id, recorded).await {
            // The event stays in 'processing' and becomes reclaimable after the timeout
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        match &result {
            Ok(outcome) => tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                outcome = ?outcome,
                "Processed Stripe webhook"
            ),
            Err(e) => tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Stripe webhook processing failed"
            ),
        }

        result
    }

    async fn process(
        &self,
        kind: EventKind,
        event: &WebhookEvent,
    ) -> BillingResult<ReconcileOutcome> {
        match kind {
            EventKind::CheckoutCompleted => {
                let session = CheckoutSessionSnapshot::from_value(&event.object)?;
                self.on_checkout_completed(&session).await
            }
            EventKind::SubscriptionChanged => {
                let subscription = SubscriptionSnapshot::from_value(&event.object)?;
                self.on_subscription_changed(&subscription).await
            }
            EventKind::SubscriptionDeleted => {
                let subscription = SubscriptionSnapshot::from_value(&event.object)?;
                self.on_subscription_deleted(&subscription).await
            }
            EventKind::InvoicePaid => {
                let invoice = InvoiceSnapshot::from_value(&event.object)?;
                self.on_invoice_paid(&invoice).await
            }
            EventKind::InvoicePaymentFailed => {
                let invoice = InvoiceSnapshot::from_value(&event.object)?;
                self.on_invoice_payment_failed(&invoice).await
            }
            EventKind::ScheduleEnded => {
                let schedule = ScheduleSnapshot::from_value(&event.object)?;
                self.on_schedule_ended(&schedule).await
            }
        }
    }

    /// Apply a completed checkout. Shared with session verification.
    pub async fn on_checkout_completed(
        &self,
        session: &CheckoutSessionSnapshot,
    ) -> BillingResult<ReconcileOutcome> {
        let user_id = match session.owner() {
            Some(id) => id,
            None => match session.customer_id.as_deref() {
                Some(customer) => match self.store.find_user_by_customer(customer).await? {
                    Some(id) => id,
                    None => return Ok(self.unresolved("checkout session", &session.id)),
                },
                None => return Ok(self.unresolved("checkout session", &session.id)),
            },
        };

        let subscription = match (&session.subscription, &session.subscription_id) {
            (Some(sub), _) => sub.clone(),
            (None, Some(id)) => self.provider.retrieve_subscription(id).await?,
            (None, None) => {
                return Ok(ReconcileOutcome::skipped(
                    "checkout session has no subscription",
                ))
            }
        };

        sync_checkout(
            self.store.as_ref(),
            &self.registry,
            user_id,
            session.customer_id.as_deref(),
            &subscription,
        )
        .await
    }

    async fn on_subscription_changed(
        &self,
        subscription: &SubscriptionSnapshot,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(user_id) = self
            .resolve_user(&subscription.metadata, subscription.customer_id.as_deref(), Some(&subscription.id))
            .await?
        else {
            return Ok(self.unresolved("subscription", &subscription.id));
        };

        let existing = self.store.get_subscription(user_id).await?;
        if reconcile::is_stale_subscription(existing.as_ref(), &subscription.id) {
            return Ok(ReconcileOutcome::skipped(format!(
                "subscription {} is not the user's current subscription",
                subscription.id
            )));
        }

        let scheduled_price = match subscription.schedule_id.as_deref() {
            Some(schedule_id) => {
                let schedule = self.provider.retrieve_schedule(schedule_id).await?;
                if schedule.phases.len() > 1 {
                    schedule.final_price_id().map(str::to_string)
                } else {
                    None
                }
            }
            None => None,
        };

        let patch = reconcile::subscription_update_patch(
            existing.as_ref(),
            subscription,
            scheduled_price.as_deref(),
            &self.registry,
        );
        let record = self.store.apply_patch(user_id, &patch).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            plan = %record.plan,
            status = %record.status,
            credits_reset = patch.credits.is_some(),
            pending_price_id = ?record.pending_price_id,
            "Synced subscription"
        );

        Ok(ReconcileOutcome::Applied {
            user_id,
            action: "subscription_synced",
        })
    }

    async fn on_subscription_deleted(
        &self,
        subscription: &SubscriptionSnapshot,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(user_id) = self
            .resolve_user(&subscription.metadata, subscription.customer_id.as_deref(), Some(&subscription.id))
            .await?
        else {
            return Ok(self.unresolved("subscription", &subscription.id));
        };

        let existing = self.store.get_subscription(user_id).await?;
        if reconcile::is_stale_subscription(existing.as_ref(), &subscription.id) {
            return Ok(ReconcileOutcome::skipped(format!(
                "deleted subscription {} was already replaced",
                subscription.id
            )));
        }

        self.store
            .apply_patch(user_id, &reconcile::subscription_deleted_patch())
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            "Subscription deleted, reverted to free"
        );

        Ok(ReconcileOutcome::Applied {
            user_id,
            action: "reverted_to_free",
        })
    }

    async fn on_invoice_paid(&self, invoice: &InvoiceSnapshot) -> BillingResult<ReconcileOutcome> {
        if !invoice.is_subscription_cycle() {
            return Ok(ReconcileOutcome::skipped(format!(
                "billing reason {} is not a renewal",
                invoice.billing_reason.as_deref().unwrap_or("none")
            )));
        }

        let Some(user_id) = self
            .resolve_user(
                &invoice.subscription_metadata,
                invoice.customer_id.as_deref(),
                invoice.subscription_id.as_deref(),
            )
            .await?
        else {
            return Ok(self.unresolved("invoice", &invoice.id));
        };

        let existing = self.store.get_subscription(user_id).await?;
        if let Some(sub_id) = invoice.subscription_id.as_deref() {
            if reconcile::is_stale_subscription(existing.as_ref(), sub_id) {
                return Ok(ReconcileOutcome::skipped(format!(
                    "invoice {} belongs to a replaced subscription",
                    invoice.id
                )));
            }
        }

        let patch = reconcile::renewal_patch(existing.as_ref(), invoice, &self.registry);
        let record = self.store.apply_patch(user_id, &patch).await?;

        tracing::info!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            credits_remaining = record.credits_remaining,
            "Monthly renewal: credits reset"
        );

        Ok(ReconcileOutcome::Applied {
            user_id,
            action: "credits_renewed",
        })
    }

    async fn on_invoice_payment_failed(
        &self,
        invoice: &InvoiceSnapshot,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(user_id) = self
            .resolve_user(
                &invoice.subscription_metadata,
                invoice.customer_id.as_deref(),
                invoice.subscription_id.as_deref(),
            )
            .await?
        else {
            return Ok(self.unresolved("invoice", &invoice.id));
        };

        if let Some(sub_id) = invoice.subscription_id.as_deref() {
            let existing = self.store.get_subscription(user_id).await?;
            if reconcile::is_stale_subscription(existing.as_ref(), sub_id) {
                return Ok(ReconcileOutcome::skipped(format!(
                    "failed invoice {} belongs to a replaced subscription",
                    invoice.id
                )));
            }
        }

        self.store
            .apply_patch(user_id, &reconcile::payment_failed_patch())
            .await?;

        tracing::warn!(
            user_id = %user_id,
            invoice_id = %invoice.id,
            "Invoice payment failed, subscription marked past_due"
        );

        Ok(ReconcileOutcome::Applied {
            user_id,
            action: "marked_past_due",
        })
    }

    async fn on_schedule_ended(
        &self,
        schedule: &ScheduleSnapshot,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(user_id) = self
            .resolve_user(
                &schedule.metadata,
                schedule.customer_id.as_deref(),
                schedule.subscription_id.as_deref(),
            )
            .await?
        else {
            return Ok(self.unresolved("subscription schedule", &schedule.id));
        };

        self.store
            .apply_patch(user_id, &reconcile::schedule_ended_patch())
            .await?;

        tracing::info!(
            user_id = %user_id,
            schedule_id = %schedule.id,
            status = ?schedule.status,
            "Subscription schedule ended, pending price cleared"
        );

        Ok(ReconcileOutcome::Applied {
            user_id,
            action: "pending_cleared",
        })
    }

    /// Metadata first, then reverse lookups by customer and subscription id
    async fn resolve_user(
        &self,
        metadata: &std::collections::HashMap<String, String>,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(user_id) = user_id_from_metadata(metadata) {
            return Ok(Some(user_id));
        }
        if let Some(customer) = customer_id {
            if let Some(user_id) = self.store.find_user_by_customer(customer).await? {
                return Ok(Some(user_id));
            }
        }
        if let Some(sub_id) = subscription_id {
            return self.store.find_user_by_subscription(sub_id).await;
        }
        Ok(None)
    }

    fn unresolved(&self, object: &str, id: &str) -> ReconcileOutcome {
        tracing::warn!(object = %object, id = %id, "Could not resolve user for Stripe object");
        ReconcileOutcome::skipped(format!("no user for {object} {id}"))
    }
}

/// Upsert a paid checkout for `user_id` unless already synced
pub async fn sync_checkout(
    store: &dyn BillingStore,
    registry: &PlanRegistry,
    user_id: Uuid,
    customer_id: Option<&str>,
    subscription: &SubscriptionSnapshot,
) -> BillingResult<ReconcileOutcome> {
    let existing = store.get_subscription(user_id).await?;

    match reconcile::decide_checkout_sync(existing.as_ref(), subscription, registry) {
        CheckoutSync::AlreadySynced => {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                "Subscription already synced"
            );
            Ok(ReconcileOutcome::AlreadySynced { user_id })
        }
        CheckoutSync::Apply(mut patch) => {
            if patch.stripe_customer_id.is_none() {
                patch.stripe_customer_id = customer_id.map(str::to_string);
            }
            let record = store.apply_patch(user_id, &patch).await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                plan = %record.plan,
                credits_remaining = record.credits_remaining,
                "Checkout synced"
            );
            Ok(ReconcileOutcome::Applied {
                user_id,
                action: "checkout_synced",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_payload(SECRET, payload, 1_700_000_000);
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = sign_payload(SECRET, r#"{"id":"evt_1"}"#, 1_700_000_000);
        assert!(matches!(
            verify_signature(SECRET, r#"{"id":"evt_2"}"#, &header, 1_700_000_000),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = sign_payload("whsec_other", payload, 1_700_000_000);
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let header = sign_payload(SECRET, payload, 1_700_000_000);
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_301).is_err());
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_300).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        for header in ["", "t=abc,v1=00", "v1=deadbeef", "t=1700000000"] {
            assert!(
                verify_signature(SECRET, "{}", header, 1_700_000_000).is_err(),
                "header {header:?} should fail"
            );
        }
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let payload = "{}";
        let valid = sign_payload(SECRET, payload, 1_700_000_000);
        let sig = valid.split("v1=").nth(1).unwrap();
        let header = format!("t=1700000000,v1=0000,v1={sig},v0=ignored");
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_dispatch_table() {
        assert_eq!(
            event_kind("checkout.session.completed"),
            Some(EventKind::CheckoutCompleted)
        );
        // Fired alongside invoice.payment_succeeded for the same invoice
        assert_eq!(event_kind("invoice.paid"), None);
        assert_eq!(
            event_kind("invoice.payment_succeeded"),
            Some(EventKind::InvoicePaid)
        );
        assert_eq!(
            event_kind("subscription_schedule.released"),
            Some(EventKind::ScheduleEnded)
        );
        assert_eq!(event_kind("customer.created"), None);
    }
}
