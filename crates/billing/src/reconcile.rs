//! Reconciliation decisions shared by the webhook handler and the
//! session verification backfill
//!
//! Every function here is pure: it derives the target local state from a
//! Stripe snapshot and whatever is stored, and returns the patch to apply.

use atasura_shared::{PlanId, SubscriptionStatus};
use serde::Serialize;
use uuid::Uuid;

use crate::payload::{InvoiceSnapshot, SubscriptionSnapshot};
use crate::plans::{credit_limit_for_plan, PlanRegistry};
use crate::store::{CreditReset, SubscriptionPatch, SubscriptionRecord};

/// What processing a Stripe event did to local state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// A patch was written for this user
    Applied { user_id: Uuid, action: &'static str },
    /// Local state already matched; nothing written
    AlreadySynced { user_id: Uuid },
    /// Recognized event that could not or should not be applied
    Skipped { reason: String },
    /// Event type we do not handle
    Ignored { event_type: String },
    /// Event id already processed or in flight elsewhere
    Duplicate,
}

impl ReconcileOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        ReconcileOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// Outcome of comparing a completed checkout with the stored row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutSync {
    AlreadySynced,
    Apply(SubscriptionPatch),
}

/// What a subscription update should do to the credit balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditAction {
    Keep,
    ResetTo(i32),
}

/// Full upsert after a successful checkout, unless the row already reflects
/// this active subscription
pub fn decide_checkout_sync(
    existing: Option<&SubscriptionRecord>,
    subscription: &SubscriptionSnapshot,
    registry: &PlanRegistry,
) -> CheckoutSync {
    if existing.is_some_and(|r| r.is_synced_with(&subscription.id)) {
        return CheckoutSync::AlreadySynced;
    }

    let plan = plan_of(subscription, registry);
    let mut patch = mirror_patch(subscription, plan);
    patch.credits = Some(CreditReset {
        limit: credit_limit_for_plan(plan),
    });
    patch.pending_price_id = Some(None);
    CheckoutSync::Apply(patch)
}

/// Credits are reset only when the plan actually changes
pub fn plan_change_credit_action(stored: Option<PlanId>, current: PlanId) -> CreditAction {
    match stored {
        Some(plan) if plan == current => CreditAction::Keep,
        _ => CreditAction::ResetTo(credit_limit_for_plan(current)),
    }
}

/// Patch for `customer.subscription.created` / `updated`.
///
/// `pending_price_id` is the final price of an attached multi-phase schedule,
/// when the caller could read one.
pub fn subscription_update_patch(
    existing: Option<&SubscriptionRecord>,
    subscription: &SubscriptionSnapshot,
    scheduled_price_id: Option<&str>,
    registry: &PlanRegistry,
) -> SubscriptionPatch {
    let plan = plan_of(subscription, registry);
    let mut patch = mirror_patch(subscription, plan);

    if let CreditAction::ResetTo(limit) =
        plan_change_credit_action(existing.map(|r| r.plan), plan)
    {
        patch.credits = Some(CreditReset { limit });
        patch.pending_price_id = Some(None);
    }

    if let Some(price_id) = scheduled_price_id {
        if Some(price_id) != subscription.price_id() {
            patch.pending_price_id = Some(Some(price_id.to_string()));
        }
    }

    patch
}

/// Revert to free, keeping the Stripe ids for later lookups
pub fn subscription_deleted_patch() -> SubscriptionPatch {
    SubscriptionPatch {
        plan: Some(PlanId::Free),
        status: Some(SubscriptionStatus::Canceled),
        price_id: Some(None),
        cancel_at_period_end: Some(false),
        pending_price_id: Some(None),
        credits: Some(CreditReset { limit: 0 }),
        ..Default::default()
    }
}

/// Monthly renewal: fresh period bounds and a full allotment
pub fn renewal_patch(
    existing: Option<&SubscriptionRecord>,
    invoice: &InvoiceSnapshot,
    registry: &PlanRegistry,
) -> SubscriptionPatch {
    let invoiced_plan = invoice
        .line_price
        .as_ref()
        .map(|p| registry.resolve_plan_from_price(p))
        .filter(|p| !p.is_free());
    let plan = invoiced_plan
        .or_else(|| existing.map(|r| r.plan))
        .unwrap_or(PlanId::Free);

    let mut patch = SubscriptionPatch {
        stripe_customer_id: invoice.customer_id.clone(),
        stripe_subscription_id: invoice.subscription_id.clone(),
        current_period_start: invoice.line_period_start,
        current_period_end: invoice.line_period_end,
        credits: Some(CreditReset {
            limit: credit_limit_for_plan(plan),
        }),
        ..Default::default()
    };

    // A scheduled change can be invoiced before the subscription update
    // arrives. Record the new plan now so the update sees no plan change
    // and does not reset credits a second time.
    if let (Some(plan), Some(price)) = (invoiced_plan, invoice.line_price.as_ref()) {
        if existing.map(|r| r.plan) != Some(plan) {
            patch.plan = Some(plan);
            patch.price_id = Some(Some(price.id.clone()));
            patch.pending_price_id = Some(None);
        }
    }

    patch
}

pub fn payment_failed_patch() -> SubscriptionPatch {
    SubscriptionPatch {
        status: Some(SubscriptionStatus::PastDue),
        ..Default::default()
    }
}

pub fn schedule_ended_patch() -> SubscriptionPatch {
    SubscriptionPatch {
        pending_price_id: Some(None),
        ..Default::default()
    }
}

/// An event about a subscription other than the one the user currently has
/// active, e.g. the deletion of a plan they replaced
pub fn is_stale_subscription(existing: Option<&SubscriptionRecord>, subscription_id: &str) -> bool {
    existing.is_some_and(|r| {
        r.is_active()
            && r.stripe_subscription_id
                .as_deref()
                .is_some_and(|id| id != subscription_id)
    })
}

fn plan_of(subscription: &SubscriptionSnapshot, registry: &PlanRegistry) -> PlanId {
    subscription
        .price
        .as_ref()
        .map(|p| registry.resolve_plan_from_price(p))
        .unwrap_or(PlanId::Free)
}

/// Fields mirrored verbatim from the subscription
fn mirror_patch(subscription: &SubscriptionSnapshot, plan: PlanId) -> SubscriptionPatch {
    SubscriptionPatch {
        stripe_customer_id: subscription.customer_id.clone(),
        stripe_subscription_id: Some(subscription.id.clone()),
        price_id: Some(subscription.price_id().map(str::to_string)),
        plan: Some(plan),
        status: Some(subscription.status),
        current_period_start: subscription.current_period_start,
        current_period_end: subscription.current_period_end,
        cancel_at_period_end: Some(subscription.cancel_at_period_end),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceIds;
    use crate::plans::PriceRef;
    use std::collections::HashMap;

    fn registry() -> PlanRegistry {
        PlanRegistry::new(PriceIds {
            starter: Some("price_starter".to_string()),
            basic: Some("price_basic".to_string()),
            creator: Some("price_creator".to_string()),
        })
    }

    fn snapshot(id: &str, price: &str, status: SubscriptionStatus) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: id.to_string(),
            customer_id: Some("cus_1".to_string()),
            status,
            item_id: Some("si_1".to_string()),
            price: Some(PriceRef::new(price)),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            schedule_id: None,
            metadata: HashMap::new(),
        }
    }

    fn record(plan: PlanId, sub_id: &str, status: SubscriptionStatus) -> SubscriptionRecord {
        let mut r = SubscriptionRecord::empty(Uuid::new_v4());
        r.plan = plan;
        r.status = status;
        r.stripe_subscription_id = Some(sub_id.to_string());
        r
    }

    #[test]
    fn test_checkout_short_circuits_when_synced() {
        let existing = record(PlanId::Basic, "sub_1", SubscriptionStatus::Active);
        let sub = snapshot("sub_1", "price_basic", SubscriptionStatus::Active);
        assert_eq!(
            decide_checkout_sync(Some(&existing), &sub, &registry()),
            CheckoutSync::AlreadySynced
        );
    }

    #[test]
    fn test_checkout_applies_for_new_subscription() {
        let existing = record(PlanId::Starter, "sub_old", SubscriptionStatus::Canceled);
        let sub = snapshot("sub_new", "price_creator", SubscriptionStatus::Active);

        let CheckoutSync::Apply(patch) = decide_checkout_sync(Some(&existing), &sub, &registry())
        else {
            panic!("expected apply");
        };
        assert_eq!(patch.plan, Some(PlanId::Creator));
        assert_eq!(patch.credits, Some(CreditReset { limit: 600 }));
        assert_eq!(patch.pending_price_id, Some(None));
        assert_eq!(patch.stripe_subscription_id.as_deref(), Some("sub_new"));
    }

    #[test]
    fn test_inactive_row_with_same_id_is_resynced() {
        let existing = record(PlanId::Basic, "sub_1", SubscriptionStatus::Incomplete);
        let sub = snapshot("sub_1", "price_basic", SubscriptionStatus::Active);
        assert!(matches!(
            decide_checkout_sync(Some(&existing), &sub, &registry()),
            CheckoutSync::Apply(_)
        ));
    }

    #[test]
    fn test_credit_action_only_on_change() {
        assert_eq!(
            plan_change_credit_action(Some(PlanId::Basic), PlanId::Basic),
            CreditAction::Keep
        );
        assert_eq!(
            plan_change_credit_action(Some(PlanId::Basic), PlanId::Creator),
            CreditAction::ResetTo(600)
        );
        assert_eq!(
            plan_change_credit_action(None, PlanId::Starter),
            CreditAction::ResetTo(150)
        );
    }

    #[test]
    fn test_update_same_plan_keeps_credits() {
        let existing = record(PlanId::Basic, "sub_1", SubscriptionStatus::Active);
        let mut sub = snapshot("sub_1", "price_basic", SubscriptionStatus::Active);
        sub.cancel_at_period_end = true;

        let patch = subscription_update_patch(Some(&existing), &sub, None, &registry());
        assert_eq!(patch.credits, None);
        assert_eq!(patch.pending_price_id, None);
        assert_eq!(patch.cancel_at_period_end, Some(true));
    }

    #[test]
    fn test_update_scheduled_price_becomes_pending() {
        let existing = record(PlanId::Creator, "sub_1", SubscriptionStatus::Active);
        let sub = snapshot("sub_1", "price_creator", SubscriptionStatus::Active);

        let patch =
            subscription_update_patch(Some(&existing), &sub, Some("price_basic"), &registry());
        assert_eq!(patch.pending_price_id, Some(Some("price_basic".to_string())));

        let same = subscription_update_patch(Some(&existing), &sub, Some("price_creator"), &registry());
        assert_eq!(same.pending_price_id, None);
    }

    #[test]
    fn test_deleted_reverts_to_free() {
        let patch = subscription_deleted_patch();
        assert_eq!(patch.plan, Some(PlanId::Free));
        assert_eq!(patch.status, Some(SubscriptionStatus::Canceled));
        assert_eq!(patch.credits, Some(CreditReset { limit: 0 }));
        assert_eq!(patch.price_id, Some(None));
        assert_eq!(patch.stripe_subscription_id, None);
    }

    #[test]
    fn test_renewal_uses_invoiced_plan() {
        let existing = record(PlanId::Basic, "sub_1", SubscriptionStatus::Active);
        let invoice = InvoiceSnapshot {
            id: "in_1".to_string(),
            billing_reason: Some("subscription_cycle".to_string()),
            customer_id: None,
            subscription_id: Some("sub_1".to_string()),
            subscription_metadata: HashMap::new(),
            line_period_start: None,
            line_period_end: None,
            line_price: Some(PriceRef::new("price_creator")),
        };
        let patch = renewal_patch(Some(&existing), &invoice, &registry());
        assert_eq!(patch.credits, Some(CreditReset { limit: 600 }));
        assert_eq!(patch.plan, Some(PlanId::Creator));
        assert_eq!(patch.price_id, Some(Some("price_creator".to_string())));
        assert_eq!(patch.pending_price_id, Some(None));

        let unknown = InvoiceSnapshot {
            line_price: Some(PriceRef::new("price_legacy")),
            ..invoice
        };
        let patch = renewal_patch(Some(&existing), &unknown, &registry());
        assert_eq!(patch.credits, Some(CreditReset { limit: 300 }));
        assert_eq!(patch.plan, None);
        assert_eq!(patch.price_id, None);
    }

    #[test]
    fn test_renewal_on_same_plan_leaves_plan_fields_alone() {
        let existing = record(PlanId::Basic, "sub_1", SubscriptionStatus::Active);
        let invoice = InvoiceSnapshot {
            id: "in_2".to_string(),
            billing_reason: Some("subscription_cycle".to_string()),
            customer_id: None,
            subscription_id: Some("sub_1".to_string()),
            subscription_metadata: HashMap::new(),
            line_period_start: None,
            line_period_end: None,
            line_price: Some(PriceRef::new("price_basic")),
        };
        let patch = renewal_patch(Some(&existing), &invoice, &registry());
        assert_eq!(patch.credits, Some(CreditReset { limit: 300 }));
        assert_eq!(patch.plan, None);
        assert_eq!(patch.pending_price_id, None);
    }

    #[test]
    fn test_stale_subscription_detection() {
        let existing = record(PlanId::Basic, "sub_new", SubscriptionStatus::Active);
        assert!(is_stale_subscription(Some(&existing), "sub_old"));
        assert!(!is_stale_subscription(Some(&existing), "sub_new"));
        assert!(!is_stale_subscription(None, "sub_old"));

        let canceled = record(PlanId::Free, "sub_new", SubscriptionStatus::Canceled);
        assert!(!is_stale_subscription(Some(&canceled), "sub_old"));
    }
}
