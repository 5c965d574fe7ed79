// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries provider messages
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Atasura billing
//!
//! Keeps the local subscription and credit state consistent with Stripe.
//!
//! ## Features
//!
//! - **Plans**: static plan table and price id resolution in both directions
//! - **Credits**: atomic consumption, free-tier limits, token logs
//! - **Checkout**: hosted checkout sessions and post-checkout verification
//! - **Plan changes**: prorated upgrades, scheduled downgrades, cancel and reactivate
//! - **Webhooks**: signature verification, at-most-once processing, reconciliation
//! - **Refunds**: refund requests queued for manual review

pub mod checkout;
pub mod config;
pub mod credits;
pub mod error;
pub mod payload;
pub mod plan_change;
pub mod plans;
pub mod portal;
pub mod provider;
pub mod reconcile;
pub mod refund;
pub mod store;
pub mod tasks;
pub mod verify;
pub mod webhooks;


// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Config
pub use config::{CreditPolicy, PriceIds, StripeConfig};

// Credits
pub use credits::{
    ConsumeOutcome, CreditBalance, CreditCheck, CreditLedger, FreePlanStatus, RejectReason,
};

// Error
pub use error::{BillingError, BillingResult};

// Plan changes
pub use plan_change::{PendingPlan, PlanChangeResult, PlanChangeService, SubscriptionView};

// Plans
pub use plans::{Plan, PlanRegistry, PriceRef};

// Portal
pub use portal::PortalService;

// Provider
pub use provider::{BillingProvider, StripeProvider};

// Reconcile
pub use reconcile::ReconcileOutcome;

// Refund
pub use refund::RefundService;

// Store
pub use store::{
    BillingStore, GenerationLogEntry, MemoryBillingStore, PgBillingStore, SubscriptionRecord,
};

// Verify
pub use verify::{SessionVerifier, VerifySessionResponse, VerifyStatus};

// Webhooks
pub use webhooks::WebhookHandler;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub credits: CreditLedger,
    pub plan_change: PlanChangeService,
    pub plans: PlanRegistry,
    pub portal: PortalService,
    pub refund: RefundService,
    pub verify: SessionVerifier,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let provider: Arc<dyn BillingProvider> = Arc::new(StripeProvider::new(&config));
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));

        Ok(Self::new(config, store, provider, CreditPolicy::from_env()))
    }

    /// Create a new billing service with explicit dependencies
    pub fn new(
        config: StripeConfig,
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn BillingProvider>,
        policy: CreditPolicy,
    ) -> Self {
        let registry = PlanRegistry::new(config.prices.clone());

        Self {
            checkout: CheckoutService::new(
                store.clone(),
                provider.clone(),
                registry.clone(),
                config.app_base_url.clone(),
            ),
            credits: CreditLedger::new(store.clone(), policy),
            plan_change: PlanChangeService::new(store.clone(), provider.clone(), registry.clone()),
            plans: registry.clone(),
            portal: PortalService::new(store.clone(), provider.clone(), config.app_base_url),
            refund: RefundService::new(store.clone()),
            verify: SessionVerifier::new(store.clone(), provider.clone(), registry.clone()),
            webhooks: WebhookHandler::new(store, provider, registry, config.webhook_secret),
        }
    }
}
