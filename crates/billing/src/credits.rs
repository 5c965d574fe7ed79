//! Credit ledger
//!
//! Balance checks, atomic consumption, free-tier counting and the token log
//! side channel. Paid plans spend credits; the free plan is limited by a
//! separate usage counter.

use std::sync::Arc;

use atasura_shared::PlanId;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CreditPolicy;
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, GenerationLogEntry};
use crate::tasks::spawn_best_effort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditCheck {
    pub plan: PlanId,
    pub credits_remaining: i32,
    pub credits_limit: i32,
    pub has_credits: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientCredits,
    DbError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed {
        credits_consumed: i32,
        credits_remaining: i32,
    },
    Rejected {
        reason: RejectReason,
        /// Balance at rejection time, when it could be read
        credits_remaining: Option<i32>,
    },
}

impl ConsumeOutcome {
    /// Convert a rejection into the matching error
    pub fn into_result(self) -> BillingResult<i32> {
        match self {
            ConsumeOutcome::Consumed {
                credits_remaining, ..
            } => Ok(credits_remaining),
            ConsumeOutcome::Rejected {
                reason: RejectReason::InsufficientCredits,
                credits_remaining,
            } => Err(BillingError::InsufficientCredits {
                remaining: credits_remaining.unwrap_or(0),
            }),
            ConsumeOutcome::Rejected {
                reason: RejectReason::DbError,
                ..
            } => Err(BillingError::Database(
                "credit consumption failed".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreePlanStatus {
    pub plan: PlanId,
    pub uses: i32,
    pub limit: i32,
    pub allowed: bool,
    pub locked: bool,
}

/// Balance view returned by `GET /credits`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalance {
    pub plan: PlanId,
    pub credits_remaining: i32,
    pub credits_limit: i32,
    pub monthly_usage_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub credits_reset_at: Option<OffsetDateTime>,
    pub free_plan: FreePlanStatus,
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn BillingStore>,
    policy: CreditPolicy,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BillingStore>, policy: CreditPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> CreditPolicy {
        self.policy
    }

    /// `required = 0` asks whether any credits are left at all
    pub async fn check_credits(&self, user_id: Uuid, required: i32) -> BillingResult<CreditCheck> {
        let record = self.store.get_subscription(user_id).await?;

        let (plan, remaining, limit) = match record {
            Some(r) => (r.plan, r.credits_remaining, r.credits_limit),
            None => (PlanId::Free, 0, 0),
        };

        let has_credits = if required == 0 {
            remaining > 0
        } else {
            remaining >= required
        };

        Ok(CreditCheck {
            plan,
            credits_remaining: remaining,
            credits_limit: limit,
            has_credits,
        })
    }

    /// Spend `amount` credits in one conditional update
    pub async fn consume_credits(
        &self,
        user_id: Uuid,
        amount: i32,
        session_id: Option<&str>,
    ) -> BillingResult<ConsumeOutcome> {
        if amount < 1 {
            return Err(BillingError::InvalidRequest(
                "amount must be at least 1".to_string(),
            ));
        }

        match self.store.consume_credits(user_id, amount).await {
            Ok(Some(remaining)) => {
                tracing::info!(
                    user_id = %user_id,
                    amount,
                    credits_remaining = remaining,
                    session_id = ?session_id,
                    "Consumed credits"
                );
                Ok(ConsumeOutcome::Consumed {
                    credits_consumed: amount,
                    credits_remaining: remaining,
                })
            }
            Ok(None) => {
                let remaining = self
                    .store
                    .get_subscription(user_id)
                    .await
                    .ok()
                    .map(|r| r.map(|r| r.credits_remaining).unwrap_or(0));
                tracing::info!(
                    user_id = %user_id,
                    amount,
                    credits_remaining = ?remaining,
                    "Credit consumption rejected: insufficient credits"
                );
                Ok(ConsumeOutcome::Rejected {
                    reason: RejectReason::InsufficientCredits,
                    credits_remaining: remaining,
                })
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    amount,
                    error = %e,
                    "Credit consumption failed"
                );
                Ok(ConsumeOutcome::Rejected {
                    reason: RejectReason::DbError,
                    credits_remaining: None,
                })
            }
        }
    }

    pub async fn check_free_plan_limit(&self, user_id: Uuid) -> BillingResult<FreePlanStatus> {
        let plan = self
            .store
            .get_subscription(user_id)
            .await?
            .map(|r| r.plan)
            .unwrap_or(PlanId::Free);
        let limit = self.policy.free_plan_script_limit;

        if !plan.is_free() {
            return Ok(FreePlanStatus {
                plan,
                uses: 0,
                limit,
                allowed: true,
                locked: false,
            });
        }

        let uses = self.store.free_script_uses(user_id).await?;
        let allowed = uses < limit;
        Ok(FreePlanStatus {
            plan,
            uses,
            limit,
            allowed,
            locked: !allowed,
        })
    }

    /// Like [`check_free_plan_limit`](Self::check_free_plan_limit), but an exhausted
    /// allowance is an error
    pub async fn require_free_allowance(&self, user_id: Uuid) -> BillingResult<FreePlanStatus> {
        let status = self.check_free_plan_limit(user_id).await?;
        if !status.allowed {
            return Err(BillingError::FreePlanLimitReached {
                uses: status.uses,
                limit: status.limit,
            });
        }
        Ok(status)
    }

    pub fn increment_free_script_uses(&self, user_id: Uuid) -> JoinHandle<()> {
        let store = self.store.clone();
        spawn_best_effort("increment_free_script_uses", async move {
            let uses = store.increment_free_script_uses(user_id).await?;
            tracing::debug!(user_id = %user_id, uses, "Incremented free script uses");
            Ok::<(), BillingError>(())
        })
    }

    pub fn log_generation_tokens(&self, entry: GenerationLogEntry) -> JoinHandle<()> {
        let store = self.store.clone();
        spawn_best_effort("log_generation_tokens", async move {
            store.insert_generation_log(&entry).await
        })
    }

    pub async fn balance(&self, user_id: Uuid) -> BillingResult<CreditBalance> {
        let record = self.store.get_subscription(user_id).await?;
        let free_plan = self.check_free_plan_limit(user_id).await?;

        Ok(match record {
            Some(r) => CreditBalance {
                plan: r.plan,
                credits_remaining: r.credits_remaining,
                credits_limit: r.credits_limit,
                monthly_usage_count: r.monthly_usage_count,
                credits_reset_at: r.credits_reset_at,
                free_plan,
            },
            None => CreditBalance {
                plan: PlanId::Free,
                credits_remaining: 0,
                credits_limit: 0,
                monthly_usage_count: 0,
                credits_reset_at: None,
                free_plan,
            },
        })
    }
}
