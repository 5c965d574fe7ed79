//! Plan registry
//!
//! Maps plans to Stripe prices and monthly credit allotments. Built from
//! [`PriceIds`] so tests and the live service can use different prices.

use atasura_shared::PlanId;
use serde::Serialize;

use crate::config::PriceIds;
use crate::error::{BillingError, BillingResult};

/// A sellable plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanId,
    pub display_name: &'static str,
    pub price_id: Option<String>,
    pub credit_limit: i32,
}

/// Reference to a Stripe price as it appears on a subscription item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceRef {
    pub id: String,
    pub lookup_key: Option<String>,
}

impl PriceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            lookup_key: None,
        }
    }
}

pub fn credit_limit_for_plan(plan: PlanId) -> i32 {
    match plan {
        PlanId::Free => 0,
        PlanId::Starter => 150,
        PlanId::Basic => 300,
        PlanId::Creator => 600,
    }
}

pub fn display_name(plan: PlanId) -> &'static str {
    match plan {
        PlanId::Free => "Free",
        PlanId::Starter => "Starter",
        PlanId::Basic => "Basic",
        PlanId::Creator => "Creator",
    }
}

/// Lookup key set on the Stripe price, e.g. `basic_monthly`
pub fn lookup_key(plan: PlanId) -> Option<&'static str> {
    match plan {
        PlanId::Free => None,
        PlanId::Starter => Some("starter_monthly"),
        PlanId::Basic => Some("basic_monthly"),
        PlanId::Creator => Some("creator_monthly"),
    }
}

pub fn is_upgrade(from: PlanId, to: PlanId) -> bool {
    to.rank() > from.rank()
}

pub fn is_downgrade(from: PlanId, to: PlanId) -> bool {
    to.rank() < from.rank()
}

/// Parse a client supplied plan id
pub fn parse_plan(raw: &str) -> BillingResult<PlanId> {
    raw.parse::<PlanId>()
        .map_err(|_| BillingError::InvalidPlan(raw.to_string()))
}

#[derive(Debug, Clone)]
pub struct PlanRegistry {
    prices: PriceIds,
}

impl PlanRegistry {
    pub fn new(prices: PriceIds) -> Self {
        Self { prices }
    }

    pub fn plan(&self, id: PlanId) -> Plan {
        Plan {
            id,
            display_name: display_name(id),
            price_id: self.prices.for_plan(id).map(str::to_string),
            credit_limit: credit_limit_for_plan(id),
        }
    }

    pub fn plans(&self) -> Vec<Plan> {
        PlanId::ALL.iter().map(|p| self.plan(*p)).collect()
    }

    /// Price to charge for a plan. Fails for free and for unconfigured prices.
    pub fn resolve_price_id_for_plan(&self, plan: PlanId) -> BillingResult<&str> {
        self.prices.for_plan(plan).ok_or_else(|| {
            BillingError::InvalidPlan(format!("{} has no configured price", plan.as_str()))
        })
    }

    /// Plan for a price. Lookup key wins over the raw id; unknown prices map to free.
    pub fn resolve_plan_from_price(&self, price: &PriceRef) -> PlanId {
        if let Some(key) = price.lookup_key.as_deref() {
            if let Some(plan) = PlanId::PAID
                .into_iter()
                .find(|p| lookup_key(*p) == Some(key))
            {
                return plan;
            }
        }

        PlanId::PAID
            .into_iter()
            .find(|p| self.prices.for_plan(*p) == Some(price.id.as_str()))
            .unwrap_or(PlanId::Free)
    }

    /// Plan for a bare price id, as stored in `pending_price_id`
    pub fn plan_for_price_id(&self, price_id: &str) -> PlanId {
        self.resolve_plan_from_price(&PriceRef::new(price_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PlanRegistry {
        PlanRegistry::new(PriceIds {
            starter: Some("price_starter".to_string()),
            basic: Some("price_basic".to_string()),
            creator: Some("price_creator".to_string()),
        })
    }

    #[test]
    fn test_credit_limits() {
        assert_eq!(credit_limit_for_plan(PlanId::Free), 0);
        assert_eq!(credit_limit_for_plan(PlanId::Starter), 150);
        assert_eq!(credit_limit_for_plan(PlanId::Basic), 300);
        assert_eq!(credit_limit_for_plan(PlanId::Creator), 600);
    }

    #[test]
    fn test_free_has_no_price() {
        let err = registry().resolve_price_id_for_plan(PlanId::Free).unwrap_err();
        assert!(matches!(err, BillingError::InvalidPlan(_)));
    }

    #[test]
    fn test_missing_price_is_invalid_plan() {
        let reg = PlanRegistry::new(PriceIds {
            starter: Some("price_starter".to_string()),
            ..Default::default()
        });
        assert!(reg.resolve_price_id_for_plan(PlanId::Starter).is_ok());
        assert!(matches!(
            reg.resolve_price_id_for_plan(PlanId::Creator),
            Err(BillingError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_lookup_key_takes_precedence() {
        let price = PriceRef {
            id: "price_starter".to_string(),
            lookup_key: Some("creator_monthly".to_string()),
        };
        assert_eq!(registry().resolve_plan_from_price(&price), PlanId::Creator);
    }

    #[test]
    fn test_unknown_price_is_free() {
        assert_eq!(registry().plan_for_price_id("price_legacy"), PlanId::Free);
        let price = PriceRef {
            id: "price_legacy".to_string(),
            lookup_key: Some("legacy_monthly".to_string()),
        };
        assert_eq!(registry().resolve_plan_from_price(&price), PlanId::Free);
    }

    #[test]
    fn test_price_roundtrip_for_paid_plans() {
        let reg = registry();
        for plan in PlanId::PAID {
            let price = reg.resolve_price_id_for_plan(plan).unwrap().to_string();
            assert_eq!(reg.plan_for_price_id(&price), plan);
        }
    }

    #[test]
    fn test_upgrade_downgrade_exclusive() {
        for a in PlanId::ALL {
            for b in PlanId::ALL {
                let up = is_upgrade(a, b);
                let down = is_downgrade(a, b);
                assert!(!(up && down), "{a} -> {b} cannot be both");
                if a == b {
                    assert!(!up && !down, "{a} -> {b} is neither");
                } else {
                    assert!(up || down, "{a} -> {b} must be one");
                }
            }
        }
    }

    #[test]
    fn test_parse_plan_rejects_unknown() {
        assert_eq!(parse_plan("starter").unwrap(), PlanId::Starter);
        assert!(matches!(parse_plan("pro"), Err(BillingError::InvalidPlan(_))));
    }
}
