//! Billing configuration loaded from the environment

use atasura_shared::PlanId;

use crate::error::{BillingError, BillingResult};

/// Stripe price ids for each paid plan
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub starter: Option<String>,
    pub basic: Option<String>,
    pub creator: Option<String>,
}

impl PriceIds {
    pub fn from_env() -> Self {
        Self {
            starter: non_empty_env("STRIPE_PRICE_STARTER"),
            basic: non_empty_env("STRIPE_PRICE_BASIC"),
            creator: non_empty_env("STRIPE_PRICE_CREATOR"),
        }
    }

    pub fn for_plan(&self, plan: PlanId) -> Option<&str> {
        match plan {
            PlanId::Free => None,
            PlanId::Starter => self.starter.as_deref(),
            PlanId::Basic => self.basic.as_deref(),
            PlanId::Creator => self.creator.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Public origin used for checkout and portal redirects
    pub app_base_url: String,
    pub prices: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = non_empty_env("STRIPE_SECRET_KEY")
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = non_empty_env("STRIPE_WEBHOOK_SECRET")
            .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let app_base_url = non_empty_env("APP_BASE_URL")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();

        let prices = PriceIds::from_env();
        for plan in PlanId::PAID {
            if prices.for_plan(plan).is_none() {
                tracing::warn!(plan = %plan, "No Stripe price configured for plan");
            }
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            app_base_url,
            prices,
        })
    }
}

/// Credit costs and free-tier allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditPolicy {
    pub credits_per_video: i32,
    pub credits_per_image: i32,
    pub free_plan_script_limit: i32,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            credits_per_video: 10,
            credits_per_image: 1,
            free_plan_script_limit: 3,
        }
    }
}

impl CreditPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            credits_per_video: parse_env("CREDITS_PER_VIDEO", defaults.credits_per_video),
            credits_per_image: parse_env("CREDITS_PER_IMAGE", defaults.credits_per_image),
            free_plan_script_limit: parse_env(
                "FREE_PLAN_SCRIPT_LIMIT",
                defaults.free_plan_script_limit,
            ),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env(key: &str, default: i32) -> i32 {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<i32>() {
            Ok(v) if v >= 0 => v,
            _ => {
                tracing::warn!(key = %key, value = %raw, default, "Ignoring invalid value");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_has_no_price() {
        let prices = PriceIds {
            starter: Some("price_s".to_string()),
            basic: Some("price_b".to_string()),
            creator: None,
        };
        assert_eq!(prices.for_plan(PlanId::Free), None);
        assert_eq!(prices.for_plan(PlanId::Basic), Some("price_b"));
        assert_eq!(prices.for_plan(PlanId::Creator), None);
    }

    #[test]
    fn test_default_policy() {
        let policy = CreditPolicy::default();
        assert_eq!(policy.credits_per_video, 10);
        assert_eq!(policy.credits_per_image, 1);
        assert_eq!(policy.free_plan_script_limit, 3);
    }
}
