//! Common types used across Atasura crates

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Plans
// =============================================================================

/// Subscription plan identifier
///
/// Ordered by rank: Free < Starter < Basic < Creator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PlanId {
    #[default]
    Free,
    Starter,
    Basic,
    Creator,
}

impl PlanId {
    /// All plans in rank order
    pub const ALL: [PlanId; 4] = [PlanId::Free, PlanId::Starter, PlanId::Basic, PlanId::Creator];

    /// All plans that are sold through Stripe
    pub const PAID: [PlanId; 3] = [PlanId::Starter, PlanId::Basic, PlanId::Creator];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanId::Free => "free",
            PlanId::Starter => "starter",
            PlanId::Basic => "basic",
            PlanId::Creator => "creator",
        }
    }

    /// Position in the plan ladder, used for upgrade/downgrade decisions
    pub fn rank(&self) -> u8 {
        match self {
            PlanId::Free => 0,
            PlanId::Starter => 1,
            PlanId::Basic => 2,
            PlanId::Creator => 3,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, PlanId::Free)
    }

    /// Parse a stored plan value, treating anything unrecognized as free
    pub fn from_str_lossy(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan: {0}")]
pub struct UnknownPlan(pub String);

impl FromStr for PlanId {
    type Err = UnknownPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanId::Free),
            "starter" => Ok(PlanId::Starter),
            "basic" => Ok(PlanId::Basic),
            "creator" => Ok(PlanId::Creator),
            other => Err(UnknownPlan(other.to_string())),
        }
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Subscription status as mirrored from Stripe
///
/// `Inactive` is local-only: a row that exists before any purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Trialing,
    Incomplete,
    IncompleteExpired,
    Paused,
    #[default]
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    /// Parse a Stripe status string. Unknown values map to `Incomplete`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            "trialing" => SubscriptionStatus::Trialing,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "paused" => SubscriptionStatus::Paused,
            "inactive" => SubscriptionStatus::Inactive,
            _ => SubscriptionStatus::Incomplete,
        }
    }

    /// Whether the subscription still grants paid access
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Generation
// =============================================================================

/// Kind of AI call recorded in the generation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationAction {
    OutlineGeneration,
    ScriptGeneration,
    ImagePromptTranslation,
    ImageGeneration,
}

impl GenerationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationAction::OutlineGeneration => "outline_generation",
            GenerationAction::ScriptGeneration => "script_generation",
            GenerationAction::ImagePromptTranslation => "image_prompt_translation",
            GenerationAction::ImageGeneration => "image_generation",
        }
    }
}

impl std::fmt::Display for GenerationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rank_is_total() {
        let ranks: Vec<u8> = PlanId::ALL.iter().map(|p| p.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert!(PlanId::Free < PlanId::Starter);
        assert!(PlanId::Basic < PlanId::Creator);
    }

    #[test]
    fn test_plan_parsing() {
        assert_eq!("basic".parse::<PlanId>(), Ok(PlanId::Basic));
        assert_eq!(" Creator ".parse::<PlanId>(), Ok(PlanId::Creator));
        assert!("enterprise".parse::<PlanId>().is_err());
        assert_eq!(PlanId::from_str_lossy("gold"), PlanId::Free);
    }

    #[test]
    fn test_plan_serde_lowercase() {
        let json = serde_json::to_string(&PlanId::Starter).unwrap();
        assert_eq!(json, "\"starter\"");
    }

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Inactive,
        ] {
            assert_eq!(SubscriptionStatus::from_str_lossy(status.as_str()), status);
        }
        assert_eq!(
            SubscriptionStatus::from_str_lossy("something_new"),
            SubscriptionStatus::Incomplete
        );
    }

    #[test]
    fn test_status_liveness() {
        assert!(SubscriptionStatus::Active.is_live());
        assert!(SubscriptionStatus::PastDue.is_live());
        assert!(!SubscriptionStatus::Canceled.is_live());
        assert!(!SubscriptionStatus::Inactive.is_live());
    }
}
