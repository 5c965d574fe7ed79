#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Atasura Shared
//!
//! Types and database helpers shared by the API and billing crates.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{GenerationAction, PlanId, SubscriptionStatus, UnknownPlan};
