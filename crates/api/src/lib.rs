// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries upstream messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Atasura API Library
//!
//! HTTP surface for credits, checkout, subscription management, Stripe
//! webhooks and the billed generation gateway.

pub mod auth;
pub mod config;
pub mod error;
pub mod generation;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
