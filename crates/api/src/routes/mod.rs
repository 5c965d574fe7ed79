//! HTTP routes

mod checkout;
mod credits;
mod generate;
mod stripe;


use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{optional_auth, require_auth},
    state::AppState,
};

pub use checkout::CreateSessionRequest;
pub use credits::{ConsumeCreditsRequest, ConsumeCreditsResponse};
pub use generate::{GenerateRequest, GenerateResponse};

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let authenticated = Router::new()
        // Credits
        .route("/credits", get(credits::get_credits))
        .route("/credits/consume", post(credits::consume_credits))
        // Checkout
        .route("/checkout/create-session", post(checkout::create_session))
        // Subscription management
        .route("/stripe/subscription", get(stripe::get_subscription))
        .route("/stripe/subscription/upgrade", post(stripe::upgrade))
        .route("/stripe/subscription/downgrade", post(stripe::downgrade))
        .route("/stripe/subscription/cancel", post(stripe::cancel))
        .route("/stripe/portal", post(stripe::create_portal_session))
        .route("/stripe/refund-request", post(stripe::submit_refund_request))
        // Generation gateway
        .route("/generate/outline", post(generate::outline))
        .route("/generate/script", post(generate::script))
        .route("/generate/image", post(generate::image))
        .route("/generate/image-prompt", post(generate::image_prompt))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    // Ownership is enforced inside the verifier, so anonymous callers get
    // a 401 body from the billing error rather than the middleware
    let session_verification = Router::new()
        .route("/stripe/verify-session", post(stripe::verify_session))
        .route_layer(middleware::from_fn_with_state(auth_state, optional_auth));

    // Stripe signs webhooks; no user auth
    let public = Router::new()
        .route("/health", get(health))
        .route("/stripe/webhook", post(stripe::webhook))
        .route("/webhook", post(stripe::webhook));

    Router::new()
        .merge(authenticated)
        .merge(session_verification)
        .merge(public)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
