//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Bearer header and session cookie extraction
//! - Missing and invalid tokens
//! - Optional authentication

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        extract::Extension,
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::super::jwt::test_tokens::*;
    use super::super::jwt::SupabaseJwtVerifier;
    use super::super::middleware::*;

    fn auth_state() -> AuthState {
        AuthState {
            verifier: SupabaseJwtVerifier::new(TEST_SECRET),
        }
    }

    async fn whoami(Extension(user): Extension<AuthUser>) -> String {
        user.user_id.to_string()
    }

    async fn maybe_whoami(user: Option<Extension<AuthUser>>) -> String {
        user.map(|Extension(u)| u.user_id.to_string())
            .unwrap_or_else(|| "anonymous".to_string())
    }

    fn app() -> Router {
        let state = auth_state();
        Router::new()
            .route("/me", get(whoami))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .merge(
                Router::new()
                    .route("/maybe", get(maybe_whoami))
                    .route_layer(middleware::from_fn_with_state(state, optional_auth)),
            )
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let response = app()
            .oneshot(Request::builder().uri("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["code"], "UNAUTHORIZED");
        assert_eq!(body["status"], 401);
    }

    #[tokio::test]
    async fn test_bearer_header_authenticates() {
        let user = Uuid::new_v4();
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/me")
                    .header("Authorization", format!("Bearer {}", valid_token(user)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, user.to_string());
    }

    #[tokio::test]
    async fn test_session_cookie_authenticates() {
        let user = Uuid::new_v4();
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/me")
                    .header(
                        "Cookie",
                        format!("theme=dark; sb-access-token={}", valid_token(user)),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, user.to_string());
    }

    #[tokio::test]
    async fn test_header_wins_over_cookie() {
        let header_user = Uuid::new_v4();
        let cookie_user = Uuid::new_v4();
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/me")
                    .header("Authorization", format!("Bearer {}", valid_token(header_user)))
                    .header("Cookie", format!("sb-access-token={}", valid_token(cookie_user)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(response).await, header_user.to_string());
    }

    #[tokio::test]
    async fn test_invalid_token_is_401() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/me")
                    .header("Authorization", "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_optional_auth_passes_anonymous_and_invalid() {
        let anonymous = app()
            .oneshot(Request::builder().uri("/maybe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::OK);
        assert_eq!(body_string(anonymous).await, "anonymous");

        let invalid = app()
            .oneshot(
                Request::builder()
                    .uri("/maybe")
                    .header("Authorization", "Bearer garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(invalid).await, "anonymous");

        let user = Uuid::new_v4();
        let valid = app()
            .oneshot(
                Request::builder()
                    .uri("/maybe")
                    .header("Authorization", format!("Bearer {}", valid_token(user)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_string(valid).await, user.to_string());
    }
}
