//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Token extraction from header and cookie
//! - Rejection of missing, malformed and foreign tokens
//! - AuthUser injection for downstream handlers

#[cfg(test)]
mod tests {
    use super::super::jwt::{Claims, IdentityVerifier};
    use super::super::middleware::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "test-identity-secret";

    fn mint(secret: &str, user_id: Uuid, exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub: user_id,
            email: Some("writer@example.com".to_string()),
            exp: OffsetDateTime::now_utc().unix_timestamp() + exp_offset_secs,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn app() -> Router {
        let auth_state = AuthState {
            verifier: IdentityVerifier::new(SECRET),
        };
        Router::new()
            .route(
                "/whoami",
                get(|Extension(user): Extension<AuthUser>| async move { user.user_id.to_string() }),
            )
            .layer(middleware::from_fn_with_state(auth_state, require_auth))
    }

    async fn call(request: Request<Body>) -> (StatusCode, String) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_bearer_token_authenticates() {
        let user = Uuid::new_v4();
        let request = Request::builder()
            .uri("/whoami")
            .header(header::AUTHORIZATION, format!("Bearer {}", mint(SECRET, user, 600)))
            .body(Body::empty())
            .unwrap();

        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, user.to_string());
    }

    #[tokio::test]
    async fn test_cookie_token_authenticates() {
        let user = Uuid::new_v4();
        let request = Request::builder()
            .uri("/whoami")
            .header(
                header::COOKIE,
                format!("theme=dark; rewritely_auth_token={}", mint(SECRET, user, 600)),
            )
            .body(Body::empty())
            .unwrap();

        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, user.to_string());
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let request = Request::builder().uri("/whoami").body(Body::empty()).unwrap();

        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["code"], "unauthorized");
        assert_eq!(json["error"], "Authentication required");
    }

    #[tokio::test]
    async fn test_token_signed_with_other_secret_is_rejected() {
        let request = Request::builder()
            .uri("/whoami")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", mint("someone-else", Uuid::new_v4(), 600)),
            )
            .body(Body::empty())
            .unwrap();

        let (status, _) = call(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_rejected() {
        let request = Request::builder()
            .uri("/whoami")
            .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();

        let (status, _) = call(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
