//! Edge Case Tests for identity token handling
//!
//! Tests boundary conditions in:
//! - Expiry and clock leeway
//! - Subject claim format
//! - Audience checking

#[cfg(test)]
mod jwt_tests {
    use super::super::jwt::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    const SECRET: &str = "edge-identity-secret";

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = sign(json!({ "sub": Uuid::new_v4(), "exp": now() - 3600 }));
        assert!(IdentityVerifier::new(SECRET).verify(&token).is_err());
    }

    #[test]
    fn test_expiry_within_leeway_accepted() {
        let user = Uuid::new_v4();
        let token = sign(json!({ "sub": user, "exp": now() - 5 }));
        let claims = IdentityVerifier::new(SECRET).verify(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert!(claims.email.is_none());
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let token = sign(json!({ "sub": "user-42", "exp": now() + 600 }));
        assert!(IdentityVerifier::new(SECRET).verify(&token).is_err());
    }

    #[test]
    fn test_missing_expiry_rejected() {
        let token = sign(json!({ "sub": Uuid::new_v4() }));
        assert!(IdentityVerifier::new(SECRET).verify(&token).is_err());
    }

    #[test]
    fn test_other_algorithm_rejected() {
        let token = encode(
            &Header::new(Algorithm::HS512),
            &json!({ "sub": Uuid::new_v4(), "exp": now() + 600 }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(IdentityVerifier::new(SECRET).verify(&token).is_err());
    }

    #[test]
    fn test_audience_checked_only_when_configured() {
        let token = sign(json!({
            "sub": Uuid::new_v4(),
            "exp": now() + 600,
            "aud": "authenticated",
        }));

        assert!(IdentityVerifier::new(SECRET).verify(&token).is_ok());
        assert!(IdentityVerifier::new(SECRET)
            .with_audience("authenticated")
            .verify(&token)
            .is_ok());
        assert!(IdentityVerifier::new(SECRET)
            .with_audience("service_role")
            .verify(&token)
            .is_err());
    }
}
