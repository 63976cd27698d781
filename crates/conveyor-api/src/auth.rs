// Claim extraction
//
// Token issuance and signing live outside the runtime; this layer only
// decodes the claims a validated bearer token carries and places them in
// request scope. With no auth block configured (or no token on the
// request) requests run without claims and list filtering stays off;
// query parameters can still force filters per request.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use std::sync::Arc;

use conveyor_core::AuthClaims;

#[derive(Clone)]
pub struct AuthState {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl AuthState {
    pub fn new(jwt_secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Claims are extracted, not issued, here; expiry enforcement belongs
        // to the issuing provider and tokens without exp stay readable.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(jwt_secret.as_bytes())),
            validation,
        }
    }

    pub fn decode(&self, token: &str) -> Option<AuthClaims> {
        match jsonwebtoken::decode::<AuthClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                tracing::debug!(error = %e, "token decode failed");
                None
            }
        }
    }
}

/// Middleware: decode the bearer token (when present and valid) into an
/// [`AuthClaims`] request extension.
pub async fn extract_claims(
    axum::extract::State(state): axum::extract::State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let claims = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(|token| state.decode(token));

    if let Some(claims) = claims {
        request.extensions_mut().insert(claims);
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_decode_claims() {
        let state = AuthState::new("secret");
        let token = token(
            "secret",
            json!({"role": "user", "tenantId": "A", "programIds": ["p1", "p2"]}),
        );

        let claims = state.decode(&token).unwrap();
        assert_eq!(claims.role.as_deref(), Some("user"));
        assert_eq!(claims.tenant_id.as_deref(), Some("A"));
        assert_eq!(claims.program_ids, vec!["p1", "p2"]);
    }

    #[test]
    fn test_decode_partial_claims() {
        let state = AuthState::new("secret");
        let token = token("secret", json!({"role": "admin"}));

        let claims = state.decode(&token).unwrap();
        assert!(claims.is_admin());
        assert_eq!(claims.tenant_id, None);
        assert!(claims.program_ids.is_empty());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let state = AuthState::new("secret");
        let token = token("other", json!({"role": "admin"}));
        assert!(state.decode(&token).is_none());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let state = AuthState::new("secret");
        assert!(state.decode("not-a-jwt").is_none());
    }
}
