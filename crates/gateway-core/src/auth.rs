use std::sync::Arc;

use gateway_storage::{AuthPrincipal, Store};
use http::HeaderMap;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::{ErrorKind, GatewayError};

/// Resolves the `AuthPrincipal` associated with an inbound proxy request.
/// `async` since principal lookup goes through `Store`.
pub struct PrincipalAuthenticator {
    store: Arc<dyn Store>,
}

impl PrincipalAuthenticator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthPrincipal, GatewayError> {
        let api_key = extract_api_key(headers)
            .ok_or_else(|| GatewayError::new(ErrorKind::PrincipalRejected, "missing api key"))?;

        let principal = self
            .store
            .find_principal_by_api_key(&api_key)
            .await
            .map_err(|err| GatewayError::new(ErrorKind::Internal, err.to_string()))?
            .ok_or_else(|| GatewayError::new(ErrorKind::PrincipalRejected, "unknown api key"))?;

        if !principal.active {
            return Err(GatewayError::new(ErrorKind::PrincipalRejected, "principal is inactive"));
        }
        Ok(principal)
    }
}

/// Extracts the client-supplied credential: `x-goog-api-key` (Gemini
/// convention) or a bearer token, whichever is present. Never logged.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-goog-api-key") {
        return Some(value);
    }
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub exp: i64,
}

/// Administrative authentication: a constant-time bearer compare against the
/// configured admin secret, plus HS256 JWT issuance/verification for
/// `POST /api/auth/login`. Depth deliberately stops at a single subject
/// claim — no refresh tokens, no scopes.
pub struct AdminAuth {
    admin_key_hash: String,
    jwt_secret: Vec<u8>,
    token_ttl_secs: i64,
}

impl AdminAuth {
    pub fn new(admin_key_hash: String, jwt_secret: Vec<u8>, token_ttl_secs: i64) -> Self {
        Self { admin_key_hash, jwt_secret, token_ttl_secs }
    }

    /// Compares a presented plaintext admin key against the stored hash
    /// without a timing oracle.
    pub fn verify_admin_key(&self, presented: &str) -> bool {
        let presented_hash = blake3::hash(presented.as_bytes()).to_hex().to_string();
        presented_hash.as_bytes().ct_eq(self.admin_key_hash.as_bytes()).into()
    }

    pub fn issue_jwt(&self, subject: &str, now_unix: i64) -> Result<String, GatewayError> {
        let claims = AdminClaims { sub: subject.to_string(), exp: now_unix + self.token_ttl_secs };
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(&self.jwt_secret))
            .map_err(|err| GatewayError::new(ErrorKind::Internal, err.to_string()))
    }

    pub fn verify_jwt(&self, token: &str) -> Result<AdminClaims, GatewayError> {
        let data = jsonwebtoken::decode::<AdminClaims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &Validation::default(),
        )
        .map_err(|_| GatewayError::new(ErrorKind::PrincipalRejected, "invalid or expired admin token"))?;
        Ok(data.claims)
    }

    pub fn authenticate_bearer(&self, headers: &HeaderMap) -> Result<AdminClaims, GatewayError> {
        let token = header_value(headers, "authorization")
            .and_then(|v| v.trim().strip_prefix("Bearer ").map(|t| t.trim().to_string()))
            .ok_or_else(|| GatewayError::new(ErrorKind::PrincipalRejected, "missing admin bearer token"))?;
        self.verify_jwt(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_admin_key_accepts_matching_secret() {
        let hash = blake3::hash(b"supersecret").to_hex().to_string();
        let auth = AdminAuth::new(hash, b"jwt-secret".to_vec(), 3600);
        assert!(auth.verify_admin_key("supersecret"));
        assert!(!auth.verify_admin_key("wrong"));
    }

    #[test]
    fn jwt_round_trips_through_issue_and_verify() {
        let hash = blake3::hash(b"supersecret").to_hex().to_string();
        let auth = AdminAuth::new(hash, b"jwt-secret".to_vec(), 3600);
        let token = auth.issue_jwt("admin", 1_700_000_000).unwrap();
        let claims = auth.verify_jwt(&token).unwrap();
        assert_eq!(claims.sub, "admin");
    }

    #[test]
    fn extract_api_key_prefers_goog_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "abc".parse().unwrap());
        headers.insert("authorization", "Bearer xyz".parse().unwrap());
        assert_eq!(extract_api_key(&headers).as_deref(), Some("abc"));
    }
}
