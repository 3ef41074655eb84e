//! Bearer-token identity. Verification never fails a request by itself; an
//! invalid token simply yields an anonymous caller.

use household_state_core::Subject;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

pub trait IdentityProvider: Send + Sync {
    fn verify(&self, token: &str) -> Option<Subject>;
}

/// Authentication is not configured; every caller is anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledIdentity;

impl IdentityProvider for DisabledIdentity {
    fn verify(&self, _token: &str) -> Option<Subject> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: u64,
}

/// HS256 tokens issued by the hosted auth backend.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 30;
        Self { key: DecodingKey::from_secret(secret.as_bytes()), validation }
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn verify(&self, token: &str) -> Option<Subject> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) if !data.claims.sub.trim().is_empty() => {
                Some(Subject { id: data.claims.sub, email: data.claims.email })
            }
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(error = %err, "bearer token rejected");
                None
            }
        }
    }
}

#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|token| !token.is_empty())
}

/// Verified caller for a request, if any.
#[must_use]
pub fn authenticate(provider: &dyn IdentityProvider, headers: &HeaderMap) -> Option<Subject> {
    bearer_token(headers).and_then(|token| provider.verify(token))
}
