//! Signed `hsk_household` cookie carrying the caller's household id.

use std::time::Duration;

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use household_state_core::HouseholdId;
use http::header::COOKIE;
use http::{HeaderMap, HeaderValue};
use sha2::Sha256;

pub const COOKIE_NAME: &str = "hsk_household";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct HouseholdCookie {
    key: Vec<u8>,
    max_age: Duration,
    secure: bool,
}

impl HouseholdCookie {
    #[must_use]
    pub fn new(secret: &str, max_age: Duration, secure: bool) -> Self {
        Self { key: secret.as_bytes().to_vec(), max_age, secure }
    }

    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|err| anyhow!("failed to initialize cookie key: {err}"))
    }

    /// `<id>.<hex hmac-sha256(id)>`
    ///
    /// # Errors
    /// Returns an error when the signing key cannot be initialised.
    pub fn sign(&self, household_id: &HouseholdId) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(household_id.as_str().as_bytes());
        Ok(format!("{household_id}.{}", hex::encode(mac.finalize().into_bytes())))
    }

    /// Household id from a signed value; tampered or malformed values are `None`.
    #[must_use]
    pub fn verify(&self, value: &str) -> Option<HouseholdId> {
        let (raw_id, signature_hex) = value.rsplit_once('.')?;
        let signature = hex::decode(signature_hex).ok()?;
        let mut mac = self.mac().ok()?;
        mac.update(raw_id.as_bytes());
        mac.verify_slice(&signature).ok()?;
        HouseholdId::parse(raw_id).ok()
    }

    #[must_use]
    pub fn read(&self, headers: &HeaderMap) -> Option<HouseholdId> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .filter(|(name, _)| *name == COOKIE_NAME)
            .find_map(|(_, value)| self.verify(value.trim()))
    }

    /// `Set-Cookie` value for `household_id`.
    ///
    /// # Errors
    /// Returns an error when signing fails or the result is not a valid header.
    pub fn set_cookie(&self, household_id: &HouseholdId) -> Result<HeaderValue> {
        let mut cookie = format!(
            "{COOKIE_NAME}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.sign(household_id)?,
            self.max_age.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).map_err(|err| anyhow!("invalid cookie header: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie() -> HouseholdCookie {
        HouseholdCookie::new("cookie-test-secret-0123", Duration::from_secs(3_600), true)
    }

    fn household(raw: &str) -> HouseholdId {
        match HouseholdId::parse(raw) {
            Ok(id) => id,
            Err(err) => panic!("fixture id should parse: {err}"),
        }
    }

    // Test IDs: TCOOK-001
    #[test]
    fn signed_cookie_is_read_back() -> Result<()> {
        let cookie = cookie();
        let id = household("hh-cookie");
        let header = cookie.set_cookie(&id)?;
        let rendered = header.to_str()?;
        assert!(rendered.starts_with("hsk_household=hh-cookie."));
        assert!(rendered.contains("Max-Age=3600"));
        assert!(rendered.ends_with("; Secure"));

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {COOKIE_NAME}={}", cookie.sign(&id)?))?,
        );
        assert_eq!(cookie.read(&headers), Some(id));
        Ok(())
    }

    // Test IDs: TCOOK-002
    #[test]
    fn tampered_or_foreign_cookies_are_ignored() -> Result<()> {
        let cookie = cookie();
        let signed = cookie.sign(&household("hh-real"))?;
        let forged = signed.replacen("hh-real", "hh-fake", 1);
        assert_eq!(cookie.verify(&forged), None);
        assert_eq!(cookie.verify("hh-real"), None);
        assert_eq!(cookie.verify("hh-real.zz"), None);

        let other_key = HouseholdCookie::new("a-different-secret-987", Duration::from_secs(1), false);
        assert_eq!(other_key.verify(&signed), None);
        Ok(())
    }
}
