use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use household_state_core::HouseholdId;
use serde::{Deserialize, Serialize};

/// Issues checkout/upgrade links for blocked households.
pub trait BillingProvider: Send + Sync {
    /// # Errors
    /// Returns an error when no link can be produced; callers fall back to a login prompt.
    fn create_upgrade_link(&self, household_id: &HouseholdId, email: Option<&str>) -> Result<String>;
}

/// Billing is not configured; every link request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBilling;

impl BillingProvider for DisabledBilling {
    fn create_upgrade_link(&self, _household_id: &HouseholdId, _email: Option<&str>) -> Result<String> {
        Err(anyhow!("billing provider is not configured"))
    }
}

#[derive(Debug, Serialize)]
struct UpgradeLinkRequest<'a> {
    household_id: &'a str,
    email: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct UpgradeLinkResponse {
    url: String,
}

/// Billing endpoint reached over HTTP: `POST {household_id, email}` -> `{url}`.
#[derive(Debug, Clone)]
pub struct HttpBillingProvider {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpBillingProvider {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent, endpoint: endpoint.into() }
    }
}

impl BillingProvider for HttpBillingProvider {
    fn create_upgrade_link(&self, household_id: &HouseholdId, email: Option<&str>) -> Result<String> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(UpgradeLinkRequest { household_id: household_id.as_str(), email })
            .with_context(|| format!("billing request to {} failed", self.endpoint))?;
        let body: UpgradeLinkResponse =
            response.into_json().context("billing response is not valid JSON")?;

        let url = body.url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(anyhow!("billing response carried a non-http url"));
        }
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TBIL-001
    #[test]
    fn disabled_billing_always_fails() {
        let household = match HouseholdId::parse("hh-billing") {
            Ok(id) => id,
            Err(err) => panic!("fixture id should parse: {err}"),
        };
        assert!(DisabledBilling.create_upgrade_link(&household, Some("a@b.test")).is_err());
    }

    // Test IDs: TBIL-002
    #[test]
    fn unreachable_billing_endpoint_is_an_error_not_a_hang() {
        let household = HouseholdId::generate();
        let provider =
            HttpBillingProvider::new("http://127.0.0.1:1/checkout", Duration::from_millis(250));
        assert!(provider.create_upgrade_link(&household, None).is_err());
    }
}
