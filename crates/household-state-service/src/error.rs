use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use household_state_api::EngineError;
use household_state_core::FieldIssue;
use household_state_ratelimit::RateLimitDecision;
use serde::Serialize;

use crate::SERVICE_CONTRACT_VERSION;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub service_contract_version: &'static str,
    pub kind: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<FieldIssue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Structured error response produced by any pipeline stage.
#[derive(Debug)]
pub struct ServiceError {
    status: StatusCode,
    headers: HeaderMap,
    body: ErrorBody,
}

impl ServiceError {
    fn new(status: StatusCode, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ErrorBody {
                service_contract_version: SERVICE_CONTRACT_VERSION,
                kind,
                detail: detail.into(),
                issues: None,
                upgrade_url: None,
                login_url: None,
                retry_after_secs: None,
            },
        }
    }

    #[must_use]
    pub fn invalid(issues: Vec<FieldIssue>) -> Self {
        let mut error = Self::new(StatusCode::BAD_REQUEST, "invalid_input", "request failed validation");
        error.body.issues = Some(issues);
        error
    }

    #[must_use]
    pub fn missing_household() -> Self {
        Self::invalid(vec![FieldIssue::new("household_id", "no household could be resolved")])
    }

    #[must_use]
    pub fn cross_origin() -> Self {
        Self::new(StatusCode::FORBIDDEN, "cross_origin", "cross-site requests are not allowed")
    }

    #[must_use]
    pub fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "a bearer token is required")
    }

    #[must_use]
    pub fn rate_limited(decision: &RateLimitDecision) -> Self {
        let mut error =
            Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "too many requests; retry later");
        error.headers = decision.headers();
        error.body.retry_after_secs = decision.retry_after_secs;
        error
    }

    #[must_use]
    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.body.kind
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidInput { issues } => Self::invalid(issues),
            EngineError::Unauthorized => {
                Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "household requires its owner")
            }
            EngineError::Forbidden => {
                Self::new(StatusCode::FORBIDDEN, "forbidden", "household belongs to another user")
            }
            EngineError::MeteringBlocked { upgrade_url, login_url, usage } => {
                let mut error = Self::new(
                    StatusCode::PAYMENT_REQUIRED,
                    "metering_blocked",
                    format!("free limit of {} snapshots reached", usage.limit),
                );
                error.body.upgrade_url = upgrade_url;
                error.body.login_url = login_url;
                error
            }
            EngineError::NotFound(what) => {
                Self::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
            }
            EngineError::StoreUnavailable(err) => {
                tracing::error!(error = %format_args!("{err:#}"), "engine store failure");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, self.headers, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use household_state_core::Usage;

    use super::*;

    // Test IDs: TERR-001
    #[test]
    fn engine_errors_map_to_stable_kinds_and_statuses() {
        let cases = [
            (EngineError::invalid("deltas", "bad"), StatusCode::BAD_REQUEST, "invalid_input"),
            (EngineError::Unauthorized, StatusCode::UNAUTHORIZED, "unauthorized"),
            (EngineError::Forbidden, StatusCode::FORBIDDEN, "forbidden"),
            (
                EngineError::MeteringBlocked { upgrade_url: None, login_url: None, usage: Usage::new(5, 5) },
                StatusCode::PAYMENT_REQUIRED,
                "metering_blocked",
            ),
            (EngineError::NotFound("snapshot"), StatusCode::NOT_FOUND, "not_found"),
        ];
        for (engine, status, kind) in cases {
            let error = ServiceError::from(engine);
            assert_eq!(error.status(), status);
            assert_eq!(error.kind(), kind);
        }
    }

    // Test IDs: TERR-002
    #[test]
    fn store_failures_never_leak_detail() {
        let error = ServiceError::from(EngineError::StoreUnavailable(anyhow::anyhow!(
            "database disk image is malformed at /var/lib/secret.sqlite3"
        )));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.body.detail, "internal error");
    }
}
