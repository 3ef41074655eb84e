//! Request pipeline stages. Each stage either passes or short-circuits with a
//! [`ServiceError`]; handlers call them in a fixed order.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::http::header::{HOST, ORIGIN};
use axum::http::HeaderMap;
use household_state_api::{parse_household_id, EngineError};
use household_state_core::{FieldIssue, HouseholdId, Subject};
use household_state_ratelimit::{client_identity, RateLimitDecision, RateLimitKey};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::PipelineConfig;
use crate::error::ServiceError;
use crate::ServiceState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HouseholdQuery {
    #[serde(default)]
    pub household_id: Option<String>,
}

/// Stage 1: reject cross-site calls when same-origin enforcement is on.
///
/// Requests without an `Origin` header are same-origin or non-browser calls
/// and pass, unless the browser marked them `Sec-Fetch-Site: cross-site`.
///
/// # Errors
/// [`ServiceError::cross_origin`] when the origin is not allowed.
pub fn check_origin(config: &PipelineConfig, headers: &HeaderMap) -> Result<(), ServiceError> {
    if !config.enforce_same_origin {
        return Ok(());
    }
    let Some(origin) = header_str(headers, ORIGIN.as_str()) else {
        return match header_str(headers, "sec-fetch-site") {
            Some("cross-site") => Err(ServiceError::cross_origin()),
            _ => Ok(()),
        };
    };
    let origin = origin.trim_end_matches('/');
    if config.allowed_origins.iter().any(|allowed| allowed == origin) {
        return Ok(());
    }
    let same_host = header_str(headers, HOST.as_str()).is_some_and(|host| {
        origin.strip_prefix("https://").or_else(|| origin.strip_prefix("http://")) == Some(host)
    });
    if same_host {
        Ok(())
    } else {
        tracing::debug!(origin, "cross-origin request rejected");
        Err(ServiceError::cross_origin())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Stages 2 and 6: count the request and reject it once the window is spent.
///
/// # Errors
/// [`ServiceError::rate_limited`] carrying `Retry-After` and `X-RateLimit-*`.
pub async fn rate_limit(
    state: &ServiceState,
    bucket: &str,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    household_id: Option<&HouseholdId>,
) -> Result<RateLimitDecision, ServiceError> {
    let client = client_identity(headers, peer);
    let mut key = RateLimitKey::new(bucket, &client);
    let policy = match household_id {
        Some(id) => {
            key = key.with_part(id.as_str());
            state.pipeline.household_policy
        }
        None => state.pipeline.ip_policy,
    };

    let decision = state.limiter.check(&key, policy).await;
    if decision.allowed {
        Ok(decision)
    } else {
        tracing::info!(bucket, client = client.as_str(), "request rate limited");
        Err(ServiceError::rate_limited(&decision))
    }
}

/// Stage 3: decode the raw body into `T`, reporting problems as field issues.
///
/// # Errors
/// [`ServiceError::invalid`] for empty or malformed bodies.
pub fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ServiceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ServiceError::invalid(vec![FieldIssue::new("body", "request body is required")]));
    }
    serde_json::from_slice(body)
        .map_err(|err| ServiceError::invalid(vec![FieldIssue::new("body", err.to_string())]))
}

/// Stage 4: body field, then query parameter, then signed cookie.
///
/// # Errors
/// [`ServiceError::invalid`] when the query parameter is malformed.
pub fn resolve_household(
    state: &ServiceState,
    from_body: Option<HouseholdId>,
    query: &HouseholdQuery,
    headers: &HeaderMap,
) -> Result<Option<HouseholdId>, ServiceError> {
    if from_body.is_some() {
        return Ok(from_body);
    }
    if let Some(raw) = query.household_id.as_deref().filter(|raw| !raw.trim().is_empty()) {
        return parse_household_id(raw).map(Some).map_err(ServiceError::from);
    }
    Ok(state.cookie.read(headers))
}

/// Run a synchronous engine call off the async runtime.
///
/// # Errors
/// The engine's own error, or an internal error if the worker panicked.
pub async fn run_engine<T, F>(call: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(err) => {
            tracing::error!(error = %err, "engine worker failed");
            Err(ServiceError::internal())
        }
    }
}

/// Stages 4 and 5 for routes that need a household: resolve it (falling back
/// to the caller's own household) and check ownership.
///
/// # Errors
/// Missing household, ownership mismatch, or store failure.
pub async fn resolve_and_authorize(
    state: &ServiceState,
    from_body: Option<HouseholdId>,
    query: &HouseholdQuery,
    headers: &HeaderMap,
    caller: Option<&Subject>,
) -> Result<Option<HouseholdId>, ServiceError> {
    let explicit = resolve_household(state, from_body, query, headers)?;
    let api = state.api.clone();
    let caller = caller.cloned();
    run_engine(move || {
        let resolved = api.resolve_household(explicit, caller.as_ref())?;
        if let Some(id) = &resolved {
            api.authorize_access(id, caller.as_ref())?;
        }
        Ok(resolved)
    })
    .await
}
