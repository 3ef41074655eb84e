use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use household_state_api::{
    EngineError, HouseholdStateApi, HttpBillingProvider, MergeDeltasRequest, MergeFullRequest,
    MergeResult, MergeSlotRequest, API_CONTRACT_VERSION,
};
use household_state_core::{FieldIssue, HouseholdId, Subject};
use household_state_ratelimit::{RateLimitDecision, RateLimiter};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod auth;
mod config;
mod cookie;
mod error;
mod pipeline;

use auth::{authenticate, DisabledIdentity, IdentityProvider, JwtIdentityProvider};
use config::{Args, LogFormat, PipelineConfig};
use cookie::HouseholdCookie;
use error::ServiceError;
use pipeline::{check_origin, parse_body, rate_limit, resolve_and_authorize, run_engine, HouseholdQuery};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

const WRITE_BUCKET: &str = "state-write";
const READ_BUCKET: &str = "state-read";
const CLAIM_BUCKET: &str = "household-claim";

#[derive(Clone)]
struct ServiceState {
    api: HouseholdStateApi,
    identity: Arc<dyn IdentityProvider>,
    limiter: Arc<RateLimiter>,
    cookie: HouseholdCookie,
    pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClaimRequest {
    #[serde(default)]
    household_id: Option<HouseholdId>,
}

type Peer = Option<ConnectInfo<SocketAddr>>;
type HouseholdQueryResult = Result<Query<HouseholdQuery>, QueryRejection>;

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn query_params(query: HouseholdQueryResult) -> Result<HouseholdQuery, ServiceError> {
    query
        .map(|Query(query)| query)
        .map_err(|err| ServiceError::invalid(vec![FieldIssue::new("query", err.body_text())]))
}

fn respond<T: Serialize>(decision: &RateLimitDecision, data: T) -> Response {
    (decision.headers(), Json(envelope(data))).into_response()
}

fn with_household_cookie(state: &ServiceState, household_id: &HouseholdId, mut response: Response) -> Response {
    match state.cookie.set_cookie(household_id) {
        Ok(cookie) => {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            tracing::warn!(error = %format_args!("{err:#}"), "household cookie not issued");
        }
    }
    response
}

/// Shared shape of the three merge requests.
trait MergeCommand: DeserializeOwned + Send + 'static {
    fn household_slot(&mut self) -> &mut Option<HouseholdId>;
    fn check(&self) -> Result<(), EngineError>;
    fn execute(&self, api: &HouseholdStateApi, caller: Option<&Subject>) -> Result<MergeResult, EngineError>;
}

impl MergeCommand for MergeFullRequest {
    fn household_slot(&mut self) -> &mut Option<HouseholdId> {
        &mut self.household_id
    }

    fn check(&self) -> Result<(), EngineError> {
        self.validate()
    }

    fn execute(&self, api: &HouseholdStateApi, caller: Option<&Subject>) -> Result<MergeResult, EngineError> {
        api.merge_full(self, caller)
    }
}

impl MergeCommand for MergeDeltasRequest {
    fn household_slot(&mut self) -> &mut Option<HouseholdId> {
        &mut self.household_id
    }

    fn check(&self) -> Result<(), EngineError> {
        self.validate()
    }

    fn execute(&self, api: &HouseholdStateApi, caller: Option<&Subject>) -> Result<MergeResult, EngineError> {
        api.merge_deltas(self, caller)
    }
}

impl MergeCommand for MergeSlotRequest {
    fn household_slot(&mut self) -> &mut Option<HouseholdId> {
        &mut self.household_id
    }

    fn check(&self) -> Result<(), EngineError> {
        self.validate()
    }

    fn execute(&self, api: &HouseholdStateApi, caller: Option<&Subject>) -> Result<MergeResult, EngineError> {
        api.merge_single_slot(self, caller)
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/state", get(state_show))
        .route("/v1/state/merge", post(merge::<MergeFullRequest>))
        .route("/v1/state/deltas", post(merge::<MergeDeltasRequest>))
        .route("/v1/state/slot", post(merge::<MergeSlotRequest>))
        .route("/v1/entitlement", get(entitlement_show))
        .route("/v1/household/claim", post(household_claim))
        .with_state(state)
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "household_state=info,warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

fn build_state(args: &Args) -> ServiceState {
    let mut api = HouseholdStateApi::new(args.db.clone()).with_config(args.engine_config());
    if let Some(url) = &args.billing_url {
        api = api.with_billing(Arc::new(HttpBillingProvider::new(
            url.clone(),
            Duration::from_millis(args.billing_timeout_ms),
        )));
    }
    let identity: Arc<dyn IdentityProvider> = match &args.jwt_secret {
        Some(secret) => Arc::new(JwtIdentityProvider::new(secret)),
        None => Arc::new(DisabledIdentity),
    };

    ServiceState {
        api,
        identity,
        limiter: Arc::new(RateLimiter::new(&args.limiter_config())),
        cookie: HouseholdCookie::new(&args.cookie_secret, args.cookie_max_age(), args.cookie_secure),
        pipeline: args.pipeline_config(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    if let Err(err) = args.validate() {
        tracing::error!(error = %err, "configuration error");
        return Err(err);
    }

    let state = build_state(&args);
    let schema = state.api.migrate(false).context("failed to migrate household database")?;
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(
        bind = %args.bind,
        schema_version = ?schema.after_version,
        remote_rate_store = state.limiter.has_remote(),
        "household state service listening"
    );
    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

/// Mutating pipeline: origin, IP limit, parse + validate, resolve household,
/// authorize, IP+household limit, then the metered merge.
async fn merge<C: MergeCommand>(
    State(state): State<ServiceState>,
    peer: Peer,
    query: HouseholdQueryResult,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    check_origin(&state.pipeline, &headers)?;
    let peer = peer.map(|ConnectInfo(addr)| addr);
    let ip_decision = rate_limit(&state, WRITE_BUCKET, &headers, peer, None).await?;

    let query = query_params(query)?;
    let mut command: C = parse_body(&body)?;
    command.check()?;

    let caller = authenticate(state.identity.as_ref(), &headers);
    let from_body = command.household_slot().take();
    let household_id = resolve_and_authorize(&state, from_body, &query, &headers, caller.as_ref()).await?;
    let decision = match &household_id {
        Some(id) => rate_limit(&state, WRITE_BUCKET, &headers, peer, Some(id)).await?,
        None => ip_decision,
    };
    *command.household_slot() = household_id;

    let api = state.api.clone();
    let result = run_engine(move || command.execute(&api, caller.as_ref())).await?;
    let household_id = result.household_id.clone();
    Ok(with_household_cookie(&state, &household_id, respond(&decision, result)))
}

async fn state_show(
    State(state): State<ServiceState>,
    peer: Peer,
    query: HouseholdQueryResult,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    let decision = rate_limit(&state, READ_BUCKET, &headers, peer, None).await?;
    let query = query_params(query)?;
    let caller = authenticate(state.identity.as_ref(), &headers);
    let household_id = resolve_and_authorize(&state, None, &query, &headers, caller.as_ref())
        .await?
        .ok_or_else(ServiceError::missing_household)?;

    let api = state.api.clone();
    let current = run_engine(move || api.current_state(&household_id, caller.as_ref())).await?;
    Ok(respond(&decision, current))
}

async fn entitlement_show(
    State(state): State<ServiceState>,
    peer: Peer,
    query: HouseholdQueryResult,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let peer = peer.map(|ConnectInfo(addr)| addr);
    let decision = rate_limit(&state, READ_BUCKET, &headers, peer, None).await?;
    let query = query_params(query)?;
    let caller = authenticate(state.identity.as_ref(), &headers);
    let household_id = resolve_and_authorize(&state, None, &query, &headers, caller.as_ref())
        .await?
        .ok_or_else(ServiceError::missing_household)?;

    let api = state.api.clone();
    let status = run_engine(move || api.entitlement_status(&household_id, caller.as_ref())).await?;
    Ok(respond(&decision, status))
}

async fn household_claim(
    State(state): State<ServiceState>,
    peer: Peer,
    query: HouseholdQueryResult,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    check_origin(&state.pipeline, &headers)?;
    let peer = peer.map(|ConnectInfo(addr)| addr);
    rate_limit(&state, CLAIM_BUCKET, &headers, peer, None).await?;

    let query = query_params(query)?;
    let request: ClaimRequest =
        if body.is_empty() { ClaimRequest::default() } else { parse_body(&body)? };
    let caller = authenticate(state.identity.as_ref(), &headers).ok_or_else(ServiceError::unauthenticated)?;
    let household_id = pipeline::resolve_household(&state, request.household_id, &query, &headers)?
        .ok_or_else(ServiceError::missing_household)?;
    let decision = rate_limit(&state, CLAIM_BUCKET, &headers, peer, Some(&household_id)).await?;

    let api = state.api.clone();
    let claim_id = household_id.clone();
    let record = run_engine(move || api.claim_household(&claim_id, &caller)).await?;
    Ok(with_household_cookie(&state, &household_id, respond(&decision, record)))
}
