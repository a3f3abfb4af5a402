//! HTTP surface for the ledger, the limiters and the Orion loop.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::LocalLimitsConfig;
use crate::credits::{
    ChargeOutcome, ConsumeOutcome, ConsumeRequest, CreditCharge, CreditLedger, CreditProfile,
    LedgerError, UsageRecord,
};
use crate::limits::tiered::ceil_secs;
use crate::limits::{
    Decision, FixedWindowLimiter, RateLimitHeaders, Resource, Tier, TieredDecision,
    TieredRateLimiter,
};
use crate::observability::{Observability, ObservabilitySnapshot};
use crate::orion::{LoopOutcome, OrionError, OrionLoop};

const CALLER_HEADER: &str = "x-merse-caller";
const TIER_HEADER: &str = "x-merse-tier";

#[derive(Clone)]
pub struct LedgerHttpState {
    ledger: CreditLedger,
    local_limiter: FixedWindowLimiter,
    local_limits: LocalLimitsConfig,
    tiered: TieredRateLimiter,
    orion: Option<OrionLoop>,
    observability: Arc<Observability>,
    admin_token: Option<String>,
}

impl std::fmt::Debug for LedgerHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerHttpState")
            .field("local_limits", &self.local_limits)
            .field("tiered", &self.tiered)
            .field("orion", &self.orion.is_some())
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl LedgerHttpState {
    pub fn new(ledger: CreditLedger, observability: Arc<Observability>) -> Self {
        let tiered = TieredRateLimiter::new(None, observability.clone());
        Self {
            ledger,
            local_limiter: FixedWindowLimiter::default(),
            local_limits: LocalLimitsConfig::default(),
            tiered,
            orion: None,
            observability,
            admin_token: None,
        }
    }

    pub fn with_local_limits(
        mut self,
        limiter: FixedWindowLimiter,
        limits: LocalLimitsConfig,
    ) -> Self {
        self.local_limiter = limiter;
        self.local_limits = limits;
        self
    }

    pub fn with_tiered_limiter(mut self, tiered: TieredRateLimiter) -> Self {
        self.tiered = tiered;
        self
    }

    pub fn with_orion(mut self, orion: OrionLoop) -> Self {
        self.orion = Some(orion);
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: LedgerHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/credits/:user_id", get(get_profile))
        .route("/credits/charge", post(charge))
        .route("/credits/consume", post(consume))
        .route("/limits/:resource", post(check_tiered_limit))
        .route("/orion/:project_id/advance", post(advance_orion))
        .route("/admin/usage", get(list_usage))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<LedgerHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.observability.snapshot())
}

#[derive(Debug, Deserialize)]
struct ProfileQuery {
    #[serde(default)]
    plan: Option<String>,
}

async fn get_profile(
    State(state): State<LedgerHttpState>,
    Path(user_id): Path<String>,
    Query(query): Query<ProfileQuery>,
) -> Result<Json<CreditProfile>, Response> {
    let profile = state
        .ledger
        .ensure_profile(&user_id, query.plan.as_deref())
        .await
        .map_err(|err| map_ledger_error(err).into_response())?;
    profile.map(Json).ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "invalid_request", "missing user id")
            .into_response()
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeRequest {
    user_id: String,
    #[serde(default)]
    charges: Vec<CreditCharge>,
}

async fn charge(
    State(state): State<LedgerHttpState>,
    Json(request): Json<ChargeRequest>,
) -> Result<Json<ChargeOutcome>, Response> {
    enforce_local_limit(&state, Some(&request.user_id))?;
    state
        .ledger
        .apply_charges(&request.user_id, &request.charges)
        .await
        .map(Json)
        .map_err(|err| map_ledger_error(err).into_response())
}

async fn consume(
    State(state): State<LedgerHttpState>,
    Json(request): Json<ConsumeRequest>,
) -> Result<Json<ConsumeOutcome>, Response> {
    enforce_local_limit(&state, request.user_id.as_deref())?;
    state
        .ledger
        .consume(request)
        .await
        .map(Json)
        .map_err(|err| map_ledger_error(err).into_response())
}

/// Per-user fixed window in front of the ledger routes. Requests without a
/// user are left to the ledger to reject or skip.
fn enforce_local_limit(
    state: &LedgerHttpState,
    user_id: Option<&str>,
) -> Result<(), Response> {
    let Some(user_id) = crate::utils::non_empty(user_id) else {
        return Ok(());
    };
    let identifier = format!("credits:{user_id}");
    match state.local_limiter.check(
        &identifier,
        state.local_limits.default_limit,
        state.local_limits.window_ms,
    ) {
        Decision::Allowed { .. } => Ok(()),
        Decision::Denied { retry_after_ms } => {
            state.observability.record_rate_limited();
            Err(rate_limited_response(retry_after_ms, None))
        }
    }
}

async fn check_tiered_limit(
    State(state): State<LedgerHttpState>,
    Path(resource): Path<String>,
    headers: HeaderMap,
) -> Response {
    let resource = match resource.parse::<Resource>() {
        Ok(resource) => resource,
        Err(message) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", message)
                .into_response();
        }
    };
    let tier_raw = extract_header(&headers, TIER_HEADER);
    let caller = extract_header(&headers, CALLER_HEADER)
        .or_else(|| forwarded_for(&headers))
        .unwrap_or_else(|| "anonymous".to_string());

    let decision = state
        .tiered
        .check(resource, tier_raw.as_deref(), &caller)
        .await;
    let tier = Tier::resolve(tier_raw.as_deref());

    match decision {
        TieredDecision::Denied {
            headers,
            retry_after_ms,
        } => rate_limited_response(retry_after_ms, Some(&headers)),
        TieredDecision::Allowed { headers } => {
            let mut response = Json(json!({
                "allowed": true,
                "resource": resource,
                "tier": tier,
            }))
            .into_response();
            apply_rate_limit_headers(response.headers_mut(), &headers);
            response
        }
        TieredDecision::FailOpen => Json(json!({
            "allowed": true,
            "resource": resource,
            "tier": tier,
            "failOpen": true,
        }))
        .into_response(),
    }
}

async fn advance_orion(
    State(state): State<LedgerHttpState>,
    Path(project_id): Path<String>,
) -> Result<Json<LoopOutcome>, Response> {
    let Some(orion) = state.orion.as_ref() else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "orion_disabled",
            "orion loop is not configured",
        )
        .into_response());
    };
    orion
        .advance(&project_id)
        .await
        .map(Json)
        .map_err(|err| map_orion_error(err).into_response())
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_usage(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<UsageRecord>>, Response> {
    if let Some(expected) = state.admin_token.as_deref() {
        if extract_bearer(&headers).as_deref() != Some(expected) {
            return Err(error_response(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "admin token required",
            )
            .into_response());
        }
    }
    state
        .ledger
        .usage()
        .recent(query.limit.unwrap_or(50))
        .await
        .map(Json)
        .map_err(|err| map_ledger_error(err.into()).into_response())
}

fn map_ledger_error(err: LedgerError) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        LedgerError::InsufficientCredits {
            required,
            available,
        } => error_response(
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_credits",
            format!("insufficient credits: required={required} available={available}"),
        ),
        LedgerError::InsufficientBalance {
            required,
            available,
        } => error_response(
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_balance",
            format!("insufficient balance: required={required} available={available}"),
        ),
        LedgerError::StoreUnavailable { message } => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", message)
        }
        LedgerError::InvalidRequest { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", reason)
        }
    }
}

fn map_orion_error(err: OrionError) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        OrionError::ProjectNotFound { project_id } => error_response(
            StatusCode::NOT_FOUND,
            "project_not_found",
            format!("orion project not found: {project_id}"),
        ),
        err @ OrionError::Trigger { .. } => {
            error_response(StatusCode::BAD_GATEWAY, "trigger_failed", err.to_string())
        }
        OrionError::Store(err) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            err.to_string(),
        ),
    }
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

fn rate_limited_response(retry_after_ms: u64, headers: Option<&RateLimitHeaders>) -> Response {
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "rate_limited",
        format!("rate limit exceeded; retry after {retry_after_ms}ms"),
    )
    .into_response();
    let out = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ceil_secs(retry_after_ms).to_string()) {
        out.insert(header::RETRY_AFTER, value);
    }
    if let Some(headers) = headers {
        apply_rate_limit_headers(out, headers);
    }
    response
}

fn apply_rate_limit_headers(out: &mut HeaderMap, headers: &RateLimitHeaders) {
    for (name, value) in headers.pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            out.insert(HeaderName::from_static(name), value);
        }
    }
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(name)?.to_str().ok()?;
    crate::utils::non_empty(Some(raw)).map(str::to_string)
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let raw = extract_header(headers, "x-forwarded-for")?;
    crate::utils::non_empty(raw.split(',').next()).map(str::to_string)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}
