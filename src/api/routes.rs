use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::errors::SettlementError;
use crate::ledger::BalanceLedger;
use crate::models::{EvidenceItem, ResolutionAction, ResolutionLogEntry, UserBalance};
use crate::reconcile::{BalanceAudit, BalanceFix, BalanceReconciler, ReconciliationReport};
use crate::resolution::{
    LogQuery, ResolutionLogStore, ResolutionOrchestrator, ResolutionOutcome, ResolveRequest,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ResolutionOrchestrator>,
    pub ledger: Arc<BalanceLedger>,
    pub log: Arc<ResolutionLogStore>,
    pub reconciler: Arc<BalanceReconciler>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/markets/:id/resolve", post(resolve_market))
        .route("/api/markets/:id/rollback", post(rollback_resolution))
        .route("/api/markets/:id/payout-preview", get(payout_preview))
        .route("/api/resolution-log", get(get_resolution_log))
        .route("/api/balances/:user_id", get(get_balance))
        .route("/api/balances/:user_id/audit", get(audit_balance))
        .route("/api/balances/:user_id/fix", post(fix_balance))
        .route("/api/reconcile", post(reconcile))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn resolve_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ResolutionOutcome>, ApiError> {
    let request = ResolveRequest {
        market_id,
        winning_option_id: body.winning_option_id,
        evidence: body.evidence,
        admin_id: body.admin_id,
        creator_fee_percentage: body.creator_fee_percentage,
    };
    let outcome = state.orchestrator.resolve_market(&request).await?;
    Ok(Json(outcome))
}

async fn rollback_resolution(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .rollback_resolution(&market_id, &body.resolution_id, &body.admin_id)
        .await?;
    Ok(Json(json!({
        "success": true,
        "market_id": market_id,
        "resolution_id": body.resolution_id,
    })))
}

async fn payout_preview(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
    Query(params): Query<PreviewQuery>,
) -> Result<Json<crate::payout::PayoutPreview>, ApiError> {
    let preview = state
        .orchestrator
        .payout_preview(
            &market_id,
            &params.winning_option_id,
            params.creator_fee_percentage,
        )
        .await?;
    Ok(Json(preview))
}

async fn get_resolution_log(
    State(state): State<AppState>,
    Query(params): Query<LogQueryParams>,
) -> Result<Json<LogResponse>, ApiError> {
    let action = match &params.action {
        Some(raw) => Some(ResolutionAction::parse(raw).ok_or_else(|| {
            ApiError::BadRequest(format!("unknown resolution action: {}", raw))
        })?),
        None => None,
    };
    let entries = state
        .log
        .query(&LogQuery {
            market_id: params.market_id,
            admin_id: params.admin_id,
            action,
            since: params.since,
            until: params.until,
            limit: Some(params.limit.unwrap_or(100).min(1000)),
        })
        .await?;
    Ok(Json(LogResponse {
        count: entries.len(),
        entries,
    }))
}

async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserBalance>, ApiError> {
    state
        .ledger
        .get_balance(&user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no balance for user {}", user_id)))
}

async fn audit_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceAudit>, ApiError> {
    let audit = state.reconciler.audit_user_balance(&user_id).await?;
    Ok(Json(audit))
}

async fn fix_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceFix>, ApiError> {
    let fix = state.reconciler.fix_user_balance(&user_id).await?;
    Ok(Json(fix))
}

async fn reconcile(
    State(state): State<AppState>,
    Json(body): Json<ReconcileBody>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    let report = match body.user_ids {
        Some(ids) => state.reconciler.reconcile_multiple_users(&ids).await,
        None => state.reconciler.reconcile_all_users().await?,
    };
    Ok(Json(report))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct ResolveBody {
    winning_option_id: String,
    evidence: Vec<EvidenceItem>,
    admin_id: String,
    /// Fraction in [0.01, 0.05]
    creator_fee_percentage: f64,
}

#[derive(Deserialize)]
struct RollbackBody {
    resolution_id: String,
    admin_id: String,
}

#[derive(Deserialize)]
struct PreviewQuery {
    winning_option_id: String,
    creator_fee_percentage: f64,
}

#[derive(Deserialize)]
struct LogQueryParams {
    market_id: Option<String>,
    admin_id: Option<String>,
    action: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct ReconcileBody {
    user_ids: Option<Vec<String>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct LogResponse {
    count: usize,
    entries: Vec<ResolutionLogEntry>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Settlement(SettlementError),
    BadRequest(String),
    NotFound(String),
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        ApiError::Settlement(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Settlement(err) => match err {
                SettlementError::InvalidInput(_) | SettlementError::InvalidFeeRange(_) => {
                    (StatusCode::BAD_REQUEST, err.to_string())
                }
                SettlementError::MarketNotFound(_) | SettlementError::NothingToFix(_) => {
                    (StatusCode::NOT_FOUND, err.to_string())
                }
                SettlementError::InvalidState(_)
                | SettlementError::ConcurrentModification { .. } => {
                    (StatusCode::CONFLICT, err.to_string())
                }
                SettlementError::InsufficientFunds { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
                }
                SettlementError::LedgerApplicationFailed { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                }
                SettlementError::Storage(inner) => {
                    tracing::error!("Storage error: {}", inner);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                    )
                }
            },
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let err: ApiError = SettlementError::MarketNotFound("m1".to_string()).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let err: ApiError = SettlementError::InvalidFeeRange(0.2).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = SettlementError::InvalidState("resolved".to_string()).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
