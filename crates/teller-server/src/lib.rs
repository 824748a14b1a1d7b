pub mod audit;
pub mod classifier;
pub mod executor;
pub mod ledger;
pub mod pipeline;
pub mod reconciler;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use teller_config::Config;
use teller_contracts::{
    contracts_manifest_v1, Action, ErrorBody, ErrorResponse, TournamentStatus, API_VERSION,
};
use teller_kernel::registry::catalog;
use teller_kernel::{lookup_name, GateConfig, PendingPolicy, PipelineError};
use tokio::sync::Mutex;

pub use audit::{verify_audit_chain, ChainError, ChainReport};

use crate::audit::AuditJsonl;
use crate::classifier::Classifier;
use crate::executor::{Executor, ExecutorSettings};
use crate::ledger::{LedgerClient, SigningIdentity};
use crate::pipeline::Pipeline;
use crate::reconciler::Reconciler;
use crate::store::StoreBackend;

/// External collaborators of the pipeline. Tests swap in memory doubles.
pub struct Services {
    pub classifier: Arc<dyn Classifier>,
    pub ledger: Arc<dyn LedgerClient>,
    pub signer: Arc<dyn SigningIdentity>,
}

impl Services {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let (ledger, signer) = ledger::from_config(cfg)?;
        Ok(Self {
            classifier: classifier::from_config(cfg)?,
            ledger,
            signer,
        })
    }
}

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let services = Services::from_config(&cfg)?;
    let pipeline = build_pipeline(&cfg, services).await?;

    // Submissions left in flight by a previous run settle in the background.
    let startup = pipeline.clone();
    tokio::spawn(async move {
        match startup.reconcile().await {
            Ok((state, settled)) => tracing::info!(
                assets = state.assets.len(),
                settled = settled.len(),
                "startup reconciliation finished"
            ),
            Err(err) => tracing::warn!(error = %err, "startup reconciliation failed"),
        }
    });

    let app = router(pipeline);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let services = Services::from_config(&cfg)?;
    build_app_with(cfg, services).await
}

pub async fn build_app_with(cfg: Config, services: Services) -> Result<Router, String> {
    Ok(router(build_pipeline(&cfg, services).await?))
}

/// Wires store, audit log, reconciler and executor around the given services.
pub async fn build_pipeline(cfg: &Config, services: Services) -> Result<Arc<Pipeline>, String> {
    let store = Arc::new(Mutex::new(StoreBackend::from_config(cfg)?));
    let audit = Arc::new(AuditJsonl::new(&cfg.audit.jsonl_path, cfg.store.sqlite_path.as_deref()).await?);
    let reconciler = Arc::new(Reconciler::new(
        services.ledger.clone(),
        cfg.reconciler.page_size,
        cfg.reconciler.max_concurrency,
        cfg.reconciler.tournament_probe_limit,
    ));
    let executor = Arc::new(Executor::new(
        services.ledger.clone(),
        services.signer,
        store,
        reconciler.clone(),
        audit.clone(),
        ExecutorSettings {
            ui_wait: Duration::from_millis(cfg.executor.ui_wait_ms),
            settlement_timeout: Duration::from_millis(cfg.executor.settlement_timeout_ms),
            token_symbol: cfg.ledger.token_symbol.clone(),
        },
    ));
    let gate_cfg = GateConfig {
        elide_threshold: cfg.gate.elide_threshold,
        on_pending: PendingPolicy::parse(&cfg.gate.on_pending),
    };
    Ok(Arc::new(Pipeline::new(
        services.classifier,
        services.ledger,
        executor,
        reconciler,
        audit,
        gate_cfg,
    )))
}

fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/v1/utterances", post(utterances))
        .route("/v1/validate", post(validate))
        .route("/v1/actions", post(actions))
        .route("/v1/sessions/{id}", get(session))
        .route("/v1/sessions/{id}/confirm", post(confirm))
        .route("/v1/sessions/{id}/cancel", post(cancel))
        .route("/v1/submissions/{tx_hash}", get(submission))
        .route("/v1/submissions/{tx_hash}/abandon", post(abandon))
        .route("/v1/assets", get(assets))
        .route("/v1/reconcile", post(reconcile))
        .route("/v1/tournaments", get(tournaments))
        .route("/v1/transactions", get(transactions))
        .with_state(AppState { pipeline })
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult = Result<Json<Value>, ApiError>;

pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Parse(_)
        | PipelineError::UnknownFunction(_)
        | PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::NoPendingAction
        | PipelineError::ActionMismatch(_)
        | PipelineError::ConfirmationPending
        | PipelineError::SignerBusy => StatusCode::CONFLICT,
        PipelineError::SigningRejected(_) => StatusCode::FORBIDDEN,
        PipelineError::LedgerRevert(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Provider(_) | PipelineError::ReconciliationGap { .. } => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn api_error(err: PipelineError) -> ApiError {
    let details = match &err {
        PipelineError::Validation(v) => Some(json!({"field": v.field, "reason": v.reason})),
        PipelineError::LedgerRevert(reason) => Some(json!({"reason": reason})),
        PipelineError::ActionMismatch(action_id) => Some(json!({"action_id": action_id})),
        _ => None,
    };
    (
        status_for(&err),
        Json(ErrorResponse {
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.user_message(),
                details,
            },
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: ErrorBody {
                code: "request.invalid".to_string(),
                message: message.into(),
                details: None,
            },
        }),
    )
}

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: ErrorBody {
                code: "request.not_found".to_string(),
                message: format!("{what} not found"),
                details: None,
            },
        }),
    )
}

fn to_json<T: serde::Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| api_error(PipelineError::Provider(e.to_string())))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<Value> {
    let manifest = contracts_manifest_v1();
    Json(json!({
        "api_version": API_VERSION,
        "contracts_set_sha256": manifest.contracts_set_sha256,
        "schemas": manifest
            .schemas
            .iter()
            .map(|s| json!({"name": s.name, "sha256": s.sha256}))
            .collect::<Vec<_>>(),
        "functions": catalog(),
    }))
}

#[derive(Debug, Deserialize)]
struct UtteranceInput {
    session_id: String,
    utterance: String,
}

async fn utterances(State(state): State<AppState>, Json(input): Json<UtteranceInput>) -> ApiResult {
    if input.session_id.trim().is_empty() {
        return Err(bad_request("session_id is required"));
    }
    let reply = state
        .pipeline
        .handle_utterance(&input.session_id, &input.utterance)
        .await
        .map_err(api_error)?;
    to_json(&reply)
}

#[derive(Debug, Deserialize)]
struct ValidateInput {
    utterance: String,
}

async fn validate(State(state): State<AppState>, Json(input): Json<ValidateInput>) -> ApiResult {
    let dry_run = state
        .pipeline
        .validate_only(&input.utterance)
        .await
        .map_err(api_error)?;
    to_json(&dry_run)
}

#[derive(Debug, Deserialize)]
struct ActionInput {
    session_id: String,
    function: String,
    #[serde(default)]
    parameters: Map<String, Value>,
}

async fn actions(State(state): State<AppState>, Json(input): Json<ActionInput>) -> ApiResult {
    if input.session_id.trim().is_empty() {
        return Err(bad_request("session_id is required"));
    }
    let spec = lookup_name(&input.function)
        .map_err(|e| api_error(PipelineError::UnknownFunction(e.0)))?;
    let action = Action {
        function: spec.name,
        parameters: input.parameters,
    };
    let reply = state
        .pipeline
        .submit_action(&input.session_id, action)
        .await
        .map_err(api_error)?;
    to_json(&reply)
}

async fn session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    to_json(&state.pipeline.session(&id).await)
}

#[derive(Debug, Deserialize)]
struct ConfirmInput {
    action_id: String,
}

async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ConfirmInput>,
) -> ApiResult {
    let reply = state
        .pipeline
        .confirm(&id, &input.action_id)
        .await
        .map_err(api_error)?;
    to_json(&reply)
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let reply = state.pipeline.cancel(&id).await.map_err(api_error)?;
    to_json(&reply)
}

async fn submission(State(state): State<AppState>, Path(tx_hash): Path<String>) -> ApiResult {
    match state.pipeline.executor().submission(&tx_hash).await {
        Some(record) => to_json(&record),
        None => Err(not_found("submission")),
    }
}

async fn abandon(State(state): State<AppState>, Path(tx_hash): Path<String>) -> ApiResult {
    match state.pipeline.abandon(&tx_hash).await.map_err(api_error)? {
        Some(record) => Ok(Json(record)),
        None => Err(not_found("submission")),
    }
}

#[derive(Debug, Deserialize)]
struct AssetsQuery {
    category: Option<String>,
}

async fn assets(State(state): State<AppState>, Query(query): Query<AssetsQuery>) -> ApiResult {
    let reconciler = state.pipeline.reconciler();
    let mut current = reconciler.current();
    if !current.complete {
        current = reconciler.reconcile().await.map_err(api_error)?;
    }
    let category = query.category.as_deref().unwrap_or(reconciler::ALL_BUCKET);
    Ok(Json(json!({
        "category": category,
        "assets": current.in_category(category),
        "categories": current.groups.keys().collect::<Vec<_>>(),
        "cursor": current.cursor,
        "gaps": current.gaps,
    })))
}

async fn reconcile(State(state): State<AppState>) -> ApiResult {
    let (current, settled) = state.pipeline.reconcile().await.map_err(api_error)?;
    Ok(Json(json!({
        "assets": current.assets.len(),
        "groups": current.groups,
        "cursor": current.cursor,
        "gaps": current.gaps,
        "settled": settled,
    })))
}

#[derive(Debug, Deserialize)]
struct TournamentsQuery {
    status: Option<String>,
}

async fn tournaments(
    State(state): State<AppState>,
    Query(query): Query<TournamentsQuery>,
) -> ApiResult {
    let status = match query.status.as_deref() {
        None => None,
        Some("active") => Some(TournamentStatus::Active),
        Some("closed") => Some(TournamentStatus::Closed),
        Some(other) => {
            return Err(bad_request(format!(
                "status={other} is not supported; expected active or closed"
            )))
        }
    };
    let records = state
        .pipeline
        .reconciler()
        .tournaments(status)
        .await
        .map_err(api_error)?;
    to_json(&records)
}

async fn transactions(State(state): State<AppState>) -> ApiResult {
    let records = state
        .pipeline
        .reconciler()
        .transactions()
        .await
        .map_err(api_error)?;
    to_json(&records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use teller_kernel::ValidationError;

    #[test]
    fn error_statuses_follow_the_failure_stage() {
        assert_eq!(
            status_for(&PipelineError::Parse("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ValidationError::new("tokenId", "must be an integer").into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&PipelineError::SignerBusy), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&PipelineError::SigningRejected("no".to_string())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&PipelineError::LedgerRevert("NFT not for sale".to_string())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&PipelineError::Provider("timeout".to_string())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn validation_errors_carry_the_field() {
        let (status, Json(body)) =
            api_error(ValidationError::new("recipient", "must be a valid address").into());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error.code, "action.validation_error");
        assert_eq!(
            body.error.details,
            Some(json!({"field": "recipient", "reason": "must be a valid address"}))
        );
    }
}
