//! HTTP API for submission, intent lookup and health checks

use crate::chain::ChainClient;
use crate::config::ApiConfig;
use crate::error::{SubmitError, SubmitResult};
use crate::intent::{intent_key, IntentParams};
use crate::tx::{CallParams, GasQuote, SendOutcome, TransactionPipeline};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TransactionPipeline>,
    pub chain: Arc<dyn ChainClient>,
    pub intent_bucket_secs: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/signer", get(get_signer))
        .route("/v1/transactions", post(submit_transaction))
        .route("/v1/transactions/:request_id", get(get_transaction))
        .route("/v1/transactions/:request_id/confirm", post(confirm_transaction))
        .route("/v1/transactions/:request_id/replace", post(replace_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SubmitResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SubmitError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SubmitError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.pipeline.intents().health_check().await.is_ok();
    let chain = state.chain.health_check().await;
    let ready = database && chain;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            chain,
            chain_id: state.chain.chain_id(),
            nonce_store: state.pipeline.nonce_store().as_str(),
        }),
    )
}

async fn get_signer(State(state): State<AppState>) -> impl IntoResponse {
    Json(SignerResponse {
        address: state.pipeline.signer_address(),
        backend: state.pipeline.signer_backend(),
        chain_id: state.chain.chain_id(),
    })
}

/// Submit a transaction. The request id is taken from the body or derived
/// from the intent parameters.
async fn submit_transaction(
    State(state): State<AppState>,
    Json(body): Json<SubmitTransactionRequest>,
) -> Result<Response, SubmitError> {
    let request_id = match (body.request_id, body.intent) {
        (Some(id), _) if !id.trim().is_empty() => id,
        (_, Some(intent)) => intent_key(&intent, Utc::now(), state.intent_bucket_secs),
        _ => {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "request_id or intent is required".to_string(),
                    retryable: false,
                }),
            )
                .into_response())
        }
    };

    let call = CallParams {
        to: body.to,
        data: body.data,
        value: body.value,
    };
    let submission = state.pipeline.submit(&request_id, &call).await?;
    Ok((StatusCode::OK, Json(submission)).into_response())
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Response, SubmitError> {
    let intent = state
        .pipeline
        .intents()
        .get(&request_id)
        .await?
        .ok_or(SubmitError::IntentNotFound { request_id })?;
    Ok(Json(intent).into_response())
}

/// Check the receipt and return the updated record. `?wait=true` polls until mined.
async fn confirm_transaction(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> Result<Response, SubmitError> {
    state.pipeline.confirm(&request_id, query.wait).await?;
    get_transaction(State(state), Path(request_id)).await
}

async fn replace_transaction(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(body): Json<ReplaceTransactionRequest>,
) -> Result<Response, SubmitError> {
    let replacement_id = body
        .replacement_request_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("{}:replacement", request_id));

    let replacement = state.pipeline.replace(&request_id, &replacement_id).await?;
    Ok(Json(ReplacementResponse {
        request_id: replacement_id,
        replaces: request_id,
        outcome: replacement.outcome,
        nonce: replacement.signed.nonce(),
        quote: replacement.quote,
    })
    .into_response())
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitError::IntentNotFound { .. } => StatusCode::NOT_FOUND,
            SubmitError::IntentClosed { .. }
            | SubmitError::InvalidStateTransition { .. }
            | SubmitError::HashConflict { .. } => StatusCode::CONFLICT,
            SubmitError::Rejected(_)
            | SubmitError::NonceTooLow(_)
            | SubmitError::InsufficientFunds(_)
            | SubmitError::Reverted { .. }
            | SubmitError::GasCapReached { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                retryable: self.is_retryable(),
            }),
        )
            .into_response()
    }
}

// Request/response types

#[derive(Debug, Deserialize)]
struct SubmitTransactionRequest {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    intent: Option<IntentParams>,
    to: Address,
    #[serde(default)]
    data: Bytes,
    #[serde(default)]
    value: U256,
}

#[derive(Debug, Default, Deserialize)]
struct ConfirmQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ReplaceTransactionRequest {
    #[serde(default)]
    replacement_request_id: Option<String>,
}

#[derive(Serialize)]
struct ReplacementResponse {
    request_id: String,
    replaces: String,
    #[serde(flatten)]
    outcome: SendOutcome,
    nonce: Option<u64>,
    quote: GasQuote,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chain: bool,
    chain_id: u64,
    nonce_store: &'static str,
}

#[derive(Serialize)]
struct SignerResponse {
    address: Address,
    backend: &'static str,
    chain_id: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    retryable: bool,
}
