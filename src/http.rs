//! HTTP surface: upstream-node webhooks plus the participant/operator REST API.
//! Thin by design — validates JSON shape, delegates to Watchtower/Signer,
//! and maps errors to status codes via [`AppError`]'s `IntoResponse` impl.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::event::{parse_new_block, NewBlockPayload};
use crate::signer::{self, SignerBackend};
use crate::watchtower::{SignatureStateInput, Watchtower};

#[derive(Clone)]
pub struct AppState {
    pub watchtower: Arc<Watchtower>,
    pub signer: Arc<SignerBackend>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/new_block", post(new_block))
        .route("/new_burn_block", post(new_burn_block))
        .route("/new_mempool_tx", post(new_mempool_tx))
        .route("/drop_mempool_tx", post(drop_mempool_tx))
        .route("/new_microblocks", post(new_microblocks))
        .route("/signature-states", post(post_signature_state).get(list_signature_states))
        .route("/pipes", get(list_pipes))
        .route("/closures", get(list_closures))
        .route("/dispute-attempts", get(list_dispute_attempts))
        .route("/producer/transfer", post(producer_transfer))
        .route("/producer/signature-request", post(producer_signature_request))
        .route("/app", get(app_placeholder))
        .route("/app/*path", get(app_placeholder))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

async fn status(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let snapshot = state.watchtower.store.get_snapshot()?;
    Ok(Json(serde_json::to_value(snapshot).expect("snapshot is always serializable")))
}

async fn not_found() -> AppError {
    AppError::NotFound
}

async fn app_placeholder() -> &'static str {
    "watchtower UI is not bundled in this build"
}

// Chain-node compatibility routes this service accepts but does not act on.

async fn new_mempool_tx(_body: Bytes) -> Json<Value> {
    Json(json!({"ok": true, "ignored": true, "route": "/new_mempool_tx"}))
}

async fn drop_mempool_tx(_body: Bytes) -> Json<Value> {
    Json(json!({"ok": true, "ignored": true, "route": "/drop_mempool_tx"}))
}

async fn new_microblocks(_body: Bytes) -> Json<Value> {
    Json(json!({"ok": true, "ignored": true, "route": "/new_microblocks"}))
}

async fn new_block(
    State(state): State<AppState>,
    Json(payload): Json<NewBlockPayload>,
) -> Result<Json<Value>, AppError> {
    let events = parse_new_block(&payload, &state.watchtower.config.watched_contracts);
    let summary = state.watchtower.ingest_new_block(&events).await?;
    Ok(Json(json!({
        "ok": true,
        "observedEvents": summary.observed_events,
        "unwatchedEvents": summary.unwatched_events,
    })))
}

#[derive(Deserialize)]
struct BurnBlockBody {
    burn_block_height: u64,
}

async fn new_burn_block(
    State(state): State<AppState>,
    Json(body): Json<BurnBlockBody>,
) -> Result<Json<Value>, AppError> {
    let summary = state.watchtower.ingest_burn_block(body.burn_block_height).await?;
    Ok(Json(json!({
        "burnBlockHeight": summary.burn_block_height,
        "processedPipes": summary.processed_pipes,
        "settledPipes": summary.settled_pipes,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureStateBody {
    contract_id: String,
    principal_1: String,
    principal_2: String,
    #[serde(default)]
    token: Option<String>,
    for_principal: String,
    with_principal: String,
    action: u8,
    #[serde(default)]
    amount: Option<String>,
    my_balance: String,
    their_balance: String,
    my_signature: String,
    their_signature: String,
    nonce: u64,
    actor: String,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    valid_after: Option<u64>,
    #[serde(default)]
    beneficial_only: bool,
    #[serde(default)]
    skip_verification: bool,
}

async fn post_signature_state(
    State(state): State<AppState>,
    Json(body): Json<SignatureStateBody>,
) -> Result<Json<Value>, AppError> {
    let skip_verification = body.skip_verification;
    let input = SignatureStateInput {
        contract_id: body.contract_id,
        principal_1: body.principal_1,
        principal_2: body.principal_2,
        token: body.token,
        for_principal: body.for_principal,
        with_principal: body.with_principal,
        action: body.action,
        amount: body.amount,
        my_balance: body.my_balance,
        their_balance: body.their_balance,
        my_signature: body.my_signature,
        their_signature: body.their_signature,
        nonce: body.nonce,
        actor: body.actor,
        secret: body.secret,
        valid_after: body.valid_after,
        beneficial_only: body.beneficial_only,
    };

    let outcome = state.watchtower.upsert_signature_state(input, skip_verification).await?;

    if !outcome.stored && outcome.reason.as_deref() == Some("nonce-too-low") {
        return Err(AppError::NonceTooLow {
            existing_nonce: outcome.state.nonce.to_string(),
        });
    }

    Ok(Json(json!({
        "stored": outcome.stored,
        "replaced": outcome.replaced,
        "reason": outcome.reason,
        "state": outcome.state,
    })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn list_signature_states(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let mut states = state.watchtower.store.list_signature_states()?;
    if let Some(limit) = q.limit {
        states.truncate(limit);
    }
    Ok(Json(json!({"signatureStates": states})))
}

#[derive(Deserialize)]
struct PrincipalQuery {
    principal: Option<String>,
}

async fn list_pipes(
    State(state): State<AppState>,
    Query(q): Query<PrincipalQuery>,
) -> Result<Json<Value>, AppError> {
    let mut pipes = state.watchtower.store.list_observed_pipes()?;
    if let Some(principal) = q.principal {
        pipes.retain(|p| p.key.principal_low == principal || p.key.principal_high == principal);
    }
    Ok(Json(json!({"pipes": pipes})))
}

async fn list_closures(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let closures = state.watchtower.store.list_closures()?;
    Ok(Json(json!({"closures": closures})))
}

async fn list_dispute_attempts(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Value>, AppError> {
    let attempts = state.watchtower.store.list_dispute_attempts(q.limit)?;
    Ok(Json(json!({"disputeAttempts": attempts})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerRequestBody {
    contract_id: String,
    principal_1: String,
    principal_2: String,
    #[serde(default)]
    token: Option<String>,
    for_principal: String,
    with_principal: String,
    #[serde(default)]
    action: Option<u8>,
    #[serde(default)]
    amount: Option<String>,
    my_balance: String,
    their_balance: String,
    their_signature: String,
    nonce: u64,
    actor: String,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    valid_after: Option<u64>,
    #[serde(default)]
    beneficial_only: bool,
}

impl ProducerRequestBody {
    fn into_request(self, default_action: Option<u8>) -> Result<signer::ProducerRequest, AppError> {
        let action = match (self.action, default_action) {
            (Some(a), _) => a,
            (None, Some(d)) => d,
            (None, None) => return Err(AppError::BadRequest("action is required".to_string())),
        };
        Ok(signer::ProducerRequest {
            contract_id: self.contract_id,
            principal_1: self.principal_1,
            principal_2: self.principal_2,
            token: self.token,
            for_principal: self.for_principal,
            with_principal: self.with_principal,
            action,
            amount: self.amount,
            my_balance: self.my_balance,
            their_balance: self.their_balance,
            their_signature: self.their_signature,
            nonce: self.nonce,
            actor: self.actor,
            secret: self.secret,
            valid_after: self.valid_after,
            beneficial_only: self.beneficial_only,
        })
    }
}

async fn producer_transfer(
    State(state): State<AppState>,
    Json(body): Json<ProducerRequestBody>,
) -> Result<Json<Value>, AppError> {
    let req = body.into_request(Some(1))?;
    let outcome = signer::sign_transfer(&state.watchtower, &state.signer, req).await?;
    Ok(Json(json!({
        "stored": outcome.stored,
        "replaced": outcome.replaced,
        "reason": outcome.reason,
        "state": outcome.state,
    })))
}

async fn producer_signature_request(
    State(state): State<AppState>,
    Json(body): Json<ProducerRequestBody>,
) -> Result<Json<Value>, AppError> {
    let amount = body.amount.clone();
    let req = body.into_request(None)?;
    let outcome = signer::sign_signature_request(&state.watchtower, &state.signer, req, amount).await?;
    Ok(Json(json!({
        "stored": outcome.stored,
        "replaced": outcome.replaced,
        "reason": outcome.reason,
        "state": outcome.state,
    })))
}
