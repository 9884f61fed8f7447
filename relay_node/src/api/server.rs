use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, State},
    http::Method,
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::crypto::{Address, Hash, PublicKey, Signature};
use crate::engine::Engine;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{
    ChallengeProofInvalidData, Claim, DispatchResponse, EvidenceKind, Params, Relay, RequestorInfo, ServicerInfo,
    SessionHeader,
};

use super::errors::{ApiError, ApiResult, ErrorResponse};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Requested height, or the latest committed one when absent or zero.
    fn height(&self, requested: Option<i64>) -> i64 {
        match requested {
            Some(h) if h > 0 => h,
            _ => self.engine.registry().latest_height(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayOkResponse {
    pub signature: Signature,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeStatus {
    pub status: String,
    pub evidence_key: Hash,
    pub accused: PublicKey,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeightResponse {
    pub height: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HeightQuery {
    pub height: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ServicersQuery {
    pub chain: String,
    pub geo_zone: String,
    #[serde(default)]
    pub height: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AddressQuery {
    pub address: Address,
    #[serde(default)]
    pub height: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimQuery {
    pub address: Address,
    pub session_header: SessionHeader,
    pub evidence_kind: EvidenceKind,
    #[serde(default)]
    pub height: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EvidenceQuery {
    pub session_header: SessionHeader,
    pub evidence_kind: EvidenceKind,
    pub servicer: PublicKey,
}

/// Local evidence; the bloom filter and leaves stay on the node.
#[derive(Debug, Serialize, Deserialize)]
pub struct EvidenceSummary {
    pub evidence_key: Hash,
    pub session_header: SessionHeader,
    pub evidence_kind: EvidenceKind,
    pub servicer: PublicKey,
    pub leaf_count: u64,
    pub total_payable_relays: u64,
    pub sealed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub height: i64,
    pub servicers: Vec<Address>,
    pub hosted_chains: Vec<String>,
    pub timestamp: i64,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/v1/health", get(health_check))
        .route("/v1/client/relay", post(relay))
        .route("/v1/client/dispatch", post(dispatch))
        .route("/v1/client/challenge", post(challenge))
        .route("/v1/query/height", post(query_height))
        .route("/v1/query/params", post(query_params))
        .route("/v1/query/servicers", post(query_servicers))
        .route("/v1/query/requestor", post(query_requestor))
        .route("/v1/query/claim", post(query_claim))
        .route("/v1/query/claims", post(query_claims))
        .route("/v1/query/supportedchains", post(query_supported_chains))
        .route("/v1/query/evidence", post(query_evidence))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

/// Serves `router` until `shutdown` resolves, then lets in-flight requests
/// finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("RPC listening on {}", addr);
    }
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = &state.engine;
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        height: engine.registry().latest_height(),
        servicers: engine.identities().map(|i| i.address()).collect(),
        hosted_chains: engine.chains().ids(),
        timestamp: chrono::Utc::now().timestamp(),
    })
}

async fn relay(
    State(state): State<AppState>,
    body: std::result::Result<Json<Relay>, JsonRejection>,
) -> ApiResult<Json<RelayOkResponse>> {
    let Json(relay) = body?;
    let (response, dispatch) = state.engine.handle_relay(relay).await?;
    Ok(Json(RelayOkResponse {
        signature: response.signature,
        response: response.response,
        dispatch,
    }))
}

async fn dispatch(
    State(state): State<AppState>,
    body: std::result::Result<Json<SessionHeader>, JsonRejection>,
) -> ApiResult<Json<DispatchResponse>> {
    let Json(header) = body?;
    Ok(Json(state.engine.dispatch(&header)?))
}

async fn challenge(
    State(state): State<AppState>,
    body: std::result::Result<Json<ChallengeProofInvalidData>, JsonRejection>,
) -> ApiResult<Json<ChallengeStatus>> {
    let Json(challenge) = body?;
    let outcome = state.engine.handle_challenge(challenge)?;
    Ok(Json(ChallengeStatus {
        status: "accepted".to_string(),
        evidence_key: outcome.evidence_key,
        accused: outcome.accused,
    }))
}

async fn query_height(State(state): State<AppState>) -> Json<HeightResponse> {
    Json(HeightResponse {
        height: state.engine.registry().latest_height(),
    })
}

/// Bodies are optional on height-only queries.
fn height_query(body: &Bytes) -> ApiResult<HeightQuery> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(HeightQuery::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        let mut error = ApiError::bad_request(&format!("JSON parsing error: {}", e));
        error.kind = Some(ErrorKind::Input);
        ErrorResponse::new(error)
    })
}

async fn query_params(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<Params>> {
    let q = height_query(&body)?;
    let height = state.height(q.height);
    Ok(Json(state.engine.registry().get_params(height)?))
}

async fn query_servicers(
    State(state): State<AppState>,
    body: std::result::Result<Json<ServicersQuery>, JsonRejection>,
) -> ApiResult<Json<Vec<ServicerInfo>>> {
    let Json(q) = body?;
    let height = state.height(q.height);
    Ok(Json(state.engine.registry().validators_for(&q.chain, &q.geo_zone, height)?))
}

async fn query_requestor(
    State(state): State<AppState>,
    body: std::result::Result<Json<AddressQuery>, JsonRejection>,
) -> ApiResult<Json<RequestorInfo>> {
    let Json(q) = body?;
    let height = state.height(q.height);
    state
        .engine
        .registry()
        .requestor(&q.address, height)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(&format!("requestor {} is not staked at {}", q.address, height)).into())
}

async fn query_claim(
    State(state): State<AppState>,
    body: std::result::Result<Json<ClaimQuery>, JsonRejection>,
) -> ApiResult<Json<Claim>> {
    let Json(q) = body?;
    let height = state.height(q.height);
    state
        .engine
        .registry()
        .get_claim(&q.address, &q.session_header, q.evidence_kind, height)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(&format!("no {} claim by {} at {}", q.evidence_kind, q.address, height)).into())
}

async fn query_claims(
    State(state): State<AppState>,
    body: std::result::Result<Json<AddressQuery>, JsonRejection>,
) -> ApiResult<Json<Vec<Claim>>> {
    let Json(q) = body?;
    let height = state.height(q.height);
    Ok(Json(state.engine.registry().get_all_claims(&q.address, height)?))
}

async fn query_supported_chains(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<Vec<String>>> {
    let q = height_query(&body)?;
    let height = state.height(q.height);
    Ok(Json(state.engine.registry().get_params(height)?.supported_blockchains))
}

async fn query_evidence(
    State(state): State<AppState>,
    body: std::result::Result<Json<EvidenceQuery>, JsonRejection>,
) -> ApiResult<Json<EvidenceSummary>> {
    let Json(q) = body?;
    let summary = evidence_summary(&state.engine, &q)?;
    summary
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no evidence for that session").into())
}

fn evidence_summary(engine: &Engine, q: &EvidenceQuery) -> Result<Option<EvidenceSummary>> {
    let identity = engine
        .identity(&q.servicer)
        .ok_or_else(|| Error::UnknownServicer(q.servicer.to_hex()))?;
    let key = crate::evidence::evidence_key(&q.session_header, q.evidence_kind)?;
    Ok(identity.evidence.get(&key)?.map(|meta| EvidenceSummary {
        evidence_key: key,
        session_header: meta.session_header,
        evidence_kind: meta.evidence_kind,
        servicer: meta.servicer,
        leaf_count: meta.leaf_count,
        total_payable_relays: meta.total_payable_relays,
        sealed: meta.sealed,
    }))
}
