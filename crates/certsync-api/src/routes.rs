use std::hash::{Hash, Hasher};
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use certsync_core::models::{AttachmentKind, CertificateData, SyncPayload, SyncResponse};
use certsync_core::{CertificateId, SyncOperation};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::media::{attachment_object_key, owned_object_key, PresignedOperation, R2PresignService};
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};
use crate::store::ServerStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: ServerStore,
    jwt_verifier: Arc<JwtVerifier>,
    r2_presign: Option<Arc<R2PresignService>>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub async fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let store = ServerStore::open(&config.database_path).await?;
        let verifier = JwtVerifier::new(Arc::clone(&config));
        Ok(Self::new(config, store, verifier))
    }

    pub fn new(config: Arc<AppConfig>, store: ServerStore, jwt_verifier: JwtVerifier) -> Self {
        Self {
            store,
            jwt_verifier: Arc::new(jwt_verifier),
            r2_presign: R2PresignService::from_config(&config).map(Arc::new),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/certificates/{id}",
            put(upsert_certificate).get(get_certificate),
        )
        .route("/certificates/{id}/sync", put(sync_certificate))
        .route("/certificates/{id}/operations", post(apply_operation))
        .route("/media/presign/upload", post(presign_upload))
        .route("/media/presign/download", get(presign_download))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(middleware::from_fn_with_state(state.clone(), reject_writes_when_read_only))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    read_only: bool,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        read_only: state.config.read_only,
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token).await?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn reject_writes_when_read_only(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let safe = matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    );
    if state.config.read_only && !safe {
        return Err(AppError::ReadOnly);
    }
    Ok(next.run(request).await)
}

/// Authenticated caller resolved to an engineer row, after the rate limit.
async fn engineer_for(
    state: &AppState,
    user: &AuthenticatedUser,
    endpoint: ProtectedEndpoint,
) -> Result<String, AppError> {
    state
        .endpoint_rate_limiter
        .check(endpoint, &user.subject)
        .await?;
    state.store.resolve_engineer(&user.subject).await
}

fn parse_certificate_id(raw: &str) -> Result<CertificateId, AppError> {
    raw.parse::<CertificateId>()
        .map_err(|_| AppError::bad_request(format!("Invalid certificate id: {raw}")))
}

async fn upsert_certificate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(raw_id): Path<String>,
    Json(header): Json<CertificateData>,
) -> Result<Json<Value>, AppError> {
    let id = parse_certificate_id(&raw_id)?;
    let engineer = engineer_for(&state, &user, ProtectedEndpoint::Sync).await?;
    state.store.upsert_certificate(&engineer, &id, &header).await?;
    tracing::info!(
        endpoint = "certificate_upsert",
        user = user_fingerprint(&user.subject),
        certificate = %id,
        "Upserted certificate header"
    );
    Ok(Json(serde_json::json!({ "id": id })))
}

async fn get_certificate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let id = parse_certificate_id(&raw_id)?;
    let engineer = engineer_for(&state, &user, ProtectedEndpoint::Sync).await?;
    Ok(Json(state.store.get_certificate(&engineer, &id).await?))
}

async fn sync_certificate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(raw_id): Path<String>,
    Json(payload): Json<SyncPayload>,
) -> Result<Json<SyncResponse>, AppError> {
    let id = parse_certificate_id(&raw_id)?;
    let engineer = engineer_for(&state, &user, ProtectedEndpoint::Sync).await?;
    let request_id = uuid::Uuid::now_v7().to_string();
    let stats = state.store.reconcile(&engineer, &id, &payload).await?;
    tracing::info!(
        endpoint = "certificate_sync",
        user = user_fingerprint(&user.subject),
        certificate = %id,
        request_id = %request_id,
        boards = stats.boards_upserted,
        circuits = stats.circuits_upserted,
        observations = stats.observations_upserted,
        "Reconciled certificate snapshot"
    );
    Ok(Json(SyncResponse {
        synced: true,
        stats,
        request_id,
    }))
}

async fn apply_operation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(raw_id): Path<String>,
    Json(operation): Json<SyncOperation>,
) -> Result<Json<Value>, AppError> {
    let id = parse_certificate_id(&raw_id)?;
    let engineer = engineer_for(&state, &user, ProtectedEndpoint::Sync).await?;
    state.store.apply_operation(&engineer, &id, &operation).await?;
    tracing::info!(
        endpoint = "certificate_operation",
        user = user_fingerprint(&user.subject),
        certificate = %id,
        operation = %operation.kind,
        "Applied certificate operation"
    );
    Ok(Json(serde_json::json!({ "applied": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPresignRequest {
    certificate_id: String,
    kind: AttachmentKind,
    filename: String,
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadPresignQuery {
    object_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignResponse {
    object_key: String,
    operation: PresignedOperation,
}

fn signer(state: &AppState) -> Result<&R2PresignService, AppError> {
    state.r2_presign.as_deref().ok_or_else(|| {
        AppError::Config("R2 presign service is not configured on the backend".to_string())
    })
}

async fn presign_upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<UploadPresignRequest>,
) -> Result<Json<PresignResponse>, AppError> {
    let engineer = engineer_for(&state, &user, ProtectedEndpoint::MediaPresign).await?;
    let certificate_id = parse_certificate_id(&request.certificate_id)?;
    let signer = signer(&state)?;
    // Attachments of a certificate created offline are uploaded before its
    // first header push.
    state.store.claim_owner(&engineer, &certificate_id).await?;

    let object_key =
        attachment_object_key(&engineer, &certificate_id, request.kind, &request.filename);
    let operation = signer
        .presign_upload(&object_key, request.content_type.as_deref())
        .await?;
    tracing::info!(
        endpoint = "media_presign_upload",
        user = user_fingerprint(&user.subject),
        kind = %request.kind,
        object_key_len = object_key.len(),
        "Issued presigned upload URL"
    );
    Ok(Json(PresignResponse {
        object_key,
        operation,
    }))
}

async fn presign_download(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<DownloadPresignQuery>,
) -> Result<Json<PresignResponse>, AppError> {
    let engineer = engineer_for(&state, &user, ProtectedEndpoint::MediaPresign).await?;
    let object_key = owned_object_key(&engineer, &query.object_key)?;
    let operation = signer(&state)?.presign_download(&object_key).await?;
    tracing::info!(
        endpoint = "media_presign_download",
        user = user_fingerprint(&user.subject),
        object_key_len = object_key.len(),
        "Issued presigned download URL"
    );
    Ok(Json(PresignResponse {
        object_key,
        operation,
    }))
}

pub fn user_fingerprint(subject: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    subject.hash(&mut hasher);
    hasher.finish()
}
