use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{
    ACCEPT, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, WWW_AUTHENTICATE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub mod access_token;
pub mod analysis;
pub mod api_envelope;
pub mod auth;
pub mod config;
pub mod storage;
pub mod store;
pub mod workflow_client;


use crate::access_token::AccessTokenIssuer;
use crate::analysis::{
    AnalysisService, AnalysisServiceError, AnalysisStatus, Carga, CreateAnalysisRequest,
};
use crate::api_envelope::{
    ApiErrorCode, created_data, error_response, not_found_error, ok_data, ok_page,
    validation_error,
};
use crate::auth::{AuthError, AuthService};
use crate::config::Config;
use crate::storage::{ArtifactStorage, StorageError};
use crate::store::{ResultUpdate, StoreError, TitulosStore, UserRecord};

const SERVICE_NAME: &str = "titulos-service";
const CALLBACK_API_KEY_HEADER: &str = "x-api-key";
const DEFAULT_PER_PAGE: u64 = 20;
const MAX_PER_PAGE: u64 = 100;
const REQUEST_TIMEOUT_SECONDS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    auth: AuthService,
    analysis: AnalysisService,
    store: TitulosStore,
    storage: ArtifactStorage,
}

pub fn build_router(config: Config) -> Router {
    let store = TitulosStore::from_config(&config);
    let tokens = AccessTokenIssuer::from_config(&config);
    let auth = AuthService::new(store.clone(), tokens);
    let workflow = workflow_client::WorkflowClient::from_config(&config);
    let analysis = AnalysisService::new(store.clone(), workflow);
    let storage = ArtifactStorage::new(config.storage_root.clone());
    let cors = cors_layer(&config);
    let state = AppState {
        config: Arc::new(config),
        auth,
        analysis,
        store,
        storage,
    };
    let security_headers_state = state.clone();

    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .route("/api/sunarp/analyze", post(create_analysis))
        .route("/api/sunarp/analyses", get(list_analyses))
        .route(
            "/api/sunarp/analyses/:analysis_id",
            get(get_analysis).delete(delete_analysis),
        )
        .route("/api/sunarp/analyses/:analysis_id/pdf", get(get_pdf))
        .route(
            "/api/sunarp/analyses/:analysis_id/cancel",
            post(cancel_analysis),
        )
        .route("/api/internal/analysis-callback", post(analysis_callback))
        .layer(middleware::from_fn_with_state(
            security_headers_state,
            security_headers,
        ))
        .layer(cors)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::new(Duration::from_secs(
                    REQUEST_TIMEOUT_SECONDS,
                ))),
        )
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT])
        .allow_credentials(true)
}

async fn security_headers(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
    if state.config.is_production() {
        headers.insert(
            "strict-transport-security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}

// ----------------------------------------------------------------------
// Request / response payloads
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RegisterRequestPayload {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequestPayload {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct UserData {
    id: String,
    email: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct AuthTokenResponse {
    user: UserData,
    token: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListAnalysesQuery {
    #[serde(default)]
    page: Option<u64>,
    #[serde(default)]
    per_page: Option<u64>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackCarga {
    tipo: String,
    detalle: String,
    #[serde(default)]
    vigente: Option<bool>,
    #[serde(default)]
    fecha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnalysisCallbackPayload {
    analysis_id: String,
    status: AnalysisStatus,
    #[serde(default)]
    total_asientos: Option<i64>,
    #[serde(default)]
    cargas_encontradas: Option<Vec<CallbackCarga>>,
    #[serde(default)]
    informe: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    pdf_base64: Option<String>,
}

#[derive(Debug, Serialize)]
struct CallbackResponse {
    status: &'static str,
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequestPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(&rejection),
    };

    match state.auth.register(&payload.email, &payload.password).await {
        Ok((user, token)) => created_data(AuthTokenResponse {
            user: user_data(&user),
            token,
        })
        .into_response(),
        Err(error) => auth_error_response(error),
    }
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequestPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(&rejection),
    };

    match state.auth.login(&payload.email, &payload.password).await {
        Ok(token) => ok_data(TokenResponse { token }).into_response(),
        Err(error) => auth_error_response(error),
    }
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    ok_data(user_data(&user)).into_response()
}

async fn create_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateAnalysisRequest>, JsonRejection>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(&rejection),
    };

    tracing::info!(
        target: "titulos.api",
        user_id = %user.id,
        oficina = %payload.oficina,
        partida = %payload.partida,
        "create_analysis_request",
    );

    match state.analysis.create_analysis(payload, &user.id).await {
        Ok(created) => created_data(created).into_response(),
        Err(error) => analysis_error_response(error),
    }
}

async fn list_analyses(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListAnalysesQuery>, QueryRejection>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return validation_error(format!(
                "Invalid query parameters: {}",
                rejection.body_text()
            ))
            .into_response();
        }
    };

    let page = query.page.unwrap_or(1);
    if page < 1 {
        return validation_error("page must be greater than or equal to 1").into_response();
    }
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE);
    if !(1..=MAX_PER_PAGE).contains(&per_page) {
        return validation_error(format!("per_page must be between 1 and {MAX_PER_PAGE}"))
            .into_response();
    }
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match AnalysisStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return validation_error(format!("Invalid status filter '{raw}'")).into_response();
            }
        },
    };

    match state
        .analysis
        .list_analyses(&user.id, page, per_page, status)
        .await
    {
        Ok((summaries, pagination)) => ok_page(summaries, pagination).into_response(),
        Err(error) => analysis_error_response(error),
    }
}

async fn get_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(analysis_id): Path<String>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    match state.analysis.get_analysis(&analysis_id, &user.id).await {
        Ok(detail) => ok_data(detail).into_response(),
        Err(error) => analysis_error_response(error),
    }
}

async fn get_pdf(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(analysis_id): Path<String>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let pdf_path = match state
        .analysis
        .get_pdf_storage_path(&analysis_id, &user.id)
        .await
    {
        Ok(Some(path)) => path,
        Ok(None) => {
            return not_found_error("This analysis does not have an associated PDF yet")
                .into_response();
        }
        Err(error) => return analysis_error_response(error),
    };

    let full_path = match state.storage.resolve_pdf(&pdf_path).await {
        Ok(path) => path,
        Err(StorageError::NotFound { .. }) => {
            return not_found_error("PDF file not found").into_response();
        }
        Err(error) => return storage_error_response(&error),
    };

    let bytes = match tokio::fs::read(&full_path).await {
        Ok(bytes) => bytes,
        Err(error) => {
            return storage_error_response(&StorageError::Io {
                message: format!("failed to read artifact: {error}"),
            });
        }
    };

    let disposition = format!("attachment; filename=\"copia_literal_{analysis_id}.pdf\"");
    let mut response = (StatusCode::OK, bytes).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    response
}

async fn delete_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(analysis_id): Path<String>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    tracing::info!(
        target: "titulos.api",
        user_id = %user.id,
        analysis_id = %analysis_id,
        "delete_analysis_request",
    );

    match state.analysis.delete_analysis(&analysis_id, &user.id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => analysis_error_response(error),
    }
}

async fn cancel_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(analysis_id): Path<String>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    tracing::info!(
        target: "titulos.api",
        user_id = %user.id,
        analysis_id = %analysis_id,
        "cancel_analysis_request",
    );

    match state.analysis.cancel_analysis(&analysis_id, &user.id).await {
        Ok(detail) => ok_data(detail).into_response(),
        Err(error) => analysis_error_response(error),
    }
}

/// Result delivery from the workflow engine. Authenticated by the shared
/// API key, not a user token; the analysis is resolved without ownership
/// scoping because the engine acts on its own behalf.
async fn analysis_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<AnalysisCallbackPayload>, JsonRejection>,
) -> Response {
    if let Err(response) = require_callback_key(&state, &headers) {
        return response;
    }
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(&rejection),
    };

    if payload.status.is_in_flight() {
        return validation_error("status must be 'completed' or 'failed'").into_response();
    }

    tracing::info!(
        target: "titulos.api",
        analysis_id = %payload.analysis_id,
        status = payload.status.as_str(),
        "analysis_callback_received",
    );

    let record = match state.store.get_analysis_unscoped(&payload.analysis_id).await {
        Ok(record) => record,
        Err(StoreError::NotFound) => {
            tracing::warn!(
                target: "titulos.api",
                analysis_id = %payload.analysis_id,
                "analysis_callback_not_found",
            );
            return not_found_error(format!("Analysis {} not found", payload.analysis_id))
                .into_response();
        }
        Err(error) => return store_error_response(&error),
    };

    // The structured result is authoritative; the PDF is best-effort. A
    // failed decode or write is logged and the callback still finalizes.
    let mut pdf_path = None;
    if let Some(encoded) = payload.pdf_base64.as_deref() {
        match BASE64.decode(encoded) {
            Ok(bytes) => {
                match state
                    .storage
                    .save_pdf(&record.requested_by, &payload.analysis_id, &bytes)
                    .await
                {
                    Ok(path) => pdf_path = Some(path),
                    Err(error) => {
                        tracing::error!(
                            target: "titulos.api",
                            analysis_id = %payload.analysis_id,
                            error = %error,
                            "analysis_callback_pdf_save_failed",
                        );
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    target: "titulos.api",
                    analysis_id = %payload.analysis_id,
                    error = %error,
                    "analysis_callback_pdf_decode_failed",
                );
            }
        }
    }

    let started_at = match parse_iso_datetime(payload.started_at.as_deref()) {
        Ok(value) => value,
        Err(response) => return response,
    };
    let completed_at = match parse_iso_datetime(payload.completed_at.as_deref()) {
        Ok(value) => value,
        Err(response) => return response,
    };

    let cargas = payload.cargas_encontradas.map(|items| {
        items
            .into_iter()
            .map(|item| Carga {
                tipo: item.tipo,
                detalle: item.detalle,
                vigente: item.vigente.unwrap_or(false),
                fecha: item.fecha,
            })
            .collect()
    });

    let update = ResultUpdate {
        total_asientos: payload.total_asientos,
        cargas_encontradas: cargas,
        informe: payload.informe,
        error_message: payload.error_message,
        started_at,
        completed_at,
        pdf_path,
    };

    match state
        .store
        .update_result(&payload.analysis_id, payload.status, update)
        .await
    {
        Ok(_) => {
            tracing::info!(
                target: "titulos.api",
                analysis_id = %payload.analysis_id,
                status = payload.status.as_str(),
                "analysis_callback_processed",
            );
            ok_data(CallbackResponse { status: "ok" }).into_response()
        }
        Err(StoreError::NotFound) => {
            not_found_error(format!("Analysis {} not found", payload.analysis_id)).into_response()
        }
        Err(error) => store_error_response(&error),
    }
}

// ----------------------------------------------------------------------
// Auth helpers
// ----------------------------------------------------------------------

async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<UserRecord, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(unauthorized_response("Authorization header missing"));
    };

    state.auth.current_user(&token).await.map_err(|error| match error {
        AuthError::Token(_) => unauthorized_response("Invalid or expired token"),
        AuthError::InvalidCredentials => unauthorized_response("User not found"),
        other => internal_error_response(&other),
    })
}

fn require_callback_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = state.config.workflow_api_key.as_deref().unwrap_or_default();
    let presented = headers
        .get(CALLBACK_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let key_matches: bool = presented.as_bytes().ct_eq(expected.as_bytes()).into();
    if expected.is_empty() || !key_matches {
        return Err(error_response(
            ApiErrorCode::Unauthorized,
            "Invalid or missing API key",
        )
        .into_response());
    }
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = authorization.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn user_data(user: &UserRecord) -> UserData {
    UserData {
        id: user.id.clone(),
        email: user.email.clone(),
        created_at: user.created_at,
    }
}

fn parse_iso_datetime(value: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    let Some(raw) = value else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| Some(parsed.with_timezone(&Utc)))
        .map_err(|_| {
            validation_error(format!("'{raw}' is not a valid ISO-8601 timestamp")).into_response()
        })
}

// ----------------------------------------------------------------------
// Error mapping
// ----------------------------------------------------------------------

fn unauthorized_response(message: &str) -> Response {
    let mut response =
        error_response(ApiErrorCode::Unauthorized, message.to_string()).into_response();
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}

fn json_rejection_response(rejection: &JsonRejection) -> Response {
    validation_error(format!("Invalid request body: {}", rejection.body_text())).into_response()
}

fn auth_error_response(error: AuthError) -> Response {
    match error {
        AuthError::Validation { field, message } => {
            validation_error(format!("Validation error on '{field}': {message}")).into_response()
        }
        AuthError::EmailTaken => {
            error_response(ApiErrorCode::Conflict, "A user with this email already exists")
                .into_response()
        }
        AuthError::InvalidCredentials => unauthorized_response("Invalid email or password"),
        AuthError::Token(_) => unauthorized_response("Invalid or expired token"),
        AuthError::Store(store_error) => store_error_response(&store_error),
    }
}

fn analysis_error_response(error: AnalysisServiceError) -> Response {
    match error {
        AnalysisServiceError::Validation { field, message } => {
            validation_error(format!("Validation error on '{field}': {message}")).into_response()
        }
        AnalysisServiceError::Duplicate { message } => {
            error_response(ApiErrorCode::DuplicateAnalysis, message).into_response()
        }
        AnalysisServiceError::Store(StoreError::NotFound) => {
            not_found_error("Analysis not found").into_response()
        }
        AnalysisServiceError::Store(StoreError::InvalidState { message }) => {
            error_response(ApiErrorCode::Conflict, message).into_response()
        }
        AnalysisServiceError::Store(store_error) => store_error_response(&store_error),
        AnalysisServiceError::Workflow(workflow_error) => {
            tracing::error!(
                target: "titulos.api",
                error = %workflow_error,
                "workflow_error",
            );
            error_response(
                ApiErrorCode::UpstreamError,
                "Failed to trigger analysis workflow. Please try again later.",
            )
            .into_response()
        }
    }
}

fn store_error_response(error: &StoreError) -> Response {
    match error {
        StoreError::NotFound => not_found_error("Record not found").into_response(),
        StoreError::InvalidState { message } | StoreError::AlreadyExists { message } => {
            error_response(ApiErrorCode::Conflict, message.clone()).into_response()
        }
        StoreError::Persistence { message } => {
            tracing::error!(target: "titulos.api", error = %message, "store_error");
            error_response(
                ApiErrorCode::DatabaseError,
                "Database operation failed. Please try again later.",
            )
            .into_response()
        }
    }
}

fn storage_error_response(error: &StorageError) -> Response {
    tracing::error!(target: "titulos.api", error = %error, "storage_error");
    error_response(
        ApiErrorCode::StorageError,
        "Storage operation failed. Please try again later.",
    )
    .into_response()
}

fn internal_error_response(error: &dyn std::error::Error) -> Response {
    tracing::error!(target: "titulos.api", error = %error, "unhandled_error");
    error_response(ApiErrorCode::InternalError, "An unexpected error occurred").into_response()
}
