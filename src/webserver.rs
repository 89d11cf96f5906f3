//! HTTP API
//!
//! axum router exposing the vault. Management routes take
//! `Authorization: Bearer <token>`, where the token is either the configured admin token
//! or a session token from `POST /login`; the signed-in user's id becomes the audit
//! actor. The secret read routes take `Authorization: Api <token>` and are checked
//! against the token's permissions.
//!
//! | Route                                      | Methods               |
//! |--------------------------------------------|-----------------------|
//! | `/api/ping`                                | GET (public)          |
//! | `/login`                                   | POST (public)         |
//! | `/api/secrets/get?key=`                    | GET (API token)       |
//! | `/api/secrets/list`                        | GET (API token)       |
//! | `/api/secrets`                             | GET POST PUT DELETE   |
//! | `/api/tokens`, `/api/tokens/:id`           | GET POST / PUT DELETE |
//! | `/api/permissions`, `/api/permissions/:id` | GET POST / PUT DELETE |
//! | `/api/users`, `/api/users/:id`             | GET POST / PUT DELETE |
//! | `/api/certificates`                        | GET                   |
//! | `/api/certificates/:name`                  | GET DELETE            |
//! | `/api/certificates/:name/export`           | GET                   |
//! | `/api/certificates/generate-keypair`       | POST                  |
//! | `/api/certificates/import`                 | POST                  |
//! | `/api/certificates/generate-certificate`   | POST                  |
//! | `/api/certificates/verify`                 | POST                  |
//!
//! Vault calls block on the record store and on key generation, so every handler runs
//! them through `tokio::task::spawn_blocking`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::configs::AppConfig;
use crate::credentials::tokens_match;
use crate::error::Error;
use crate::protocol::{
    ApiResponse, CreatePermissionRequest, CreateSecretRequest, CreateTokenRequest,
    CreateUserRequest, ErrorResponse, ExportedCertificate, GenerateCertificateRequest,
    GenerateKeyPairRequest, ImportCertificateRequest, KeyPairRecords, LoginRequest,
    LoginResponse, SecretKeyQuery, UpdatePermissionRequest, UpdateSecretRequest,
    UpdateTokenRequest, UpdateUserRequest, VerifyCertificateRequest,
};
use crate::records::{CertificateRecord, CertificateSummary, Permission, Secret, Token, User};
use crate::vault::Vault;
use crate::verification::VerificationReport;

/// Actor name recorded for requests authenticated with the admin token.
const ADMIN_ACTOR: &str = "admin";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::UnsupportedAlgorithm(_)
            | Error::UnsupportedKeySize { .. }
            | Error::MalformedEncoding(_)
            | Error::UnsupportedFormat(_)
            | Error::UnsupportedKeyType(_)
            | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists { .. } => StatusCode::CONFLICT,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::SigningFailed(_)
            | Error::GenerationFailed(_)
            | Error::Persistence(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Rejection details stay in the audit trail
        let message = match &self {
            Error::Unauthorized(_) => "unauthorized".to_string(),
            other => other.to_string(),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

/// Who is calling a management route, as recorded in the audit trail.
#[derive(Debug, Clone)]
pub struct Actor(String);

impl Actor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone)]
pub struct AppState {
    vault: Vault,
    admin_token: Arc<SecretString>,
}

impl AppState {
    pub fn new(vault: Vault, admin_token: SecretString) -> Self {
        Self {
            vault,
            admin_token: Arc::new(admin_token),
        }
    }
}

fn ok<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse::ok(data))
}

// Run blocking vault work off the async executor.
async fn blocking<T, F>(work: F) -> std::result::Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("worker task failed: {}", e)))?
}

async fn run<T, F>(state: &AppState, work: F) -> ApiResult<T>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&Vault) -> std::result::Result<T, Error> + Send + 'static,
{
    let vault = state.vault.clone();
    blocking(move || work(&vault)).await.map(ok)
}

async fn resolve_actor(state: &AppState, bearer: &str) -> Option<Actor> {
    if tokens_match(bearer, state.admin_token.expose_secret()) {
        return Some(Actor(ADMIN_ACTOR.to_string()));
    }
    let vault = state.vault.clone();
    let session = bearer.to_string();
    blocking(move || vault.authenticate_session(&session))
        .await
        .ok()
        .map(|user| Actor(user.id.to_string()))
}

async fn require_operator(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = authorization(request.headers())
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(str::to_string);

    if let Some(bearer) = bearer {
        if let Some(actor) = resolve_actor(&state, &bearer).await {
            request.extensions_mut().insert(actor);
            return next.run(request).await;
        }
    }

    audit::record(
        AuditEvent::Unauthorized,
        "anonymous",
        &format!("rejected {} {}", request.method(), request.uri().path()),
    );
    Error::Unauthorized("missing or invalid bearer token".to_string()).into_response()
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}

/// Build the full application router.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let management = Router::new()
        .route(
            "/api/secrets",
            get(list_secrets)
                .post(create_secret)
                .put(update_secret)
                .delete(delete_secret),
        )
        .route("/api/tokens", get(list_tokens).post(create_token))
        .route("/api/tokens/:id", put(update_token).delete(delete_token))
        .route(
            "/api/permissions",
            get(list_permissions).post(create_permission),
        )
        .route(
            "/api/permissions/:id",
            put(update_permission).delete(delete_permission),
        )
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/:id", put(update_user).delete(delete_user))
        .route("/api/certificates", get(list_certificates))
        .route(
            "/api/certificates/generate-keypair",
            post(generate_keypair),
        )
        .route("/api/certificates/import", post(import_certificate))
        .route(
            "/api/certificates/generate-certificate",
            post(generate_certificate),
        )
        .route("/api/certificates/verify", post(verify_certificate))
        .route(
            "/api/certificates/:name",
            get(get_certificate).delete(delete_certificate),
        )
        .route("/api/certificates/:name/export", get(export_certificate))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_operator));

    Router::new()
        .route("/api/ping", get(ping))
        .route("/login", post(login))
        .route("/api/secrets/get", get(read_secret))
        .route("/api/secrets/list", get(list_readable_secrets))
        .merge(management)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

/// Start the HTTP(S) server and block until it stops.
pub fn start_webserver(config: AppConfig, vault: Vault, admin_token: SecretString) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(serve(config, vault, admin_token))
}

async fn serve(config: AppConfig, vault: Vault, admin_token: SecretString) -> Result<()> {
    let addr = config.server.socket_addr()?;
    let app = router(
        AppState::new(vault, admin_token),
        &config.server.allowed_origins,
    );

    match config.server.tls_paths() {
        Some((cert_path, key_path)) => {
            let tls = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .context(format!(
                    "Failed to load TLS certificate {} and key {}",
                    cert_path.display(),
                    key_path.display()
                ))?;
            let handle = Handle::new();
            tokio::spawn(shutdown_after(shutdown_signal(), handle.clone()));
            info!(%addr, "HTTPS server listening");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .context("HTTPS server failed")?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context(format!("Failed to bind {}", addr))?;
            info!(%addr, "HTTP server listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("HTTP server failed")?;
        }
    }

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

// Drain the TLS server's open connections once `signal` resolves.
async fn shutdown_after(signal: impl Future<Output = ()>, handle: Handle) {
    signal.await;
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}

// ================= Public routes =================

async fn ping() -> Json<ApiResponse<&'static str>> {
    ok("pong")
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    run(&state, move |vault| vault.login(&request)).await
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

fn owned_authorization(headers: &HeaderMap) -> Option<String> {
    authorization(headers).map(str::to_string)
}

async fn read_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SecretKeyQuery>,
) -> ApiResult<Secret> {
    let auth = owned_authorization(&headers);
    run(&state, move |vault| vault.read_secret(auth.as_deref(), &query.key)).await
}

async fn list_readable_secrets(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Vec<Secret>> {
    let auth = owned_authorization(&headers);
    run(&state, move |vault| vault.list_readable_secrets(auth.as_deref())).await
}

// ================= Secrets =================

async fn list_secrets(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<Vec<Secret>> {
    run(&state, move |vault| vault.list_secrets(actor.as_str())).await
}

async fn create_secret(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<CreateSecretRequest>,
) -> ApiResult<Secret> {
    run(&state, move |vault| vault.create_secret(actor.as_str(), &request)).await
}

async fn update_secret(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<SecretKeyQuery>,
    Json(request): Json<UpdateSecretRequest>,
) -> ApiResult<Secret> {
    run(&state, move |vault| {
        vault.update_secret(actor.as_str(), &query.key, &request)
    })
    .await
}

async fn delete_secret(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<SecretKeyQuery>,
) -> ApiResult<()> {
    run(&state, move |vault| vault.delete_secret(actor.as_str(), &query.key)).await
}

// ================= Tokens =================

async fn list_tokens(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<Vec<Token>> {
    run(&state, move |vault| vault.list_tokens(actor.as_str())).await
}

async fn create_token(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<CreateTokenRequest>,
) -> ApiResult<Token> {
    run(&state, move |vault| vault.create_token(actor.as_str(), &request)).await
}

async fn update_token(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateTokenRequest>,
) -> ApiResult<Token> {
    run(&state, move |vault| vault.update_token(actor.as_str(), id, &request)).await
}

async fn delete_token(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    run(&state, move |vault| vault.delete_token(actor.as_str(), id)).await
}

// ================= Permissions =================

async fn list_permissions(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<Vec<Permission>> {
    run(&state, move |vault| vault.list_permissions(actor.as_str())).await
}

async fn create_permission(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<CreatePermissionRequest>,
) -> ApiResult<Permission> {
    run(&state, move |vault| vault.create_permission(actor.as_str(), &request)).await
}

async fn update_permission(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdatePermissionRequest>,
) -> ApiResult<Permission> {
    run(&state, move |vault| {
        vault.update_permission(actor.as_str(), id, &request)
    })
    .await
}

async fn delete_permission(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    run(&state, move |vault| vault.delete_permission(actor.as_str(), id)).await
}

// ================= Users =================

async fn list_users(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<Vec<User>> {
    run(&state, move |vault| vault.list_users(actor.as_str())).await
}

async fn create_user(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult<User> {
    run(&state, move |vault| vault.create_user(actor.as_str(), &request)).await
}

async fn update_user(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateUserRequest>,
) -> ApiResult<User> {
    run(&state, move |vault| vault.update_user(actor.as_str(), id, &request)).await
}

async fn delete_user(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    run(&state, move |vault| vault.delete_user(actor.as_str(), id)).await
}

// ================= Certificates =================

async fn list_certificates(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<Vec<CertificateSummary>> {
    run(&state, move |vault| vault.list_certificates(actor.as_str())).await
}

async fn get_certificate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(name): Path<String>,
) -> ApiResult<CertificateRecord> {
    run(&state, move |vault| vault.get_certificate(actor.as_str(), &name)).await
}

async fn export_certificate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(name): Path<String>,
) -> ApiResult<ExportedCertificate> {
    run(&state, move |vault| vault.export_certificate(actor.as_str(), &name)).await
}

async fn delete_certificate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(name): Path<String>,
) -> ApiResult<()> {
    run(&state, move |vault| vault.delete_certificate(actor.as_str(), &name)).await
}

async fn generate_keypair(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<GenerateKeyPairRequest>,
) -> ApiResult<KeyPairRecords> {
    run(&state, move |vault| vault.generate_keypair(actor.as_str(), &request)).await
}

async fn import_certificate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<ImportCertificateRequest>,
) -> ApiResult<CertificateRecord> {
    run(&state, move |vault| vault.import_certificate(actor.as_str(), &request)).await
}

async fn generate_certificate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<GenerateCertificateRequest>,
) -> ApiResult<CertificateRecord> {
    run(&state, move |vault| {
        vault.generate_certificate(actor.as_str(), &request)
    })
    .await
}

async fn verify_certificate(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<VerifyCertificateRequest>,
) -> ApiResult<VerificationReport> {
    run(&state, move |vault| vault.verify_certificate(actor.as_str(), &request)).await
}
