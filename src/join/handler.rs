//! HTTP handlers for the join endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/join` | Exchange a CI token for a cluster credential |
//! | `DELETE` | `/v1/credentials/{id}` | Revoke an issued credential (admin) |
//! | `GET` | `/health` | Liveness and policy count |
//!
//! ## Join
//!
//! ```json
//! {
//!   "policy": "ci-nodes",
//!   "role": "node",
//!   "id_token": "<CI OIDC token>",
//!   "host_id": "runner-42",
//!   "public_tls_key": "<base64>",
//!   "public_ssh_key": "ssh-ed25519 AAAA..."
//! }
//! ```
//!
//! Failures return `{"error": <kind>, "message": <text>}` with a status
//! derived from [`ErrorKind`]. A body that is not JSON or lacks `role` is a
//! `bad_parameter`.
//!
//! ## Admin Authentication
//!
//! Revocation requires `Authorization: Bearer <admin_token>` where
//! `admin_token` is `admin.bearer_token` from config. Without one configured
//! the endpoint returns `503 Service Unavailable`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::JoinServer;
use super::issuer::{Credential, PublicKeys};
use super::orchestrator::{ErrorKind, JoinError, RegistrationRequest};
use super::policy::Role;

// ── Request / Response types ───────────────────────────────────────────────

/// Join request body.
#[derive(Debug, Deserialize)]
pub struct JoinRequestBody {
    /// Name of the join policy.
    #[serde(default)]
    pub policy: String,
    /// Requested role (case-insensitive).
    pub role: String,
    /// CI platform OIDC token.
    #[serde(default)]
    pub id_token: String,
    /// Host identifier to bind to the credential.
    #[serde(default)]
    pub host_id: String,
    /// TLS public key, standard base64.
    #[serde(default)]
    pub public_tls_key: String,
    /// SSH public key in `authorized_keys` format.
    #[serde(default)]
    pub public_ssh_key: String,
}

/// Successful join response.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Credential id (for revocation).
    pub credential_id: String,
    /// Opaque bearer credential.
    pub access_token: String,
    /// Always `"Bearer"`.
    pub token_type: String,
    /// Granted role.
    pub role: Role,
    /// Host identifier bound to the credential.
    pub host_id: String,
    /// Seconds until expiry.
    pub expires_in: i64,
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
}

impl From<Credential> for JoinResponse {
    fn from(credential: Credential) -> Self {
        Self {
            expires_in: (credential.expires_at - credential.issued_at).num_seconds(),
            expires_at: credential.expires_at,
            credential_id: credential.id,
            access_token: credential.token,
            token_type: "Bearer".to_string(),
            role: credential.role,
            host_id: credential.host_id,
        }
    }
}

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the join routes.
///
/// `/v1/join` is unauthenticated (the CI token IS the authentication);
/// revocation carries its own admin check.
pub fn join_routes(server: Arc<JoinServer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/join", post(join))
        .route("/v1/credentials/{id}", delete(revoke_credential))
        .with_state(server)
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /v1/join`: Exchange a CI identity token for a cluster credential.
async fn join(
    State(server): State<Arc<JoinServer>>,
    payload: Result<Json<JoinRequestBody>, JsonRejection>,
) -> impl IntoResponse {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Unreadable join request");
            return join_error_response(&JoinError::BadParameter(rejection.body_text()));
        }
    };
    let request = match registration_request(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed join request");
            return join_error_response(&e);
        }
    };

    match server.service.register(request).await {
        Ok(credential) => (StatusCode::OK, Json(JoinResponse::from(credential))).into_response(),
        Err(e) => {
            warn!(kind = ?e.kind(), error = %e, "Join rejected");
            join_error_response(&e)
        }
    }
}

/// `DELETE /v1/credentials/{id}`: Revoke an issued credential.
///
/// Requires admin authorization.
async fn revoke_credential(
    State(server): State<Arc<JoinServer>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(response) = check_admin_auth(&server, &headers) {
        return response;
    }

    if server.credentials.revoke(&id) {
        info!(credential_id = %id, "Credential revoked");
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "credential_not_found",
            "Credential not found or already expired",
        )
    }
}

/// `GET /health`
async fn health(State(server): State<Arc<JoinServer>>) -> impl IntoResponse {
    let policies = server.service.policies().list().await.len();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "policies": policies,
        "credentials": server.credentials.len(),
    }))
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Turn the wire body into a [`RegistrationRequest`].
fn registration_request(body: JoinRequestBody) -> Result<RegistrationRequest, JoinError> {
    let role: Role = body
        .role
        .parse()
        .map_err(|e: super::policy::UnknownRole| JoinError::BadParameter(e.to_string()))?;
    let tls = base64::engine::general_purpose::STANDARD
        .decode(body.public_tls_key.trim())
        .map_err(|e| JoinError::BadParameter(format!("public_tls_key is not base64: {e}")))?;

    Ok(RegistrationRequest {
        policy_name: body.policy,
        role,
        external_token: body.id_token,
        host_id: body.host_id,
        public_keys: PublicKeys {
            tls,
            ssh: body.public_ssh_key.into_bytes(),
        },
    })
}

/// HTTP status and error code for a join failure.
fn status_for(kind: ErrorKind) -> (StatusCode, &'static str) {
    match kind {
        ErrorKind::BadParameter => (StatusCode::BAD_REQUEST, "bad_parameter"),
        ErrorKind::NotFoundOrExpired => (StatusCode::NOT_FOUND, "not_found"),
        ErrorKind::ExternalValidationFailed => (StatusCode::UNAUTHORIZED, "invalid_token"),
        ErrorKind::AccessDenied => (StatusCode::FORBIDDEN, "access_denied"),
        ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn join_error_response(err: &JoinError) -> axum::response::Response {
    let (status, code) = status_for(err.kind());
    let message = match err.kind() {
        ErrorKind::Internal => "credential issuance failed".to_string(),
        _ => err.to_string(),
    };
    error_response(status, code, &message)
}

/// Check the `Authorization: Bearer <token>` header against the configured
/// admin token. Returns `Err(response)` if auth fails.
#[allow(clippy::result_large_err)]
fn check_admin_auth(
    server: &JoinServer,
    headers: &HeaderMap,
) -> Result<(), axum::response::Response> {
    use subtle::ConstantTimeEq;

    let Some(ref admin_token) = server.admin_token else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "admin_not_configured",
            "Admin token not configured; revocation disabled",
        ));
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    // Constant-time comparison
    let matches = provided.is_some_and(|p| p.as_bytes().ct_eq(admin_token.as_bytes()).into());

    if matches {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            [("WWW-Authenticate", "Bearer")],
            Json(json!({"error": "unauthorized", "message": "Invalid admin token"})),
        )
            .into_response())
    }
}

/// Create a JSON error response.
fn error_response(status: StatusCode, error: &str, message: &str) -> axum::response::Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}
