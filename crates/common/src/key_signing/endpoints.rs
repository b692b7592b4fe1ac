//! HTTP endpoint handlers for the issuer and the verifier.
//!
//! The issuer serves the public key set, freshly signed tokens and a health
//! report, plus an optional admin rotation trigger. The verifier serves a
//! single verification endpoint.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use error_stack::Report;
use jose_jwk::JwkSet;
use serde::{Deserialize, Serialize};

use crate::error::{IntoHttpResponse, JwksError};

use super::jwks::public_key_set;
use super::rotation::{HealthReport, HealthStatus, KeyLifecycleManager, Retirement};
use super::scheduler::KeyScheduler;
use super::signing::TokenSigner;
use super::verify::{TokenVerifier, VerificationResult};

pub const JWKS_PATH: &str = "/.well-known/jwks.json";
pub const TOKENS_PATH: &str = "/tokens";
pub const HEALTH_PATH: &str = "/health";
pub const ADMIN_ROTATE_PATH: &str = "/admin/keys/rotate";
pub const VERIFY_PATH: &str = "/verify";

/// Converts a report into a JSON error response.
///
/// The full report is logged; the caller only sees the variant's user message.
#[derive(Debug)]
pub struct ApiError(pub Report<JwksError>);

impl From<Report<JwksError>> for ApiError {
    fn from(report: Report<JwksError>) -> Self {
        Self(report)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let context = self.0.current_context();
        let status = context.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {:?}", self.0);
        } else {
            log::warn!("Request rejected: {context}");
        }

        (
            status,
            Json(ErrorBody {
                error: context.user_message(),
            }),
        )
            .into_response()
    }
}

#[derive(Clone)]
pub struct IssuerState {
    pub manager: Arc<KeyLifecycleManager>,
    pub scheduler: Arc<KeyScheduler>,
    pub signer: Arc<TokenSigner>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RotateResponse {
    pub new_kid: String,
    pub retired: Vec<Retirement>,
}

/// Builds the issuer's router. The admin route exists only when enabled.
pub fn issuer_router(state: IssuerState, admin_rotation_enabled: bool) -> Router {
    let router = Router::new()
        .route(JWKS_PATH, get(handle_jwks))
        .route(TOKENS_PATH, get(handle_issue_token))
        .route(HEALTH_PATH, get(handle_health));

    let router = if admin_rotation_enabled {
        router.route(ADMIN_ROTATE_PATH, post(handle_admin_rotate))
    } else {
        router
    };

    router.with_state(state)
}

async fn handle_jwks(State(state): State<IssuerState>) -> Json<JwkSet> {
    Json(public_key_set(&state.manager.keys().snapshot()))
}

/// Signs a fresh token with the current signing key.
///
/// # Errors
///
/// Returns 503 if the store holds no signing key.
async fn handle_issue_token(
    State(state): State<IssuerState>,
) -> Result<Json<TokenResponse>, ApiError> {
    let issued = state.signer.issue_token(Utc::now())?;
    Ok(Json(TokenResponse {
        token: issued.token,
    }))
}

async fn handle_health(State(state): State<IssuerState>) -> (StatusCode, Json<HealthReport>) {
    let report = state
        .manager
        .health_report(state.scheduler.pending_deletions());
    let status = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

/// Rotates immediately and arms the resulting deletions.
///
/// # Errors
///
/// Returns 500 if the rotation could not be persisted.
async fn handle_admin_rotate(
    State(state): State<IssuerState>,
) -> Result<Json<RotateResponse>, ApiError> {
    log::info!("Admin rotation requested");
    let result = state.scheduler.rotate_now().await?;
    Ok(Json(RotateResponse {
        new_kid: result.new_kid,
        retired: result.retired,
    }))
}

#[derive(Clone)]
pub struct VerifierState {
    pub verifier: Arc<TokenVerifier>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub token: Option<String>,
}

pub fn verifier_router(state: VerifierState) -> Router {
    Router::new()
        .route(VERIFY_PATH, get(handle_verify))
        .with_state(state)
}

/// Verifies the `token` query parameter.
///
/// Verification failures are reported in the body with status 200.
///
/// # Errors
///
/// Returns 400 if the `token` parameter is missing.
async fn handle_verify(
    State(state): State<VerifierState>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<VerificationResult>, ApiError> {
    let token = query.token.filter(|t| !t.is_empty()).ok_or_else(|| {
        Report::new(JwksError::InvalidRequest {
            message: "missing token query parameter".into(),
        })
    })?;

    Ok(Json(state.verifier.verify(&token).await))
}
