//! HTTP surface over the issuance pipeline.
//!
//! | Route | Method | Body |
//! |-------|--------|------|
//! | `/api/v1/signingCert`, `/signing-cert` | POST | [`SigningCertRequest`] → [`SigningCertResponse`] |
//! | `/api/v1/rootCert`, `/root-cert` | GET | [`RootCertResponse`] |
//! | `/healthz` | GET | `{"status": "ok"}` |
//!
//! Failures are answered with an [`ErrorBody`] and a status derived from the
//! error class: 401 authentication, 400 validation, 502 upstream, 500 internal.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::issuance::{CertificateRequest, IssuanceContext, IssuanceCoordinator};
use crate::oidc::OidcError;
use crate::{Error, ErrorClass};

/// Submitted public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyContent {
    /// Base64 of the SPKI DER (or of a PEM `PUBLIC KEY` block).
    pub content: String,
    /// Informational; the algorithm is taken from the key itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningCertRequest {
    pub public_key: PublicKeyContent,
    /// Base64 signature over the token subject.
    #[serde(alias = "signedEmailAddress")]
    pub possession_proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningCertResponse {
    /// PEM certificates, leaf first.
    pub certificate_chain: Vec<String>,
    /// Base64 of the transparency log's receipt.
    pub sct: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCertResponse {
    #[serde(rename = "chainPEM")]
    pub chain_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub class: String,
    pub message: String,
}

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Body was not valid JSON, lacked a field, or carried bad base64.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error(transparent)]
    Issuance(#[from] Error),
}

impl From<OidcError> for ApiError {
    fn from(err: OidcError) -> Self {
        ApiError::Issuance(err.into())
    }
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::MalformedRequest(_) => ErrorClass::Validation,
            ApiError::Issuance(e) => e.class(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MalformedRequest(_) => "malformed_request",
            ApiError::Issuance(e) => e.code(),
        }
    }
}

/// HTTP status for an error class.
pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Authentication => StatusCode::UNAUTHORIZED,
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::Upstream => StatusCode::BAD_GATEWAY,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.class();
        let message = match class {
            // Operator detail stays in the logs.
            ErrorClass::Internal => {
                error!(error = %self, "internal issuance failure");
                "internal error".to_string()
            }
            _ => self.to_string(),
        };
        let body = Json(ErrorBody {
            code: self.code().to_string(),
            class: class.to_string(),
            message,
        });
        (status_for(class), body).into_response()
    }
}

/// Shared handler state.
#[derive(Clone, Debug)]
pub struct ApiState {
    pub coordinator: Arc<IssuanceCoordinator>,
    pub context: IssuanceContext,
}

impl ApiState {
    pub fn new(coordinator: Arc<IssuanceCoordinator>, context: IssuanceContext) -> Self {
        Self {
            coordinator,
            context,
        }
    }
}

/// Builds the router with all issuance routes.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/signingCert", post(signing_cert))
        .route("/signing-cert", post(signing_cert))
        .route("/api/v1/rootCert", get(root_cert))
        .route("/root-cert", get(root_cert))
        .route("/healthz", get(health))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn signing_cert(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<SigningCertRequest>, JsonRejection>,
) -> Result<Json<SigningCertResponse>, ApiError> {
    let token = bearer_token(&headers)?;
    let Json(body) = body.map_err(|e| ApiError::MalformedRequest(e.body_text()))?;

    if let Some(algorithm) = &body.public_key.algorithm {
        debug!(algorithm = %algorithm, "client-declared key algorithm");
    }

    let request = CertificateRequest {
        public_key: decode_field("publicKey.content", &body.public_key.content)?,
        possession_proof: decode_field("possessionProof", &body.possession_proof)?,
    };

    let issued = state
        .coordinator
        .issue(&state.context, token, &request)
        .await?;

    Ok(Json(SigningCertResponse {
        certificate_chain: issued.chain.to_pem_entries(),
        sct: issued.receipt.to_base64(),
    }))
}

async fn root_cert(State(state): State<ApiState>) -> Json<RootCertResponse> {
    let bundle = state.coordinator.root(&state.context);
    Json(RootCertResponse {
        chain_pem: bundle.to_pem(),
    })
}

/// Extracts the token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(OidcError::MissingToken)?;

    let (scheme, token) = value.split_once(' ').ok_or(OidcError::MissingToken)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(OidcError::MissingToken.into());
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(OidcError::MissingToken.into());
    }
    Ok(token)
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, ApiError> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| ApiError::MalformedRequest(format!("{name} is not valid base64: {e}")))
}
