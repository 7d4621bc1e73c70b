//! HTTP surface over [`StructureService`].
//!
//! Caller identity comes from the `x-user-id` header, set by whatever sits in front
//! of this service. Errors are `{"message": ...}` with the status from
//! [`ServiceError::http_status`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::structure::{DecidedSuggestion, GeneratedProposal, ServiceError, StructureService};
use crate::structure::store::{Proposal, Suggestion};

pub const USER_HEADER: &str = "x-user-id";

type AppState = Arc<StructureService>;

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/proposals", post(generate_proposal))
        .route("/proposals/:id/confirm", post(confirm_proposal))
        .route("/proposals/:id/discard", post(discard_proposal))
        .route("/suggestions", get(list_pending))
        .route("/suggestions/breakdown", post(breakdown))
        .route("/suggestions/:id/approve", post(approve))
        .route("/suggestions/:id/reject", post(reject))
        .with_state(service)
}

pub async fn serve(service: AppState, bind: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(service)).await
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // Internal details stay in the log.
        let message = match &self.0 {
            ServiceError::Store(e) => {
                error!(error = %e, "store failure");
                "Internal server error".to_string()
            }
            ServiceError::Persist(e) if status.is_server_error() => {
                error!(error = %e, "persist failure");
                "Internal server error".to_string()
            }
            ServiceError::Upstream(message) => message.clone(),
            other => other.to_string(),
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(ServiceError::InvalidInput(message.into()))
}

// =============================================================================
// Extractors
// =============================================================================

/// Authenticated caller id.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or(ApiError(ServiceError::Unauthorized))
    }
}

/// Empty bodies read as `T::default()` so optional bodies can be omitted.
fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {e}")))
}

fn parse_id(raw: &str, what: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| bad_request(format!("{what} must be an integer, got {raw:?}")))
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct GenerateBody {
    squad_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct BreakdownBody {
    proposal_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ApproveBody {
    #[serde(default, alias = "editedPayload")]
    edited_payload: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RejectBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn generate_proposal(
    State(service): State<AppState>,
    Caller(actor): Caller,
    body: Bytes,
) -> Result<(StatusCode, Json<GeneratedProposal>), ApiError> {
    let body: GenerateBody = json_body(&body)?;
    let squad_id = body.squad_id.ok_or_else(|| bad_request("squad_id is required"))?;
    let generated = service.generate_proposal(squad_id, &actor).await?;
    Ok((StatusCode::CREATED, Json(generated)))
}

async fn confirm_proposal(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<Json<Proposal>, ApiError> {
    let id = parse_id(&id, "proposal id")?;
    Ok(Json(service.confirm_proposal(id, &actor).await?))
}

async fn discard_proposal(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<Json<Proposal>, ApiError> {
    let id = parse_id(&id, "proposal id")?;
    Ok(Json(service.discard_proposal(id, &actor).await?))
}

async fn list_pending(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Suggestion>>, ApiError> {
    let raw = query
        .get("squad_id")
        .ok_or_else(|| bad_request("squad_id query parameter is required"))?;
    let squad_id = parse_id(raw, "squad_id")?;
    Ok(Json(service.list_pending(squad_id, &actor).await?))
}

async fn breakdown(
    State(service): State<AppState>,
    Caller(actor): Caller,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let body: BreakdownBody = json_body(&body)?;
    let proposal_id = body
        .proposal_id
        .ok_or_else(|| bad_request("proposal_id is required"))?;
    let created = service.breakdown(proposal_id, &actor).await?;
    Ok((StatusCode::CREATED, Json(json!({ "created": created }))))
}

async fn approve(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<DecidedSuggestion>, ApiError> {
    let id = parse_id(&id, "suggestion id")?;
    let body: ApproveBody = json_body(&body)?;
    Ok(Json(service.approve(id, &actor, body.edited_payload).await?))
}

async fn reject(
    State(service): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<DecidedSuggestion>, ApiError> {
    let id = parse_id(&id, "suggestion id")?;
    let body: RejectBody = json_body(&body)?;
    Ok(Json(service.reject(id, &actor, body.reason).await?))
}
