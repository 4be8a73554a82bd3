//! API route handlers.
//!
//! Every response is structured JSON. Internal error text goes to the log,
//! never to the caller.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri},
};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;

use leadflow_core::error::LeadflowError;
use leadflow_core::traits::SequenceStore;
use leadflow_core::types::normalize_identity;
use leadflow_router::{IntakeOutcome, SignupPayload};
use leadflow_security::signature::{SIGNATURE_HEADER, verify};

use super::server::AppState;

type ApiResponse = (StatusCode, Json<Value>);

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "campaign": state.intake.campaign(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

fn rejected(state: &AppState, code: StatusCode, message: &str, email: &str) -> ApiResponse {
    (
        code,
        Json(json!({
            "status": "rejected",
            "message": message,
            "email": email,
            "campaign": state.intake.campaign(),
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
}

/// Map an error to a status code and a caller-safe message.
fn error_response(state: &AppState, err: &LeadflowError, email: &str) -> ApiResponse {
    match err {
        LeadflowError::Validation(msg) => rejected(state, StatusCode::BAD_REQUEST, msg, email),
        e if e.is_duplicate() => {
            rejected(state, StatusCode::OK, "Sequence already in progress", email)
        }
        LeadflowError::Downstream { .. } | LeadflowError::Database(_) => {
            tracing::warn!("⚠️ Request for '{email}' failed downstream: {err}");
            rejected(
                state,
                StatusCode::SERVICE_UNAVAILABLE,
                "Temporarily unavailable, please retry",
                email,
            )
        }
        _ => {
            tracing::error!("❌ Request for '{email}' failed: {err}");
            rejected(state, StatusCode::INTERNAL_SERVER_ERROR, "Internal error", email)
        }
    }
}

/// `None` when the request may proceed. POST bodies are signed; GET requests
/// sign their path.
fn check_signature(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Option<ApiResponse> {
    let secret = state.webhook_secret.as_deref()?;
    let presented = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented.is_empty() || !verify(secret, body, presented) {
        tracing::warn!("[webhook] Missing or invalid {SIGNATURE_HEADER}");
        return Some(rejected(state, StatusCode::UNAUTHORIZED, "Invalid webhook signature", ""));
    }
    None
}

/// Signup webhook (POST /webhook/signup, /api/v1/signup).
pub async fn signup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    if let Some(denied) = check_signature(&state, &headers, &body) {
        return denied;
    }

    let body = String::from_utf8_lossy(&body);
    let payload = match SignupPayload::from_json(&body) {
        Ok(p) => p,
        Err(e) => return error_response(&state, &e, ""),
    };
    let email = payload.email.as_deref().unwrap_or_default().trim().to_string();
    let lead = match payload.into_lead() {
        Ok(lead) => lead,
        Err(e) => {
            tracing::info!("[signup] Rejected '{email}': {e}");
            return error_response(&state, &e, &email);
        }
    };

    match state.intake.handle(lead).await {
        Ok(IntakeOutcome::Accepted(receipt)) => {
            let message = match (receipt.resumed, receipt.failed.is_empty()) {
                (false, true) => format!("Sequence scheduled: {} emails", receipt.scheduled.len()),
                (true, true) => format!("Sequence resumed: {} emails", receipt.scheduled.len()),
                (_, false) => format!(
                    "Sequence partially scheduled: {} of {} emails, retry to resume",
                    receipt.scheduled.len(),
                    receipt.scheduled.len() + receipt.failed.len()
                ),
            };
            (
                StatusCode::OK,
                Json(json!({
                    "status": "accepted",
                    "message": message,
                    "email": receipt.email,
                    "campaign": state.intake.campaign(),
                    "segment": receipt.segment.label(),
                    "priority": receipt.segment.priority(),
                    "scheduled_steps": receipt.scheduled,
                    "failed_steps": receipt.failed,
                    "alerted": receipt.alerted,
                    "timestamp": receipt.timestamp.to_rfc3339(),
                })),
            )
        }
        Ok(IntakeOutcome::AlreadyProcessed {
            email,
            segment,
            timestamp,
            ..
        }) => (
            StatusCode::OK,
            Json(json!({
                "status": "rejected",
                "message": "Sequence already in progress",
                "email": email,
                "campaign": state.intake.campaign(),
                "segment": segment.label(),
                "timestamp": timestamp.to_rfc3339(),
            })),
        ),
        Err(e) => error_response(&state, &e, &email),
    }
}

/// Unsubscribe webhook (POST /webhook/unsubscribe), body `{"email": "..."}`.
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    if let Some(denied) = check_signature(&state, &headers, &body) {
        return denied;
    }

    let email = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v["email"].as_str().map(|s| s.trim().to_string()))
        .filter(|e| !e.is_empty());
    let Some(email) = email else {
        return rejected(&state, StatusCode::BAD_REQUEST, "email is required", "");
    };

    match state.intake.cancel(&email).await {
        Ok(cancelled) => {
            let status = if cancelled { "unsubscribed" } else { "not_found" };
            (
                StatusCode::OK,
                Json(json!({
                    "status": status,
                    "email": email,
                    "campaign": state.intake.campaign(),
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
        }
        Err(e) => error_response(&state, &e, &email),
    }
}

/// Inspect a lead's sequence (GET /api/v1/sequences/{email}).
pub async fn get_sequence(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> ApiResponse {
    if let Some(denied) = check_signature(&state, &headers, uri.path().as_bytes()) {
        return denied;
    }
    let identity = normalize_identity(&email);
    match state.intake.store().get(&identity).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "sent": record.sent_count(),
                "pending": record.pending_steps(),
                "sequence": record,
            })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "not_found", "email": email})),
        ),
        Err(e) => error_response(&state, &e, &email),
    }
}
