use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use synod_core::{ReviewRequest, SynodError};

use crate::gateway::ReviewGateway;
use crate::scheduler::{Scheduler, SubmitOutcome};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";

/// Pull request actions that trigger a review.
const REVIEWED_ACTIONS: &[&str] = &["opened", "reopened", "synchronize"];

/// Why a delivery was rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeRejection {
    /// Signature header missing, unparsable, or HMAC mismatch.
    InvalidSignature,
    /// The payload is not the JSON shape the event promises.
    MalformedPayload(String),
}

/// What to do with a delivery that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeDecision {
    /// A reviewable pull request event.
    Accept(NormalizedEvent),
    /// Valid but not reviewed (wrong event, wrong action, draft).
    Ignore(&'static str),
}

/// The slice of a `pull_request` payload the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub action: String,
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub head_sha: String,
    pub head_ref: String,
    pub base_branch: String,
    pub title: String,
}

impl NormalizedEvent {
    /// Turn the event into a review request once the changed files are known.
    pub fn into_request(self, changed_files: Vec<synod_core::ChangedFile>) -> ReviewRequest {
        ReviewRequest {
            owner: self.owner,
            repo: self.repo,
            number: self.number,
            head_sha: self.head_sha,
            base_branch: self.base_branch,
            head_ref: self.head_ref,
            title: self.title,
            changed_files,
        }
    }
}

/// Check a delivery's `X-Hub-Signature-256` header against the shared secret.
///
/// GitHub signs the raw body with HMAC-SHA256 and sends the tag as
/// `sha256=<hex>`. Comparison is constant-time via the HMAC verifier.
pub fn verify_signature(
    secret: &str,
    payload: &[u8],
    header: Option<&str>,
) -> Result<(), IntakeRejection> {
    let header = header.ok_or(IntakeRejection::InvalidSignature)?;
    let hex_tag = header
        .strip_prefix("sha256=")
        .ok_or(IntakeRejection::InvalidSignature)?;
    let tag = decode_hex(hex_tag).ok_or(IntakeRejection::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| IntakeRejection::InvalidSignature)?;
    mac.update(payload);
    mac.verify_slice(&tag)
        .map_err(|_| IntakeRejection::InvalidSignature)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Decide what to do with a verified delivery.
///
/// Only `pull_request` events with an action in [`REVIEWED_ACTIONS`] are
/// accepted, and draft pull requests are skipped. A `pull_request` payload
/// missing its required fields is malformed; anything else is ignored.
pub fn normalize_event(event: &str, payload: &Value) -> Result<IntakeDecision, IntakeRejection> {
    if event != "pull_request" {
        return Ok(IntakeDecision::Ignore("event not reviewed"));
    }
    let action = payload["action"]
        .as_str()
        .ok_or_else(|| IntakeRejection::MalformedPayload("missing action".into()))?;
    if !REVIEWED_ACTIONS.contains(&action) {
        return Ok(IntakeDecision::Ignore("action not reviewed"));
    }

    let pr = payload
        .get("pull_request")
        .filter(|v| v.is_object())
        .ok_or_else(|| IntakeRejection::MalformedPayload("missing pull_request".into()))?;
    if pr["draft"].as_bool().unwrap_or(false) {
        return Ok(IntakeDecision::Ignore("draft pull request"));
    }

    let str_field = |value: &Value, path: &str| -> Result<String, IntakeRejection> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| IntakeRejection::MalformedPayload(format!("missing {path}")))
    };

    let repository = &payload["repository"];
    let event = NormalizedEvent {
        action: action.to_string(),
        owner: str_field(&repository["owner"]["login"], "repository.owner.login")?,
        repo: str_field(&repository["name"], "repository.name")?,
        number: pr["number"]
            .as_u64()
            .ok_or_else(|| IntakeRejection::MalformedPayload("missing pull_request.number".into()))?,
        head_sha: str_field(&pr["head"]["sha"], "pull_request.head.sha")?,
        head_ref: str_field(&pr["head"]["ref"], "pull_request.head.ref")?,
        base_branch: str_field(&pr["base"]["ref"], "pull_request.base.ref")?,
        title: str_field(&pr["title"], "pull_request.title")?,
    };
    Ok(IntakeDecision::Accept(event))
}

/// Shared state behind the HTTP handlers.
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub gateway: Arc<dyn ReviewGateway>,
    /// Webhook secret; `None` disables verification (development only).
    pub webhook_secret: Option<String>,
}

/// Build the HTTP surface: the webhook endpoint and a liveness probe.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires.
///
/// # Errors
///
/// Returns [`SynodError::Io`] when the address cannot be bound or the
/// server fails while running.
pub async fn serve(
    state: Arc<AppState>,
    bind_addr: &str,
    shutdown: CancellationToken,
) -> Result<(), SynodError> {
    if state.webhook_secret.is_none() {
        warn!("no webhook secret configured, accepting unsigned deliveries");
    }
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "webhook server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = &state.webhook_secret {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if verify_signature(secret, &body, header).is_err() {
            warn!("rejecting delivery with a bad signature");
            return reply(StatusCode::UNAUTHORIZED, json!({ "error": "invalid-signature" }));
        }
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return reply(
                StatusCode::BAD_REQUEST,
                json!({ "error": "malformed-payload", "detail": e.to_string() }),
            );
        }
    };

    let normalized = match normalize_event(event, &payload) {
        Ok(IntakeDecision::Accept(normalized)) => normalized,
        Ok(IntakeDecision::Ignore(reason)) => {
            return reply(StatusCode::OK, json!({ "status": "ignored", "reason": reason }));
        }
        Err(IntakeRejection::MalformedPayload(detail)) => {
            return reply(
                StatusCode::BAD_REQUEST,
                json!({ "error": "malformed-payload", "detail": detail }),
            );
        }
        Err(IntakeRejection::InvalidSignature) => {
            return reply(StatusCode::UNAUTHORIZED, json!({ "error": "invalid-signature" }));
        }
    };
    info!(
        pr = format!("{}/{}#{}", normalized.owner, normalized.repo, normalized.number),
        action = normalized.action,
        sha = normalized.head_sha,
        "pull request event received"
    );

    let changed = match state
        .gateway
        .changed_files(&normalized.owner, &normalized.repo, normalized.number)
        .await
    {
        Ok(changed) => changed,
        Err(e) => {
            warn!(error = %e, "could not list changed files");
            return reply(
                StatusCode::BAD_GATEWAY,
                json!({ "error": "github-unavailable" }),
            );
        }
    };

    match state.scheduler.submit(normalized.into_request(changed)).await {
        Ok(outcome) => {
            let status = match &outcome {
                SubmitOutcome::Created(_) => "queued",
                SubmitOutcome::Duplicate(_) => "duplicate",
                SubmitOutcome::Superseded { .. } => "superseded",
            };
            reply(
                StatusCode::ACCEPTED,
                json!({ "status": status, "job": outcome.job_id().as_str() }),
            )
        }
        Err(e) => {
            warn!(error = %e, "job submission failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "submission-failed" }),
            )
        }
    }
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}
