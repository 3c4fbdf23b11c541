//! Ingestor (C7): receives Azure DevOps service-hook payloads,
//! verifies the HMAC signature when a secret is configured, normalizes to a
//! [`PrEvent`], and enqueues it.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use reviewbot_core::{Database, EventKind, PrEvent};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookConfig {
    pub secret: Option<SecretString>,
}

impl WebhookConfig {
    pub fn new(secret: Option<SecretString>) -> Self {
        Self { secret }
    }
}

pub struct WebhookState {
    pub config: WebhookConfig,
    pub database: Arc<Database>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    pub message: String,
}

fn ok(message: impl Into<String>) -> (StatusCode, Json<WebhookResponse>) {
    (
        StatusCode::OK,
        Json(WebhookResponse {
            status: "ok".to_string(),
            message: message.into(),
        }),
    )
}

fn rejected(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<WebhookResponse>) {
    (
        status,
        Json(WebhookResponse {
            status: "error".to_string(),
            message: message.into(),
        }),
    )
}

/// `POST /webhooks/azuredevops/pr`. Always returns within the
/// 5 s budget: the handler only validates, normalizes, and enqueues.
pub async fn pr_webhook_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.config.secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());
        match signature {
            Some(sig) if verify_signature(secret.expose_secret(), &body, sig) => {}
            Some(_) => {
                warn!("webhook signature mismatch");
                return rejected(StatusCode::UNAUTHORIZED, "signature mismatch");
            }
            None => {
                warn!("webhook missing signature header while a secret is configured");
                return rejected(StatusCode::UNAUTHORIZED, "missing signature");
            }
        }
    }

    let payload: ServiceHookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed webhook payload");
            return rejected(StatusCode::BAD_REQUEST, "malformed payload");
        }
    };

    let event_type = payload.event_type.clone();
    let Some(event) = payload.into_pr_event() else {
        warn!(event_type = %event_type, "unknown event type, rejecting");
        return rejected(StatusCode::BAD_REQUEST, "unknown event_type");
    };

    match state.database.get_repository(event.repository_id).await {
        Ok(_) => {}
        Err(_) => {
            info!(repository_id = event.repository_id, "event for unmonitored repository, acking without enqueue");
            return ok("repository not monitored");
        }
    }

    if let Err(e) = state.database.enqueue(&event).await {
        warn!(error = %e, "failed to enqueue event");
        return rejected(StatusCode::INTERNAL_SERVER_ERROR, "enqueue failed");
    }

    ok("accepted")
}

fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        warn!("signature missing sha256= prefix");
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        warn!("signature is not valid hex");
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Azure DevOps service hook envelope: only the PR-relevant fields
/// are modeled, the rest of the payload is ignored.
#[derive(Debug, Deserialize)]
struct ServiceHookPayload {
    #[serde(rename = "eventType")]
    event_type: String,
    resource: ResourceDto,
}

#[derive(Debug, Deserialize)]
struct ResourceDto {
    #[serde(rename = "pullRequestId")]
    pull_request_id: i64,
    repository: RepositoryRefDto,
    #[serde(rename = "sourceRefName")]
    source_ref_name: String,
    #[serde(rename = "targetRefName")]
    target_ref_name: String,
    #[serde(rename = "lastMergeSourceCommit")]
    last_merge_source_commit: CommitRefDto,
    #[serde(rename = "lastMergeTargetCommit")]
    last_merge_target_commit: CommitRefDto,
    #[serde(default)]
    #[serde(rename = "codeReviewId")]
    code_review_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RepositoryRefDto {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct CommitRefDto {
    #[serde(rename = "commitId")]
    commit_id: String,
}

impl ServiceHookPayload {
    fn into_pr_event(self) -> Option<PrEvent> {
        let event_kind = if self.event_type.ends_with("pullrequest.created") {
            EventKind::Created
        } else if self.event_type.ends_with("pullrequest.updated") {
            EventKind::Updated
        } else {
            return None;
        };

        Some(PrEvent {
            event_kind,
            pr_id: self.resource.pull_request_id,
            repository_id: self.resource.repository.id,
            source_branch: self.resource.source_ref_name,
            target_branch: self.resource.target_ref_name,
            source_commit: self.resource.last_merge_source_commit.commit_id,
            target_commit: self.resource.last_merge_target_commit.commit_id,
            iteration_id: self.resource.code_review_id.map(|id| id.to_string()),
            received_at: Utc::now(),
        })
    }
}
