//! GitHub webhook receiver.
//!
//! Every delivery is persisted before any action so it can be replayed
//! after a crash. Signatures are HMAC-SHA-256 over the raw body, compared
//! in constant time; a bad signature is rejected with 401 and recorded on
//! the stored delivery.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};
use zephyr_scheduler::{event_matches, TriggerEvent};
use zephyr_store::RunTrigger;

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Serialize)]
pub struct WebhookResponse {
    pub delivery_id: String,
    pub run_id: Option<String>,
}

/// Verify a `sha256=<hex>` signature header against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, (StatusCode, String)> {
    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let payload = String::from_utf8_lossy(&body).into_owned();

    // Persist before anything else.
    let delivery = state
        .store
        .save_webhook_delivery("github", &event_type, &payload, signature.as_deref())
        .await
        .map_err(internal)?;

    if let Some(secret) = &state.webhook_secret {
        let valid = signature
            .as_deref()
            .map(|sig| verify_signature(secret, &body, sig))
            .unwrap_or(false);
        if !valid {
            warn!(delivery_id = %delivery.id, "webhook signature rejected");
            let _ = state
                .store
                .mark_webhook_processed(delivery.id, None, Some("invalid signature"))
                .await;
            return Err((StatusCode::UNAUTHORIZED, "invalid signature".to_string()));
        }
    }

    let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap_or_default();
    let run_id = match process_event(&state, &event_type, &parsed).await {
        Ok(run_id) => {
            state
                .store
                .mark_webhook_processed(delivery.id, run_id, None)
                .await
                .map_err(internal)?;
            run_id
        }
        Err(reason) => {
            state
                .store
                .mark_webhook_processed(delivery.id, None, Some(&reason))
                .await
                .map_err(internal)?;
            None
        }
    };

    Ok(Json(WebhookResponse {
        delivery_id: delivery.id.to_string(),
        run_id: run_id.map(|id| id.to_string()),
    }))
}

/// Map the delivery to a project, evaluate its trigger rules and create a
/// run when they match.
async fn process_event(
    state: &AppState,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<Option<zephyr_core::ids::RunId>, String> {
    let repo_name = payload["repository"]["name"]
        .as_str()
        .ok_or_else(|| "payload has no repository name".to_string())?;

    let project = state
        .store
        .get_project_by_name(repo_name)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no project named {repo_name}"))?;

    let Some(event) = parse_trigger_event(event_type, payload) else {
        return Err(format!("unhandled event type: {event_type}"));
    };

    let definition = state
        .source
        .resolve(&project, "default")
        .await
        .map_err(|e| e.to_string())?;

    if !event_matches(&event, &definition.triggers) {
        info!(project = %project.name, event = %event_type, "no trigger matched");
        return Ok(None);
    }

    let (branch, commit_sha) = match &event {
        TriggerEvent::Push { branch, .. } => (
            Some(branch.clone()),
            payload["after"].as_str().map(str::to_string),
        ),
        TriggerEvent::PullRequest { target_branch, .. } => (
            Some(target_branch.clone()),
            payload["pull_request"]["head"]["sha"]
                .as_str()
                .map(str::to_string),
        ),
        _ => (None, None),
    };

    let run = state
        .store
        .create_run(
            project.id,
            &definition.name,
            RunTrigger {
                trigger_type: event_type.to_string(),
                trigger_data: Some(payload.clone()),
                branch,
                commit_sha,
            },
        )
        .await
        .map_err(|e| e.to_string())?;

    state.scheduler.notify_run_queued(run.id).await;
    info!(run_id = %run.id, project = %project.name, "run created from webhook");
    Ok(Some(run.id))
}

fn parse_trigger_event(event_type: &str, payload: &serde_json::Value) -> Option<TriggerEvent> {
    match event_type {
        "push" => {
            let git_ref = payload["ref"].as_str()?;
            let changed_paths = changed_paths(payload);
            if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
                Some(TriggerEvent::Tag {
                    name: tag.to_string(),
                })
            } else {
                Some(TriggerEvent::Push {
                    branch: git_ref.to_string(),
                    changed_paths,
                })
            }
        }
        "pull_request" => Some(TriggerEvent::PullRequest {
            action: payload["action"].as_str().unwrap_or("opened").to_string(),
            target_branch: payload["pull_request"]["base"]["ref"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            changed_paths: vec![],
        }),
        _ => None,
    }
}

fn changed_paths(payload: &serde_json::Value) -> Vec<String> {
    let mut paths = Vec::new();
    if let Some(commits) = payload["commits"].as_array() {
        for commit in commits {
            for key in ["added", "modified", "removed"] {
                if let Some(files) = commit[key].as_array() {
                    paths.extend(
                        files
                            .iter()
                            .filter_map(|f| f.as_str())
                            .map(str::to_string),
                    );
                }
            }
        }
    }
    paths.sort();
    paths.dedup();
    paths
}

fn internal(e: zephyr_core::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, &header));
    }

    #[test]
    fn test_body_mutation_rejected() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("topsecret", body);
        let mut tampered = body.to_vec();
        tampered[0] ^= 0x01;
        assert!(!verify_signature("topsecret", &tampered, &header));
    }

    #[test]
    fn test_signature_mutation_rejected() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("topsecret", body);
        // Flip one hex digit.
        let mut chars: Vec<char> = header.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        assert!(!verify_signature("topsecret", body, &tampered));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"payload";
        let header = sign("secret-a", body);
        assert!(!verify_signature("secret-b", body, &header));
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(!verify_signature("s", b"x", "sha1=abcd"));
        assert!(!verify_signature("s", b"x", "sha256=nothex"));
        assert!(!verify_signature("s", b"x", ""));
    }

    #[test]
    fn test_changed_paths_collected() {
        let payload = serde_json::json!({
            "commits": [
                {"added": ["src/a.rs"], "modified": ["README.md"], "removed": []},
                {"added": [], "modified": ["src/a.rs"], "removed": ["old.txt"]}
            ]
        });
        assert_eq!(
            changed_paths(&payload),
            vec!["README.md", "old.txt", "src/a.rs"]
        );
    }
}
