// src/server/handlers/trigger.rs
//! Manual trigger endpoint
//!
//! GET /update?action=update|status|check&key=SECRET
//!
//! Order of checks: trigger configured (503), client blocked (429), key
//! valid (403), then the action runs. A valid key clears the client's
//! failure history.

use super::Reply;
use crate::clock::format_unix;
use crate::error::Result;
use crate::security::{client_identity, verify_secret};
use crate::server::{SharedState, TriggerState};
use crate::state::short_version;
use crate::sync::{Orchestrator, SkipReason, SyncOutcome, SyncStatus};
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tracing::{debug, error, info};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Query parameters of the trigger
#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    pub action: Option<String>,
    pub key: Option<String>,
}

/// GET /update
pub async fn trigger(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let forwarded = headers.get(FORWARDED_FOR).and_then(|v| v.to_str().ok());
    let identity = client_identity(peer.ip(), forwarded, &state.trusted_proxies);

    // Rate-limit records and sync cycles both block on disk and network
    let result = tokio::task::spawn_blocking(move || respond(&state, &identity, &query)).await;

    match result {
        Ok(Ok(reply)) => reply.into_response(),
        Ok(Err(err)) => {
            error!("Trigger request failed: {}", err);
            internal_error()
        }
        Err(err) => {
            error!("Trigger task join error: {}", err);
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    Reply::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "success": false, "message": "internal error" }),
    )
    .into_response()
}

fn respond(state: &TriggerState, identity: &str, query: &TriggerQuery) -> Result<Reply> {
    let secret = match &state.secret {
        Ok(secret) => secret,
        Err(e) => {
            debug!("Refusing trigger request: {}", e);
            return Ok(Reply::new(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "success": false,
                    "message": "manual trigger is not configured; set a secret key first",
                }),
            ));
        }
    };

    if let Some(until) = state.guard.blocked_until(identity)? {
        return Ok(Reply::new(
            StatusCode::TOO_MANY_REQUESTS,
            json!({
                "success": false,
                "message": "too many failed attempts; temporarily blocked, try again later",
                "blocked_until": format_unix(until),
            }),
        ));
    }

    let provided = query.key.as_deref().unwrap_or("");
    if !verify_secret(provided, secret) {
        let blocked = state.guard.record_failure(identity)?;
        info!(client = identity, blocked, "Rejected trigger request with invalid key");
        return Ok(Reply::new(
            StatusCode::FORBIDDEN,
            json!({ "success": false, "message": "invalid key" }),
        ));
    }
    state.guard.clear(identity)?;

    let orchestrator = &state.orchestrator;
    match query.action.as_deref() {
        Some("update") => update(orchestrator),
        Some("check") => Ok(check(orchestrator)),
        Some("status") => status(orchestrator),
        _ => Ok(usage()),
    }
}

fn update(orchestrator: &Orchestrator) -> Result<Reply> {
    let body = match orchestrator.force_sync() {
        SyncOutcome::Updated { version, size } => {
            let message = match &version {
                Some(v) => format!("updated to {}", short_version(v)),
                None => "updated".to_string(),
            };
            json!({
                "success": true,
                "message": message,
                "version": version,
                "size": size,
            })
        }
        SyncOutcome::NoAction(SkipReason::AlreadyCurrent) => {
            let state = orchestrator.state()?;
            json!({
                "success": true,
                "message": format!("already up to date: {}", state.short_version()),
                "version": state.current_version,
            })
        }
        SyncOutcome::NoAction(SkipReason::LockHeld) => json!({
            "success": false,
            "message": "update already in progress",
        }),
        SyncOutcome::NoAction(reason) => json!({
            "success": false,
            "message": reason.to_string(),
        }),
        SyncOutcome::Failed(e) => json!({
            "success": false,
            "message": e.to_string(),
            "error": e.kind(),
        }),
    };
    Ok(Reply::ok(body))
}

fn check(orchestrator: &Orchestrator) -> Reply {
    let body = match orchestrator.evaluate_and_sync() {
        SyncOutcome::Updated { .. } => json!({
            "success": true,
            "message": "checked and updated",
            "updated": true,
        }),
        SyncOutcome::NoAction(reason) => json!({
            "success": true,
            "message": "checked, no update needed",
            "updated": false,
            "reason": reason,
        }),
        SyncOutcome::Failed(e) => json!({
            "success": false,
            "message": e.to_string(),
            "error": e.kind(),
            "updated": false,
        }),
    };
    Reply::ok(body)
}

/// Status report with human-readable companions
#[derive(Debug, Serialize)]
struct StatusBody {
    success: bool,
    #[serde(flatten)]
    status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact_size_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_check_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_update_formatted: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_check_formatted: Option<String>,
}

fn status(orchestrator: &Orchestrator) -> Result<Reply> {
    let status = orchestrator.status()?;
    let body = StatusBody {
        success: true,
        artifact_size_formatted: (status.artifact_size > 0).then(|| format_kb(status.artifact_size)),
        last_check_formatted: formatted(status.last_check),
        last_update_formatted: formatted(status.last_update),
        next_check_formatted: formatted(status.next_check),
        status,
    };
    Ok(Reply::ok(serde_json::to_value(body)?))
}

fn usage() -> Reply {
    Reply::ok(json!({
        "success": false,
        "message": "unknown action; supported actions: update, status, check",
        "usage": {
            "update": "/update?action=update&key=YOUR_KEY - force an update",
            "status": "/update?action=status&key=YOUR_KEY - show current status",
            "check": "/update?action=check&key=YOUR_KEY - check and update if needed",
        },
    }))
}

fn formatted(secs: i64) -> Option<String> {
    (secs > 0).then(|| format_unix(secs))
}

/// Size in kibibytes with two decimals, e.g. "12.34 KB"
pub fn format_kb(bytes: u64) -> String {
    format!("{:.2} KB", bytes as f64 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_kb() {
        assert_eq!(format_kb(1024), "1.00 KB");
        assert_eq!(format_kb(12_636), "12.34 KB");
    }

    #[test]
    fn test_formatted_skips_zero() {
        assert_eq!(formatted(0), None);
        assert_eq!(formatted(86_400), Some("1970-01-02 00:00:00".to_string()));
    }

    #[test]
    fn test_usage_lists_actions() {
        let reply = usage();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["success"], false);
        for action in ["update", "status", "check"] {
            assert!(reply.body["usage"][action].is_string());
        }
    }
}
