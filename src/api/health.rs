use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Value, json};

use super::{AppState, VERSION, ok};

pub async fn health(State(state): State<AppState>) -> Json<Value> {
	ok(json!({
		"status": "ok",
		"version": VERSION,
		"uptimeSeconds": state.started_at.elapsed().as_secs(),
	}))
}

pub async fn live() -> Json<Value> {
	ok(json!({"status": "live"}))
}

/// Ready only when at least one channel can take traffic.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
	let enabled = state.store.list_enabled_channels().map(|c| c.len()).unwrap_or(0);
	if enabled == 0 {
		return (
			StatusCode::SERVICE_UNAVAILABLE,
			Json(json!({
				"success": false,
				"error": {
					"type": "NO_AVAILABLE_CHANNEL",
					"code": "NO_AVAILABLE_CHANNEL",
					"message": "no enabled channels",
				}
			})),
		);
	}
	(StatusCode::OK, ok(json!({"status": "ready", "enabledChannels": enabled})))
}

pub async fn detailed(State(state): State<AppState>) -> Json<Value> {
	let mut issues: Vec<String> = Vec::new();
	let db_ok = match state.store.connectivity_check() {
		Ok(()) => true,
		Err(e) => {
			issues.push(format!("database: {e}"));
			false
		},
	};
	let channels = state.store.list_channels().unwrap_or_default();
	let enabled = channels.iter().filter(|c| c.is_enabled()).count();
	if enabled == 0 {
		issues.push("no enabled channels".to_string());
	}
	let open_breakers = state.breaker.open_channels();
	if !open_breakers.is_empty() {
		issues.push(format!("{} circuit breaker(s) open", open_breakers.len()));
	}

	let memory = read_memory();
	ok(json!({
		"status": if issues.is_empty() { "ok" } else { "degraded" },
		"uptimeSeconds": state.started_at.elapsed().as_secs(),
		"database": {"connected": db_ok},
		"channels": {"total": channels.len(), "enabled": enabled},
		"circuitBreakers": {"open": open_breakers},
		"pendingLogRows": state.store.pending_log_count(),
		"memory": memory,
		"issues": issues,
	}))
}

fn read_memory() -> Value {
	let mut out = serde_json::Map::new();
	if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
		for (field, key) in [("VmRSS:", "rssBytes"), ("VmSize:", "virtualBytes")] {
			if let Some(line) = status.lines().find(|l| l.starts_with(field)) {
				let kb: u64 = line
					.split_whitespace()
					.nth(1)
					.and_then(|v| v.parse().ok())
					.unwrap_or(0);
				out.insert(key.to_string(), json!(kb * 1024));
			}
		}
	}
	Value::Object(out)
}
