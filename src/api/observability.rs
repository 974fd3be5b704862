use axum::Json;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use serde_json::{Value, json};

use super::{AppState, ok};
use crate::errors::{Error, Result};
use crate::metrics;

pub async fn metrics_json(State(state): State<AppState>) -> Json<Value> {
	ok(state.metrics.snapshot())
}

pub async fn metrics_all(State(state): State<AppState>) -> Json<Value> {
	ok(json!({
		"uptimeSeconds": state.metrics.uptime_seconds(),
		"metrics": state.metrics.snapshot(),
	}))
}

pub async fn metrics_reset(State(state): State<AppState>) -> Json<Value> {
	state.metrics.reset();
	ok(json!({"reset": true}))
}

/// Prometheus 0.0.4 text exposition.
pub async fn prometheus(State(state): State<AppState>) -> impl IntoResponse {
	state.refresh_channel_gauges();
	(
		[(header::CONTENT_TYPE, metrics::CONTENT_TYPE)],
		state.metrics.render(),
	)
}

pub async fn tracing_stats(State(state): State<AppState>) -> Json<Value> {
	ok(state.tracer.stats())
}

pub async fn get_trace(
	State(state): State<AppState>,
	Path(trace_id): Path<String>,
) -> Result<Json<Value>> {
	let spans = state.tracer.get_trace_spans(&trace_id);
	if spans.is_empty() {
		return Err(Error::NotFound(format!("trace {trace_id}")));
	}
	Ok(ok(spans))
}

pub async fn get_span(
	State(state): State<AppState>,
	Path(span_id): Path<String>,
) -> Result<Json<Value>> {
	state
		.tracer
		.get_span(&span_id)
		.map(ok)
		.ok_or_else(|| Error::NotFound(format!("span {span_id}")))
}

pub async fn tracing_clear(State(state): State<AppState>) -> Json<Value> {
	state.tracer.clear();
	ok(json!({"cleared": true}))
}
