use axum::Json;
use axum::extract::{Query, State};
use serde_json::{Value, json};

use super::AppState;
use crate::errors::Result;
use crate::store::{RequestQuery, estimated_cost};
use crate::types::now_ms;

/// Filtered request-log page. Each row is augmented with its computed cost;
/// `meta` reports the effective (clamped) bounds.
pub async fn list(
	State(state): State<AppState>,
	Query(query): Query<RequestQuery>,
) -> Result<Json<Value>> {
	let (rows, total, limit, offset) = state.store.get_requests_filtered(&query)?;
	let data: Vec<Value> = rows
		.into_iter()
		.map(|row| {
			let cost = estimated_cost(row.input_tokens, row.output_tokens, row.cached_tokens);
			let mut value = serde_json::to_value(row).unwrap_or(Value::Null);
			value["cost"] = json!(cost);
			value
		})
		.collect();
	Ok(Json(json!({
		"success": true,
		"data": data,
		"meta": {
			"total": total,
			"limit": limit,
			"offset": offset,
			"timestamp": now_ms(),
		}
	})))
}

pub async fn analytics(State(state): State<AppState>) -> Result<Json<Value>> {
	Ok(super::ok(state.store.get_analytics()?))
}
