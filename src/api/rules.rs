use axum::Json;
use axum::extract::{Path, State};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{AppState, ok};
use crate::errors::{Error, Result};
use crate::route::RouteInput;
use crate::types::{RoutingRuleInput, RoutingRuleUpdate, RuleCondition};

fn reload_router(state: &AppState) -> Result<()> {
	state.router.reload(state.store.list_enabled_routing_rules()?);
	Ok(())
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>> {
	Ok(ok(state.store.list_routing_rules()?))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	Ok(ok(state.store.get_routing_rule(&id)?))
}

pub async fn create(
	State(state): State<AppState>,
	Json(input): Json<RoutingRuleInput>,
) -> Result<Json<Value>> {
	let rule = state.store.create_routing_rule(input)?;
	reload_router(&state)?;
	Ok(ok(rule))
}

pub async fn update(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(update): Json<RoutingRuleUpdate>,
) -> Result<Json<Value>> {
	let rule = state.store.update_routing_rule(&id, update)?;
	reload_router(&state)?;
	Ok(ok(rule))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	if !state.store.delete_routing_rule(&id)? {
		return Err(Error::NotFound(format!("routing rule {id}")));
	}
	reload_router(&state)?;
	Ok(ok(json!({"deleted": true})))
}

async fn set_enabled(state: AppState, id: String, enabled: bool) -> Result<Json<Value>> {
	let rule = state.store.update_routing_rule(
		&id,
		RoutingRuleUpdate { enabled: Some(enabled), ..Default::default() },
	)?;
	reload_router(&state)?;
	Ok(ok(rule))
}

pub async fn enable(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	set_enabled(state, id, true).await
}

pub async fn disable(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	set_enabled(state, id, false).await
}

pub async fn reload(State(state): State<AppState>) -> Result<Json<Value>> {
	reload_router(&state)?;
	Ok(ok(json!({"rules": state.router.rule_count()})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTestBody {
	condition: RuleCondition,
	/// A sample request body in the canonical shape.
	request: Value,
}

/// Dry-runs a condition against a sample request without touching the rule
/// set.
pub async fn test(
	State(state): State<AppState>,
	Json(body): Json<RuleTestBody>,
) -> Result<Json<Value>> {
	if body.condition.is_empty() {
		return Err(Error::Validation("condition must set at least one field".into()));
	}
	let raw = Bytes::from(serde_json::to_vec(&body.request)?);
	let parsed = crate::proxy::parse_request("POST", "/v1/messages", &Default::default(), raw);
	let input = RouteInput::new(
		parsed.model.clone(),
		parsed.body.and_then(|b| serde_json::from_value(b).ok()),
	);
	let matched = state.router.matches(&body.condition, &input);
	Ok(ok(json!({
		"matched": matched,
		"model": parsed.model,
		"analysis": input.analysis.map(|a| json!({
			"category": a.category,
			"complexity": a.complexity,
			"hasCode": a.has_code,
			"language": a.language,
			"intent": a.intent,
			"wordCount": a.word_count,
		})),
	})))
}
