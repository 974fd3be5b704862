use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{AppState, ok};
use crate::balance::Strategy;
use crate::errors::{Error, Result};

pub async fn get_strategy(State(state): State<AppState>) -> Json<Value> {
	ok(json!({"strategy": state.balancer.strategy().as_str()}))
}

#[derive(Debug, Deserialize)]
pub struct StrategyBody {
	strategy: String,
}

pub async fn put_strategy(
	State(state): State<AppState>,
	Json(body): Json<StrategyBody>,
) -> Result<Json<Value>> {
	let strategy: Strategy = body.strategy.parse()?;
	state.balancer.set_strategy(strategy);
	info!(strategy = strategy.as_str(), "load balance strategy changed");
	Ok(ok(json!({"strategy": strategy.as_str()})))
}

pub async fn get_locale(State(state): State<AppState>) -> Json<Value> {
	ok(json!({"locale": *state.locale.read()}))
}

#[derive(Debug, Deserialize)]
pub struct LocaleBody {
	locale: String,
}

pub async fn put_locale(
	State(state): State<AppState>,
	Json(body): Json<LocaleBody>,
) -> Result<Json<Value>> {
	if !matches!(body.locale.as_str(), "en" | "zh-CN") {
		return Err(Error::Validation(format!("unsupported locale {:?}", body.locale)));
	}
	*state.locale.write() = body.locale.clone();
	Ok(ok(json!({"locale": body.locale})))
}

/// The resolved runtime configuration; secrets are excluded by the config
/// type's serialization.
pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>> {
	let mut config = serde_json::to_value(&state.config)?;
	config["strategy"] = json!(state.balancer.strategy().as_str());
	config["locale"] = json!(*state.locale.read());
	Ok(ok(config))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigUpdateBody {
	strategy: Option<String>,
	locale: Option<String>,
}

/// Runtime-adjustable settings only; everything else requires a restart.
pub async fn put_config(
	State(state): State<AppState>,
	Json(body): Json<ConfigUpdateBody>,
) -> Result<Json<Value>> {
	if let Some(strategy) = body.strategy {
		let strategy: Strategy = strategy.parse()?;
		state.balancer.set_strategy(strategy);
	}
	if let Some(locale) = body.locale {
		if !matches!(locale.as_str(), "en" | "zh-CN") {
			return Err(Error::Validation(format!("unsupported locale {locale:?}")));
		}
		*state.locale.write() = locale;
	}
	get_config(State(state)).await
}

pub async fn get_log_level(State(state): State<AppState>) -> Json<Value> {
	ok(json!({"level": *state.log_level.read()}))
}

#[derive(Debug, Deserialize)]
pub struct LogLevelBody {
	level: String,
}

pub async fn put_log_level(
	State(state): State<AppState>,
	Json(body): Json<LogLevelBody>,
) -> Result<Json<Value>> {
	if !matches!(body.level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
		return Err(Error::Validation(format!("unknown log level {:?}", body.level)));
	}
	*state.log_level.write() = body.level.clone();
	info!(level = %body.level, "log level changed");
	Ok(ok(json!({"level": body.level})))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
	ok(state.store.cache().stats())
}

pub async fn warmer_stats(State(state): State<AppState>) -> Json<Value> {
	ok(state.warmer.stats())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CacheQuery {
	#[serde(rename = "type")]
	kind: Option<String>,
}

pub async fn cache_invalidate(
	State(state): State<AppState>,
	axum::extract::Query(query): axum::extract::Query<CacheQuery>,
) -> Json<Value> {
	state.warmer.invalidate(query.kind.as_deref());
	ok(json!({"invalidated": true}))
}

pub async fn cache_warm(
	State(state): State<AppState>,
	axum::extract::Query(query): axum::extract::Query<CacheQuery>,
) -> Result<Json<Value>> {
	let stats = state.warmer.invalidate_and_warm(query.kind.as_deref())?;
	Ok(ok(stats))
}
