use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{AppState, ok};
use crate::errors::{Error, Result};
use crate::store::ChannelExport;
use crate::types::{Channel, ChannelInput, ChannelUpdate};

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>> {
	let channels = state.store.list_channels()?;
	state.refresh_channel_gauges();
	Ok(ok(channels))
}

pub async fn create(
	State(state): State<AppState>,
	Json(input): Json<ChannelInput>,
) -> Result<Json<Value>> {
	let channel = state.store.create_channel(input)?;
	state.refresh_channel_gauges();
	Ok(ok(channel))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	Ok(ok(state.store.get_channel(&id)?))
}

pub async fn update(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(update): Json<ChannelUpdate>,
) -> Result<Json<Value>> {
	let channel = state.store.update_channel(&id, update)?;
	state.refresh_channel_gauges();
	Ok(ok(channel))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	let deleted = state.store.delete_channel(&id)?;
	if !deleted {
		return Err(Error::NotFound(format!("channel {id}")));
	}
	state.refresh_channel_gauges();
	Ok(ok(json!({"deleted": true})))
}

pub async fn test_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	let channel = state.store.get_channel(&id)?;
	Ok(ok(state.engine.test_channel(&channel).await))
}

async fn test_channels(state: &AppState, channels: Vec<Channel>) -> Json<Value> {
	let mut results = Vec::with_capacity(channels.len());
	for channel in &channels {
		results.push(state.engine.test_channel(channel).await);
	}
	ok(results)
}

pub async fn test_all(State(state): State<AppState>) -> Result<Json<Value>> {
	let channels = state.store.list_channels()?;
	Ok(test_channels(&state, channels).await)
}

pub async fn test_enabled(State(state): State<AppState>) -> Result<Json<Value>> {
	let channels = state.store.list_enabled_channels()?;
	Ok(test_channels(&state, channels).await)
}

pub async fn export(State(state): State<AppState>) -> Result<Json<Value>> {
	Ok(ok(state.store.export_channels()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportQuery {
	#[serde(default)]
	replace_existing: bool,
}

pub async fn import(
	State(state): State<AppState>,
	Query(query): Query<ImportQuery>,
	Json(envelope): Json<ChannelExport>,
) -> Result<Json<Value>> {
	let imported = state.store.import_channels(envelope, query.replace_existing)?;
	state.refresh_channel_gauges();
	Ok(ok(json!({"imported": imported})))
}
