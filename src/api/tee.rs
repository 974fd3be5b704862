use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};

use super::{AppState, ok};
use crate::errors::{Error, Result};
use crate::types::{TeeDestinationInput, TeeDestinationUpdate};

fn refresh_engine(state: &AppState) -> Result<()> {
	state.tee.refresh(state.store.list_enabled_tee_destinations()?);
	Ok(())
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>> {
	Ok(ok(state.store.list_tee_destinations()?))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	Ok(ok(state.store.get_tee_destination(&id)?))
}

pub async fn create(
	State(state): State<AppState>,
	Json(input): Json<TeeDestinationInput>,
) -> Result<Json<Value>> {
	let tee = state.store.create_tee_destination(input)?;
	refresh_engine(&state)?;
	Ok(ok(tee))
}

pub async fn update(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(update): Json<TeeDestinationUpdate>,
) -> Result<Json<Value>> {
	let tee = state.store.update_tee_destination(&id, update)?;
	refresh_engine(&state)?;
	Ok(ok(tee))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	if !state.store.delete_tee_destination(&id)? {
		return Err(Error::NotFound(format!("tee destination {id}")));
	}
	refresh_engine(&state)?;
	Ok(ok(json!({"deleted": true})))
}
