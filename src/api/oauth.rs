use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{AppState, ok};
use crate::errors::{Error, Result};
use crate::types::new_id;

pub async fn providers(State(state): State<AppState>) -> Json<Value> {
	ok(state.oauth.provider_names())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeUrlBody {
	provider: String,
	redirect_uri: String,
	scopes: Option<Vec<String>>,
	state: Option<String>,
}

pub async fn authorize_url(
	State(state): State<AppState>,
	Json(body): Json<AuthorizeUrlBody>,
) -> Result<Json<Value>> {
	let oauth_state = body.state.unwrap_or_else(new_id);
	let url = state.oauth.build_authorization_url(
		&body.provider,
		&body.redirect_uri,
		body.scopes,
		&oauth_state,
	)?;
	Ok(ok(json!({"url": url, "state": oauth_state})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeBody {
	provider: String,
	code: String,
	redirect_uri: String,
	channel_id: Option<String>,
}

pub async fn exchange(
	State(state): State<AppState>,
	Json(body): Json<ExchangeBody>,
) -> Result<Json<Value>> {
	let session = state
		.oauth
		.exchange_code(&body.provider, &body.code, &body.redirect_uri, body.channel_id)
		.await?;
	Ok(ok(session))
}

pub async fn sessions(State(state): State<AppState>) -> Result<Json<Value>> {
	// access tokens stay server-side; the listing carries metadata only
	let sessions: Vec<Value> = state
		.oauth
		.list_sessions()?
		.into_iter()
		.map(|s| {
			json!({
				"id": s.id,
				"provider": s.provider,
				"channelId": s.channel_id,
				"expiresAt": s.expires_at,
				"scopes": s.scopes,
				"createdAt": s.created_at,
				"updatedAt": s.updated_at,
			})
		})
		.collect();
	Ok(ok(sessions))
}

pub async fn refresh(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	let session = state.oauth.refresh(&id).await?;
	Ok(ok(json!({"id": session.id, "expiresAt": session.expires_at})))
}

pub async fn revoke(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
	if !state.oauth.revoke(&id)? {
		return Err(Error::NotFound(format!("oauth session {id}")));
	}
	Ok(ok(json!({"revoked": true})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkBody {
	channel_id: Option<String>,
}

pub async fn link(
	State(state): State<AppState>,
	Path(id): Path<String>,
	Json(body): Json<LinkBody>,
) -> Result<Json<Value>> {
	let session = state.oauth.link_to_channel(&id, body.channel_id)?;
	Ok(ok(json!({"id": session.id, "channelId": session.channel_id})))
}
