use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::errors::{Error, Result};
use crate::store::Store;
use crate::types::{OAuthSession, OAuthSessionInput, now_ms};

/// Endpoint configuration for one OAuth provider; registered at startup or
/// through the admin API.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProviderConfig {
	pub authorize_url: String,
	pub token_url: String,
	pub client_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client_secret: Option<String>,
	#[serde(default)]
	pub default_scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	expires_in: Option<i64>,
	#[serde(default)]
	scope: Option<String>,
}

/// Session manager over the store's oauth rows: authorization-URL build,
/// code exchange, token refresh, revocation and channel linking. The
/// browser-facing redirect flow itself lives outside the proxy.
pub struct OAuthManager {
	store: Arc<Store>,
	client: reqwest::Client,
	providers: RwLock<HashMap<String, OAuthProviderConfig>>,
}

impl OAuthManager {
	pub fn new(store: Arc<Store>) -> Self {
		OAuthManager {
			store,
			client: reqwest::Client::new(),
			providers: RwLock::new(HashMap::new()),
		}
	}

	pub fn register_provider(&self, name: &str, config: OAuthProviderConfig) {
		self.providers.write().insert(name.to_string(), config);
	}

	pub fn provider(&self, name: &str) -> Result<OAuthProviderConfig> {
		self
			.providers
			.read()
			.get(name)
			.cloned()
			.ok_or_else(|| Error::NotFound(format!("oauth provider {name}")))
	}

	pub fn provider_names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
		names.sort();
		names
	}

	pub fn build_authorization_url(
		&self,
		provider: &str,
		redirect_uri: &str,
		scopes: Option<Vec<String>>,
		state: &str,
	) -> Result<String> {
		let config = self.provider(provider)?;
		let scopes = scopes.unwrap_or(config.default_scopes.clone());
		let mut url = Url::parse(&config.authorize_url)
			.map_err(|e| Error::Configuration(format!("authorize url: {e}")))?;
		url
			.query_pairs_mut()
			.append_pair("response_type", "code")
			.append_pair("client_id", &config.client_id)
			.append_pair("redirect_uri", redirect_uri)
			.append_pair("scope", &scopes.join(" "))
			.append_pair("state", state);
		Ok(url.into())
	}

	/// Exchanges an authorization code for tokens and persists the session.
	pub async fn exchange_code(
		&self,
		provider: &str,
		code: &str,
		redirect_uri: &str,
		channel_id: Option<String>,
	) -> Result<OAuthSession> {
		let config = self.provider(provider)?;
		let mut form = vec![
			("grant_type", "authorization_code".to_string()),
			("code", code.to_string()),
			("redirect_uri", redirect_uri.to_string()),
			("client_id", config.client_id.clone()),
		];
		if let Some(secret) = &config.client_secret {
			form.push(("client_secret", secret.clone()));
		}
		let token: TokenResponse = self
			.client
			.post(&config.token_url)
			.form(&form)
			.send()
			.await?
			.error_for_status()
			.map_err(|e| Error::Authentication(format!("code exchange failed: {e}")))?
			.json()
			.await?;

		let scopes = token
			.scope
			.map(|s| s.split_whitespace().map(str::to_string).collect())
			.unwrap_or(config.default_scopes);
		let session = self.store.create_oauth_session(OAuthSessionInput {
			channel_id,
			provider: provider.to_string(),
			access_token: token.access_token,
			refresh_token: token.refresh_token,
			expires_at: now_ms() + token.expires_in.unwrap_or(3600) * 1000,
			scopes,
			user_info: None,
		})?;
		info!(provider, session = %session.id, "oauth session created");
		Ok(session)
	}

	/// Refreshes the session's tokens; the stored expiry never moves
	/// backwards.
	pub async fn refresh(&self, session_id: &str) -> Result<OAuthSession> {
		let session = self.store.get_oauth_session(session_id)?;
		let refresh_token = session
			.refresh_token
			.clone()
			.ok_or_else(|| Error::Validation("session has no refresh token".into()))?;
		let config = self.provider(&session.provider)?;
		let mut form = vec![
			("grant_type", "refresh_token".to_string()),
			("refresh_token", refresh_token),
			("client_id", config.client_id.clone()),
		];
		if let Some(secret) = &config.client_secret {
			form.push(("client_secret", secret.clone()));
		}
		let token: TokenResponse = self
			.client
			.post(&config.token_url)
			.form(&form)
			.send()
			.await?
			.error_for_status()
			.map_err(|e| Error::Authentication(format!("refresh failed: {e}")))?
			.json()
			.await?;
		self.store.update_oauth_tokens(
			session_id,
			token.access_token,
			token.refresh_token,
			now_ms() + token.expires_in.unwrap_or(3600) * 1000,
		)
	}

	pub fn revoke(&self, session_id: &str) -> Result<bool> {
		self.store.delete_oauth_session(session_id)
	}

	pub fn link_to_channel(&self, session_id: &str, channel_id: Option<String>) -> Result<OAuthSession> {
		if let Some(id) = &channel_id {
			// the channel must exist before linking
			self.store.get_channel(id)?;
		}
		self.store.link_oauth_session(session_id, channel_id)
	}

	pub fn list_sessions(&self) -> Result<Vec<OAuthSession>> {
		self.store.list_oauth_sessions()
	}
}
