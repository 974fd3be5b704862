use http::{HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::errors::{Error, Result};
use crate::types::{Channel, ChannelType};

pub const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
pub const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com";
pub const GEMINI_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";
pub const ZHIPU_DEFAULT_BASE: &str = "https://open.bigmodel.cn";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const AZURE_API_VERSION: &str = "2024-06-01";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
	pub input: i64,
	pub output: i64,
	pub cached: i64,
}

/// Per-channel-type adapter: upstream URL, auth headers, usage extraction and
/// the minimal ping used by channel tests.
pub struct ProviderAdapter;

impl ProviderAdapter {
	fn base(channel: &Channel, default: &str) -> String {
		channel
			.base_url
			.as_deref()
			.unwrap_or(default)
			.trim_end_matches('/')
			.to_string()
	}

	/// The upstream URL for a chat/messages request.
	pub fn build_url(channel: &Channel, model: &str, inbound_path: &str) -> Result<String> {
		match channel.channel_type {
			ChannelType::Anthropic => {
				Ok(format!("{}/v1/messages", Self::base(channel, ANTHROPIC_DEFAULT_BASE)))
			},
			ChannelType::Openai => Ok(format!(
				"{}/v1/chat/completions",
				Self::base(channel, OPENAI_DEFAULT_BASE)
			)),
			ChannelType::Zhipu => Ok(format!(
				"{}/api/paas/v4/chat/completions",
				Self::base(channel, ZHIPU_DEFAULT_BASE)
			)),
			ChannelType::Gemini => Ok(format!(
				"{}/v1beta/models/{model}:generateContent",
				Self::base(channel, GEMINI_DEFAULT_BASE)
			)),
			ChannelType::Azure => {
				let base = channel.base_url.as_deref().ok_or_else(|| {
					Error::Configuration(format!("azure channel {} requires baseUrl", channel.name))
				})?;
				let base = base.trim_end_matches('/');
				if base.contains("/deployments/") {
					Ok(format!("{base}/chat/completions?api-version={AZURE_API_VERSION}"))
				} else {
					Ok(format!(
						"{base}/openai/deployments/{model}/chat/completions?api-version={AZURE_API_VERSION}"
					))
				}
			},
			ChannelType::Custom => {
				let base = channel.base_url.as_deref().ok_or_else(|| {
					Error::Configuration(format!("custom channel {} requires baseUrl", channel.name))
				})?;
				Ok(format!("{}{}", base.trim_end_matches('/'), inbound_path))
			},
		}
	}

	/// Auth and content headers for the channel's provider.
	pub fn headers(channel: &Channel) -> Result<HeaderMap> {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		let key = channel.api_key.as_deref().unwrap_or_default();
		let bearer = |key: &str| -> Result<HeaderValue> {
			HeaderValue::from_str(&format!("Bearer {key}"))
				.map_err(|_| Error::Configuration("api key contains invalid characters".into()))
		};
		let plain = |key: &str| -> Result<HeaderValue> {
			HeaderValue::from_str(key)
				.map_err(|_| Error::Configuration("api key contains invalid characters".into()))
		};
		match channel.channel_type {
			ChannelType::Anthropic => {
				if !key.is_empty() {
					headers.insert("x-api-key", plain(key)?);
				}
				headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
			},
			ChannelType::Openai | ChannelType::Zhipu | ChannelType::Custom => {
				if !key.is_empty() {
					headers.insert(http::header::AUTHORIZATION, bearer(key)?);
				}
			},
			ChannelType::Azure => {
				if !key.is_empty() {
					headers.insert("api-key", plain(key)?);
				}
			},
			ChannelType::Gemini => {
				if !key.is_empty() {
					headers.insert("x-goog-api-key", plain(key)?);
				}
			},
		}
		Ok(headers)
	}

	/// Token usage out of a response body. The transformed (canonical) shape
	/// is tried first, then the provider's native shape, so extraction works
	/// with or without a transformer chain on the channel.
	pub fn extract_usage(body: &Value) -> TokenUsage {
		// canonical / anthropic
		if let Some(usage) = body.get("usage") {
			if let Some(input) = usage.get("input_tokens").and_then(Value::as_i64) {
				return TokenUsage {
					input,
					output: usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
					cached: usage
						.get("cache_read_input_tokens")
						.and_then(Value::as_i64)
						.unwrap_or(0),
				};
			}
			// openai
			if let Some(prompt) = usage.get("prompt_tokens").and_then(Value::as_i64) {
				return TokenUsage {
					input: prompt,
					output: usage.get("completion_tokens").and_then(Value::as_i64).unwrap_or(0),
					cached: usage
						.pointer("/prompt_tokens_details/cached_tokens")
						.and_then(Value::as_i64)
						.unwrap_or(0),
				};
			}
		}
		// gemini
		if let Some(meta) = body.get("usageMetadata") {
			return TokenUsage {
				input: meta.get("promptTokenCount").and_then(Value::as_i64).unwrap_or(0),
				output: meta.get("candidatesTokenCount").and_then(Value::as_i64).unwrap_or(0),
				cached: meta.get("cachedContentTokenCount").and_then(Value::as_i64).unwrap_or(0),
			};
		}
		TokenUsage::default()
	}

	/// Minimal provider-specific request used by the channel test endpoints.
	pub fn ping_body(channel: &Channel) -> Value {
		let model = channel.models.first().cloned().unwrap_or_default();
		match channel.channel_type {
			ChannelType::Anthropic => json!({
				"model": model,
				"max_tokens": 1,
				"messages": [{"role": "user", "content": "ping"}],
			}),
			ChannelType::Gemini => json!({
				"contents": [{"role": "user", "parts": [{"text": "ping"}]}],
				"generationConfig": {"maxOutputTokens": 1},
			}),
			_ => json!({
				"model": model,
				"max_tokens": 1,
				"messages": [{"role": "user", "content": "ping"}],
			}),
		}
	}
}
