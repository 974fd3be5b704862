use async_trait::async_trait;
use http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;

use super::canonical::SystemPrompt;
use super::{TransformOutput, Transformer};
use crate::errors::Result;

/// Identity transformer: the canonical shape IS the Anthropic dialect.
///
/// Some Anthropic-compatible gateways only accept requests carrying a fixed
/// system-prompt prefix or a specific user agent. Those strings are
/// configuration data on the channel's transformer options, never engine
/// behavior:
///
/// ```json
/// ["anthropic", {"systemPrefix": "...", "userAgent": "..."}]
/// ```
pub struct AnthropicTransformer;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Options {
	system_prefix: Option<String>,
	user_agent: Option<String>,
}

#[async_trait]
impl Transformer for AnthropicTransformer {
	async fn transform_request(&self, mut body: Value, options: Option<&Value>) -> Result<TransformOutput> {
		let opts: Options = options
			.cloned()
			.map(serde_json::from_value)
			.transpose()
			.unwrap_or_default()
			.unwrap_or_default();

		if let Some(prefix) = &opts.system_prefix {
			let existing: Option<SystemPrompt> =
				body.get("system").cloned().and_then(|s| serde_json::from_value(s).ok());
			let system = match existing {
				Some(existing) => {
					let text = existing.as_text();
					if text.starts_with(prefix.as_str()) {
						text
					} else {
						format!("{prefix}\n{text}")
					}
				},
				None => prefix.clone(),
			};
			body["system"] = Value::String(system);
		}

		let mut headers = HeaderMap::new();
		if let Some(user_agent) = &opts.user_agent {
			if let Ok(value) = user_agent.parse() {
				headers.insert(http::header::USER_AGENT, value);
			}
		}
		Ok(TransformOutput { body, headers })
	}

	async fn transform_response(&self, body: Value, _options: Option<&Value>) -> Result<Value> {
		Ok(body)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn identity_without_options() {
		let body = json!({"model": "claude-sonnet-4", "messages": [], "max_tokens": 1});
		let out = AnthropicTransformer.transform_request(body.clone(), None).await.unwrap();
		assert_eq!(out.body, body);
		assert!(out.headers.is_empty());
		let resp = json!({"id": "m1", "content": []});
		assert_eq!(
			AnthropicTransformer.transform_response(resp.clone(), None).await.unwrap(),
			resp
		);
	}

	#[tokio::test]
	async fn system_prefix_injected_once() {
		let opts = json!({"systemPrefix": "You are Claude Code."});
		let body = json!({"model": "m", "messages": [], "max_tokens": 1, "system": "Be helpful."});
		let out = AnthropicTransformer
			.transform_request(body, Some(&opts))
			.await
			.unwrap()
			.body;
		assert_eq!(out["system"], "You are Claude Code.\nBe helpful.");

		// already-prefixed requests pass through unchanged
		let out2 = AnthropicTransformer
			.transform_request(out.clone(), Some(&opts))
			.await
			.unwrap()
			.body;
		assert_eq!(out2["system"], out["system"]);
	}

	#[tokio::test]
	async fn system_prefix_fills_missing_system() {
		let opts = json!({"systemPrefix": "Prefix only."});
		let body = json!({"model": "m", "messages": [], "max_tokens": 1});
		let out = AnthropicTransformer.transform_request(body, Some(&opts)).await.unwrap().body;
		assert_eq!(out["system"], "Prefix only.");
	}

	#[tokio::test]
	async fn user_agent_header_emitted() {
		let opts = json!({"userAgent": "claude-cli/1.0"});
		let body = json!({"model": "m", "messages": [], "max_tokens": 1});
		let out = AnthropicTransformer.transform_request(body, Some(&opts)).await.unwrap();
		assert_eq!(out.headers.get("user-agent").unwrap(), "claude-cli/1.0");
	}
}
