//! Utility transformers applied as extra pipeline stages: token clamping,
//! sampling normalization and cache-control stripping.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{TransformOutput, Transformer};
use crate::errors::Result;

/// Clamps `max_tokens` to a ceiling and fills it when absent.
pub struct MaxTokenTransformer;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MaxTokenOptions {
	max_tokens: u64,
	default: u64,
}

impl Default for MaxTokenOptions {
	fn default() -> Self {
		MaxTokenOptions { max_tokens: 8192, default: 4096 }
	}
}

#[async_trait]
impl Transformer for MaxTokenTransformer {
	async fn transform_request(&self, mut body: Value, options: Option<&Value>) -> Result<TransformOutput> {
		let opts: MaxTokenOptions = options
			.cloned()
			.map(serde_json::from_value)
			.transpose()
			.unwrap_or_default()
			.unwrap_or_default();
		let current = body.get("max_tokens").and_then(Value::as_u64);
		let clamped = current.unwrap_or(opts.default).min(opts.max_tokens);
		body["max_tokens"] = Value::from(clamped);
		Ok(TransformOutput::body(body))
	}

	async fn transform_response(&self, body: Value, _options: Option<&Value>) -> Result<Value> {
		Ok(body)
	}
}

/// Normalizes sampling parameters: temperature clamped into range, and when
/// both temperature and top_p are set, top_p is dropped.
pub struct SamplingTransformer;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SamplingOptions {
	min_temperature: f64,
	max_temperature: f64,
}

impl Default for SamplingOptions {
	fn default() -> Self {
		SamplingOptions { min_temperature: 0.0, max_temperature: 1.0 }
	}
}

#[async_trait]
impl Transformer for SamplingTransformer {
	async fn transform_request(&self, mut body: Value, options: Option<&Value>) -> Result<TransformOutput> {
		let opts: SamplingOptions = options
			.cloned()
			.map(serde_json::from_value)
			.transpose()
			.unwrap_or_default()
			.unwrap_or_default();
		let temperature = body.get("temperature").and_then(Value::as_f64);
		if let Some(t) = temperature {
			body["temperature"] = Value::from(t.clamp(opts.min_temperature, opts.max_temperature));
			if body.get("top_p").is_some() {
				body.as_object_mut().map(|o| o.remove("top_p"));
			}
		} else if let Some(p) = body.get("top_p").and_then(Value::as_f64) {
			body["top_p"] = Value::from(p.clamp(0.0, 1.0));
		}
		Ok(TransformOutput::body(body))
	}

	async fn transform_response(&self, body: Value, _options: Option<&Value>) -> Result<Value> {
		Ok(body)
	}
}

/// Strips ephemeral `cache_control` markers from the system prompt and
/// message content blocks.
pub struct CleanCacheTransformer;

fn strip_cache_control(value: &mut Value) {
	match value {
		Value::Object(map) => {
			map.remove("cache_control");
			for v in map.values_mut() {
				strip_cache_control(v);
			}
		},
		Value::Array(items) => {
			for v in items {
				strip_cache_control(v);
			}
		},
		_ => {},
	}
}

#[async_trait]
impl Transformer for CleanCacheTransformer {
	async fn transform_request(&self, mut body: Value, _options: Option<&Value>) -> Result<TransformOutput> {
		if let Some(system) = body.get_mut("system") {
			strip_cache_control(system);
		}
		if let Some(messages) = body.get_mut("messages") {
			strip_cache_control(messages);
		}
		Ok(TransformOutput::body(body))
	}

	async fn transform_response(&self, body: Value, _options: Option<&Value>) -> Result<Value> {
		Ok(body)
	}
}
