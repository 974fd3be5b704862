pub mod anthropic;
pub mod azure;
pub mod canonical;
pub mod gemini;
pub mod openai;
mod util;
pub mod zhipu;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use serde_json::Value;
use tracing::warn;

use crate::errors::Result;
use crate::types::TransformerUse;

pub struct TransformOutput {
	pub body: Value,
	pub headers: HeaderMap,
}

impl TransformOutput {
	pub fn body(body: Value) -> Self {
		TransformOutput { body, headers: HeaderMap::new() }
	}
}

/// A named bidirectional schema converter. The request direction goes from
/// the canonical shape towards the provider dialect; the response direction
/// reverses it.
#[async_trait]
pub trait Transformer: Send + Sync {
	async fn transform_request(&self, body: Value, options: Option<&Value>)
	-> Result<TransformOutput>;
	async fn transform_response(&self, body: Value, options: Option<&Value>) -> Result<Value>;
}

/// Name → transformer table. New providers are new registrations.
pub struct TransformerRegistry {
	transformers: HashMap<String, Arc<dyn Transformer>>,
}

impl Default for TransformerRegistry {
	fn default() -> Self {
		Self::with_builtins()
	}
}

impl TransformerRegistry {
	pub fn new() -> Self {
		TransformerRegistry { transformers: HashMap::new() }
	}

	pub fn with_builtins() -> Self {
		let mut registry = Self::new();
		registry.register("anthropic", Arc::new(anthropic::AnthropicTransformer));
		registry.register("openai", Arc::new(openai::OpenAiTransformer));
		registry.register("azure-openai", Arc::new(azure::AzureOpenAiTransformer));
		registry.register("gemini", Arc::new(gemini::GeminiTransformer));
		registry.register("zhipu", Arc::new(zhipu::ZhipuTransformer));
		registry.register("maxtoken", Arc::new(util::MaxTokenTransformer));
		registry.register("sampling", Arc::new(util::SamplingTransformer));
		registry.register("cleancache", Arc::new(util::CleanCacheTransformer));
		registry
	}

	pub fn register(&mut self, name: &str, transformer: Arc<dyn Transformer>) {
		self.transformers.insert(name.to_string(), transformer);
	}

	pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
		self.transformers.get(name).cloned()
	}

	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.transformers.keys().cloned().collect();
		names.sort();
		names
	}

	/// Applies the chain left to right. Emitted headers merge with later
	/// transformers overriding earlier ones on conflict. Unknown names are
	/// skipped; a failing transformer leaves the body as it was.
	pub async fn apply_request(&self, chain: &[TransformerUse], body: Value) -> (Value, HeaderMap) {
		let mut body = body;
		let mut headers = HeaderMap::new();
		for entry in chain {
			let Some(transformer) = self.get(entry.name()) else {
				warn!(transformer = entry.name(), "unknown transformer, skipping");
				continue;
			};
			match transformer.transform_request(body.clone(), entry.options()).await {
				Ok(out) => {
					body = out.body;
					for (name, value) in out.headers.iter() {
						headers.insert(name.clone(), value.clone());
					}
				},
				Err(e) => {
					warn!(transformer = entry.name(), error = %e, "request transform failed, continuing");
				},
			}
		}
		(body, headers)
	}

	/// Applies the chain in reverse order for the response direction.
	pub async fn apply_response(&self, chain: &[TransformerUse], body: Value) -> Value {
		let mut body = body;
		for entry in chain.iter().rev() {
			let Some(transformer) = self.get(entry.name()) else {
				warn!(transformer = entry.name(), "unknown transformer, skipping");
				continue;
			};
			match transformer.transform_response(body.clone(), entry.options()).await {
				Ok(out) => body = out,
				Err(e) => {
					warn!(transformer = entry.name(), error = %e, "response transform failed, continuing");
				},
			}
		}
		body
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::errors::Error;
	use serde_json::json;

	struct Tagging(&'static str);

	#[async_trait]
	impl Transformer for Tagging {
		async fn transform_request(
			&self,
			mut body: Value,
			_options: Option<&Value>,
		) -> Result<TransformOutput> {
			let tags = body["tags"].as_array().cloned().unwrap_or_default();
			let mut tags = tags;
			tags.push(json!(self.0));
			body["tags"] = json!(tags);
			let mut headers = HeaderMap::new();
			headers.insert("x-tag", self.0.parse().unwrap());
			Ok(TransformOutput { body, headers })
		}

		async fn transform_response(&self, mut body: Value, _options: Option<&Value>) -> Result<Value> {
			let tags = body["untags"].as_array().cloned().unwrap_or_default();
			let mut tags = tags;
			tags.push(json!(self.0));
			body["untags"] = json!(tags);
			Ok(body)
		}
	}

	struct Failing;

	#[async_trait]
	impl Transformer for Failing {
		async fn transform_request(&self, _body: Value, _options: Option<&Value>) -> Result<TransformOutput> {
			Err(Error::Transformer("boom".into()))
		}

		async fn transform_response(&self, _body: Value, _options: Option<&Value>) -> Result<Value> {
			Err(Error::Transformer("boom".into()))
		}
	}

	fn chain(names: &[&str]) -> Vec<TransformerUse> {
		names.iter().map(|n| TransformerUse::Name(n.to_string())).collect()
	}

	#[tokio::test]
	async fn request_applies_left_to_right_and_response_reverses() {
		let mut registry = TransformerRegistry::new();
		registry.register("a", Arc::new(Tagging("a")));
		registry.register("b", Arc::new(Tagging("b")));
		let chain = chain(&["a", "b"]);

		let (body, headers) = registry.apply_request(&chain, json!({})).await;
		assert_eq!(body["tags"], json!(["a", "b"]));
		// later transformer wins the header conflict
		assert_eq!(headers.get("x-tag").unwrap(), "b");

		let body = registry.apply_response(&chain, json!({})).await;
		assert_eq!(body["untags"], json!(["b", "a"]));
	}

	#[tokio::test]
	async fn unknown_names_are_skipped() {
		let mut registry = TransformerRegistry::new();
		registry.register("a", Arc::new(Tagging("a")));
		let chain = chain(&["missing", "a"]);
		let (body, _) = registry.apply_request(&chain, json!({})).await;
		assert_eq!(body["tags"], json!(["a"]));
	}

	#[tokio::test]
	async fn failure_keeps_pre_transform_body() {
		let mut registry = TransformerRegistry::new();
		registry.register("a", Arc::new(Tagging("a")));
		registry.register("bad", Arc::new(Failing));
		let chain = chain(&["a", "bad"]);
		let (body, _) = registry.apply_request(&chain, json!({})).await;
		// the failing stage contributes nothing, the body survives
		assert_eq!(body["tags"], json!(["a"]));
	}

	#[test]
	fn builtins_registered() {
		let registry = TransformerRegistry::with_builtins();
		for name in ["anthropic", "openai", "azure-openai", "gemini", "zhipu", "maxtoken", "sampling", "cleancache"] {
			assert!(registry.get(name).is_some(), "missing builtin {name}");
		}
	}
}
