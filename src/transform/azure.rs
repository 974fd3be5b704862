use async_trait::async_trait;
use serde_json::Value;

use super::canonical::MessagesRequest;
use super::openai::{translate_request, translate_response};
use super::{TransformOutput, Transformer};
use crate::errors::{Error, Result};

/// Canonical Messages ⇄ Azure OpenAI. The body is plain OpenAI; Azure's
/// differences (the `api-key` header, deployment path and `api-version`
/// query) live in the provider adapter. The deployment routes the model, so
/// the body's `model` field is dropped when options name a deployment.
pub struct AzureOpenAiTransformer;

#[async_trait]
impl Transformer for AzureOpenAiTransformer {
	async fn transform_request(&self, body: Value, options: Option<&Value>) -> Result<TransformOutput> {
		let req: MessagesRequest =
			serde_json::from_value(body).map_err(|e| Error::Transformer(e.to_string()))?;
		let chat = translate_request(req);
		let mut out = serde_json::to_value(chat).map_err(|e| Error::Transformer(e.to_string()))?;
		let deployment_routed = options
			.and_then(|o| o.get("deployment"))
			.and_then(Value::as_str)
			.is_some();
		if deployment_routed {
			if let Some(obj) = out.as_object_mut() {
				obj.remove("model");
			}
		}
		Ok(TransformOutput::body(out))
	}

	async fn transform_response(&self, body: Value, _options: Option<&Value>) -> Result<Value> {
		let resp: super::openai::types::ChatResponse =
			serde_json::from_value(body).map_err(|e| Error::Transformer(e.to_string()))?;
		serde_json::to_value(translate_response(resp)).map_err(|e| Error::Transformer(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn deployment_option_drops_model_field() {
		let body = json!({
			"model": "claude-sonnet-4",
			"messages": [{"role": "user", "content": "hi"}],
			"max_tokens": 64
		});
		let opts = json!({"deployment": "gpt4-prod"});
		let out = AzureOpenAiTransformer
			.transform_request(body.clone(), Some(&opts))
			.await
			.unwrap()
			.body;
		assert!(out.get("model").is_none());

		let out = AzureOpenAiTransformer.transform_request(body, None).await.unwrap().body;
		assert_eq!(out["model"], "claude-sonnet-4");
	}
}
