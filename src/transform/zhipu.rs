use async_trait::async_trait;
use serde_json::Value;

use super::canonical::MessagesRequest;
use super::openai::{translate_request, translate_response};
use super::{TransformOutput, Transformer};
use crate::errors::{Error, Result};

/// Canonical Messages ⇄ Zhipu GLM chat completions. GLM speaks the OpenAI
/// wire format with a few envelope differences: no `required` tool choice,
/// no nucleus+temperature combination, and a hard output-token ceiling.
pub struct ZhipuTransformer;

const GLM_MAX_OUTPUT_TOKENS: u64 = 8192;

#[async_trait]
impl Transformer for ZhipuTransformer {
	async fn transform_request(&self, body: Value, _options: Option<&Value>) -> Result<TransformOutput> {
		let req: MessagesRequest =
			serde_json::from_value(body).map_err(|e| Error::Transformer(e.to_string()))?;
		let mut chat = translate_request(req);
		if let Some(max_tokens) = chat.max_tokens {
			chat.max_tokens = Some(max_tokens.min(GLM_MAX_OUTPUT_TOKENS));
		}
		// GLM has no "required"; downgrade to auto
		if chat.tool_choice.as_ref().and_then(Value::as_str) == Some("required") {
			chat.tool_choice = Some(Value::String("auto".to_string()));
		}
		// GLM rejects temperature and top_p together; temperature wins
		if chat.temperature.is_some() {
			chat.top_p = None;
		}
		let out = serde_json::to_value(chat).map_err(|e| Error::Transformer(e.to_string()))?;
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
	async fn clamps_max_tokens_and_downgrades_tool_choice() {
		let body = json!({
			"model": "glm-4",
			"messages": [{"role": "user", "content": "hi"}],
			"max_tokens": 100000,
			"temperature": 0.5,
			"top_p": 0.9,
			"tools": [{"name": "f", "input_schema": {}}],
			"tool_choice": {"type": "any"}
		});
		let out = ZhipuTransformer.transform_request(body, None).await.unwrap().body;
		assert_eq!(out["max_tokens"], 8192);
		assert_eq!(out["tool_choice"], "auto");
		assert_eq!(out["temperature"], 0.5);
		assert!(out.get("top_p").is_none());
	}

	#[tokio::test]
	async fn response_is_openai_shaped() {
		let body = json!({
			"id": "glm-1",
			"model": "glm-4",
			"choices": [{"message": {"role": "assistant", "content": "你好"}, "finish_reason": "stop"}],
			"usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
		});
		let out = ZhipuTransformer.transform_response(body, None).await.unwrap();
		assert_eq!(out["content"][0]["text"], "你好");
		assert_eq!(out["stop_reason"], "end_turn");
	}
}
