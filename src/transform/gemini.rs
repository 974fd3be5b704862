use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::canonical::{
	ContentBlock, MessageContent, MessagesRequest, MessagesResponse, Usage,
};
use super::{TransformOutput, Transformer};
use crate::errors::{Error, Result};
use crate::types::new_id;

/// Canonical Messages ⇄ Gemini generateContent. Same shape of mapping as the
/// OpenAI transformer with Gemini's envelope: `contents`/`parts`,
/// `systemInstruction`, `generationConfig` and function declarations.
pub struct GeminiTransformer;

#[async_trait]
impl Transformer for GeminiTransformer {
	async fn transform_request(&self, body: Value, _options: Option<&Value>) -> Result<TransformOutput> {
		let req: MessagesRequest =
			serde_json::from_value(body).map_err(|e| Error::Transformer(e.to_string()))?;
		Ok(TransformOutput::body(translate_request(req)))
	}

	async fn transform_response(&self, body: Value, _options: Option<&Value>) -> Result<Value> {
		serde_json::to_value(translate_response(&body)).map_err(|e| Error::Transformer(e.to_string()))
	}
}

fn block_to_part(block: &ContentBlock) -> Option<Value> {
	match block {
		ContentBlock::Text { text } => Some(json!({"text": text})),
		ContentBlock::Image { source } => Some(json!({
			"inline_data": {
				"mime_type": source.media_type.as_deref().unwrap_or("image/jpeg"),
				"data": source.data.as_deref().unwrap_or_default(),
			}
		})),
		ContentBlock::ToolUse { name, input, .. } => {
			Some(json!({"functionCall": {"name": name, "args": input}}))
		},
		ContentBlock::ToolResult { tool_use_id, content, .. } => Some(json!({
			"functionResponse": {
				"name": tool_use_id,
				"response": {"result": content.clone().unwrap_or(Value::Null)},
			}
		})),
	}
}

fn translate_request(req: MessagesRequest) -> Value {
	let contents: Vec<Value> = req
		.messages
		.iter()
		.map(|msg| {
			// Gemini calls the assistant role "model"
			let role = if msg.role == "assistant" { "model" } else { "user" };
			let parts: Vec<Value> = match &msg.content {
				MessageContent::Text(text) => vec![json!({"text": text})],
				MessageContent::Blocks(blocks) => blocks.iter().filter_map(block_to_part).collect(),
			};
			json!({"role": role, "parts": parts})
		})
		.collect();

	let mut generation_config = Map::new();
	if let Some(max_tokens) = req.max_tokens {
		generation_config.insert("maxOutputTokens".into(), json!(max_tokens));
	}
	if let Some(temperature) = req.temperature {
		generation_config.insert("temperature".into(), json!(temperature));
	}
	if let Some(top_p) = req.top_p {
		generation_config.insert("topP".into(), json!(top_p));
	}
	if let Some(top_k) = req.top_k {
		generation_config.insert("topK".into(), json!(top_k));
	}
	if let Some(stop) = &req.stop_sequences {
		if !stop.is_empty() {
			generation_config.insert("stopSequences".into(), json!(stop));
		}
	}

	let mut out = Map::new();
	out.insert("contents".into(), json!(contents));
	if let Some(system) = &req.system {
		out.insert(
			"systemInstruction".into(),
			json!({"parts": [{"text": system.as_text()}]}),
		);
	}
	if !generation_config.is_empty() {
		out.insert("generationConfig".into(), Value::Object(generation_config));
	}
	if let Some(tools) = &req.tools {
		let declarations: Vec<Value> = tools
			.iter()
			.map(|t| {
				json!({
					"name": t.name,
					"description": t.description.clone().unwrap_or_default(),
					"parameters": t.input_schema,
				})
			})
			.collect();
		out.insert("tools".into(), json!([{"functionDeclarations": declarations}]));
	}
	Value::Object(out)
}

fn map_finish_reason(reason: &str) -> String {
	match reason {
		"STOP" => "end_turn",
		"MAX_TOKENS" => "max_tokens",
		"SAFETY" | "RECITATION" => "stop_sequence",
		other => other,
	}
	.to_string()
}

fn translate_response(body: &Value) -> MessagesResponse {
	let mut content = Vec::new();
	let mut stop_reason = None;
	if let Some(candidate) = body.pointer("/candidates/0") {
		for part in candidate
			.pointer("/content/parts")
			.and_then(Value::as_array)
			.into_iter()
			.flatten()
		{
			if let Some(text) = part.get("text").and_then(Value::as_str) {
				content.push(ContentBlock::Text { text: text.to_string() });
			} else if let Some(call) = part.get("functionCall") {
				content.push(ContentBlock::ToolUse {
					id: format!("toolu_{}", new_id()),
					name: call
						.get("name")
						.and_then(Value::as_str)
						.unwrap_or_default()
						.to_string(),
					input: call.get("args").cloned().unwrap_or(Value::Null),
				});
			}
		}
		stop_reason = candidate
			.get("finishReason")
			.and_then(Value::as_str)
			.map(map_finish_reason);
	}

	let usage = Usage {
		input_tokens: body
			.pointer("/usageMetadata/promptTokenCount")
			.and_then(Value::as_i64)
			.unwrap_or(0),
		output_tokens: body
			.pointer("/usageMetadata/candidatesTokenCount")
			.and_then(Value::as_i64)
			.unwrap_or(0),
		cache_read_input_tokens: body
			.pointer("/usageMetadata/cachedContentTokenCount")
			.and_then(Value::as_i64),
		cache_creation_input_tokens: None,
	};

	MessagesResponse {
		id: body
			.get("responseId")
			.and_then(Value::as_str)
			.map(str::to_string)
			.unwrap_or_else(|| format!("msg_{}", new_id())),
		kind: "message".to_string(),
		role: "assistant".to_string(),
		content,
		model: body
			.get("modelVersion")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string(),
		stop_reason,
		stop_sequence: None,
		usage,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn request_maps_roles_and_config() {
		let body = json!({
			"model": "claude-sonnet-4",
			"system": "Be terse.",
			"messages": [
				{"role": "user", "content": "hi"},
				{"role": "assistant", "content": "hello"}
			],
			"max_tokens": 256,
			"temperature": 0.3,
			"top_k": 40,
			"stop_sequences": ["DONE"]
		});
		let out = GeminiTransformer.transform_request(body, None).await.unwrap().body;
		assert_eq!(out["contents"][0]["role"], "user");
		assert_eq!(out["contents"][1]["role"], "model");
		assert_eq!(out["systemInstruction"]["parts"][0]["text"], "Be terse.");
		assert_eq!(out["generationConfig"]["maxOutputTokens"], 256);
		assert_eq!(out["generationConfig"]["topK"], 40);
		assert_eq!(out["generationConfig"]["stopSequences"], json!(["DONE"]));
	}

	#[tokio::test]
	async fn response_maps_parts_and_usage() {
		let body = json!({
			"candidates": [{
				"content": {"parts": [{"text": "hey"}], "role": "model"},
				"finishReason": "STOP"
			}],
			"usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 3},
			"modelVersion": "gemini-2.0-flash"
		});
		let out = GeminiTransformer.transform_response(body, None).await.unwrap();
		assert_eq!(out["content"][0]["text"], "hey");
		assert_eq!(out["stop_reason"], "end_turn");
		assert_eq!(out["usage"]["input_tokens"], 8);
		assert_eq!(out["usage"]["output_tokens"], 3);
		assert_eq!(out["model"], "gemini-2.0-flash");
	}

	#[tokio::test]
	async fn tools_become_function_declarations() {
		let body = json!({
			"model": "m",
			"messages": [{"role": "user", "content": "w?"}],
			"max_tokens": 16,
			"tools": [{"name": "lookup", "input_schema": {"type": "object"}}]
		});
		let out = GeminiTransformer.transform_request(body, None).await.unwrap().body;
		assert_eq!(out["tools"][0]["functionDeclarations"][0]["name"], "lookup");
	}
}
