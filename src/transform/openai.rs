use async_trait::async_trait;
use serde_json::{Value, json};

use super::canonical::{
	ContentBlock, Message, MessageContent, MessagesRequest, MessagesResponse, Usage,
};
use super::{TransformOutput, Transformer};
use crate::errors::{Error, Result};

/// Canonical Messages ⇄ OpenAI Chat Completions.
pub struct OpenAiTransformer;

#[async_trait]
impl Transformer for OpenAiTransformer {
	async fn transform_request(&self, body: Value, _options: Option<&Value>) -> Result<TransformOutput> {
		let req: MessagesRequest =
			serde_json::from_value(body).map_err(|e| Error::Transformer(e.to_string()))?;
		let out = serde_json::to_value(translate_request(req))
			.map_err(|e| Error::Transformer(e.to_string()))?;
		Ok(TransformOutput::body(out))
	}

	async fn transform_response(&self, body: Value, _options: Option<&Value>) -> Result<Value> {
		let resp: types::ChatResponse =
			serde_json::from_value(body).map_err(|e| Error::Transformer(e.to_string()))?;
		serde_json::to_value(translate_response(resp)).map_err(|e| Error::Transformer(e.to_string()))
	}
}

fn image_url(block: &ContentBlock) -> Option<String> {
	match block {
		ContentBlock::Image { source } => match source.source_type.as_str() {
			"url" => source.url.clone(),
			_ => Some(format!(
				"data:{};base64,{}",
				source.media_type.as_deref().unwrap_or("image/jpeg"),
				source.data.as_deref().unwrap_or_default()
			)),
		},
		_ => None,
	}
}

fn tool_result_text(content: &Option<Value>) -> String {
	match content {
		Some(Value::String(s)) => s.clone(),
		Some(Value::Array(blocks)) => blocks
			.iter()
			.filter_map(|b| b.get("text").and_then(Value::as_str))
			.collect::<Vec<_>>()
			.join("\n"),
		Some(other) => other.to_string(),
		None => String::new(),
	}
}

/// Splits one canonical message into its OpenAI counterparts. Tool results
/// become their own `tool` role messages; tool_use blocks on assistant turns
/// become `tool_calls`.
fn translate_message(msg: &Message) -> Vec<types::ChatMessage> {
	let blocks = match &msg.content {
		MessageContent::Text(text) => {
			return vec![types::ChatMessage {
				role: msg.role.clone(),
				content: Some(Value::String(text.clone())),
				tool_calls: None,
				tool_call_id: None,
			}];
		},
		MessageContent::Blocks(blocks) => blocks,
	};

	let mut out = Vec::new();
	let mut parts: Vec<Value> = Vec::new();
	let mut tool_calls: Vec<types::ToolCall> = Vec::new();
	let mut only_text: Option<String> = None;
	let mut text_blocks = 0usize;

	for block in blocks {
		match block {
			ContentBlock::Text { text } => {
				text_blocks += 1;
				only_text = Some(text.clone());
				parts.push(json!({"type": "text", "text": text}));
			},
			ContentBlock::Image { .. } => {
				if let Some(url) = image_url(block) {
					parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
				}
			},
			ContentBlock::ToolUse { id, name, input } => {
				tool_calls.push(types::ToolCall {
					id: id.clone(),
					kind: "function".to_string(),
					function: types::FunctionCall {
						name: name.clone(),
						arguments: input.to_string(),
					},
				});
			},
			ContentBlock::ToolResult { tool_use_id, content, .. } => {
				out.push(types::ChatMessage {
					role: "tool".to_string(),
					content: Some(Value::String(tool_result_text(content))),
					tool_calls: None,
					tool_call_id: Some(tool_use_id.clone()),
				});
			},
		}
	}

	let content = if parts.is_empty() {
		None
	} else if text_blocks == 1 && parts.len() == 1 {
		only_text.map(Value::String)
	} else {
		Some(Value::Array(parts))
	};

	if content.is_some() || !tool_calls.is_empty() {
		out.push(types::ChatMessage {
			role: msg.role.clone(),
			content,
			tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
			tool_call_id: None,
		});
	}
	out
}

pub(super) fn translate_request(req: MessagesRequest) -> types::ChatRequest {
	let mut messages = Vec::new();
	// the canonical system field becomes a leading system message
	if let Some(system) = &req.system {
		messages.push(types::ChatMessage {
			role: "system".to_string(),
			content: Some(Value::String(system.as_text())),
			tool_calls: None,
			tool_call_id: None,
		});
	}
	for msg in &req.messages {
		messages.extend(translate_message(msg));
	}

	let tools = req.tools.as_ref().map(|tools| {
		tools
			.iter()
			.map(|t| types::ToolDef {
				kind: "function".to_string(),
				function: types::FunctionDef {
					name: t.name.clone(),
					description: t.description.clone(),
					parameters: t.input_schema.clone(),
				},
			})
			.collect()
	});

	let tool_choice = req.tool_choice.as_ref().map(|choice| {
		match choice.get("type").and_then(Value::as_str) {
			Some("any") => json!("required"),
			Some("auto") => json!("auto"),
			Some("tool") => {
				json!({"type": "function", "function": {"name": choice.get("name").cloned().unwrap_or_default()}})
			},
			_ => choice.clone(),
		}
	});

	types::ChatRequest {
		model: req.model,
		messages,
		max_tokens: req.max_tokens,
		temperature: req.temperature,
		top_p: req.top_p,
		stop: req.stop_sequences.filter(|s| !s.is_empty()).map(|s| json!(s)),
		tools,
		tool_choice,
		stream: req.stream,
	}
}

fn map_finish_reason(reason: &str) -> String {
	match reason {
		"stop" => "end_turn",
		"length" => "max_tokens",
		"tool_calls" => "tool_use",
		"content_filter" => "stop_sequence",
		other => other,
	}
	.to_string()
}

pub(super) fn translate_response(resp: types::ChatResponse) -> MessagesResponse {
	let mut content = Vec::new();
	let mut stop_reason = None;
	if let Some(choice) = resp.choices.first() {
		if let Some(text) = &choice.message.content {
			if !text.is_empty() {
				content.push(ContentBlock::Text { text: text.clone() });
			}
		}
		for call in choice.message.tool_calls.iter().flatten() {
			let input = serde_json::from_str(&call.function.arguments)
				.unwrap_or(Value::String(call.function.arguments.clone()));
			content.push(ContentBlock::ToolUse {
				id: call.id.clone(),
				name: call.function.name.clone(),
				input,
			});
		}
		stop_reason = choice.finish_reason.as_deref().map(map_finish_reason);
	}

	let usage = resp
		.usage
		.map(|u| Usage {
			input_tokens: u.prompt_tokens,
			output_tokens: u.completion_tokens,
			cache_read_input_tokens: u.prompt_tokens_details.and_then(|d| d.cached_tokens),
			cache_creation_input_tokens: None,
		})
		.unwrap_or_default();

	MessagesResponse {
		id: resp.id.unwrap_or_default(),
		kind: "message".to_string(),
		role: "assistant".to_string(),
		content,
		model: resp.model.unwrap_or_default(),
		stop_reason,
		stop_sequence: None,
		usage,
	}
}

pub(super) mod types {
	use serde::{Deserialize, Serialize};
	use serde_json::Value;

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct ChatMessage {
		pub role: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub content: Option<Value>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_calls: Option<Vec<ToolCall>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_call_id: Option<String>,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct ToolCall {
		pub id: String,
		#[serde(rename = "type")]
		pub kind: String,
		pub function: FunctionCall,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct FunctionCall {
		pub name: String,
		/// JSON-encoded arguments, per the OpenAI wire format.
		pub arguments: String,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct FunctionDef {
		pub name: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub description: Option<String>,
		pub parameters: Value,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct ToolDef {
		#[serde(rename = "type")]
		pub kind: String,
		pub function: FunctionDef,
	}

	#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
	pub struct ChatRequest {
		pub model: String,
		pub messages: Vec<ChatMessage>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop: Option<Value>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tools: Option<Vec<ToolDef>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_choice: Option<Value>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stream: Option<bool>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct ResponseMessage {
		#[allow(dead_code)]
		#[serde(default)]
		pub role: Option<String>,
		#[serde(default)]
		pub content: Option<String>,
		#[serde(default)]
		pub tool_calls: Option<Vec<ToolCall>>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct Choice {
		pub message: ResponseMessage,
		#[serde(default)]
		pub finish_reason: Option<String>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct PromptTokensDetails {
		#[serde(default)]
		pub cached_tokens: Option<i64>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct UsageWire {
		#[serde(default)]
		pub prompt_tokens: i64,
		#[serde(default)]
		pub completion_tokens: i64,
		#[serde(default)]
		#[allow(dead_code)]
		pub total_tokens: i64,
		#[serde(default)]
		pub prompt_tokens_details: Option<PromptTokensDetails>,
	}

	#[derive(Clone, Deserialize, Debug)]
	pub struct ChatResponse {
		#[serde(default)]
		pub id: Option<String>,
		#[serde(default)]
		pub model: Option<String>,
		#[serde(default)]
		pub choices: Vec<Choice>,
		#[serde(default)]
		pub usage: Option<UsageWire>,
	}
}
