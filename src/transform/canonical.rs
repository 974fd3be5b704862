//! The canonical request/response shape used as the pivot between provider
//! dialects: Anthropic Messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentBlock {
	Text {
		text: String,
	},
	Image {
		source: ImageSource,
	},
	ToolUse {
		id: String,
		name: String,
		input: Value,
	},
	ToolResult {
		tool_use_id: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		content: Option<Value>,
		#[serde(skip_serializing_if = "Option::is_none")]
		is_error: Option<bool>,
	},
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ImageSource {
	#[serde(rename = "type")]
	pub source_type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub media_type: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
}

/// Message content is either a bare string or a block list.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

impl MessageContent {
	pub fn text_parts(&self) -> Vec<&str> {
		match self {
			MessageContent::Text(t) => vec![t.as_str()],
			MessageContent::Blocks(blocks) => blocks
				.iter()
				.filter_map(|b| match b {
					ContentBlock::Text { text } => Some(text.as_str()),
					_ => None,
				})
				.collect(),
		}
	}
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Message {
	pub role: String,
	pub content: MessageContent,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum SystemPrompt {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
	pub fn as_text(&self) -> String {
		match self {
			SystemPrompt::Text(t) => t.clone(),
			SystemPrompt::Blocks(blocks) => blocks
				.iter()
				.filter_map(|b| match b {
					ContentBlock::Text { text } => Some(text.as_str()),
					_ => None,
				})
				.collect::<Vec<_>>()
				.join("\n"),
		}
	}
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Tool {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub input_schema: Value,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct MessagesRequest {
	pub model: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<SystemPrompt>,
	pub messages: Vec<Message>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequences: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	/// Provider-specific extras pass through untouched.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl MessagesRequest {
	/// All user-authored text, concatenated. Drives keyword and token
	/// heuristics in the router.
	pub fn user_text(&self) -> String {
		self
			.messages
			.iter()
			.filter(|m| m.role == "user")
			.flat_map(|m| m.content.text_parts())
			.collect::<Vec<_>>()
			.join("\n")
	}

	pub fn last_user_text(&self) -> Option<String> {
		self
			.messages
			.iter()
			.rev()
			.find(|m| m.role == "user")
			.map(|m| m.content.text_parts().join("\n"))
	}

	pub fn has_tools(&self) -> bool {
		self.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
	}

	pub fn image_count(&self) -> usize {
		self
			.messages
			.iter()
			.filter_map(|m| match &m.content {
				MessageContent::Blocks(blocks) => Some(blocks),
				_ => None,
			})
			.flatten()
			.filter(|b| matches!(b, ContentBlock::Image { .. }))
			.count()
	}

	pub fn has_images(&self) -> bool {
		self.image_count() > 0
	}
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Usage {
	pub input_tokens: i64,
	pub output_tokens: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_read_input_tokens: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation_input_tokens: Option<i64>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct MessagesResponse {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub role: String,
	pub content: Vec<ContentBlock>,
	pub model: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_reason: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequence: Option<String>,
	pub usage: Usage,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn parses_string_and_block_content() {
		let req: MessagesRequest = serde_json::from_value(json!({
			"model": "claude-sonnet-4",
			"messages": [
				{"role": "user", "content": "Hello"},
				{"role": "user", "content": [
					{"type": "text", "text": "look at this"},
					{"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
				]}
			],
			"max_tokens": 1024
		}))
		.unwrap();
		assert_eq!(req.messages.len(), 2);
		assert!(req.has_images());
		assert_eq!(req.image_count(), 1);
		assert_eq!(req.user_text(), "Hello\nlook at this");
	}

	#[test]
	fn tool_blocks_roundtrip() {
		let block = ContentBlock::ToolUse {
			id: "toolu_1".into(),
			name: "get_weather".into(),
			input: json!({"city": "Tokyo"}),
		};
		let v = serde_json::to_value(&block).unwrap();
		assert_eq!(v["type"], "tool_use");
		let back: ContentBlock = serde_json::from_value(v).unwrap();
		assert_eq!(back, block);
	}

	#[test]
	fn unknown_top_level_fields_flow_through_extra() {
		let req: MessagesRequest = serde_json::from_value(json!({
			"model": "m",
			"messages": [],
			"metadata": {"user_id": "u1"}
		}))
		.unwrap();
		assert!(req.extra.contains_key("metadata"));
		let back = serde_json::to_value(&req).unwrap();
		assert_eq!(back["metadata"]["user_id"], "u1");
	}

	#[test]
	fn last_user_text_finds_final_message() {
		let req: MessagesRequest = serde_json::from_value(json!({
			"model": "m",
			"messages": [
				{"role": "user", "content": "first"},
				{"role": "assistant", "content": "ok"},
				{"role": "user", "content": "second"}
			]
		}))
		.unwrap();
		assert_eq!(req.last_user_text().as_deref(), Some("second"));
	}
}
