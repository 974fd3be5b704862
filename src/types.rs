use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

pub fn new_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
	Anthropic,
	Openai,
	Azure,
	Gemini,
	Zhipu,
	Custom,
}

impl ChannelType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChannelType::Anthropic => "anthropic",
			ChannelType::Openai => "openai",
			ChannelType::Azure => "azure",
			ChannelType::Gemini => "gemini",
			ChannelType::Zhipu => "zhipu",
			ChannelType::Custom => "custom",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
	Enabled,
	Disabled,
	CircuitOpen,
	RateLimited,
}

impl ChannelStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChannelStatus::Enabled => "enabled",
			ChannelStatus::Disabled => "disabled",
			ChannelStatus::CircuitOpen => "circuit_open",
			ChannelStatus::RateLimited => "rate_limited",
		}
	}
}

/// One entry in a channel's transformer chain: a bare name, or a name with
/// options. Serialized the way it appears in channel config:
/// `"openai"` or `["maxtoken", {"max_tokens": 8192}]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformerUse {
	Name(String),
	WithOptions(String, Value),
}

impl TransformerUse {
	pub fn name(&self) -> &str {
		match self {
			TransformerUse::Name(n) => n,
			TransformerUse::WithOptions(n, _) => n,
		}
	}

	pub fn options(&self) -> Option<&Value> {
		match self {
			TransformerUse::Name(_) => None,
			TransformerUse::WithOptions(_, o) => Some(o),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerChain {
	#[serde(rename = "use")]
	pub chain: Vec<TransformerUse>,
}

/// A single upstream credential plus its routing hints and health counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
	pub id: String,
	pub name: String,
	#[serde(rename = "type")]
	pub channel_type: ChannelType,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub base_url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub api_key: Option<String>,
	pub models: Vec<String>,
	pub priority: i64,
	pub weight: f64,
	pub status: ChannelStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transformers: Option<TransformerChain>,
	pub request_count: i64,
	pub success_count: i64,
	pub failure_count: i64,
	pub consecutive_failures: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_failure_time: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub circuit_breaker_until: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rate_limited_until: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_used_at: Option<i64>,
	pub created_at: i64,
	pub updated_at: i64,
}

impl Channel {
	pub fn is_enabled(&self) -> bool {
		self.status == ChannelStatus::Enabled
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInput {
	pub name: String,
	#[serde(rename = "type")]
	pub channel_type: ChannelType,
	pub base_url: Option<String>,
	pub api_key: Option<String>,
	pub models: Vec<String>,
	pub priority: Option<i64>,
	pub weight: Option<f64>,
	pub transformers: Option<TransformerChain>,
}

/// Partial update; only set fields change. `enabled` is accepted as a
/// convenience alias for flipping status.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdate {
	pub name: Option<String>,
	#[serde(rename = "type")]
	pub channel_type: Option<ChannelType>,
	#[serde(default, with = "double_option")]
	pub base_url: Option<Option<String>>,
	#[serde(default, with = "double_option")]
	pub api_key: Option<Option<String>>,
	pub models: Option<Vec<String>>,
	pub priority: Option<i64>,
	pub weight: Option<f64>,
	pub status: Option<ChannelStatus>,
	pub enabled: Option<bool>,
	#[serde(default, with = "double_option")]
	pub transformers: Option<Option<TransformerChain>>,
}

/// Distinguishes "field absent" from "field explicitly null" in PATCH bodies.
mod double_option {
	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
	where
		T: Deserialize<'de>,
		D: Deserializer<'de>,
	{
		Option::<T>::deserialize(de).map(Some)
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleCondition {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token_threshold: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub keywords: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_pattern: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model_pattern: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub has_tools: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub has_images: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content_category: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub complexity_level: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub has_code: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub programming_language: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub intent: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub min_word_count: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_word_count: Option<usize>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub custom_function: Option<String>,
}

impl RuleCondition {
	pub fn is_empty(&self) -> bool {
		self.token_threshold.is_none()
			&& self.keywords.is_none()
			&& self.user_pattern.is_none()
			&& self.model_pattern.is_none()
			&& self.has_tools.is_none()
			&& self.has_images.is_none()
			&& self.content_category.is_none()
			&& self.complexity_level.is_none()
			&& self.has_code.is_none()
			&& self.programming_language.is_none()
			&& self.intent.is_none()
			&& self.min_word_count.is_none()
			&& self.max_word_count.is_none()
			&& self.custom_function.is_none()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
	pub id: String,
	pub name: String,
	#[serde(rename = "type")]
	pub rule_type: String,
	pub condition: RuleCondition,
	pub target_channel: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub target_model: Option<String>,
	pub priority: i64,
	pub enabled: bool,
	pub created_at: i64,
	pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRuleInput {
	pub name: String,
	#[serde(rename = "type", default = "default_rule_type")]
	pub rule_type: String,
	pub condition: RuleCondition,
	pub target_channel: String,
	pub target_model: Option<String>,
	pub priority: Option<i64>,
	pub enabled: Option<bool>,
}

fn default_rule_type() -> String {
	"composite".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRuleUpdate {
	pub name: Option<String>,
	#[serde(rename = "type")]
	pub rule_type: Option<String>,
	pub condition: Option<RuleCondition>,
	pub target_channel: Option<String>,
	#[serde(default, with = "double_option")]
	pub target_model: Option<Option<String>>,
	pub priority: Option<i64>,
	pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeeType {
	Webhook,
	File,
	Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeeFilter {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status_codes: Option<Vec<u16>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub channels: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub models: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub min_latency_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_latency_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub success_only: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub failure_only: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeeDestination {
	pub id: String,
	pub name: String,
	#[serde(rename = "type")]
	pub tee_type: TeeType,
	pub enabled: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub method: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub headers: Option<HashMap<String, String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file_path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub custom_handler: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub filter: Option<TeeFilter>,
	pub retries: u32,
	pub timeout_ms: u64,
	pub created_at: i64,
	pub updated_at: i64,
}

impl TeeDestination {
	/// The type-required field must be present.
	pub fn validate(&self) -> Result<(), String> {
		match self.tee_type {
			TeeType::Webhook if self.url.is_none() => Err("webhook tee requires url".into()),
			TeeType::File if self.file_path.is_none() => Err("file tee requires filePath".into()),
			TeeType::Custom if self.custom_handler.is_none() => {
				Err("custom tee requires customHandler".into())
			},
			_ => Ok(()),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeeDestinationInput {
	pub name: String,
	#[serde(rename = "type")]
	pub tee_type: TeeType,
	pub enabled: Option<bool>,
	pub url: Option<String>,
	pub method: Option<String>,
	pub headers: Option<HashMap<String, String>>,
	pub file_path: Option<String>,
	pub custom_handler: Option<String>,
	pub filter: Option<TeeFilter>,
	pub retries: Option<u32>,
	pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeeDestinationUpdate {
	pub name: Option<String>,
	#[serde(rename = "type")]
	pub tee_type: Option<TeeType>,
	pub enabled: Option<bool>,
	#[serde(default, with = "double_option")]
	pub url: Option<Option<String>>,
	#[serde(default, with = "double_option")]
	pub method: Option<Option<String>>,
	#[serde(default, with = "double_option")]
	pub headers: Option<Option<HashMap<String, String>>>,
	#[serde(default, with = "double_option")]
	pub file_path: Option<Option<String>>,
	#[serde(default, with = "double_option")]
	pub custom_handler: Option<Option<String>>,
	#[serde(default, with = "double_option")]
	pub filter: Option<Option<TeeFilter>>,
	pub retries: Option<u32>,
	pub timeout_ms: Option<u64>,
}

/// One row per forwarded request; append-only after the batched insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogEntry {
	pub id: String,
	pub channel_id: String,
	pub model: String,
	pub method: String,
	pub path: String,
	pub status_code: u16,
	pub latency: u64,
	pub input_tokens: i64,
	pub output_tokens: i64,
	pub cached_tokens: i64,
	pub success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	pub timestamp: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSession {
	pub id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub channel_id: Option<String>,
	pub provider: String,
	pub access_token: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub refresh_token: Option<String>,
	pub expires_at: i64,
	pub scopes: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_info: Option<Value>,
	pub created_at: i64,
	pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSessionInput {
	pub channel_id: Option<String>,
	pub provider: String,
	pub access_token: String,
	pub refresh_token: Option<String>,
	pub expires_at: i64,
	#[serde(default)]
	pub scopes: Vec<String>,
	pub user_info: Option<Value>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transformer_chain_accepts_both_shapes() {
		let chain: TransformerChain = serde_json::from_str(
			r#"{"use": ["openai", ["maxtoken", {"maxTokens": 8192}]]}"#,
		)
		.unwrap();
		assert_eq!(chain.chain.len(), 2);
		assert_eq!(chain.chain[0].name(), "openai");
		assert_eq!(chain.chain[1].name(), "maxtoken");
		assert!(chain.chain[1].options().is_some());
	}

	#[test]
	fn channel_serializes_type_field() {
		let json = serde_json::to_value(Channel {
			id: "c1".into(),
			name: "main".into(),
			channel_type: ChannelType::Anthropic,
			base_url: None,
			api_key: None,
			models: vec!["claude-sonnet-4".into()],
			priority: 50,
			weight: 1.0,
			status: ChannelStatus::Enabled,
			transformers: None,
			request_count: 0,
			success_count: 0,
			failure_count: 0,
			consecutive_failures: 0,
			last_failure_time: None,
			circuit_breaker_until: None,
			rate_limited_until: None,
			last_used_at: None,
			created_at: 0,
			updated_at: 0,
		})
		.unwrap();
		assert_eq!(json["type"], "anthropic");
		assert_eq!(json["status"], "enabled");
	}

	#[test]
	fn update_distinguishes_null_from_absent() {
		let upd: ChannelUpdate = serde_json::from_str(r#"{"baseUrl": null}"#).unwrap();
		assert_eq!(upd.base_url, Some(None));
		let upd: ChannelUpdate = serde_json::from_str(r#"{}"#).unwrap();
		assert_eq!(upd.base_url, None);
	}

	#[test]
	fn tee_validation_requires_type_field() {
		let tee = TeeDestination {
			id: "t".into(),
			name: "hook".into(),
			tee_type: TeeType::Webhook,
			enabled: true,
			url: None,
			method: None,
			headers: None,
			file_path: None,
			custom_handler: None,
			filter: None,
			retries: 0,
			timeout_ms: 5000,
			created_at: 0,
			updated_at: 0,
		};
		assert!(tee.validate().is_err());
	}

	#[test]
	fn empty_condition_detected() {
		assert!(RuleCondition::default().is_empty());
		let cond = RuleCondition { token_threshold: Some(1000), ..Default::default() };
		assert!(!cond.is_empty());
	}
}
