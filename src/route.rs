use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, warn};

use crate::transform::canonical::MessagesRequest;
use crate::types::{Channel, RoutingRule, RuleCondition};

pub const IMAGE_BLOCK_TOKENS: u64 = 1500;

/// The routed view of an inbound request: the requested model plus the parsed
/// body (when it parsed) and its derived content analysis.
pub struct RouteInput {
	pub model: Option<String>,
	pub body: Option<MessagesRequest>,
	pub analysis: Option<ContentAnalysis>,
}

impl RouteInput {
	pub fn new(model: Option<String>, body: Option<MessagesRequest>) -> Self {
		let analysis = body.as_ref().map(analyze);
		RouteInput { model, body, analysis }
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentAnalysis {
	pub category: &'static str,
	pub complexity: &'static str,
	pub has_code: bool,
	pub language: Option<&'static str>,
	pub intent: &'static str,
	pub word_count: usize,
}

/// Prompt-size estimator: Claude models average ~3.5 chars per token, OpenAI
/// models ~4; image blocks cost a flat amount.
pub fn estimate_tokens(req: &MessagesRequest) -> u64 {
	let mut chars = req.system.as_ref().map(|s| s.as_text().len()).unwrap_or(0);
	for message in &req.messages {
		for text in message.content.text_parts() {
			chars += text.len();
		}
	}
	let chars_per_token = if req.model.contains("claude") { 3.5 } else { 4.0 };
	let text_tokens = (chars as f64 / chars_per_token).ceil() as u64;
	text_tokens + req.image_count() as u64 * IMAGE_BLOCK_TOKENS
}

const LANGUAGES: &[(&str, &[&str])] = &[
	("rust", &["```rust", "fn main", "impl ", "let mut", "cargo"]),
	("python", &["```python", "def ", "import numpy", "print(", "pip install"]),
	("javascript", &["```javascript", "```js", "const ", "=> {", "console.log"]),
	("typescript", &["```typescript", "```ts", "interface ", ": string"]),
	("go", &["```go", "func main", "package main", "go mod"]),
	("java", &["```java", "public class", "public static void"]),
	("sql", &["```sql", "select ", "insert into", "create table"]),
];

fn detect_language(text: &str) -> Option<&'static str> {
	let lower = text.to_lowercase();
	LANGUAGES
		.iter()
		.find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
		.map(|(lang, _)| *lang)
}

fn detect_intent(text: &str) -> &'static str {
	let lower = text.to_lowercase();
	let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
	if any(&["fix", "debug", "error", "broken", "doesn't work", "fails"]) {
		"debug"
	} else if any(&["explain", "what is", "what does", "how does", "why"]) {
		"explain"
	} else if any(&["translate", "in french", "in spanish", "in chinese", "into english"]) {
		"translate"
	} else if any(&["summarize", "summary", "tl;dr", "key points"]) {
		"summarize"
	} else if any(&["write", "create", "generate", "implement", "build", "draft"]) {
		"generate"
	} else {
		"chat"
	}
}

/// Keyword-heuristic classifier behind the content-based rule conditions.
pub fn analyze(req: &MessagesRequest) -> ContentAnalysis {
	let text = req.user_text();
	let word_count = text.split_whitespace().count();
	let has_code = text.contains("```")
		|| ["fn ", "def ", "class ", "function ", "#include", "import "]
			.iter()
			.any(|n| text.contains(n));
	let language = if has_code { detect_language(&text) } else { None };
	let lower = text.to_lowercase();
	let category = if has_code {
		"code"
	} else if ["prove", "equation", "integral", "derivative", "theorem", "calculate"]
		.iter()
		.any(|n| lower.contains(n))
	{
		"math"
	} else if ["story", "poem", "essay", "fiction", "lyrics"].iter().any(|n| lower.contains(n)) {
		"creative"
	} else if ["architecture", "design", "protocol", "algorithm", "database"]
		.iter()
		.any(|n| lower.contains(n))
	{
		"technical"
	} else {
		"general"
	};
	let complexity = if word_count >= 300 || req.image_count() > 0 || req.has_tools() {
		"high"
	} else if word_count >= 50 {
		"medium"
	} else {
		"low"
	};
	ContentAnalysis {
		category,
		complexity,
		has_code,
		language,
		intent: detect_intent(&text),
		word_count,
	}
}

pub type CustomPredicate = Arc<dyn Fn(&RouteInput) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RouteMatch {
	pub channel: Channel,
	pub model: Option<String>,
	pub rule: RoutingRule,
}

/// Evaluates the enabled rule set, highest priority first, and returns the
/// first rule whose condition holds and whose target is in the candidate set.
pub struct SmartRouter {
	rules: RwLock<Vec<RoutingRule>>,
	custom: RwLock<HashMap<String, CustomPredicate>>,
}

impl Default for SmartRouter {
	fn default() -> Self {
		Self::new()
	}
}

impl SmartRouter {
	pub fn new() -> Self {
		SmartRouter { rules: RwLock::new(Vec::new()), custom: RwLock::new(HashMap::new()) }
	}

	/// Swaps in a new rule set. Rules sort by priority descending; the sort
	/// is stable so insertion order breaks ties.
	pub fn reload(&self, mut rules: Vec<RoutingRule>) {
		rules.retain(|r| r.enabled);
		rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
		debug!(rules = rules.len(), "routing rules reloaded");
		*self.rules.write() = rules;
	}

	pub fn rule_count(&self) -> usize {
		self.rules.read().len()
	}

	pub fn register_custom(&self, name: &str, predicate: CustomPredicate) {
		self.custom.write().insert(name.to_string(), predicate);
	}

	pub fn match_rule(&self, input: &RouteInput, candidates: &[Channel]) -> Option<RouteMatch> {
		let rules = self.rules.read();
		for rule in rules.iter() {
			if !self.matches(&rule.condition, input) {
				continue;
			}
			let Some(channel) = candidates.iter().find(|c| c.name == rule.target_channel) else {
				debug!(rule = %rule.name, target = %rule.target_channel, "rule target not in candidate set");
				continue;
			};
			return Some(RouteMatch {
				channel: channel.clone(),
				model: rule.target_model.clone(),
				rule: rule.clone(),
			});
		}
		None
	}

	/// Evaluates a single condition against the input; used by the rule-test
	/// admin endpoint as well as the hot path. All present fields must hold.
	pub fn matches(&self, cond: &RuleCondition, input: &RouteInput) -> bool {
		if let Some(threshold) = cond.token_threshold {
			match &input.body {
				Some(body) if estimate_tokens(body) >= threshold => {},
				_ => return false,
			}
		}
		if let Some(keywords) = &cond.keywords {
			let Some(body) = &input.body else { return false };
			let text = body.user_text().to_lowercase();
			if !keywords.iter().any(|k| text.contains(&k.to_lowercase())) {
				return false;
			}
		}
		if let Some(pattern) = &cond.user_pattern {
			let Some(last) = input.body.as_ref().and_then(|b| b.last_user_text()) else {
				return false;
			};
			if !regex_matches(pattern, &last) {
				return false;
			}
		}
		if let Some(pattern) = &cond.model_pattern {
			let Some(model) = &input.model else { return false };
			if !regex_matches(pattern, model) {
				return false;
			}
		}
		if let Some(want) = cond.has_tools {
			let has = input.body.as_ref().map(|b| b.has_tools()).unwrap_or(false);
			if has != want {
				return false;
			}
		}
		if let Some(want) = cond.has_images {
			let has = input.body.as_ref().map(|b| b.has_images()).unwrap_or(false);
			if has != want {
				return false;
			}
		}
		if let Some(analysis) = &input.analysis {
			if let Some(category) = &cond.content_category {
				if analysis.category != category {
					return false;
				}
			}
			if let Some(level) = &cond.complexity_level {
				if analysis.complexity != level {
					return false;
				}
			}
			if let Some(want) = cond.has_code {
				if analysis.has_code != want {
					return false;
				}
			}
			if let Some(language) = &cond.programming_language {
				if analysis.language != Some(language.as_str()) {
					return false;
				}
			}
			if let Some(intent) = &cond.intent {
				if analysis.intent != intent {
					return false;
				}
			}
			if let Some(min) = cond.min_word_count {
				if analysis.word_count < min {
					return false;
				}
			}
			if let Some(max) = cond.max_word_count {
				if analysis.word_count > max {
					return false;
				}
			}
		} else if cond.content_category.is_some()
			|| cond.complexity_level.is_some()
			|| cond.has_code.is_some()
			|| cond.programming_language.is_some()
			|| cond.intent.is_some()
			|| cond.min_word_count.is_some()
			|| cond.max_word_count.is_some()
		{
			// content conditions cannot hold without a parsed body
			return false;
		}
		if let Some(name) = &cond.custom_function {
			let custom = self.custom.read();
			match custom.get(name) {
				Some(predicate) => {
					if !predicate(input) {
						return false;
					}
				},
				None => {
					warn!(function = name, "unknown custom routing predicate");
					return false;
				},
			}
		}
		true
	}
}

fn regex_matches(pattern: &str, text: &str) -> bool {
	match Regex::new(pattern) {
		Ok(re) => re.is_match(text),
		Err(e) => {
			warn!(pattern, error = %e, "invalid rule regex");
			false
		},
	}
}
