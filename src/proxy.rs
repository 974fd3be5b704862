use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::Value;
use tracing::{debug, warn};

use crate::balance::{LoadBalancer, SelectionContext};
use crate::breaker::CircuitBreaker;
use crate::errors::{Error, Result};
use crate::metrics::Registry;
use crate::provider::{ProviderAdapter, TokenUsage};
use crate::retry::{RetryPolicy, is_retriable};
use crate::route::{RouteInput, SmartRouter};
use crate::store::Store;
use crate::tee::{TeeEvent, TeeStream};
use crate::trace::{SpanStatus, Tracer, extract_trace_context};
use crate::transform::TransformerRegistry;
use crate::types::*;

const CHANNEL_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that never travel upstream: connection routing, inbound auth and
/// our own tracing/affinity carriers.
const DROPPED_HEADERS: &[&str] = &["host", "content-length", "authorization", "x-api-key"];

/// An inbound request after one parse pass: cleaned headers, decoded body
/// (when it decodes) and the extracted routing hints.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
	pub method: String,
	pub path: String,
	pub headers: HeaderMap,
	pub body: Option<Value>,
	pub raw_body: Bytes,
	pub model: Option<String>,
	pub session_id: Option<String>,
	pub trace_id: Option<String>,
	pub parent_span_id: Option<String>,
}

pub fn parse_request(method: &str, path: &str, headers: &HeaderMap, body: Bytes) -> ParsedRequest {
	let trace = extract_trace_context(headers);
	let session_id = headers
		.get("x-session-id")
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);

	let mut cleaned = HeaderMap::new();
	for (name, value) in headers.iter() {
		let lower = name.as_str();
		if DROPPED_HEADERS.contains(&lower) || lower.starts_with("x-") {
			continue;
		}
		cleaned.insert(name.clone(), value.clone());
	}

	// body decode is best-effort: a raw stream still forwards
	let parsed_body = if matches!(method, "POST" | "PUT") && !body.is_empty() {
		match serde_json::from_slice::<Value>(&body) {
			Ok(v) => Some(v),
			Err(e) => {
				debug!(error = %e, "request body is not JSON, forwarding raw");
				None
			},
		}
	} else {
		None
	};
	let model = parsed_body
		.as_ref()
		.and_then(|b| b.get("model"))
		.and_then(Value::as_str)
		.map(str::to_string);

	ParsedRequest {
		method: method.to_string(),
		path: path.to_string(),
		headers: cleaned,
		body: parsed_body,
		raw_body: body,
		model,
		session_id,
		trace_id: trace.trace_id,
		parent_span_id: trace.parent_span_id,
	}
}

#[derive(Debug, Clone)]
pub struct EngineResponse {
	pub status: u16,
	pub body: Value,
	pub channel_id: String,
	pub channel_name: String,
	pub latency_ms: u64,
	pub trace_id: String,
	pub span_id: String,
	pub rule_name: Option<String>,
}

#[derive(Debug)]
struct ForwardResult {
	status: u16,
	body: Value,
	usage: TokenUsage,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTestResult {
	pub channel_id: String,
	pub channel_name: String,
	pub success: bool,
	pub latency_ms: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// The request pipeline: trace → parse → candidates → route/select →
/// transform → forward with retry and breaker feedback → log, count, tee.
pub struct ProxyEngine {
	store: Arc<Store>,
	balancer: Arc<LoadBalancer>,
	breaker: Arc<CircuitBreaker>,
	router: Arc<SmartRouter>,
	transformers: Arc<TransformerRegistry>,
	tracer: Arc<Tracer>,
	metrics: Arc<Registry>,
	tee: Arc<TeeStream>,
	retry: RetryPolicy,
	client: reqwest::Client,
}

impl ProxyEngine {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		store: Arc<Store>,
		balancer: Arc<LoadBalancer>,
		breaker: Arc<CircuitBreaker>,
		router: Arc<SmartRouter>,
		transformers: Arc<TransformerRegistry>,
		tracer: Arc<Tracer>,
		metrics: Arc<Registry>,
		tee: Arc<TeeStream>,
		retry: RetryPolicy,
	) -> Self {
		ProxyEngine {
			store,
			balancer,
			breaker,
			router,
			transformers,
			tracer,
			metrics,
			tee,
			retry,
			client: reqwest::Client::new(),
		}
	}

	pub async fn handle(&self, mut parsed: ParsedRequest) -> Result<EngineResponse> {
		let mut tags = HashMap::new();
		tags.insert("method".to_string(), parsed.method.clone());
		tags.insert("path".to_string(), parsed.path.clone());
		if let Some(model) = &parsed.model {
			tags.insert("model".to_string(), model.clone());
		}
		let span = self.tracer.start_span(
			"proxy.handle",
			parsed.trace_id.clone(),
			parsed.parent_span_id.clone(),
			tags,
		);

		let result = self.handle_inner(&mut parsed, &span.span_id).await;
		match &result {
			Ok(resp) => {
				let mut tags = HashMap::new();
				tags.insert("channel".to_string(), resp.channel_name.clone());
				tags.insert("status".to_string(), resp.status.to_string());
				self.tracer.end_span(&span.span_id, SpanStatus::Success, tags);
			},
			Err(e) => {
				let mut tags = HashMap::new();
				tags.insert("error".to_string(), e.to_string());
				self.tracer.end_span(&span.span_id, SpanStatus::Error, tags);
			},
		}
		result.map(|mut resp| {
			resp.trace_id = span.trace_id;
			resp.span_id = span.span_id;
			resp
		})
	}

	async fn handle_inner(
		&self,
		parsed: &mut ParsedRequest,
		span_id: &str,
	) -> Result<EngineResponse> {
		let started = Instant::now();
		// probe() also re-enables rows whose cooldown stamp has expired
		let mut candidates: Vec<Channel> = Vec::new();
		for mut channel in self.store.list_channels()? {
			if !self.breaker.probe(&channel) {
				continue;
			}
			channel.status = ChannelStatus::Enabled;
			channel.consecutive_failures = 0;
			candidates.push(channel);
		}
		if candidates.is_empty() {
			self.metrics.increment("routex_requests_total", 1.0, &[]);
			self.metrics.increment("routex_requests_failure_total", 1.0, &[]);
			return Err(Error::NoAvailableChannel);
		}

		// rule-based routing first, load balancing as the fallback
		let route_input = RouteInput::new(
			parsed.model.clone(),
			parsed.body.clone().and_then(|b| serde_json::from_value(b).ok()),
		);
		let mut rule_name = None;
		let channel = match self.router.match_rule(&route_input, &candidates) {
			Some(matched) => {
				debug!(rule = %matched.rule.name, channel = %matched.channel.name, "rule routed");
				self.tracer.add_log(
					span_id,
					&format!("rule {} routed to {}", matched.rule.name, matched.channel.name),
					"info",
				);
				rule_name = Some(matched.rule.name);
				if let Some(model) = matched.model {
					if let Some(body) = parsed.body.as_mut() {
						body["model"] = Value::String(model.clone());
					}
					parsed.model = Some(model);
				}
				matched.channel
			},
			None => {
				let ctx = SelectionContext {
					session_id: parsed.session_id.clone(),
					model: parsed.model.clone(),
				};
				self.balancer.select(&candidates, &ctx)?
			},
		};

		let (channel, forwarded) = self.forward_with_retries(channel, parsed, &candidates).await?;
		let latency_ms = started.elapsed().as_millis() as u64;

		let trace_id = self
			.tracer
			.get_span(span_id)
			.map(|s| s.trace_id)
			.unwrap_or_default();
		self.record_success(&channel, parsed, &forwarded, latency_ms, &trace_id);

		Ok(EngineResponse {
			status: forwarded.status,
			body: forwarded.body,
			channel_id: channel.id,
			channel_name: channel.name,
			latency_ms,
			trace_id,
			span_id: span_id.to_string(),
			rule_name,
		})
	}

	fn record_success(
		&self,
		channel: &Channel,
		parsed: &ParsedRequest,
		forwarded: &ForwardResult,
		latency_ms: u64,
		trace_id: &str,
	) {
		let model = parsed.model.clone().unwrap_or_default();
		let entry = RequestLogEntry {
			id: new_id(),
			channel_id: channel.id.clone(),
			model: model.clone(),
			method: parsed.method.clone(),
			path: parsed.path.clone(),
			status_code: forwarded.status,
			latency: latency_ms,
			input_tokens: forwarded.usage.input,
			output_tokens: forwarded.usage.output,
			cached_tokens: forwarded.usage.cached,
			success: true,
			error: None,
			timestamp: now_ms(),
			trace_id: Some(trace_id.to_string()),
		};
		if let Err(e) = self.store.log_request(entry) {
			warn!(error = %e, "request log enqueue failed");
		}

		let labels = &[("channel", channel.name.as_str())];
		self.metrics.increment("routex_requests_total", 1.0, labels);
		self.metrics.increment("routex_requests_success_total", 1.0, labels);
		self.metrics.increment("routex_input_tokens_total", forwarded.usage.input as f64, labels);
		self.metrics.increment("routex_output_tokens_total", forwarded.usage.output as f64, labels);
		self.metrics.increment("routex_cached_tokens_total", forwarded.usage.cached as f64, labels);
		self.metrics.observe("routex_request_duration_ms", latency_ms as f64, labels);

		self.tee.send(TeeEvent {
			channel_id: channel.id.clone(),
			channel_name: channel.name.clone(),
			model,
			status_code: forwarded.status,
			latency_ms,
			success: true,
			request: parsed.body.clone().unwrap_or(Value::Null),
			response: forwarded.body.clone(),
			timestamp: now_ms(),
			trace_id: Some(trace_id.to_string()),
		});

		if let Err(e) = self.store.increment_channel_usage(&channel.id, true) {
			warn!(error = %e, "usage increment failed");
		}
		if let Err(e) = self.breaker.record_success(&channel.id) {
			warn!(error = %e, "breaker reset failed");
		}
	}

	/// Attempts the forward up to `max_retries` times, feeding the breaker on
	/// every failure and switching channels once the current one opens.
	async fn forward_with_retries(
		&self,
		channel: Channel,
		parsed: &ParsedRequest,
		candidates: &[Channel],
	) -> Result<(Channel, ForwardResult)> {
		let mut channel = channel;
		let mut last_err = Error::NoAvailableChannel;
		for attempt in 1..=self.retry.max_retries.max(1) {
			match self.forward(&channel, parsed).await {
				Ok(result) => return Ok((channel, result)),
				Err(e) => {
					warn!(channel = %channel.name, attempt, error = %e, "forward failed");
					if let Err(be) = self.breaker.record_failure(&channel.id, &channel.name) {
						warn!(error = %be, "breaker record failed");
					}
					if let Err(se) = self.store.increment_channel_usage(&channel.id, false) {
						warn!(error = %se, "usage increment failed");
					}
					self.metrics.increment(
						"routex_requests_failure_total",
						1.0,
						&[("channel", channel.name.as_str())],
					);
					let retriable = is_retriable(&e);
					last_err = e;
					if !retriable {
						self.metrics.increment("routex_requests_total", 1.0, &[]);
						return Err(last_err);
					}
					if attempt == self.retry.max_retries.max(1) {
						break;
					}
					if self.breaker.is_open(&channel.id) {
						let alternates: Vec<Channel> = candidates
							.iter()
							.filter(|c| c.id != channel.id && !self.breaker.is_open(&c.id))
							.cloned()
							.collect();
						if !alternates.is_empty() {
							let ctx = SelectionContext {
								session_id: parsed.session_id.clone(),
								model: parsed.model.clone(),
							};
							if let Ok(next) = self.balancer.select(&alternates, &ctx) {
								debug!(from = %channel.name, to = %next.name, "breaker open, switching channel");
								channel = next;
							}
						}
					}
					tokio::time::sleep(self.retry.calculate_delay(attempt)).await;
				},
			}
		}
		self.metrics.increment("routex_retry_exhausted_total", 1.0, &[]);
		self.metrics.increment("routex_requests_total", 1.0, &[]);
		Err(last_err)
	}

	/// Default dialect chain for channels without an explicit transformer
	/// configuration.
	fn default_chain(channel_type: ChannelType) -> Vec<TransformerUse> {
		let name = match channel_type {
			ChannelType::Openai => "openai",
			ChannelType::Gemini => "gemini",
			ChannelType::Zhipu => "zhipu",
			ChannelType::Azure => "azure-openai",
			ChannelType::Anthropic | ChannelType::Custom => return Vec::new(),
		};
		vec![TransformerUse::Name(name.to_string())]
	}

	/// One upstream HTTP call: provider resolution, request transform, send,
	/// response transform, usage extraction.
	async fn forward(&self, channel: &Channel, parsed: &ParsedRequest) -> Result<ForwardResult> {
		let started = Instant::now();
		let model = parsed.model.clone().unwrap_or_default();
		let url = ProviderAdapter::build_url(channel, &model, &parsed.path)?;
		let mut headers = ProviderAdapter::headers(channel)?;

		let chain = channel
			.transformers
			.as_ref()
			.map(|t| t.chain.clone())
			.unwrap_or_else(|| Self::default_chain(channel.channel_type));

		let body_bytes = match &parsed.body {
			Some(body) => {
				let (transformed, extra_headers) =
					self.transformers.apply_request(&chain, body.clone()).await;
				for (name, value) in extra_headers.iter() {
					headers.insert(name.clone(), value.clone());
				}
				Bytes::from(serde_json::to_vec(&transformed)?)
			},
			None => parsed.raw_body.clone(),
		};

		let method = Method::from_bytes(parsed.method.as_bytes())
			.map_err(|_| Error::Validation(format!("invalid method {:?}", parsed.method)))?;
		let response = self
			.client
			.request(method, &url)
			.headers(headers)
			.body(body_bytes)
			.send()
			.await?;

		let status = response.status().as_u16();
		let bytes = response.bytes().await?;
		if !(200..300).contains(&status) {
			return Err(Error::Http {
				status,
				body: String::from_utf8_lossy(&bytes).into_owned(),
			});
		}

		let raw: Value = serde_json::from_slice(&bytes)
			.unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
		let body = self.transformers.apply_response(&chain, raw).await;
		let usage = ProviderAdapter::extract_usage(&body);
		debug!(channel = %channel.name, status, elapsed_ms = started.elapsed().as_millis() as u64, "forwarded");
		Ok(ForwardResult { status, body, usage })
	}

	/// Minimal provider ping for the channel-test endpoints.
	pub async fn test_channel(&self, channel: &Channel) -> ChannelTestResult {
		let started = Instant::now();
		let model = channel.models.first().cloned().unwrap_or_default();
		let outcome: Result<u16> = async {
			let url = ProviderAdapter::build_url(channel, &model, "/v1/messages")?;
			let headers = ProviderAdapter::headers(channel)?;
			let response = self
				.client
				.post(&url)
				.headers(headers)
				.timeout(CHANNEL_TEST_TIMEOUT)
				.json(&ProviderAdapter::ping_body(channel))
				.send()
				.await?;
			let status = response.status().as_u16();
			if (200..300).contains(&status) {
				Ok(status)
			} else {
				Err(Error::Http {
					status,
					body: response.text().await.unwrap_or_default(),
				})
			}
		}
		.await;
		let latency_ms = started.elapsed().as_millis() as u64;
		match outcome {
			Ok(status) => ChannelTestResult {
				channel_id: channel.id.clone(),
				channel_name: channel.name.clone(),
				success: true,
				latency_ms,
				status: Some(status),
				error: None,
			},
			Err(e) => ChannelTestResult {
				channel_id: channel.id.clone(),
				channel_name: channel.name.clone(),
				success: false,
				latency_ms,
				status: match &e {
					Error::Http { status, .. } => Some(*status),
					_ => None,
				},
				error: Some(e.to_string()),
			},
		}
	}

	pub fn balancer(&self) -> &Arc<LoadBalancer> {
		&self.balancer
	}

	pub fn tee(&self) -> &Arc<TeeStream> {
		&self.tee
	}

	pub fn router(&self) -> &Arc<SmartRouter> {
		&self.router
	}

	pub fn tracer(&self) -> &Arc<Tracer> {
		&self.tracer
	}
}

#[cfg(test)]
mod tests;
