use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use super::*;
use crate::balance::Strategy;
use crate::config::{BreakerSettings, RequestLogSettings};

struct Harness {
	store: Arc<Store>,
	engine: ProxyEngine,
}

fn harness() -> Harness {
	let metrics = Arc::new(Registry::with_defaults());
	let store = Arc::new(
		Store::open_in_memory(
			RequestLogSettings::default(),
			Duration::from_secs(30),
			metrics.clone(),
		)
		.unwrap(),
	);
	let balancer = Arc::new(LoadBalancer::new(Strategy::Priority));
	let breaker = Arc::new(CircuitBreaker::new(
		BreakerSettings { threshold: 5, timeout: Duration::from_secs(60) },
		store.clone(),
		metrics.clone(),
	));
	let engine = ProxyEngine::new(
		store.clone(),
		balancer,
		breaker,
		Arc::new(SmartRouter::new()),
		Arc::new(TransformerRegistry::with_builtins()),
		Arc::new(Tracer::new(1000)),
		metrics.clone(),
		Arc::new(TeeStream::new(1, metrics)),
		RetryPolicy {
			max_retries: 3,
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(5),
			exponential_base: 2.0,
			jitter_enabled: false,
			jitter_factor: 0.0,
		},
	);
	Harness { store, engine }
}

fn add_channel(h: &Harness, name: &str, priority: i64, base_url: &str) -> Channel {
	h.store
		.create_channel(ChannelInput {
			name: name.to_string(),
			channel_type: ChannelType::Custom,
			base_url: Some(base_url.to_string()),
			api_key: Some("sk-test".to_string()),
			models: vec!["claude-sonnet-4".to_string()],
			priority: Some(priority),
			weight: Some(1.0),
			transformers: None,
		})
		.unwrap()
}

fn messages_request() -> ParsedRequest {
	let body = json!({
		"model": "claude-sonnet-4",
		"messages": [{"role": "user", "content": "Hello"}],
		"max_tokens": 64
	});
	let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());
	parse_request("POST", "/v1/messages", &HeaderMap::new(), bytes)
}

fn anthropic_reply() -> serde_json::Value {
	json!({
		"id": "msg_1",
		"type": "message",
		"role": "assistant",
		"content": [{"type": "text", "text": "Hi!"}],
		"model": "claude-sonnet-4",
		"stop_reason": "end_turn",
		"usage": {"input_tokens": 9, "output_tokens": 2}
	})
}

/// Fails with 503 a fixed number of times, then returns the payload.
struct FlakyResponder {
	failures: std::sync::atomic::AtomicU32,
	payload: serde_json::Value,
}

impl Respond for FlakyResponder {
	fn respond(&self, _req: &Request) -> ResponseTemplate {
		use std::sync::atomic::Ordering;
		if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
			if n > 0 { Some(n - 1) } else { None }
		})
		.is_ok()
		{
			ResponseTemplate::new(503).set_body_string("overloaded")
		} else {
			ResponseTemplate::new(200).set_body_json(self.payload.clone())
		}
	}
}

#[tokio::test]
async fn forwards_and_records_success() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(anthropic_reply()))
		.mount(&server)
		.await;

	let h = harness();
	let channel = add_channel(&h, "primary", 50, &server.uri());

	let resp = h.engine.handle(messages_request()).await.unwrap();
	assert_eq!(resp.status, 200);
	assert_eq!(resp.channel_name, "primary");
	assert_eq!(resp.body["content"][0]["text"], "Hi!");
	assert!(!resp.trace_id.is_empty());

	let ch = h.store.get_channel(&channel.id).unwrap();
	assert_eq!(ch.request_count, 1);
	assert_eq!(ch.success_count, 1);

	h.store.flush_requests().unwrap();
	let logs = h.store.get_requests(10, 0).unwrap();
	assert_eq!(logs.len(), 1);
	assert_eq!(logs[0].input_tokens, 9);
	assert_eq!(logs[0].output_tokens, 2);
	assert!(logs[0].success);
}

#[tokio::test]
async fn no_channels_yields_503() {
	let h = harness();
	let err = h.engine.handle(messages_request()).await.unwrap_err();
	assert!(matches!(err, Error::NoAvailableChannel));
}

#[tokio::test]
async fn retries_5xx_then_succeeds() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(FlakyResponder {
			failures: std::sync::atomic::AtomicU32::new(2),
			payload: anthropic_reply(),
		})
		.mount(&server)
		.await;

	let h = harness();
	let channel = add_channel(&h, "flaky", 50, &server.uri());

	let resp = h.engine.handle(messages_request()).await.unwrap();
	assert_eq!(resp.status, 200);

	// two failed attempts plus the success, no breaker trip at < 5 failures
	let ch = h.store.get_channel(&channel.id).unwrap();
	assert_eq!(ch.failure_count, 2);
	assert_eq!(ch.success_count, 1);
	assert_eq!(ch.request_count, 3);
	assert_eq!(ch.status, ChannelStatus::Enabled);
	assert_eq!(ch.consecutive_failures, 0);
}

#[tokio::test]
async fn non_retriable_4xx_fails_fast() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
		.expect(1)
		.mount(&server)
		.await;

	let h = harness();
	add_channel(&h, "strict", 50, &server.uri());

	let err = h.engine.handle(messages_request()).await.unwrap_err();
	match err {
		Error::Http { status, .. } => assert_eq!(status, 400),
		other => panic!("expected Http error, got {other}"),
	}
}

#[tokio::test]
async fn exhaustion_returns_last_error() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(503).set_body_string("down"))
		.mount(&server)
		.await;

	let h = harness();
	let channel = add_channel(&h, "down", 50, &server.uri());

	let err = h.engine.handle(messages_request()).await.unwrap_err();
	assert!(matches!(err, Error::Http { status: 503, .. }));
	let ch = h.store.get_channel(&channel.id).unwrap();
	assert_eq!(ch.failure_count, 3);
	assert_eq!(ch.success_count, 0);
}

#[tokio::test]
async fn breaker_opens_and_requests_move_to_alternate() {
	let bad = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(503).set_body_string("down"))
		.mount(&bad)
		.await;
	let good = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(anthropic_reply()))
		.mount(&good)
		.await;

	let h = harness();
	// higher priority channel is the broken one
	let broken = add_channel(&h, "broken", 90, &bad.uri());
	add_channel(&h, "backup", 10, &good.uri());

	// two requests: 3 failures, then 2 more to trip at 5; the engine switches
	// to the alternate once the breaker opens mid-retry
	let first = h.engine.handle(messages_request()).await;
	let second = h.engine.handle(messages_request()).await.unwrap();
	assert_eq!(second.status, 200);
	assert_eq!(second.channel_name, "backup");
	// first request exhausted retries on the broken channel
	assert!(first.is_err());

	let ch = h.store.get_channel(&broken.id).unwrap();
	assert_eq!(ch.status, ChannelStatus::RateLimited);
	assert!(ch.rate_limited_until.unwrap() > now_ms());

	// while open, fresh requests never touch the broken channel
	let third = h.engine.handle(messages_request()).await.unwrap();
	assert_eq!(third.channel_name, "backup");
}

#[tokio::test]
async fn router_rule_overrides_model_and_channel() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(anthropic_reply()))
		.mount(&server)
		.await;

	let h = harness();
	add_channel(&h, "default", 90, &server.uri());
	add_channel(&h, "anthropic-opus", 10, &server.uri());

	h.engine.router().reload(vec![RoutingRule {
		id: "r1".into(),
		name: "big-context".into(),
		rule_type: "composite".into(),
		condition: RuleCondition { token_threshold: Some(50_000), ..Default::default() },
		target_channel: "anthropic-opus".into(),
		target_model: Some("claude-opus-4".into()),
		priority: 10,
		enabled: true,
		created_at: now_ms(),
		updated_at: now_ms(),
	}]);

	let body = json!({
		"model": "claude-sonnet-4",
		"messages": [{"role": "user", "content": "x".repeat(200_000)}],
		"max_tokens": 64
	});
	let parsed = parse_request(
		"POST",
		"/v1/messages",
		&HeaderMap::new(),
		Bytes::from(serde_json::to_vec(&body).unwrap()),
	);
	let resp = h.engine.handle(parsed).await.unwrap();
	assert_eq!(resp.channel_name, "anthropic-opus");
	assert_eq!(resp.rule_name.as_deref(), Some("big-context"));

	// the forwarded body carried the rewritten model
	let received = &server.received_requests().await.unwrap();
	let last = received.last().unwrap();
	let sent: serde_json::Value = serde_json::from_slice(&last.body).unwrap();
	assert_eq!(sent["model"], "claude-opus-4");

	// a small request ignores the rule and falls back to priority selection
	let resp = h.engine.handle(messages_request()).await.unwrap();
	assert_eq!(resp.channel_name, "default");
}

#[tokio::test]
async fn session_affinity_sticks_across_requests() {
	let a = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(anthropic_reply()))
		.mount(&a)
		.await;
	let b = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(anthropic_reply()))
		.mount(&b)
		.await;

	let h = harness();
	h.engine.balancer().set_strategy(Strategy::RoundRobin);
	add_channel(&h, "one", 50, &a.uri());
	add_channel(&h, "two", 50, &b.uri());

	let request_with_session = || {
		let body = json!({
			"model": "claude-sonnet-4",
			"messages": [{"role": "user", "content": "Hello"}],
			"max_tokens": 64
		});
		let mut headers = HeaderMap::new();
		headers.insert("x-session-id", "session-1".parse().unwrap());
		parse_request(
			"POST",
			"/v1/messages",
			&headers,
			Bytes::from(serde_json::to_vec(&body).unwrap()),
		)
	};

	let first = h.engine.handle(request_with_session()).await.unwrap();
	for _ in 0..4 {
		let next = h.engine.handle(request_with_session()).await.unwrap();
		assert_eq!(next.channel_name, first.channel_name);
	}
}

#[tokio::test]
async fn openai_channel_gets_translated_body() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "cmpl-1",
			"model": "gpt-4o",
			"choices": [{"message": {"role": "assistant", "content": "Hi!"}, "finish_reason": "stop"}],
			"usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
		})))
		.mount(&server)
		.await;

	let h = harness();
	h.store
		.create_channel(ChannelInput {
			name: "oai".into(),
			channel_type: ChannelType::Openai,
			base_url: Some(server.uri()),
			api_key: Some("sk-oai".into()),
			models: vec!["claude-sonnet-4".into()],
			priority: Some(50),
			weight: Some(1.0),
			transformers: None,
		})
		.unwrap();

	let body = json!({
		"model": "claude-sonnet-4",
		"system": "You are helpful.",
		"messages": [{"role": "user", "content": "Hello"}],
		"max_tokens": 1024
	});
	let parsed = parse_request(
		"POST",
		"/v1/messages",
		&HeaderMap::new(),
		Bytes::from(serde_json::to_vec(&body).unwrap()),
	);
	let resp = h.engine.handle(parsed).await.unwrap();

	// response came back translated to the canonical shape
	assert_eq!(resp.body["type"], "message");
	assert_eq!(resp.body["content"][0]["text"], "Hi!");
	assert_eq!(resp.body["stop_reason"], "end_turn");

	// the upstream saw the OpenAI dialect with the folded system message
	let received = server.received_requests().await.unwrap();
	let sent: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
	assert_eq!(sent["messages"][0]["role"], "system");
	assert_eq!(sent["messages"][1]["content"], "Hello");
	assert_eq!(received[0].headers.get("authorization").unwrap(), "Bearer sk-oai");
}

#[test]
fn parse_request_cleans_headers_and_extracts_hints() {
	let mut headers = HeaderMap::new();
	headers.insert("host", "proxy.local".parse().unwrap());
	headers.insert("authorization", "Bearer client-key".parse().unwrap());
	headers.insert("x-trace-id", "trace-9".parse().unwrap());
	headers.insert("x-session-id", "sess-1".parse().unwrap());
	headers.insert("accept", "application/json".parse().unwrap());

	let body = json!({"model": "claude-sonnet-4", "messages": []});
	let parsed = parse_request(
		"POST",
		"/v1/messages",
		&headers,
		Bytes::from(serde_json::to_vec(&body).unwrap()),
	);
	assert_eq!(parsed.model.as_deref(), Some("claude-sonnet-4"));
	assert_eq!(parsed.session_id.as_deref(), Some("sess-1"));
	assert_eq!(parsed.trace_id.as_deref(), Some("trace-9"));
	assert!(parsed.headers.get("host").is_none());
	assert!(parsed.headers.get("authorization").is_none());
	assert!(parsed.headers.get("x-session-id").is_none());
	assert_eq!(parsed.headers.get("accept").unwrap(), "application/json");
}

#[test]
fn parse_request_tolerates_non_json_body() {
	let parsed = parse_request(
		"POST",
		"/v1/messages",
		&HeaderMap::new(),
		Bytes::from_static(b"not json"),
	);
	assert!(parsed.body.is_none());
	assert_eq!(parsed.raw_body, Bytes::from_static(b"not json"));
	assert!(parsed.model.is_none());
}
