use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::config::Config;

fn test_app() -> (AppState, Router) {
	let app = App::build_in_memory(Config::default()).unwrap();
	let router = build_router(app.clone());
	(app, router)
}

async fn body_json(response: axum::response::Response) -> Value {
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
	serde_json::from_slice(&bytes).unwrap()
}

async fn request(
	router: &Router,
	method: &str,
	uri: &str,
	body: Option<Value>,
) -> axum::response::Response {
	let mut builder = Request::builder().method(method).uri(uri);
	let body = match body {
		Some(v) => {
			builder = builder.header("content-type", "application/json");
			Body::from(v.to_string())
		},
		None => Body::empty(),
	};
	router.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
}

fn channel_body(name: &str) -> Value {
	json!({
		"name": name,
		"type": "anthropic",
		"apiKey": "sk-test",
		"models": ["claude-sonnet-4"],
		"priority": 50
	})
}

#[tokio::test]
async fn identity_endpoint() {
	let (_, router) = test_app();
	let resp = request(&router, "GET", "/api", None).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let body = body_json(resp).await;
	assert_eq!(body["success"], true);
	assert_eq!(body["data"]["name"], "routex");
	assert_eq!(body["data"]["strategy"], "priority");
}

#[tokio::test]
async fn ready_reflects_enabled_channels() {
	let (_, router) = test_app();
	let resp = request(&router, "GET", "/health/ready", None).await;
	assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

	let resp = request(&router, "POST", "/api/channels", Some(channel_body("up"))).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = request(&router, "GET", "/health/ready", None).await;
	assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn channel_crud_over_http() {
	let (_, router) = test_app();
	let resp = request(&router, "POST", "/api/channels", Some(channel_body("primary"))).await;
	let created = body_json(resp).await;
	assert_eq!(created["success"], true);
	let id = created["data"]["id"].as_str().unwrap().to_string();

	let resp = request(&router, "GET", "/api/channels", None).await;
	let listed = body_json(resp).await;
	assert_eq!(listed["data"].as_array().unwrap().len(), 1);

	let resp = request(
		&router,
		"PUT",
		&format!("/api/channels/{id}"),
		Some(json!({"priority": 90})),
	)
	.await;
	let updated = body_json(resp).await;
	assert_eq!(updated["data"]["priority"], 90);

	let resp = request(&router, "DELETE", &format!("/api/channels/{id}"), None).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = request(&router, "GET", &format!("/api/channels/{id}"), None).await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	let error = body_json(resp).await;
	assert_eq!(error["success"], false);
	assert_eq!(error["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn invalid_channel_body_is_400() {
	let (_, router) = test_app();
	let resp = request(
		&router,
		"POST",
		"/api/channels",
		Some(json!({"name": "x", "type": "anthropic", "models": []})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	let body = body_json(resp).await;
	assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn every_response_carries_request_id() {
	let (_, router) = test_app();
	let resp = request(&router, "GET", "/health", None).await;
	assert!(resp.headers().contains_key("x-request-id"));

	let echoed = router
		.clone()
		.oneshot(
			Request::builder()
				.uri("/health")
				.header("x-request-id", "req-42")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(echoed.headers().get("x-request-id").unwrap(), "req-42");
}

#[tokio::test]
async fn strategy_round_trip() {
	let (_, router) = test_app();
	let resp = request(
		&router,
		"PUT",
		"/api/load-balancer/strategy",
		Some(json!({"strategy": "round_robin"})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = request(&router, "GET", "/api/strategy", None).await;
	let body = body_json(resp).await;
	assert_eq!(body["data"]["strategy"], "round_robin");

	let resp = request(
		&router,
		"PUT",
		"/api/strategy",
		Some(json!({"strategy": "fastest"})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn locale_round_trip() {
	let (_, router) = test_app();
	let resp = request(&router, "PUT", "/api/i18n/locale", Some(json!({"locale": "zh-CN"}))).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let resp = request(&router, "GET", "/api/i18n/locale", None).await;
	assert_eq!(body_json(resp).await["data"]["locale"], "zh-CN");

	let resp = request(&router, "PUT", "/api/i18n/locale", Some(json!({"locale": "fr"}))).await;
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn prometheus_endpoint_renders_text() {
	let (app, router) = test_app();
	app.metrics.increment("routex_requests_total", 3.0, &[]);
	let resp = request(&router, "GET", "/metrics", None).await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		resp.headers().get("content-type").unwrap(),
		"text/plain; version=0.0.4; charset=utf-8"
	);
	let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
	let text = String::from_utf8(bytes.to_vec()).unwrap();
	assert!(text.contains("# TYPE routex_requests_total counter"));
	assert!(text.contains("routex_requests_total 3"));
	assert!(text.contains("routex_uptime_seconds"));
}

#[tokio::test]
async fn routing_rule_lifecycle_reloads_router() {
	let (app, router) = test_app();
	let resp = request(
		&router,
		"POST",
		"/api/routing/rules",
		Some(json!({
			"name": "kw",
			"condition": {"keywords": ["urgent"]},
			"targetChannel": "primary",
			"priority": 5
		})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::OK);
	let rule_id = body_json(resp).await["data"]["id"].as_str().unwrap().to_string();
	assert_eq!(app.router.rule_count(), 1);

	let resp = request(
		&router,
		"POST",
		&format!("/api/routing/rules/{rule_id}/disable"),
		None,
	)
	.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(app.router.rule_count(), 0);

	let resp = request(
		&router,
		"POST",
		&format!("/api/routing/rules/{rule_id}/enable"),
		None,
	)
	.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(app.router.rule_count(), 1);
}

#[tokio::test]
async fn rule_test_endpoint_dry_runs_condition() {
	let (_, router) = test_app();
	let resp = request(
		&router,
		"POST",
		"/api/routing/rules/test",
		Some(json!({
			"condition": {"keywords": ["deploy"]},
			"request": {
				"model": "claude-sonnet-4",
				"messages": [{"role": "user", "content": "deploy the service"}],
				"max_tokens": 10
			}
		})),
	)
	.await;
	let body = body_json(resp).await;
	assert_eq!(body["data"]["matched"], true);
	assert_eq!(body["data"]["analysis"]["intent"], "chat");
}

#[tokio::test]
async fn tee_crud_refreshes_engine() {
	let (app, router) = test_app();
	let resp = request(
		&router,
		"POST",
		"/api/tee",
		Some(json!({
			"name": "audit",
			"type": "file",
			"filePath": "/tmp/routex-tee.jsonl"
		})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(app.tee.destination_count(), 1);

	let id = {
		let resp = request(&router, "GET", "/api/tee", None).await;
		body_json(resp).await["data"][0]["id"].as_str().unwrap().to_string()
	};
	let resp = request(
		&router,
		"PUT",
		&format!("/api/tee/{id}"),
		Some(json!({"enabled": false})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(app.tee.destination_count(), 0);
}

#[tokio::test]
async fn requests_endpoint_augments_cost_and_meta() {
	let (app, router) = test_app();
	let channel = app
		.store
		.create_channel(crate::types::ChannelInput {
			name: "logged".into(),
			channel_type: crate::types::ChannelType::Anthropic,
			base_url: None,
			api_key: None,
			models: vec!["claude-sonnet-4".into()],
			priority: None,
			weight: None,
			transformers: None,
		})
		.unwrap();
	app.store
		.log_request(crate::types::RequestLogEntry {
			id: crate::types::new_id(),
			channel_id: channel.id,
			model: "claude-sonnet-4".into(),
			method: "POST".into(),
			path: "/v1/messages".into(),
			status_code: 200,
			latency: 88,
			input_tokens: 1_000_000,
			output_tokens: 0,
			cached_tokens: 0,
			success: true,
			error: None,
			timestamp: crate::types::now_ms(),
			trace_id: None,
		})
		.unwrap();
	app.store.flush_requests().unwrap();

	let resp = request(&router, "GET", "/api/requests?limit=10", None).await;
	let body = body_json(resp).await;
	assert_eq!(body["meta"]["total"], 1);
	assert_eq!(body["meta"]["limit"], 10);
	assert_eq!(body["meta"]["offset"], 0);
	// 1M input tokens at $3/M
	assert_eq!(body["data"][0]["cost"], 3.0);
}

#[tokio::test]
async fn proxy_dispatch_sets_channel_headers() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "msg_1",
			"type": "message",
			"role": "assistant",
			"content": [{"type": "text", "text": "Hi!"}],
			"model": "claude-sonnet-4",
			"stop_reason": "end_turn",
			"usage": {"input_tokens": 3, "output_tokens": 1}
		})))
		.mount(&server)
		.await;

	let (_, router) = test_app();
	let resp = request(
		&router,
		"POST",
		"/api/channels",
		Some(json!({
			"name": "upstream",
			"type": "custom",
			"baseUrl": server.uri(),
			"apiKey": "sk-x",
			"models": ["claude-sonnet-4"]
		})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = request(
		&router,
		"POST",
		"/v1/messages",
		Some(json!({
			"model": "claude-sonnet-4",
			"messages": [{"role": "user", "content": "Hello"}],
			"max_tokens": 32
		})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers().get("x-channel-name").unwrap(), "upstream");
	assert!(resp.headers().contains_key("x-trace-id"));
	assert!(resp.headers().contains_key("x-latency-ms"));
	let body = body_json(resp).await;
	assert_eq!(body["content"][0]["text"], "Hi!");
}

#[tokio::test]
async fn proxy_with_no_channels_is_503_envelope() {
	let (_, router) = test_app();
	let resp = request(
		&router,
		"POST",
		"/v1/messages",
		Some(json!({"model": "m", "messages": [], "max_tokens": 1})),
	)
	.await;
	assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	let body = body_json(resp).await;
	assert_eq!(body["error"]["code"], "NO_AVAILABLE_CHANNEL");
}

#[tokio::test]
async fn analytics_endpoint() {
	let (_, router) = test_app();
	let resp = request(&router, "GET", "/api/analytics", None).await;
	let body = body_json(resp).await;
	assert_eq!(body["data"]["totalRequests"], 0);
	assert_eq!(body["data"]["estimatedCost"], 0.0);
}

#[tokio::test]
async fn tracing_endpoints() {
	let (app, router) = test_app();
	let span = app.tracer.start_span("test.span", None, None, Default::default());

	let resp = request(&router, "GET", &format!("/api/tracing/spans/{}", span.span_id), None).await;
	assert_eq!(resp.status(), StatusCode::OK);

	let resp =
		request(&router, "GET", &format!("/api/tracing/traces/{}", span.trace_id), None).await;
	assert_eq!(body_json(resp).await["data"].as_array().unwrap().len(), 1);

	let resp = request(&router, "POST", "/api/tracing/clear", None).await;
	assert_eq!(resp.status(), StatusCode::OK);
	let resp = request(&router, "GET", "/api/tracing/stats", None).await;
	assert_eq!(body_json(resp).await["data"]["spans"], 0);
}

#[tokio::test]
async fn export_import_endpoints() {
	let (_, router) = test_app();
	request(&router, "POST", "/api/channels", Some(channel_body("exported"))).await;
	let resp = request(&router, "GET", "/api/channels/export", None).await;
	let export = body_json(resp).await["data"].clone();
	assert_eq!(export["version"], 1);

	let (_, other) = test_app();
	let resp = request(&other, "POST", "/api/channels/import", Some(export)).await;
	assert_eq!(body_json(resp).await["data"]["imported"], 1);
}
