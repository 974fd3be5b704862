use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::AppState;
use crate::errors::Error;
use crate::proxy::parse_request;

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// `/v1/*`: the pass-through proxy. Any method; the engine decides the rest.
pub async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
	// optional shared-secret boundary
	if let Some(secret) = &state.config.master_password {
		let presented = req
			.headers()
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer "))
			.or_else(|| req.headers().get("x-routex-key").and_then(|v| v.to_str().ok()));
		if presented != Some(secret.as_str()) {
			return Error::Authentication("missing or invalid proxy credential".into())
				.into_response();
		}
	}

	let (parts, body) = req.into_parts();
	let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
		Ok(bytes) => bytes,
		Err(e) => {
			return Error::Validation(format!("request body read failed: {e}")).into_response();
		},
	};
	let parsed = parse_request(parts.method.as_str(), parts.uri.path(), &parts.headers, bytes);

	match state.engine.handle(parsed).await {
		Ok(resp) => {
			let mut response = Response::builder()
				.status(StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK))
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(resp.body.to_string()))
				.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
			let headers = response.headers_mut();
			let set = |headers: &mut axum::http::HeaderMap, name: &'static str, value: &str| {
				if let Ok(v) = HeaderValue::from_str(value) {
					headers.insert(name, v);
				}
			};
			set(headers, "x-channel-id", &resp.channel_id);
			set(headers, "x-channel-name", &resp.channel_name);
			set(headers, "x-latency-ms", &resp.latency_ms.to_string());
			set(headers, "x-trace-id", &resp.trace_id);
			set(headers, "x-span-id", &resp.span_id);
			if let Some(rule) = &resp.rule_name {
				set(headers, "x-routing-rule", rule);
			}
			response
		},
		Err(e) => e.into_response(),
	}
}
