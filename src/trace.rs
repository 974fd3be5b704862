use std::collections::{HashMap, VecDeque};

use http::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::types::{new_id, now_ms};

pub const DEFAULT_MAX_SPANS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
	Pending,
	Success,
	Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanLog {
	pub timestamp: i64,
	pub message: String,
	pub level: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
	pub trace_id: String,
	pub span_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parent_span_id: Option<String>,
	pub name: String,
	pub start_time: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub end_time: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration: Option<i64>,
	pub status: SpanStatus,
	pub tags: HashMap<String, String>,
	pub logs: Vec<SpanLog>,
}

#[derive(Debug, Clone, Default)]
pub struct TraceContext {
	pub trace_id: Option<String>,
	pub parent_span_id: Option<String>,
}

struct Inner {
	spans: HashMap<String, Span>,
	/// Insertion order for FIFO eviction.
	order: VecDeque<String>,
}

/// In-memory span store bounded by capacity; the oldest inserted span is
/// evicted first. Every request is traced (no sampling).
pub struct Tracer {
	max_spans: usize,
	inner: Mutex<Inner>,
}

impl Default for Tracer {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_SPANS)
	}
}

impl Tracer {
	pub fn new(max_spans: usize) -> Self {
		Tracer {
			max_spans: max_spans.max(1),
			inner: Mutex::new(Inner { spans: HashMap::new(), order: VecDeque::new() }),
		}
	}

	pub fn start_span(
		&self,
		name: &str,
		trace_id: Option<String>,
		parent_span_id: Option<String>,
		tags: HashMap<String, String>,
	) -> Span {
		let span = Span {
			trace_id: trace_id.unwrap_or_else(new_id),
			span_id: new_id(),
			parent_span_id,
			name: name.to_string(),
			start_time: now_ms(),
			end_time: None,
			duration: None,
			status: SpanStatus::Pending,
			tags,
			logs: Vec::new(),
		};
		let mut inner = self.inner.lock();
		while inner.order.len() >= self.max_spans {
			if let Some(oldest) = inner.order.pop_front() {
				inner.spans.remove(&oldest);
			}
		}
		inner.order.push_back(span.span_id.clone());
		inner.spans.insert(span.span_id.clone(), span.clone());
		span
	}

	pub fn end_span(&self, span_id: &str, status: SpanStatus, tags: HashMap<String, String>) {
		let mut inner = self.inner.lock();
		match inner.spans.get_mut(span_id) {
			Some(span) => {
				let end = now_ms();
				span.end_time = Some(end);
				span.duration = Some(end - span.start_time);
				span.status = status;
				span.tags.extend(tags);
			},
			None => warn!(span_id, "end_span on unknown span"),
		}
	}

	pub fn add_tags(&self, span_id: &str, tags: HashMap<String, String>) {
		let mut inner = self.inner.lock();
		match inner.spans.get_mut(span_id) {
			Some(span) => span.tags.extend(tags),
			None => warn!(span_id, "add_tags on unknown span"),
		}
	}

	pub fn add_log(&self, span_id: &str, message: &str, level: &str) {
		let mut inner = self.inner.lock();
		match inner.spans.get_mut(span_id) {
			Some(span) => span.logs.push(SpanLog {
				timestamp: now_ms(),
				message: message.to_string(),
				level: level.to_string(),
			}),
			None => warn!(span_id, "add_log on unknown span"),
		}
	}

	pub fn get_span(&self, span_id: &str) -> Option<Span> {
		self.inner.lock().spans.get(span_id).cloned()
	}

	pub fn get_trace_spans(&self, trace_id: &str) -> Vec<Span> {
		let inner = self.inner.lock();
		let mut spans: Vec<Span> = inner
			.order
			.iter()
			.filter_map(|id| inner.spans.get(id))
			.filter(|s| s.trace_id == trace_id)
			.cloned()
			.collect();
		spans.sort_by_key(|s| s.start_time);
		spans
	}

	pub fn clear_old_spans(&self, older_than_ms: i64) {
		let cutoff = now_ms() - older_than_ms;
		let mut inner = self.inner.lock();
		let keep: Vec<String> = inner
			.order
			.iter()
			.filter(|id| inner.spans.get(*id).map(|s| s.start_time >= cutoff).unwrap_or(false))
			.cloned()
			.collect();
		inner.spans.retain(|_, s| s.start_time >= cutoff);
		inner.order = keep.into();
	}

	pub fn clear(&self) {
		let mut inner = self.inner.lock();
		inner.spans.clear();
		inner.order.clear();
	}

	pub fn span_count(&self) -> usize {
		self.inner.lock().spans.len()
	}

	pub fn stats(&self) -> Value {
		let inner = self.inner.lock();
		let mut traces: HashMap<&str, usize> = HashMap::new();
		let mut pending = 0usize;
		let mut errors = 0usize;
		for span in inner.spans.values() {
			*traces.entry(span.trace_id.as_str()).or_default() += 1;
			match span.status {
				SpanStatus::Pending => pending += 1,
				SpanStatus::Error => errors += 1,
				SpanStatus::Success => {},
			}
		}
		json!({
			"spans": inner.spans.len(),
			"traces": traces.len(),
			"pending": pending,
			"errors": errors,
			"maxSpans": self.max_spans,
		})
	}
}

/// Recognizes `x-trace-id` / `x-request-id` and the W3C `traceparent` header
/// (version-traceId-spanId-flags).
pub fn extract_trace_context(headers: &HeaderMap) -> TraceContext {
	let mut ctx = TraceContext::default();
	if let Some(tp) = headers.get("traceparent").and_then(|v| v.to_str().ok()) {
		let parts: Vec<&str> = tp.split('-').collect();
		if parts.len() >= 4 {
			ctx.trace_id = Some(parts[1].to_string());
			ctx.parent_span_id = Some(parts[2].to_string());
		}
	}
	if let Some(id) = headers.get("x-trace-id").and_then(|v| v.to_str().ok()) {
		ctx.trace_id = Some(id.to_string());
	} else if ctx.trace_id.is_none() {
		if let Some(id) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
			ctx.trace_id = Some(id.to_string());
		}
	}
	ctx
}

pub fn inject_trace_context(headers: &mut HeaderMap, span: &Span) {
	let insert = |headers: &mut HeaderMap, name: &'static str, value: &str| {
		if let Ok(v) = http::HeaderValue::from_str(value) {
			headers.insert(name, v);
		}
	};
	insert(headers, "x-trace-id", &span.trace_id);
	insert(headers, "x-span-id", &span.span_id);
	if let Some(parent) = &span.parent_span_id {
		insert(headers, "x-parent-span-id", parent);
	}
	insert(
		headers,
		"traceparent",
		&format!("00-{}-{}-01", span.trace_id, span.span_id),
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn no_tags() -> HashMap<String, String> {
		HashMap::new()
	}

	#[test]
	fn span_lifecycle() {
		let tracer = Tracer::new(100);
		let span = tracer.start_span("proxy.handle", None, None, no_tags());
		assert_eq!(tracer.get_span(&span.span_id).unwrap().status, SpanStatus::Pending);

		tracer.add_log(&span.span_id, "forwarding", "info");
		tracer.end_span(&span.span_id, SpanStatus::Success, no_tags());

		let done = tracer.get_span(&span.span_id).unwrap();
		assert_eq!(done.status, SpanStatus::Success);
		assert!(done.end_time.is_some());
		assert!(done.duration.unwrap() >= 0);
		assert_eq!(done.logs.len(), 1);
	}

	#[test]
	fn capacity_evicts_oldest_first() {
		let tracer = Tracer::new(3);
		let first = tracer.start_span("a", None, None, no_tags());
		tracer.start_span("b", None, None, no_tags());
		tracer.start_span("c", None, None, no_tags());
		tracer.start_span("d", None, None, no_tags());
		assert_eq!(tracer.span_count(), 3);
		assert!(tracer.get_span(&first.span_id).is_none());
	}

	#[test]
	fn end_unknown_span_is_noop() {
		let tracer = Tracer::new(10);
		tracer.end_span("missing", SpanStatus::Error, no_tags());
		assert_eq!(tracer.span_count(), 0);
	}

	#[test]
	fn trace_groups_spans() {
		let tracer = Tracer::new(10);
		let root = tracer.start_span("root", None, None, no_tags());
		tracer.start_span(
			"child",
			Some(root.trace_id.clone()),
			Some(root.span_id.clone()),
			no_tags(),
		);
		tracer.start_span("other", None, None, no_tags());
		assert_eq!(tracer.get_trace_spans(&root.trace_id).len(), 2);
	}

	#[test]
	fn extracts_traceparent() {
		let mut headers = HeaderMap::new();
		headers.insert(
			"traceparent",
			"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".parse().unwrap(),
		);
		let ctx = extract_trace_context(&headers);
		assert_eq!(ctx.trace_id.as_deref(), Some("0af7651916cd43dd8448eb211c80319c"));
		assert_eq!(ctx.parent_span_id.as_deref(), Some("b7ad6b7169203331"));
	}

	#[test]
	fn x_trace_id_wins_over_traceparent() {
		let mut headers = HeaderMap::new();
		headers.insert("traceparent", "00-aaaa-bbbb-01".parse().unwrap());
		headers.insert("x-trace-id", "custom".parse().unwrap());
		let ctx = extract_trace_context(&headers);
		assert_eq!(ctx.trace_id.as_deref(), Some("custom"));
	}

	#[test]
	fn inject_writes_all_headers() {
		let tracer = Tracer::new(10);
		let span = tracer.start_span("s", Some("t1".into()), Some("p1".into()), no_tags());
		let mut headers = HeaderMap::new();
		inject_trace_context(&mut headers, &span);
		assert_eq!(headers.get("x-trace-id").unwrap(), "t1");
		assert_eq!(headers.get("x-parent-span-id").unwrap(), "p1");
		let tp = headers.get("traceparent").unwrap().to_str().unwrap();
		assert!(tp.starts_with("00-t1-"));
		assert!(tp.ends_with("-01"));
	}
}
