use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::Registry;
use crate::types::{TeeDestination, TeeFilter, TeeType};

const QUEUE_CAPACITY: usize = 1024;
const MAX_TIMEOUT: Duration = Duration::from_secs(30);

/// One forwarded request/response pair offered to the tee sinks.
#[derive(Debug, Clone)]
pub struct TeeEvent {
	pub channel_id: String,
	pub channel_name: String,
	pub model: String,
	pub status_code: u16,
	pub latency_ms: u64,
	pub success: bool,
	pub request: Value,
	pub response: Value,
	pub timestamp: i64,
	pub trace_id: Option<String>,
}

impl TeeEvent {
	fn payload(&self) -> Value {
		json!({
			"channelId": self.channel_id,
			"channel": self.channel_name,
			"model": self.model,
			"statusCode": self.status_code,
			"latencyMs": self.latency_ms,
			"success": self.success,
			"request": self.request,
			"response": self.response,
			"timestamp": self.timestamp,
			"traceId": self.trace_id,
		})
	}
}

pub type CustomTeeHandler = Arc<dyn Fn(&TeeEvent) + Send + Sync>;

/// Best-effort fan-out of request/response pairs to configured destinations
/// through a bounded worker pool. Delivery never affects the client response;
/// failures only count against `routex_tee_failed_total`.
pub struct TeeStream {
	destinations: Arc<RwLock<Vec<TeeDestination>>>,
	tx: mpsc::Sender<TeeEvent>,
	metrics: Arc<Registry>,
}

impl TeeStream {
	pub fn new(workers: usize, metrics: Arc<Registry>) -> Self {
		Self::with_handlers(workers, metrics, HashMap::new())
	}

	pub fn with_handlers(
		workers: usize,
		metrics: Arc<Registry>,
		custom_handlers: HashMap<String, CustomTeeHandler>,
	) -> Self {
		let (tx, rx) = mpsc::channel::<TeeEvent>(QUEUE_CAPACITY);
		let destinations: Arc<RwLock<Vec<TeeDestination>>> = Arc::new(RwLock::new(Vec::new()));
		let rx = Arc::new(tokio::sync::Mutex::new(rx));
		let client = reqwest::Client::new();
		let custom_handlers = Arc::new(custom_handlers);
		for _ in 0..workers.max(1) {
			let rx = rx.clone();
			let destinations = destinations.clone();
			let client = client.clone();
			let metrics = metrics.clone();
			let custom_handlers = custom_handlers.clone();
			tokio::spawn(async move {
				loop {
					let event = {
						let mut rx = rx.lock().await;
						rx.recv().await
					};
					let Some(event) = event else { break };
					let targets: Vec<TeeDestination> = destinations
						.read()
						.iter()
						.filter(|d| d.enabled && matches_filter(d.filter.as_ref(), &event))
						.cloned()
						.collect();
					for dest in targets {
						deliver(&client, &dest, &event, &metrics, &custom_handlers).await;
					}
				}
			});
		}
		TeeStream { destinations, tx, metrics }
	}

	/// Replaces the destination snapshot; called on startup and after every
	/// tee admin write.
	pub fn refresh(&self, destinations: Vec<TeeDestination>) {
		*self.destinations.write() = destinations;
	}

	pub fn destination_count(&self) -> usize {
		self.destinations.read().len()
	}

	/// Enqueues an event without ever blocking the request path; a full
	/// queue drops the event.
	pub fn send(&self, event: TeeEvent) {
		if self.destinations.read().is_empty() {
			return;
		}
		if let Err(e) = self.tx.try_send(event) {
			warn!(error = %e, "tee queue full, dropping event");
			self.metrics.increment("routex_tee_failed_total", 1.0, &[("reason", "queue_full")]);
		}
	}
}

pub fn matches_filter(filter: Option<&TeeFilter>, event: &TeeEvent) -> bool {
	let Some(filter) = filter else { return true };
	if let Some(codes) = &filter.status_codes {
		if !codes.contains(&event.status_code) {
			return false;
		}
	}
	if let Some(channels) = &filter.channels {
		if !channels.iter().any(|c| c == &event.channel_id || c == &event.channel_name) {
			return false;
		}
	}
	if let Some(models) = &filter.models {
		if !models.contains(&event.model) {
			return false;
		}
	}
	if let Some(min) = filter.min_latency_ms {
		if event.latency_ms < min {
			return false;
		}
	}
	if let Some(max) = filter.max_latency_ms {
		if event.latency_ms > max {
			return false;
		}
	}
	if filter.success_only.unwrap_or(false) && !event.success {
		return false;
	}
	if filter.failure_only.unwrap_or(false) && event.success {
		return false;
	}
	true
}

async fn deliver(
	client: &reqwest::Client,
	dest: &TeeDestination,
	event: &TeeEvent,
	metrics: &Registry,
	custom_handlers: &HashMap<String, CustomTeeHandler>,
) {
	let attempts = dest.retries + 1;
	let timeout = Duration::from_millis(dest.timeout_ms).min(MAX_TIMEOUT);
	for attempt in 1..=attempts {
		let result = match dest.tee_type {
			TeeType::Webhook => deliver_webhook(client, dest, event, timeout).await,
			TeeType::File => deliver_file(dest, event).await,
			TeeType::Custom => match dest.custom_handler.as_deref().and_then(|h| custom_handlers.get(h))
			{
				Some(handler) => {
					handler(event);
					Ok(())
				},
				None => Err(format!(
					"unknown custom tee handler {:?}",
					dest.custom_handler.as_deref().unwrap_or("")
				)),
			},
		};
		match result {
			Ok(()) => {
				debug!(destination = %dest.name, attempt, "tee delivered");
				return;
			},
			Err(e) if attempt < attempts => {
				debug!(destination = %dest.name, attempt, error = %e, "tee delivery retrying");
			},
			Err(e) => {
				warn!(destination = %dest.name, error = %e, "tee delivery failed");
				metrics.increment(
					"routex_tee_failed_total",
					1.0,
					&[("destination", dest.name.as_str())],
				);
			},
		}
	}
}

async fn deliver_webhook(
	client: &reqwest::Client,
	dest: &TeeDestination,
	event: &TeeEvent,
	timeout: Duration,
) -> Result<(), String> {
	let url = dest.url.as_deref().ok_or("webhook destination without url")?;
	let method = dest
		.method
		.as_deref()
		.unwrap_or("POST")
		.parse::<reqwest::Method>()
		.map_err(|e| e.to_string())?;
	let mut req = client.request(method, url).timeout(timeout).json(&event.payload());
	for (name, value) in dest.headers.iter().flatten() {
		req = req.header(name, value);
	}
	let resp = req.send().await.map_err(|e| e.to_string())?;
	if resp.status().is_success() {
		Ok(())
	} else {
		Err(format!("webhook returned {}", resp.status()))
	}
}

async fn deliver_file(dest: &TeeDestination, event: &TeeEvent) -> Result<(), String> {
	let path = dest.file_path.as_deref().ok_or("file destination without filePath")?;
	let mut line = event.payload().to_string();
	line.push('\n');
	let mut file = tokio::fs::OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.await
		.map_err(|e| e.to_string())?;
	file.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
	Ok(())
}
