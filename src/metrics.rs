use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tracing::warn;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const DEFAULT_SUMMARY_WINDOW: usize = 1000;
const DEFAULT_QUANTILES: &[f64] = &[0.5, 0.9, 0.95, 0.99];

pub type Labels<'a> = &'a [(&'a str, &'a str)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	Counter,
	Gauge,
	Histogram,
	Summary,
}

impl Kind {
	fn as_str(&self) -> &'static str {
		match self {
			Kind::Counter => "counter",
			Kind::Gauge => "gauge",
			Kind::Histogram => "histogram",
			Kind::Summary => "summary",
		}
	}
}

struct HistogramState {
	/// One cumulative count per configured bucket, plus the implicit +Inf slot
	/// at the end.
	counts: Vec<u64>,
	sum: f64,
	count: u64,
}

struct SummaryState {
	window: VecDeque<f64>,
	sum: f64,
	count: u64,
}

enum FamilyData {
	Counter(Mutex<HashMap<String, f64>>),
	Gauge(Mutex<HashMap<String, f64>>),
	Histogram {
		buckets: Vec<f64>,
		series: Mutex<HashMap<String, HistogramState>>,
	},
	Summary {
		window: usize,
		quantiles: Vec<f64>,
		series: Mutex<HashMap<String, SummaryState>>,
	},
}

struct Family {
	help: String,
	data: FamilyData,
}

/// Metric registry: counters, gauges, histograms and summaries keyed by name,
/// each with labeled series keyed by a canonical serialization of the label
/// set (sorted by key).
pub struct Registry {
	started: Instant,
	families: RwLock<BTreeMap<String, Family>>,
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

/// Escapes a label value per the Prometheus text format: backslash, quote and
/// newline.
fn escape_label(v: &str) -> String {
	v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn canonical_labels(labels: Labels) -> String {
	let mut sorted: Vec<_> = labels.to_vec();
	sorted.sort_by(|a, b| a.0.cmp(b.0));
	let mut out = String::new();
	for (i, (k, v)) in sorted.iter().enumerate() {
		if i > 0 {
			out.push(',');
		}
		let _ = write!(out, "{k}=\"{}\"", escape_label(v));
	}
	out
}

/// Prometheus renders integral values without a trailing `.0`.
fn fmt_value(v: f64) -> String {
	if v.fract() == 0.0 && v.abs() < 1e15 {
		format!("{}", v as i64)
	} else {
		format!("{v}")
	}
}

fn fmt_le(bound: f64) -> String {
	if bound.is_infinite() { "+Inf".to_string() } else { fmt_value(bound) }
}

impl Registry {
	pub fn new() -> Self {
		Registry {
			started: Instant::now(),
			families: RwLock::new(BTreeMap::new()),
		}
	}

	/// A registry with every metric the pipeline emits pre-registered.
	pub fn with_defaults() -> Self {
		let r = Self::new();
		r.register_counter("routex_requests_total", "Total proxied requests");
		r.register_counter("routex_requests_success_total", "Successfully proxied requests");
		r.register_counter("routex_requests_failure_total", "Failed proxied requests");
		r.register_counter("routex_input_tokens_total", "Total input tokens forwarded");
		r.register_counter("routex_output_tokens_total", "Total output tokens returned");
		r.register_counter("routex_cached_tokens_total", "Total cached tokens reported");
		r.register_histogram(
			"routex_request_duration_ms",
			"Proxied request duration in milliseconds",
			vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0],
		);
		r.register_gauge("routex_channels", "Configured channels");
		r.register_gauge("routex_channels_enabled", "Channels currently enabled");
		r.register_gauge(
			"routex_circuit_breaker_open",
			"1 when the channel's circuit breaker is open",
		);
		r.register_counter(
			"routex_circuit_breaker_trips_total",
			"Circuit breaker open transitions",
		);
		r.register_counter(
			"routex_retry_exhausted_total",
			"Requests that exhausted all retry attempts",
		);
		r.register_counter("routex_tee_failed_total", "Failed tee deliveries");
		r.register_counter("routex_cache_hits_total", "Row cache hits");
		r.register_counter("routex_cache_misses_total", "Row cache misses");
		r.register_gauge("routex_uptime_seconds", "Process uptime in seconds");
		r.register_gauge("routex_memory_bytes", "Process memory by region");
		r
	}

	pub fn register_counter(&self, name: &str, help: &str) {
		self.register(name, help, FamilyData::Counter(Mutex::new(HashMap::new())));
	}

	pub fn register_gauge(&self, name: &str, help: &str) {
		self.register(name, help, FamilyData::Gauge(Mutex::new(HashMap::new())));
	}

	pub fn register_histogram(&self, name: &str, help: &str, mut buckets: Vec<f64>) {
		buckets.sort_by(|a, b| a.partial_cmp(b).expect("finite bucket bounds"));
		self.register(
			name,
			help,
			FamilyData::Histogram { buckets, series: Mutex::new(HashMap::new()) },
		);
	}

	pub fn register_summary(&self, name: &str, help: &str, quantiles: Vec<f64>, window: usize) {
		let quantiles = if quantiles.is_empty() { DEFAULT_QUANTILES.to_vec() } else { quantiles };
		let window = if window == 0 { DEFAULT_SUMMARY_WINDOW } else { window };
		self.register(
			name,
			help,
			FamilyData::Summary { window, quantiles, series: Mutex::new(HashMap::new()) },
		);
	}

	fn register(&self, name: &str, help: &str, data: FamilyData) {
		let mut families = self.families.write();
		families
			.entry(name.to_string())
			.or_insert_with(|| Family { help: help.to_string(), data });
	}

	pub fn increment(&self, name: &str, delta: f64, labels: Labels) {
		if delta < 0.0 {
			warn!(metric = name, delta, "ignoring negative counter increment");
			return;
		}
		let families = self.families.read();
		match families.get(name).map(|f| &f.data) {
			Some(FamilyData::Counter(series)) => {
				*series.lock().entry(canonical_labels(labels)).or_insert(0.0) += delta;
			},
			Some(_) => warn!(metric = name, "increment on non-counter"),
			None => warn!(metric = name, "increment on unregistered metric"),
		}
	}

	pub fn set_gauge(&self, name: &str, value: f64, labels: Labels) {
		self.gauge_op(name, labels, |v| *v = value);
	}

	pub fn inc_gauge(&self, name: &str, delta: f64, labels: Labels) {
		self.gauge_op(name, labels, |v| *v += delta);
	}

	pub fn dec_gauge(&self, name: &str, delta: f64, labels: Labels) {
		self.gauge_op(name, labels, |v| *v -= delta);
	}

	fn gauge_op(&self, name: &str, labels: Labels, op: impl FnOnce(&mut f64)) {
		let families = self.families.read();
		match families.get(name).map(|f| &f.data) {
			Some(FamilyData::Gauge(series)) => {
				op(series.lock().entry(canonical_labels(labels)).or_insert(0.0));
			},
			Some(_) => warn!(metric = name, "gauge op on non-gauge"),
			None => warn!(metric = name, "gauge op on unregistered metric"),
		}
	}

	pub fn observe(&self, name: &str, value: f64, labels: Labels) {
		let families = self.families.read();
		match families.get(name).map(|f| &f.data) {
			Some(FamilyData::Histogram { buckets, series }) => {
				let mut series = series.lock();
				let state = series.entry(canonical_labels(labels)).or_insert_with(|| {
					HistogramState { counts: vec![0; buckets.len() + 1], sum: 0.0, count: 0 }
				});
				// cumulative: every bucket with an upper bound >= value, plus +Inf
				for (i, bound) in buckets.iter().enumerate() {
					if value <= *bound {
						state.counts[i] += 1;
					}
				}
				*state.counts.last_mut().expect("+Inf slot") += 1;
				state.sum += value;
				state.count += 1;
			},
			Some(FamilyData::Summary { window, series, .. }) => {
				let mut series = series.lock();
				let state = series.entry(canonical_labels(labels)).or_insert_with(|| {
					SummaryState { window: VecDeque::new(), sum: 0.0, count: 0 }
				});
				state.window.push_back(value);
				while state.window.len() > *window {
					state.window.pop_front();
				}
				state.sum += value;
				state.count += 1;
			},
			Some(_) => warn!(metric = name, "observe on non-histogram/summary"),
			None => warn!(metric = name, "observe on unregistered metric"),
		}
	}

	pub fn uptime_seconds(&self) -> f64 {
		self.started.elapsed().as_secs_f64()
	}

	fn refresh_runtime_gauges(&self) {
		self.set_gauge("routex_uptime_seconds", self.uptime_seconds(), &[]);
		for (region, bytes) in read_memory_regions() {
			self.set_gauge("routex_memory_bytes", bytes as f64, &[("region", region)]);
		}
	}

	/// Prometheus 0.0.4 text exposition.
	pub fn render(&self) -> String {
		self.refresh_runtime_gauges();
		let families = self.families.read();
		let mut out = String::new();
		for (name, family) in families.iter() {
			let kind = match &family.data {
				FamilyData::Counter(_) => Kind::Counter,
				FamilyData::Gauge(_) => Kind::Gauge,
				FamilyData::Histogram { .. } => Kind::Histogram,
				FamilyData::Summary { .. } => Kind::Summary,
			};
			let _ = writeln!(out, "# HELP {name} {}", family.help);
			let _ = writeln!(out, "# TYPE {name} {}", kind.as_str());
			match &family.data {
				FamilyData::Counter(series) | FamilyData::Gauge(series) => {
					let series = series.lock();
					let mut keys: Vec<_> = series.keys().cloned().collect();
					keys.sort();
					for key in keys {
						let value = series[&key];
						if key.is_empty() {
							let _ = writeln!(out, "{name} {}", fmt_value(value));
						} else {
							let _ = writeln!(out, "{name}{{{key}}} {}", fmt_value(value));
						}
					}
				},
				FamilyData::Histogram { buckets, series } => {
					let series = series.lock();
					let mut keys: Vec<_> = series.keys().cloned().collect();
					keys.sort();
					for key in keys {
						let state = &series[&key];
						let sep = if key.is_empty() { "" } else { "," };
						for (i, bound) in buckets.iter().enumerate() {
							let _ = writeln!(
								out,
								"{name}_bucket{{{key}{sep}le=\"{}\"}} {}",
								fmt_le(*bound),
								state.counts[i]
							);
						}
						let _ = writeln!(
							out,
							"{name}_bucket{{{key}{sep}le=\"+Inf\"}} {}",
							state.counts.last().expect("+Inf slot")
						);
						let suffix = if key.is_empty() {
							String::new()
						} else {
							format!("{{{key}}}")
						};
						let _ = writeln!(out, "{name}_sum{suffix} {}", fmt_value(state.sum));
						let _ = writeln!(out, "{name}_count{suffix} {}", state.count);
					}
				},
				FamilyData::Summary { quantiles, series, .. } => {
					let series = series.lock();
					let mut keys: Vec<_> = series.keys().cloned().collect();
					keys.sort();
					for key in keys {
						let state = &series[&key];
						let mut window: Vec<f64> = state.window.iter().copied().collect();
						window.sort_by(|a, b| a.partial_cmp(b).expect("finite observations"));
						let sep = if key.is_empty() { "" } else { "," };
						for q in quantiles {
							let value = quantile(&window, *q);
							let _ = writeln!(
								out,
								"{name}{{{key}{sep}quantile=\"{q}\"}} {}",
								fmt_value(value)
							);
						}
						let suffix = if key.is_empty() {
							String::new()
						} else {
							format!("{{{key}}}")
						};
						let _ = writeln!(out, "{name}_sum{suffix} {}", fmt_value(state.sum));
						let _ = writeln!(out, "{name}_count{suffix} {}", state.count);
					}
				},
			}
		}
		out
	}

	/// JSON view for the admin API.
	pub fn snapshot(&self) -> Value {
		self.refresh_runtime_gauges();
		let families = self.families.read();
		let mut out = serde_json::Map::new();
		for (name, family) in families.iter() {
			let series_json = match &family.data {
				FamilyData::Counter(series) | FamilyData::Gauge(series) => {
					let series = series.lock();
					series
						.iter()
						.map(|(labels, value)| json!({"labels": labels, "value": value}))
						.collect::<Vec<_>>()
				},
				FamilyData::Histogram { buckets, series } => {
					let series = series.lock();
					series
						.iter()
						.map(|(labels, st)| {
							json!({
								"labels": labels,
								"sum": st.sum,
								"count": st.count,
								"buckets": buckets
									.iter()
									.zip(st.counts.iter())
									.map(|(b, c)| json!({"le": b, "count": c}))
									.collect::<Vec<_>>(),
							})
						})
						.collect()
				},
				FamilyData::Summary { quantiles, series, .. } => {
					let series = series.lock();
					series
						.iter()
						.map(|(labels, st)| {
							let mut window: Vec<f64> = st.window.iter().copied().collect();
							window
								.sort_by(|a, b| a.partial_cmp(b).expect("finite observations"));
							json!({
								"labels": labels,
								"sum": st.sum,
								"count": st.count,
								"quantiles": quantiles
									.iter()
									.map(|q| json!({"quantile": q, "value": quantile(&window, *q)}))
									.collect::<Vec<_>>(),
							})
						})
						.collect()
				},
			};
			let kind = match &family.data {
				FamilyData::Counter(_) => Kind::Counter,
				FamilyData::Gauge(_) => Kind::Gauge,
				FamilyData::Histogram { .. } => Kind::Histogram,
				FamilyData::Summary { .. } => Kind::Summary,
			};
			out.insert(
				name.clone(),
				json!({"type": kind.as_str(), "help": family.help, "series": series_json}),
			);
		}
		Value::Object(out)
	}

	/// Clears all recorded series; registrations survive.
	pub fn reset(&self) {
		let families = self.families.read();
		for family in families.values() {
			match &family.data {
				FamilyData::Counter(s) | FamilyData::Gauge(s) => s.lock().clear(),
				FamilyData::Histogram { series, .. } => series.lock().clear(),
				FamilyData::Summary { series, .. } => series.lock().clear(),
			}
		}
	}

}

/// Nearest-rank quantile over a sorted window.
fn quantile(sorted: &[f64], q: f64) -> f64 {
	if sorted.is_empty() {
		return 0.0;
	}
	let rank = (q * sorted.len() as f64).ceil() as usize;
	sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Reads per-region memory byte counts for the current process. Best-effort;
/// empty on platforms without /proc.
fn read_memory_regions() -> Vec<(&'static str, u64)> {
	let mut out = Vec::new();
	if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
		for (field, region) in [("VmRSS:", "rss"), ("VmSize:", "virtual"), ("VmHWM:", "peak_rss")] {
			if let Some(line) = status.lines().find(|l| l.starts_with(field)) {
				let kb: u64 = line
					.split_whitespace()
					.nth(1)
					.and_then(|v| v.parse().ok())
					.unwrap_or(0);
				out.push((region, kb * 1024));
			}
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counter_renders_one_line_per_label_set() {
		let r = Registry::new();
		r.register_counter("requests_total", "total requests");
		r.increment("requests_total", 1.0, &[("channel", "a")]);
		r.increment("requests_total", 2.0, &[("channel", "b")]);
		r.increment("requests_total", 1.0, &[("channel", "a")]);
		let text = r.render();
		assert!(text.contains("# HELP requests_total total requests"));
		assert!(text.contains("# TYPE requests_total counter"));
		assert_eq!(
			text.lines().filter(|l| *l == r#"requests_total{channel="a"} 2"#).count(),
			1
		);
		assert_eq!(
			text.lines().filter(|l| *l == r#"requests_total{channel="b"} 2"#).count(),
			1
		);
	}

	#[test]
	fn counter_ignores_negative_delta() {
		let r = Registry::new();
		r.register_counter("c", "");
		r.increment("c", 5.0, &[]);
		r.increment("c", -3.0, &[]);
		assert!(r.render().contains("\nc 5\n"));
	}

	#[test]
	fn labels_are_canonicalized_by_sorted_key() {
		let r = Registry::new();
		r.register_counter("c", "");
		r.increment("c", 1.0, &[("b", "2"), ("a", "1")]);
		r.increment("c", 1.0, &[("a", "1"), ("b", "2")]);
		assert!(r.render().contains(r#"c{a="1",b="2"} 2"#));
	}

	#[test]
	fn label_values_escaped() {
		let r = Registry::new();
		r.register_gauge("g", "");
		r.set_gauge("g", 1.0, &[("path", "a\\b\"c\nd")]);
		assert!(r.render().contains(r#"g{path="a\\b\"c\nd"} 1"#));
	}

	#[test]
	fn histogram_buckets_are_cumulative() {
		let r = Registry::new();
		r.register_histogram("lat", "latency", vec![10.0, 100.0]);
		r.observe("lat", 5.0, &[]);
		r.observe("lat", 50.0, &[]);
		r.observe("lat", 500.0, &[]);
		let text = r.render();
		assert!(text.contains(r#"lat_bucket{le="10"} 1"#));
		assert!(text.contains(r#"lat_bucket{le="100"} 2"#));
		assert!(text.contains(r#"lat_bucket{le="+Inf"} 3"#));
		assert!(text.contains("lat_sum 555"));
		assert!(text.contains("lat_count 3"));
	}

	#[test]
	fn histogram_without_buckets_still_has_inf() {
		let r = Registry::new();
		r.register_histogram("h", "", vec![]);
		r.observe("h", 1.0, &[]);
		let text = r.render();
		assert!(text.contains(r#"h_bucket{le="+Inf"} 1"#));
		assert!(text.contains("h_count 1"));
	}

	#[test]
	fn summary_quantiles_from_window() {
		let r = Registry::new();
		r.register_summary("s", "", vec![0.5, 0.99], 1000);
		for v in 1..=100 {
			r.observe("s", v as f64, &[]);
		}
		let text = r.render();
		assert!(text.contains(r#"s{quantile="0.5"} 50"#));
		assert!(text.contains(r#"s{quantile="0.99"} 99"#));
		assert!(text.contains("s_count 100"));
	}

	#[test]
	fn summary_window_slides() {
		let r = Registry::new();
		r.register_summary("s", "", vec![0.5], 10);
		for v in 1..=100 {
			r.observe("s", v as f64, &[]);
		}
		// only the last 10 observations (91..=100) remain in the window
		let text = r.render();
		assert!(text.contains(r#"s{quantile="0.5"} 96"#) || text.contains(r#"s{quantile="0.5"} 95"#));
		// count is lifetime, not window
		assert!(text.contains("s_count 100"));
	}

	#[test]
	fn reset_clears_series_not_registrations() {
		let r = Registry::new();
		r.register_counter("c", "help");
		r.increment("c", 3.0, &[]);
		r.reset();
		let text = r.render();
		assert!(text.contains("# TYPE c counter"));
		assert!(!text.contains("\nc 3"));
		r.increment("c", 1.0, &[]);
		assert!(r.render().contains("\nc 1"));
	}

	#[test]
	fn gauge_inc_dec() {
		let r = Registry::new();
		r.register_gauge("g", "");
		r.set_gauge("g", 5.0, &[]);
		r.inc_gauge("g", 2.0, &[]);
		r.dec_gauge("g", 3.0, &[]);
		assert!(r.render().contains("\ng 4\n"));
	}
}
