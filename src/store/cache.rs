use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::metrics::Registry;
use crate::types::{Channel, RoutingRule};

/// Read-through TTL cache for channel rows and the enabled-rule list.
/// Write paths invalidate; hit/miss counts feed the metrics registry.
pub struct RowCache {
	ttl: Duration,
	channels_by_id: Mutex<HashMap<String, (Channel, Instant)>>,
	channels_by_name: Mutex<HashMap<String, (Channel, Instant)>>,
	enabled_rules: Mutex<Option<(Vec<RoutingRule>, Instant)>>,
	hits: AtomicU64,
	misses: AtomicU64,
	metrics: Arc<Registry>,
}

impl RowCache {
	pub fn new(ttl: Duration, metrics: Arc<Registry>) -> Self {
		RowCache {
			ttl,
			channels_by_id: Mutex::new(HashMap::new()),
			channels_by_name: Mutex::new(HashMap::new()),
			enabled_rules: Mutex::new(None),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			metrics,
		}
	}

	fn hit(&self) {
		self.hits.fetch_add(1, Ordering::Relaxed);
		self.metrics.increment("routex_cache_hits_total", 1.0, &[]);
	}

	fn miss(&self) {
		self.misses.fetch_add(1, Ordering::Relaxed);
		self.metrics.increment("routex_cache_misses_total", 1.0, &[]);
	}

	pub fn get_channel(&self, id: &str) -> Option<Channel> {
		let map = self.channels_by_id.lock();
		match map.get(id) {
			Some((ch, at)) if at.elapsed() < self.ttl => {
				self.hit();
				Some(ch.clone())
			},
			_ => {
				self.miss();
				None
			},
		}
	}

	pub fn get_channel_by_name(&self, name: &str) -> Option<Channel> {
		let map = self.channels_by_name.lock();
		match map.get(name) {
			Some((ch, at)) if at.elapsed() < self.ttl => {
				self.hit();
				Some(ch.clone())
			},
			_ => {
				self.miss();
				None
			},
		}
	}

	pub fn put_channel(&self, channel: &Channel) {
		let now = Instant::now();
		self.channels_by_id
			.lock()
			.insert(channel.id.clone(), (channel.clone(), now));
		self.channels_by_name
			.lock()
			.insert(channel.name.clone(), (channel.clone(), now));
	}

	pub fn invalidate_channel(&self, id: &str) {
		if let Some((ch, _)) = self.channels_by_id.lock().remove(id) {
			self.channels_by_name.lock().remove(&ch.name);
		}
	}

	pub fn get_enabled_rules(&self) -> Option<Vec<RoutingRule>> {
		let cached = self.enabled_rules.lock();
		match cached.as_ref() {
			Some((rules, at)) if at.elapsed() < self.ttl => {
				self.hit();
				Some(rules.clone())
			},
			_ => {
				self.miss();
				None
			},
		}
	}

	pub fn put_enabled_rules(&self, rules: &[RoutingRule]) {
		*self.enabled_rules.lock() = Some((rules.to_vec(), Instant::now()));
	}

	pub fn invalidate_rules(&self) {
		*self.enabled_rules.lock() = None;
	}

	pub fn clear(&self) {
		self.channels_by_id.lock().clear();
		self.channels_by_name.lock().clear();
		*self.enabled_rules.lock() = None;
	}

	pub fn stats(&self) -> Value {
		json!({
			"ttlMs": self.ttl.as_millis() as u64,
			"channels": self.channels_by_id.lock().len(),
			"rulesCached": self.enabled_rules.lock().is_some(),
			"hits": self.hits.load(Ordering::Relaxed),
			"misses": self.misses.load(Ordering::Relaxed),
		})
	}
}
