use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balance::{LoadBalancer, SelectionContext};
use crate::config::WarmerSettings;
use crate::errors::Result;
use crate::store::Store;
use crate::types::now_ms;

/// Drives warm state for the store's row cache and the balancer's selection
/// state: a full cycle on startup, periodic refresh, and explicit
/// invalidation hooks for the admin API.
pub struct CacheWarmer {
	store: Arc<Store>,
	balancer: Arc<LoadBalancer>,
	settings: WarmerSettings,
	busy: AtomicBool,
	cycles: AtomicU64,
	last_warm: Mutex<Option<i64>>,
}

impl CacheWarmer {
	pub fn new(store: Arc<Store>, balancer: Arc<LoadBalancer>, settings: WarmerSettings) -> Self {
		CacheWarmer {
			store,
			balancer,
			settings,
			busy: AtomicBool::new(false),
			cycles: AtomicU64::new(0),
			last_warm: Mutex::new(None),
		}
	}

	/// One warm cycle. Single-flight: overlapping triggers are rejected.
	pub fn warm(&self) -> Result<Value> {
		if self.busy.swap(true, Ordering::SeqCst) {
			warn!("warm cycle already running, skipping");
			return Ok(json!({"skipped": true}));
		}
		let result = self.warm_inner();
		self.busy.store(false, Ordering::SeqCst);
		result
	}

	fn warm_inner(&self) -> Result<Value> {
		let channels = self.store.list_enabled_channels()?;
		let mut models: HashSet<String> = HashSet::new();
		for channel in &channels {
			models.extend(channel.models.iter().cloned());
			// throwaway selection primes the balancer's internal state
			let ctx = SelectionContext {
				session_id: None,
				model: channel.models.first().cloned(),
			};
			let _ = self.balancer.select(&channels, &ctx);
			// read-through populates the row cache
			let _ = self.store.get_channel(&channel.id);
		}
		let rules = self.store.list_enabled_routing_rules()?;
		let _ = self.store.get_analytics()?;

		self.cycles.fetch_add(1, Ordering::Relaxed);
		*self.last_warm.lock() = Some(now_ms());
		debug!(
			channels = channels.len(),
			models = models.len(),
			rules = rules.len(),
			"cache warm cycle complete"
		);
		Ok(json!({
			"channels": channels.len(),
			"models": models.len(),
			"rules": rules.len(),
		}))
	}

	/// Clears the balancer's selection cache, and the store's row cache when
	/// no specific kind is named or the kind targets the store.
	pub fn invalidate(&self, kind: Option<&str>) {
		match kind {
			Some("balancer") => self.balancer.clear_cache(),
			Some("channels") | Some("rules") => self.store.cache().clear(),
			_ => {
				self.balancer.clear_cache();
				self.store.cache().clear();
			},
		}
		info!(kind = kind.unwrap_or("all"), "caches invalidated");
	}

	pub fn invalidate_and_warm(&self, kind: Option<&str>) -> Result<Value> {
		self.invalidate(kind);
		self.warm()
	}

	pub fn stats(&self) -> Value {
		json!({
			"intervalMs": self.settings.interval.as_millis() as u64,
			"warmOnStartup": self.settings.warm_on_startup,
			"busy": self.busy.load(Ordering::SeqCst),
			"cycles": self.cycles.load(Ordering::Relaxed),
			"lastWarmAt": *self.last_warm.lock(),
			"rowCache": self.store.cache().stats(),
		})
	}

	/// Startup warm (when configured) plus the periodic refresh loop.
	pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
		let warmer = self.clone();
		tokio::spawn(async move {
			if warmer.settings.warm_on_startup {
				if let Err(e) = warmer.warm() {
					warn!(error = %e, "startup warm failed");
				}
			}
			let mut ticker = tokio::time::interval(warmer.settings.interval.max(Duration::from_secs(1)));
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			ticker.tick().await; // first tick fires immediately
			loop {
				ticker.tick().await;
				if let Err(e) = warmer.warm() {
					warn!(error = %e, "warm cycle failed");
				}
			}
		})
	}
}
