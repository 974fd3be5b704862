use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::BreakerSettings;
use crate::errors::Result;
use crate::metrics::Registry;
use crate::store::Store;
use crate::types::{Channel, ChannelStatus, now_ms};

#[derive(Debug, Clone)]
struct BreakerState {
	failures: u32,
	last_failure: Instant,
	name: String,
}

/// Per-channel failure tally. Reaching the threshold flips the channel to
/// `rate_limited` until the cooldown elapses; any success resets it.
pub struct CircuitBreaker {
	threshold: u32,
	timeout: Duration,
	states: Mutex<HashMap<String, BreakerState>>,
	store: Arc<Store>,
	metrics: Arc<Registry>,
}

impl CircuitBreaker {
	pub fn new(settings: BreakerSettings, store: Arc<Store>, metrics: Arc<Registry>) -> Self {
		CircuitBreaker {
			threshold: settings.threshold.max(1),
			timeout: settings.timeout,
			states: Mutex::new(HashMap::new()),
			store,
			metrics,
		}
	}

	/// Records a failure; returns true when this failure opened the breaker.
	pub fn record_failure(&self, channel_id: &str, channel_name: &str) -> Result<bool> {
		let failures = {
			let mut states = self.states.lock();
			let state = states.entry(channel_id.to_string()).or_insert_with(|| BreakerState {
				failures: 0,
				last_failure: Instant::now(),
				name: channel_name.to_string(),
			});
			state.failures += 1;
			state.last_failure = Instant::now();
			state.name = channel_name.to_string();
			state.failures
		};
		self.store.mark_channel_failure(channel_id)?;
		if failures == self.threshold {
			let until = now_ms() + self.timeout.as_millis() as i64;
			warn!(channel = channel_name, failures, "circuit breaker opened");
			self.store
				.update_channel_status(channel_id, ChannelStatus::RateLimited, Some(until))?;
			self.metrics
				.increment("routex_circuit_breaker_trips_total", 1.0, &[("channel", channel_name)]);
			self.metrics
				.set_gauge("routex_circuit_breaker_open", 1.0, &[("channel", channel_name)]);
			return Ok(true);
		}
		Ok(false)
	}

	/// True while the breaker holds the channel open. Once the cooldown has
	/// elapsed the breaker resets itself and the channel re-enables.
	pub fn is_open(&self, channel_id: &str) -> bool {
		{
			let states = self.states.lock();
			match states.get(channel_id) {
				Some(state) if state.failures >= self.threshold => {
					if state.last_failure.elapsed() <= self.timeout {
						return true;
					}
					// cooldown elapsed; fall through to reset below
				},
				_ => return false,
			}
		}
		if let Err(e) = self.reset(channel_id) {
			warn!(channel_id, error = %e, "breaker auto-reset failed");
			return true;
		}
		false
	}

	/// Whether the channel can take traffic right now. For rows still marked
	/// `rate_limited`/`circuit_open` whose cooldown stamp has passed (for
	/// instance after a restart, when no in-memory tally exists), the channel
	/// is re-enabled on the spot.
	pub fn probe(&self, channel: &Channel) -> bool {
		match channel.status {
			ChannelStatus::Enabled => !self.is_open(&channel.id),
			ChannelStatus::Disabled => false,
			ChannelStatus::CircuitOpen | ChannelStatus::RateLimited => {
				if self.is_open(&channel.id) {
					return false;
				}
				let until = channel
					.rate_limited_until
					.or(channel.circuit_breaker_until)
					.unwrap_or(0);
				if until > now_ms() {
					return false;
				}
				info!(channel = %channel.name, "cooldown stamp elapsed, re-enabling channel");
				if let Err(e) = self
					.store
					.update_channel_status(&channel.id, ChannelStatus::Enabled, None)
					.and_then(|()| self.store.clear_channel_failures(&channel.id))
				{
					warn!(channel = %channel.name, error = %e, "re-enable failed");
					return false;
				}
				self.metrics
					.set_gauge("routex_circuit_breaker_open", 0.0, &[("channel", &channel.name)]);
				true
			},
		}
	}

	pub fn record_success(&self, channel_id: &str) -> Result<()> {
		let was_tracked = self.states.lock().contains_key(channel_id);
		if was_tracked {
			self.reset(channel_id)?;
		}
		Ok(())
	}

	pub fn reset(&self, channel_id: &str) -> Result<()> {
		let state = self.states.lock().remove(channel_id);
		if let Some(state) = state {
			if state.failures >= self.threshold {
				info!(channel = %state.name, "circuit breaker reset");
				self.store
					.update_channel_status(channel_id, ChannelStatus::Enabled, None)?;
			}
			self.metrics
				.set_gauge("routex_circuit_breaker_open", 0.0, &[("channel", &state.name)]);
		}
		self.store.clear_channel_failures(channel_id)?;
		Ok(())
	}

	pub fn open_channels(&self) -> Vec<String> {
		let states = self.states.lock();
		states
			.iter()
			.filter(|(_, s)| s.failures >= self.threshold && s.last_failure.elapsed() <= self.timeout)
			.map(|(id, _)| id.clone())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::RequestLogSettings;
	use crate::types::{ChannelInput, ChannelType};

	fn setup(timeout: Duration) -> (Arc<Store>, CircuitBreaker, String) {
		let metrics = Arc::new(Registry::with_defaults());
		let store = Arc::new(
			Store::open_in_memory(
				RequestLogSettings::default(),
				Duration::from_secs(30),
				metrics.clone(),
			)
			.unwrap(),
		);
		let channel = store
			.create_channel(ChannelInput {
				name: "upstream".into(),
				channel_type: ChannelType::Anthropic,
				base_url: None,
				api_key: None,
				models: vec!["claude-sonnet-4".into()],
				priority: None,
				weight: None,
				transformers: None,
			})
			.unwrap();
		let breaker = CircuitBreaker::new(
			BreakerSettings { threshold: 5, timeout },
			store.clone(),
			metrics,
		);
		(store, breaker, channel.id)
	}

	#[test]
	fn opens_after_threshold_failures() {
		let (store, breaker, id) = setup(Duration::from_secs(60));
		for i in 1..=4 {
			assert!(!breaker.record_failure(&id, "upstream").unwrap(), "attempt {i}");
			assert!(!breaker.is_open(&id));
		}
		assert!(breaker.record_failure(&id, "upstream").unwrap());
		assert!(breaker.is_open(&id));
		let ch = store.get_channel(&id).unwrap();
		assert_eq!(ch.status, ChannelStatus::RateLimited);
		assert_eq!(ch.consecutive_failures, 5);
		assert!(ch.rate_limited_until.unwrap() > now_ms());
	}

	#[test]
	fn success_resets() {
		let (store, breaker, id) = setup(Duration::from_secs(60));
		for _ in 0..5 {
			breaker.record_failure(&id, "upstream").unwrap();
		}
		assert!(breaker.is_open(&id));
		breaker.record_success(&id).unwrap();
		assert!(!breaker.is_open(&id));
		let ch = store.get_channel(&id).unwrap();
		assert_eq!(ch.status, ChannelStatus::Enabled);
		assert_eq!(ch.consecutive_failures, 0);
	}

	#[test]
	fn cooldown_auto_resets() {
		let (store, breaker, id) = setup(Duration::from_millis(20));
		for _ in 0..5 {
			breaker.record_failure(&id, "upstream").unwrap();
		}
		assert!(breaker.is_open(&id));
		std::thread::sleep(Duration::from_millis(40));
		assert!(!breaker.is_open(&id));
		assert_eq!(store.get_channel(&id).unwrap().status, ChannelStatus::Enabled);
	}

	#[test]
	fn probe_reenables_after_stamp_expiry_without_memory_state() {
		let (store, _breaker, id) = setup(Duration::from_secs(60));
		// simulate a rate-limited row left over from a previous process
		store
			.update_channel_status(&id, ChannelStatus::RateLimited, Some(now_ms() - 1))
			.unwrap();
		// a fresh breaker has no in-memory tally for this channel
		let fresh = CircuitBreaker::new(
			BreakerSettings { threshold: 5, timeout: Duration::from_secs(60) },
			store.clone(),
			Arc::new(Registry::with_defaults()),
		);
		let channel = store.get_channel(&id).unwrap();
		assert!(fresh.probe(&channel));
		assert_eq!(store.get_channel(&id).unwrap().status, ChannelStatus::Enabled);

		// a stamp still in the future keeps the channel out
		store
			.update_channel_status(&id, ChannelStatus::RateLimited, Some(now_ms() + 60_000))
			.unwrap();
		let channel = store.get_channel(&id).unwrap();
		assert!(!fresh.probe(&channel));
	}

	#[test]
	fn failures_below_threshold_leave_channel_enabled() {
		let (store, breaker, id) = setup(Duration::from_secs(60));
		breaker.record_failure(&id, "upstream").unwrap();
		breaker.record_failure(&id, "upstream").unwrap();
		assert_eq!(store.get_channel(&id).unwrap().status, ChannelStatus::Enabled);
		breaker.record_success(&id).unwrap();
		assert_eq!(store.get_channel(&id).unwrap().consecutive_failures, 0);
	}
}
