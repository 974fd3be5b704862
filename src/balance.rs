use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::types::Channel;

pub const SESSION_AFFINITY_TTL: Duration = Duration::from_secs(5 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
	Priority,
	RoundRobin,
	Weighted,
	LeastUsed,
}

impl Strategy {
	pub fn as_str(&self) -> &'static str {
		match self {
			Strategy::Priority => "priority",
			Strategy::RoundRobin => "round_robin",
			Strategy::Weighted => "weighted",
			Strategy::LeastUsed => "least_used",
		}
	}
}

impl FromStr for Strategy {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"priority" => Ok(Strategy::Priority),
			"round_robin" => Ok(Strategy::RoundRobin),
			"weighted" => Ok(Strategy::Weighted),
			"least_used" => Ok(Strategy::LeastUsed),
			other => Err(Error::Validation(format!("unknown strategy {other:?}"))),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
	pub session_id: Option<String>,
	pub model: Option<String>,
}

struct SessionEntry {
	channel_id: String,
	expires_at: Instant,
}

/// Picks one channel from the enabled candidate set under the configured
/// strategy, with sticky session affinity on top.
pub struct LoadBalancer {
	strategy: Mutex<Strategy>,
	rr_index: Mutex<usize>,
	affinity_ttl: Duration,
	sessions: Mutex<HashMap<String, SessionEntry>>,
	/// Min-heap of (expiry, session id) scanned by the sweeper; one task
	/// instead of a timer per session.
	expiries: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
}

impl LoadBalancer {
	pub fn new(strategy: Strategy) -> Self {
		Self::with_affinity_ttl(strategy, SESSION_AFFINITY_TTL)
	}

	pub fn with_affinity_ttl(strategy: Strategy, affinity_ttl: Duration) -> Self {
		LoadBalancer {
			strategy: Mutex::new(strategy),
			rr_index: Mutex::new(0),
			affinity_ttl,
			sessions: Mutex::new(HashMap::new()),
			expiries: Mutex::new(BinaryHeap::new()),
		}
	}

	pub fn strategy(&self) -> Strategy {
		*self.strategy.lock()
	}

	pub fn set_strategy(&self, strategy: Strategy) {
		*self.strategy.lock() = strategy;
		*self.rr_index.lock() = 0;
	}

	pub fn select(&self, candidates: &[Channel], ctx: &SelectionContext) -> Result<Channel> {
		if candidates.is_empty() {
			return Err(Error::NoAvailableChannel);
		}
		// narrow to channels serving the requested model when any do
		let narrowed: Vec<&Channel> = match &ctx.model {
			Some(model) => {
				let serving: Vec<&Channel> =
					candidates.iter().filter(|c| c.models.iter().any(|m| m == model)).collect();
				if serving.is_empty() { candidates.iter().collect() } else { serving }
			},
			None => candidates.iter().collect(),
		};

		if let Some(session_id) = &ctx.session_id {
			if let Some(channel) = self.affine_channel(session_id, &narrowed) {
				return Ok(channel);
			}
		}

		let picked = match self.strategy() {
			Strategy::Priority => Self::pick_priority(&narrowed),
			Strategy::RoundRobin => {
				let mut idx = self.rr_index.lock();
				let picked = narrowed[*idx % narrowed.len()].clone();
				*idx = idx.wrapping_add(1);
				picked
			},
			Strategy::Weighted => self.pick_weighted(&narrowed),
			Strategy::LeastUsed => narrowed
				.iter()
				.min_by_key(|c| c.request_count)
				.map(|c| (*c).clone())
				.expect("narrowed is non-empty"),
		};

		if let Some(session_id) = &ctx.session_id {
			self.bind_session(session_id, &picked.id);
		}
		debug!(channel = %picked.name, strategy = self.strategy().as_str(), "selected channel");
		Ok(picked)
	}

	fn pick_priority(candidates: &[&Channel]) -> Channel {
		// min_by_key keeps the first on ties, so store order (priority DESC,
		// name ASC) breaks them
		candidates
			.iter()
			.min_by_key(|c| Reverse(c.priority))
			.map(|c| (*c).clone())
			.expect("candidates are non-empty")
	}

	fn pick_weighted(&self, candidates: &[&Channel]) -> Channel {
		let total: f64 = candidates.iter().map(|c| c.weight.max(0.0)).sum();
		if total <= 0.0 {
			return Self::pick_priority(candidates);
		}
		let mut r = rand::rng().random_range(0.0..total);
		for c in candidates {
			r -= c.weight.max(0.0);
			if r <= 0.0 {
				return (*c).clone();
			}
		}
		candidates[candidates.len() - 1].clone()
	}

	fn affine_channel(&self, session_id: &str, candidates: &[&Channel]) -> Option<Channel> {
		let mut sessions = self.sessions.lock();
		let entry = sessions.get(session_id)?;
		if entry.expires_at <= Instant::now() {
			sessions.remove(session_id);
			return None;
		}
		match candidates.iter().find(|c| c.id == entry.channel_id && c.is_enabled()) {
			Some(c) => Some((*c).clone()),
			None => {
				// channel dropped out of the candidate set; unstick
				sessions.remove(session_id);
				None
			},
		}
	}

	fn bind_session(&self, session_id: &str, channel_id: &str) {
		let expires_at = Instant::now() + self.affinity_ttl;
		self.sessions.lock().insert(
			session_id.to_string(),
			SessionEntry { channel_id: channel_id.to_string(), expires_at },
		);
		self.expiries.lock().push(Reverse((expires_at, session_id.to_string())));
	}

	/// Removes expired affinity entries. Driven by a periodic background task.
	pub fn sweep_expired_sessions(&self) -> usize {
		let now = Instant::now();
		let mut removed = 0;
		let mut expiries = self.expiries.lock();
		let mut sessions = self.sessions.lock();
		while let Some(Reverse((at, _))) = expiries.peek() {
			if *at > now {
				break;
			}
			let Reverse((_, session_id)) = expiries.pop().expect("peeked entry");
			// a later bind may have refreshed the entry; only drop stale ones
			if let Some(entry) = sessions.get(&session_id) {
				if entry.expires_at <= now {
					sessions.remove(&session_id);
					removed += 1;
				}
			}
		}
		removed
	}

	pub fn session_count(&self) -> usize {
		self.sessions.lock().len()
	}

	pub fn reset_index(&self) {
		*self.rr_index.lock() = 0;
	}

	/// Drops all selection state: affinity map and the round-robin cursor.
	pub fn clear_cache(&self) {
		self.sessions.lock().clear();
		self.expiries.lock().clear();
		*self.rr_index.lock() = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{ChannelStatus, ChannelType, now_ms};

	fn channel(name: &str, priority: i64, weight: f64, requests: i64) -> Channel {
		Channel {
			id: format!("id-{name}"),
			name: name.to_string(),
			channel_type: ChannelType::Anthropic,
			base_url: None,
			api_key: None,
			models: vec!["claude-sonnet-4".to_string()],
			priority,
			weight,
			status: ChannelStatus::Enabled,
			transformers: None,
			request_count: requests,
			success_count: 0,
			failure_count: 0,
			consecutive_failures: 0,
			last_failure_time: None,
			circuit_breaker_until: None,
			rate_limited_until: None,
			last_used_at: None,
			created_at: now_ms(),
			updated_at: now_ms(),
		}
	}

	#[test]
	fn empty_candidates_error() {
		let lb = LoadBalancer::new(Strategy::Priority);
		assert!(matches!(
			lb.select(&[], &SelectionContext::default()),
			Err(Error::NoAvailableChannel)
		));
	}

	#[test]
	fn priority_picks_highest_then_falls_back() {
		let lb = LoadBalancer::new(Strategy::Priority);
		let a = channel("a", 1, 1.0, 0);
		let b = channel("b", 2, 1.0, 0);
		let c = channel("c", 3, 1.0, 0);
		let picked = lb.select(&[a.clone(), b.clone(), c.clone()], &SelectionContext::default()).unwrap();
		assert_eq!(picked.name, "c");
		// with c out of the candidate set, b wins
		let picked = lb.select(&[a, b], &SelectionContext::default()).unwrap();
		assert_eq!(picked.name, "b");
	}

	#[test]
	fn round_robin_rotates() {
		let lb = LoadBalancer::new(Strategy::RoundRobin);
		let candidates = vec![channel("a", 1, 1.0, 0), channel("b", 1, 1.0, 0), channel("c", 1, 1.0, 0)];
		let picks: Vec<String> = (0..4)
			.map(|_| lb.select(&candidates, &SelectionContext::default()).unwrap().name)
			.collect();
		assert_eq!(picks, vec!["a", "b", "c", "a"]);

		// b disabled and removed from candidates; reset the cursor
		lb.reset_index();
		let remaining = vec![candidates[0].clone(), candidates[2].clone()];
		let picks: Vec<String> = (0..2)
			.map(|_| lb.select(&remaining, &SelectionContext::default()).unwrap().name)
			.collect();
		assert_eq!(picks, vec!["a", "c"]);
	}

	#[test]
	fn least_used_picks_minimum() {
		let lb = LoadBalancer::new(Strategy::LeastUsed);
		let candidates = vec![
			channel("busy", 1, 1.0, 500),
			channel("idle", 1, 1.0, 2),
			channel("mid", 1, 1.0, 80),
		];
		assert_eq!(
			lb.select(&candidates, &SelectionContext::default()).unwrap().name,
			"idle"
		);
	}

	#[test]
	fn weighted_respects_weights() {
		let lb = LoadBalancer::new(Strategy::Weighted);
		let candidates = vec![channel("heavy", 1, 9.0, 0), channel("light", 1, 1.0, 0)];
		let mut heavy = 0;
		for _ in 0..500 {
			if lb.select(&candidates, &SelectionContext::default()).unwrap().name == "heavy" {
				heavy += 1;
			}
		}
		// expectation 450; wide bounds keep this stable
		assert!(heavy > 350, "heavy picked only {heavy}/500");
	}

	#[test]
	fn weighted_all_zero_falls_back_to_priority() {
		let lb = LoadBalancer::new(Strategy::Weighted);
		let candidates = vec![channel("low", 1, 0.0, 0), channel("high", 9, 0.0, 0)];
		assert_eq!(
			lb.select(&candidates, &SelectionContext::default()).unwrap().name,
			"high"
		);
	}

	#[test]
	fn session_affinity_sticks_and_unsticks() {
		let lb = LoadBalancer::new(Strategy::RoundRobin);
		let a = channel("a", 1, 1.0, 0);
		let b = channel("b", 1, 1.0, 0);
		let ctx = SelectionContext { session_id: Some("s1".into()), model: None };

		let first = lb.select(&[a.clone(), b.clone()], &ctx).unwrap();
		for _ in 0..5 {
			assert_eq!(lb.select(&[a.clone(), b.clone()], &ctx).unwrap().name, first.name);
		}

		// bound channel gone from the candidate set: mapping is dropped
		let other = if first.name == "a" { b.clone() } else { a.clone() };
		assert_eq!(lb.select(&[other.clone()], &ctx).unwrap().name, other.name);
	}

	#[test]
	fn affinity_ignores_disabled_channel() {
		let lb = LoadBalancer::new(Strategy::Priority);
		let mut a = channel("a", 9, 1.0, 0);
		let b = channel("b", 1, 1.0, 0);
		let ctx = SelectionContext { session_id: Some("s1".into()), model: None };
		assert_eq!(lb.select(&[a.clone(), b.clone()], &ctx).unwrap().name, "a");
		a.status = ChannelStatus::RateLimited;
		assert_eq!(lb.select(&[a, b], &ctx).unwrap().name, "b");
	}

	#[test]
	fn sweeper_removes_expired_sessions() {
		let lb = LoadBalancer::with_affinity_ttl(Strategy::Priority, Duration::from_millis(10));
		let a = channel("a", 1, 1.0, 0);
		let ctx = SelectionContext { session_id: Some("s1".into()), model: None };
		lb.select(&[a], &ctx).unwrap();
		assert_eq!(lb.session_count(), 1);
		std::thread::sleep(Duration::from_millis(20));
		assert_eq!(lb.sweep_expired_sessions(), 1);
		assert_eq!(lb.session_count(), 0);
	}

	#[test]
	fn model_narrowing_prefers_serving_channels() {
		let lb = LoadBalancer::new(Strategy::Priority);
		let mut a = channel("a", 9, 1.0, 0);
		a.models = vec!["gpt-4o".to_string()];
		let b = channel("b", 1, 1.0, 0);
		let ctx = SelectionContext { session_id: None, model: Some("claude-sonnet-4".into()) };
		// b is the only channel serving the model, despite a's priority
		assert_eq!(lb.select(&[a, b], &ctx).unwrap().name, "b");
	}
}
