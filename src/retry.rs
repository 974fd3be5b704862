use std::time::Duration;

use rand::Rng;

use crate::config::RetrySettings;
use crate::errors::Error;

/// Backoff policy for upstream forwarding.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub max_retries: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub exponential_base: f64,
	pub jitter_enabled: bool,
	pub jitter_factor: f64,
}

impl From<RetrySettings> for RetryPolicy {
	fn from(s: RetrySettings) -> Self {
		RetryPolicy {
			max_retries: s.max_retries,
			base_delay: Duration::from_millis(s.base_delay_ms),
			max_delay: Duration::from_millis(s.max_delay_ms),
			exponential_base: s.exponential_base,
			jitter_enabled: s.jitter_enabled,
			jitter_factor: s.jitter_factor,
		}
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetrySettings::default().into()
	}
}

impl RetryPolicy {
	/// Delay before the given attempt (1-based): exponential growth capped at
	/// `max_delay`, optionally spread by uniform jitter.
	pub fn calculate_delay(&self, attempt: u32) -> Duration {
		let exp = self.exponential_base.powi(attempt.saturating_sub(1) as i32);
		let capped = (self.base_delay.as_millis() as f64 * exp)
			.min(self.max_delay.as_millis() as f64);
		let delayed = if self.jitter_enabled {
			let jitter = rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
			(capped + jitter * capped).max(0.0)
		} else {
			capped
		};
		Duration::from_millis(delayed as u64)
	}
}

/// Whether a forwarding error is worth another attempt.
///
/// Network-class failures and 408/429/5xx statuses retry; other 4xx do not.
/// Domain errors that signal an unhealthy channel retry so the engine can
/// switch channels. Unknown errors default to retriable.
pub fn is_retriable(err: &Error) -> bool {
	match err {
		Error::Upstream(e) => {
			e.is_connect()
				|| e.is_timeout()
				|| e.is_request()
				|| message_looks_transient(&e.to_string())
		},
		Error::Http { status, .. } => match *status {
			408 | 429 => true,
			s if s >= 500 => true,
			_ => false,
		},
		Error::CircuitBreakerOpen { .. } | Error::RateLimit(_) => true,
		Error::Validation(_)
		| Error::Authentication(_)
		| Error::NotFound(_)
		| Error::Configuration(_) => false,
		Error::Channel(msg) | Error::Internal(msg) => message_looks_transient(msg),
		_ => true,
	}
}

fn message_looks_transient(msg: &str) -> bool {
	let msg = msg.to_ascii_lowercase();
	[
		"connection refused",
		"connection reset",
		"timeout",
		"timed out",
		"dns",
		"name resolution",
		"unreachable",
		"broken pipe",
		"temporarily unavailable",
	]
	.iter()
	.any(|needle| msg.contains(needle))
}
