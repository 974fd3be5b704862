use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{Error, Result};

const CONFIG_FILE: &str = "routex.config.json";

/// Fully resolved runtime configuration. Built once at startup from the
/// config file (if any) with environment variables taking precedence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub host: String,
	pub port: u16,
	pub data_dir: PathBuf,
	pub strategy: String,
	pub cors_origins: Vec<String>,
	pub locale: String,
	#[serde(skip_serializing)]
	pub dashboard_password: Option<String>,
	#[serde(skip_serializing)]
	pub master_password: Option<String>,
	#[serde(skip_serializing)]
	pub encryption_salt: Option<String>,
	pub retry: RetrySettings,
	pub breaker: BreakerSettings,
	pub request_log: RequestLogSettings,
	pub cache_ttl_ms: u64,
	pub warmer: WarmerSettings,
	pub tee_workers: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
	pub max_retries: u32,
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
	pub exponential_base: f64,
	pub jitter_enabled: bool,
	pub jitter_factor: f64,
}

impl Default for RetrySettings {
	fn default() -> Self {
		RetrySettings {
			max_retries: 3,
			base_delay_ms: 1000,
			max_delay_ms: 30_000,
			exponential_base: 2.0,
			jitter_enabled: true,
			jitter_factor: 0.25,
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSettings {
	pub threshold: u32,
	pub timeout: Duration,
}

impl Default for BreakerSettings {
	fn default() -> Self {
		BreakerSettings {
			threshold: 5,
			timeout: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogSettings {
	/// Hard capacity of the in-memory buffer.
	pub batch_size: usize,
	/// Crossing this mark triggers a synchronous flush.
	pub high_water: usize,
	pub flush_interval: Duration,
}

impl Default for RequestLogSettings {
	fn default() -> Self {
		RequestLogSettings {
			batch_size: 500,
			high_water: 100,
			flush_interval: Duration::from_secs(1),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmerSettings {
	pub interval: Duration,
	pub warm_on_startup: bool,
}

impl Default for WarmerSettings {
	fn default() -> Self {
		WarmerSettings {
			interval: Duration::from_secs(300),
			warm_on_startup: true,
		}
	}
}

/// The on-disk shape of `routex.config.json`. Every field is optional; the
/// resolved [`Config`] fills in defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
	pub host: Option<String>,
	pub port: Option<u16>,
	pub data_dir: Option<PathBuf>,
	pub load_balance_strategy: Option<String>,
	pub cors_origins: Option<Vec<String>>,
	pub locale: Option<String>,
	pub retry_max_retries: Option<u32>,
	pub retry_base_delay: Option<u64>,
	pub retry_max_delay: Option<u64>,
	pub retry_jitter_enabled: Option<bool>,
	pub retry_jitter_factor: Option<f64>,
	pub circuit_breaker_threshold: Option<u32>,
	pub circuit_breaker_timeout: Option<u64>,
	pub request_batch_size: Option<usize>,
	pub request_flush_interval: Option<u64>,
	pub cache_ttl: Option<u64>,
	pub warm_interval: Option<u64>,
	pub warm_on_startup: Option<bool>,
	pub tee_workers: Option<usize>,
}

fn parse<T: FromStr>(env_name: &str) -> Result<Option<T>>
where
	T::Err: std::fmt::Display,
{
	match env::var(env_name) {
		Ok(val) if !val.is_empty() => val
			.parse::<T>()
			.map(Some)
			.map_err(|e| Error::Configuration(format!("invalid {env_name}: {e}"))),
		_ => Ok(None),
	}
}

/// Cloud platforms mount a persistent volume at /data; locally we keep state
/// next to the binary.
fn detect_data_dir() -> PathBuf {
	let cloud = ["CLAW_RUNTIME", "RAILWAY_ENVIRONMENT", "FLY_APP_NAME", "RENDER"]
		.iter()
		.any(|v| env::var(v).is_ok());
	if cloud {
		PathBuf::from("/data")
	} else {
		PathBuf::from("./data")
	}
}

fn find_config_file(data_dir: &Path) -> Option<PathBuf> {
	let candidates = [
		PathBuf::from(CONFIG_FILE),
		PathBuf::from("config").join(CONFIG_FILE),
		data_dir.join(CONFIG_FILE),
	];
	candidates.into_iter().find(|p| p.exists())
}

pub fn load() -> Result<Config> {
	let data_dir = parse::<PathBuf>("DATA_DIR")?.unwrap_or_else(detect_data_dir);
	let raw = match find_config_file(&data_dir) {
		Some(path) => {
			info!(file = %path.display(), "loading config file");
			let contents = std::fs::read_to_string(&path)
				.map_err(|e| Error::Configuration(format!("read {}: {e}", path.display())))?;
			serde_json::from_str::<RawConfig>(&contents)
				.map_err(|e| Error::Configuration(format!("parse {}: {e}", path.display())))?
		},
		None => RawConfig::default(),
	};
	resolve(raw, data_dir)
}

pub fn resolve(raw: RawConfig, data_dir: PathBuf) -> Result<Config> {
	let strategy = parse::<String>("LOAD_BALANCE_STRATEGY")?
		.or(raw.load_balance_strategy)
		.unwrap_or_else(|| "priority".to_string());
	if !matches!(
		strategy.as_str(),
		"priority" | "round_robin" | "weighted" | "least_used"
	) {
		return Err(Error::Configuration(format!(
			"unknown load balance strategy {strategy:?}"
		)));
	}
	let locale = parse::<String>("LOCALE")?
		.or(raw.locale)
		.unwrap_or_else(|| "en".to_string());
	if !matches!(locale.as_str(), "en" | "zh-CN") {
		return Err(Error::Configuration(format!("unsupported locale {locale:?}")));
	}

	let cors_origins = match parse::<String>("CORS_ORIGINS")? {
		Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
		None => raw.cors_origins.unwrap_or_else(|| vec!["*".to_string()]),
	};

	let defaults = RetrySettings::default();
	let retry = RetrySettings {
		max_retries: parse("RETRY_MAX_RETRIES")?
			.or(raw.retry_max_retries)
			.unwrap_or(defaults.max_retries),
		base_delay_ms: parse("RETRY_BASE_DELAY")?
			.or(raw.retry_base_delay)
			.unwrap_or(defaults.base_delay_ms),
		max_delay_ms: parse("RETRY_MAX_DELAY")?
			.or(raw.retry_max_delay)
			.unwrap_or(defaults.max_delay_ms),
		exponential_base: defaults.exponential_base,
		jitter_enabled: parse("RETRY_JITTER_ENABLED")?
			.or(raw.retry_jitter_enabled)
			.unwrap_or(defaults.jitter_enabled),
		jitter_factor: parse("RETRY_JITTER_FACTOR")?
			.or(raw.retry_jitter_factor)
			.unwrap_or(defaults.jitter_factor),
	};

	let breaker_defaults = BreakerSettings::default();
	let breaker = BreakerSettings {
		threshold: parse("CIRCUIT_BREAKER_THRESHOLD")?
			.or(raw.circuit_breaker_threshold)
			.unwrap_or(breaker_defaults.threshold),
		timeout: parse::<u64>("CIRCUIT_BREAKER_TIMEOUT")?
			.or(raw.circuit_breaker_timeout)
			.map(Duration::from_millis)
			.unwrap_or(breaker_defaults.timeout),
	};

	let log_defaults = RequestLogSettings::default();
	let batch_size = parse("REQUEST_BATCH_SIZE")?
		.or(raw.request_batch_size)
		.unwrap_or(log_defaults.batch_size);
	let request_log = RequestLogSettings {
		batch_size,
		high_water: log_defaults.high_water.min(batch_size),
		flush_interval: parse::<u64>("REQUEST_FLUSH_INTERVAL")?
			.or(raw.request_flush_interval)
			.map(Duration::from_millis)
			.unwrap_or(log_defaults.flush_interval),
	};

	let warm_defaults = WarmerSettings::default();
	let warmer = WarmerSettings {
		interval: raw
			.warm_interval
			.map(Duration::from_millis)
			.unwrap_or(warm_defaults.interval),
		warm_on_startup: raw.warm_on_startup.unwrap_or(warm_defaults.warm_on_startup),
	};

	Ok(Config {
		host: parse("HOST")?.or(raw.host).unwrap_or_else(|| "0.0.0.0".to_string()),
		port: parse("PORT")?.or(raw.port).unwrap_or(3000),
		data_dir,
		strategy,
		cors_origins,
		locale,
		dashboard_password: parse("DASHBOARD_PASSWORD")?,
		master_password: parse("MASTER_PASSWORD")?,
		encryption_salt: parse("ENCRYPTION_SALT")?,
		retry,
		breaker,
		request_log,
		cache_ttl_ms: parse("CACHE_TTL")?.or(raw.cache_ttl).unwrap_or(30_000),
		warmer,
		tee_workers: raw.tee_workers.unwrap_or(4),
	})
}

impl Default for Config {
	fn default() -> Self {
		resolve(RawConfig::default(), PathBuf::from("./data")).expect("defaults are valid")
	}
}
