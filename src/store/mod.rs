mod cache;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use cache::RowCache;

use crate::config::RequestLogSettings;
use crate::errors::{Error, Result};
use crate::metrics::Registry;
use crate::types::*;

/// USD per 1M tokens; deliberately fixed.
const COST_INPUT_PER_M: f64 = 3.0;
const COST_OUTPUT_PER_M: f64 = 15.0;
const COST_CACHED_PER_M: f64 = 0.3;

pub const MAX_QUERY_LIMIT: u32 = 1000;
pub const EXPORT_VERSION: u32 = 1;

const MIGRATIONS: &[&str] = &[
	// v1: base schema
	r#"
	CREATE TABLE channels (
		id TEXT PRIMARY KEY,
		name TEXT NOT NULL UNIQUE,
		type TEXT NOT NULL,
		base_url TEXT,
		api_key TEXT,
		models TEXT NOT NULL,
		priority INTEGER NOT NULL DEFAULT 50,
		weight REAL NOT NULL DEFAULT 1.0,
		status TEXT NOT NULL DEFAULT 'enabled',
		transformers TEXT,
		request_count INTEGER NOT NULL DEFAULT 0,
		success_count INTEGER NOT NULL DEFAULT 0,
		failure_count INTEGER NOT NULL DEFAULT 0,
		consecutive_failures INTEGER NOT NULL DEFAULT 0,
		last_failure_time INTEGER,
		circuit_breaker_until INTEGER,
		rate_limited_until INTEGER,
		last_used_at INTEGER,
		created_at INTEGER NOT NULL,
		updated_at INTEGER NOT NULL
	);
	CREATE TABLE requests (
		id TEXT PRIMARY KEY,
		channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
		model TEXT NOT NULL,
		method TEXT NOT NULL,
		path TEXT NOT NULL,
		status_code INTEGER NOT NULL,
		latency INTEGER NOT NULL,
		input_tokens INTEGER NOT NULL DEFAULT 0,
		output_tokens INTEGER NOT NULL DEFAULT 0,
		cached_tokens INTEGER NOT NULL DEFAULT 0,
		success INTEGER NOT NULL,
		error TEXT,
		timestamp INTEGER NOT NULL,
		trace_id TEXT
	);
	CREATE INDEX idx_requests_channel_id ON requests(channel_id);
	CREATE INDEX idx_requests_timestamp ON requests(timestamp);
	CREATE TABLE routing_rules (
		id TEXT PRIMARY KEY,
		name TEXT NOT NULL,
		type TEXT NOT NULL,
		condition TEXT NOT NULL,
		target_channel TEXT NOT NULL,
		target_model TEXT,
		priority INTEGER NOT NULL DEFAULT 0,
		enabled INTEGER NOT NULL DEFAULT 1,
		created_at INTEGER NOT NULL,
		updated_at INTEGER NOT NULL
	);
	CREATE TABLE tee_destinations (
		id TEXT PRIMARY KEY,
		name TEXT NOT NULL,
		type TEXT NOT NULL,
		enabled INTEGER NOT NULL DEFAULT 1,
		url TEXT,
		method TEXT,
		headers TEXT,
		file_path TEXT,
		custom_handler TEXT,
		filter TEXT,
		retries INTEGER NOT NULL DEFAULT 0,
		timeout_ms INTEGER NOT NULL DEFAULT 5000,
		created_at INTEGER NOT NULL,
		updated_at INTEGER NOT NULL
	);
	CREATE TABLE oauth_sessions (
		id TEXT PRIMARY KEY,
		channel_id TEXT REFERENCES channels(id) ON DELETE SET NULL,
		provider TEXT NOT NULL,
		access_token TEXT NOT NULL,
		refresh_token TEXT,
		expires_at INTEGER NOT NULL,
		scopes TEXT NOT NULL,
		user_info TEXT,
		created_at INTEGER NOT NULL,
		updated_at INTEGER NOT NULL
	);
	"#,
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestQuery {
	/// "success" | "failure" | a specific status code as string.
	pub status: Option<String>,
	pub channel_id: Option<String>,
	pub model: Option<String>,
	/// Free text match on path, model and error.
	pub q: Option<String>,
	pub since: Option<i64>,
	pub until: Option<i64>,
	pub limit: Option<u32>,
	pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
	pub total_requests: i64,
	pub success_requests: i64,
	pub failure_requests: i64,
	pub avg_latency: f64,
	pub total_input_tokens: i64,
	pub total_output_tokens: i64,
	pub total_cached_tokens: i64,
	pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelExport {
	pub version: u32,
	pub exported_at: i64,
	pub channels: Vec<Channel>,
}

pub fn estimated_cost(input_tokens: i64, output_tokens: i64, cached_tokens: i64) -> f64 {
	input_tokens as f64 / 1e6 * COST_INPUT_PER_M
		+ output_tokens as f64 / 1e6 * COST_OUTPUT_PER_M
		+ cached_tokens as f64 / 1e6 * COST_CACHED_PER_M
}

/// Embedded storage for channels, routing rules, tee destinations, OAuth
/// sessions and request logs. One serialized connection; request logs go
/// through an in-memory write buffer flushed in batches.
pub struct Store {
	conn: Mutex<Connection>,
	cache: RowCache,
	buffer: Mutex<Vec<RequestLogEntry>>,
	log_settings: RequestLogSettings,
	metrics: Arc<Registry>,
}

impl Store {
	pub fn open(
		path: &Path,
		log_settings: RequestLogSettings,
		cache_ttl: std::time::Duration,
		metrics: Arc<Registry>,
	) -> Result<Self> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| Error::Storage(format!("create {}: {e}", parent.display())))?;
		}
		let conn = Connection::open(path)?;
		conn.pragma_update(None, "journal_mode", "WAL")?;
		Self::init(conn, log_settings, cache_ttl, metrics)
	}

	pub fn open_in_memory(
		log_settings: RequestLogSettings,
		cache_ttl: std::time::Duration,
		metrics: Arc<Registry>,
	) -> Result<Self> {
		Self::init(Connection::open_in_memory()?, log_settings, cache_ttl, metrics)
	}

	fn init(
		conn: Connection,
		log_settings: RequestLogSettings,
		cache_ttl: std::time::Duration,
		metrics: Arc<Registry>,
	) -> Result<Self> {
		conn.pragma_update(None, "foreign_keys", "ON")?;
		let version: i64 =
			conn.query_row("SELECT * FROM pragma_user_version", [], |r| r.get(0))?;
		for (i, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
			debug!(version = i + 1, "applying migration");
			conn.execute_batch(migration)?;
			conn.pragma_update(None, "user_version", (i + 1) as i64)?;
		}
		info!(schema = MIGRATIONS.len(), "store ready");
		Ok(Store {
			conn: Mutex::new(conn),
			cache: RowCache::new(cache_ttl, metrics.clone()),
			buffer: Mutex::new(Vec::new()),
			log_settings,
			metrics,
		})
	}

	pub fn cache(&self) -> &RowCache {
		&self.cache
	}

	pub fn connectivity_check(&self) -> Result<()> {
		self.conn.lock().query_row("SELECT 1", [], |_| Ok(()))?;
		Ok(())
	}

	// ── channels ────────────────────────────────────────────────────────────

	fn row_to_channel(row: &rusqlite::Row) -> rusqlite::Result<Channel> {
		let channel_type: String = row.get("type")?;
		let status: String = row.get("status")?;
		let models: String = row.get("models")?;
		let transformers: Option<String> = row.get("transformers")?;
		Ok(Channel {
			id: row.get("id")?,
			name: row.get("name")?,
			channel_type: serde_json::from_value(Value::String(channel_type))
				.unwrap_or(ChannelType::Custom),
			base_url: row.get("base_url")?,
			api_key: row.get("api_key")?,
			models: serde_json::from_str(&models).unwrap_or_default(),
			priority: row.get("priority")?,
			weight: row.get("weight")?,
			status: serde_json::from_value(Value::String(status))
				.unwrap_or(ChannelStatus::Disabled),
			transformers: transformers.and_then(|t| serde_json::from_str(&t).ok()),
			request_count: row.get("request_count")?,
			success_count: row.get("success_count")?,
			failure_count: row.get("failure_count")?,
			consecutive_failures: row.get("consecutive_failures")?,
			last_failure_time: row.get("last_failure_time")?,
			circuit_breaker_until: row.get("circuit_breaker_until")?,
			rate_limited_until: row.get("rate_limited_until")?,
			last_used_at: row.get("last_used_at")?,
			created_at: row.get("created_at")?,
			updated_at: row.get("updated_at")?,
		})
	}

	pub fn list_channels(&self) -> Result<Vec<Channel>> {
		let conn = self.conn.lock();
		let mut stmt =
			conn.prepare("SELECT * FROM channels ORDER BY priority DESC, name ASC")?;
		let rows = stmt.query_map([], Self::row_to_channel)?;
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}

	pub fn list_enabled_channels(&self) -> Result<Vec<Channel>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT * FROM channels WHERE status = 'enabled' ORDER BY priority DESC, name ASC",
		)?;
		let rows = stmt.query_map([], Self::row_to_channel)?;
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}

	pub fn get_channel(&self, id: &str) -> Result<Channel> {
		if let Some(ch) = self.cache.get_channel(id) {
			return Ok(ch);
		}
		let channel = {
			let conn = self.conn.lock();
			conn
				.query_row(
					"SELECT * FROM channels WHERE id = ?1",
					params![id],
					Self::row_to_channel,
				)
				.optional()?
		};
		let channel = channel.ok_or_else(|| Error::NotFound(format!("channel {id}")))?;
		self.cache.put_channel(&channel);
		Ok(channel)
	}

	pub fn get_channel_by_name(&self, name: &str) -> Result<Channel> {
		if let Some(ch) = self.cache.get_channel_by_name(name) {
			return Ok(ch);
		}
		let channel = {
			let conn = self.conn.lock();
			conn
				.query_row(
					"SELECT * FROM channels WHERE name = ?1",
					params![name],
					Self::row_to_channel,
				)
				.optional()?
		};
		let channel = channel.ok_or_else(|| Error::NotFound(format!("channel {name}")))?;
		self.cache.put_channel(&channel);
		Ok(channel)
	}

	pub fn create_channel(&self, input: ChannelInput) -> Result<Channel> {
		if input.name.trim().is_empty() {
			return Err(Error::Validation("channel name must not be empty".into()));
		}
		if input.models.is_empty() {
			return Err(Error::Validation("channel must serve at least one model".into()));
		}
		let priority = input.priority.unwrap_or(50);
		if !(0..=100).contains(&priority) {
			return Err(Error::Validation("priority must be in 0..=100".into()));
		}
		let weight = input.weight.unwrap_or(1.0);
		if weight <= 0.0 {
			return Err(Error::Validation("weight must be positive".into()));
		}
		let now = now_ms();
		let channel = Channel {
			id: new_id(),
			name: input.name,
			channel_type: input.channel_type,
			base_url: input.base_url,
			api_key: input.api_key,
			models: input.models,
			priority,
			weight,
			status: ChannelStatus::Enabled,
			transformers: input.transformers,
			request_count: 0,
			success_count: 0,
			failure_count: 0,
			consecutive_failures: 0,
			last_failure_time: None,
			circuit_breaker_until: None,
			rate_limited_until: None,
			last_used_at: None,
			created_at: now,
			updated_at: now,
		};
		let conn = self.conn.lock();
		let result = conn.execute(
			"INSERT INTO channels (id, name, type, base_url, api_key, models, priority, weight,
				status, transformers, request_count, success_count, failure_count,
				consecutive_failures, created_at, updated_at)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, 0, 0, ?11, ?12)",
			params![
				channel.id,
				channel.name,
				channel.channel_type.as_str(),
				channel.base_url,
				channel.api_key,
				serde_json::to_string(&channel.models)?,
				channel.priority,
				channel.weight,
				channel.status.as_str(),
				channel
					.transformers
					.as_ref()
					.map(serde_json::to_string)
					.transpose()?,
				channel.created_at,
				channel.updated_at,
			],
		);
		match result {
			Ok(_) => Ok(channel),
			Err(rusqlite::Error::SqliteFailure(e, _))
				if e.code == rusqlite::ErrorCode::ConstraintViolation =>
			{
				Err(Error::Validation(format!("channel name {:?} already exists", channel.name)))
			},
			Err(e) => Err(e.into()),
		}
	}

	pub fn update_channel(&self, id: &str, update: ChannelUpdate) -> Result<Channel> {
		let mut channel = self.get_channel(id)?;
		if let Some(name) = update.name {
			if name.trim().is_empty() {
				return Err(Error::Validation("channel name must not be empty".into()));
			}
			channel.name = name;
		}
		if let Some(t) = update.channel_type {
			channel.channel_type = t;
		}
		if let Some(base_url) = update.base_url {
			channel.base_url = base_url;
		}
		if let Some(api_key) = update.api_key {
			channel.api_key = api_key;
		}
		if let Some(models) = update.models {
			if models.is_empty() {
				return Err(Error::Validation("channel must serve at least one model".into()));
			}
			channel.models = models;
		}
		if let Some(priority) = update.priority {
			if !(0..=100).contains(&priority) {
				return Err(Error::Validation("priority must be in 0..=100".into()));
			}
			channel.priority = priority;
		}
		if let Some(weight) = update.weight {
			if weight <= 0.0 {
				return Err(Error::Validation("weight must be positive".into()));
			}
			channel.weight = weight;
		}
		if let Some(status) = update.status {
			channel.status = status;
		}
		if let Some(enabled) = update.enabled {
			channel.status = if enabled { ChannelStatus::Enabled } else { ChannelStatus::Disabled };
		}
		if let Some(transformers) = update.transformers {
			channel.transformers = transformers;
		}
		channel.updated_at = now_ms();

		let conn = self.conn.lock();
		let updated = conn.execute(
			"UPDATE channels SET name = ?2, type = ?3, base_url = ?4, api_key = ?5, models = ?6,
				priority = ?7, weight = ?8, status = ?9, transformers = ?10, updated_at = ?11
			 WHERE id = ?1",
			params![
				channel.id,
				channel.name,
				channel.channel_type.as_str(),
				channel.base_url,
				channel.api_key,
				serde_json::to_string(&channel.models)?,
				channel.priority,
				channel.weight,
				channel.status.as_str(),
				channel
					.transformers
					.as_ref()
					.map(serde_json::to_string)
					.transpose()?,
				channel.updated_at,
			],
		)?;
		if updated == 0 {
			return Err(Error::NotFound(format!("channel {id}")));
		}
		drop(conn);
		self.cache.invalidate_channel(id);
		Ok(channel)
	}

	pub fn delete_channel(&self, id: &str) -> Result<bool> {
		let deleted = {
			let conn = self.conn.lock();
			conn.execute("DELETE FROM channels WHERE id = ?1", params![id])?
		};
		self.cache.invalidate_channel(id);
		Ok(deleted > 0)
	}

	/// Atomic usage bump: request count plus the success or failure counter,
	/// and the last-used stamp.
	pub fn increment_channel_usage(&self, id: &str, success: bool) -> Result<()> {
		let column = if success { "success_count" } else { "failure_count" };
		let sql = format!(
			"UPDATE channels SET request_count = request_count + 1,
				{column} = {column} + 1, last_used_at = ?2, updated_at = ?2
			 WHERE id = ?1"
		);
		let updated = {
			let conn = self.conn.lock();
			conn.execute(&sql, params![id, now_ms()])?
		};
		if updated == 0 {
			return Err(Error::NotFound(format!("channel {id}")));
		}
		self.cache.invalidate_channel(id);
		Ok(())
	}

	pub fn update_channel_status(
		&self,
		id: &str,
		status: ChannelStatus,
		until: Option<i64>,
	) -> Result<()> {
		let (breaker_until, rate_until) = match status {
			ChannelStatus::CircuitOpen => (until, None),
			ChannelStatus::RateLimited => (None, until),
			_ => (None, None),
		};
		let updated = {
			let conn = self.conn.lock();
			conn.execute(
				"UPDATE channels SET status = ?2, circuit_breaker_until = ?3,
					rate_limited_until = ?4, updated_at = ?5
				 WHERE id = ?1",
				params![id, status.as_str(), breaker_until, rate_until, now_ms()],
			)?
		};
		if updated == 0 {
			return Err(Error::NotFound(format!("channel {id}")));
		}
		self.cache.invalidate_channel(id);
		Ok(())
	}

	/// Bumps the consecutive-failure tally and returns the new value.
	pub fn mark_channel_failure(&self, id: &str) -> Result<i64> {
		let now = now_ms();
		let count = {
			let conn = self.conn.lock();
			conn.execute(
				"UPDATE channels SET consecutive_failures = consecutive_failures + 1,
					last_failure_time = ?2, updated_at = ?2
				 WHERE id = ?1",
				params![id, now],
			)?;
			conn.query_row(
				"SELECT consecutive_failures FROM channels WHERE id = ?1",
				params![id],
				|r| r.get::<_, i64>(0),
			)
			.optional()?
		};
		self.cache.invalidate_channel(id);
		count.ok_or_else(|| Error::NotFound(format!("channel {id}")))
	}

	pub fn clear_channel_failures(&self, id: &str) -> Result<()> {
		{
			let conn = self.conn.lock();
			conn.execute(
				"UPDATE channels SET consecutive_failures = 0, updated_at = ?2 WHERE id = ?1",
				params![id, now_ms()],
			)?;
		}
		self.cache.invalidate_channel(id);
		Ok(())
	}

	pub fn export_channels(&self) -> Result<ChannelExport> {
		Ok(ChannelExport {
			version: EXPORT_VERSION,
			exported_at: now_ms(),
			channels: self.list_channels()?,
		})
	}

	/// Imports an export envelope. With `replace_existing`, rows whose name
	/// already exists are overwritten; otherwise they are skipped.
	pub fn import_channels(&self, export: ChannelExport, replace_existing: bool) -> Result<usize> {
		if export.version > EXPORT_VERSION {
			return Err(Error::Validation(format!(
				"unsupported export version {}",
				export.version
			)));
		}
		let mut imported = 0;
		for channel in export.channels {
			let existing = self.get_channel_by_name(&channel.name);
			match existing {
				Ok(old) if replace_existing => {
					self.update_channel(
						&old.id,
						ChannelUpdate {
							channel_type: Some(channel.channel_type),
							base_url: Some(channel.base_url),
							api_key: Some(channel.api_key),
							models: Some(channel.models),
							priority: Some(channel.priority),
							weight: Some(channel.weight),
							status: Some(channel.status),
							transformers: Some(channel.transformers),
							..Default::default()
						},
					)?;
					imported += 1;
				},
				Ok(_) => {
					debug!(name = %channel.name, "skipping existing channel on import");
				},
				Err(Error::NotFound(_)) => {
					self.create_channel(ChannelInput {
						name: channel.name,
						channel_type: channel.channel_type,
						base_url: channel.base_url,
						api_key: channel.api_key,
						models: channel.models,
						priority: Some(channel.priority),
						weight: Some(channel.weight),
						transformers: channel.transformers,
					})?;
					imported += 1;
				},
				Err(e) => return Err(e),
			}
		}
		Ok(imported)
	}

	// ── request logs ────────────────────────────────────────────────────────

	/// Enqueues a request log row. A synchronous flush fires when the buffer
	/// crosses the high-water mark; otherwise rows wait for the periodic
	/// flush.
	pub fn log_request(&self, entry: RequestLogEntry) -> Result<()> {
		let should_flush = {
			let mut buffer = self.buffer.lock();
			if buffer.len() >= self.log_settings.batch_size {
				warn!(dropped = 1, "request log buffer full");
				buffer.remove(0);
			}
			buffer.push(entry);
			buffer.len() >= self.log_settings.high_water
		};
		if should_flush {
			self.flush_requests()?;
		}
		Ok(())
	}

	/// Writes all buffered rows in one transaction.
	pub fn flush_requests(&self) -> Result<usize> {
		let batch: Vec<RequestLogEntry> = {
			let mut buffer = self.buffer.lock();
			std::mem::take(&mut *buffer)
		};
		if batch.is_empty() {
			return Ok(0);
		}
		let count = batch.len();
		let mut conn = self.conn.lock();
		let tx = conn.transaction()?;
		{
			let mut stmt = tx.prepare_cached(
				"INSERT INTO requests (id, channel_id, model, method, path, status_code,
					latency, input_tokens, output_tokens, cached_tokens, success, error,
					timestamp, trace_id)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
			)?;
			for entry in &batch {
				stmt.execute(params![
					entry.id,
					entry.channel_id,
					entry.model,
					entry.method,
					entry.path,
					entry.status_code,
					entry.latency as i64,
					entry.input_tokens,
					entry.output_tokens,
					entry.cached_tokens,
					entry.success,
					entry.error,
					entry.timestamp,
					entry.trace_id,
				])?;
			}
		}
		tx.commit()?;
		debug!(rows = count, "flushed request log batch");
		Ok(count)
	}

	pub fn pending_log_count(&self) -> usize {
		self.buffer.lock().len()
	}

	fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<RequestLogEntry> {
		Ok(RequestLogEntry {
			id: row.get("id")?,
			channel_id: row.get("channel_id")?,
			model: row.get("model")?,
			method: row.get("method")?,
			path: row.get("path")?,
			status_code: row.get::<_, i64>("status_code")? as u16,
			latency: row.get::<_, i64>("latency")? as u64,
			input_tokens: row.get("input_tokens")?,
			output_tokens: row.get("output_tokens")?,
			cached_tokens: row.get("cached_tokens")?,
			success: row.get("success")?,
			error: row.get("error")?,
			timestamp: row.get("timestamp")?,
			trace_id: row.get("trace_id")?,
		})
	}

	pub fn get_requests(&self, limit: u32, offset: u32) -> Result<Vec<RequestLogEntry>> {
		let limit = limit.min(MAX_QUERY_LIMIT);
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT * FROM requests ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2",
		)?;
		let rows = stmt.query_map(params![limit, offset], Self::row_to_request)?;
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}

	pub fn get_requests_by_channel(
		&self,
		channel_id: &str,
		limit: u32,
	) -> Result<Vec<RequestLogEntry>> {
		let limit = limit.min(MAX_QUERY_LIMIT);
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT * FROM requests WHERE channel_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
		)?;
		let rows = stmt.query_map(params![channel_id, limit], Self::row_to_request)?;
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}

	/// Filtered page plus the total row count for the same filter. The
	/// returned limit/offset are the effective (clamped) values.
	pub fn get_requests_filtered(
		&self,
		query: &RequestQuery,
	) -> Result<(Vec<RequestLogEntry>, i64, u32, u32)> {
		if let (Some(since), Some(until)) = (query.since, query.until) {
			if since >= until {
				return Err(Error::Validation("since must be before until".into()));
			}
		}
		fn bind(
			clauses: &mut Vec<String>,
			args: &mut Vec<rusqlite::types::Value>,
			clause: &str,
			value: rusqlite::types::Value,
		) {
			args.push(value);
			clauses.push(clause.replace('?', &format!("?{}", args.len())));
		}
		let mut where_clauses: Vec<String> = Vec::new();
		let mut args: Vec<rusqlite::types::Value> = Vec::new();
		if let Some(status) = &query.status {
			match status.as_str() {
				"success" => where_clauses.push("success = 1".into()),
				"failure" | "error" => where_clauses.push("success = 0".into()),
				code => match code.parse::<i64>() {
					Ok(code) => bind(&mut where_clauses, &mut args, "status_code = ?", code.into()),
					Err(_) => {
						return Err(Error::Validation(format!("invalid status filter {status:?}")));
					},
				},
			}
		}
		if let Some(channel_id) = &query.channel_id {
			bind(&mut where_clauses, &mut args, "channel_id = ?", channel_id.clone().into());
		}
		if let Some(model) = &query.model {
			bind(&mut where_clauses, &mut args, "model = ?", model.clone().into());
		}
		if let Some(q) = &query.q {
			let like = format!("%{q}%");
			args.push(like.clone().into());
			args.push(like.clone().into());
			args.push(like.into());
			where_clauses.push(format!(
				"(path LIKE ?{} OR model LIKE ?{} OR error LIKE ?{})",
				args.len() - 2,
				args.len() - 1,
				args.len()
			));
		}
		if let Some(since) = query.since {
			bind(&mut where_clauses, &mut args, "timestamp >= ?", since.into());
		}
		if let Some(until) = query.until {
			bind(&mut where_clauses, &mut args, "timestamp < ?", until.into());
		}
		let where_sql = if where_clauses.is_empty() {
			String::new()
		} else {
			format!(" WHERE {}", where_clauses.join(" AND "))
		};
		let limit = query.limit.unwrap_or(100).min(MAX_QUERY_LIMIT);
		let offset = query.offset.unwrap_or(0);

		let conn = self.conn.lock();
		let total: i64 = conn.query_row(
			&format!("SELECT COUNT(*) FROM requests{where_sql}"),
			rusqlite::params_from_iter(args.iter()),
			|r| r.get(0),
		)?;
		let mut stmt = conn.prepare(&format!(
			"SELECT * FROM requests{where_sql} ORDER BY timestamp DESC LIMIT ?{} OFFSET ?{}",
			args.len() + 1,
			args.len() + 2
		))?;
		let mut full_args = args;
		full_args.push((limit as i64).into());
		full_args.push((offset as i64).into());
		let rows = stmt.query_map(rusqlite::params_from_iter(full_args.iter()), Self::row_to_request)?;
		let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
		Ok((rows, total, limit, offset))
	}

	pub fn get_analytics(&self) -> Result<Analytics> {
		let conn = self.conn.lock();
		conn
			.query_row(
				"SELECT COUNT(*),
					COALESCE(SUM(success), 0),
					COALESCE(SUM(1 - success), 0),
					COALESCE(AVG(latency), 0.0),
					COALESCE(SUM(input_tokens), 0),
					COALESCE(SUM(output_tokens), 0),
					COALESCE(SUM(cached_tokens), 0)
				 FROM requests",
				[],
				|row| {
					let input: i64 = row.get(4)?;
					let output: i64 = row.get(5)?;
					let cached: i64 = row.get(6)?;
					Ok(Analytics {
						total_requests: row.get(0)?,
						success_requests: row.get(1)?,
						failure_requests: row.get(2)?,
						avg_latency: row.get(3)?,
						total_input_tokens: input,
						total_output_tokens: output,
						total_cached_tokens: cached,
						estimated_cost: estimated_cost(input, output, cached),
					})
				},
			)
			.map_err(Into::into)
	}

	// ── routing rules ───────────────────────────────────────────────────────

	fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<RoutingRule> {
		let condition: String = row.get("condition")?;
		Ok(RoutingRule {
			id: row.get("id")?,
			name: row.get("name")?,
			rule_type: row.get("type")?,
			condition: serde_json::from_str(&condition).unwrap_or_default(),
			target_channel: row.get("target_channel")?,
			target_model: row.get("target_model")?,
			priority: row.get("priority")?,
			enabled: row.get("enabled")?,
			created_at: row.get("created_at")?,
			updated_at: row.get("updated_at")?,
		})
	}

	pub fn list_routing_rules(&self) -> Result<Vec<RoutingRule>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT * FROM routing_rules ORDER BY priority DESC, created_at ASC",
		)?;
		let rows = stmt.query_map([], Self::row_to_rule)?;
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}

	pub fn list_enabled_routing_rules(&self) -> Result<Vec<RoutingRule>> {
		if let Some(rules) = self.cache.get_enabled_rules() {
			return Ok(rules);
		}
		let rules = {
			let conn = self.conn.lock();
			let mut stmt = conn.prepare(
				"SELECT * FROM routing_rules WHERE enabled = 1
				 ORDER BY priority DESC, created_at ASC",
			)?;
			let rows = stmt.query_map([], Self::row_to_rule)?;
			rows.collect::<rusqlite::Result<Vec<_>>>()?
		};
		self.cache.put_enabled_rules(&rules);
		Ok(rules)
	}

	pub fn get_routing_rule(&self, id: &str) -> Result<RoutingRule> {
		let conn = self.conn.lock();
		conn
			.query_row(
				"SELECT * FROM routing_rules WHERE id = ?1",
				params![id],
				Self::row_to_rule,
			)
			.optional()?
			.ok_or_else(|| Error::NotFound(format!("routing rule {id}")))
	}

	pub fn create_routing_rule(&self, input: RoutingRuleInput) -> Result<RoutingRule> {
		if input.condition.is_empty() {
			return Err(Error::Validation(
				"routing rule condition must set at least one field".into(),
			));
		}
		let now = now_ms();
		let rule = RoutingRule {
			id: new_id(),
			name: input.name,
			rule_type: input.rule_type,
			condition: input.condition,
			target_channel: input.target_channel,
			target_model: input.target_model,
			priority: input.priority.unwrap_or(0),
			enabled: input.enabled.unwrap_or(true),
			created_at: now,
			updated_at: now,
		};
		{
			let conn = self.conn.lock();
			conn.execute(
				"INSERT INTO routing_rules (id, name, type, condition, target_channel,
					target_model, priority, enabled, created_at, updated_at)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
				params![
					rule.id,
					rule.name,
					rule.rule_type,
					serde_json::to_string(&rule.condition)?,
					rule.target_channel,
					rule.target_model,
					rule.priority,
					rule.enabled,
					rule.created_at,
					rule.updated_at,
				],
			)?;
		}
		self.cache.invalidate_rules();
		Ok(rule)
	}

	pub fn update_routing_rule(&self, id: &str, update: RoutingRuleUpdate) -> Result<RoutingRule> {
		let mut rule = self.get_routing_rule(id)?;
		if let Some(name) = update.name {
			rule.name = name;
		}
		if let Some(rule_type) = update.rule_type {
			rule.rule_type = rule_type;
		}
		if let Some(condition) = update.condition {
			if condition.is_empty() {
				return Err(Error::Validation(
					"routing rule condition must set at least one field".into(),
				));
			}
			rule.condition = condition;
		}
		if let Some(target_channel) = update.target_channel {
			rule.target_channel = target_channel;
		}
		if let Some(target_model) = update.target_model {
			rule.target_model = target_model;
		}
		if let Some(priority) = update.priority {
			rule.priority = priority;
		}
		if let Some(enabled) = update.enabled {
			rule.enabled = enabled;
		}
		rule.updated_at = now_ms();
		{
			let conn = self.conn.lock();
			conn.execute(
				"UPDATE routing_rules SET name = ?2, type = ?3, condition = ?4,
					target_channel = ?5, target_model = ?6, priority = ?7, enabled = ?8,
					updated_at = ?9
				 WHERE id = ?1",
				params![
					rule.id,
					rule.name,
					rule.rule_type,
					serde_json::to_string(&rule.condition)?,
					rule.target_channel,
					rule.target_model,
					rule.priority,
					rule.enabled,
					rule.updated_at,
				],
			)?;
		}
		self.cache.invalidate_rules();
		Ok(rule)
	}

	pub fn delete_routing_rule(&self, id: &str) -> Result<bool> {
		let deleted = {
			let conn = self.conn.lock();
			conn.execute("DELETE FROM routing_rules WHERE id = ?1", params![id])?
		};
		self.cache.invalidate_rules();
		Ok(deleted > 0)
	}

	// ── tee destinations ────────────────────────────────────────────────────

	fn row_to_tee(row: &rusqlite::Row) -> rusqlite::Result<TeeDestination> {
		let tee_type: String = row.get("type")?;
		let headers: Option<String> = row.get("headers")?;
		let filter: Option<String> = row.get("filter")?;
		Ok(TeeDestination {
			id: row.get("id")?,
			name: row.get("name")?,
			tee_type: serde_json::from_value(Value::String(tee_type))
				.unwrap_or(TeeType::Custom),
			enabled: row.get("enabled")?,
			url: row.get("url")?,
			method: row.get("method")?,
			headers: headers.and_then(|h| serde_json::from_str(&h).ok()),
			file_path: row.get("file_path")?,
			custom_handler: row.get("custom_handler")?,
			filter: filter.and_then(|f| serde_json::from_str(&f).ok()),
			retries: row.get::<_, i64>("retries")? as u32,
			timeout_ms: row.get::<_, i64>("timeout_ms")? as u64,
			created_at: row.get("created_at")?,
			updated_at: row.get("updated_at")?,
		})
	}

	pub fn list_tee_destinations(&self) -> Result<Vec<TeeDestination>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare("SELECT * FROM tee_destinations ORDER BY name ASC")?;
		let rows = stmt.query_map([], Self::row_to_tee)?;
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}

	pub fn list_enabled_tee_destinations(&self) -> Result<Vec<TeeDestination>> {
		Ok(self
			.list_tee_destinations()?
			.into_iter()
			.filter(|t| t.enabled)
			.collect())
	}

	pub fn get_tee_destination(&self, id: &str) -> Result<TeeDestination> {
		let conn = self.conn.lock();
		conn
			.query_row(
				"SELECT * FROM tee_destinations WHERE id = ?1",
				params![id],
				Self::row_to_tee,
			)
			.optional()?
			.ok_or_else(|| Error::NotFound(format!("tee destination {id}")))
	}

	pub fn create_tee_destination(&self, input: TeeDestinationInput) -> Result<TeeDestination> {
		let now = now_ms();
		let tee = TeeDestination {
			id: new_id(),
			name: input.name,
			tee_type: input.tee_type,
			enabled: input.enabled.unwrap_or(true),
			url: input.url,
			method: input.method,
			headers: input.headers,
			file_path: input.file_path,
			custom_handler: input.custom_handler,
			filter: input.filter,
			retries: input.retries.unwrap_or(0),
			timeout_ms: input.timeout_ms.unwrap_or(5000).min(30_000),
			created_at: now,
			updated_at: now,
		};
		tee.validate().map_err(Error::Validation)?;
		self.insert_tee(&tee)?;
		Ok(tee)
	}

	fn insert_tee(&self, tee: &TeeDestination) -> Result<()> {
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO tee_destinations (id, name, type, enabled, url, method, headers,
				file_path, custom_handler, filter, retries, timeout_ms, created_at, updated_at)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
			params![
				tee.id,
				tee.name,
				serde_json::to_value(tee.tee_type)?.as_str().unwrap_or("custom"),
				tee.enabled,
				tee.url,
				tee.method,
				tee.headers.as_ref().map(serde_json::to_string).transpose()?,
				tee.file_path,
				tee.custom_handler,
				tee.filter.as_ref().map(serde_json::to_string).transpose()?,
				tee.retries as i64,
				tee.timeout_ms as i64,
				tee.created_at,
				tee.updated_at,
			],
		)?;
		Ok(())
	}

	pub fn update_tee_destination(
		&self,
		id: &str,
		update: TeeDestinationUpdate,
	) -> Result<TeeDestination> {
		let mut tee = self.get_tee_destination(id)?;
		if let Some(name) = update.name {
			tee.name = name;
		}
		if let Some(tee_type) = update.tee_type {
			tee.tee_type = tee_type;
		}
		if let Some(enabled) = update.enabled {
			tee.enabled = enabled;
		}
		if let Some(url) = update.url {
			tee.url = url;
		}
		if let Some(method) = update.method {
			tee.method = method;
		}
		if let Some(headers) = update.headers {
			tee.headers = headers;
		}
		if let Some(file_path) = update.file_path {
			tee.file_path = file_path;
		}
		if let Some(custom_handler) = update.custom_handler {
			tee.custom_handler = custom_handler;
		}
		if let Some(filter) = update.filter {
			tee.filter = filter;
		}
		if let Some(retries) = update.retries {
			tee.retries = retries;
		}
		if let Some(timeout_ms) = update.timeout_ms {
			tee.timeout_ms = timeout_ms.min(30_000);
		}
		tee.updated_at = now_ms();
		tee.validate().map_err(Error::Validation)?;
		{
			let conn = self.conn.lock();
			conn.execute(
				"UPDATE tee_destinations SET name = ?2, type = ?3, enabled = ?4, url = ?5,
					method = ?6, headers = ?7, file_path = ?8, custom_handler = ?9, filter = ?10,
					retries = ?11, timeout_ms = ?12, updated_at = ?13
				 WHERE id = ?1",
				params![
					tee.id,
					tee.name,
					serde_json::to_value(tee.tee_type)?.as_str().unwrap_or("custom"),
					tee.enabled,
					tee.url,
					tee.method,
					tee.headers.as_ref().map(serde_json::to_string).transpose()?,
					tee.file_path,
					tee.custom_handler,
					tee.filter.as_ref().map(serde_json::to_string).transpose()?,
					tee.retries as i64,
					tee.timeout_ms as i64,
					tee.updated_at,
				],
			)?;
		}
		Ok(tee)
	}

	pub fn delete_tee_destination(&self, id: &str) -> Result<bool> {
		let conn = self.conn.lock();
		Ok(conn.execute("DELETE FROM tee_destinations WHERE id = ?1", params![id])? > 0)
	}

	// ── oauth sessions ──────────────────────────────────────────────────────

	fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<OAuthSession> {
		let scopes: String = row.get("scopes")?;
		let user_info: Option<String> = row.get("user_info")?;
		Ok(OAuthSession {
			id: row.get("id")?,
			channel_id: row.get("channel_id")?,
			provider: row.get("provider")?,
			access_token: row.get("access_token")?,
			refresh_token: row.get("refresh_token")?,
			expires_at: row.get("expires_at")?,
			scopes: serde_json::from_str(&scopes).unwrap_or_default(),
			user_info: user_info.and_then(|u| serde_json::from_str(&u).ok()),
			created_at: row.get("created_at")?,
			updated_at: row.get("updated_at")?,
		})
	}

	pub fn list_oauth_sessions(&self) -> Result<Vec<OAuthSession>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare("SELECT * FROM oauth_sessions ORDER BY created_at DESC")?;
		let rows = stmt.query_map([], Self::row_to_session)?;
		Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
	}

	pub fn get_oauth_session(&self, id: &str) -> Result<OAuthSession> {
		let conn = self.conn.lock();
		conn
			.query_row(
				"SELECT * FROM oauth_sessions WHERE id = ?1",
				params![id],
				Self::row_to_session,
			)
			.optional()?
			.ok_or_else(|| Error::NotFound(format!("oauth session {id}")))
	}

	pub fn create_oauth_session(&self, input: OAuthSessionInput) -> Result<OAuthSession> {
		if input.access_token.is_empty() {
			return Err(Error::Validation("access token must not be empty".into()));
		}
		let now = now_ms();
		let session = OAuthSession {
			id: new_id(),
			channel_id: input.channel_id,
			provider: input.provider,
			access_token: input.access_token,
			refresh_token: input.refresh_token,
			expires_at: input.expires_at,
			scopes: input.scopes,
			user_info: input.user_info,
			created_at: now,
			updated_at: now,
		};
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO oauth_sessions (id, channel_id, provider, access_token, refresh_token,
				expires_at, scopes, user_info, created_at, updated_at)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
			params![
				session.id,
				session.channel_id,
				session.provider,
				session.access_token,
				session.refresh_token,
				session.expires_at,
				serde_json::to_string(&session.scopes)?,
				session.user_info.as_ref().map(serde_json::to_string).transpose()?,
				session.created_at,
				session.updated_at,
			],
		)?;
		Ok(session)
	}

	/// Replaces tokens after a refresh. `expires_at` never moves backwards.
	pub fn update_oauth_tokens(
		&self,
		id: &str,
		access_token: String,
		refresh_token: Option<String>,
		expires_at: i64,
	) -> Result<OAuthSession> {
		let session = self.get_oauth_session(id)?;
		let expires_at = expires_at.max(session.expires_at);
		{
			let conn = self.conn.lock();
			conn.execute(
				"UPDATE oauth_sessions SET access_token = ?2, refresh_token = COALESCE(?3, refresh_token),
					expires_at = ?4, updated_at = ?5
				 WHERE id = ?1",
				params![id, access_token, refresh_token, expires_at, now_ms()],
			)?;
		}
		self.get_oauth_session(id)
	}

	pub fn link_oauth_session(&self, id: &str, channel_id: Option<String>) -> Result<OAuthSession> {
		let updated = {
			let conn = self.conn.lock();
			conn.execute(
				"UPDATE oauth_sessions SET channel_id = ?2, updated_at = ?3 WHERE id = ?1",
				params![id, channel_id, now_ms()],
			)?
		};
		if updated == 0 {
			return Err(Error::NotFound(format!("oauth session {id}")));
		}
		self.get_oauth_session(id)
	}

	pub fn delete_oauth_session(&self, id: &str) -> Result<bool> {
		let conn = self.conn.lock();
		Ok(conn.execute("DELETE FROM oauth_sessions WHERE id = ?1", params![id])? > 0)
	}

	/// Final flush; call on shutdown.
	pub fn close(&self) {
		if let Err(e) = self.flush_requests() {
			warn!(error = %e, "final request log flush failed");
		}
	}

	pub fn metrics(&self) -> &Arc<Registry> {
		&self.metrics
	}
}
