mod channels;
mod health;
mod oauth;
mod observability;
mod proxy;
mod requests;
mod rules;
mod system;
mod tee;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::Request;
use axum::http::{HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get, post};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::balance::{LoadBalancer, Strategy};
use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::errors::Result;
use crate::metrics::Registry;
use crate::oauth::OAuthManager;
use crate::proxy::ProxyEngine;
use crate::retry::RetryPolicy;
use crate::route::SmartRouter;
use crate::store::Store;
use crate::tee::TeeStream;
use crate::trace::Tracer;
use crate::transform::TransformerRegistry;
use crate::types::new_id;
use crate::warm::CacheWarmer;

pub const SERVER_NAME: &str = "routex";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything the HTTP surface needs, wired once at startup. Ownership is a
/// DAG: the engine references the components, nothing references the engine.
pub struct App {
	pub config: Config,
	pub store: Arc<Store>,
	pub balancer: Arc<LoadBalancer>,
	pub breaker: Arc<CircuitBreaker>,
	pub router: Arc<SmartRouter>,
	pub transformers: Arc<TransformerRegistry>,
	pub tracer: Arc<Tracer>,
	pub metrics: Arc<Registry>,
	pub tee: Arc<TeeStream>,
	pub warmer: Arc<CacheWarmer>,
	pub oauth: Arc<OAuthManager>,
	pub engine: Arc<ProxyEngine>,
	pub started_at: Instant,
	pub locale: RwLock<String>,
	pub log_level: RwLock<String>,
}

pub type AppState = Arc<App>;

impl App {
	pub fn build(config: Config) -> Result<AppState> {
		let metrics = Arc::new(Registry::with_defaults());
		let store = Arc::new(Store::open(
			&config.data_dir.join("routex.db"),
			config.request_log,
			std::time::Duration::from_millis(config.cache_ttl_ms),
			metrics.clone(),
		)?);
		Self::build_with_store(config, store, metrics)
	}

	pub fn build_in_memory(config: Config) -> Result<AppState> {
		let metrics = Arc::new(Registry::with_defaults());
		let store = Arc::new(Store::open_in_memory(
			config.request_log,
			std::time::Duration::from_millis(config.cache_ttl_ms),
			metrics.clone(),
		)?);
		Self::build_with_store(config, store, metrics)
	}

	fn build_with_store(config: Config, store: Arc<Store>, metrics: Arc<Registry>) -> Result<AppState> {
		let strategy: Strategy = config.strategy.parse()?;
		let balancer = Arc::new(LoadBalancer::new(strategy));
		let breaker = Arc::new(CircuitBreaker::new(config.breaker, store.clone(), metrics.clone()));
		let router = Arc::new(SmartRouter::new());
		router.reload(store.list_enabled_routing_rules()?);
		let transformers = Arc::new(TransformerRegistry::with_builtins());
		let tracer = Arc::new(Tracer::default());
		let tee = Arc::new(TeeStream::new(config.tee_workers, metrics.clone()));
		tee.refresh(store.list_enabled_tee_destinations()?);
		let warmer = Arc::new(CacheWarmer::new(store.clone(), balancer.clone(), config.warmer));
		let oauth = Arc::new(OAuthManager::new(store.clone()));
		let engine = Arc::new(ProxyEngine::new(
			store.clone(),
			balancer.clone(),
			breaker.clone(),
			router.clone(),
			transformers.clone(),
			tracer.clone(),
			metrics.clone(),
			tee.clone(),
			RetryPolicy::from(config.retry),
		));
		let locale = RwLock::new(config.locale.clone());
		Ok(Arc::new(App {
			config,
			store,
			balancer,
			breaker,
			router,
			transformers,
			tracer,
			metrics,
			tee,
			warmer,
			oauth,
			engine,
			started_at: Instant::now(),
			locale,
			log_level: RwLock::new("info".to_string()),
		}))
	}

	/// Long-lived background tasks: request-log flush, cache warm refresh,
	/// session-affinity sweep.
	pub fn spawn_background(self: &AppState) {
		let store = self.store.clone();
		let flush_interval = self.config.request_log.flush_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(flush_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				if let Err(e) = store.flush_requests() {
					warn!(error = %e, "periodic request flush failed");
				}
			}
		});

		let balancer = self.balancer.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				let removed = balancer.sweep_expired_sessions();
				if removed > 0 {
					info!(removed, "expired session affinities swept");
				}
			}
		});

		self.warmer.spawn();
	}

	pub fn refresh_channel_gauges(&self) {
		if let Ok(all) = self.store.list_channels() {
			let enabled = all.iter().filter(|c| c.is_enabled()).count();
			self.metrics.set_gauge("routex_channels", all.len() as f64, &[]);
			self.metrics.set_gauge("routex_channels_enabled", enabled as f64, &[]);
		}
	}

	/// Final flush and store close; call on graceful shutdown.
	pub fn shutdown(&self) {
		info!("shutting down");
		self.store.close();
	}
}

pub fn ok<T: Serialize>(data: T) -> axum::Json<serde_json::Value> {
	axum::Json(json!({"success": true, "data": data}))
}

async fn request_id_layer(req: Request, next: Next) -> Response {
	let incoming = req
		.headers()
		.get("x-request-id")
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let id = incoming.unwrap_or_else(new_id);
	let mut response = next.run(req).await;
	if let Ok(value) = HeaderValue::from_str(&id) {
		response.headers_mut().insert("x-request-id", value);
	}
	response
}

fn cors_layer(config: &Config) -> CorsLayer {
	let layer = CorsLayer::new()
		.allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
		.allow_headers(Any);
	if config.cors_origins.iter().any(|o| o == "*") {
		layer.allow_origin(Any)
	} else {
		let origins: Vec<HeaderValue> = config
			.cors_origins
			.iter()
			.filter_map(|o| o.parse().ok())
			.collect();
		layer.allow_origin(AllowOrigin::list(origins))
	}
}

async fn identity(state: axum::extract::State<AppState>) -> axum::Json<serde_json::Value> {
	let channels = state.store.list_channels().map(|c| c.len()).unwrap_or(0);
	let rules = state.router.rule_count();
	ok(json!({
		"name": SERVER_NAME,
		"version": VERSION,
		"strategy": state.balancer.strategy().as_str(),
		"channels": channels,
		"rules": rules,
		"uptimeSeconds": state.started_at.elapsed().as_secs(),
	}))
}

/// The full administrative surface plus the `/v1/*` proxy dispatch.
pub fn build_router(state: AppState) -> Router {
	let cors = cors_layer(&state.config);
	Router::new()
		.route("/health", get(health::health))
		.route("/health/live", get(health::live))
		.route("/health/ready", get(health::ready))
		.route("/health/detailed", get(health::detailed))
		.route("/api", get(identity))
		// channels
		.route("/api/channels", get(channels::list).post(channels::create))
		.route("/api/channels/export", get(channels::export))
		.route("/api/channels/import", post(channels::import))
		.route("/api/channels/test/all", post(channels::test_all))
		.route("/api/channels/test/enabled", post(channels::test_enabled))
		.route(
			"/api/channels/{id}",
			get(channels::get_one).put(channels::update).delete(channels::delete),
		)
		.route("/api/channels/{id}/test", post(channels::test_one))
		// request logs + analytics
		.route("/api/requests", get(requests::list))
		.route("/api/analytics", get(requests::analytics))
		// routing rules
		.route("/api/routing/rules", get(rules::list).post(rules::create))
		.route("/api/routing/rules/reload", post(rules::reload))
		.route("/api/routing/rules/test", post(rules::test))
		.route(
			"/api/routing/rules/{id}",
			get(rules::get_one).put(rules::update).delete(rules::delete),
		)
		.route("/api/routing/rules/{id}/enable", post(rules::enable))
		.route("/api/routing/rules/{id}/disable", post(rules::disable))
		// load balancer strategy
		.route("/api/load-balancer/strategy", get(system::get_strategy).put(system::put_strategy))
		.route("/api/strategy", get(system::get_strategy).put(system::put_strategy))
		// tee destinations
		.route("/api/tee", get(tee::list).post(tee::create))
		.route("/api/tee/{id}", get(tee::get_one).put(tee::update).delete(tee::delete))
		// metrics + tracing
		.route("/api/metrics", get(observability::metrics_json))
		.route("/api/metrics/all", get(observability::metrics_all))
		.route("/api/metrics/reset", post(observability::metrics_reset))
		.route("/metrics", get(observability::prometheus))
		.route("/api/tracing/stats", get(observability::tracing_stats))
		.route("/api/tracing/traces/{trace_id}", get(observability::get_trace))
		.route("/api/tracing/spans/{span_id}", get(observability::get_span))
		.route("/api/tracing/clear", post(observability::tracing_clear))
		// i18n + runtime config + caches
		.route("/api/i18n/locale", get(system::get_locale).put(system::put_locale))
		.route("/api/config", get(system::get_config).put(system::put_config))
		.route("/api/logging/level", get(system::get_log_level).put(system::put_log_level))
		.route("/api/database/cache/stats", get(system::cache_stats))
		.route("/api/cache/stats", get(system::warmer_stats))
		.route("/api/cache/invalidate", post(system::cache_invalidate))
		.route("/api/cache/warm", post(system::cache_warm))
		// oauth
		.route("/api/oauth/providers", get(oauth::providers))
		.route("/api/oauth/authorize-url", post(oauth::authorize_url))
		.route("/api/oauth/exchange", post(oauth::exchange))
		.route("/api/oauth/sessions", get(oauth::sessions))
		.route("/api/oauth/sessions/{id}/refresh", post(oauth::refresh))
		.route("/api/oauth/sessions/{id}/link", post(oauth::link))
		.route("/api/oauth/sessions/{id}", axum::routing::delete(oauth::revoke))
		// the proxy itself
		.route("/v1/{*path}", any(proxy::dispatch))
		.layer(middleware::from_fn(request_id_layer))
		.layer(cors)
		.with_state(state)
}

#[cfg(test)]
mod tests;
