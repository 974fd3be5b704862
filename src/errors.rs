use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde_json::{Value, json};

/// Error taxonomy for the whole pipeline. Every variant carries a stable code
/// and maps to one HTTP status; the admin API and the proxy surface both
/// render errors through [`Error::into_response`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("{0}")]
	Validation(String),
	#[error("{0}")]
	Authentication(String),
	#[error("{0} not found")]
	NotFound(String),
	#[error("rate limit exceeded: {0}")]
	RateLimit(String),
	#[error("channel {channel} unavailable until {until}")]
	CircuitBreakerOpen { channel: String, until: i64 },
	#[error("no available channel")]
	NoAvailableChannel,
	#[error("channel error: {0}")]
	Channel(String),
	#[error("routing error: {0}")]
	Routing(String),
	#[error("transformer error: {0}")]
	Transformer(String),
	#[error("configuration error: {0}")]
	Configuration(String),
	#[error("storage error: {0}")]
	Storage(String),
	/// Upstream returned a non-2xx status. Kept separate so the retry layer
	/// can classify by status code.
	#[error("upstream returned {status}")]
	Http { status: u16, body: String },
	#[error("upstream call failed: {0}")]
	Upstream(#[from] reqwest::Error),
	#[error("internal error: {0}")]
	Internal(String),
}

impl Error {
	pub fn code(&self) -> &'static str {
		match self {
			Error::Validation(_) => "VALIDATION_ERROR",
			Error::Authentication(_) => "AUTHENTICATION_ERROR",
			Error::NotFound(_) => "NOT_FOUND",
			Error::RateLimit(_) => "RATE_LIMIT_EXCEEDED",
			Error::CircuitBreakerOpen { .. } => "CIRCUIT_BREAKER_OPEN",
			Error::NoAvailableChannel => "NO_AVAILABLE_CHANNEL",
			Error::Channel(_) => "CHANNEL_ERROR",
			Error::Routing(_) => "ROUTING_ERROR",
			Error::Transformer(_) => "TRANSFORMER_ERROR",
			Error::Configuration(_) => "CONFIGURATION_ERROR",
			Error::Storage(_) => "STORAGE_ERROR",
			Error::Http { .. } | Error::Upstream(_) => "CHANNEL_ERROR",
			Error::Internal(_) => "INTERNAL_ERROR",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			Error::Validation(_) => StatusCode::BAD_REQUEST,
			Error::Authentication(_) => StatusCode::UNAUTHORIZED,
			Error::NotFound(_) => StatusCode::NOT_FOUND,
			Error::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
			Error::CircuitBreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
			Error::NoAvailableChannel => StatusCode::SERVICE_UNAVAILABLE,
			Error::Http { status, .. } => {
				StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
			},
			Error::Upstream(_) => StatusCode::BAD_GATEWAY,
			Error::Channel(_)
			| Error::Routing(_)
			| Error::Transformer(_)
			| Error::Configuration(_)
			| Error::Storage(_)
			| Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn details(&self) -> Option<Value> {
		match self {
			Error::CircuitBreakerOpen { channel, until } => {
				Some(json!({"channel": channel, "until": until}))
			},
			Error::Http { status, body } => Some(json!({"status": status, "body": body})),
			_ => None,
		}
	}

	pub fn envelope(&self) -> Value {
		let mut error = json!({
			"type": self.code(),
			"code": self.code(),
			"message": self.to_string(),
		});
		if let Some(details) = self.details() {
			error["details"] = details;
		}
		json!({"success": false, "error": error})
	}
}

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		(self.status(), Json(self.envelope())).into_response()
	}
}

impl From<rusqlite::Error> for Error {
	fn from(e: rusqlite::Error) -> Self {
		match e {
			rusqlite::Error::QueryReturnedNoRows => Error::NotFound("row".to_string()),
			other => Error::Storage(other.to_string()),
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Error::Validation(e.to_string())
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_and_statuses_line_up() {
		let cases = [
			(Error::Validation("bad".into()), 400, "VALIDATION_ERROR"),
			(Error::NotFound("channel".into()), 404, "NOT_FOUND"),
			(Error::NoAvailableChannel, 503, "NO_AVAILABLE_CHANNEL"),
			(
				Error::CircuitBreakerOpen { channel: "a".into(), until: 5 },
				503,
				"CIRCUIT_BREAKER_OPEN",
			),
			(Error::RateLimit("slow down".into()), 429, "RATE_LIMIT_EXCEEDED"),
			(Error::Storage("disk".into()), 500, "STORAGE_ERROR"),
		];
		for (err, status, code) in cases {
			assert_eq!(err.status().as_u16(), status, "{err}");
			assert_eq!(err.code(), code, "{err}");
		}
	}

	#[test]
	fn envelope_shape() {
		let env = Error::NotFound("channel".into()).envelope();
		assert_eq!(env["success"], false);
		assert_eq!(env["error"]["code"], "NOT_FOUND");
		assert!(env["error"]["message"].as_str().unwrap().contains("channel"));
	}

	#[test]
	fn upstream_status_passes_through() {
		let err = Error::Http { status: 429, body: "slow".into() };
		assert_eq!(err.status().as_u16(), 429);
		assert_eq!(err.details().unwrap()["status"], 429);
	}
}
