//! Crate-wide error taxonomy.
//!
//! Every error that can reach a client is classified exactly once, here,
//! into one of the kinds from spec §7. Components raise the most specific
//! variant available; the orchestrator never has to re-guess what kind of
//! failure it is looking at.

use http::StatusCode;
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
	#[error("authentication failed: {0}")]
	Authentication(#[from] crate::auth::AuthFailure),

	#[error("permission denied")]
	Permission,

	#[error("rate limit exceeded, retry after {retry_after_seconds}s")]
	RateLimited { retry_after_seconds: u64 },

	#[error("invalid request: {0}")]
	InvalidRequest(#[from] crate::llm::translate::TranslateError),

	#[error("model not found: {0}")]
	NotFound(String),

	#[error("backend overloaded: {0}")]
	Overloaded(String),

	#[error("backend error: {0}")]
	Backend(String),

	#[error("request body too large")]
	RequestTooLarge,

	#[error("stream idle timeout exceeded")]
	StreamTimeout,

	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

/// Anthropic-shaped `{type, message}` error body (spec §6, §7).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
	#[serde(rename = "type")]
	pub kind: &'static str,
	pub message: String,
}

impl GatewayError {
	pub fn status_code(&self) -> StatusCode {
		match self {
			GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
			GatewayError::Permission => StatusCode::FORBIDDEN,
			GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
			// 529 is non-standard but is what the Anthropic API itself returns for overload.
			GatewayError::Overloaded(_) => StatusCode::from_u16(529).unwrap(),
			GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
			GatewayError::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			// Never actually sent as an HTTP status: by the time a stream can
			// time out, a 200 with the SSE headers has already gone out.
			GatewayError::StreamTimeout => StatusCode::INTERNAL_SERVER_ERROR,
			GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// The `type` discriminator used in the Anthropic error body (spec §7 table).
	pub fn error_kind(&self) -> &'static str {
		match self {
			GatewayError::Authentication(_) => "authentication_error",
			GatewayError::Permission => "permission_error",
			GatewayError::RateLimited { .. } => "rate_limit_error",
			GatewayError::InvalidRequest(_) => "invalid_request_error",
			GatewayError::NotFound(_) => "not_found_error",
			GatewayError::Overloaded(_) => "overloaded_error",
			GatewayError::Backend(_) => "api_error",
			GatewayError::RequestTooLarge => "invalid_request_error",
			GatewayError::StreamTimeout => "stream_timeout",
			GatewayError::Internal(_) => "internal_error",
		}
	}

	pub fn into_response_body(&self) -> ErrorResponse {
		ErrorResponse {
			kind: self.error_kind(),
			message: self.to_string(),
		}
	}

	/// `Retry-After` header value, when applicable.
	pub fn retry_after_seconds(&self) -> Option<u64> {
		match self {
			GatewayError::RateLimited {
				retry_after_seconds,
			} => Some(*retry_after_seconds),
			_ => None,
		}
	}
}

/// A single Anthropic SSE `error` event, emitted mid-stream (spec §4.4).
#[derive(Debug, Clone, Serialize)]
pub struct StreamError {
	pub error: ErrorResponse,
}

impl StreamError {
	pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
		StreamError {
			error: ErrorResponse {
				kind,
				message: message.into(),
			},
		}
	}

	pub fn stream_timeout() -> Self {
		Self::new("stream_timeout", "stream idle timeout exceeded")
	}
}
