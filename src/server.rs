//! HTTP surface (spec §6).
//!
//! Thin routing layer over `Pipeline`: no TLS termination, no CORS layer, no
//! OpenAPI docs (those are out-of-scope collaborators per spec §1). Grounded
//! on the teacher's `metrics::App` shape -- a small state struct holding
//! whatever the handlers need, exposing a `router()` that the binary mounts
//! with `axum::serve`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::config::Config;
use crate::error::GatewayError;
use crate::llm::anthropic::{MessageRequest, SseEvent};
use crate::llm::resolver;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct App {
	pipeline: Arc<Pipeline>,
	config: Arc<Config>,
	started_at: Instant,
}

impl App {
	pub fn new(pipeline: Arc<Pipeline>, config: Arc<Config>) -> Self {
		App {
			pipeline,
			config,
			started_at: Instant::now(),
		}
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/v1/messages", post(messages_handler))
			.route("/v1/models", get(models_handler))
			.route("/health", get(health_handler))
			.route("/ready", get(health_handler))
			.route("/liveness", get(health_handler))
			.with_state(self.clone())
	}
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let retry_after = self.retry_after_seconds();
		let mut response = (self.status_code(), Json(self.into_response_body())).into_response();
		if let Some(seconds) = retry_after {
			response
				.headers_mut()
				.insert(axum::http::header::RETRY_AFTER, seconds.into());
		}
		response
	}
}

fn extract_api_key<'a>(headers: &'a HeaderMap, config: &Config) -> Option<&'a str> {
	headers
		.get(config.api_key_header.as_str())
		.and_then(|v| v.to_str().ok())
}

/// Merges the `anthropic-beta` header (spec §6: `feature[,feature…]`) into
/// the body's own `anthropic_beta` list, so both surfaces feed the same
/// translation path.
fn merge_beta_header(request: &mut MessageRequest, headers: &HeaderMap) {
	let Some(value) = headers.get("anthropic-beta").and_then(|v| v.to_str().ok()) else {
		return;
	};
	for feature in value.split(',') {
		let feature = feature.trim();
		if !feature.is_empty() && !request.anthropic_beta.iter().any(|b| b == feature) {
			request.anthropic_beta.push(feature.to_string());
		}
	}
}

async fn messages_handler(
	State(app): State<App>,
	headers: HeaderMap,
	Json(mut request): Json<MessageRequest>,
) -> Response {
	merge_beta_header(&mut request, &headers);
	let api_key = extract_api_key(&headers, &app.config).map(str::to_string);

	if request.stream {
		return match app.pipeline.handle_stream(api_key.as_deref(), request).await {
			Ok(stream) => sse_response(stream),
			Err(err) => err.into_response(),
		};
	}

	match app.pipeline.handle_unary(api_key.as_deref(), request).await {
		Ok(response) => Json(response).into_response(),
		Err(err) => err.into_response(),
	}
}

fn sse_response(
	events: impl Stream<Item = SseEvent> + Send + 'static,
) -> Response {
	let frames = events.map(|event| {
		let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
		Ok::<_, std::convert::Infallible>(Event::default().event(event.event_name()).data(data))
	});
	Sse::new(frames)
		.keep_alive(KeepAlive::new().text("ping"))
		.into_response()
}

#[derive(Debug, Serialize)]
struct ModelInfo {
	id: String,
	name: String,
	provider: &'static str,
	input_modalities: Vec<&'static str>,
	output_modalities: Vec<&'static str>,
	streaming_supported: bool,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
	data: Vec<ModelInfo>,
}

async fn models_handler() -> Json<ModelsResponse> {
	let data = resolver::known_model_ids()
		.map(|id| ModelInfo {
			id: id.to_string(),
			name: id.to_string(),
			provider: "anthropic",
			input_modalities: vec!["text", "image"],
			output_modalities: vec!["text"],
			streaming_supported: true,
		})
		.collect();
	Json(ModelsResponse { data })
}

#[derive(Debug, Serialize)]
struct HealthServices {
	bedrock: &'static str,
	store: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
	status: &'static str,
	timestamp: chrono::DateTime<chrono::Utc>,
	uptime_seconds: u64,
	version: &'static str,
	services: HealthServices,
}

async fn health_handler(State(app): State<App>) -> Json<HealthResponse> {
	Json(HealthResponse {
		status: "ok",
		timestamp: chrono::Utc::now(),
		uptime_seconds: app.started_at.elapsed().as_secs(),
		version: env!("CARGO_PKG_VERSION"),
		services: HealthServices {
			bedrock: "ok",
			store: "ok",
		},
	})
}
