//! Pipeline Orchestrator (spec §4.9).
//!
//! Wires authenticate -> rate-limit -> resolve -> translate -> invoke ->
//! translate-back -> record, built once at startup and held by reference
//! rather than as an implicit singleton (spec §9 "Global state").

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::auth::{self, KeyContext};
use crate::config::Config;
use crate::error::GatewayError;
use crate::invoker::Backend;
use crate::llm::anthropic as a;
use crate::llm::translate::{ModelFamily, TranslateError, translate_request, translate_response};
use crate::llm::{resolver, translate::stream::StreamTranslator};
use crate::ratelimit::{Decision, RateLimiter};
use crate::store::KeyRepository;
use crate::usage::{self, UsageAccumulator};

pub struct Pipeline {
	config: Arc<Config>,
	repo: Arc<dyn KeyRepository>,
	limiter: Arc<RateLimiter>,
	backend: Arc<dyn Backend>,
}

impl Pipeline {
	pub fn new(config: Arc<Config>, repo: Arc<dyn KeyRepository>, backend: Arc<dyn Backend>) -> Self {
		let limiter = Arc::new(RateLimiter::new(
			config.rate_limit_requests,
			config.rate_limit_window,
			config.rate_limit_bucket_ttl,
		));
		Pipeline {
			config,
			repo,
			limiter,
			backend,
		}
	}

	/// Starts the idle-bucket eviction sweep (spec §4.7 Eviction) as a
	/// detached background task, grounded on the teacher's `sync_jwks_loop`
	/// periodic-refresh pattern in `authn.rs`.
	pub fn spawn_bucket_eviction(&self) {
		let limiter = self.limiter.clone();
		let ttl = self.config.rate_limit_bucket_ttl;
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(ttl);
			loop {
				interval.tick().await;
				limiter.evict_idle();
			}
		});
	}

	async fn authenticate(&self, raw_key: Option<&str>) -> Result<KeyContext, GatewayError> {
		auth::authenticate(self.repo.as_ref(), &self.config, raw_key)
			.await
			.map_err(GatewayError::Authentication)
	}

	fn check_rate_limit(&self, ctx: &KeyContext) -> Result<(), GatewayError> {
		if ctx.is_admin || !self.config.rate_limit_enabled {
			return Ok(());
		}
		let capacity = ctx.rate_limit_capacity(self.config.rate_limit_requests);
		let window = ctx.rate_limit_window_seconds(self.config.rate_limit_window.as_secs());
		match self.limiter.consume(&ctx.key.key, Some(capacity), Some(window), 1) {
			Decision::Allow { .. } => Ok(()),
			Decision::Deny { retry_after_seconds } => Err(GatewayError::RateLimited { retry_after_seconds }),
		}
	}

	/// Steps 3-5 of spec §4.9: resolve, translate, invoke. Shared between the
	/// unary and streaming paths; only the response-side step differs.
	async fn translate_and_resolve(
		&self,
		ctx: &KeyContext,
		request: &mut a::MessageRequest,
	) -> Result<(String, crate::llm::bedrock::ConverseRequest), GatewayError> {
		apply_feature_gates(request, &self.config)?;

		let backend_model_id = resolver::resolve(self.repo.as_ref(), &request.model).await;
		let family = ModelFamily::detect(&backend_model_id);
		let service_tier = ctx.service_tier(self.config.default_service_tier);

		let translation = translate_request(
			request,
			&backend_model_id,
			family,
			service_tier,
			&self.config.beta_header_map,
		)?;

		Ok((backend_model_id, translation.converse_request))
	}

	/// Unary request path (spec §4.9 step 5).
	pub async fn handle_unary(
		&self,
		raw_key: Option<&str>,
		mut request: a::MessageRequest,
	) -> Result<a::MessageResponse, GatewayError> {
		let ctx = self.authenticate(raw_key).await?;
		self.check_rate_limit(&ctx)?;

		let request_id = generate_request_id();
		let requested_model = request.model.clone();
		let outcome = self.run_unary(&ctx, &mut request).await;

		let accumulator = UsageAccumulator::default();
		match &outcome {
			Ok(resp) => {
				accumulator.input_tokens.store(Some(resp.usage.input_tokens));
				accumulator.output_tokens.store(Some(resp.usage.output_tokens));
				accumulator
					.cache_read_tokens
					.store(Some(resp.usage.cache_read_input_tokens));
				accumulator
					.cache_write_tokens
					.store(Some(resp.usage.cache_creation_input_tokens));
			}
			Err(err) => accumulator.error_message.store(Some(err.to_string())),
		}
		usage::record_usage(
			self.repo.clone(),
			ctx.key.key.clone(),
			request_id,
			requested_model,
			accumulator,
			outcome.is_ok(),
		);

		outcome
	}

	async fn run_unary(
		&self,
		ctx: &KeyContext,
		request: &mut a::MessageRequest,
	) -> Result<a::MessageResponse, GatewayError> {
		let (backend_model_id, converse_request) = self.translate_and_resolve(ctx, request).await?;
		let response = self.backend.invoke(&backend_model_id, converse_request).await?;
		Ok(translate_response(&response, &request.model))
	}

	/// Streaming request path (spec §4.9 step 4). Returns the translated SSE
	/// event stream; everything up to and including opening the Bedrock
	/// stream can still fail with a classifiable `GatewayError` (surfaced as a
	/// normal JSON error response, before any SSE bytes go out). Once the
	/// stream is returned, failures are carried as in-band `error` events
	/// (spec §4.4) rather than as a `Result::Err`.
	pub async fn handle_stream(
		&self,
		raw_key: Option<&str>,
		mut request: a::MessageRequest,
	) -> Result<BoxStream<'static, a::SseEvent>, GatewayError> {
		let ctx = self.authenticate(raw_key).await?;
		self.check_rate_limit(&ctx)?;

		let request_id = generate_request_id();
		let requested_model = request.model.clone();
		let (backend_model_id, converse_request) = self.translate_and_resolve(&ctx, &mut request).await?;
		let frames = self.backend.invoke_stream(&backend_model_id, converse_request).await?;

		Ok(Box::pin(translated_stream(
			frames,
			requested_model,
			self.repo.clone(),
			ctx.key.key.clone(),
			request_id,
		)))
	}
}

/// Fires a `UsageRecord` write when dropped, with whatever usage fields were
/// accumulated up to that point. Covers both normal completion and consumer
/// cancellation (spec §5: "in-flight usage recording still completes
/// best-effort") with one code path, grounded on the teacher's
/// `Deferred`/`DeferRecorder` drop-triggered recording in `metrics.rs`.
struct UsageGuard {
	repo: Arc<dyn KeyRepository>,
	api_key: String,
	request_id: String,
	model: String,
	accumulator: UsageAccumulator,
	success: Arc<AtomicBool>,
}

impl Drop for UsageGuard {
	fn drop(&mut self) {
		usage::record_usage(
			self.repo.clone(),
			self.api_key.clone(),
			self.request_id.clone(),
			self.model.clone(),
			self.accumulator.clone(),
			self.success.load(Ordering::Relaxed),
		);
	}
}

fn translated_stream(
	mut frames: BoxStream<'static, Result<crate::llm::bedrock::ConverseStreamOutput, GatewayError>>,
	requested_model: String,
	repo: Arc<dyn KeyRepository>,
	api_key: String,
	request_id: String,
) -> impl Stream<Item = a::SseEvent> {
	async_stream::stream! {
		let accumulator = UsageAccumulator::default();
		let success = Arc::new(AtomicBool::new(false));
		let guard = UsageGuard {
			repo,
			api_key,
			request_id,
			model: requested_model.clone(),
			accumulator: accumulator.clone(),
			success: success.clone(),
		};

		let mut translator = StreamTranslator::new(requested_model);
		let mut errored = false;

		while let Some(frame) = frames.next().await {
			match frame {
				Ok(frame) => {
					for event in translator.feed(frame) {
						if let a::SseEvent::MessageDelta { usage, .. } = &event {
							accumulator.output_tokens.store(Some(usage.output_tokens));
							if let Some(t) = usage.input_tokens {
								accumulator.input_tokens.store(Some(t));
							}
							if let Some(t) = usage.cache_read_input_tokens {
								accumulator.cache_read_tokens.store(Some(t));
							}
							if let Some(t) = usage.cache_creation_input_tokens {
								accumulator.cache_write_tokens.store(Some(t));
							}
						}
						yield event;
					}
				}
				Err(err) => {
					errored = true;
					accumulator.error_message.store(Some(err.to_string()));
					yield a::SseEvent::Error {
						error: err.into_response_body(),
					};
					break;
				}
			}
		}

		if !errored {
			for event in translator.finalize() {
				yield event;
			}
			success.store(true, Ordering::Relaxed);
		}

		drop(guard);
	}
}

/// Strips/validates request content the operator has switched off via
/// `Config` (spec §6 env surface), ahead of the pure translation algorithm in
/// §4.2. Kept out of `translate_request` itself so that function stays a
/// total, config-free mapping.
fn apply_feature_gates(request: &mut a::MessageRequest, config: &Config) -> Result<(), TranslateError> {
	if !config.enable_tool_use {
		request.tools.clear();
		request.tool_choice = None;
	}
	if !config.enable_extended_thinking {
		request.thinking = None;
	}
	if !config.enable_document_support {
		let has_document = request.messages.iter().any(|m| {
			m.content
				.as_blocks()
				.iter()
				.any(|b| matches!(b, a::ContentBlock::Document { .. }))
		});
		if has_document {
			return Err(TranslateError::FeatureDisabled("document support"));
		}
	}
	if !config.prompt_caching_enabled {
		strip_cache_control(request);
	}
	Ok(())
}

fn strip_cache_control(request: &mut a::MessageRequest) {
	for message in &mut request.messages {
		if let a::MessageContent::Blocks(blocks) = &mut message.content {
			for block in blocks.iter_mut() {
				match block {
					a::ContentBlock::Text { cache_control, .. }
					| a::ContentBlock::Image { cache_control, .. }
					| a::ContentBlock::Document { cache_control, .. }
					| a::ContentBlock::ToolUse { cache_control, .. } => *cache_control = None,
					_ => {}
				}
			}
		}
	}
	for tool in &mut request.tools {
		tool.cache_control = None;
	}
}

/// Mirrors the teacher's `format!("{:016x}", rand::random::<u128>())`
/// session-id pattern (`sse.rs`) for a per-request identifier used only for
/// usage-record correlation, never echoed to the client.
fn generate_request_id() -> String {
	format!("req_{:016x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::time::Duration;

	use async_trait::async_trait;
	use futures::stream;

	use super::*;
	use crate::llm::bedrock as b;
	use crate::store::{ApiKey, InMemoryKeyRepository, RateLimitOverride};

	struct FakeBackend {
		response: b::ConverseResponse,
	}

	#[async_trait]
	impl Backend for FakeBackend {
		async fn invoke(&self, _model_id: &str, _request: b::ConverseRequest) -> Result<b::ConverseResponse, GatewayError> {
			Ok(self.response.clone())
		}

		async fn invoke_stream(
			&self,
			_model_id: &str,
			_request: b::ConverseRequest,
		) -> Result<BoxStream<'static, Result<b::ConverseStreamOutput, GatewayError>>, GatewayError> {
			Ok(stream::empty().boxed())
		}
	}

	struct FakeStreamBackend {
		// `GatewayError` isn't `Clone`, so the frame list is handed out once
		// via interior mutability rather than cloned per call.
		frames: tokio::sync::Mutex<Option<Vec<Result<b::ConverseStreamOutput, GatewayError>>>>,
	}

	impl FakeStreamBackend {
		fn new(frames: Vec<Result<b::ConverseStreamOutput, GatewayError>>) -> Self {
			FakeStreamBackend {
				frames: tokio::sync::Mutex::new(Some(frames)),
			}
		}
	}

	#[async_trait]
	impl Backend for FakeStreamBackend {
		async fn invoke(&self, _model_id: &str, _request: b::ConverseRequest) -> Result<b::ConverseResponse, GatewayError> {
			unreachable!("test only exercises the streaming path")
		}

		async fn invoke_stream(
			&self,
			_model_id: &str,
			_request: b::ConverseRequest,
		) -> Result<BoxStream<'static, Result<b::ConverseStreamOutput, GatewayError>>, GatewayError> {
			let frames = self.frames.lock().await.take().expect("frames consumed twice");
			Ok(stream::iter(frames).boxed())
		}
	}

	fn test_config() -> Arc<Config> {
		let mut cfg = Config::from_env().unwrap();
		cfg.require_api_key = true;
		cfg.master_api_key = None;
		Arc::new(cfg)
	}

	fn repo_with_key(key: ApiKey) -> Arc<InMemoryKeyRepository> {
		let repo = Arc::new(InMemoryKeyRepository::new());
		repo.insert_key(key);
		repo
	}

	fn simple_request() -> a::MessageRequest {
		a::MessageRequest {
			model: "claude-sonnet-4-5-20250929".to_string(),
			max_tokens: 16,
			messages: vec![a::Message {
				role: a::Role::User,
				content: a::MessageContent::Text("Hi".to_string()),
			}],
			system: None,
			temperature: None,
			top_p: None,
			top_k: None,
			stop_sequences: vec![],
			stream: false,
			tools: vec![],
			tool_choice: None,
			thinking: None,
			metadata: HashMap::new(),
			anthropic_beta: vec![],
		}
	}

	fn active_key(rate_limit: Option<RateLimitOverride>) -> ApiKey {
		ApiKey {
			key: "sk-1".to_string(),
			user_id: "u1".to_string(),
			name: "test".to_string(),
			is_active: true,
			rate_limit,
			service_tier: None,
			metadata: HashMap::new(),
		}
	}

	// S1 -- simplest unary (spec §8).
	#[tokio::test]
	async fn s1_simplest_unary() {
		let repo = repo_with_key(active_key(None));
		let backend = Arc::new(FakeBackend {
			response: b::ConverseResponse {
				output: b::ConverseOutput {
					message: b::BedrockMessage {
						role: b::ConversationRole::Assistant,
						content: vec![b::ContentBlock::Text("Hello.".to_string())],
					},
				},
				stop_reason: b::StopReason::EndTurn,
				usage: b::TokenUsage {
					input_tokens: 1,
					output_tokens: 2,
					total_tokens: 3,
					cache_read_input_tokens: 0,
					cache_write_input_tokens: 0,
				},
			},
		});
		let pipeline = Pipeline::new(test_config(), repo.clone(), backend);

		let resp = pipeline
			.handle_unary(Some("sk-1"), simple_request())
			.await
			.unwrap();

		assert_eq!(resp.stop_reason, Some(a::StopReason::EndTurn));
		assert_eq!(resp.usage.input_tokens, 1);
		assert_eq!(resp.usage.output_tokens, 2);
		assert_eq!(resp.model, "claude-sonnet-4-5-20250929");
		assert!(matches!(&resp.content[0], a::ContentBlock::Text { text, .. } if text == "Hello."));

		tokio::time::sleep(Duration::from_millis(10)).await;
		let records = repo.usage_records();
		assert_eq!(records.len(), 1);
		assert!(records[0].success);
	}

	#[tokio::test]
	async fn rejects_unknown_key_before_touching_the_backend() {
		let repo = repo_with_key(active_key(None));
		let backend = Arc::new(FakeStreamBackend::new(vec![]));
		let pipeline = Pipeline::new(test_config(), repo, backend);

		let err = pipeline
			.handle_unary(Some("sk-nope"), simple_request())
			.await
			.unwrap_err();
		assert!(matches!(err, GatewayError::Authentication(_)));
	}

	// S5 -- rate-limit deny (spec §8).
	#[tokio::test]
	async fn s5_second_request_is_rate_limited() {
		let rate_limit = Some(RateLimitOverride {
			capacity: 1,
			window_seconds: 10,
		});
		let repo = repo_with_key(active_key(rate_limit));
		let backend = Arc::new(FakeBackend {
			response: b::ConverseResponse {
				output: b::ConverseOutput {
					message: b::BedrockMessage {
						role: b::ConversationRole::Assistant,
						content: vec![b::ContentBlock::Text("Hi.".to_string())],
					},
				},
				stop_reason: b::StopReason::EndTurn,
				usage: b::TokenUsage::default(),
			},
		});
		let pipeline = Pipeline::new(test_config(), repo, backend);

		pipeline.handle_unary(Some("sk-1"), simple_request()).await.unwrap();
		let err = pipeline
			.handle_unary(Some("sk-1"), simple_request())
			.await
			.unwrap_err();
		match err {
			GatewayError::RateLimited { retry_after_seconds } => assert!(retry_after_seconds > 0),
			other => panic!("expected RateLimited, got {other:?}"),
		}
	}

	// S6 -- inactive key (spec §8).
	#[tokio::test]
	async fn s6_inactive_key_is_rejected() {
		let mut key = active_key(None);
		key.is_active = false;
		let repo = repo_with_key(key);
		let backend = Arc::new(FakeStreamBackend::new(vec![]));
		let pipeline = Pipeline::new(test_config(), repo, backend);

		let err = pipeline
			.handle_unary(Some("sk-1"), simple_request())
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			GatewayError::Authentication(auth::AuthFailure::Inactive)
		));
	}

	// S3 -- streaming with synthesized start (spec §8).
	#[tokio::test]
	async fn s3_streaming_with_synthesized_start() {
		let repo = repo_with_key(active_key(None));
		let frames = vec![
			Ok(b::ConverseStreamOutput::ContentBlockDelta(b::ContentBlockDeltaEvent {
				content_block_index: 0,
				delta: Some(b::ContentBlockDelta::Text("A".to_string())),
			})),
			Ok(b::ConverseStreamOutput::ContentBlockDelta(b::ContentBlockDeltaEvent {
				content_block_index: 0,
				delta: Some(b::ContentBlockDelta::Text("B".to_string())),
			})),
			Ok(b::ConverseStreamOutput::MessageStop(b::MessageStopEvent {
				stop_reason: b::StopReason::EndTurn,
			})),
			Ok(b::ConverseStreamOutput::Metadata(b::MetadataEvent {
				usage: Some(b::TokenUsage {
					input_tokens: 3,
					output_tokens: 2,
					total_tokens: 5,
					cache_read_input_tokens: 0,
					cache_write_input_tokens: 0,
				}),
			})),
		];
		let backend = Arc::new(FakeStreamBackend::new(frames));
		let pipeline = Pipeline::new(test_config(), repo, backend);

		let stream = pipeline
			.handle_stream(Some("sk-1"), simple_request())
			.await
			.unwrap();
		let events: Vec<a::SseEvent> = stream.collect().await;
		let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
		assert_eq!(
			names,
			vec![
				"message_start",
				"content_block_start",
				"content_block_delta",
				"content_block_delta",
				"content_block_stop",
				"message_delta",
				"message_stop",
			]
		);
	}

	#[tokio::test]
	async fn document_block_rejected_when_feature_disabled() {
		let repo = repo_with_key(active_key(None));
		let mut cfg = Config::from_env().unwrap();
		cfg.enable_document_support = false;
		let backend = Arc::new(FakeStreamBackend::new(vec![]));
		let pipeline = Pipeline::new(Arc::new(cfg), repo, backend);

		let mut req = simple_request();
		req.messages[0].content = a::MessageContent::Blocks(vec![a::ContentBlock::Document {
			source: a::DocumentSource {
				kind: "base64".to_string(),
				media_type: "application/pdf".to_string(),
				data: "...".to_string(),
				name: None,
			},
			cache_control: None,
		}]);

		let err = pipeline.handle_unary(Some("sk-1"), req).await.unwrap_err();
		assert!(matches!(err, GatewayError::InvalidRequest(TranslateError::FeatureDisabled(_))));
	}

	// S2 -- tool round-trip (spec §8): a tool_use/tool_result pair survives
	// the pipeline and reaches the backend in the expected Bedrock shape.
	#[tokio::test]
	async fn s2_tool_round_trip_reaches_the_backend() {
		struct CapturingBackend {
			captured: tokio::sync::Mutex<Option<b::ConverseRequest>>,
		}

		#[async_trait]
		impl Backend for CapturingBackend {
			async fn invoke(
				&self,
				_model_id: &str,
				request: b::ConverseRequest,
			) -> Result<b::ConverseResponse, GatewayError> {
				*self.captured.lock().await = Some(request);
				Ok(b::ConverseResponse {
					output: b::ConverseOutput {
						message: b::BedrockMessage {
							role: b::ConversationRole::Assistant,
							content: vec![b::ContentBlock::Text("done".to_string())],
						},
					},
					stop_reason: b::StopReason::EndTurn,
					usage: b::TokenUsage::default(),
				})
			}

			async fn invoke_stream(
				&self,
				_model_id: &str,
				_request: b::ConverseRequest,
			) -> Result<BoxStream<'static, Result<b::ConverseStreamOutput, GatewayError>>, GatewayError> {
				unreachable!("test only exercises the unary path")
			}
		}

		let repo = repo_with_key(active_key(None));
		let backend = Arc::new(CapturingBackend {
			captured: tokio::sync::Mutex::new(None),
		});

		let mut req = simple_request();
		req.messages.push(a::Message {
			role: a::Role::Assistant,
			content: a::MessageContent::Blocks(vec![a::ContentBlock::ToolUse {
				id: "toolu_1".to_string(),
				name: "x".to_string(),
				input: serde_json::json!({}),
				cache_control: None,
			}]),
		});
		req.messages.push(a::Message {
			role: a::Role::User,
			content: a::MessageContent::Blocks(vec![a::ContentBlock::ToolResult {
				tool_use_id: "toolu_1".to_string(),
				content: a::ToolResultContent::Text("ok".to_string()),
				is_error: false,
			}]),
		});

		let pipeline = Pipeline::new(test_config(), repo, backend.clone());
		pipeline.handle_unary(Some("sk-1"), req).await.unwrap();

		let captured = backend.captured.lock().await.take().unwrap();
		let tool_message = &captured.messages[1];
		assert!(matches!(
			&tool_message.content[0],
			b::ContentBlock::ToolUse(tu) if tu.tool_use_id == "toolu_1" && tu.name == "x"
		));
		let result_message = &captured.messages[2];
		assert!(matches!(
			&result_message.content[0],
			b::ContentBlock::ToolResult(tr)
				if tr.tool_use_id == "toolu_1" && tr.status.as_deref() == Some("success")
		));
	}

	// S4 -- streaming with thinking before text (spec §8): index 1 (thinking)
	// then index 2 (text) synthesize their own start events, with no
	// spurious index 0.
	#[tokio::test]
	async fn s4_streaming_thinking_before_text() {
		let repo = repo_with_key(active_key(None));
		let frames = vec![
			Ok(b::ConverseStreamOutput::ContentBlockDelta(b::ContentBlockDeltaEvent {
				content_block_index: 1,
				delta: Some(b::ContentBlockDelta::ReasoningContent(
					b::ReasoningContentDelta::Text("ponder".to_string()),
				)),
			})),
			Ok(b::ConverseStreamOutput::ContentBlockDelta(b::ContentBlockDeltaEvent {
				content_block_index: 2,
				delta: Some(b::ContentBlockDelta::Text("answer".to_string())),
			})),
			Ok(b::ConverseStreamOutput::MessageStop(b::MessageStopEvent {
				stop_reason: b::StopReason::EndTurn,
			})),
		];
		let backend = Arc::new(FakeStreamBackend::new(frames));
		let pipeline = Pipeline::new(test_config(), repo, backend);

		let stream = pipeline
			.handle_stream(Some("sk-1"), simple_request())
			.await
			.unwrap();
		let events: Vec<a::SseEvent> = stream.collect().await;

		let starts: Vec<(i32, &a::ContentBlockShape)> = events
			.iter()
			.filter_map(|e| match e {
				a::SseEvent::ContentBlockStart { index, content_block } => Some((*index, content_block)),
				_ => None,
			})
			.collect();
		assert_eq!(starts.len(), 2);
		assert_eq!(starts[0].0, 1);
		assert!(matches!(starts[0].1, a::ContentBlockShape::Thinking { .. }));
		assert_eq!(starts[1].0, 2);
		assert!(matches!(starts[1].1, a::ContentBlockShape::Text { .. }));
		assert!(!events.iter().any(
			|e| matches!(e, a::SseEvent::ContentBlockStart { index: 0, .. })
		));
	}
}
