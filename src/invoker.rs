//! Backend Invoker (spec §4.5).
//!
//! Signs and issues the Bedrock Converse/ConverseStream HTTP call, runs the
//! at-most-one-retry service-tier fallback, and for streaming responses
//! decodes the binary event-stream frames as they arrive. Signing is adapted
//! from the teacher's `http::auth::aws::sign_request`: same SigV4 builder
//! and `Content-Length` dance, simplified to the one auth mode this gateway
//! needs (implicit credentials via the default AWS provider chain).

use std::time::{Duration, SystemTime};

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_credential_types::provider::ProvideCredentials;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4::SigningParams;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::OnceCell;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::error::GatewayError;
use crate::llm::bedrock::{self, BedrockErrorBody, ConverseRequest, ConverseResponse, ConverseStreamOutput};

/// The pipeline's view of the Backend Invoker (spec §4.5): just enough
/// surface to drive the request pipeline, boxed so the orchestrator can be
/// built and tested against a fake without a live AWS call. `Invoker` is the
/// only production implementation.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
	async fn invoke(&self, model_id: &str, request: ConverseRequest) -> Result<ConverseResponse, GatewayError>;

	async fn invoke_stream(
		&self,
		model_id: &str,
		request: ConverseRequest,
	) -> Result<BoxStream<'static, Result<ConverseStreamOutput, GatewayError>>, GatewayError>;
}

static SDK_CONFIG: OnceCell<aws_config::SdkConfig> = OnceCell::const_new();

async fn sdk_config() -> &'static aws_config::SdkConfig {
	SDK_CONFIG
		.get_or_init(|| async { aws_config::load_defaults(BehaviorVersion::latest()).await })
		.await
}

async fn load_credentials() -> anyhow::Result<Credentials> {
	let config = sdk_config().await;
	config
		.credentials_provider()
		.ok_or_else(|| anyhow::anyhow!("no AWS credentials provider configured"))?
		.provide_credentials()
		.await
		.map_err(anyhow::Error::from)
}

/// Signs `req` in place. Strips `Content-Length` before signing (its value
/// isn't part of the canonical request) and reinserts it afterward.
async fn sign_request(req: &mut http::Request<Bytes>, region: &str) -> anyhow::Result<()> {
	let creds = load_credentials().await?;
	sign_request_with(req, region, &creds)
}

/// The synchronous half of signing, factored out from credential loading so
/// it's unit-testable against a synthetic `Credentials` value without a live
/// provider chain.
fn sign_request_with(req: &mut http::Request<Bytes>, region: &str, creds: &Credentials) -> anyhow::Result<()> {
	let identity = creds.clone().into();
	let signing_params = SigningParams::builder()
		.identity(&identity)
		.region(region)
		.name("bedrock")
		.time(SystemTime::now())
		.settings(SigningSettings::default())
		.build()?
		.into();

	let body = req.body().clone();
	let signable_request = SignableRequest::new(
		req.method().as_str(),
		req.uri().to_string(),
		req
			.headers()
			.iter()
			.filter_map(|(k, v)| std::str::from_utf8(v.as_bytes()).ok().map(|v| (k.as_str(), v)))
			.filter(|(k, _)| *k != http::header::CONTENT_LENGTH.as_str()),
		SignableBody::Bytes(body.as_ref()),
	)?;

	let (signature, _) = aws_sigv4::http_request::sign(signable_request, &signing_params)?.into_parts();
	signature.apply_to_request_http1x(req);
	req.headers_mut().insert(
		http::header::CONTENT_LENGTH,
		http::HeaderValue::from_str(&body.len().to_string())?,
	);
	Ok(())
}

fn classify_backend_error(status: u16, body: &str) -> GatewayError {
	let message = serde_json::from_str::<BedrockErrorBody>(body)
		.map(|b| b.message)
		.unwrap_or_else(|_| body.to_string());
	match status {
		429 | 503 => GatewayError::Overloaded(message),
		404 => GatewayError::NotFound(message),
		_ => GatewayError::Backend(format!("{status}: {message}")),
	}
}

/// Issues signed Converse/ConverseStream calls against a single AWS region.
pub struct Invoker {
	http: reqwest::Client,
	region: String,
	backend_timeout: Duration,
	stream_idle_timeout: Duration,
}

impl Invoker {
	pub fn new(region: impl Into<String>, backend_timeout: Duration, stream_idle_timeout: Duration) -> Self {
		Invoker {
			http: reqwest::Client::new(),
			region: region.into(),
			backend_timeout,
			stream_idle_timeout,
		}
	}

	fn endpoint(&self, model_id: &str, streaming: bool) -> String {
		format!("https://{}{}", bedrock::host(&self.region), bedrock::path_for_model(model_id, streaming))
	}

	async fn build_signed_request(&self, model_id: &str, streaming: bool, body: Bytes) -> anyhow::Result<http::Request<Bytes>> {
		let uri = self.endpoint(model_id, streaming);
		let mut req = http::Request::builder()
			.method(http::Method::POST)
			.uri(&uri)
			.header(http::header::CONTENT_TYPE, "application/json")
			.header(http::header::HOST, bedrock::host(&self.region))
			.body(body)?;
		sign_request(&mut req, &self.region).await?;
		Ok(req)
	}

	async fn dispatch(&self, req: http::Request<Bytes>) -> reqwest::Result<reqwest::Response> {
		let mut builder = self.http.request(req.method().clone(), req.uri().to_string());
		for (name, value) in req.headers() {
			builder = builder.header(name, value);
		}
		builder.body(req.body().clone()).send().await
	}

	async fn send(&self, model_id: &str, streaming: bool, body: Bytes) -> Result<(u16, Bytes), GatewayError> {
		let req = self
			.build_signed_request(model_id, streaming, body)
			.await
			.map_err(GatewayError::Internal)?;
		let resp = tokio::time::timeout(self.backend_timeout, self.dispatch(req))
			.await
			.map_err(|_| GatewayError::Backend("backend request timed out".to_string()))?
			.map_err(|e| GatewayError::Backend(e.to_string()))?;
		let status = resp.status().as_u16();
		let bytes = resp
			.bytes()
			.await
			.map_err(|e| GatewayError::Backend(e.to_string()))?;
		Ok((status, bytes))
	}

	/// Unary invocation (spec §4.5): at most one retry, triggered only when
	/// the first response is a 400 naming an unsupported service tier.
	pub async fn invoke(&self, model_id: &str, mut request: ConverseRequest) -> Result<ConverseResponse, GatewayError> {
		let body = serde_json::to_vec(&request).map_err(|e| GatewayError::Internal(e.into()))?;
		let (status, bytes) = self.send(model_id, false, Bytes::from(body)).await?;
		if status == 200 {
			return serde_json::from_slice(&bytes).map_err(|e| GatewayError::Internal(e.into()));
		}

		let body_str = String::from_utf8_lossy(&bytes).into_owned();
		if request.service_tier.is_some() && bedrock::is_unsupported_service_tier(status, &body_str) {
			tracing::warn!(model = model_id, "service tier unsupported, retrying without it");
			request.service_tier = None;
			let retry_body = serde_json::to_vec(&request).map_err(|e| GatewayError::Internal(e.into()))?;
			let (status, bytes) = self.send(model_id, false, Bytes::from(retry_body)).await?;
			if status == 200 {
				return serde_json::from_slice(&bytes).map_err(|e| GatewayError::Internal(e.into()));
			}
			let body_str = String::from_utf8_lossy(&bytes).into_owned();
			return Err(classify_backend_error(status, &body_str));
		}

		Err(classify_backend_error(status, &body_str))
	}

	/// Streaming invocation (spec §4.5). Same fallback rule as `invoke`,
	/// applied before the stream is opened; once frames start arriving the
	/// response is committed.
	pub async fn invoke_stream(
		&self,
		model_id: &str,
		mut request: ConverseRequest,
	) -> Result<impl Stream<Item = Result<ConverseStreamOutput, GatewayError>> + use<>, GatewayError> {
		let mut retried = false;
		loop {
			let body = serde_json::to_vec(&request).map_err(|e| GatewayError::Internal(e.into()))?;
			let req = self
				.build_signed_request(model_id, true, Bytes::from(body))
				.await
				.map_err(GatewayError::Internal)?;
			let resp = tokio::time::timeout(self.backend_timeout, self.dispatch(req))
				.await
				.map_err(|_| GatewayError::Backend("backend request timed out".to_string()))?
				.map_err(|e| GatewayError::Backend(e.to_string()))?;

			let status = resp.status().as_u16();
			if status == 200 {
				return Ok(frame_stream(resp, self.stream_idle_timeout));
			}

			let bytes = resp.bytes().await.unwrap_or_default();
			let body_str = String::from_utf8_lossy(&bytes).into_owned();
			if !retried && request.service_tier.is_some() && bedrock::is_unsupported_service_tier(status, &body_str) {
				tracing::warn!(model = model_id, "service tier unsupported, retrying without it");
				request.service_tier = None;
				retried = true;
				continue;
			}
			return Err(classify_backend_error(status, &body_str));
		}
	}
}

#[async_trait::async_trait]
impl Backend for Invoker {
	async fn invoke(&self, model_id: &str, request: ConverseRequest) -> Result<ConverseResponse, GatewayError> {
		Invoker::invoke(self, model_id, request).await
	}

	async fn invoke_stream(
		&self,
		model_id: &str,
		request: ConverseRequest,
	) -> Result<BoxStream<'static, Result<ConverseStreamOutput, GatewayError>>, GatewayError> {
		Ok(Invoker::invoke_stream(self, model_id, request).await?.boxed())
	}
}

/// Decodes a Bedrock event-stream body into typed frames, enforcing a
/// per-frame idle timeout (spec §5).
fn frame_stream(
	resp: reqwest::Response,
	idle_timeout: Duration,
) -> impl Stream<Item = Result<ConverseStreamOutput, GatewayError>> + use<> {
	let byte_stream = resp
		.bytes_stream()
		.map(|r| r.map_err(std::io::Error::other));
	let reader = StreamReader::new(byte_stream);
	let mut framed = FramedRead::new(reader, aws_event_stream_parser::EventStreamCodec);

	async_stream::stream! {
		loop {
			let next = match tokio::time::timeout(idle_timeout, framed.next()).await {
				Ok(next) => next,
				Err(_) => {
					yield Err(GatewayError::StreamTimeout);
					break;
				},
			};
			let msg = match next {
				Some(Ok(msg)) => msg,
				Some(Err(e)) => {
					yield Err(GatewayError::Backend(format!("stream decode error: {e}")));
					break;
				},
				None => break,
			};
			match ConverseStreamOutput::deserialize(&msg) {
				Ok(frame) => yield Ok(frame),
				Err(e) => {
					yield Err(GatewayError::Backend(format!("malformed stream frame: {e}")));
					break;
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_throttling_as_overloaded() {
		let body = r#"{"message": "Too many requests, please wait"}"#;
		match classify_backend_error(429, body) {
			GatewayError::Overloaded(msg) => assert!(msg.contains("Too many")),
			other => panic!("expected Overloaded, got {other:?}"),
		}
	}

	#[test]
	fn classifies_unknown_status_as_generic_backend_error() {
		match classify_backend_error(500, r#"{"message": "internal failure"}"#) {
			GatewayError::Backend(msg) => assert!(msg.contains("internal failure")),
			other => panic!("expected Backend, got {other:?}"),
		}
	}

	#[test]
	fn signing_preserves_content_length_and_adds_authorization() {
		let creds = Credentials::new("AKIATEST", "secretkey", None, None, "test");
		let body = Bytes::from_static(br#"{"messages":[]}"#);
		let mut req = http::Request::builder()
			.method(http::Method::POST)
			.uri("https://bedrock-runtime.us-east-1.amazonaws.com/model/m/converse")
			.header(http::header::CONTENT_TYPE, "application/json")
			.header(http::header::CONTENT_LENGTH, body.len().to_string())
			.body(body.clone())
			.unwrap();

		sign_request_with(&mut req, "us-east-1", &creds).unwrap();

		assert!(req.headers().contains_key(http::header::AUTHORIZATION));
		assert_eq!(
			req.headers().get(http::header::CONTENT_LENGTH).unwrap(),
			&body.len().to_string()
		);
	}
}
