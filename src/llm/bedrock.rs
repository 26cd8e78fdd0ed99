//! AWS Bedrock Converse API wire types and endpoint addressing.
//!
//! Grounded on the teacher's `llm::bedrock` module: the same `ConverseRequest`/
//! `ConverseResponse` shape and the same event-stream deserialization approach
//! for streaming output, adapted to talk directly to Anthropic shapes instead
//! of through an intermediate universal format.

use aws_event_stream_parser::Message as EventStreamMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
	pub bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlock {
	pub format: String,
	pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSource {
	pub bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentBlock {
	pub format: String,
	pub name: String,
	pub source: DocumentSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseBlock {
	#[serde(rename = "toolUseId")]
	pub tool_use_id: String,
	pub name: String,
	pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContentBlock {
	Text { text: String },
	Json { json: Value },
	Image { image: ImageBlock },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultBlock {
	#[serde(rename = "toolUseId")]
	pub tool_use_id: String,
	pub content: Vec<ToolResultContentBlock>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningTextBlock {
	pub text: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasoningContentBlock {
	ReasoningText(ReasoningTextBlock),
	RedactedContent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CachePointBlock {
	#[serde(rename = "type")]
	pub kind: CachePointType,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CachePointType {
	#[default]
	Default,
}

/// Bedrock's own content-block taxonomy (spec §3). Bedrock distinguishes
/// block kinds by which single key is present in the object rather than by a
/// `type` discriminator, so these rely on serde's default externally-tagged
/// representation (`{"text": ...}`, `{"toolUse": {...}}`) with `rename` to
/// get the camelCase wire names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContentBlock {
	#[serde(rename = "text")]
	Text(String),
	#[serde(rename = "image")]
	Image(ImageBlock),
	#[serde(rename = "document")]
	Document(DocumentBlock),
	#[serde(rename = "toolUse")]
	ToolUse(ToolUseBlock),
	#[serde(rename = "toolResult")]
	ToolResult(ToolResultBlock),
	#[serde(rename = "reasoningContent")]
	ReasoningContent(ReasoningContentBlock),
	#[serde(rename = "cachePoint")]
	CachePoint(CachePointBlock),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
	User,
	Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockMessage {
	pub role: ConversationRole,
	pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfiguration {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInputSchema {
	pub json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub input_schema: ToolInputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
	#[serde(rename = "toolSpec")]
	pub tool_spec: ToolSpecification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolChoice {
	Auto {},
	Any {},
	Tool { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfiguration {
	pub tools: Vec<Tool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoice>,
}

/// An entry of Bedrock's `system` array. Like the message `ContentBlock`
/// taxonomy, plain text and a cache checkpoint are distinct union members
/// rather than fields of one struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemContentBlock {
	#[serde(rename = "text")]
	Text(String),
	#[serde(rename = "cachePoint")]
	CachePoint(CachePointBlock),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseRequest {
	pub messages: Vec<BedrockMessage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<Vec<SystemContentBlock>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub inference_config: Option<InferenceConfiguration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_config: Option<ToolConfiguration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub additional_model_request_fields: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub service_tier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopReason {
	EndTurn,
	MaxTokens,
	StopSequence,
	ToolUse,
	GuardrailIntervened,
	ContentFiltered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverseOutput {
	pub message: BedrockMessage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_tokens: u64,
	#[serde(default)]
	pub cache_read_input_tokens: u64,
	#[serde(default)]
	pub cache_write_input_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseResponse {
	pub output: ConverseOutput,
	pub stop_reason: StopReason,
	pub usage: TokenUsage,
}

/// Bedrock's API error body shape, used to detect the service-tier fallback
/// condition (spec §4.5) and to translate backend failures generically.
#[derive(Debug, Clone, Deserialize)]
pub struct BedrockErrorBody {
	pub message: String,
}

pub fn is_unsupported_service_tier(status: u16, body: &str) -> bool {
	if status != 400 {
		return false;
	}
	serde_json::from_str::<BedrockErrorBody>(body)
		.map(|b| b.message.to_lowercase().contains("service tier"))
		.unwrap_or(false)
}

// ---- Streaming ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockStartEvent {
	pub content_block_index: i32,
	pub start: Option<ContentBlockStart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlockStart {
	ToolUse { tool_use_id: String, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockDeltaEvent {
	pub content_block_index: i32,
	pub delta: Option<ContentBlockDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlockDelta {
	#[serde(rename = "text")]
	Text(String),
	#[serde(rename = "toolUse")]
	ToolUse { input: String },
	#[serde(rename = "reasoningContent")]
	ReasoningContent(ReasoningContentDelta),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReasoningContentDelta {
	#[serde(rename = "text")]
	Text(String),
	#[serde(rename = "signature")]
	Signature(String),
	#[serde(rename = "redactedContent")]
	RedactedContent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockStopEvent {
	pub content_block_index: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStartEvent {
	pub role: ConversationRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStopEvent {
	pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEvent {
	pub usage: Option<TokenUsage>,
}

/// One frame of a Bedrock `ConverseStream` response. Each frame arrives as an
/// `aws_event_stream_parser` binary message whose `:event-type` header names
/// the variant and whose payload is the JSON body.
#[derive(Debug, Clone)]
pub enum ConverseStreamOutput {
	MessageStart(MessageStartEvent),
	ContentBlockStart(ContentBlockStartEvent),
	ContentBlockDelta(ContentBlockDeltaEvent),
	ContentBlockStop(ContentBlockStopEvent),
	MessageStop(MessageStopEvent),
	Metadata(MetadataEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamFrameError {
	#[error("missing :event-type header")]
	MissingEventType,
	#[error("unknown event type: {0}")]
	UnknownEventType(String),
	#[error("malformed frame payload: {0}")]
	Malformed(#[from] serde_json::Error),
}

impl ConverseStreamOutput {
	/// Parses one decoded event-stream frame into a typed stream output.
	/// Grounded on the teacher's `ConverseStreamOutput::deserialize` which
	/// reads the `:event-type` header out of the raw `Message` and dispatches
	/// on it before parsing the JSON payload.
	pub fn deserialize(msg: &EventStreamMessage) -> Result<Self, StreamFrameError> {
		let event_type = msg
			.headers
			.headers
			.iter()
			.find(|h| h.key.as_str() == ":event-type")
			.and_then(|h| match &h.value {
				aws_event_stream_parser::HeaderValue::String(s) => Some(s.to_string()),
				_ => None,
			})
			.ok_or(StreamFrameError::MissingEventType)?;

		let payload = &msg.body;
		match event_type.as_str() {
			"messageStart" => Ok(Self::MessageStart(serde_json::from_slice(payload)?)),
			"contentBlockStart" => Ok(Self::ContentBlockStart(serde_json::from_slice(payload)?)),
			"contentBlockDelta" => Ok(Self::ContentBlockDelta(serde_json::from_slice(payload)?)),
			"contentBlockStop" => Ok(Self::ContentBlockStop(serde_json::from_slice(payload)?)),
			"messageStop" => Ok(Self::MessageStop(serde_json::from_slice(payload)?)),
			"metadata" => Ok(Self::Metadata(serde_json::from_slice(payload)?)),
			other => Err(StreamFrameError::UnknownEventType(other.to_string())),
		}
	}
}

/// Addressing for the Bedrock runtime HTTP surface (spec §4.5).
pub fn host(region: &str) -> String {
	format!("bedrock-runtime.{region}.amazonaws.com")
}

pub fn path_for_model(model_id: &str, streaming: bool) -> String {
	let encoded = urlencoding_slash_safe(model_id);
	if streaming {
		format!("/model/{encoded}/converse-stream")
	} else {
		format!("/model/{encoded}/converse")
	}
}

/// Bedrock model ids may contain `:` and `/`-free segments; percent-encoding
/// is only needed for the rare provisioned-throughput ARN form which embeds
/// `/` in the resource path. Plain foundation-model ids pass through as-is.
fn urlencoding_slash_safe(model_id: &str) -> String {
	if model_id.starts_with("arn:") {
		model_id.replace('/', "%2F")
	} else {
		model_id.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn detects_service_tier_error() {
		let body = r#"{"message": "The provided service tier is not supported for this model."}"#;
		assert!(is_unsupported_service_tier(400, body));
		assert!(!is_unsupported_service_tier(400, r#"{"message": "bad input"}"#));
		assert!(!is_unsupported_service_tier(500, body));
	}

	#[test]
	fn builds_paths() {
		assert_eq!(
			path_for_model("anthropic.claude-3-5-sonnet-20241022-v2:0", false),
			"/model/anthropic.claude-3-5-sonnet-20241022-v2:0/converse"
		);
		assert_eq!(
			path_for_model("anthropic.claude-3-5-sonnet-20241022-v2:0", true),
			"/model/anthropic.claude-3-5-sonnet-20241022-v2:0/converse-stream"
		);
		assert_eq!(host("us-west-2"), "bedrock-runtime.us-west-2.amazonaws.com");
	}
}
