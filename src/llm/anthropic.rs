//! Anthropic Messages API wire types (spec §3).
//!
//! This is the inbound/outbound shape the gateway speaks to clients. It is
//! deliberately a faithful, total model of the tagged unions in the spec --
//! translation functions elsewhere in `llm` are total over this variant set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	#[default]
	User,
	Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheControl {
	#[serde(rename = "type")]
	pub kind: CacheControlKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheControlKind {
	Ephemeral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
	#[serde(rename = "type")]
	pub kind: String,
	pub media_type: String,
	pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSource {
	#[serde(rename = "type")]
	pub kind: String,
	pub media_type: String,
	pub data: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

/// A content block (spec §3 ContentBlock). `Unknown` is a forward-compat
/// catch-all for block types the translator doesn't recognize; it is never
/// produced by this crate, only (rarely) received. Translating a request
/// containing one raises `TranslateError::UnsupportedContent` rather than
/// silently dropping it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
	Text {
		text: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
	Image {
		source: ImageSource,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
	Document {
		source: DocumentSource,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
	ToolUse {
		id: String,
		name: String,
		input: Value,
		#[serde(skip_serializing_if = "Option::is_none")]
		cache_control: Option<CacheControl>,
	},
	ToolResult {
		tool_use_id: String,
		content: ToolResultContent,
		#[serde(default, skip_serializing_if = "std::ops::Not::not")]
		is_error: bool,
	},
	Thinking {
		thinking: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		signature: Option<String>,
	},
	RedactedThinking {
		data: String,
	},
	#[serde(other)]
	Unknown,
}

impl ContentBlock {
	pub fn cache_control(&self) -> Option<&CacheControl> {
		match self {
			ContentBlock::Text { cache_control, .. }
			| ContentBlock::Image { cache_control, .. }
			| ContentBlock::Document { cache_control, .. }
			| ContentBlock::ToolUse { cache_control, .. } => cache_control.as_ref(),
			_ => None,
		}
	}
}

/// `tool_result.content` may be plain text or a nested sequence of blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

impl MessageContent {
	pub fn as_blocks(&self) -> Vec<ContentBlock> {
		match self {
			MessageContent::Text(s) => vec![ContentBlock::Text {
				text: s.clone(),
				cache_control: None,
			}],
			MessageContent::Blocks(b) => b.clone(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: Role,
	pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub input_schema: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
	Auto,
	Any,
	Tool { name: String },
	None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Thinking {
	Disabled,
	Enabled { budget_tokens: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
	pub model: String,
	pub max_tokens: i64,
	pub messages: Vec<Message>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<SystemPrompt>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u32>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub stop_sequences: Vec<String>,
	#[serde(default)]
	pub stream: bool,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tools: Vec<ToolDef>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<ToolChoice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub thinking: Option<Thinking>,
	#[serde(default)]
	pub metadata: HashMap<String, Value>,
	#[serde(default, rename = "anthropic_beta", skip_serializing_if = "Vec::is_empty")]
	pub anthropic_beta: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
	EndTurn,
	MaxTokens,
	StopSequence,
	ToolUse,
	PauseTurn,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Usage {
	pub input_tokens: u64,
	pub output_tokens: u64,
	#[serde(default)]
	pub cache_read_input_tokens: u64,
	#[serde(default)]
	pub cache_creation_input_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: MessageObjectType,
	pub role: Role,
	pub model: String,
	pub content: Vec<ContentBlock>,
	pub stop_reason: Option<StopReason>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequence: Option<String>,
	pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageObjectType {
	Message,
}

// ---- Streaming (spec §4.4) ----

/// The initial, empty shape of a content block, sent in `content_block_start`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockShape {
	Text {
		text: String,
	},
	ToolUse {
		id: String,
		name: String,
		input: Value,
	},
	Thinking {
		thinking: String,
	},
	RedactedThinking {
		data: String,
	},
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockDelta {
	TextDelta { text: String },
	InputJsonDelta { partial_json: String },
	ThinkingDelta { thinking: String },
	SignatureDelta { signature: String },
	#[serde(rename = "redacted_thinking")]
	RedactedThinkingDelta { data: String },
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MessageDeltaPayload {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_reason: Option<StopReason>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DeltaUsage {
	pub output_tokens: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_read_input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation_input_tokens: Option<u64>,
}

/// One Anthropic SSE event. `event:` line is this variant's tag (see
/// `SseEvent::event_name`); `data:` line is the minified JSON body.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
	MessageStart {
		message: MessageResponse,
	},
	ContentBlockStart {
		index: i32,
		content_block: ContentBlockShape,
	},
	ContentBlockDelta {
		index: i32,
		delta: ContentBlockDelta,
	},
	ContentBlockStop {
		index: i32,
	},
	MessageDelta {
		delta: MessageDeltaPayload,
		usage: DeltaUsage,
	},
	MessageStop,
	Ping,
	Error {
		error: crate::error::ErrorResponse,
	},
}

impl SseEvent {
	/// The `event:` line. Mirrors the `type` tag but is kept explicit since
	/// the wire framing (spec §6) requires both an `event:` and `data:` line.
	pub fn event_name(&self) -> &'static str {
		match self {
			SseEvent::MessageStart { .. } => "message_start",
			SseEvent::ContentBlockStart { .. } => "content_block_start",
			SseEvent::ContentBlockDelta { .. } => "content_block_delta",
			SseEvent::ContentBlockStop { .. } => "content_block_stop",
			SseEvent::MessageDelta { .. } => "message_delta",
			SseEvent::MessageStop => "message_stop",
			SseEvent::Ping => "ping",
			SseEvent::Error { .. } => "error",
		}
	}
}
