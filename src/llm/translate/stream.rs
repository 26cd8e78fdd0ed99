//! Bedrock -> Anthropic stream translation (spec §4.4).
//!
//! Kept as a pure, synchronous state machine so it's testable without any
//! I/O: the async plumbing that drives a live Bedrock event stream through
//! `feed`/`finalize` lives with the invoker, which is the thing that
//! actually reads bytes off the wire.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use crate::llm::anthropic as a;
use crate::llm::bedrock as b;

use super::response::translate_stop_reason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
	Text,
	ToolUse,
	Thinking,
	RedactedThinking,
}

pub struct StreamTranslator {
	requested_model: String,
	message_id: String,
	message_start_emitted: bool,
	message_stop_emitted: bool,
	seen_indices: HashSet<i32>,
	stopped_indices: HashSet<i32>,
	pending_tool_starts: HashMap<i32, (String, String)>,
	block_kinds: HashMap<i32, BlockKind>,
	stop_reason: Option<a::StopReason>,
	final_usage: a::Usage,
}

impl StreamTranslator {
	pub fn new(requested_model: impl Into<String>) -> Self {
		StreamTranslator {
			requested_model: requested_model.into(),
			message_id: format!("msg_{}", chrono::Utc::now().timestamp_millis()),
			message_start_emitted: false,
			message_stop_emitted: false,
			seen_indices: HashSet::new(),
			stopped_indices: HashSet::new(),
			pending_tool_starts: HashMap::new(),
			block_kinds: HashMap::new(),
			stop_reason: None,
			final_usage: a::Usage::default(),
		}
	}

	/// Feeds one Bedrock stream frame, returning zero or more Anthropic SSE
	/// events. A single frame can fan out into more than one event (e.g. the
	/// first delta of a stream synthesizes `message_start` and
	/// `content_block_start` ahead of itself).
	pub fn feed(&mut self, frame: b::ConverseStreamOutput) -> SmallVec<[a::SseEvent; 2]> {
		let mut out = SmallVec::new();
		match frame {
			b::ConverseStreamOutput::MessageStart(_) => {
				self.ensure_message_start(&mut out);
			}
			b::ConverseStreamOutput::ContentBlockStart(ev) => {
				self.ensure_message_start(&mut out);
				if let Some(b::ContentBlockStart::ToolUse { tool_use_id, name }) = ev.start {
					self.pending_tool_starts.insert(ev.content_block_index, (tool_use_id, name));
				}
			}
			b::ConverseStreamOutput::ContentBlockDelta(ev) => {
				self.ensure_message_start(&mut out);
				let Some(delta) = ev.delta else {
					return out;
				};
				let index = ev.content_block_index;
				if !self.seen_indices.contains(&index) {
					self.synthesize_start(index, &delta, &mut out);
					self.seen_indices.insert(index);
				}
				self.emit_delta(index, delta, &mut out);
			}
			b::ConverseStreamOutput::ContentBlockStop(ev) => {
				self.ensure_message_start(&mut out);
				if self.seen_indices.contains(&ev.content_block_index) {
					self.close_block(ev.content_block_index, &mut out);
				}
			}
			b::ConverseStreamOutput::MessageStop(ev) => {
				self.ensure_message_start(&mut out);
				self.close_all_open_blocks(&mut out);
				self.stop_reason = Some(translate_stop_reason(ev.stop_reason));
				self.emit_message_delta_and_stop(&mut out);
			}
			b::ConverseStreamOutput::Metadata(ev) => {
				if let Some(usage) = ev.usage {
					self.final_usage = a::Usage {
						input_tokens: usage.input_tokens,
						output_tokens: usage.output_tokens,
						cache_read_input_tokens: usage.cache_read_input_tokens,
						cache_creation_input_tokens: usage.cache_write_input_tokens,
					};
				}
			}
		}
		out
	}

	/// Called when the upstream Bedrock stream ends without a `messageStop`
	/// frame (spec §4.4 Finalization). A no-op if the stream already closed
	/// cleanly.
	pub fn finalize(mut self) -> SmallVec<[a::SseEvent; 2]> {
		let mut out = SmallVec::new();
		if self.message_stop_emitted {
			return out;
		}
		self.ensure_message_start(&mut out);
		self.close_all_open_blocks(&mut out);
		self.stop_reason.get_or_insert(a::StopReason::EndTurn);
		self.emit_message_delta_and_stop(&mut out);
		out
	}

	fn ensure_message_start(&mut self, out: &mut SmallVec<[a::SseEvent; 2]>) {
		if self.message_start_emitted {
			return;
		}
		self.message_start_emitted = true;
		out.push(a::SseEvent::MessageStart {
			message: a::MessageResponse {
				id: self.message_id.clone(),
				kind: a::MessageObjectType::Message,
				role: a::Role::Assistant,
				model: self.requested_model.clone(),
				content: vec![],
				stop_reason: None,
				stop_sequence: None,
				usage: a::Usage::default(),
			},
		});
	}

	fn synthesize_start(
		&mut self,
		index: i32,
		delta: &b::ContentBlockDelta,
		out: &mut SmallVec<[a::SseEvent; 2]>,
	) {
		let kind = classify(delta);
		self.block_kinds.insert(index, kind);
		let content_block = match kind {
			BlockKind::Text => a::ContentBlockShape::Text { text: String::new() },
			BlockKind::ToolUse => {
				let (id, name) = self.pending_tool_starts.remove(&index).unwrap_or_default();
				a::ContentBlockShape::ToolUse {
					id,
					name,
					input: serde_json::json!({}),
				}
			}
			BlockKind::Thinking => a::ContentBlockShape::Thinking { thinking: String::new() },
			BlockKind::RedactedThinking => a::ContentBlockShape::RedactedThinking { data: String::new() },
		};
		out.push(a::SseEvent::ContentBlockStart { index, content_block });
	}

	fn emit_delta(&mut self, index: i32, delta: b::ContentBlockDelta, out: &mut SmallVec<[a::SseEvent; 2]>) {
		let is_redacted = matches!(self.block_kinds.get(&index), Some(BlockKind::RedactedThinking));
		let anthropic_delta = match delta {
			b::ContentBlockDelta::Text(text) => a::ContentBlockDelta::TextDelta { text },
			b::ContentBlockDelta::ToolUse { input } => a::ContentBlockDelta::InputJsonDelta { partial_json: input },
			b::ContentBlockDelta::ReasoningContent(rc) => match rc {
				b::ReasoningContentDelta::Text(text) => a::ContentBlockDelta::ThinkingDelta { thinking: text },
				b::ReasoningContentDelta::Signature(signature) => a::ContentBlockDelta::SignatureDelta { signature },
				b::ReasoningContentDelta::RedactedContent(data) => {
					a::ContentBlockDelta::RedactedThinkingDelta { data }
				}
			},
		};
		out.push(a::SseEvent::ContentBlockDelta { index, delta: anthropic_delta });

		// Redacted thinking has no stream of deltas in practice, only a single
		// opaque payload; close the block right behind its one delta.
		if is_redacted {
			self.close_block(index, out);
		}
	}

	fn close_block(&mut self, index: i32, out: &mut SmallVec<[a::SseEvent; 2]>) {
		if self.stopped_indices.insert(index) {
			out.push(a::SseEvent::ContentBlockStop { index });
		}
	}

	fn close_all_open_blocks(&mut self, out: &mut SmallVec<[a::SseEvent; 2]>) {
		let mut open: Vec<i32> = self
			.seen_indices
			.iter()
			.copied()
			.filter(|i| !self.stopped_indices.contains(i))
			.collect();
		open.sort_unstable();
		for index in open {
			self.close_block(index, out);
		}
	}

	fn emit_message_delta_and_stop(&mut self, out: &mut SmallVec<[a::SseEvent; 2]>) {
		if self.message_stop_emitted {
			return;
		}
		self.message_stop_emitted = true;
		out.push(a::SseEvent::MessageDelta {
			delta: a::MessageDeltaPayload {
				stop_reason: self.stop_reason,
				stop_sequence: None,
			},
			usage: a::DeltaUsage {
				output_tokens: self.final_usage.output_tokens,
				input_tokens: Some(self.final_usage.input_tokens),
				cache_read_input_tokens: Some(self.final_usage.cache_read_input_tokens),
				cache_creation_input_tokens: Some(self.final_usage.cache_creation_input_tokens),
			},
		});
		out.push(a::SseEvent::MessageStop);
	}
}

fn classify(delta: &b::ContentBlockDelta) -> BlockKind {
	match delta {
		b::ContentBlockDelta::Text(_) => BlockKind::Text,
		b::ContentBlockDelta::ToolUse { .. } => BlockKind::ToolUse,
		b::ContentBlockDelta::ReasoningContent(b::ReasoningContentDelta::RedactedContent(_)) => {
			BlockKind::RedactedThinking
		}
		b::ContentBlockDelta::ReasoningContent(_) => BlockKind::Thinking,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn text_delta(index: i32, text: &str) -> b::ConverseStreamOutput {
		b::ConverseStreamOutput::ContentBlockDelta(b::ContentBlockDeltaEvent {
			content_block_index: index,
			delta: Some(b::ContentBlockDelta::Text(text.to_string())),
		})
	}

	#[test]
	fn synthesizes_message_start_when_first_frame_is_a_delta() {
		let mut t = StreamTranslator::new("claude-sonnet-4-5-20250929");
		let events = t.feed(text_delta(0, "Hi"));
		assert_eq!(events.len(), 3);
		assert!(matches!(events[0], a::SseEvent::MessageStart { .. }));
		assert!(matches!(events[1], a::SseEvent::ContentBlockStart { index: 0, .. }));
		assert!(matches!(events[2], a::SseEvent::ContentBlockDelta { index: 0, .. }));
	}

	#[test]
	fn finalizes_without_message_stop_frame() {
		let mut t = StreamTranslator::new("m");
		t.feed(text_delta(0, "Hi"));
		let events = t.finalize();
		assert_eq!(events.len(), 3);
		assert!(matches!(events[0], a::SseEvent::ContentBlockStop { index: 0 }));
		assert!(matches!(events[1], a::SseEvent::MessageDelta { .. }));
		assert!(matches!(events[2], a::SseEvent::MessageStop));
	}

	#[test]
	fn full_sequence_emits_exactly_one_start_and_stop_per_index() {
		let mut t = StreamTranslator::new("m");
		let mut all = Vec::new();
		all.extend(t.feed(b::ConverseStreamOutput::MessageStart(b::MessageStartEvent {
			role: b::ConversationRole::Assistant,
		})));
		all.extend(t.feed(text_delta(0, "Hel")));
		all.extend(t.feed(text_delta(0, "lo.")));
		all.extend(t.feed(b::ConverseStreamOutput::ContentBlockStop(b::ContentBlockStopEvent {
			content_block_index: 0,
		})));
		all.extend(t.feed(b::ConverseStreamOutput::Metadata(b::MetadataEvent {
			usage: Some(b::TokenUsage {
				input_tokens: 1,
				output_tokens: 2,
				total_tokens: 3,
				cache_read_input_tokens: 0,
				cache_write_input_tokens: 0,
			}),
		})));
		all.extend(t.feed(b::ConverseStreamOutput::MessageStop(b::MessageStopEvent {
			stop_reason: b::StopReason::EndTurn,
		})));

		let starts = all
			.iter()
			.filter(|e| matches!(e, a::SseEvent::MessageStart { .. }))
			.count();
		let stops = all.iter().filter(|e| matches!(e, a::SseEvent::MessageStop)).count();
		let block_starts = all
			.iter()
			.filter(|e| matches!(e, a::SseEvent::ContentBlockStart { .. }))
			.count();
		let block_stops = all
			.iter()
			.filter(|e| matches!(e, a::SseEvent::ContentBlockStop { .. }))
			.count();
		assert_eq!(starts, 1);
		assert_eq!(stops, 1);
		assert_eq!(block_starts, 1);
		assert_eq!(block_stops, 1);
	}

	#[test]
	fn redacted_thinking_is_a_one_shot_block() {
		let mut t = StreamTranslator::new("m");
		let events = t.feed(b::ConverseStreamOutput::ContentBlockDelta(b::ContentBlockDeltaEvent {
			content_block_index: 0,
			delta: Some(b::ContentBlockDelta::ReasoningContent(
				b::ReasoningContentDelta::RedactedContent("opaque".to_string()),
			)),
		}));
		// message_start, content_block_start, content_block_delta, content_block_stop
		assert_eq!(events.len(), 4);
		assert!(matches!(events[1], a::SseEvent::ContentBlockStart {
			content_block: a::ContentBlockShape::RedactedThinking { .. },
			..
		}));
		assert!(matches!(events[3], a::SseEvent::ContentBlockStop { index: 0 }));
	}
}
