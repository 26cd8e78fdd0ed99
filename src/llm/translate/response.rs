//! Bedrock -> Anthropic unary response translation (spec §4.3).

use crate::llm::anthropic as a;
use crate::llm::bedrock as b;

pub fn translate_response(resp: &b::ConverseResponse, requested_model: &str) -> a::MessageResponse {
	let content = resp
		.output
		.message
		.content
		.iter()
		.map(translate_content_block)
		.collect();

	a::MessageResponse {
		id: format!("msg_{}", chrono::Utc::now().timestamp_millis()),
		kind: a::MessageObjectType::Message,
		role: a::Role::Assistant,
		model: requested_model.to_string(),
		content,
		stop_reason: Some(translate_stop_reason(resp.stop_reason)),
		stop_sequence: None,
		usage: a::Usage {
			input_tokens: resp.usage.input_tokens,
			output_tokens: resp.usage.output_tokens,
			cache_read_input_tokens: resp.usage.cache_read_input_tokens,
			cache_creation_input_tokens: resp.usage.cache_write_input_tokens,
		},
	}
}

/// `content_filtered`/`guardrail_intervened` surface as `end_turn`; the
/// underlying reason is left to the observability layer rather than
/// synthesizing a warning block (spec §4.3).
pub(in crate::llm::translate) fn translate_stop_reason(reason: b::StopReason) -> a::StopReason {
	match reason {
		b::StopReason::EndTurn => a::StopReason::EndTurn,
		b::StopReason::StopSequence => a::StopReason::StopSequence,
		b::StopReason::MaxTokens => a::StopReason::MaxTokens,
		b::StopReason::ToolUse => a::StopReason::ToolUse,
		b::StopReason::GuardrailIntervened | b::StopReason::ContentFiltered => a::StopReason::EndTurn,
	}
}

fn translate_content_block(block: &b::ContentBlock) -> a::ContentBlock {
	match block {
		b::ContentBlock::Text(text) => a::ContentBlock::Text {
			text: text.clone(),
			cache_control: None,
		},
		b::ContentBlock::Image(img) => a::ContentBlock::Image {
			source: a::ImageSource {
				kind: "base64".to_string(),
				media_type: image_format_to_media_type(&img.format),
				data: img.source.bytes.clone(),
			},
			cache_control: None,
		},
		b::ContentBlock::Document(doc) => a::ContentBlock::Document {
			source: a::DocumentSource {
				kind: "base64".to_string(),
				media_type: document_format_to_media_type(&doc.format),
				data: doc.source.bytes.clone(),
				name: Some(doc.name.clone()),
			},
			cache_control: None,
		},
		b::ContentBlock::ToolUse(tu) => a::ContentBlock::ToolUse {
			id: tu.tool_use_id.clone(),
			name: tu.name.clone(),
			input: tu.input.clone(),
			cache_control: None,
		},
		b::ContentBlock::ToolResult(tr) => a::ContentBlock::ToolResult {
			tool_use_id: tr.tool_use_id.clone(),
			content: a::ToolResultContent::Blocks(
				tr.content.iter().map(translate_tool_result_content_block).collect(),
			),
			is_error: tr.status.as_deref() == Some("error"),
		},
		b::ContentBlock::ReasoningContent(b::ReasoningContentBlock::ReasoningText(rt)) => {
			a::ContentBlock::Thinking {
				thinking: rt.text.clone(),
				signature: rt.signature.clone(),
			}
		}
		b::ContentBlock::ReasoningContent(b::ReasoningContentBlock::RedactedContent(data)) => {
			a::ContentBlock::RedactedThinking { data: data.clone() }
		}
		b::ContentBlock::CachePoint(_) => a::ContentBlock::Unknown,
	}
}

fn translate_tool_result_content_block(block: &b::ToolResultContentBlock) -> a::ContentBlock {
	match block {
		b::ToolResultContentBlock::Text { text } => a::ContentBlock::Text {
			text: text.clone(),
			cache_control: None,
		},
		b::ToolResultContentBlock::Json { json } => a::ContentBlock::Text {
			text: json.to_string(),
			cache_control: None,
		},
		b::ToolResultContentBlock::Image { image } => a::ContentBlock::Image {
			source: a::ImageSource {
				kind: "base64".to_string(),
				media_type: image_format_to_media_type(&image.format),
				data: image.source.bytes.clone(),
			},
			cache_control: None,
		},
	}
}

fn image_format_to_media_type(format: &str) -> String {
	format!("image/{}", if format == "jpg" { "jpeg" } else { format })
}

fn document_format_to_media_type(format: &str) -> String {
	match format {
		"pdf" => "application/pdf".to_string(),
		"txt" => "text/plain".to_string(),
		"csv" => "text/csv".to_string(),
		"html" => "text/html".to_string(),
		"md" => "text/markdown".to_string(),
		"docx" => {
			"application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string()
		}
		"xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
		other => other.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn simplest_unary_round_trips() {
		let resp = b::ConverseResponse {
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
		};
		let out = translate_response(&resp, "claude-sonnet-4-5-20250929");
		assert_eq!(out.model, "claude-sonnet-4-5-20250929");
		assert_eq!(out.stop_reason, Some(a::StopReason::EndTurn));
		assert_eq!(out.usage.input_tokens, 1);
		assert_eq!(out.usage.output_tokens, 2);
		assert!(matches!(&out.content[0], a::ContentBlock::Text { text, .. } if text == "Hello."));
		assert!(out.id.starts_with("msg_"));
	}

	#[test]
	fn guardrail_intervened_surfaces_as_end_turn() {
		assert_eq!(translate_stop_reason(b::StopReason::GuardrailIntervened), a::StopReason::EndTurn);
		assert_eq!(translate_stop_reason(b::StopReason::ContentFiltered), a::StopReason::EndTurn);
	}

	#[test]
	fn reasoning_blocks_translate_to_thinking() {
		let resp = b::ConverseResponse {
			output: b::ConverseOutput {
				message: b::BedrockMessage {
					role: b::ConversationRole::Assistant,
					content: vec![
						b::ContentBlock::ReasoningContent(b::ReasoningContentBlock::ReasoningText(
							b::ReasoningTextBlock {
								text: "because...".to_string(),
								signature: Some("sig".to_string()),
							},
						)),
						b::ContentBlock::ReasoningContent(b::ReasoningContentBlock::RedactedContent(
							"opaque".to_string(),
						)),
					],
				},
			},
			stop_reason: b::StopReason::EndTurn,
			usage: b::TokenUsage::default(),
		};
		let out = translate_response(&resp, "m");
		assert!(matches!(&out.content[0], a::ContentBlock::Thinking { thinking, .. } if thinking == "because..."));
		assert!(matches!(&out.content[1], a::ContentBlock::RedactedThinking { data } if data == "opaque"));
	}
}
