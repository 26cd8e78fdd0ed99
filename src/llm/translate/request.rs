//! Anthropic -> Bedrock request translation (spec §4.2).
//!
//! Pure function: the caller resolves the model id and looks up the model
//! family before calling in, so this has no I/O of its own and is directly
//! unit testable.

use std::collections::HashSet;

use crate::llm::anthropic as a;
use crate::llm::bedrock as b;
use crate::store::ServiceTier;

use super::{ModelFamily, TranslateError};

pub struct RequestTranslation {
	pub converse_request: b::ConverseRequest,
	/// Backend-side `anthropic-beta` equivalents, carried as HTTP headers
	/// rather than body fields (spec §4.2 step 8).
	pub backend_beta_headers: Vec<String>,
}

pub fn translate_request(
	req: &a::MessageRequest,
	backend_model_id: &str,
	family: ModelFamily,
	service_tier: ServiceTier,
	beta_header_map: &std::collections::HashMap<String, String>,
) -> Result<RequestTranslation, TranslateError> {
	let _ = backend_model_id; // addressing is the invoker's concern, not the body's

	if req.max_tokens <= 0 {
		return Err(TranslateError::MissingMaxTokens);
	}

	let system = normalize_system(req.system.as_ref())?;

	let mut seen_tool_use_ids = HashSet::new();
	let mut messages = Vec::with_capacity(req.messages.len());
	for msg in &req.messages {
		let blocks = msg.content.as_blocks();
		let mut content = Vec::with_capacity(blocks.len());
		for block in &blocks {
			if let a::ContentBlock::ToolUse { id, .. } = block {
				seen_tool_use_ids.insert(id.clone());
			}
			if let a::ContentBlock::ToolResult { tool_use_id, .. } = block {
				if !seen_tool_use_ids.contains(tool_use_id) {
					return Err(TranslateError::UnknownToolUseId(tool_use_id.clone()));
				}
			}
			translate_content_block(block, family, &mut content)?;
		}
		messages.push(b::BedrockMessage {
			role: translate_role(msg.role),
			content,
		});
	}

	let mut inference_config = b::InferenceConfiguration {
		max_tokens: Some(req.max_tokens),
		temperature: req.temperature,
		top_p: req.top_p,
		stop_sequences: if req.stop_sequences.is_empty() {
			None
		} else {
			Some(req.stop_sequences.clone())
		},
	};

	let mut additional_fields = serde_json::Map::new();
	// top_k has no Converse equivalent; Nova doesn't document support for it,
	// so it's only forwarded for the family known to accept it.
	if let (Some(top_k), ModelFamily::Claude) = (req.top_k, family) {
		additional_fields.insert("top_k".to_string(), serde_json::json!(top_k));
	}

	let tool_config = if req.tools.is_empty() {
		None
	} else {
		Some(b::ToolConfiguration {
			tools: req.tools.iter().map(translate_tool).collect(),
			tool_choice: req.tool_choice.as_ref().and_then(translate_tool_choice),
		})
	};

	if let Some(a::Thinking::Enabled { budget_tokens }) = &req.thinking {
		match family {
			ModelFamily::Claude => {
				additional_fields.insert(
					"thinking".to_string(),
					serde_json::json!({"type": "enabled", "budget_tokens": budget_tokens}),
				);
			}
			ModelFamily::Nova2Reasoning => {
				let effort = if *budget_tokens < 1000 {
					"low"
				} else if *budget_tokens <= 10_000 {
					"medium"
				} else {
					"high"
				};
				additional_fields.insert(
					"reasoningConfig".to_string(),
					serde_json::json!({"type": "enabled", "maxReasoningEffort": effort}),
				);
				inference_config.temperature = None;
				inference_config.max_tokens = None;
			}
			ModelFamily::Other => {}
		}
	}

	let backend_beta_headers = req
		.anthropic_beta
		.iter()
		.filter_map(|beta| beta_header_map.get(beta).cloned())
		.collect();

	Ok(RequestTranslation {
		converse_request: b::ConverseRequest {
			messages,
			system,
			inference_config: Some(inference_config),
			tool_config,
			additional_model_request_fields: if additional_fields.is_empty() {
				None
			} else {
				Some(serde_json::Value::Object(additional_fields))
			},
			service_tier: Some(service_tier.as_str().to_string()),
		},
		backend_beta_headers,
	})
}

fn translate_role(role: a::Role) -> b::ConversationRole {
	match role {
		a::Role::User => b::ConversationRole::User,
		a::Role::Assistant => b::ConversationRole::Assistant,
	}
}

fn translate_tool(t: &a::ToolDef) -> b::Tool {
	b::Tool {
		tool_spec: b::ToolSpecification {
			name: t.name.clone(),
			description: t.description.clone(),
			input_schema: b::ToolInputSchema {
				json: t.input_schema.clone(),
			},
		},
	}
}

fn translate_tool_choice(tc: &a::ToolChoice) -> Option<b::ToolChoice> {
	match tc {
		a::ToolChoice::Auto => Some(b::ToolChoice::Auto {}),
		a::ToolChoice::Any => Some(b::ToolChoice::Any {}),
		a::ToolChoice::Tool { name } => Some(b::ToolChoice::Tool { name: name.clone() }),
		a::ToolChoice::None => None,
	}
}

fn normalize_system(
	system: Option<&a::SystemPrompt>,
) -> Result<Option<Vec<b::SystemContentBlock>>, TranslateError> {
	let Some(system) = system else {
		return Ok(None);
	};
	let blocks = match system {
		a::SystemPrompt::Text(s) => vec![b::SystemContentBlock::Text(s.clone())],
		a::SystemPrompt::Blocks(blocks) => {
			let mut out = Vec::with_capacity(blocks.len());
			for block in blocks {
				if let a::ContentBlock::Text { text, cache_control } = block {
					out.push(b::SystemContentBlock::Text(text.clone()));
					if cache_control.is_some() {
						out.push(b::SystemContentBlock::CachePoint(b::CachePointBlock::default()));
					}
				}
			}
			out
		}
	};
	Ok(Some(blocks))
}

fn translate_content_block(
	block: &a::ContentBlock,
	family: ModelFamily,
	out: &mut Vec<b::ContentBlock>,
) -> Result<(), TranslateError> {
	let has_cache_control = block.cache_control().is_some();

	match block {
		a::ContentBlock::Text { text, .. } => out.push(b::ContentBlock::Text(text.clone())),
		a::ContentBlock::Image { source, .. } => {
			let format = media_type_to_image_format(&source.media_type)?;
			out.push(b::ContentBlock::Image(b::ImageBlock {
				format,
				source: b::ImageSource {
					bytes: source.data.clone(),
				},
			}));
		}
		a::ContentBlock::Document { source, .. } => {
			let format = media_type_to_document_format(&source.media_type)?;
			out.push(b::ContentBlock::Document(b::DocumentBlock {
				format,
				name: source.name.clone().unwrap_or_else(|| "document".to_string()),
				source: b::DocumentSource {
					bytes: source.data.clone(),
				},
			}));
		}
		a::ContentBlock::ToolUse { id, name, input, .. } => {
			out.push(b::ContentBlock::ToolUse(b::ToolUseBlock {
				tool_use_id: id.clone(),
				name: name.clone(),
				input: input.clone(),
			}));
		}
		a::ContentBlock::ToolResult {
			tool_use_id,
			content,
			is_error,
		} => {
			let mut result_content = Vec::new();
			translate_tool_result_content(content, &mut result_content)?;
			out.push(b::ContentBlock::ToolResult(b::ToolResultBlock {
				tool_use_id: tool_use_id.clone(),
				content: result_content,
				status: Some(if *is_error { "error".to_string() } else { "success".to_string() }),
			}));
		}
		a::ContentBlock::Thinking { thinking, signature } => {
			out.push(b::ContentBlock::ReasoningContent(
				b::ReasoningContentBlock::ReasoningText(b::ReasoningTextBlock {
					text: thinking.clone(),
					signature: signature.clone(),
				}),
			));
		}
		a::ContentBlock::RedactedThinking { data } => {
			out.push(b::ContentBlock::ReasoningContent(
				b::ReasoningContentBlock::RedactedContent(data.clone()),
			));
		}
		a::ContentBlock::Unknown => return Err(TranslateError::UnsupportedContent),
	}

	if has_cache_control && matches!(family, ModelFamily::Claude) {
		out.push(b::ContentBlock::CachePoint(b::CachePointBlock::default()));
	}

	Ok(())
}

fn translate_tool_result_content(
	content: &a::ToolResultContent,
	out: &mut Vec<b::ToolResultContentBlock>,
) -> Result<(), TranslateError> {
	match content {
		a::ToolResultContent::Text(s) => out.push(b::ToolResultContentBlock::Text { text: s.clone() }),
		a::ToolResultContent::Blocks(blocks) => {
			for block in blocks {
				match block {
					a::ContentBlock::Text { text, .. } => {
						out.push(b::ToolResultContentBlock::Text { text: text.clone() })
					}
					a::ContentBlock::Image { source, .. } => {
						let format = media_type_to_image_format(&source.media_type)?;
						out.push(b::ToolResultContentBlock::Image {
							image: b::ImageBlock {
								format,
								source: b::ImageSource {
									bytes: source.data.clone(),
								},
							},
						});
					}
					_ => {}
				}
			}
		}
	}
	Ok(())
}

fn media_type_to_image_format(media_type: &str) -> Result<String, TranslateError> {
	match media_type {
		"image/png" => Ok("png".to_string()),
		"image/jpeg" => Ok("jpeg".to_string()),
		"image/gif" => Ok("gif".to_string()),
		"image/webp" => Ok("webp".to_string()),
		other => Err(TranslateError::UnrecognizedMediaType(other.to_string())),
	}
}

fn media_type_to_document_format(media_type: &str) -> Result<String, TranslateError> {
	match media_type {
		"application/pdf" => Ok("pdf".to_string()),
		"text/plain" => Ok("txt".to_string()),
		"text/csv" => Ok("csv".to_string()),
		"text/html" => Ok("html".to_string()),
		"text/markdown" => Ok("md".to_string()),
		"application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Ok("docx".to_string()),
		"application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Ok("xlsx".to_string()),
		other => Err(TranslateError::UnrecognizedMediaType(other.to_string())),
	}
}
