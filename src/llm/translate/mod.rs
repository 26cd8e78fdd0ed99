//! Request/response/stream translation between Anthropic and Bedrock shapes
//! (spec §4.2–§4.4).

pub mod request;
pub mod response;
pub mod stream;

pub use request::translate_request;
pub use response::translate_response;
pub use stream::StreamTranslator;

/// A model family affects several translation decisions: whether cache
/// markers are emitted, how extended thinking is expressed, and whether
/// `top_k` is carried through `additionalModelRequestFields` (spec §4.2
/// steps 2, 5, 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
	Claude,
	Nova2Reasoning,
	Other,
}

impl ModelFamily {
	/// Detects family from the *resolved* (Bedrock-side) model id.
	pub fn detect(backend_model_id: &str) -> Self {
		if backend_model_id.contains("anthropic.claude") {
			return ModelFamily::Claude;
		}
		if is_nova_2(backend_model_id) {
			return ModelFamily::Nova2Reasoning;
		}
		ModelFamily::Other
	}
}

/// Matches Amazon Nova model ids of the second generation, e.g.
/// `amazon.nova-pro-v2:0`, `us.amazon.nova-lite-v2:0`.
fn is_nova_2(model_id: &str) -> bool {
	let Some(nova_pos) = model_id.find("amazon.nova-") else {
		return false;
	};
	let rest = &model_id[nova_pos + "amazon.nova-".len()..];
	rest.split(['-', ':']).any(|segment| segment == "v2" || segment == "2")
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
	#[error("max_tokens must be a positive integer")]
	MissingMaxTokens,

	#[error("tool_result references unknown tool_use_id: {0}")]
	UnknownToolUseId(String),

	#[error("unrecognized media_type: {0}")]
	UnrecognizedMediaType(String),

	#[error("unsupported content block type")]
	UnsupportedContent,

	#[error("{0} is disabled on this gateway")]
	FeatureDisabled(&'static str),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn detects_claude_family() {
		assert_eq!(
			ModelFamily::detect("anthropic.claude-sonnet-4-5-20250929-v1:0"),
			ModelFamily::Claude
		);
		assert_eq!(
			ModelFamily::detect("us.anthropic.claude-3-5-haiku-20241022-v1:0"),
			ModelFamily::Claude
		);
	}

	#[test]
	fn detects_nova_2_family() {
		assert_eq!(ModelFamily::detect("amazon.nova-pro-v2:0"), ModelFamily::Nova2Reasoning);
		assert_eq!(
			ModelFamily::detect("us.amazon.nova-lite-v2:0"),
			ModelFamily::Nova2Reasoning
		);
		assert_eq!(ModelFamily::detect("amazon.nova-pro-v1:0"), ModelFamily::Other);
	}

	#[test]
	fn other_family_is_default() {
		assert_eq!(ModelFamily::detect("meta.llama3-70b-instruct-v1:0"), ModelFamily::Other);
	}
}
