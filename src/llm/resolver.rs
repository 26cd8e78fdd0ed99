//! Model-ID Resolver (spec §4.1).
//!
//! Three-tier lookup, first match wins. Never fails: an id that doesn't
//! resolve to anything the backend recognizes surfaces later as a backend
//! error rather than here.

use crate::store::KeyRepository;

/// Compile-time default Anthropic -> Bedrock model id table. Small enough
/// that a linear scan is the right tool, matching the teacher's preference
/// for plain tables over a perfect-hash crate at this scale.
const DEFAULT_MODEL_MAP: &[(&str, &str)] = &[
	(
		"claude-sonnet-4-5-20250929",
		"anthropic.claude-sonnet-4-5-20250929-v1:0",
	),
	(
		"claude-opus-4-1-20250805",
		"anthropic.claude-opus-4-1-20250805-v1:0",
	),
	(
		"claude-3-5-sonnet-20241022",
		"anthropic.claude-3-5-sonnet-20241022-v2:0",
	),
	(
		"claude-3-5-haiku-20241022",
		"anthropic.claude-3-5-haiku-20241022-v1:0",
	),
	(
		"claude-3-opus-20240229",
		"anthropic.claude-3-opus-20240229-v1:0",
	),
	(
		"claude-3-haiku-20240307",
		"anthropic.claude-3-haiku-20240307-v1:0",
	),
];

pub async fn resolve(repo: &dyn KeyRepository, anthropic_id: &str) -> String {
	if let Ok(Some(custom)) = repo.get_model_mapping(anthropic_id).await {
		return custom;
	}
	if let Some((_, backend_id)) = DEFAULT_MODEL_MAP.iter().find(|(k, _)| *k == anthropic_id) {
		return backend_id.to_string();
	}
	anthropic_id.to_string()
}

/// The `anthropic_model_id`s this gateway knows about out of the box, for
/// `GET /v1/models` (spec §6). Custom mappings stored in the repository
/// aren't enumerable without a repository scan, so the listing reflects only
/// the built-in table.
pub fn known_model_ids() -> impl Iterator<Item = &'static str> {
	DEFAULT_MODEL_MAP.iter().map(|(id, _)| *id)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::InMemoryKeyRepository;

	#[tokio::test]
	async fn custom_mapping_wins() {
		let repo = InMemoryKeyRepository::new();
		repo.insert_model_mapping("claude-sonnet-4-5-20250929", "custom.model:0");
		let id = resolve(&repo, "claude-sonnet-4-5-20250929").await;
		assert_eq!(id, "custom.model:0");
	}

	#[tokio::test]
	async fn falls_back_to_default_table() {
		let repo = InMemoryKeyRepository::new();
		let id = resolve(&repo, "claude-3-5-haiku-20241022").await;
		assert_eq!(id, "anthropic.claude-3-5-haiku-20241022-v1:0");
	}

	#[tokio::test]
	async fn passes_through_unknown_ids() {
		let repo = InMemoryKeyRepository::new();
		let id = resolve(&repo, "some.other.model:0").await;
		assert_eq!(id, "some.other.model:0");
	}
}
