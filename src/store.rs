//! Key Repository Contract (spec §4.6/§6).
//!
//! The persistent store itself is an external collaborator (spec §1); this
//! module only defines the typed interface the rest of the crate programs
//! against, plus an in-memory implementation useful for tests and for
//! embedding the gateway without a real database.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
	#[default]
	Default,
	Flex,
	Priority,
	Reserved,
}

impl FromStr for ServiceTier {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"default" => Ok(ServiceTier::Default),
			"flex" => Ok(ServiceTier::Flex),
			"priority" => Ok(ServiceTier::Priority),
			"reserved" => Ok(ServiceTier::Reserved),
			other => Err(anyhow::anyhow!("unknown service tier: {other}")),
		}
	}
}

impl ServiceTier {
	/// The wire value Bedrock expects in `serviceTier`.
	pub fn as_str(&self) -> &'static str {
		match self {
			ServiceTier::Default => "default",
			ServiceTier::Flex => "flex",
			ServiceTier::Priority => "priority",
			ServiceTier::Reserved => "reserved",
		}
	}
}

/// Per-key rate limit override (requests/minute), distinct from the
/// process-wide default in `Config`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitOverride {
	pub capacity: u64,
	pub window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
	pub key: String,
	pub user_id: String,
	pub name: String,
	pub is_active: bool,
	pub rate_limit: Option<RateLimitOverride>,
	pub service_tier: Option<ServiceTier>,
	#[serde(default)]
	pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
	pub api_key: String,
	/// Unix epoch milliseconds.
	pub timestamp: i64,
	pub request_id: String,
	pub model: String,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub cache_read_tokens: u64,
	pub cache_write_tokens: u64,
	pub success: bool,
	pub error_message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("store unavailable: {0}")]
	Unavailable(String),
}

/// Repository over API keys, model-id overrides, and usage records.
///
/// Primary/secondary indices per spec §6:
/// - Keys: primary key = `api_key`, secondary index by `user_id`.
/// - Usage: primary key = `(api_key, timestamp)`, secondary index by `request_id`.
/// - Model mapping: primary key = `anthropic_model_id`.
#[async_trait::async_trait]
pub trait KeyRepository: Send + Sync {
	async fn get_key(&self, api_key: &str) -> Result<Option<ApiKey>, StoreError>;

	/// Custom Anthropic-model-id -> Bedrock-model-id override (spec §4.1 tier 1).
	async fn get_model_mapping(&self, anthropic_id: &str) -> Result<Option<String>, StoreError>;

	async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError>;
}

/// In-memory `KeyRepository`, useful for tests, local development, and as a
/// building block for a real persistent-store-backed implementation.
#[derive(Default)]
pub struct InMemoryKeyRepository {
	keys: RwLock<HashMap<String, ApiKey>>,
	model_mapping: RwLock<HashMap<String, String>>,
	usage: RwLock<Vec<UsageRecord>>,
}

impl InMemoryKeyRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert_key(&self, key: ApiKey) {
		self.keys.write().unwrap().insert(key.key.clone(), key);
	}

	pub fn insert_model_mapping(&self, anthropic_id: impl Into<String>, backend_id: impl Into<String>) {
		self
			.model_mapping
			.write()
			.unwrap()
			.insert(anthropic_id.into(), backend_id.into());
	}

	pub fn usage_records(&self) -> Vec<UsageRecord> {
		self.usage.read().unwrap().clone()
	}
}

#[async_trait::async_trait]
impl KeyRepository for InMemoryKeyRepository {
	async fn get_key(&self, api_key: &str) -> Result<Option<ApiKey>, StoreError> {
		Ok(self.keys.read().unwrap().get(api_key).cloned())
	}

	async fn get_model_mapping(&self, anthropic_id: &str) -> Result<Option<String>, StoreError> {
		Ok(self.model_mapping.read().unwrap().get(anthropic_id).cloned())
	}

	async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
		self.usage.write().unwrap().push(record);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn in_memory_round_trip() {
		let repo = InMemoryKeyRepository::new();
		repo.insert_key(ApiKey {
			key: "sk-1".to_string(),
			user_id: "u1".to_string(),
			name: "test".to_string(),
			is_active: true,
			rate_limit: None,
			service_tier: None,
			metadata: HashMap::new(),
		});
		let found = repo.get_key("sk-1").await.unwrap();
		assert!(found.is_some());
		assert!(repo.get_key("missing").await.unwrap().is_none());

		repo.insert_model_mapping("claude-x", "anthropic.claude-x-v1:0");
		assert_eq!(
			repo.get_model_mapping("claude-x").await.unwrap().as_deref(),
			Some("anthropic.claude-x-v1:0")
		);

		repo
			.record_usage(UsageRecord {
				api_key: "sk-1".to_string(),
				timestamp: 0,
				request_id: "r1".to_string(),
				model: "claude-x".to_string(),
				input_tokens: 1,
				output_tokens: 2,
				cache_read_tokens: 0,
				cache_write_tokens: 0,
				success: true,
				error_message: None,
			})
			.await
			.unwrap();
		assert_eq!(repo.usage_records().len(), 1);
	}
}
