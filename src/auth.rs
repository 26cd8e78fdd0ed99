//! Authenticator (spec §4.6).
//!
//! A thin layer over `KeyRepository`: resolves the raw `x-api-key` header
//! value into a `KeyContext` carried through the rest of the pipeline, with a
//! constant-time shortcut for the operator-configured master key.

use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::store::{ApiKey, KeyRepository, ServiceTier, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AuthFailure {
	#[error("no api key provided")]
	Missing,
	#[error("api key not recognized")]
	Unknown,
	#[error("api key is inactive")]
	Inactive,
	#[error("key store unavailable: {0}")]
	Store(#[from] StoreError),
}

/// Context attached to an authenticated request. `is_admin` keys (the master
/// key) bypass both the key-record lookup and the rate limiter.
#[derive(Debug, Clone)]
pub struct KeyContext {
	pub key: Arc<ApiKey>,
	pub is_admin: bool,
}

impl KeyContext {
	pub fn rate_limit_capacity(&self, default: u64) -> u64 {
		self.key.rate_limit.map(|r| r.capacity).unwrap_or(default)
	}

	pub fn rate_limit_window_seconds(&self, default: u64) -> u64 {
		self.key.rate_limit.map(|r| r.window_seconds).unwrap_or(default)
	}

	pub fn service_tier(&self, default: ServiceTier) -> ServiceTier {
		self.key.service_tier.unwrap_or(default)
	}
}

fn admin_api_key(user_id: &str) -> Arc<ApiKey> {
	Arc::new(ApiKey {
		key: String::new(),
		user_id: user_id.to_string(),
		name: "master".to_string(),
		is_active: true,
		rate_limit: None,
		service_tier: None,
		metadata: Default::default(),
	})
}

pub async fn authenticate(
	repo: &dyn KeyRepository,
	config: &Config,
	raw_key: Option<&str>,
) -> Result<KeyContext, AuthFailure> {
	if !config.require_api_key {
		return Ok(KeyContext {
			key: admin_api_key("anonymous"),
			is_admin: true,
		});
	}

	let Some(raw_key) = raw_key else {
		return Err(AuthFailure::Missing);
	};

	if let Some(master) = &config.master_api_key {
		if constant_time_eq(raw_key, master) {
			return Ok(KeyContext {
				key: admin_api_key("master"),
				is_admin: true,
			});
		}
	}

	let record = repo.get_key(raw_key).await?.ok_or(AuthFailure::Unknown)?;
	if !record.is_active {
		return Err(AuthFailure::Inactive);
	}

	Ok(KeyContext {
		key: Arc::new(record),
		is_admin: false,
	})
}

fn constant_time_eq(a: &str, b: &str) -> bool {
	a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::InMemoryKeyRepository;

	fn config_with(require: bool, master: Option<&str>) -> Config {
		let mut cfg = Config::from_env().unwrap();
		cfg.require_api_key = require;
		cfg.master_api_key = master.map(|s| s.to_string());
		cfg
	}

	#[tokio::test]
	async fn master_key_bypasses_store() {
		let repo = InMemoryKeyRepository::new();
		let cfg = config_with(true, Some("sk-master"));
		let ctx = authenticate(&repo, &cfg, Some("sk-master")).await.unwrap();
		assert!(ctx.is_admin);
	}

	#[tokio::test]
	async fn missing_key_fails_when_required() {
		let repo = InMemoryKeyRepository::new();
		let cfg = config_with(true, None);
		let err = authenticate(&repo, &cfg, None).await.unwrap_err();
		assert!(matches!(err, AuthFailure::Missing));
	}

	#[tokio::test]
	async fn unknown_key_fails() {
		let repo = InMemoryKeyRepository::new();
		let cfg = config_with(true, None);
		let err = authenticate(&repo, &cfg, Some("sk-nope")).await.unwrap_err();
		assert!(matches!(err, AuthFailure::Unknown));
	}

	#[tokio::test]
	async fn inactive_key_fails() {
		let repo = InMemoryKeyRepository::new();
		repo.insert_key(ApiKey {
			key: "sk-1".to_string(),
			user_id: "u1".to_string(),
			name: "test".to_string(),
			is_active: false,
			rate_limit: None,
			service_tier: None,
			metadata: Default::default(),
		});
		let cfg = config_with(true, None);
		let err = authenticate(&repo, &cfg, Some("sk-1")).await.unwrap_err();
		assert!(matches!(err, AuthFailure::Inactive));
	}

	#[tokio::test]
	async fn active_key_succeeds() {
		let repo = InMemoryKeyRepository::new();
		repo.insert_key(ApiKey {
			key: "sk-1".to_string(),
			user_id: "u1".to_string(),
			name: "test".to_string(),
			is_active: true,
			rate_limit: None,
			service_tier: None,
			metadata: Default::default(),
		});
		let cfg = config_with(true, None);
		let ctx = authenticate(&repo, &cfg, Some("sk-1")).await.unwrap();
		assert!(!ctx.is_admin);
		assert_eq!(ctx.key.user_id, "u1");
	}
}
