//! Environment/config surface (spec §6).
//!
//! Parsed once at startup into a typed, immutable `Config`. Missing
//! variables fall back to the defaults named in the spec; malformed ones are
//! a startup error rather than a silently-ignored one.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::store::ServiceTier;

#[derive(Debug, Clone)]
pub struct Config {
	pub aws_region: String,
	pub require_api_key: bool,
	pub master_api_key: Option<String>,
	pub api_key_header: String,
	pub rate_limit_enabled: bool,
	pub rate_limit_requests: u64,
	pub rate_limit_window: Duration,
	pub enable_tool_use: bool,
	pub enable_extended_thinking: bool,
	pub enable_document_support: bool,
	pub prompt_caching_enabled: bool,
	pub default_service_tier: ServiceTier,
	pub streaming_timeout: Duration,
	/// Unary backend invocation timeout (spec §5, default 300s).
	pub backend_timeout: Duration,
	/// `anthropic-beta` header value -> Bedrock beta header value (spec §4.2 step 8).
	pub beta_header_map: HashMap<String, String>,
	/// Idle-bucket eviction TTL (spec §4.7, default 1 hour).
	pub rate_limit_bucket_ttl: Duration,
}

impl Config {
	pub fn from_env() -> anyhow::Result<Self> {
		Ok(Config {
			aws_region: parse_default("AWS_REGION", "us-east-1".to_string())?,
			require_api_key: parse_default("REQUIRE_API_KEY", true)?,
			master_api_key: parse::<String>("MASTER_API_KEY")?,
			api_key_header: parse_default("API_KEY_HEADER", "x-api-key".to_string())?,
			rate_limit_enabled: parse_default("RATE_LIMIT_ENABLED", true)?,
			rate_limit_requests: parse_default("RATE_LIMIT_REQUESTS", 60u64)?,
			rate_limit_window: Duration::from_secs(parse_default("RATE_LIMIT_WINDOW", 60u64)?),
			enable_tool_use: parse_default("ENABLE_TOOL_USE", true)?,
			enable_extended_thinking: parse_default("ENABLE_EXTENDED_THINKING", true)?,
			enable_document_support: parse_default("ENABLE_DOCUMENT_SUPPORT", true)?,
			prompt_caching_enabled: parse_default("PROMPT_CACHING_ENABLED", true)?,
			default_service_tier: parse_default("DEFAULT_SERVICE_TIER", ServiceTier::Default)?,
			streaming_timeout: Duration::from_secs(parse_default("STREAMING_TIMEOUT", 60u64)?),
			backend_timeout: Duration::from_secs(300),
			beta_header_map: default_beta_header_map(),
			rate_limit_bucket_ttl: Duration::from_secs(3600),
		})
	}
}

/// Built-in default `anthropic-beta` -> Bedrock beta header value table.
/// Supplied as configuration data per the resolved Open Question in spec §9;
/// a deployment can override/extend it without touching translation logic.
fn default_beta_header_map() -> HashMap<String, String> {
	HashMap::from([
		(
			"advanced-tool-use-2025-11-20".to_string(),
			"tool-examples-2025-10-29".to_string(),
		),
		(
			"prompt-caching-2024-07-31".to_string(),
			"prompt-caching-2024-07-31".to_string(),
		),
		(
			"output-128k-2025-02-19".to_string(),
			"output-128k-2025-02-19".to_string(),
		),
	])
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn parse_default<T: FromStr>(env: &str, default: T) -> anyhow::Result<T>
where
	<T as FromStr>::Err: ToString,
{
	parse(env).map(|v| v.unwrap_or(default))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_when_unset() {
		// SAFETY (test-only): no other test in this binary reads these vars concurrently.
		unsafe {
			env::remove_var("AWS_REGION");
			env::remove_var("RATE_LIMIT_REQUESTS");
		}
		let cfg = Config::from_env().unwrap();
		assert_eq!(cfg.aws_region, "us-east-1");
		assert_eq!(cfg.rate_limit_requests, 60);
		assert!(cfg.beta_header_map.contains_key("advanced-tool-use-2025-11-20"));
	}
}
