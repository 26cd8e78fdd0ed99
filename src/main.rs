//! Binary entry point.
//!
//! Logging setup and the top-level socket bind mirror the teacher's
//! `src/main.rs`: `tracing_subscriber` driven by `RUST_LOG`/`EnvFilter`,
//! followed by `axum::serve` over a plain `tokio::net::TcpListener`.

use std::sync::Arc;

use bedrock_messages_gateway::invoker::Invoker;
use bedrock_messages_gateway::store::InMemoryKeyRepository;
use bedrock_messages_gateway::{Config, Pipeline};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let config = Arc::new(Config::from_env()?);
	let repo = Arc::new(InMemoryKeyRepository::new());
	let backend = Arc::new(Invoker::new(
		config.aws_region.clone(),
		config.backend_timeout,
		config.streaming_timeout,
	));

	let pipeline = Arc::new(Pipeline::new(config.clone(), repo, backend));
	pipeline.spawn_bucket_eviction();

	let app = bedrock_messages_gateway::server::App::new(pipeline, config);
	let router = app.router();

	let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
	let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
	tracing::info!(%bind_addr, "listening");

	axum::serve(listener, router).await?;

	Ok(())
}
