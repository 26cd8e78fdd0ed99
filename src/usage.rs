//! Usage Recorder (spec §4.8).
//!
//! `AsyncLog<T>` is lifted directly from the teacher's
//! `telemetry::log::AsyncLog`: a single-slot cell that lets usage fields
//! discovered deep inside response/stream handling (token counts, the final
//! stop reason) get set without threading a mutable accumulator through
//! every layer. Recording itself is fire-and-forget — a failure here must
//! never fail the client's request.

use std::fmt::Debug;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;

use crate::store::{KeyRepository, UsageRecord};

#[derive(Clone)]
pub struct AsyncLog<T>(Arc<AtomicCell<Option<T>>>);

impl<T> AsyncLog<T> {
	/// Racey read-modify-write: fine here because nothing observes a value
	/// mid-mutation, and only one task ever mutates a given log.
	pub fn non_atomic_mutate(&self, f: impl FnOnce(&mut T)) {
		let Some(mut cur) = self.0.take() else {
			return;
		};
		f(&mut cur);
		self.0.store(Some(cur));
	}

	pub fn store(&self, v: Option<T>) {
		self.0.store(v)
	}

	pub fn take(&self) -> Option<T> {
		self.0.take()
	}
}

impl<T: Copy> AsyncLog<T> {
	pub fn load(&self) -> Option<T> {
		self.0.load()
	}
}

impl<T> Default for AsyncLog<T> {
	fn default() -> Self {
		AsyncLog(Arc::new(AtomicCell::new(None)))
	}
}

impl<T: Debug> Debug for AsyncLog<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AsyncLog").finish_non_exhaustive()
	}
}

/// Accumulates the fields a `UsageRecord` needs as they become known over
/// the lifetime of one request (unary or streaming), independent of when
/// the request/response bodies themselves are dropped.
#[derive(Clone, Default)]
pub struct UsageAccumulator {
	pub input_tokens: AsyncLog<u64>,
	pub output_tokens: AsyncLog<u64>,
	pub cache_read_tokens: AsyncLog<u64>,
	pub cache_write_tokens: AsyncLog<u64>,
	pub error_message: AsyncLog<String>,
}

/// Spawns a fire-and-forget task writing a `UsageRecord`. The repository
/// handle must be `'static` (an `Arc`) since the write can outlive the
/// request task, particularly for a streamed response.
pub fn record_usage(
	repo: Arc<dyn KeyRepository>,
	api_key: String,
	request_id: String,
	model: String,
	accumulator: UsageAccumulator,
	success: bool,
) {
	tokio::spawn(async move {
		let record = UsageRecord {
			api_key,
			timestamp: chrono::Utc::now().timestamp_millis(),
			request_id,
			model,
			input_tokens: accumulator.input_tokens.load().unwrap_or(0),
			output_tokens: accumulator.output_tokens.load().unwrap_or(0),
			cache_read_tokens: accumulator.cache_read_tokens.load().unwrap_or(0),
			cache_write_tokens: accumulator.cache_write_tokens.load().unwrap_or(0),
			success,
			error_message: accumulator.error_message.take(),
		};
		if let Err(err) = repo.record_usage(record).await {
			tracing::warn!(error = %err, "failed to record usage");
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::InMemoryKeyRepository;

	#[test]
	fn async_log_round_trips() {
		let log: AsyncLog<u64> = AsyncLog::default();
		assert_eq!(log.load(), None);
		log.store(Some(5));
		assert_eq!(log.load(), Some(5));
		log.non_atomic_mutate(|v| *v += 1);
		assert_eq!(log.load(), Some(6));
		assert_eq!(log.take(), Some(6));
		assert_eq!(log.load(), None);
	}

	#[tokio::test]
	async fn record_usage_writes_to_repository() {
		let repo = Arc::new(InMemoryKeyRepository::new());
		let acc = UsageAccumulator::default();
		acc.input_tokens.store(Some(1));
		acc.output_tokens.store(Some(2));

		record_usage(
			repo.clone(),
			"sk-1".to_string(),
			"req-1".to_string(),
			"claude-sonnet-4-5-20250929".to_string(),
			acc,
			true,
		);

		// the write is spawned; give the scheduler a turn to run it.
		tokio::task::yield_now().await;
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;

		let records = repo.usage_records();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].input_tokens, 1);
		assert_eq!(records[0].output_tokens, 2);
	}
}
