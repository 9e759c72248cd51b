//! Log store: the server-side append-only delta log, its monotonic
//! sequence allocator, and the delta-count threshold that triggers
//! compaction.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use braid_types::adapters::compaction_store::{CompactionJobStoreAdapter, EnqueueOutcome};
use braid_types::adapters::log_store::{DeltaRow, LogStoreAdapter, SnapshotRow};
use braid_types::prelude::*;

/// Orchestrates the log store adapter plus the compaction-trigger policy
/// ("If the new count crosses the configured threshold, enqueue a
/// compaction job").
pub struct LogStore {
	adapter: Arc<dyn LogStoreAdapter>,
	compaction: Arc<dyn CompactionJobStoreAdapter>,
	delta_threshold: u64,
}

impl LogStore {
	#[must_use]
	pub fn new(
		adapter: Arc<dyn LogStoreAdapter>,
		compaction: Arc<dyn CompactionJobStoreAdapter>,
		delta_threshold: u64,
	) -> Self {
		Self { adapter, compaction, delta_threshold }
	}

	/// Allocate a seq, persist the delta, and enqueue compaction if the
	/// document just crossed `delta_threshold`. Duplicate enqueue attempts
	/// are harmless no-ops.
	pub async fn append_delta(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		delta_type: DeltaType,
	) -> BraidResult<Seq> {
		let seq = self.adapter.next_seq(collection).await?;
		self.adapter.insert_delta(collection, document, seq, bytes, Timestamp::now(), delta_type).await?;

		let count = self.adapter.delta_count(collection, document).await?;
		if count >= self.delta_threshold {
			match self.compaction.enqueue(collection, document).await? {
				EnqueueOutcome::Created(job) => {
					debug!(collection, document, job, count, "compaction threshold crossed, job enqueued");
				}
				EnqueueOutcome::AlreadyPending | EnqueueOutcome::AlreadyRunning => {}
			}
		}

		Ok(seq)
	}

	pub async fn deltas_since(&self, collection: &str, after: Seq, limit: usize) -> BraidResult<Vec<DeltaRow>> {
		self.adapter.deltas_since(collection, after, limit).await
	}

	pub async fn document_deltas_upto(
		&self,
		collection: &str,
		document: &str,
		boundary: Seq,
	) -> BraidResult<Vec<DeltaRow>> {
		self.adapter.document_deltas_upto(collection, document, boundary).await
	}

	pub async fn oldest_seq(&self, collection: &str) -> BraidResult<Option<Seq>> {
		self.adapter.oldest_seq(collection).await
	}

	pub async fn get_snapshot(&self, collection: &str, document: &str) -> BraidResult<Option<SnapshotRow>> {
		self.adapter.get_snapshot(collection, document).await
	}

	pub async fn list_snapshots(&self, collection: &str) -> BraidResult<Vec<SnapshotRow>> {
		self.adapter.list_snapshots(collection).await
	}

	pub async fn put_snapshot(&self, collection: &str, row: SnapshotRow) -> BraidResult<()> {
		self.adapter.put_snapshot(collection, row).await
	}

	pub async fn delete_deltas(&self, collection: &str, document: &str, seqs: &[Seq]) -> BraidResult<()> {
		self.adapter.delete_deltas(collection, document, seqs).await
	}

	/// Boundary-seq read for compaction: the current counter,
	/// observed without allocating.
	pub async fn current_seq(&self, collection: &str) -> BraidResult<Seq> {
		self.adapter.current_seq(collection).await
	}

	#[must_use]
	pub fn adapter(&self) -> &Arc<dyn LogStoreAdapter> {
		&self.adapter
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use braid_types::adapters::compaction_store::InMemoryCompactionJobStore;
	use braid_types::adapters::log_store::InMemoryLogStore;

	fn store(threshold: u64) -> LogStore {
		LogStore::new(Arc::new(InMemoryLogStore::new()), Arc::new(InMemoryCompactionJobStore::new()), threshold)
	}

	#[tokio::test]
	async fn appends_allocate_strictly_increasing_seqs() {
		let log = store(500);
		let a = log.append_delta("docs", "x", b"1", DeltaType::Insert).await.unwrap();
		let b = log.append_delta("docs", "x", b"2", DeltaType::Update).await.unwrap();
		assert_eq!(a, Seq(1));
		assert_eq!(b, Seq(2));
	}

	#[tokio::test]
	async fn crossing_threshold_enqueues_exactly_one_job() {
		let log = store(2);
		log.append_delta("docs", "x", b"1", DeltaType::Insert).await.unwrap();
		log.append_delta("docs", "x", b"2", DeltaType::Update).await.unwrap();
		log.append_delta("docs", "x", b"3", DeltaType::Update).await.unwrap();

		let active = log.compaction.active_for("docs", "x").await.unwrap();
		assert!(active.is_some());
	}
}

// vim: ts=4
