//! redb-backed [`LogStoreAdapter`] and [`CompactionJobStoreAdapter`]
//! implementation.
//!
//! # Storage layout
//!
//! - `delta_bytes` — raw delta payload, keyed `collection\0seq\0document`
//!   (zero-padded seq so a prefix scan over `collection\0` comes back in
//!   seq order regardless of which document each delta belongs to).
//! - `delta_meta` — JSON sidecar for the same key: document, seq, timestamp,
//!   delta type.
//! - `sequences` — `collection -> current counter`, the monotonic seq
//!   allocator.
//! - `snapshot_bytes` / `snapshot_meta` — same raw-bytes/JSON-sidecar split,
//!   keyed `collection\0document`.
//! - `compaction_jobs` — `job_id -> JSON CompactionJobRow`.
//! - `job_counter` — single-row table holding the next job id.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};

use braid_types::adapters::compaction_store::{CompactionJobRow, CompactionJobStoreAdapter, EnqueueOutcome, JobId};
use braid_types::adapters::log_store::{DeltaRow, LogStoreAdapter, SnapshotRow};
use braid_types::prelude::*;

mod tables {
	use redb::TableDefinition;

	pub const DELTA_BYTES: TableDefinition<&str, &[u8]> = TableDefinition::new("delta_bytes");
	pub const DELTA_META: TableDefinition<&str, &str> = TableDefinition::new("delta_meta");
	pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
	pub const SNAPSHOT_BYTES: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshot_bytes");
	pub const SNAPSHOT_META: TableDefinition<&str, &str> = TableDefinition::new("snapshot_meta");
	pub const COMPACTION_JOBS: TableDefinition<u64, &str> = TableDefinition::new("compaction_jobs");
	pub const JOB_COUNTER: TableDefinition<&str, u64> = TableDefinition::new("job_counter");
}
use tables::*;

const JOB_COUNTER_KEY: &str = "next_id";

fn storage_err(context: &str, e: impl std::fmt::Display) -> Error {
	Error::Storage(format!("{context}: {e}"))
}

fn delta_key(collection: &str, seq: Seq, document: &str) -> String {
	format!("{collection}\0{:020}\0{document}", seq.0)
}

fn delta_collection_prefix(collection: &str) -> String {
	format!("{collection}\0")
}

fn snapshot_key(collection: &str, document: &str) -> String {
	format!("{collection}\0{document}")
}

fn snapshot_collection_prefix(collection: &str) -> String {
	format!("{collection}\0")
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaMeta {
	document: DocumentId,
	seq: Seq,
	timestamp: Timestamp,
	delta_type: DeltaType,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
	document: DocumentId,
	vector: Vec<u8>,
	seq: Seq,
	created_at: Timestamp,
}

/// Shared redb-backed storage for the log and compaction job adapters.
/// Both traits are implemented on the same handle since a compaction run
/// reads the log it is about to trim down against the same file.
#[derive(Debug)]
pub struct RedbStore {
	db: Arc<redb::Database>,
}

impl RedbStore {
	/// Open (creating if absent) a single redb file backing both the log
	/// store and the compaction job store.
	pub fn open(path: impl AsRef<Path>) -> BraidResult<Self> {
		let path: PathBuf = path.as_ref().to_path_buf();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| storage_err("create storage directory", e))?;
		}

		let db = redb::Database::create(&path).map_err(|e| storage_err("open database", e))?;

		let tx = db.begin_write().map_err(|e| storage_err("begin table creation", e))?;
		let _ = tx.open_table(DELTA_BYTES);
		let _ = tx.open_table(DELTA_META);
		let _ = tx.open_table(SEQUENCES);
		let _ = tx.open_table(SNAPSHOT_BYTES);
		let _ = tx.open_table(SNAPSHOT_META);
		let _ = tx.open_table(COMPACTION_JOBS);
		let _ = tx.open_table(JOB_COUNTER);
		tx.commit().map_err(|e| storage_err("commit table creation", e))?;

		Ok(Self { db: Arc::new(db) })
	}
}

#[async_trait]
impl LogStoreAdapter for RedbStore {
	async fn next_seq(&self, collection: &str) -> BraidResult<Seq> {
		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		let next = {
			let mut seq_table = tx.open_table(SEQUENCES).map_err(|e| storage_err("open sequences table", e))?;
			let current = match seq_table.get(collection).map_err(|e| storage_err("read sequence", e))?.map(|v| v.value()) {
				Some(v) => v,
				None => {
					let meta_table = tx.open_table(DELTA_META).map_err(|e| storage_err("open delta_meta table", e))?;
					Self::max_seq_in_delta_meta(&meta_table, collection)?
				}
			};
			let next = current + 1;
			seq_table.insert(collection, next).map_err(|e| storage_err("write sequence", e))?;
			next
		};
		tx.commit().map_err(|e| storage_err("commit sequence", e))?;
		Ok(Seq(next))
	}

	async fn current_seq(&self, collection: &str) -> BraidResult<Seq> {
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let seq_table = tx.open_table(SEQUENCES).map_err(|e| storage_err("open sequences table", e))?;
		let current = match seq_table.get(collection).map_err(|e| storage_err("read sequence", e))?.map(|v| v.value()) {
			Some(v) => v,
			None => {
				let meta_table = tx.open_table(DELTA_META).map_err(|e| storage_err("open delta_meta table", e))?;
				Self::max_seq_in_delta_meta(&meta_table, collection)?
			}
		};
		Ok(Seq(current))
	}

	async fn insert_delta(
		&self,
		collection: &str,
		document: &str,
		seq: Seq,
		bytes: &[u8],
		timestamp: Timestamp,
		delta_type: DeltaType,
	) -> BraidResult<()> {
		let key = delta_key(collection, seq, document);
		let meta = DeltaMeta { document: document.into(), seq, timestamp, delta_type };
		let meta_json = serde_json::to_string(&meta)?;

		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		{
			let mut bytes_table = tx.open_table(DELTA_BYTES).map_err(|e| storage_err("open delta_bytes table", e))?;
			bytes_table.insert(key.as_str(), bytes).map_err(|e| storage_err("insert delta bytes", e))?;
			let mut meta_table = tx.open_table(DELTA_META).map_err(|e| storage_err("open delta_meta table", e))?;
			meta_table.insert(key.as_str(), meta_json.as_str()).map_err(|e| storage_err("insert delta meta", e))?;
		}
		tx.commit().map_err(|e| storage_err("commit delta", e))?;
		Ok(())
	}

	async fn deltas_since(&self, collection: &str, after: Seq, limit: usize) -> BraidResult<Vec<DeltaRow>> {
		let mut rows = self.scan_collection_deltas(collection)?;
		rows.retain(|r| r.seq > after);
		rows.sort_by_key(|r| r.seq);
		rows.truncate(limit);
		Ok(rows)
	}

	async fn document_deltas_upto(&self, collection: &str, document: &str, boundary: Seq) -> BraidResult<Vec<DeltaRow>> {
		let mut rows = self.scan_collection_deltas(collection)?;
		rows.retain(|r| r.document.as_ref() == document && r.seq <= boundary);
		rows.sort_by_key(|r| r.seq);
		Ok(rows)
	}

	async fn oldest_seq(&self, collection: &str) -> BraidResult<Option<Seq>> {
		Ok(self.scan_collection_deltas(collection)?.iter().map(|r| r.seq).min())
	}

	async fn delete_deltas(&self, collection: &str, document: &str, seqs: &[Seq]) -> BraidResult<()> {
		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		{
			let mut bytes_table = tx.open_table(DELTA_BYTES).map_err(|e| storage_err("open delta_bytes table", e))?;
			let mut meta_table = tx.open_table(DELTA_META).map_err(|e| storage_err("open delta_meta table", e))?;
			for seq in seqs {
				let key = delta_key(collection, *seq, document);
				bytes_table.remove(key.as_str()).map_err(|e| storage_err("remove delta bytes", e))?;
				meta_table.remove(key.as_str()).map_err(|e| storage_err("remove delta meta", e))?;
			}
		}
		tx.commit().map_err(|e| storage_err("commit delta deletion", e))?;
		Ok(())
	}

	async fn delta_count(&self, collection: &str, document: &str) -> BraidResult<u64> {
		Ok(self.scan_collection_deltas(collection)?.iter().filter(|r| r.document.as_ref() == document).count() as u64)
	}

	async fn get_snapshot(&self, collection: &str, document: &str) -> BraidResult<Option<SnapshotRow>> {
		let key = snapshot_key(collection, document);
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let bytes_table = tx.open_table(SNAPSHOT_BYTES).map_err(|e| storage_err("open snapshot_bytes table", e))?;
		let meta_table = tx.open_table(SNAPSHOT_META).map_err(|e| storage_err("open snapshot_meta table", e))?;

		let Some(bytes) = bytes_table.get(key.as_str()).map_err(|e| storage_err("read snapshot bytes", e))? else {
			return Ok(None);
		};
		let Some(meta) = meta_table.get(key.as_str()).map_err(|e| storage_err("read snapshot meta", e))? else {
			return Ok(None);
		};
		let meta: SnapshotMeta = serde_json::from_str(meta.value())?;
		Ok(Some(SnapshotRow {
			document: meta.document,
			bytes: bytes.value().to_vec(),
			vector: meta.vector,
			seq: meta.seq,
			created_at: meta.created_at,
		}))
	}

	async fn put_snapshot(&self, collection: &str, row: SnapshotRow) -> BraidResult<()> {
		let key = snapshot_key(collection, &row.document);
		let meta = SnapshotMeta { document: row.document.clone(), vector: row.vector, seq: row.seq, created_at: row.created_at };
		let meta_json = serde_json::to_string(&meta)?;

		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		{
			let mut bytes_table = tx.open_table(SNAPSHOT_BYTES).map_err(|e| storage_err("open snapshot_bytes table", e))?;
			bytes_table.insert(key.as_str(), row.bytes.as_slice()).map_err(|e| storage_err("insert snapshot bytes", e))?;
			let mut meta_table = tx.open_table(SNAPSHOT_META).map_err(|e| storage_err("open snapshot_meta table", e))?;
			meta_table.insert(key.as_str(), meta_json.as_str()).map_err(|e| storage_err("insert snapshot meta", e))?;
		}
		tx.commit().map_err(|e| storage_err("commit snapshot", e))?;
		Ok(())
	}

	async fn list_snapshots(&self, collection: &str) -> BraidResult<Vec<SnapshotRow>> {
		let prefix = snapshot_collection_prefix(collection);
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let bytes_table = tx.open_table(SNAPSHOT_BYTES).map_err(|e| storage_err("open snapshot_bytes table", e))?;
		let meta_table = tx.open_table(SNAPSHOT_META).map_err(|e| storage_err("open snapshot_meta table", e))?;

		let mut rows = Vec::new();
		let range = meta_table.range(prefix.as_str()..).map_err(|e| storage_err("range snapshot_meta", e))?;
		for item in range {
			let (key, meta_value) = item.map_err(|e| storage_err("iterate snapshot_meta", e))?;
			if !key.value().starts_with(&prefix) {
				break;
			}
			let meta: SnapshotMeta = serde_json::from_str(meta_value.value())?;
			let bytes = bytes_table
				.get(key.value())
				.map_err(|e| storage_err("read snapshot bytes", e))?
				.map(|v| v.value().to_vec())
				.unwrap_or_default();
			rows.push(SnapshotRow { document: meta.document, bytes, vector: meta.vector, seq: meta.seq, created_at: meta.created_at });
		}
		Ok(rows)
	}
}

impl RedbStore {
	fn scan_collection_deltas(&self, collection: &str) -> BraidResult<Vec<DeltaRow>> {
		let prefix = delta_collection_prefix(collection);
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let bytes_table = tx.open_table(DELTA_BYTES).map_err(|e| storage_err("open delta_bytes table", e))?;
		let meta_table = tx.open_table(DELTA_META).map_err(|e| storage_err("open delta_meta table", e))?;

		let mut rows = Vec::new();
		let range = meta_table.range(prefix.as_str()..).map_err(|e| storage_err("range delta_meta", e))?;
		for item in range {
			let (key, meta_value) = item.map_err(|e| storage_err("iterate delta_meta", e))?;
			if !key.value().starts_with(&prefix) {
				break;
			}
			let meta: DeltaMeta = serde_json::from_str(meta_value.value())?;
			let bytes = bytes_table
				.get(key.value())
				.map_err(|e| storage_err("read delta bytes", e))?
				.map(|v| v.value().to_vec())
				.unwrap_or_default();
			rows.push(DeltaRow { document: meta.document, seq: meta.seq, bytes, timestamp: meta.timestamp, delta_type: meta.delta_type });
		}
		Ok(rows)
	}

	/// Seed value for a collection whose `sequences` row is missing (a fresh
	/// collection, or one migrated in without the counter table): the
	/// highest seq already recorded in `delta_meta`, so the next allocation
	/// continues past it instead of colliding with existing deltas.
	fn max_seq_in_delta_meta(meta_table: &impl ReadableTable<&str, &str>, collection: &str) -> BraidResult<u64> {
		let prefix = delta_collection_prefix(collection);
		let mut max_seq = 0u64;
		let range = meta_table.range(prefix.as_str()..).map_err(|e| storage_err("range delta_meta", e))?;
		for item in range {
			let (key, value) = item.map_err(|e| storage_err("iterate delta_meta", e))?;
			if !key.value().starts_with(&prefix) {
				break;
			}
			let meta: DeltaMeta = serde_json::from_str(value.value())?;
			max_seq = max_seq.max(meta.seq.0);
		}
		Ok(max_seq)
	}
}

#[async_trait]
impl CompactionJobStoreAdapter for RedbStore {
	async fn enqueue(&self, collection: &str, document: &str) -> BraidResult<EnqueueOutcome> {
		if let Some(existing) = self.active_for(collection, document).await? {
			return Ok(match existing.status {
				CompactionStatus::Running => EnqueueOutcome::AlreadyRunning,
				_ => EnqueueOutcome::AlreadyPending,
			});
		}

		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		let id = {
			let mut counter_table = tx.open_table(JOB_COUNTER).map_err(|e| storage_err("open job_counter table", e))?;
			let current = counter_table.get(JOB_COUNTER_KEY).map_err(|e| storage_err("read job counter", e))?.map(|v| v.value()).unwrap_or(0);
			let id = current + 1;
			counter_table.insert(JOB_COUNTER_KEY, id).map_err(|e| storage_err("write job counter", e))?;

			let row = CompactionJobRow {
				id,
				collection: collection.into(),
				document: document.into(),
				status: CompactionStatus::Pending,
				started: Timestamp::now(),
				completed: None,
				retries: 0,
				error: None,
			};
			let row_json = serde_json::to_string(&row)?;
			let mut jobs_table = tx.open_table(COMPACTION_JOBS).map_err(|e| storage_err("open compaction_jobs table", e))?;
			jobs_table.insert(id, row_json.as_str()).map_err(|e| storage_err("insert compaction job", e))?;
			id
		};
		tx.commit().map_err(|e| storage_err("commit compaction job", e))?;
		Ok(EnqueueOutcome::Created(id))
	}

	async fn start(&self, job: JobId) -> BraidResult<()> {
		self.update_job(job, |row| {
			row.status = CompactionStatus::Running;
			row.started = Timestamp::now();
		})
		.await
	}

	async fn finish_done(&self, job: JobId) -> BraidResult<()> {
		self.update_job(job, |row| {
			row.status = CompactionStatus::Done;
			row.completed = Some(Timestamp::now());
		})
		.await
	}

	async fn finish_failed(&self, job: JobId, error: &str) -> BraidResult<()> {
		self.update_job(job, |row| {
			row.status = CompactionStatus::Failed;
			row.completed = Some(Timestamp::now());
			row.error = Some(error.to_string());
		})
		.await
	}

	async fn retry(&self, job: JobId, error: &str) -> BraidResult<()> {
		self.update_job(job, |row| {
			row.status = CompactionStatus::Pending;
			row.retries += 1;
			row.error = Some(error.to_string());
		})
		.await
	}

	async fn get(&self, job: JobId) -> BraidResult<Option<CompactionJobRow>> {
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let table = tx.open_table(COMPACTION_JOBS).map_err(|e| storage_err("open compaction_jobs table", e))?;
		match table.get(job).map_err(|e| storage_err("read compaction job", e))? {
			Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
			None => Ok(None),
		}
	}

	async fn active_for(&self, collection: &str, document: &str) -> BraidResult<Option<CompactionJobRow>> {
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let table = tx.open_table(COMPACTION_JOBS).map_err(|e| storage_err("open compaction_jobs table", e))?;
		for item in table.iter().map_err(|e| storage_err("iterate compaction_jobs", e))? {
			let (_, value) = item.map_err(|e| storage_err("iterate compaction_jobs", e))?;
			let row: CompactionJobRow = serde_json::from_str(value.value())?;
			if row.collection.as_ref() == collection
				&& row.document.as_ref() == document
				&& matches!(row.status, CompactionStatus::Pending | CompactionStatus::Running)
			{
				return Ok(Some(row));
			}
		}
		Ok(None)
	}
}

impl RedbStore {
	async fn update_job(&self, job: JobId, f: impl FnOnce(&mut CompactionJobRow)) -> BraidResult<()> {
		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		{
			let mut table = tx.open_table(COMPACTION_JOBS).map_err(|e| storage_err("open compaction_jobs table", e))?;
			let value = table.get(job).map_err(|e| storage_err("read compaction job", e))?.ok_or_else(|| Error::NotFound(format!("job {job}")))?;
			let mut row: CompactionJobRow = serde_json::from_str(value.value())?;
			drop(value);
			f(&mut row);
			let row_json = serde_json::to_string(&row)?;
			table.insert(job, row_json.as_str()).map_err(|e| storage_err("update compaction job", e))?;
		}
		tx.commit().map_err(|e| storage_err("commit compaction job update", e))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store() -> (RedbStore, tempfile::TempDir) {
		let dir = tempfile::TempDir::new().unwrap();
		let store = RedbStore::open(dir.path().join("store.redb")).unwrap();
		(store, dir)
	}

	#[tokio::test]
	async fn next_seq_is_strictly_increasing_and_persists_across_reopen() {
		let (store, dir) = store();
		assert_eq!(store.next_seq("docs").await.unwrap(), Seq(1));
		assert_eq!(store.next_seq("docs").await.unwrap(), Seq(2));
		drop(store);

		let reopened = RedbStore::open(dir.path().join("store.redb")).unwrap();
		assert_eq!(reopened.current_seq("docs").await.unwrap(), Seq(2));
		assert_eq!(reopened.next_seq("docs").await.unwrap(), Seq(3));
	}

	#[tokio::test]
	async fn next_seq_seeds_from_existing_deltas_when_sequences_row_is_missing() {
		let (store, _dir) = store();
		// Simulate a migrated-in collection: deltas already recorded, but no
		// `sequences` counter row for it (insert_delta never touches that table).
		store.insert_delta("docs", "a", Seq(5), b"old", Timestamp::now(), DeltaType::Insert).await.unwrap();
		store.insert_delta("docs", "b", Seq(7), b"old", Timestamp::now(), DeltaType::Insert).await.unwrap();

		assert_eq!(store.current_seq("docs").await.unwrap(), Seq(7));
		assert_eq!(store.next_seq("docs").await.unwrap(), Seq(8));
		assert_eq!(store.next_seq("docs").await.unwrap(), Seq(9));
	}

	#[tokio::test]
	async fn deltas_since_is_ascending_and_capped() {
		let (store, _dir) = store();
		for i in 0..5u8 {
			let seq = store.next_seq("docs").await.unwrap();
			store.insert_delta("docs", "a", seq, &[i], Timestamp::now(), DeltaType::Update).await.unwrap();
		}
		let rows = store.deltas_since("docs", Seq(1), 2).await.unwrap();
		assert_eq!(rows.len(), 2);
		assert!(rows[0].seq < rows[1].seq);
	}

	#[tokio::test]
	async fn document_deltas_upto_filters_by_document_and_boundary() {
		let (store, _dir) = store();
		let seq_a1 = store.next_seq("docs").await.unwrap();
		store.insert_delta("docs", "a", seq_a1, b"1", Timestamp::now(), DeltaType::Insert).await.unwrap();
		let seq_b1 = store.next_seq("docs").await.unwrap();
		store.insert_delta("docs", "b", seq_b1, b"1", Timestamp::now(), DeltaType::Insert).await.unwrap();
		let seq_a2 = store.next_seq("docs").await.unwrap();
		store.insert_delta("docs", "a", seq_a2, b"2", Timestamp::now(), DeltaType::Update).await.unwrap();

		let rows = store.document_deltas_upto("docs", "a", seq_a2).await.unwrap();
		assert_eq!(rows.len(), 2);
		assert!(rows.iter().all(|r| r.document.as_ref() == "a"));
	}

	#[tokio::test]
	async fn delete_deltas_removes_both_bytes_and_meta() {
		let (store, _dir) = store();
		let seq = store.next_seq("docs").await.unwrap();
		store.insert_delta("docs", "a", seq, b"1", Timestamp::now(), DeltaType::Insert).await.unwrap();
		store.delete_deltas("docs", "a", &[seq]).await.unwrap();
		assert_eq!(store.delta_count("docs", "a").await.unwrap(), 0);
	}

	#[tokio::test]
	async fn snapshot_round_trips() {
		let (store, _dir) = store();
		let row = SnapshotRow { document: "a".into(), bytes: vec![1, 2, 3], vector: vec![4, 5], seq: Seq(3), created_at: Timestamp::now() };
		store.put_snapshot("docs", row).await.unwrap();
		let fetched = store.get_snapshot("docs", "a").await.unwrap().unwrap();
		assert_eq!(fetched.bytes, vec![1, 2, 3]);
		assert_eq!(fetched.seq, Seq(3));
		assert_eq!(store.list_snapshots("docs").await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn duplicate_enqueue_reports_already_pending() {
		let (store, _dir) = store();
		let first = store.enqueue("docs", "a").await.unwrap();
		assert!(matches!(first, EnqueueOutcome::Created(_)));
		let second = store.enqueue("docs", "a").await.unwrap();
		assert_eq!(second, EnqueueOutcome::AlreadyPending);
	}

	#[tokio::test]
	async fn running_job_reports_already_running() {
		let (store, _dir) = store();
		let EnqueueOutcome::Created(id) = store.enqueue("docs", "a").await.unwrap() else {
			unreachable!("first enqueue always creates")
		};
		store.start(id).await.unwrap();
		assert_eq!(store.enqueue("docs", "a").await.unwrap(), EnqueueOutcome::AlreadyRunning);
		let job = store.get(id).await.unwrap().unwrap();
		assert_eq!(job.status, CompactionStatus::Running);
	}

	#[tokio::test]
	async fn retry_returns_job_to_pending_with_incremented_retries() {
		let (store, _dir) = store();
		let EnqueueOutcome::Created(id) = store.enqueue("docs", "a").await.unwrap() else {
			unreachable!("first enqueue always creates")
		};
		store.start(id).await.unwrap();
		store.retry(id, "transient failure").await.unwrap();
		let job = store.get(id).await.unwrap().unwrap();
		assert_eq!(job.status, CompactionStatus::Pending);
		assert_eq!(job.retries, 1);
		assert_eq!(job.error.as_deref(), Some("transient failure"));
	}
}

// vim: ts=4
