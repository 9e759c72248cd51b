//! Stream and recovery server queries: the two read paths a
//! client's sync loop drives, on top of the delta log and its snapshots.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use braid_log::LogStore;
use braid_types::adapters::main_table::MainTableAdapter;
use braid_types::prelude::*;

/// Whether a [`StreamChange`] carries a log delta or a full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Delta,
	Snapshot,
}

#[derive(Debug, Clone)]
pub struct StreamChange {
	pub document: DocumentId,
	pub bytes: Vec<u8>,
	pub seq: Seq,
	pub kind: ChangeKind,
	/// Whether the document is still present in the main table, when one is
	/// configured. `None` when no main table adapter is wired.
	pub exists: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct StreamResult {
	pub changes: Vec<StreamChange>,
	pub seq: Seq,
	pub more: bool,
	/// Set when any returned document's delta count has crossed the caller-
	/// supplied threshold, hinting that compaction is due.
	pub compact: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
	pub diff: Option<Vec<u8>>,
	pub server_vector: Vec<u8>,
}

/// Serves `stream` and `recovery` queries against a
/// [`LogStore`], optionally enriching stream changes with an `exists` flag
/// from a main table.
pub struct StreamService {
	log: Arc<LogStore>,
	main_table: Option<Arc<dyn MainTableAdapter>>,
}

impl StreamService {
	#[must_use]
	pub fn new(log: Arc<LogStore>, main_table: Option<Arc<dyn MainTableAdapter>>) -> Self {
		Self { log, main_table }
	}

	/// deltas past `after_seq`, falling back to a full snapshot batch
	/// on a gap, and failing with [`Error::Disparity`] if even that cannot
	/// cover the gap.
	pub async fn stream(
		&self,
		collection: &str,
		after_seq: Seq,
		limit: usize,
		threshold: u64,
	) -> BraidResult<StreamResult> {
		let rows = self.log.deltas_since(collection, after_seq, limit).await?;

		if !rows.is_empty() {
			let seq = rows.iter().map(|r| r.seq).max().unwrap_or(after_seq);
			let more = rows.len() == limit;
			let mut compact = None;
			let mut changes = Vec::with_capacity(rows.len());
			for row in rows {
				let count = self.log.adapter().delta_count(collection, &row.document).await?;
				if count >= threshold {
					compact = Some(true);
				}
				changes.push(StreamChange {
					exists: self.exists(collection, &row.document).await?,
					document: row.document,
					bytes: row.bytes,
					seq: row.seq,
					kind: ChangeKind::Delta,
				});
			}
			return Ok(StreamResult { changes, seq, more, compact });
		}

		let snapshots = self.log.list_snapshots(collection).await?;
		let oldest = self.log.oldest_seq(collection).await?;
		// No retained delta starts past `after_seq` (or none are retained at
		// all). A gap exists if either a retained delta's seq exceeds what
		// the client has, or the log has been compacted to snapshots only
		// (`oldest` is `None` but snapshots exist). A collection with
		// neither deltas nor snapshots simply has no history yet.
		let gap = oldest.is_some_and(|oldest| after_seq < oldest) || (oldest.is_none() && !snapshots.is_empty());
		if gap {
			if snapshots.is_empty() {
				return Err(Error::Disparity);
			}
			let mut changes = Vec::with_capacity(snapshots.len());
			let mut seq = after_seq;
			for snapshot in snapshots {
				seq = seq.max(snapshot.seq);
				changes.push(StreamChange {
					exists: self.exists(collection, &snapshot.document).await?,
					document: snapshot.document,
					bytes: snapshot.bytes,
					seq: snapshot.seq,
					kind: ChangeKind::Snapshot,
				});
			}
			return Ok(StreamResult { changes, seq, more: false, compact: None });
		}

		Ok(StreamResult { changes: Vec::new(), seq: after_seq, more: false, compact: None })
	}

	/// merge the document's snapshot and trailing deltas, diff against
	/// the client's vector.
	pub async fn recovery(
		&self,
		collection: &str,
		document: &str,
		client_vector: &[u8],
	) -> BraidResult<RecoveryResult> {
		let snapshot = self.log.get_snapshot(collection, document).await?;
		let boundary = self.log.current_seq(collection).await?;
		let deltas = self.log.document_deltas_upto(collection, document, boundary).await?;

		if snapshot.is_none() && deltas.is_empty() {
			let empty_vector = braid_codec::encode_state_vector(&yrs::Doc::new());
			return Ok(RecoveryResult { diff: None, server_vector: empty_vector });
		}

		let mut updates: Vec<Vec<u8>> = Vec::with_capacity(deltas.len() + 1);
		if let Some(snapshot) = snapshot {
			updates.push(snapshot.bytes);
		}
		updates.extend(deltas.into_iter().map(|d| d.bytes));
		let merged = braid_codec::merge_updates(&updates)?;
		let server_vector = braid_codec::state_vector_of(&merged)?;
		let diff_bytes = braid_codec::diff(&merged, client_vector)?;

		Ok(RecoveryResult {
			diff: if braid_codec::is_empty_diff(&diff_bytes) { None } else { Some(diff_bytes) },
			server_vector,
		})
	}

	async fn exists(&self, collection: &str, document: &str) -> BraidResult<Option<bool>> {
		match &self.main_table {
			Some(table) => Ok(Some(table.exists(collection, document).await?)),
			None => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use braid_types::adapters::compaction_store::InMemoryCompactionJobStore;
	use braid_types::adapters::log_store::InMemoryLogStore;
	use braid_types::adapters::main_table::InMemoryMainTable;
	use yrs::{Doc, Map, Transact};

	fn delta_for(key: &str, value: &str) -> Vec<u8> {
		let doc = Doc::new();
		{
			let mut txn = doc.transact_mut();
			let map = txn.get_or_insert_map("fields");
			map.insert(&mut txn, key, value);
		}
		braid_codec::encode_update(&doc)
	}

	fn log(threshold: u64) -> Arc<LogStore> {
		Arc::new(LogStore::new(
			Arc::new(InMemoryLogStore::new()),
			Arc::new(InMemoryCompactionJobStore::new()),
			threshold,
		))
	}

	#[tokio::test]
	async fn stream_returns_deltas_ascending() {
		let log = log(500);
		log.append_delta("docs", "a", &delta_for("t", "1"), DeltaType::Insert).await.unwrap();
		log.append_delta("docs", "a", &delta_for("t", "2"), DeltaType::Update).await.unwrap();

		let svc = StreamService::new(log, None);
		let result = svc.stream("docs", Seq(0), 10, 500).await.unwrap();
		assert_eq!(result.changes.len(), 2);
		assert_eq!(result.seq, Seq(2));
		assert!(!result.more);
	}

	#[tokio::test]
	async fn stream_with_saturated_limit_reports_more() {
		let log = log(500);
		for i in 0..3u8 {
			log.append_delta("docs", "a", &delta_for("t", &i.to_string()), DeltaType::Update).await.unwrap();
		}
		let svc = StreamService::new(log, None);
		let result = svc.stream("docs", Seq(0), 2, 500).await.unwrap();
		assert_eq!(result.changes.len(), 2);
		assert!(result.more);
	}

	#[tokio::test]
	async fn stream_gap_falls_back_to_snapshots() {
		let log = log(500);
		log.append_delta("docs", "a", &delta_for("t", "1"), DeltaType::Insert).await.unwrap();
		log.put_snapshot(
			"docs",
			braid_types::adapters::log_store::SnapshotRow {
				document: "a".into(),
				bytes: delta_for("t", "1"),
				vector: braid_codec::encode_state_vector(&Doc::new()),
				seq: Seq(1),
				created_at: Timestamp::now(),
			},
		)
		.await
		.unwrap();
		log.delete_deltas("docs", "a", &[Seq(1)]).await.unwrap();

		let svc = StreamService::new(log, None);
		let result = svc.stream("docs", Seq(0), 10, 500).await.unwrap();
		assert_eq!(result.changes.len(), 1);
		assert_eq!(result.changes[0].kind, ChangeKind::Snapshot);
	}

	/// A minimal fake store reporting a delta-free, snapshot-free collection
	/// so a cursor that nonetheless claims to be behind the log's boundary
	/// (a state a conforming adapter should never produce, since compaction
	/// always snapshots before deleting) exercises the `Disparity` branch
	/// directly, independent of whether `InMemoryLogStore` can reach it.
	struct EmptyWithPhantomHistory;

	#[async_trait::async_trait]
	impl braid_types::adapters::log_store::LogStoreAdapter for EmptyWithPhantomHistory {
		async fn next_seq(&self, _collection: &str) -> BraidResult<Seq> {
			Ok(Seq(1))
		}
		async fn current_seq(&self, _collection: &str) -> BraidResult<Seq> {
			Ok(Seq(0))
		}
		async fn insert_delta(
			&self,
			_collection: &str,
			_document: &str,
			_seq: Seq,
			_bytes: &[u8],
			_timestamp: Timestamp,
			_delta_type: DeltaType,
		) -> BraidResult<()> {
			Ok(())
		}
		async fn deltas_since(
			&self,
			_collection: &str,
			_after: Seq,
			_limit: usize,
		) -> BraidResult<Vec<braid_types::adapters::log_store::DeltaRow>> {
			Ok(Vec::new())
		}
		async fn document_deltas_upto(
			&self,
			_collection: &str,
			_document: &str,
			_boundary: Seq,
		) -> BraidResult<Vec<braid_types::adapters::log_store::DeltaRow>> {
			Ok(Vec::new())
		}
		async fn oldest_seq(&self, _collection: &str) -> BraidResult<Option<Seq>> {
			Ok(Some(Seq(5)))
		}
		async fn delete_deltas(&self, _collection: &str, _document: &str, _seqs: &[Seq]) -> BraidResult<()> {
			Ok(())
		}
		async fn delta_count(&self, _collection: &str, _document: &str) -> BraidResult<u64> {
			Ok(0)
		}
		async fn get_snapshot(
			&self,
			_collection: &str,
			_document: &str,
		) -> BraidResult<Option<braid_types::adapters::log_store::SnapshotRow>> {
			Ok(None)
		}
		async fn put_snapshot(
			&self,
			_collection: &str,
			_row: braid_types::adapters::log_store::SnapshotRow,
		) -> BraidResult<()> {
			Ok(())
		}
		async fn list_snapshots(
			&self,
			_collection: &str,
		) -> BraidResult<Vec<braid_types::adapters::log_store::SnapshotRow>> {
			Ok(Vec::new())
		}
	}

	#[tokio::test]
	async fn stream_gap_with_no_snapshots_is_disparity() {
		let log = Arc::new(LogStore::new(
			Arc::new(EmptyWithPhantomHistory),
			Arc::new(InMemoryCompactionJobStore::new()),
			500,
		));
		let svc = StreamService::new(log, None);
		let err = svc.stream("docs", Seq(0), 10, 500).await.unwrap_err();
		assert!(matches!(err, Error::Disparity));
	}

	#[tokio::test]
	async fn stream_reports_exists_from_main_table() {
		let log = log(500);
		log.append_delta("docs", "a", &delta_for("t", "1"), DeltaType::Insert).await.unwrap();
		let table = Arc::new(InMemoryMainTable::new());
		table.upsert("docs", "a", serde_json::json!({}), Timestamp::now()).await.unwrap();

		let svc = StreamService::new(log, Some(table));
		let result = svc.stream("docs", Seq(0), 10, 500).await.unwrap();
		assert_eq!(result.changes[0].exists, Some(true));
	}

	#[tokio::test]
	async fn recovery_on_empty_document_has_no_diff() {
		let log = log(500);
		let svc = StreamService::new(log, None);
		let result = svc.recovery("docs", "missing", &braid_codec::encode_state_vector(&Doc::new())).await.unwrap();
		assert!(result.diff.is_none());
	}

	#[tokio::test]
	async fn recovery_returns_diff_for_behind_client() {
		let log = log(500);
		log.append_delta("docs", "a", &delta_for("t", "1"), DeltaType::Insert).await.unwrap();
		let svc = StreamService::new(log, None);
		let result = svc.recovery("docs", "a", &braid_codec::encode_state_vector(&Doc::new())).await.unwrap();
		assert!(result.diff.is_some());
	}
}

// vim: ts=4
