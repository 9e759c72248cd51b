//! Storage contract for the log store: append-only deltas, snapshots,
//! and the per-collection monotonic sequence allocator. An implementation
//! is the "transactional store" collaborator.

use async_trait::async_trait;

use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct DeltaRow {
	pub document: DocumentId,
	pub seq: Seq,
	pub bytes: Vec<u8>,
	pub timestamp: Timestamp,
	pub delta_type: DeltaType,
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
	pub document: DocumentId,
	pub bytes: Vec<u8>,
	pub vector: Vec<u8>,
	pub seq: Seq,
	pub created_at: Timestamp,
}

#[async_trait]
pub trait LogStoreAdapter: Send + Sync {
	/// Atomically allocate and persist the next sequence number for a
	/// collection. Must retry under contention rather than return a
	/// duplicate. On first use for a collection with no persisted counter,
	/// seeds from `max(delta.seq)` so a migrated-in collection's existing
	/// deltas keep their ordering instead of colliding with a fresh count
	/// from zero.
	async fn next_seq(&self, collection: &str) -> BraidResult<Seq>;

	/// Peek the current counter without allocating. Used by compaction as
	/// the boundary-seq read: it must observe the horizon
	/// without itself consuming a seq no delta will ever carry.
	async fn current_seq(&self, collection: &str) -> BraidResult<Seq>;

	/// Persist one delta row at an already-allocated seq.
	async fn insert_delta(
		&self,
		collection: &str,
		document: &str,
		seq: Seq,
		bytes: &[u8],
		timestamp: Timestamp,
		delta_type: DeltaType,
	) -> BraidResult<()>;

	/// Deltas for the whole collection with `seq > after`, ascending, capped
	/// at `limit` rows. Backs the stream service.
	async fn deltas_since(
		&self,
		collection: &str,
		after: Seq,
		limit: usize,
	) -> BraidResult<Vec<DeltaRow>>;

	/// All deltas for one document with `seq <= boundary`, ascending. Backs
	/// compaction and recovery.
	async fn document_deltas_upto(
		&self,
		collection: &str,
		document: &str,
		boundary: Seq,
	) -> BraidResult<Vec<DeltaRow>>;

	/// Seq of the oldest delta still retained in the collection, if any.
	async fn oldest_seq(&self, collection: &str) -> BraidResult<Option<Seq>>;

	/// Remove specific delta rows for a document (post-compaction GC).
	async fn delete_deltas(&self, collection: &str, document: &str, seqs: &[Seq])
	-> BraidResult<()>;

	/// O(1) delta-count lookup used to decide when to trigger compaction.
	async fn delta_count(&self, collection: &str, document: &str) -> BraidResult<u64>;

	async fn get_snapshot(
		&self,
		collection: &str,
		document: &str,
	) -> BraidResult<Option<SnapshotRow>>;

	async fn put_snapshot(&self, collection: &str, row: SnapshotRow) -> BraidResult<()>;

	/// Every live snapshot in a collection, used by the stream service when a
	/// client's cursor has fallen off the retained log.
	async fn list_snapshots(&self, collection: &str) -> BraidResult<Vec<SnapshotRow>>;
}

/// In-memory reference implementation. Useful as a test fixture and as a
/// minimal embedder path with no durability requirement.
#[derive(Default)]
pub struct InMemoryLogStore {
	inner: std::sync::Mutex<InMemoryLogStoreInner>,
}

#[derive(Default)]
struct InMemoryLogStoreInner {
	sequences: std::collections::HashMap<Box<str>, u64>,
	deltas: Vec<(Box<str>, DeltaRow)>,
	snapshots: std::collections::HashMap<(Box<str>, Box<str>), SnapshotRow>,
}

impl InMemoryLogStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed value for a collection with no `sequences` entry yet: the
	/// highest seq already present among its deltas, so the first
	/// allocation continues past whatever was inserted directly rather than
	/// restarting from zero.
	fn max_delta_seq(inner: &InMemoryLogStoreInner, collection: &str) -> u64 {
		inner.deltas.iter().filter(|(c, _)| c.as_ref() == collection).map(|(_, d)| d.seq.0).max().unwrap_or(0)
	}
}

#[async_trait]
impl LogStoreAdapter for InMemoryLogStore {
	async fn next_seq(&self, collection: &str) -> BraidResult<Seq> {
		let mut inner = lock!(self.inner, "log_store.inner")?;
		let seed = Self::max_delta_seq(&inner, collection);
		let counter = inner.sequences.entry(collection.into()).or_insert(seed);
		*counter += 1;
		Ok(Seq(*counter))
	}

	async fn current_seq(&self, collection: &str) -> BraidResult<Seq> {
		let inner = lock!(self.inner, "log_store.inner")?;
		match inner.sequences.get(collection).copied() {
			Some(seq) => Ok(Seq(seq)),
			None => Ok(Seq(Self::max_delta_seq(&inner, collection))),
		}
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
		let mut inner = lock!(self.inner, "log_store.inner")?;
		inner.deltas.push((
			collection.into(),
			DeltaRow { document: document.into(), seq, bytes: bytes.to_vec(), timestamp, delta_type },
		));
		Ok(())
	}

	async fn deltas_since(&self, collection: &str, after: Seq, limit: usize) -> BraidResult<Vec<DeltaRow>> {
		let inner = lock!(self.inner, "log_store.inner")?;
		let mut rows: Vec<DeltaRow> = inner
			.deltas
			.iter()
			.filter(|(c, d)| c.as_ref() == collection && d.seq > after)
			.map(|(_, d)| d.clone())
			.collect();
		rows.sort_by_key(|d| d.seq);
		rows.truncate(limit);
		Ok(rows)
	}

	async fn document_deltas_upto(
		&self,
		collection: &str,
		document: &str,
		boundary: Seq,
	) -> BraidResult<Vec<DeltaRow>> {
		let inner = lock!(self.inner, "log_store.inner")?;
		let mut rows: Vec<DeltaRow> = inner
			.deltas
			.iter()
			.filter(|(c, d)| c.as_ref() == collection && d.document.as_ref() == document && d.seq <= boundary)
			.map(|(_, d)| d.clone())
			.collect();
		rows.sort_by_key(|d| d.seq);
		Ok(rows)
	}

	async fn oldest_seq(&self, collection: &str) -> BraidResult<Option<Seq>> {
		let inner = lock!(self.inner, "log_store.inner")?;
		Ok(inner.deltas.iter().filter(|(c, _)| c.as_ref() == collection).map(|(_, d)| d.seq).min())
	}

	async fn delete_deltas(&self, collection: &str, document: &str, seqs: &[Seq]) -> BraidResult<()> {
		let mut inner = lock!(self.inner, "log_store.inner")?;
		inner
			.deltas
			.retain(|(c, d)| !(c.as_ref() == collection && d.document.as_ref() == document && seqs.contains(&d.seq)));
		Ok(())
	}

	async fn delta_count(&self, collection: &str, document: &str) -> BraidResult<u64> {
		let inner = lock!(self.inner, "log_store.inner")?;
		Ok(inner
			.deltas
			.iter()
			.filter(|(c, d)| c.as_ref() == collection && d.document.as_ref() == document)
			.count() as u64)
	}

	async fn get_snapshot(&self, collection: &str, document: &str) -> BraidResult<Option<SnapshotRow>> {
		let inner = lock!(self.inner, "log_store.inner")?;
		Ok(inner.snapshots.get(&(collection.into(), document.into())).cloned())
	}

	async fn put_snapshot(&self, collection: &str, row: SnapshotRow) -> BraidResult<()> {
		let mut inner = lock!(self.inner, "log_store.inner")?;
		inner.snapshots.insert((collection.into(), row.document.clone()), row);
		Ok(())
	}

	async fn list_snapshots(&self, collection: &str) -> BraidResult<Vec<SnapshotRow>> {
		let inner = lock!(self.inner, "log_store.inner")?;
		Ok(inner.snapshots.iter().filter(|((c, _), _)| c.as_ref() == collection).map(|(_, s)| s.clone()).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn next_seq_is_strictly_increasing() {
		let store = InMemoryLogStore::new();
		let a = store.next_seq("docs").await.unwrap();
		let b = store.next_seq("docs").await.unwrap();
		assert_eq!(a, Seq(1));
		assert_eq!(b, Seq(2));
	}

	#[tokio::test]
	async fn next_seq_seeds_from_existing_deltas_when_sequences_entry_is_missing() {
		let store = InMemoryLogStore::new();
		store.insert_delta("docs", "a", Seq(5), b"old", Timestamp::now(), DeltaType::Insert).await.unwrap();
		store.insert_delta("docs", "b", Seq(7), b"old", Timestamp::now(), DeltaType::Insert).await.unwrap();

		assert_eq!(store.current_seq("docs").await.unwrap(), Seq(7));
		assert_eq!(store.next_seq("docs").await.unwrap(), Seq(8));
		assert_eq!(store.next_seq("docs").await.unwrap(), Seq(9));
	}

	#[tokio::test]
	async fn deltas_since_is_ascending_and_capped() {
		let store = InMemoryLogStore::new();
		for i in 0..5 {
			let seq = store.next_seq("docs").await.unwrap();
			store
				.insert_delta("docs", "a", seq, &[i], Timestamp::now(), DeltaType::Update)
				.await
				.unwrap();
		}
		let rows = store.deltas_since("docs", Seq(1), 2).await.unwrap();
		assert_eq!(rows.len(), 2);
		assert!(rows[0].seq < rows[1].seq);
	}
}

// vim: ts=4
