use braid_store_adapter_redb::RedbStore;
use braid_types::adapters::compaction_store::{CompactionJobStoreAdapter, EnqueueOutcome};
use braid_types::adapters::log_store::{LogStoreAdapter, SnapshotRow};
use braid_types::prelude::*;

fn create_test_store() -> (RedbStore, tempfile::TempDir) {
	let dir = tempfile::TempDir::new().unwrap();
	let store = RedbStore::open(dir.path().join("store.redb")).unwrap();
	(store, dir)
}

#[tokio::test]
async fn insert_then_read_back_a_delta() {
	let (store, _dir) = create_test_store();
	let seq = store.next_seq("docs").await.unwrap();
	store.insert_delta("docs", "doc-1", seq, b"payload", Timestamp::now(), DeltaType::Insert).await.unwrap();

	let rows = store.deltas_since("docs", Seq::ZERO, 10).await.unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].bytes, b"payload");
	assert_eq!(rows[0].document.as_ref(), "doc-1");
}

#[tokio::test]
async fn empty_collection_has_no_oldest_seq() {
	let (store, _dir) = create_test_store();
	assert_eq!(store.oldest_seq("docs").await.unwrap(), None);
	assert!(store.deltas_since("docs", Seq::ZERO, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn collections_do_not_interfere() {
	let (store, _dir) = create_test_store();
	let seq_a = store.next_seq("a").await.unwrap();
	store.insert_delta("a", "doc", seq_a, b"1", Timestamp::now(), DeltaType::Insert).await.unwrap();
	let seq_b = store.next_seq("b").await.unwrap();
	store.insert_delta("b", "doc", seq_b, b"2", Timestamp::now(), DeltaType::Insert).await.unwrap();

	assert_eq!(store.deltas_since("a", Seq::ZERO, 10).await.unwrap().len(), 1);
	assert_eq!(store.deltas_since("b", Seq::ZERO, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn compaction_trims_the_log_behind_a_snapshot() {
	let (store, _dir) = create_test_store();
	let mut last_seq = Seq::ZERO;
	for i in 0..3u8 {
		let seq = store.next_seq("docs").await.unwrap();
		store.insert_delta("docs", "doc-1", seq, &[i], Timestamp::now(), DeltaType::Update).await.unwrap();
		last_seq = seq;
	}

	let snapshot = SnapshotRow { document: "doc-1".into(), bytes: vec![9, 9], vector: vec![], seq: last_seq, created_at: Timestamp::now() };
	store.put_snapshot("docs", snapshot).await.unwrap();

	let boundary_rows = store.document_deltas_upto("docs", "doc-1", last_seq).await.unwrap();
	let seqs: Vec<Seq> = boundary_rows.iter().map(|r| r.seq).collect();
	store.delete_deltas("docs", "doc-1", &seqs).await.unwrap();

	assert_eq!(store.delta_count("docs", "doc-1").await.unwrap(), 0);
	let restored = store.get_snapshot("docs", "doc-1").await.unwrap().unwrap();
	assert_eq!(restored.seq, last_seq);
}

#[tokio::test]
async fn compaction_job_lifecycle_reaches_done() {
	let (store, _dir) = create_test_store();
	let EnqueueOutcome::Created(id) = store.enqueue("docs", "doc-1").await.unwrap() else {
		panic!("first enqueue for an idle document always creates a job");
	};
	store.start(id).await.unwrap();
	store.finish_done(id).await.unwrap();

	let job = store.get(id).await.unwrap().unwrap();
	assert_eq!(job.status, CompactionStatus::Done);
	assert!(store.active_for("docs", "doc-1").await.unwrap().is_none());
}

#[tokio::test]
async fn data_survives_reopening_the_same_file() {
	let dir = tempfile::TempDir::new().unwrap();
	let path = dir.path().join("store.redb");

	{
		let store = RedbStore::open(&path).unwrap();
		let seq = store.next_seq("docs").await.unwrap();
		store.insert_delta("docs", "doc-1", seq, b"persisted", Timestamp::now(), DeltaType::Insert).await.unwrap();
	}

	let reopened = RedbStore::open(&path).unwrap();
	let rows = reopened.deltas_since("docs", Seq::ZERO, 10).await.unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].bytes, b"persisted");
}
