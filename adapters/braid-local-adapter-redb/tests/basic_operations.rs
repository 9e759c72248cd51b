use braid_local_adapter_redb::RedbLocalStore;
use braid_types::adapters::local_store::LocalPersistenceAdapter;

fn create_test_store() -> (RedbLocalStore, tempfile::TempDir) {
	let dir = tempfile::TempDir::new().unwrap();
	let store = RedbLocalStore::open(dir.path().join("local.redb")).unwrap();
	(store, dir)
}

#[tokio::test]
async fn missing_key_reads_as_none() {
	let (store, _dir) = create_test_store();
	assert_eq!(store.get("missing").await.unwrap(), None);
	assert_eq!(store.get_doc_state("docs", "missing").await.unwrap(), None);
}

#[tokio::test]
async fn reconstruct_document_handles_from_persisted_state() {
	let (store, _dir) = create_test_store();
	store.set_doc_state("docs", "a", b"doc-a").await.unwrap();
	store.set_doc_state("docs", "b", b"doc-b").await.unwrap();

	let mut ids = store.list_doc_ids("docs").await.unwrap();
	ids.sort();
	assert_eq!(ids.len(), 2);

	for id in &ids {
		let bytes = store.get_doc_state("docs", id).await.unwrap();
		assert!(bytes.is_some());
	}
}

#[tokio::test]
async fn deleting_a_document_drops_it_from_the_id_listing() {
	let (store, _dir) = create_test_store();
	store.set_doc_state("docs", "a", b"1").await.unwrap();
	store.delete_doc_state("docs", "a").await.unwrap();
	assert!(store.list_doc_ids("docs").await.unwrap().is_empty());
}
