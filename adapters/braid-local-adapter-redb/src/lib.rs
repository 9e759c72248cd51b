//! redb-backed [`LocalPersistenceAdapter`]: the embedder's durable
//! key-value store plus per-document CRDT blob store, for the client-side
//! replication driver to reconstruct documents across restarts.
//!
//! # Storage layout
//!
//! - `kv` — opaque key-value pairs (sync cursors, client id, anything else
//!   the embedder stashes).
//! - `doc_state` — `collection\0document -> bytes`, the last persisted CRDT
//!   document encoding.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{ReadableDatabase, ReadableTable, TableDefinition};

use braid_types::adapters::local_store::LocalPersistenceAdapter;
use braid_types::prelude::*;

const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const DOC_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("doc_state");

fn storage_err(context: &str, e: impl std::fmt::Display) -> Error {
	Error::Storage(format!("{context}: {e}"))
}

fn doc_key(collection: &str, document: &str) -> String {
	format!("{collection}\0{document}")
}

fn doc_collection_prefix(collection: &str) -> String {
	format!("{collection}\0")
}

/// Single redb file backing both the key-value store and the per-document
/// state store.
#[derive(Debug)]
pub struct RedbLocalStore {
	db: Arc<redb::Database>,
}

impl RedbLocalStore {
	/// Open (creating if absent) the redb file at `path`.
	pub fn open(path: impl AsRef<Path>) -> BraidResult<Self> {
		let path = path.as_ref();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| storage_err("create storage directory", e))?;
		}

		let db = redb::Database::create(path).map_err(|e| storage_err("open database", e))?;

		let tx = db.begin_write().map_err(|e| storage_err("begin table creation", e))?;
		let _ = tx.open_table(KV);
		let _ = tx.open_table(DOC_STATE);
		tx.commit().map_err(|e| storage_err("commit table creation", e))?;

		Ok(Self { db: Arc::new(db) })
	}
}

#[async_trait]
impl LocalPersistenceAdapter for RedbLocalStore {
	async fn get(&self, key: &str) -> BraidResult<Option<Vec<u8>>> {
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let table = tx.open_table(KV).map_err(|e| storage_err("open kv table", e))?;
		Ok(table.get(key).map_err(|e| storage_err("read kv", e))?.map(|v| v.value().to_vec()))
	}

	async fn set(&self, key: &str, value: &[u8]) -> BraidResult<()> {
		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		{
			let mut table = tx.open_table(KV).map_err(|e| storage_err("open kv table", e))?;
			table.insert(key, value).map_err(|e| storage_err("write kv", e))?;
		}
		tx.commit().map_err(|e| storage_err("commit kv", e))?;
		Ok(())
	}

	async fn get_doc_state(&self, collection: &str, document: &str) -> BraidResult<Option<Vec<u8>>> {
		let key = doc_key(collection, document);
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let table = tx.open_table(DOC_STATE).map_err(|e| storage_err("open doc_state table", e))?;
		Ok(table.get(key.as_str()).map_err(|e| storage_err("read doc state", e))?.map(|v| v.value().to_vec()))
	}

	async fn set_doc_state(&self, collection: &str, document: &str, bytes: &[u8]) -> BraidResult<()> {
		let key = doc_key(collection, document);
		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		{
			let mut table = tx.open_table(DOC_STATE).map_err(|e| storage_err("open doc_state table", e))?;
			table.insert(key.as_str(), bytes).map_err(|e| storage_err("write doc state", e))?;
		}
		tx.commit().map_err(|e| storage_err("commit doc state", e))?;
		Ok(())
	}

	async fn delete_doc_state(&self, collection: &str, document: &str) -> BraidResult<()> {
		let key = doc_key(collection, document);
		let tx = self.db.begin_write().map_err(|e| storage_err("begin write", e))?;
		{
			let mut table = tx.open_table(DOC_STATE).map_err(|e| storage_err("open doc_state table", e))?;
			table.remove(key.as_str()).map_err(|e| storage_err("remove doc state", e))?;
		}
		tx.commit().map_err(|e| storage_err("commit doc state removal", e))?;
		Ok(())
	}

	async fn list_doc_ids(&self, collection: &str) -> BraidResult<Vec<DocumentId>> {
		let prefix = doc_collection_prefix(collection);
		let tx = self.db.begin_read().map_err(|e| storage_err("begin read", e))?;
		let table = tx.open_table(DOC_STATE).map_err(|e| storage_err("open doc_state table", e))?;

		let mut ids = Vec::new();
		let range = table.range(prefix.as_str()..).map_err(|e| storage_err("range doc_state", e))?;
		for item in range {
			let (key, _) = item.map_err(|e| storage_err("iterate doc_state", e))?;
			let key = key.value();
			if !key.starts_with(&prefix) {
				break;
			}
			if let Some(document) = key.strip_prefix(&prefix) {
				ids.push(DocumentId::from(document));
			}
		}
		Ok(ids)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store() -> (RedbLocalStore, tempfile::TempDir) {
		let dir = tempfile::TempDir::new().unwrap();
		let store = RedbLocalStore::open(dir.path().join("local.redb")).unwrap();
		(store, dir)
	}

	#[tokio::test]
	async fn kv_round_trips() {
		let (store, _dir) = store();
		assert_eq!(store.get("cursor").await.unwrap(), None);
		store.set("cursor", b"42").await.unwrap();
		assert_eq!(store.get("cursor").await.unwrap(), Some(b"42".to_vec()));
	}

	#[tokio::test]
	async fn doc_state_round_trips_and_deletes() {
		let (store, _dir) = store();
		store.set_doc_state("docs", "a", b"bytes").await.unwrap();
		assert_eq!(store.get_doc_state("docs", "a").await.unwrap(), Some(b"bytes".to_vec()));
		store.delete_doc_state("docs", "a").await.unwrap();
		assert_eq!(store.get_doc_state("docs", "a").await.unwrap(), None);
	}

	#[tokio::test]
	async fn list_doc_ids_is_scoped_to_its_collection() {
		let (store, _dir) = store();
		store.set_doc_state("docs", "a", b"1").await.unwrap();
		store.set_doc_state("docs", "b", b"2").await.unwrap();
		store.set_doc_state("other", "c", b"3").await.unwrap();

		let mut ids = store.list_doc_ids("docs").await.unwrap();
		ids.sort();
		assert_eq!(ids, vec![DocumentId::from("a"), DocumentId::from("b")]);
	}

	#[tokio::test]
	async fn doc_state_survives_reopening_the_same_file() {
		let dir = tempfile::TempDir::new().unwrap();
		let path = dir.path().join("local.redb");

		{
			let store = RedbLocalStore::open(&path).unwrap();
			store.set_doc_state("docs", "a", b"persisted").await.unwrap();
		}

		let reopened = RedbLocalStore::open(&path).unwrap();
		assert_eq!(reopened.get_doc_state("docs", "a").await.unwrap(), Some(b"persisted".to_vec()));
	}
}

// vim: ts=4
