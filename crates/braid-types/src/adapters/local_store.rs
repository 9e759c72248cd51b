//! The client-side "local persistence" collaborator: a durable
//! key-value store plus a per-document CRDT blob store. The concrete
//! embedded database is explicitly out of scope — callers provide one.

use async_trait::async_trait;

use crate::prelude::*;

#[async_trait]
pub trait LocalPersistenceAdapter: Send + Sync {
	async fn get(&self, key: &str) -> BraidResult<Option<Vec<u8>>>;
	async fn set(&self, key: &str, value: &[u8]) -> BraidResult<()>;

	async fn get_doc_state(&self, collection: &str, document: &str)
	-> BraidResult<Option<Vec<u8>>>;
	async fn set_doc_state(&self, collection: &str, document: &str, bytes: &[u8])
	-> BraidResult<()>;
	async fn delete_doc_state(&self, collection: &str, document: &str) -> BraidResult<()>;

	/// Every document id with persisted state in a collection, used to
	/// reconstruct document handles on startup.
	async fn list_doc_ids(&self, collection: &str) -> BraidResult<Vec<DocumentId>>;
}

/// In-memory reference implementation, used as a test fixture and for
/// embedders with no cross-restart durability requirement.
#[derive(Default)]
pub struct InMemoryLocalStore {
	kv: std::sync::Mutex<std::collections::HashMap<Box<str>, Vec<u8>>>,
	docs: std::sync::Mutex<std::collections::HashMap<(Box<str>, Box<str>), Vec<u8>>>,
}

impl InMemoryLocalStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl LocalPersistenceAdapter for InMemoryLocalStore {
	async fn get(&self, key: &str) -> BraidResult<Option<Vec<u8>>> {
		let kv = lock!(self.kv, "local_store.kv")?;
		Ok(kv.get(key).cloned())
	}

	async fn set(&self, key: &str, value: &[u8]) -> BraidResult<()> {
		let mut kv = lock!(self.kv, "local_store.kv")?;
		kv.insert(key.into(), value.to_vec());
		Ok(())
	}

	async fn get_doc_state(&self, collection: &str, document: &str) -> BraidResult<Option<Vec<u8>>> {
		let docs = lock!(self.docs, "local_store.docs")?;
		Ok(docs.get(&(collection.into(), document.into())).cloned())
	}

	async fn set_doc_state(&self, collection: &str, document: &str, bytes: &[u8]) -> BraidResult<()> {
		let mut docs = lock!(self.docs, "local_store.docs")?;
		docs.insert((collection.into(), document.into()), bytes.to_vec());
		Ok(())
	}

	async fn delete_doc_state(&self, collection: &str, document: &str) -> BraidResult<()> {
		let mut docs = lock!(self.docs, "local_store.docs")?;
		docs.remove(&(collection.into(), document.into()));
		Ok(())
	}

	async fn list_doc_ids(&self, collection: &str) -> BraidResult<Vec<DocumentId>> {
		let docs = lock!(self.docs, "local_store.docs")?;
		Ok(docs.keys().filter(|(c, _)| c.as_ref() == collection).map(|(_, d)| d.clone()).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn doc_state_round_trips() {
		let store = InMemoryLocalStore::new();
		store.set_doc_state("docs", "a", b"bytes").await.unwrap();
		assert_eq!(store.get_doc_state("docs", "a").await.unwrap(), Some(b"bytes".to_vec()));
		assert_eq!(store.list_doc_ids("docs").await.unwrap(), vec![DocumentId::from("a")]);
	}
}

// vim: ts=4
