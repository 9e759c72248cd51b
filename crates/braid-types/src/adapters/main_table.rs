//! The "main row table" collaborator: the materialized view external
//! queries read. The engine writes to it; it never reads the delta log.
//! The application schema it carries is explicitly out of scope — this
//! trait only names the read/write surface the replication driver needs.

use async_trait::async_trait;
use serde_json::Value;

use crate::prelude::*;

#[async_trait]
pub trait MainTableAdapter: Send + Sync {
	async fn upsert(
		&self,
		collection: &str,
		document: &str,
		value: Value,
		updated_at: Timestamp,
	) -> BraidResult<()>;

	async fn delete(&self, collection: &str, document: &str) -> BraidResult<()>;

	async fn exists(&self, collection: &str, document: &str) -> BraidResult<bool>;

	async fn get(&self, collection: &str, document: &str) -> BraidResult<Option<Value>>;
}

/// In-memory reference implementation, useful for tests and for embedders
/// that do not need a durable materialized view.
pub struct InMemoryMainTable {
	rows: std::sync::Mutex<std::collections::HashMap<(Box<str>, Box<str>), Value>>,
}

impl InMemoryMainTable {
	#[must_use]
	pub fn new() -> Self {
		Self { rows: std::sync::Mutex::new(std::collections::HashMap::new()) }
	}
}

impl Default for InMemoryMainTable {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl MainTableAdapter for InMemoryMainTable {
	async fn upsert(
		&self,
		collection: &str,
		document: &str,
		value: Value,
		_updated_at: Timestamp,
	) -> BraidResult<()> {
		let mut rows = lock!(self.rows, "main_table.rows")?;
		rows.insert((collection.into(), document.into()), value);
		Ok(())
	}

	async fn delete(&self, collection: &str, document: &str) -> BraidResult<()> {
		let mut rows = lock!(self.rows, "main_table.rows")?;
		rows.remove(&(collection.into(), document.into()));
		Ok(())
	}

	async fn exists(&self, collection: &str, document: &str) -> BraidResult<bool> {
		let rows = lock!(self.rows, "main_table.rows")?;
		Ok(rows.contains_key(&(collection.into(), document.into())))
	}

	async fn get(&self, collection: &str, document: &str) -> BraidResult<Option<Value>> {
		let rows = lock!(self.rows, "main_table.rows")?;
		Ok(rows.get(&(collection.into(), document.into())).cloned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn upsert_then_get() {
		let table = InMemoryMainTable::new();
		table.upsert("docs", "a", serde_json::json!({"title": "A"}), Timestamp::now()).await.unwrap();
		assert!(table.exists("docs", "a").await.unwrap());
		assert_eq!(table.get("docs", "a").await.unwrap().unwrap()["title"], "A");
	}

	#[tokio::test]
	async fn delete_removes_row() {
		let table = InMemoryMainTable::new();
		table.upsert("docs", "a", serde_json::json!({}), Timestamp::now()).await.unwrap();
		table.delete("docs", "a").await.unwrap();
		assert!(!table.exists("docs", "a").await.unwrap());
	}
}

// vim: ts=4
