//! Storage contract for the session tracker.

use async_trait::async_trait;
use serde_json::Value;

use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct SessionRow {
	pub client: ClientId,
	pub vector: Option<Vec<u8>>,
	pub seq: Option<Seq>,
	pub connected: bool,
	pub seen: Timestamp,
	pub profile: Option<Value>,
	pub cursor: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFilter {
	pub connected_only: bool,
	pub group_by_user: bool,
}

#[async_trait]
pub trait SessionStoreAdapter: Send + Sync {
	/// Upsert the `(collection, document, client)` row. `seq` is only ever
	/// advanced, never regressed ( idempotence invariant).
	#[allow(clippy::too_many_arguments)]
	async fn heartbeat(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		vector: Option<Vec<u8>>,
		seq: Option<Seq>,
		profile: Option<Value>,
		cursor: Option<Value>,
		seen: Timestamp,
	) -> BraidResult<()>;

	async fn mark_left(&self, collection: &str, document: &str, client: &str) -> BraidResult<()>;

	async fn get(
		&self,
		collection: &str,
		document: &str,
		client: &str,
	) -> BraidResult<Option<SessionRow>>;

	async fn list(
		&self,
		collection: &str,
		document: &str,
		filter: SessionFilter,
	) -> BraidResult<Vec<SessionRow>>;

	async fn delete(&self, collection: &str, document: &str, client: &str) -> BraidResult<()>;

	/// Sessions last seen before `older_than`, across the whole collection,
	/// used by the stale-timeout sweep.
	async fn stale_sessions(
		&self,
		collection: &str,
		older_than: Timestamp,
	) -> BraidResult<Vec<(DocumentId, SessionRow)>>;
}

type SessionKey = (Box<str>, Box<str>, Box<str>);

/// In-memory reference implementation, used as a test fixture.
#[derive(Default)]
pub struct InMemorySessionStore {
	rows: std::sync::Mutex<std::collections::HashMap<SessionKey, SessionRow>>,
}

impl InMemorySessionStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn key(collection: &str, document: &str, client: &str) -> SessionKey {
		(collection.into(), document.into(), client.into())
	}
}

#[async_trait]
impl SessionStoreAdapter for InMemorySessionStore {
	async fn heartbeat(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		vector: Option<Vec<u8>>,
		seq: Option<Seq>,
		profile: Option<Value>,
		cursor: Option<Value>,
		seen: Timestamp,
	) -> BraidResult<()> {
		let mut rows = lock!(self.rows, "session_store.rows")?;
		let row = rows.entry(Self::key(collection, document, client)).or_insert_with(|| SessionRow {
			client: client.into(),
			vector: None,
			seq: None,
			connected: true,
			seen,
			profile: None,
			cursor: None,
		});
		row.connected = true;
		row.seen = seen;
		if let Some(v) = vector {
			row.vector = Some(v);
		}
		if let Some(s) = seq {
			if row.seq.is_none_or(|current| s > current) {
				row.seq = Some(s);
			}
		}
		if profile.is_some() {
			row.profile = profile;
		}
		if cursor.is_some() {
			row.cursor = cursor;
		}
		Ok(())
	}

	async fn mark_left(&self, collection: &str, document: &str, client: &str) -> BraidResult<()> {
		let mut rows = lock!(self.rows, "session_store.rows")?;
		if let Some(row) = rows.get_mut(&Self::key(collection, document, client)) {
			row.connected = false;
			row.cursor = None;
		}
		Ok(())
	}

	async fn get(&self, collection: &str, document: &str, client: &str) -> BraidResult<Option<SessionRow>> {
		let rows = lock!(self.rows, "session_store.rows")?;
		Ok(rows.get(&Self::key(collection, document, client)).cloned())
	}

	async fn list(&self, collection: &str, document: &str, filter: SessionFilter) -> BraidResult<Vec<SessionRow>> {
		let rows = lock!(self.rows, "session_store.rows")?;
		Ok(rows
			.iter()
			.filter(|((c, d, _), row)| {
				c.as_ref() == collection && d.as_ref() == document && (!filter.connected_only || row.connected)
			})
			.map(|(_, row)| row.clone())
			.collect())
	}

	async fn delete(&self, collection: &str, document: &str, client: &str) -> BraidResult<()> {
		let mut rows = lock!(self.rows, "session_store.rows")?;
		rows.remove(&Self::key(collection, document, client));
		Ok(())
	}

	async fn stale_sessions(
		&self,
		collection: &str,
		older_than: Timestamp,
	) -> BraidResult<Vec<(DocumentId, SessionRow)>> {
		let rows = lock!(self.rows, "session_store.rows")?;
		Ok(rows
			.iter()
			.filter(|((c, _, _), row)| c.as_ref() == collection && row.seen < older_than)
			.map(|((_, d, _), row)| (d.clone(), row.clone()))
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn heartbeat_only_advances_seq() {
		let store = InMemorySessionStore::new();
		store
			.heartbeat("docs", "a", "c1", None, Some(Seq(5)), None, None, Timestamp::now())
			.await
			.unwrap();
		store.heartbeat("docs", "a", "c1", None, Some(Seq(2)), None, None, Timestamp::now()).await.unwrap();
		let row = store.get("docs", "a", "c1").await.unwrap().unwrap();
		assert_eq!(row.seq, Some(Seq(5)));
	}

	#[tokio::test]
	async fn mark_left_clears_connected() {
		let store = InMemorySessionStore::new();
		store.heartbeat("docs", "a", "c1", None, None, None, None, Timestamp::now()).await.unwrap();
		store.mark_left("docs", "a", "c1").await.unwrap();
		let row = store.get("docs", "a", "c1").await.unwrap().unwrap();
		assert!(!row.connected);
	}
}

// vim: ts=4
