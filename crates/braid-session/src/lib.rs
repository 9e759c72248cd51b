//! Session and presence tracker: the server-side table of active and
//! recently-seen client sessions per document, plus the disconnect timer
//! that detects a client going quiet without an explicit leave.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use braid_core::scheduler::{Scheduler, Task, TaskId};
use braid_types::adapters::session_store::{SessionFilter, SessionRow, SessionStoreAdapter};
use braid_types::prelude::*;

type TimerKey = (CollectionId, DocumentId, ClientId);

/// Scheduler state: just the adapter the disconnect task needs to mark a
/// session left when its timer fires.
type SessionCtx = Arc<dyn SessionStoreAdapter>;

#[derive(Debug)]
struct DisconnectTask {
	collection: CollectionId,
	document: DocumentId,
	client: ClientId,
}

#[async_trait]
impl Task<SessionCtx> for DisconnectTask {
	async fn run(&self, adapter: &SessionCtx) -> BraidResult<()> {
		adapter.mark_left(&self.collection, &self.document, &self.client).await
	}
}

/// Tracks presence for one store's worth of sessions. Owns a
/// scheduler dedicated to disconnect timers: one task per connected
/// `(collection, document, client)`, rescheduled on every heartbeat and
/// cancelled on `leave`.
pub struct SessionRegistry {
	adapter: Arc<dyn SessionStoreAdapter>,
	scheduler: Arc<Scheduler<SessionCtx>>,
	timers: Mutex<HashMap<TimerKey, TaskId>>,
}

impl SessionRegistry {
	#[must_use]
	pub fn new(adapter: Arc<dyn SessionStoreAdapter>) -> Arc<Self> {
		let scheduler = Scheduler::new();
		scheduler.start(Arc::clone(&adapter));
		Arc::new(Self { adapter, scheduler, timers: Mutex::new(HashMap::new()) })
	}

	/// Upsert the session row and reschedule its disconnect timer at
	/// `interval_secs * 2.5`, cancelling any prior one.
	#[allow(clippy::too_many_arguments)]
	pub async fn heartbeat(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		vector: Option<Vec<u8>>,
		seq: Option<Seq>,
		profile: Option<Value>,
		cursor: Option<Value>,
		interval_secs: u64,
	) -> BraidResult<()> {
		self.adapter
			.heartbeat(collection, document, client, vector, seq, profile, cursor, Timestamp::now())
			.await?;

		let key: TimerKey = (collection.into(), document.into(), client.into());
		let task = Arc::new(DisconnectTask {
			collection: key.0.clone(),
			document: key.1.clone(),
			client: key.2.clone(),
		});
		#[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss, clippy::cast_possible_truncation)]
		let delay_secs = (interval_secs as f64 * 2.5) as i64;
		let task_id = self.scheduler.task(task).schedule_after(delay_secs).schedule().await?;

		let previous = {
			let mut timers = lock!(self.timers, "session.timers")?;
			timers.insert(key, task_id)
		};
		if let Some(previous) = previous {
			self.scheduler.cancel(previous)?;
		}
		Ok(())
	}

	/// Mark the session disconnected and cancel its pending timer.
	pub async fn leave(&self, collection: &str, document: &str, client: &str) -> BraidResult<()> {
		self.adapter.mark_left(collection, document, client).await?;

		let key: TimerKey = (collection.into(), document.into(), client.into());
		let previous = {
			let mut timers = lock!(self.timers, "session.timers")?;
			timers.remove(&key)
		};
		if let Some(previous) = previous {
			self.scheduler.cancel(previous)?;
		}
		Ok(())
	}

	/// Matching rows for a document; grouped by user (latest `seen` wins)
	/// when `filter.group_by_user` is set.
	pub async fn sessions(
		&self,
		collection: &str,
		document: &str,
		filter: SessionFilter,
	) -> BraidResult<Vec<SessionRow>> {
		let rows = self.adapter.list(collection, document, filter).await?;
		if !filter.group_by_user {
			return Ok(rows);
		}

		let mut by_user: HashMap<ClientId, SessionRow> = HashMap::new();
		for row in rows {
			match by_user.get(&row.client) {
				Some(existing) if existing.seen.0 >= row.seen.0 => {}
				_ => {
					by_user.insert(row.client.clone(), row);
				}
			}
		}
		Ok(by_user.into_values().collect())
	}

	#[must_use]
	pub fn adapter(&self) -> &Arc<dyn SessionStoreAdapter> {
		&self.adapter
	}
}


// vim: ts=4
