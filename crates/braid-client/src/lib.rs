//! Replication driver: client-side glue between the document store,
//! local persistence, the sync queue, and the server's stream/recovery
//! queries. Wired in-process against a [`LogStore`]/[`StreamService`]
//! pair; an embedder fronting those with a wire transport (e.g.
//! `braid-gateway`) swaps them for a remote-calling equivalent without this
//! crate needing to change.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map as JsonMap, Value as Json};
use yrs::{DeepObservable, Subscription, XmlFragmentRef};

use braid_core::app::{ProseConfig, SyncQueueConfig};
use braid_document::DocumentStore;
use braid_log::LogStore;
use braid_queue::{QueueTask, SyncQueue};
use braid_session::SessionRegistry;
use braid_stream::StreamService;
use braid_types::adapters::local_store::LocalPersistenceAdapter;
use braid_types::adapters::main_table::MainTableAdapter;
use braid_types::prelude::*;

const CURSOR_PREFIX: &str = "cursor:";

/// Tunables specific to the replication driver: how many changes to
/// request per `stream` call, the compaction-hint threshold to pass through,
/// and the heartbeat cadence used for presence marks.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationConfig {
	pub limit: usize,
	pub delta_threshold: u64,
	pub heartbeat_interval_secs: u64,
	pub prose: ProseConfig,
}

impl Default for ReplicationConfig {
	fn default() -> Self {
		Self {
			limit: 200,
			delta_threshold: 500,
			heartbeat_interval_secs: 10,
			prose: ProseConfig { debounce_ms: 50, throttle_ms: 50 },
		}
	}
}

/// Debounce bookkeeping for one rich-text field bound to a CRDT fragment.
/// `generation` is bumped on every local edit and on every server
/// update for the owning document; a debounced sync task compares its
/// captured generation against the current one before firing, so both
/// coalescing (a newer local edit supersedes an older pending one) and
/// cancellation (a server update invalidates the whole debounce buffer) fall
/// out of the same counter.
#[derive(Debug, Default)]
struct FragmentState {
	generation: u64,
	synced_vector: Option<Vec<u8>>,
}

/// Per-collection replication driver. Owns the document store, local
/// persistence handle, and sync queue as shared resources, all mutated only
/// via its public operations.
pub struct ReplicationDriver {
	collection: CollectionId,
	client_id: ClientId,
	store: Arc<DocumentStore>,
	local: Arc<dyn LocalPersistenceAdapter>,
	log: Arc<LogStore>,
	stream: Arc<StreamService>,
	sessions: Option<Arc<SessionRegistry>>,
	main_table: Option<Arc<dyn MainTableAdapter>>,
	queue: Arc<SyncQueue>,
	config: ReplicationConfig,
	cursor: Mutex<Seq>,
	last_applied: Mutex<HashMap<DocumentId, Seq>>,
	dirty: Mutex<HashSet<DocumentId>>,
	fragment_state: Mutex<HashMap<(DocumentId, Box<str>), FragmentState>>,
	fragment_subscriptions: Mutex<HashMap<(DocumentId, Box<str>), Subscription>>,
}

impl ReplicationDriver {
	#[allow(clippy::too_many_arguments)]
	#[must_use]
	pub fn new(
		collection: impl Into<CollectionId>,
		client_id: impl Into<ClientId>,
		store: Arc<DocumentStore>,
		local: Arc<dyn LocalPersistenceAdapter>,
		log: Arc<LogStore>,
		stream: Arc<StreamService>,
		sessions: Option<Arc<SessionRegistry>>,
		main_table: Option<Arc<dyn MainTableAdapter>>,
		sync_queue_config: SyncQueueConfig,
		config: ReplicationConfig,
	) -> Arc<Self> {
		Arc::new(Self {
			collection: collection.into(),
			client_id: client_id.into(),
			store,
			local,
			log,
			stream,
			sessions,
			main_table,
			queue: SyncQueue::new(sync_queue_config),
			config,
			cursor: Mutex::new(Seq::ZERO),
			last_applied: Mutex::new(HashMap::new()),
			dirty: Mutex::new(HashSet::new()),
			fragment_state: Mutex::new(HashMap::new()),
			fragment_subscriptions: Mutex::new(HashMap::new()),
		})
	}

	#[must_use]
	pub fn collection(&self) -> &str {
		&self.collection
	}

	#[must_use]
	pub fn documents(&self) -> Arc<DocumentStore> {
		Arc::clone(&self.store)
	}

	#[must_use]
	pub fn queue(&self) -> &Arc<SyncQueue> {
		&self.queue
	}

	fn cursor_key(&self) -> String {
		format!("{CURSOR_PREFIX}{}", self.collection)
	}

	async fn persist_cursor(&self, seq: Seq) -> BraidResult<()> {
		self.local.set(&self.cursor_key(), &seq.0.to_le_bytes()).await
	}

	async fn load_cursor(&self) -> BraidResult<Seq> {
		match self.local.get(&self.cursor_key()).await? {
			Some(bytes) if bytes.len() == 8 => {
				let mut buf = [0u8; 8];
				buf.copy_from_slice(&bytes);
				Ok(Seq(u64::from_le_bytes(buf)))
			}
			_ => Ok(Seq::ZERO),
		}
	}

	#[must_use]
	pub fn cursor(&self) -> Seq {
		lock!(self.cursor).map(|g| *g).unwrap_or(Seq::ZERO)
	}

	fn set_cursor(&self, seq: Seq) {
		if let Ok(mut guard) = lock!(self.cursor) {
			*guard = seq;
		}
	}

	fn last_applied_seq(&self, document: &str) -> Seq {
		lock!(self.last_applied).ok().and_then(|g| g.get(document).copied()).unwrap_or(Seq::ZERO)
	}

	fn set_last_applied_seq(&self, document: &str, seq: Seq) {
		if let Ok(mut guard) = lock!(self.last_applied) {
			guard.insert(document.into(), seq);
		}
	}

	fn mark_dirty(&self, document: &str) {
		if let Ok(mut guard) = lock!(self.dirty) {
			guard.insert(document.into());
		}
	}

	fn clear_dirty(&self, document: &str) {
		if let Ok(mut guard) = lock!(self.dirty) {
			guard.remove(document);
		}
	}

	fn is_dirty(&self, document: &str) -> bool {
		lock!(self.dirty).map(|g| g.contains(document)).unwrap_or(false)
	}

	/// Reconstruct documents from local persistence, apply
	/// any materialized initial state, recover every document against the
	/// server without pushing local-only state, and reflect the result into
	/// the main table.
	pub async fn start(self: &Arc<Self>, initial_state: &[(DocumentId, Vec<u8>)]) -> BraidResult<()> {
		for document in self.local.list_doc_ids(&self.collection).await? {
			if let Some(bytes) = self.local.get_doc_state(&self.collection, &document).await? {
				self.store.apply_update(&document, &bytes, Origin::Local)?;
			}
		}

		let cursor = self.load_cursor().await?;
		self.set_cursor(cursor);

		for (document, bytes) in initial_state {
			self.store.apply_update(document, bytes, Origin::Server)?;
		}

		for document in self.store.documents() {
			self.recover_document(&document, false).await?;
		}

		for document in self.store.documents() {
			self.reflect_to_main_table(&document).await?;
		}

		Ok(())
	}

	/// Recovery handshake: fetch the server diff against this document's known
	/// vector and apply it. With `push_local`, also re-push the document's
	/// full local state (used on reconnect).
	pub async fn recover_document(self: &Arc<Self>, document: &str, push_local: bool) -> BraidResult<()> {
		let vector = self.store.encode_state_vector(document)?;
		let result = self.stream.recovery(&self.collection, document, &vector).await?;
		if let Some(diff) = result.diff {
			self.store.apply_update(document, &diff, Origin::Server)?;
			self.reflect_to_main_table(document).await?;
			self.cancel_fragment_sync(document);
		}
		if push_local {
			let Some(handle) = self.store.get(document) else { return Ok(()) };
			let bytes = braid_codec::encode_update(handle.doc());
			self.enqueue_push(document, DeltaType::Update, bytes);
		}
		Ok(())
	}

	/// Pull one batch: deltas/snapshots past the current
	/// cursor, apply them, persist the advanced cursor, and fire off
	/// presence marks for every touched document. Returns the number of
	/// changes applied; `0` means caught up.
	pub async fn pull_batch(self: &Arc<Self>) -> BraidResult<usize> {
		let cursor = self.cursor();
		let result = self.stream.stream(&self.collection, cursor, self.config.limit, self.config.delta_threshold).await?;
		if result.changes.is_empty() {
			return Ok(0);
		}

		let mut touched = Vec::with_capacity(result.changes.len());
		for change in &result.changes {
			if change.exists == Some(false) {
				if self.store.get(&change.document).is_some() {
					self.store.delete(&change.document);
					self.local.delete_doc_state(&self.collection, &change.document).await?;
					if let Some(table) = &self.main_table {
						table.delete(&self.collection, &change.document).await?;
					}
				}
				// Absent locally and gone upstream: nothing to reconcile.
			} else {
				self.store.apply_update(&change.document, &change.bytes, Origin::Server)?;
				self.reconcile_after_merge(&change.document, change.seq).await?;
			}
			self.cancel_fragment_sync(&change.document);
			touched.push(change.document.clone());
		}

		self.set_cursor(result.seq);
		self.persist_cursor(result.seq).await?;

		for document in touched {
			self.mark_presence(&document);
		}

		Ok(result.changes.len())
	}

	/// Drain `pull_batch` until the collection reports caught up.
	pub async fn sync(self: &Arc<Self>) -> BraidResult<()> {
		loop {
			if self.pull_batch().await? == 0 {
				return Ok(());
			}
		}
	}

	/// Delete-vs-update conflict resolution: after merging a
	/// server-origin update, a document whose CRDT state now reads
	/// `_deleted` is dropped only if the incoming seq is newer than the
	/// last seq this client applied to it. Otherwise the local write is
	/// treated as authoritative for now; the CRDT merge will resurrect the
	/// document once this client's own state is pushed again.
	async fn reconcile_after_merge(&self, document: &str, incoming_seq: Seq) -> BraidResult<()> {
		let Some(handle) = self.store.get(document) else { return Ok(()) };

		if handle.is_deleted() && incoming_seq > self.last_applied_seq(document) {
			self.store.delete(document);
			self.local.delete_doc_state(&self.collection, document).await?;
			if let Some(table) = &self.main_table {
				table.delete(&self.collection, document).await?;
			}
		} else {
			self.local.set_doc_state(&self.collection, document, &braid_codec::encode_update(handle.doc())).await?;
			if let Some(table) = &self.main_table {
				table.upsert(&self.collection, document, handle.serialize(), Timestamp::now()).await?;
			}
			if handle.is_deleted() {
				// Local writes outrank this delete; re-assert them.
				self.mark_dirty(document);
			}
		}

		self.set_last_applied_seq(document, incoming_seq);
		Ok(())
	}

	async fn reflect_to_main_table(&self, document: &str) -> BraidResult<()> {
		let Some(handle) = self.store.get(document) else { return Ok(()) };
		let Some(table) = &self.main_table else { return Ok(()) };
		if handle.is_deleted() && !self.is_dirty(document) {
			table.delete(&self.collection, document).await?;
		} else {
			table.upsert(&self.collection, document, handle.serialize(), Timestamp::now()).await?;
		}
		Ok(())
	}

	fn mark_presence(self: &Arc<Self>, document: &str) {
		let Some(sessions) = self.sessions.clone() else { return };
		let vector = self.store.encode_state_vector(document).ok();
		let collection = self.collection.clone();
		let document: DocumentId = document.into();
		let client_id = self.client_id.clone();
		let interval = self.config.heartbeat_interval_secs;
		tokio::spawn(async move {
			if let Err(e) = sessions.heartbeat(&collection, &document, &client_id, vector, None, None, None, interval).await {
				warn!(%document, "presence mark failed: {e}");
			}
		});
	}

	/// Local insert: writes `_created=true` plus
	/// every field, then pushes the resulting delta.
	pub async fn insert(self: &Arc<Self>, document: &str, fields: &JsonMap<String, Json>) -> BraidResult<()> {
		self.store.get_or_create(document);
		let delta = self.store.transact_with_delta(document, Origin::Local, |txn, handle| {
			handle.mark_created(txn);
			for (key, value) in fields {
				handle.set_field(txn, key, value);
			}
		})?;
		self.after_local_edit(document, DeltaType::Insert, delta).await
	}

	/// Local update: writes each given field (fragment fields are expected
	/// to be synced independently via the prose binding, not through here).
	pub async fn update(self: &Arc<Self>, document: &str, fields: &JsonMap<String, Json>) -> BraidResult<()> {
		let delta = self.store.transact_with_delta(document, Origin::Local, |txn, handle| {
			for (key, value) in fields {
				handle.set_field(txn, key, value);
			}
		})?;
		self.after_local_edit(document, DeltaType::Update, delta).await
	}

	/// Local delete: records the `_deleted` marker inside the CRDT document
	/// rather than removing it outright, so a concurrent remote update
	/// still merges causally.
	pub async fn delete(self: &Arc<Self>, document: &str) -> BraidResult<()> {
		let delta = self.store.transact_with_delta(document, Origin::Local, |txn, handle| {
			handle.mark_deleted(txn);
		})?;
		self.after_local_edit(document, DeltaType::Delete, delta).await
	}

	async fn after_local_edit(self: &Arc<Self>, document: &str, delta_type: DeltaType, delta: Vec<u8>) -> BraidResult<()> {
		let handle = self.store.get(document).ok_or_else(|| Error::NotFound(format!("document {document}")))?;
		self.local.set_doc_state(&self.collection, document, &braid_codec::encode_update(handle.doc())).await?;

		if let Some(table) = &self.main_table {
			if delta_type == DeltaType::Delete {
				table.delete(&self.collection, document).await?;
			} else {
				table.upsert(&self.collection, document, handle.serialize(), Timestamp::now()).await?;
			}
		}

		self.mark_dirty(document);
		self.enqueue_push(document, delta_type, delta);
		Ok(())
	}

	fn enqueue_push(self: &Arc<Self>, document: &str, delta_type: DeltaType, bytes: Vec<u8>) {
		let driver = Arc::clone(self);
		let document_id: DocumentId = document.into();
		let task_document = document_id.clone();
		let bytes: Arc<[u8]> = Arc::from(bytes);
		let task: QueueTask = Arc::new(move || {
			let driver = Arc::clone(&driver);
			let document = task_document.clone();
			let bytes = Arc::clone(&bytes);
			Box::pin(async move { driver.push(&document, delta_type, &bytes).await })
		});
		self.queue.enqueue(&document_id, task);
	}

	async fn push(self: &Arc<Self>, document: &str, delta_type: DeltaType, bytes: &[u8]) -> BraidResult<()> {
		self.log.append_delta(&self.collection, document, bytes, delta_type).await?;
		self.clear_dirty(document);
		self.mark_presence(document);
		Ok(())
	}

	/// Opt a rich-text field into the prose binding: returns the fragment handle the editor mutates
	/// directly, and wires a deep observer that schedules a debounced sync
	/// task on every local edit. The subscription is held for the lifetime
	/// of the driver.
	pub fn bind_fragment(self: &Arc<Self>, document: &str, field: &str) -> XmlFragmentRef {
		let handle = self.store.get_or_create(document);
		let fragment = handle.fragment(field);

		let driver = Arc::clone(self);
		let doc_id: DocumentId = document.into();
		let field_name: Box<str> = field.into();
		let subscription = fragment.observe_deep(move |_txn, _events| {
			driver.schedule_fragment_sync(&doc_id, &field_name);
		});

		if let Ok(mut subs) = lock!(self.fragment_subscriptions) {
			subs.insert((document.into(), field.into()), subscription);
		}

		fragment
	}

	/// Debounce a fragment edit: bump the field's generation and, after
	/// `prose.debounce_ms`, fire the sync unless a newer edit or a server
	/// update has bumped the generation again in the meantime.
	fn schedule_fragment_sync(self: &Arc<Self>, document: &DocumentId, field: &str) {
		let key = (document.clone(), Box::<str>::from(field));
		let generation = {
			let Ok(mut state) = lock!(self.fragment_state) else { return };
			let entry = state.entry(key.clone()).or_default();
			entry.generation += 1;
			entry.generation
		};

		let driver = Arc::clone(self);
		let debounce = Duration::from_millis(self.config.prose.debounce_ms);
		tokio::spawn(async move {
			tokio::time::sleep(debounce).await;
			driver.fire_fragment_sync(&key.0, &key.1, generation).await;
		});
	}

	/// Encode the CRDT state since the field's last synced vector,
	/// materialize the document, and push both through the usual local-edit
	/// path. A stale `generation` (superseded by a newer edit or cancelled by
	/// a server update) makes this a no-op.
	async fn fire_fragment_sync(self: &Arc<Self>, document: &str, field: &str, generation: u64) {
		let key = (DocumentId::from(document), Box::<str>::from(field));
		let since = {
			let Ok(state) = lock!(self.fragment_state) else { return };
			match state.get(&key) {
				Some(entry) if entry.generation == generation => entry.synced_vector.clone(),
				_ => return,
			}
		};

		let Some(handle) = self.store.get(document) else { return };
		let delta = match since {
			Some(vector) => braid_codec::encode_update_since(handle.doc(), &vector),
			None => Ok(braid_codec::encode_update(handle.doc())),
		};
		let delta = match delta {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(document, field, "fragment sync encode failed: {e}");
				return;
			}
		};

		if let Ok(mut state) = lock!(self.fragment_state) {
			if let Some(entry) = state.get_mut(&key) {
				entry.synced_vector = Some(braid_codec::encode_state_vector(handle.doc()));
			}
		}

		if let Err(e) = self.after_local_edit(document, DeltaType::Update, delta).await {
			warn!(document, field, "fragment sync push failed: {e}");
		}
	}

	/// Invalidate any in-flight debounce for every rich-text field of
	/// `document`: a server update carries newer truth than whatever the
	/// local debounce buffer was about to push.
	fn cancel_fragment_sync(&self, document: &str) {
		let Ok(mut state) = lock!(self.fragment_state) else { return };
		for (key, entry) in state.iter_mut() {
			if key.0.as_ref() == document {
				entry.generation += 1;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use braid_document::DocumentStore;
	use braid_types::adapters::compaction_store::InMemoryCompactionJobStore;
	use braid_types::adapters::local_store::InMemoryLocalStore;
	use braid_types::adapters::log_store::InMemoryLogStore;

	fn queue_config() -> SyncQueueConfig {
		SyncQueueConfig { max_concurrent: 5, max_retries: 3, base_delay_ms: 10, max_delay_ms: 100 }
	}

	fn driver() -> (Arc<ReplicationDriver>, Arc<LogStore>) {
		let log = Arc::new(LogStore::new(
			Arc::new(InMemoryLogStore::new()),
			Arc::new(InMemoryCompactionJobStore::new()),
			500,
		));
		let stream = Arc::new(StreamService::new(Arc::clone(&log), None));
		let store = Arc::new(DocumentStore::new("docs"));
		let local = Arc::new(InMemoryLocalStore::new());
		let driver = ReplicationDriver::new(
			"docs",
			"client-a",
			store,
			local,
			Arc::clone(&log),
			stream,
			None,
			None,
			queue_config(),
			ReplicationConfig::default(),
		);
		(driver, log)
	}

	fn fields(pairs: &[(&str, &str)]) -> JsonMap<String, Json> {
		pairs.iter().map(|(k, v)| (k.to_string(), Json::String((*v).to_string()))).collect()
	}

	#[tokio::test]
	async fn local_insert_pushes_a_delta_into_the_log() {
		let (driver, log) = driver();
		driver.insert("a", &fields(&[("title", "hello")])).await.unwrap();
		driver.queue().flush().await;

		let deltas = log.deltas_since("docs", Seq::ZERO, 10).await.unwrap();
		assert_eq!(deltas.len(), 1);
		assert_eq!(deltas[0].delta_type, DeltaType::Insert);
	}

	#[tokio::test]
	async fn pull_batch_applies_a_remote_delta_and_advances_cursor() {
		let (driver, log) = driver();
		let other = Arc::new(DocumentStore::new("docs"));
		other.get_or_create("a");
		let delta = other
			.transact_with_delta("a", Origin::Local, |txn, handle| {
				handle.mark_created(txn);
				handle.set_field(txn, "title", &Json::String("remote".into()));
			})
			.unwrap();
		log.append_delta("docs", "a", &delta, DeltaType::Insert).await.unwrap();

		let applied = driver.pull_batch().await.unwrap();
		assert_eq!(applied, 1);
		assert_eq!(driver.cursor(), Seq(1));

		let handle = driver.documents().get("a").unwrap();
		assert_eq!(handle.get_field("title"), Some(Json::String("remote".into())));
	}

	#[tokio::test]
	async fn remote_delete_newer_than_local_seq_drops_the_document() {
		let (driver, log) = driver();
		driver.insert("a", &fields(&[("title", "mine")])).await.unwrap();
		driver.queue().flush().await;

		let other = Arc::new(DocumentStore::new("docs"));
		other.apply_update("a", &braid_codec::encode_update(driver.documents().get("a").unwrap().doc()), Origin::Server).unwrap();
		let delta = other.transact_with_delta("a", Origin::Local, |txn, handle| handle.mark_deleted(txn)).unwrap();
		log.append_delta("docs", "a", &delta, DeltaType::Delete).await.unwrap();

		driver.pull_batch().await.unwrap();
		assert!(driver.documents().get("a").is_none());
	}

	#[tokio::test]
	async fn start_reconstructs_documents_from_local_persistence() {
		let log = Arc::new(LogStore::new(
			Arc::new(InMemoryLogStore::new()),
			Arc::new(InMemoryCompactionJobStore::new()),
			500,
		));
		let stream = Arc::new(StreamService::new(Arc::clone(&log), None));
		let local = Arc::new(InMemoryLocalStore::new());

		let seed = DocumentStore::new("docs");
		seed.get_or_create("a");
		seed.transact_with_delta("a", Origin::Local, |txn, handle| {
			handle.mark_created(txn);
			handle.set_field(txn, "title", &Json::String("persisted".into()));
		})
		.unwrap();
		let bytes = braid_codec::encode_update(seed.get("a").unwrap().doc());
		local.set_doc_state("docs", "a", &bytes).await.unwrap();

		let store = Arc::new(DocumentStore::new("docs"));
		let driver = ReplicationDriver::new(
			"docs",
			"client-a",
			store,
			local,
			log,
			stream,
			None,
			None,
			queue_config(),
			ReplicationConfig::default(),
		);
		driver.start(&[]).await.unwrap();

		let handle = driver.documents().get("a").unwrap();
		assert_eq!(handle.get_field("title"), Some(Json::String("persisted".into())));
	}

	#[tokio::test]
	async fn fragment_edit_debounces_then_pushes_an_update_delta() {
		let (driver, log) = driver();
		driver.documents().get_or_create("a");
		let _fragment = driver.bind_fragment("a", "body");

		let doc_id: DocumentId = "a".into();
		driver.schedule_fragment_sync(&doc_id, "body");
		tokio::time::sleep(Duration::from_millis(120)).await;
		driver.queue().flush().await;

		let deltas = log.deltas_since("docs", Seq::ZERO, 10).await.unwrap();
		assert_eq!(deltas.len(), 1);
		assert_eq!(deltas[0].delta_type, DeltaType::Update);
	}

	#[tokio::test]
	async fn server_update_cancels_a_pending_fragment_sync() {
		let (driver, log) = driver();
		driver.documents().get_or_create("a");
		let _fragment = driver.bind_fragment("a", "body");

		let doc_id: DocumentId = "a".into();
		driver.schedule_fragment_sync(&doc_id, "body");
		driver.cancel_fragment_sync("a");
		tokio::time::sleep(Duration::from_millis(120)).await;
		driver.queue().flush().await;

		let deltas = log.deltas_since("docs", Seq::ZERO, 10).await.unwrap();
		assert!(deltas.is_empty());
	}
}

// vim: ts=4
