//! App state type: the shared handle passed to every task, scheduled job,
//! and adapter call across the replication engine.

use std::sync::Arc;

use braid_types::adapters::{
	CompactionJobStoreAdapter, LogStoreAdapter, MainTableAdapter, SessionStoreAdapter,
};
use braid_types::prelude::*;
use braid_types::worker::WorkerPool;

use crate::extensions::Extensions;
use crate::scheduler::Scheduler;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tunables from the configuration options.
#[derive(Debug, Clone)]
pub struct Config {
	/// Delta count at which compaction is enqueued for a document.
	pub delta_threshold: u64,
	/// A session not heartbeat within this window is considered gone.
	pub peer_timeout_secs: u64,
	/// Client heartbeat cadence; disconnect timer fires at `2.5x` this.
	pub heartbeat_interval_secs: u64,
	pub sync_queue: SyncQueueConfig,
	pub prose: ProseConfig,
	pub anonymous_presence: AnonymousPresenceConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncQueueConfig {
	pub max_concurrent: usize,
	pub max_retries: u16,
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProseConfig {
	pub debounce_ms: u64,
	pub throttle_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AnonymousPresenceConfig {
	pub adjectives: Arc<[Box<str>]>,
	pub nouns: Arc<[Box<str>]>,
	pub colors: Arc<[Box<str>]>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			delta_threshold: 500,
			peer_timeout_secs: 24 * 3600,
			heartbeat_interval_secs: 10,
			sync_queue: SyncQueueConfig {
				max_concurrent: 5,
				max_retries: 3,
				base_delay_ms: 1000,
				max_delay_ms: 30_000,
			},
			prose: ProseConfig { debounce_ms: 50, throttle_ms: 50 },
			anonymous_presence: AnonymousPresenceConfig {
				adjectives: Arc::from([]),
				nouns: Arc::from([]),
				colors: Arc::from([]),
			},
		}
	}
}

pub struct Adapters {
	pub log_store: Arc<dyn LogStoreAdapter>,
	pub session_store: Arc<dyn SessionStoreAdapter>,
	pub compaction_store: Arc<dyn CompactionJobStoreAdapter>,
	pub main_table: Option<Arc<dyn MainTableAdapter>>,
}

pub struct AppState {
	pub scheduler: Arc<Scheduler<App>>,
	pub worker: Arc<WorkerPool>,
	pub config: Config,

	pub log_store: Arc<dyn LogStoreAdapter>,
	pub session_store: Arc<dyn SessionStoreAdapter>,
	pub compaction_store: Arc<dyn CompactionJobStoreAdapter>,
	pub main_table: Option<Arc<dyn MainTableAdapter>>,

	/// Type-erased extension map for feature-specific state (e.g. the
	/// codec/document registries layered on top by braid-document).
	pub extensions: Extensions,
}

impl AppState {
	/// Get a registered extension by type. Returns error if not found.
	pub fn ext<T: Send + Sync + 'static>(&self) -> BraidResult<&T> {
		self.extensions
			.get::<T>()
			.ok_or_else(|| Error::Internal(format!("extension {} not registered", std::any::type_name::<T>())))
	}
}

pub type App = Arc<AppState>;

/// Build an [`App`] from its adapters and configuration. The scheduler and
/// worker pool are constructed here; callers needing finer control over
/// worker-thread counts should use [`AppState`] directly.
pub fn build(adapters: Adapters, config: Config) -> App {
	Arc::new(AppState {
		scheduler: Scheduler::new(),
		worker: Arc::new(WorkerPool::new(2, 2, 2)),
		config,
		log_store: adapters.log_store,
		session_store: adapters.session_store,
		compaction_store: adapters.compaction_store,
		main_table: adapters.main_table,
		extensions: Extensions::new(),
	})
}

// vim: ts=4
