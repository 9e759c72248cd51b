//! Compaction coordinator: merges a document's deltas into its
//! snapshot, decides whether it is safe to drop the merged deltas without
//! stranding a connected peer, and sweeps disconnected sessions that are
//! fully caught up.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;

use braid_core::scheduler::{RetryPolicy, Scheduler, Task};
use braid_log::LogStore;
use braid_types::adapters::compaction_store::{CompactionJobStoreAdapter, EnqueueOutcome, JobId};
use braid_types::adapters::log_store::SnapshotRow;
use braid_types::adapters::session_store::{SessionFilter, SessionStoreAdapter};
use braid_types::prelude::*;

#[derive(Debug)]
struct RunJobTask {
	job: JobId,
}

#[async_trait]
impl Task<Arc<Compactor>> for RunJobTask {
	async fn run(&self, ctx: &Arc<Compactor>) -> BraidResult<()> {
		ctx.run_job(self.job).await
	}
}

/// Runs the compaction algorithm and its scheduling/retry state
/// machine. Shares the log store's delta-threshold policy but owns its own
/// reference to the job bookkeeping adapter, the same instance given to
/// [`LogStore`] so `enqueue`'s at-most-one-active-job invariant holds across
/// both call paths.
pub struct Compactor {
	log: Arc<LogStore>,
	jobs: Arc<dyn CompactionJobStoreAdapter>,
	sessions: Arc<dyn SessionStoreAdapter>,
	scheduler: Arc<Scheduler<Arc<Compactor>>>,
}

impl Compactor {
	pub fn new(
		log: Arc<LogStore>,
		jobs: Arc<dyn CompactionJobStoreAdapter>,
		sessions: Arc<dyn SessionStoreAdapter>,
	) -> Arc<Self> {
		let scheduler = Scheduler::new();
		let this = Arc::new(Self { log, jobs, sessions, scheduler: Arc::clone(&scheduler) });
		scheduler.start(Arc::clone(&this));
		this
	}

	/// Insert a `pending` job for `(collection, document)` unless one is
	/// already `pending`/`running`, and schedule its first run. Duplicate
	/// calls are no-ops beyond reporting the existing state.
	pub async fn schedule(&self, collection: &str, document: &str) -> BraidResult<EnqueueOutcome> {
		let outcome = self.jobs.enqueue(collection, document).await?;
		if let EnqueueOutcome::Created(job) = outcome {
			self.spawn_run(job, 0).await?;
		}
		Ok(outcome)
	}

	async fn spawn_run(&self, job: JobId, delay_secs: i64) -> BraidResult<()> {
		self.scheduler.task(Arc::new(RunJobTask { job })).schedule_after(delay_secs).schedule().await?;
		Ok(())
	}

	/// `pending -> running -> done|failed`, with `running -> pending` retried
	/// at an exponential backoff up to `MAX_RETRIES`.
	async fn run_job(&self, job: JobId) -> BraidResult<()> {
		let row = self.jobs.get(job).await?.ok_or_else(|| Error::NotFound(format!("job {job}")))?;
		self.jobs.start(job).await?;

		match self.compact(&row.collection, &row.document).await {
			Ok(()) => self.jobs.finish_done(job).await,
			Err(e) => {
				let policy = RetryPolicy::default();
				if policy.should_retry(row.retries) {
					self.jobs.retry(job, &e.to_string()).await?;
					#[allow(clippy::cast_possible_wrap)]
					let delay = policy.calculate_backoff(row.retries) as i64;
					self.spawn_run(job, delay).await
				} else {
					self.jobs.finish_failed(job, &e.to_string()).await
				}
			}
		}
	}

	/// Run the compaction algorithm once, synchronously. Exposed directly
	/// for callers that want to compact without going through the job
	/// scheduler (e.g. tests, or a forced admin action).
	pub async fn compact(&self, collection: &str, document: &str) -> BraidResult<()> {
		// Step 1: boundary read, before any delta collection, to fix the
		// snapshot horizon against a concurrent append.
		let boundary_seq = self.log.current_seq(collection).await?;

		// Step 2.
		let deltas = self.log.document_deltas_upto(collection, document, boundary_seq).await?;
		if deltas.is_empty() {
			return Ok(());
		}

		// Step 3.
		let existing = self.log.get_snapshot(collection, document).await?;
		let mut updates: Vec<Vec<u8>> = Vec::with_capacity(deltas.len() + 1);
		if let Some(snapshot) = &existing {
			updates.push(snapshot.bytes.clone());
		}
		updates.extend(deltas.iter().map(|d| d.bytes.clone()));
		let merged = braid_codec::merge_updates(&updates)?;
		let vector = braid_codec::state_vector_of(&merged)?;

		// Step 4.
		let rows = self.sessions.list(collection, document, SessionFilter::default()).await?;
		let mut can_delete_all = true;
		for session in rows.iter().filter(|s| s.connected) {
			match &session.vector {
				None => {
					can_delete_all = false;
					break;
				}
				Some(v) => {
					let diff = braid_codec::diff(&merged, v)?;
					if !braid_codec::is_empty_diff(&diff) {
						can_delete_all = false;
					}
				}
			}
		}

		// Step 5.
		self.log
			.put_snapshot(
				collection,
				SnapshotRow {
					document: document.into(),
					bytes: merged.clone(),
					vector: vector.clone(),
					seq: boundary_seq,
					created_at: Timestamp::now(),
				},
			)
			.await?;

		// Step 6.
		if can_delete_all {
			let seqs: Vec<Seq> = deltas.iter().map(|d| d.seq).collect();
			self.log.delete_deltas(collection, document, &seqs).await?;
		}

		// Step 7: sweep disconnected sessions fully covered by `merged`.
		for session in rows.iter().filter(|s| !s.connected) {
			let covered = match &session.vector {
				None => true,
				Some(v) => {
					let diff = braid_codec::diff(&merged, v)?;
					braid_codec::is_empty_diff(&diff)
				}
			};
			if covered {
				self.sessions.delete(collection, document, &session.client).await?;
			}
		}

		Ok(())
	}
}


// vim: ts=4
