//! Storage contract for compaction job bookkeeping.

use async_trait::async_trait;

use crate::prelude::*;

pub type JobId = u64;

#[derive(Debug, Clone)]
pub struct CompactionJobRow {
	pub id: JobId,
	pub collection: CollectionId,
	pub document: DocumentId,
	pub status: CompactionStatus,
	pub started: Timestamp,
	pub completed: Option<Timestamp>,
	pub retries: u16,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
	Created(JobId),
	AlreadyPending,
	AlreadyRunning,
}

#[async_trait]
pub trait CompactionJobStoreAdapter: Send + Sync {
	/// Insert a `pending` row unless one is already `{pending, running}` for
	/// this document ( invariant: at most one such row at a time).
	async fn enqueue(&self, collection: &str, document: &str) -> BraidResult<EnqueueOutcome>;

	async fn start(&self, job: JobId) -> BraidResult<()>;
	async fn finish_done(&self, job: JobId) -> BraidResult<()>;
	async fn finish_failed(&self, job: JobId, error: &str) -> BraidResult<()>;
	/// `running -> pending` on a retriable failure; increments `retries`.
	async fn retry(&self, job: JobId, error: &str) -> BraidResult<()>;

	async fn get(&self, job: JobId) -> BraidResult<Option<CompactionJobRow>>;
	async fn active_for(
		&self,
		collection: &str,
		document: &str,
	) -> BraidResult<Option<CompactionJobRow>>;
}

/// In-memory reference implementation, used as a test fixture.
#[derive(Default)]
pub struct InMemoryCompactionJobStore {
	inner: std::sync::Mutex<InMemoryCompactionJobStoreInner>,
}

#[derive(Default)]
struct InMemoryCompactionJobStoreInner {
	next_id: JobId,
	jobs: std::collections::HashMap<JobId, CompactionJobRow>,
}

impl InMemoryCompactionJobStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl CompactionJobStoreAdapter for InMemoryCompactionJobStore {
	async fn enqueue(&self, collection: &str, document: &str) -> BraidResult<EnqueueOutcome> {
		let mut inner = lock!(self.inner, "compaction_store.inner")?;
		if let Some(existing) = inner
			.jobs
			.values()
			.find(|j| j.collection.as_ref() == collection && j.document.as_ref() == document
				&& matches!(j.status, CompactionStatus::Pending | CompactionStatus::Running))
		{
			return Ok(match existing.status {
				CompactionStatus::Running => EnqueueOutcome::AlreadyRunning,
				_ => EnqueueOutcome::AlreadyPending,
			});
		}
		inner.next_id += 1;
		let id = inner.next_id;
		inner.jobs.insert(
			id,
			CompactionJobRow {
				id,
				collection: collection.into(),
				document: document.into(),
				status: CompactionStatus::Pending,
				started: Timestamp::now(),
				completed: None,
				retries: 0,
				error: None,
			},
		);
		Ok(EnqueueOutcome::Created(id))
	}

	async fn start(&self, job: JobId) -> BraidResult<()> {
		let mut inner = lock!(self.inner, "compaction_store.inner")?;
		let row = inner.jobs.get_mut(&job).ok_or_else(|| Error::NotFound(format!("job {job}")))?;
		row.status = CompactionStatus::Running;
		row.started = Timestamp::now();
		Ok(())
	}

	async fn finish_done(&self, job: JobId) -> BraidResult<()> {
		let mut inner = lock!(self.inner, "compaction_store.inner")?;
		let row = inner.jobs.get_mut(&job).ok_or_else(|| Error::NotFound(format!("job {job}")))?;
		row.status = CompactionStatus::Done;
		row.completed = Some(Timestamp::now());
		Ok(())
	}

	async fn finish_failed(&self, job: JobId, error: &str) -> BraidResult<()> {
		let mut inner = lock!(self.inner, "compaction_store.inner")?;
		let row = inner.jobs.get_mut(&job).ok_or_else(|| Error::NotFound(format!("job {job}")))?;
		row.status = CompactionStatus::Failed;
		row.completed = Some(Timestamp::now());
		row.error = Some(error.to_string());
		Ok(())
	}

	async fn retry(&self, job: JobId, error: &str) -> BraidResult<()> {
		let mut inner = lock!(self.inner, "compaction_store.inner")?;
		let row = inner.jobs.get_mut(&job).ok_or_else(|| Error::NotFound(format!("job {job}")))?;
		row.status = CompactionStatus::Pending;
		row.retries += 1;
		row.error = Some(error.to_string());
		Ok(())
	}

	async fn get(&self, job: JobId) -> BraidResult<Option<CompactionJobRow>> {
		let inner = lock!(self.inner, "compaction_store.inner")?;
		Ok(inner.jobs.get(&job).cloned())
	}

	async fn active_for(&self, collection: &str, document: &str) -> BraidResult<Option<CompactionJobRow>> {
		let inner = lock!(self.inner, "compaction_store.inner")?;
		Ok(inner
			.jobs
			.values()
			.find(|j| {
				j.collection.as_ref() == collection
					&& j.document.as_ref() == document
					&& matches!(j.status, CompactionStatus::Pending | CompactionStatus::Running)
			})
			.cloned())
	}
}


// vim: ts=4
