//! Client-side sync queue: one coalescing slot per document, bounded
//! concurrency across the whole queue, and exponential backoff with jitter
//! on failure.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;

use braid_core::app::SyncQueueConfig;
use braid_core::scheduler::{Scheduler, Task, TaskId};
use braid_types::prelude::*;

/// A unit of work pushed onto the queue. `Fn`, not `FnOnce`, so a failed
/// attempt can be re-invoked on retry without the caller re-enqueuing.
pub type QueueTask = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = BraidResult<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
	None,
	Pending,
	Running,
	Completed,
	Failed,
}

type PendingObserver = Box<dyn Fn(TaskState) + Send + Sync>;
type QueueObserver = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Entry {
	running: Option<QueueTask>,
	/// Coalesced work ready to drain immediately.
	pending: Option<QueueTask>,
	/// The task that just failed, waiting out its backoff timer. Kept apart
	/// from `pending` so `drain` doesn't pick it up before the timer fires.
	retrying: Option<QueueTask>,
	retry_count: u16,
	retry_timer: Option<TaskId>,
	cancelled: bool,
	terminal: TaskState,
}

impl Entry {
	fn is_active(&self) -> bool {
		self.running.is_some() || self.pending.is_some() || self.retrying.is_some()
	}

	fn state(&self) -> TaskState {
		if self.running.is_some() {
			TaskState::Running
		} else if self.pending.is_some() || self.retrying.is_some() {
			TaskState::Pending
		} else {
			self.terminal
		}
	}
}

#[derive(Default)]
struct Inner {
	entries: HashMap<DocumentId, Entry>,
	running_count: usize,
	pending_observers: HashMap<DocumentId, Vec<PendingObserver>>,
	queue_observers: Vec<QueueObserver>,
	destroyed: bool,
}

impl Inner {
	fn active_count(&self) -> usize {
		self.entries.values().filter(|e| e.is_active()).count()
	}
}

#[derive(Debug)]
struct RetryTask {
	document: DocumentId,
}

#[async_trait]
impl Task<Arc<SyncQueue>> for RetryTask {
	async fn run(&self, queue: &Arc<SyncQueue>) -> BraidResult<()> {
		queue.fire_retry(&self.document);
		Ok(())
	}
}

/// Per-collection coalescing task queue. One [`SyncQueue`] per
/// collection; documents are independent lanes sharing the same
/// `max_concurrent` budget.
pub struct SyncQueue {
	config: SyncQueueConfig,
	inner: Mutex<Inner>,
	scheduler: Arc<Scheduler<Arc<SyncQueue>>>,
	notify: Notify,
}

impl SyncQueue {
	#[must_use]
	pub fn new(config: SyncQueueConfig) -> Arc<Self> {
		let scheduler = Scheduler::new();
		let this = Arc::new(Self { config, inner: Mutex::new(Inner::default()), scheduler: Arc::clone(&scheduler), notify: Notify::new() });
		scheduler.start(Arc::clone(&this));
		this
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
		match self.inner.lock() {
			Ok(guard) => guard,
			Err(poisoned) => {
				error!("mutex poisoned: sync_queue.inner (recovering)");
				poisoned.into_inner()
			}
		}
	}

	/// Push work for `document`. A task not yet started (pending, or
	/// waiting out a retry backoff) is replaced outright; a running task is
	/// left alone and this supersedes whatever was queued behind it.
	pub fn enqueue(self: &Arc<Self>, document: &str, task: QueueTask) {
		let timer_to_cancel = {
			let mut inner = self.lock();
			if inner.destroyed {
				return;
			}
			let entry = inner.entries.entry(document.into()).or_default();
			entry.cancelled = false;
			entry.retry_count = 0;
			entry.retrying = None;
			entry.pending = Some(task);
			entry.retry_timer.take()
		};
		if let Some(timer) = timer_to_cancel {
			let _ = self.scheduler.cancel(timer);
		}
		self.notify_pending(document);
		self.notify_queue();
		self.drain();
	}

	/// Drop a pending task (fresh or retry-waiting) and its timer. A
	/// running task cannot be cancelled; it is marked so its eventual
	/// completion is discarded rather than reported.
	pub fn cancel(&self, document: &str) {
		let timer = {
			let mut inner = self.lock();
			let Some(entry) = inner.entries.get_mut(document) else { return };
			entry.pending = None;
			entry.retrying = None;
			entry.retry_count = 0;
			let timer = entry.retry_timer.take();
			if entry.running.is_some() {
				entry.cancelled = true;
			} else {
				inner.entries.remove(document);
			}
			timer
		};
		if let Some(timer) = timer {
			let _ = self.scheduler.cancel(timer);
		}
		self.notify_pending(document);
		self.notify_queue();
	}

	#[must_use]
	pub fn has_pending(&self, document: &str) -> bool {
		self.lock().entries.get(document).is_some_and(|e| matches!(e.state(), TaskState::Pending))
	}

	#[must_use]
	pub fn task_state(&self, document: &str) -> TaskState {
		self.lock().entries.get(document).map_or(TaskState::None, Entry::state)
	}

	pub fn on_pending_change(&self, document: &str, callback: PendingObserver) {
		self.lock().pending_observers.entry(document.into()).or_default().push(callback);
	}

	pub fn on_queue_change(&self, callback: QueueObserver) {
		self.lock().queue_observers.push(callback);
	}

	/// Resolves once no document has running, pending, or retry-waiting
	/// work. Polling helper intended for tests.
	pub async fn flush(&self) {
		loop {
			{
				let inner = self.lock();
				if inner.destroyed || inner.active_count() == 0 {
					return;
				}
			}
			self.notify.notified().await;
		}
	}

	/// Cancel every timer and drop all queue state. Already-running tasks
	/// are allowed to finish; their results are discarded.
	pub fn destroy(&self) {
		let timers: Vec<TaskId> = {
			let mut inner = self.lock();
			inner.destroyed = true;
			let timers = inner.entries.values_mut().filter_map(|e| e.retry_timer.take()).collect();
			inner.entries.clear();
			inner.pending_observers.clear();
			inner.queue_observers.clear();
			timers
		};
		for timer in timers {
			let _ = self.scheduler.cancel(timer);
		}
		self.notify.notify_waiters();
	}

	fn notify_pending(&self, document: &str) {
		let state = self.task_state(document);
		let inner = self.lock();
		if let Some(observers) = inner.pending_observers.get(document) {
			for cb in observers {
				cb(state);
			}
		}
	}

	fn notify_queue(&self) {
		let inner = self.lock();
		let active = inner.active_count();
		for cb in &inner.queue_observers {
			cb(active);
		}
		drop(inner);
		self.notify.notify_waiters();
	}

	fn fire_retry(self: &Arc<Self>, document: &DocumentId) {
		{
			let mut inner = self.lock();
			if inner.destroyed {
				return;
			}
			if let Some(entry) = inner.entries.get_mut(document.as_ref()) {
				entry.retry_timer = None;
				if let Some(task) = entry.retrying.take() {
					entry.pending = Some(task);
				}
			}
		}
		self.notify_pending(document);
		self.drain();
	}

	fn drain(self: &Arc<Self>) {
		loop {
			let (document, task) = {
				let mut inner = self.lock();
				if inner.destroyed || inner.running_count >= self.config.max_concurrent {
					return;
				}
				let Some((document, entry)) =
					inner.entries.iter_mut().find(|(_, e)| e.running.is_none() && e.pending.is_some())
				else {
					return;
				};
				let document = document.clone();
				#[allow(clippy::unwrap_used)]
				let task = entry.pending.take().unwrap();
				entry.running = Some(Arc::clone(&task));
				inner.running_count += 1;
				(document, task)
			};
			self.notify_pending(&document);
			self.notify_queue();
			self.spawn(document, task);
		}
	}

	fn spawn(self: &Arc<Self>, document: DocumentId, task: QueueTask) {
		let this = Arc::clone(self);
		tokio::spawn(async move {
			let result = task().await;
			this.on_task_finished(document, result).await;
		});
	}

	async fn on_task_finished(self: &Arc<Self>, document: DocumentId, result: BraidResult<()>) {
		enum Outcome {
			None,
			Retry { task: QueueTask, delay_secs: i64 },
		}

		let outcome = {
			let mut inner = self.lock();
			if inner.destroyed {
				return;
			}
			inner.running_count = inner.running_count.saturating_sub(1);
			let Some(entry) = inner.entries.get_mut(document.as_ref()) else { return };
			let task = entry.running.take();

			if entry.cancelled {
				inner.entries.remove(document.as_ref());
				Outcome::None
			} else if entry.pending.is_some() {
				// Newer work coalesced in while this attempt was running;
				// it supersedes whatever the outcome was.
				entry.retry_count = 0;
				Outcome::None
			} else {
				match result {
					Ok(()) => {
						entry.terminal = TaskState::Completed;
						Outcome::None
					}
					Err(e) => {
						if entry.retry_count < self.config.max_retries {
							entry.retry_count += 1;
							let delay_ms = self.backoff_ms(entry.retry_count);
							warn!(document = %document, "sync task failed ({e}), retrying in {delay_ms}ms");
							#[allow(clippy::cast_possible_wrap)]
							let delay_secs = (delay_ms / 1000).max(1) as i64;
							if let Some(task) = task {
								entry.retrying = Some(Arc::clone(&task));
								Outcome::Retry { task, delay_secs }
							} else {
								Outcome::None
							}
						} else {
							error!(document = %document, "sync task failed terminally after retries: {e}");
							entry.terminal = TaskState::Failed;
							Outcome::None
						}
					}
				}
			}
		};

		if let Outcome::Retry { delay_secs, .. } = outcome {
			self.schedule_retry(&document, delay_secs).await;
		}
		self.notify_pending(&document);
		self.notify_queue();
		self.drain();
	}

	async fn schedule_retry(self: &Arc<Self>, document: &DocumentId, delay_secs: i64) {
		let task = Arc::new(RetryTask { document: document.clone() });
		match self.scheduler.task(task).schedule_after(delay_secs).schedule().await {
			Ok(timer_id) => {
				let mut inner = self.lock();
				if let Some(entry) = inner.entries.get_mut(document.as_ref()) {
					entry.retry_timer = Some(timer_id);
				}
			}
			Err(e) => {
				error!(document = %document, "failed to schedule retry timer: {e}");
				// Fall back to running it immediately rather than stranding
				// the task in `retrying` forever.
				self.fire_retry(document);
			}
		}
	}

	fn backoff_ms(&self, retry_count: u16) -> u64 {
		let base = self.config.base_delay_ms;
		let max = self.config.max_delay_ms;
		let exp = base.saturating_mul(1u64 << u64::from(retry_count.min(32)));
		let capped = exp.min(max);
		let jitter = rand::rng().random_range(0.8..=1.2);
		#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
		let jittered = (capped as f64 * jitter) as u64;
		jittered.min(max)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	fn config() -> SyncQueueConfig {
		SyncQueueConfig { max_concurrent: 5, max_retries: 3, base_delay_ms: 10, max_delay_ms: 100 }
	}

	fn counting_task(counter: Arc<AtomicUsize>) -> QueueTask {
		Arc::new(move || {
			let counter = Arc::clone(&counter);
			Box::pin(async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(())
			})
		})
	}

	fn failing_task(counter: Arc<AtomicUsize>) -> QueueTask {
		Arc::new(move || {
			let counter = Arc::clone(&counter);
			Box::pin(async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Err(Error::Internal("boom".into()))
			})
		})
	}

	#[tokio::test]
	async fn enqueued_task_runs_and_reports_completed() {
		let queue = SyncQueue::new(config());
		let counter = Arc::new(AtomicUsize::new(0));
		queue.enqueue("doc-a", counting_task(Arc::clone(&counter)));
		queue.flush().await;
		assert_eq!(counter.load(Ordering::SeqCst), 1);
		assert_eq!(queue.task_state("doc-a"), TaskState::Completed);
	}

	#[tokio::test]
	async fn second_enqueue_while_running_coalesces_into_pending() {
		let queue = SyncQueue::new(config());
		let counter = Arc::new(AtomicUsize::new(0));
		let gate = Arc::new(tokio::sync::Notify::new());
		let gate_clone = Arc::clone(&gate);
		let slow: QueueTask = Arc::new(move || {
			let gate = Arc::clone(&gate_clone);
			Box::pin(async move {
				gate.notified().await;
				Ok(())
			})
		});
		queue.enqueue("doc-a", slow);
		tokio::task::yield_now().await;
		assert_eq!(queue.task_state("doc-a"), TaskState::Running);

		queue.enqueue("doc-a", counting_task(Arc::clone(&counter)));
		assert_eq!(queue.task_state("doc-a"), TaskState::Pending);

		gate.notify_one();
		queue.flush().await;
		assert_eq!(counter.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn failed_task_retries_then_succeeds() {
		let queue = SyncQueue::new(config());
		let attempts = Arc::new(AtomicUsize::new(0));
		let attempts_clone = Arc::clone(&attempts);
		let task: QueueTask = Arc::new(move || {
			let attempts = Arc::clone(&attempts_clone);
			Box::pin(async move {
				let n = attempts.fetch_add(1, Ordering::SeqCst);
				if n == 0 {
					Err(Error::Internal("boom".into()))
				} else {
					Ok(())
				}
			})
		});
		queue.enqueue("doc-a", task);
		tokio::time::timeout(Duration::from_secs(2), queue.flush()).await.unwrap();
		assert_eq!(attempts.load(Ordering::SeqCst), 2);
		assert_eq!(queue.task_state("doc-a"), TaskState::Completed);
	}

	#[tokio::test]
	async fn exhausting_retries_reports_failed() {
		let mut cfg = config();
		cfg.max_retries = 1;
		let queue = SyncQueue::new(cfg);
		let attempts = Arc::new(AtomicUsize::new(0));
		queue.enqueue("doc-a", failing_task(Arc::clone(&attempts)));
		tokio::time::timeout(Duration::from_secs(2), queue.flush()).await.unwrap();
		assert_eq!(attempts.load(Ordering::SeqCst), 2);
		assert_eq!(queue.task_state("doc-a"), TaskState::Failed);
	}

	#[tokio::test]
	async fn cancel_pending_task_drops_it_before_it_runs() {
		let queue = SyncQueue::new(config());
		let counter = Arc::new(AtomicUsize::new(0));
		let gate = Arc::new(tokio::sync::Notify::new());
		let gate_clone = Arc::clone(&gate);
		let slow: QueueTask = Arc::new(move || {
			let gate = Arc::clone(&gate_clone);
			Box::pin(async move {
				gate.notified().await;
				Ok(())
			})
		});
		queue.enqueue("doc-a", slow);
		tokio::task::yield_now().await;

		queue.enqueue("doc-a", counting_task(Arc::clone(&counter)));
		queue.cancel("doc-a");
		assert!(!queue.has_pending("doc-a"));

		gate.notify_one();
		queue.flush().await;
		assert_eq!(counter.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn cancel_running_task_discards_its_result() {
		let queue = SyncQueue::new(config());
		let gate = Arc::new(tokio::sync::Notify::new());
		let gate_clone = Arc::clone(&gate);
		let slow: QueueTask = Arc::new(move || {
			let gate = Arc::clone(&gate_clone);
			Box::pin(async move {
				gate.notified().await;
				Ok(())
			})
		});
		queue.enqueue("doc-a", slow);
		tokio::task::yield_now().await;
		queue.cancel("doc-a");
		gate.notify_one();
		queue.flush().await;
		assert_eq!(queue.task_state("doc-a"), TaskState::None);
	}

	#[tokio::test]
	async fn queue_observer_sees_active_count_transitions() {
		let queue = SyncQueue::new(config());
		let seen = Arc::new(Mutex::new(Vec::new()));
		let seen_clone = Arc::clone(&seen);
		queue.on_queue_change(Box::new(move |n| {
			#[allow(clippy::unwrap_used)]
			seen_clone.lock().unwrap().push(n);
		}));
		let counter = Arc::new(AtomicUsize::new(0));
		queue.enqueue("doc-a", counting_task(Arc::clone(&counter)));
		queue.flush().await;
		#[allow(clippy::unwrap_used)]
		let history = seen.lock().unwrap();
		assert!(history.contains(&1));
		assert!(history.contains(&0));
	}

	#[tokio::test]
	async fn destroy_clears_pending_state_and_stops_draining() {
		let queue = SyncQueue::new(config());
		let counter = Arc::new(AtomicUsize::new(0));
		let gate = Arc::new(tokio::sync::Notify::new());
		let gate_clone = Arc::clone(&gate);
		let slow: QueueTask = Arc::new(move || {
			let gate = Arc::clone(&gate_clone);
			Box::pin(async move {
				gate.notified().await;
				Ok(())
			})
		});
		queue.enqueue("doc-a", slow);
		tokio::task::yield_now().await;
		queue.enqueue("doc-b", counting_task(Arc::clone(&counter)));
		queue.destroy();
		assert_eq!(queue.task_state("doc-b"), TaskState::None);
		gate.notify_one();
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(counter.load(Ordering::SeqCst), 0);
	}
}

// vim: ts=4
