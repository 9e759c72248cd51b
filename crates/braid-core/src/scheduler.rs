//! Generic async task scheduler: delayed execution, dependencies, retry with
//! backoff, optional cron recurrence. Used for the session disconnect timer
//! and the compaction retry loop.

use async_trait::async_trait;
use std::{
	collections::{BTreeMap, HashMap},
	fmt::Debug,
	sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use croner::Cron;
use std::str::FromStr;

use braid_types::prelude::*;

pub type TaskId = u64;

/// Cron schedule wrapper using the croner crate. Stores the source
/// expression alongside the parsed form so it can be persisted.
#[derive(Debug, Clone)]
pub struct CronSchedule {
	expr: Box<str>,
	cron: Cron,
}

impl CronSchedule {
	pub fn parse(expr: &str) -> BraidResult<Self> {
		let cron = Cron::from_str(expr)
			.map_err(|e| Error::ValidationError(format!("invalid cron expression: {e}")))?;
		Ok(Self { expr: expr.into(), cron })
	}

	pub fn next_execution(&self, after: Timestamp) -> BraidResult<Timestamp> {
		let dt = DateTime::<Utc>::from_timestamp(after.0, 0).unwrap_or_else(Utc::now);
		self.cron
			.find_next_occurrence(&dt, false)
			.map(|next| Timestamp(next.timestamp()))
			.map_err(|e| Error::ValidationError(format!("cron next_execution failed: {e}")))
	}
}

impl PartialEq for CronSchedule {
	fn eq(&self, other: &Self) -> bool {
		self.expr == other.expr
	}
}
impl Eq for CronSchedule {}

#[async_trait]
pub trait Task<S: Clone>: Send + Sync + Debug {
	async fn run(&self, state: &S) -> BraidResult<()>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
	wait_min_max: (u64, u64),
	times: u16,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self { wait_min_max: (1, 3600), times: 3 }
	}
}

impl RetryPolicy {
	#[must_use]
	pub fn new(wait_min_max: (u64, u64), times: u16) -> Self {
		Self { wait_min_max, times }
	}

	/// Exponential backoff in seconds: `min * 2^attempt`, capped at `max`.
	#[must_use]
	pub fn calculate_backoff(&self, attempt_count: u16) -> u64 {
		let (min, max) = self.wait_min_max;
		let backoff = min.saturating_mul(1u64 << u64::from(attempt_count.min(40)));
		backoff.min(max)
	}

	#[must_use]
	pub fn should_retry(&self, attempt_count: u16) -> bool {
		attempt_count < self.times
	}
}

#[derive(Debug, Clone)]
pub struct TaskMeta<S: Clone> {
	pub task: Arc<dyn Task<S>>,
	pub next_at: Option<Timestamp>,
	pub deps: Vec<TaskId>,
	retry_count: u16,
	pub retry: Option<RetryPolicy>,
	pub cron: Option<CronSchedule>,
}

/// Fluent builder for scheduling a task, mirroring the call sites that read
/// `.scheduler.task(t).schedule_after(30).with_retry(policy).schedule()`.
pub struct TaskSchedulerBuilder<'a, S: Clone> {
	scheduler: &'a Scheduler<S>,
	task: Arc<dyn Task<S>>,
	next_at: Option<Timestamp>,
	deps: Vec<TaskId>,
	retry: Option<RetryPolicy>,
	cron: Option<CronSchedule>,
}

impl<'a, S: Clone + Send + Sync + 'static> TaskSchedulerBuilder<'a, S> {
	fn new(scheduler: &'a Scheduler<S>, task: Arc<dyn Task<S>>) -> Self {
		Self { scheduler, task, next_at: None, deps: Vec::new(), retry: None, cron: None }
	}

	#[must_use]
	pub fn schedule_at(mut self, timestamp: Timestamp) -> Self {
		self.next_at = Some(timestamp);
		self
	}

	#[must_use]
	pub fn schedule_after(mut self, seconds: i64) -> Self {
		self.next_at = Some(Timestamp::from_now(seconds));
		self
	}

	#[must_use]
	pub fn depends_on(mut self, dep: TaskId) -> Self {
		self.deps.push(dep);
		self
	}

	#[must_use]
	pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
		self.retry = Some(policy);
		self
	}

	#[must_use]
	pub fn cron(mut self, expr: &str) -> Self {
		if let Ok(cron_schedule) = CronSchedule::parse(expr) {
			self.next_at = cron_schedule.next_execution(Timestamp::now()).ok();
			self.cron = Some(cron_schedule);
		}
		self
	}

	pub async fn schedule(self) -> BraidResult<TaskId> {
		self.scheduler
			.schedule_task_impl(self.task, self.next_at, self.deps, self.retry, self.cron)
			.await
	}
}

type ScheduledTaskMap<S> = BTreeMap<(Timestamp, TaskId), TaskMeta<S>>;

#[derive(Clone)]
pub struct Scheduler<S: Clone> {
	next_id: Arc<Mutex<TaskId>>,
	tasks_running: Arc<Mutex<HashMap<TaskId, TaskMeta<S>>>>,
	tasks_waiting: Arc<Mutex<HashMap<TaskId, TaskMeta<S>>>>,
	task_dependents: Arc<Mutex<HashMap<TaskId, Vec<TaskId>>>>,
	tasks_scheduled: Arc<Mutex<ScheduledTaskMap<S>>>,
	tx_finish: flume::Sender<TaskId>,
	rx_finish: flume::Receiver<TaskId>,
	notify_schedule: Arc<tokio::sync::Notify>,
}

impl<S: Clone + Send + Sync + 'static> Scheduler<S> {
	#[must_use]
	pub fn new() -> Arc<Self> {
		let (tx_finish, rx_finish) = flume::unbounded();
		Arc::new(Self {
			next_id: Arc::new(Mutex::new(0)),
			tasks_running: Arc::new(Mutex::new(HashMap::new())),
			tasks_waiting: Arc::new(Mutex::new(HashMap::new())),
			task_dependents: Arc::new(Mutex::new(HashMap::new())),
			tasks_scheduled: Arc::new(Mutex::new(BTreeMap::new())),
			tx_finish,
			rx_finish,
			notify_schedule: Arc::new(tokio::sync::Notify::new()),
		})
	}

	/// Spawn the finish-handler loop and the scheduled-time loop. Must be
	/// called once with the state that tasks run against.
	pub fn start(self: &Arc<Self>, state: S) {
		let schedule = Arc::clone(self);
		let stat = state.clone();
		let rx_finish = self.rx_finish.clone();
		tokio::spawn(async move {
			while let Ok(id) = rx_finish.recv_async().await {
				debug!("completed task {}", id);
				let task_meta_opt = {
					let mut running = lock!(schedule.tasks_running)?;
					running.remove(&id)
				};
				if let Some(task_meta) = task_meta_opt {
					if let Some(ref cron) = task_meta.cron {
						if let Ok(next_at) = cron.next_execution(Timestamp::now()) {
							let mut updated = task_meta.clone();
							updated.next_at = Some(next_at);
							updated.retry_count = 0;
							if let Err(e) = schedule.add_queue(id, updated) {
								error!("failed to reschedule recurring task {}: {}", id, e);
							}
						}
					}
					if let Ok(ready) = schedule.release_dependents(id) {
						for (dep_id, dep_meta) in ready {
							{
								let mut running = lock!(schedule.tasks_running)?;
								running.insert(dep_id, dep_meta.clone());
							}
							schedule.spawn_task(stat.clone(), dep_id, dep_meta);
						}
					}
				} else {
					warn!("completed task {} not found in running queue", id);
				}
			}
			Ok::<(), Error>(())
		});

		let schedule = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				let is_empty = lock!(schedule.tasks_scheduled).map(|g| g.is_empty()).unwrap_or(true);
				if is_empty {
					schedule.notify_schedule.notified().await;
				}
				let next_due = loop {
					let mut scheduled = match lock!(schedule.tasks_scheduled) {
						Ok(g) => g,
						Err(_) => break None,
					};
					let Some((&(ts, id), _)) = scheduled.first_key_value() else {
						break None;
					};
					if ts <= Timestamp::now() {
						if let Some(meta) = scheduled.remove(&(ts, id)) {
							drop(scheduled);
							if let Ok(mut running) = lock!(schedule.tasks_running) {
								running.insert(id, meta.clone());
							}
							schedule.spawn_task(state.clone(), id, meta);
						}
					} else {
						break Some(ts);
					}
				};
				if let Some(ts) = next_due {
					let wait_secs = (ts.0 - Timestamp::now().0).max(0);
					let wait = tokio::time::Duration::from_secs(wait_secs.try_into().unwrap_or(0));
					tokio::select! {
						() = tokio::time::sleep(wait) => (),
						() = schedule.notify_schedule.notified() => (),
					}
				}
			}
		});
	}

	#[must_use]
	pub fn task(&self, task: Arc<dyn Task<S>>) -> TaskSchedulerBuilder<'_, S> {
		TaskSchedulerBuilder::new(self, task)
	}

	pub async fn add(&self, task: Arc<dyn Task<S>>) -> BraidResult<TaskId> {
		self.task(task).schedule().await
	}

	async fn schedule_task_impl(
		&self,
		task: Arc<dyn Task<S>>,
		next_at: Option<Timestamp>,
		deps: Vec<TaskId>,
		retry: Option<RetryPolicy>,
		cron: Option<CronSchedule>,
	) -> BraidResult<TaskId> {
		let id = {
			let mut next_id = lock!(self.next_id)?;
			*next_id += 1;
			*next_id
		};
		let task_meta = TaskMeta { task, next_at, deps, retry_count: 0, retry, cron };
		self.add_queue(id, task_meta)?;
		Ok(id)
	}

	fn add_queue(&self, id: TaskId, task_meta: TaskMeta<S>) -> BraidResult<()> {
		{
			let mut running = lock!(self.tasks_running)?;
			if let Some(existing) = running.get_mut(&id) {
				*existing = task_meta;
				return Ok(());
			}
		}
		self.remove_from_queues(id)?;

		let deps = task_meta.deps.clone();
		if !deps.is_empty() {
			let mut waiting = lock!(self.tasks_waiting)?;
			waiting.insert(id, task_meta);
			let mut dependents = lock!(self.task_dependents)?;
			for dep in deps {
				dependents.entry(dep).or_default().push(id);
			}
			return Ok(());
		}

		let due = task_meta.next_at.unwrap_or(Timestamp(0));
		let mut scheduled = lock!(self.tasks_scheduled)?;
		scheduled.insert((due, id), task_meta);
		self.notify_schedule.notify_one();
		Ok(())
	}

	fn remove_from_queues(&self, task_id: TaskId) -> BraidResult<Option<TaskMeta<S>>> {
		if let Some(meta) = lock!(self.tasks_waiting)?.remove(&task_id) {
			return Ok(Some(meta));
		}
		{
			let mut scheduled = lock!(self.tasks_scheduled)?;
			if let Some(key) =
				scheduled.iter().find(|((_, id), _)| *id == task_id).map(|(k, _)| *k)
			{
				return Ok(scheduled.remove(&key));
			}
		}
		Ok(lock!(self.tasks_running)?.remove(&task_id))
	}

	fn release_dependents(&self, completed: TaskId) -> BraidResult<Vec<(TaskId, TaskMeta<S>)>> {
		let dependents = lock!(self.task_dependents)?.remove(&completed).unwrap_or_default();
		if dependents.is_empty() {
			return Ok(Vec::new());
		}
		let mut ready = Vec::new();
		let mut waiting = lock!(self.tasks_waiting)?;
		for dependent_id in dependents {
			if let Some(meta) = waiting.get_mut(&dependent_id) {
				meta.deps.retain(|x| *x != completed);
				if meta.deps.is_empty() {
					if let Some(meta) = waiting.remove(&dependent_id) {
						ready.push((dependent_id, meta));
					}
				}
			}
		}
		Ok(ready)
	}

	/// Cancel a task that has not yet started running. No-op if it is
	/// already running or unknown.
	pub fn cancel(&self, task_id: TaskId) -> BraidResult<bool> {
		Ok(self.remove_from_queues_if_not_running(task_id)?)
	}

	fn remove_from_queues_if_not_running(&self, task_id: TaskId) -> BraidResult<bool> {
		if lock!(self.tasks_waiting)?.remove(&task_id).is_some() {
			return Ok(true);
		}
		let mut scheduled = lock!(self.tasks_scheduled)?;
		if let Some(key) = scheduled.iter().find(|((_, id), _)| *id == task_id).map(|(k, _)| *k) {
			scheduled.remove(&key);
			return Ok(true);
		}
		Ok(false)
	}

	fn spawn_task(self: &Arc<Self>, state: S, id: TaskId, meta: TaskMeta<S>) {
		let schedule = Arc::clone(self);
		tokio::spawn(async move {
			let result = meta.task.run(&state).await;
			match result {
				Ok(()) => {
					let _ = schedule.tx_finish.send(id);
				}
				Err(e) => {
					let retriable = e.is_retriable();
					let should_retry = meta
						.retry
						.as_ref()
						.is_some_and(|policy| retriable && policy.should_retry(meta.retry_count));
					if should_retry {
						let policy = meta.retry.clone().unwrap_or_default();
						let delay = policy.calculate_backoff(meta.retry_count);
						warn!("task {} failed ({}), retrying in {}s", id, e, delay);
						let mut next = meta.clone();
						next.retry_count += 1;
						next.next_at = Some(Timestamp::from_now(delay.try_into().unwrap_or(3600)));
						{
							let mut running = match schedule.tasks_running.lock() {
								Ok(guard) => guard,
								Err(poisoned) => {
									error!("mutex poisoned: tasks_running (recovering)");
									poisoned.into_inner()
								}
							};
							running.remove(&id);
						}
						let _ = schedule.add_queue(id, next);
					} else {
						error!("task {} failed terminally: {}", id, e);
						{
							let mut running = match schedule.tasks_running.lock() {
								Ok(guard) => guard,
								Err(poisoned) => {
									error!("mutex poisoned: tasks_running (recovering)");
									poisoned.into_inner()
								}
							};
							running.remove(&id);
						}
						let _ = schedule.tx_finish.send(id);
					}
				}
			}
		});
	}

	#[must_use]
	pub fn health(&self) -> SchedulerHealth {
		SchedulerHealth {
			running: lock!(self.tasks_running).map(|g| g.len()).unwrap_or(0),
			waiting: lock!(self.tasks_waiting).map(|g| g.len()).unwrap_or(0),
			scheduled: lock!(self.tasks_scheduled).map(|g| g.len()).unwrap_or(0),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerHealth {
	pub running: usize,
	pub waiting: usize,
	pub scheduled: usize,
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Debug)]
	struct CountingTask {
		counter: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl Task<()> for CountingTask {
		async fn run(&self, _state: &()) -> BraidResult<()> {
			self.counter.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn runs_an_immediate_task() {
		let scheduler = Scheduler::<()>::new();
		scheduler.start(());
		let counter = Arc::new(AtomicUsize::new(0));
		scheduler.add(Arc::new(CountingTask { counter: counter.clone() })).await.unwrap();
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		assert_eq!(counter.load(Ordering::SeqCst), 1);
	}

	#[derive(Debug)]
	struct FailingTask;

	#[async_trait]
	impl Task<()> for FailingTask {
		async fn run(&self, _state: &()) -> BraidResult<()> {
			Err(Error::Internal("boom".into()))
		}
	}

	#[tokio::test]
	async fn retries_a_failing_task_then_gives_up() {
		let scheduler = Scheduler::<()>::new();
		scheduler.start(());
		scheduler
			.task(Arc::new(FailingTask))
			.with_retry(RetryPolicy::new((0, 0), 1))
			.schedule()
			.await
			.unwrap();
		tokio::time::sleep(std::time::Duration::from_millis(100)).await;
		let health = scheduler.health();
		assert_eq!(health.running, 0);
	}
}

// vim: ts=4
