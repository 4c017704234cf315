use super::context::JobContext;
use super::job::{BackgroundJob, JobError, JobOutcome, ShutdownBehavior};
use crate::state_store::{JobRunStatus, JobStateStore};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A job bound to the parameters it runs with, e.g. one shard of a sync.
struct ScheduledEntry {
    key: String,
    job: Arc<dyn BackgroundJob>,
    params: Option<JsonValue>,
    next_run_at: Option<Instant>,
    next_trigger: &'static str,
    running: bool,
    cancel_token: Option<CancellationToken>,
}

struct JobCompletion {
    key: String,
    outcome: Option<JobOutcome>,
}

/// Runs registered entries on their interval, one execution per entry at a time.
///
/// An entry whose execution reports `JobOutcome::MoreWork` is started again
/// immediately instead of waiting for its next interval.
pub struct JobScheduler {
    entries: HashMap<String, ScheduledEntry>,
    running_handles: HashMap<String, JoinHandle<()>>,
    state_store: Arc<dyn JobStateStore>,
    completion_tx: mpsc::UnboundedSender<JobCompletion>,
    completion_rx: mpsc::UnboundedReceiver<JobCompletion>,
    shutdown_token: CancellationToken,
    job_context: JobContext,
}

impl JobScheduler {
    pub fn new(shutdown_token: CancellationToken, job_context: JobContext) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            entries: HashMap::new(),
            running_handles: HashMap::new(),
            state_store: Arc::clone(&job_context.state_store),
            completion_tx,
            completion_rx,
            shutdown_token,
            job_context,
        }
    }

    /// Register a job under `key`. Interval jobs first run as soon as the
    /// scheduler starts.
    pub fn register_job(
        &mut self,
        key: impl Into<String>,
        job: Arc<dyn BackgroundJob>,
        params: Option<JsonValue>,
    ) {
        let key = key.into();
        info!("Registering job: {} - {}", key, job.description());
        let next_run_at = job.schedule().interval().map(|_| Instant::now());
        self.entries.insert(
            key.clone(),
            ScheduledEntry {
                key,
                job,
                params,
                next_run_at,
                next_trigger: "schedule",
                running: false,
                cancel_token: None,
            },
        );
    }

    pub fn job_count(&self) -> usize {
        self.entries.len()
    }

    /// Main scheduler loop. Returns once the shutdown token is cancelled and
    /// running executions have finished or been abandoned.
    pub async fn run(&mut self) {
        info!(
            "Starting job scheduler with {} registered jobs",
            self.entries.len()
        );

        match self.state_store.mark_stale_jobs_failed() {
            Ok(count) if count > 0 => {
                info!("Marked {} stale jobs as failed from previous run", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to mark stale jobs: {}", e);
            }
        }

        loop {
            self.run_due_jobs();

            let sleep_duration = self.time_until_next_scheduled_job();
            debug!(
                "Scheduler sleeping for {:?} until next scheduled job",
                sleep_duration
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {}
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Job scheduler stopped");
    }

    fn time_until_next_scheduled_job(&self) -> Duration {
        let now = Instant::now();
        self.entries
            .values()
            .filter(|entry| !entry.running)
            .filter_map(|entry| entry.next_run_at)
            .map(|next_run| next_run.saturating_duration_since(now))
            .min()
            .map_or(IDLE_CHECK_INTERVAL, |d| d.min(IDLE_CHECK_INTERVAL))
    }

    fn run_due_jobs(&mut self) {
        let now = Instant::now();
        let due: Vec<(String, &'static str)> = self
            .entries
            .values()
            .filter(|entry| !entry.running)
            .filter(|entry| entry.next_run_at.is_some_and(|next| next <= now))
            .map(|entry| (entry.key.clone(), entry.next_trigger))
            .collect();

        for (key, trigger) in due {
            self.spawn_job(&key, trigger);
        }
    }

    /// Start an execution of `key` right away, outside its schedule.
    pub fn trigger_job(&mut self, key: &str) -> Result<(), JobError> {
        match self.entries.get(key) {
            None => Err(JobError::InvalidParams(format!("unknown job {}", key))),
            Some(entry) if entry.running => Err(JobError::ExecutionFailed(format!(
                "job {} is already running",
                key
            ))),
            Some(_) => {
                self.spawn_job(key, "manual");
                Ok(())
            }
        }
    }

    fn spawn_job(&mut self, key: &str, triggered_by: &str) {
        let Some(entry) = self.entries.get_mut(key) else {
            error!("Attempted to spawn unknown job: {}", key);
            return;
        };

        let run_id = match self.state_store.record_job_start(key, triggered_by) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to record job start for {}: {}", key, e);
                return;
            }
        };

        info!(
            "Starting job: {} (run_id: {}, triggered_by: {})",
            key, run_id, triggered_by
        );

        let ctx = self.job_context.child();
        entry.running = true;
        entry.cancel_token = Some(ctx.cancellation_token.clone());

        let job = Arc::clone(&entry.job);
        let params = entry.params.clone();
        let state_store = Arc::clone(&self.state_store);
        let completion_tx = self.completion_tx.clone();
        let key_owned = key.to_string();

        let handle = tokio::spawn(async move {
            let start_time = Instant::now();
            let result =
                tokio::task::spawn_blocking(move || job.execute_with_params(&ctx, params)).await;
            let elapsed = start_time.elapsed();

            let (status, error_msg, outcome) = match result {
                Ok(Ok(outcome)) => {
                    info!("Job {} completed successfully in {:?}", key_owned, elapsed);
                    (JobRunStatus::Completed, None, Some(outcome))
                }
                Ok(Err(JobError::Cancelled)) => {
                    info!("Job {} was cancelled after {:?}", key_owned, elapsed);
                    (JobRunStatus::Failed, Some("Cancelled".to_string()), None)
                }
                Ok(Err(e)) => {
                    error!("Job {} failed after {:?}: {}", key_owned, elapsed, e);
                    (JobRunStatus::Failed, Some(e.to_string()), None)
                }
                Err(e) => {
                    error!("Job {} panicked after {:?}: {}", key_owned, elapsed, e);
                    (JobRunStatus::Failed, Some(format!("Task panic: {}", e)), None)
                }
            };

            if let Err(e) = state_store.record_job_finish(run_id, status, error_msg) {
                error!("Failed to record job finish for {}: {}", key_owned, e);
            }

            let _ = completion_tx.send(JobCompletion {
                key: key_owned,
                outcome,
            });
        });

        self.running_handles.insert(key.to_string(), handle);
    }

    async fn handle_completion(&mut self, completion: JobCompletion) {
        if let Some(handle) = self.running_handles.remove(&completion.key) {
            let _ = handle.await;
        }

        let Some(entry) = self.entries.get_mut(&completion.key) else {
            return;
        };
        entry.running = false;
        entry.cancel_token = None;

        let Some(interval) = entry.job.schedule().interval() else {
            return;
        };
        let now = Instant::now();
        if completion.outcome == Some(JobOutcome::MoreWork) {
            debug!("Job {} has more work, rescheduling now", entry.key);
            entry.next_run_at = Some(now);
            entry.next_trigger = "reschedule";
        } else {
            entry.next_run_at = Some(now + interval);
            entry.next_trigger = "schedule";
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");

        for entry in self.entries.values() {
            if entry.running && entry.job.shutdown_behavior() == ShutdownBehavior::Cancellable {
                if let Some(token) = &entry.cancel_token {
                    debug!("Cancelling job: {}", entry.key);
                    token.cancel();
                }
            }
        }

        for (key, handle) in self.running_handles.drain() {
            let behavior = self
                .entries
                .get(&key)
                .map(|entry| entry.job.shutdown_behavior())
                .unwrap_or_default();
            if behavior == ShutdownBehavior::WaitForCompletion {
                info!("Waiting for job {} to complete...", key);
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Job {} did not finish within {:?}", key, SHUTDOWN_GRACE);
            }
        }

        info!("Scheduler shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::JobSchedule;
    use crate::state_store::SqliteStateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct TestJob {
        execution_count: Arc<AtomicUsize>,
        more_work_runs: usize,
        schedule: JobSchedule,
    }

    impl BackgroundJob for TestJob {
        fn id(&self) -> &'static str {
            "test_job"
        }

        fn name(&self) -> &'static str {
            "Test Job"
        }

        fn description(&self) -> &'static str {
            "A test job for unit tests"
        }

        fn schedule(&self) -> JobSchedule {
            self.schedule.clone()
        }

        fn execute_with_params(
            &self,
            _ctx: &JobContext,
            _params: Option<JsonValue>,
        ) -> Result<JobOutcome, JobError> {
            let previous = self.execution_count.fetch_add(1, Ordering::SeqCst);
            if previous < self.more_work_runs {
                Ok(JobOutcome::MoreWork)
            } else {
                Ok(JobOutcome::Idle)
            }
        }
    }

    fn create_test_scheduler() -> (JobScheduler, Arc<SqliteStateStore>, CancellationToken, TempDir)
    {
        let temp_dir = TempDir::new().unwrap();
        let state_store = Arc::new(SqliteStateStore::new(temp_dir.path().join("state.db")).unwrap());
        let shutdown_token = CancellationToken::new();
        let job_context = JobContext::new(shutdown_token.child_token(), state_store.clone());
        let scheduler = JobScheduler::new(shutdown_token.clone(), job_context);
        (scheduler, state_store, shutdown_token, temp_dir)
    }

    async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "job did not reach {} executions", expected);
    }

    #[tokio::test]
    async fn test_interval_job_runs_on_start_then_waits() {
        let (mut scheduler, state_store, shutdown_token, _temp_dir) = create_test_scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.register_job(
            "test_job",
            Arc::new(TestJob {
                execution_count: count.clone(),
                more_work_runs: 0,
                schedule: JobSchedule::Interval(Duration::from_secs(3600)),
            }),
            None,
        );
        assert_eq!(scheduler.job_count(), 1);

        let task = tokio::spawn(async move { scheduler.run().await });
        wait_for_count(&count, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_token.cancel();
        task.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let history = state_store.get_job_history("test_job", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobRunStatus::Completed);
    }

    #[tokio::test]
    async fn test_more_work_reschedules_immediately() {
        let (mut scheduler, _state_store, shutdown_token, _temp_dir) = create_test_scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.register_job(
            "test_job",
            Arc::new(TestJob {
                execution_count: count.clone(),
                more_work_runs: 2,
                schedule: JobSchedule::Interval(Duration::from_secs(3600)),
            }),
            None,
        );

        let task = tokio::spawn(async move { scheduler.run().await });
        wait_for_count(&count, 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_token.cancel();
        task.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_manual_job_only_runs_when_triggered() {
        let (mut scheduler, _state_store, _shutdown_token, _temp_dir) = create_test_scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.register_job(
            "manual_job",
            Arc::new(TestJob {
                execution_count: count.clone(),
                more_work_runs: 0,
                schedule: JobSchedule::Manual,
            }),
            None,
        );

        assert!(scheduler.trigger_job("nonexistent").is_err());
        scheduler.trigger_job("manual_job").unwrap();
        wait_for_count(&count, 1).await;
    }

    #[tokio::test]
    async fn test_startup_marks_stale_runs_failed() {
        let (mut scheduler, state_store, shutdown_token, _temp_dir) = create_test_scheduler();
        state_store.record_job_start("crashed_job", "schedule").unwrap();

        shutdown_token.cancel();
        scheduler.run().await;

        assert!(state_store.get_running_jobs().unwrap().is_empty());
    }
}
