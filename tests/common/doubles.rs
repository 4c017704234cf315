//! Test doubles wrapping the real stores.

use anyhow::Result;
use finished_builds_sync::analytics::{AnalyticsDestination, DestinationError, EncodedBatch};
use finished_builds_sync::source_store::{
    ArtifactSummary, BuildRecord, BuildRecords, ProjectNamespace, RetryCount, RunnerManagerRecord,
    RunnerRecord, RunnerTag,
};
use finished_builds_sync::sync::Clock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

// =============================================================================
// Clock
// =============================================================================

/// Every reading moves time forward by `step`.
pub struct SteppingClock {
    now: Mutex<Instant>,
    step: Duration,
}

impl SteppingClock {
    pub fn new(step: Duration) -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Instant {
        let mut now = self.now.lock().unwrap();
        let current = *now;
        *now += self.step;
        current
    }
}

// =============================================================================
// Destinations
// =============================================================================

/// Accepts the first `successful_writes` batches, rejects the rest.
pub struct FailingDestination {
    inner: Arc<dyn AnalyticsDestination>,
    successful_writes: usize,
    attempts: AtomicUsize,
}

impl FailingDestination {
    pub fn after(inner: Arc<dyn AnalyticsDestination>, successful_writes: usize) -> Self {
        Self {
            inner,
            successful_writes,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn always(inner: Arc<dyn AnalyticsDestination>) -> Self {
        Self::after(inner, 0)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl AnalyticsDestination for FailingDestination {
    fn write_batch(&self, batch: &EncodedBatch) -> Result<(), DestinationError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.successful_writes {
            return self.inner.write_batch(batch);
        }
        Err(DestinationError::Unavailable(
            "simulated outage".to_string(),
        ))
    }
}

/// Parks every write until the test releases it.
pub struct BlockingDestination {
    inner: Arc<dyn AnalyticsDestination>,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

pub struct BlockingControl {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl BlockingControl {
    pub fn wait_until_writing(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(10))
            .expect("writer never reached the destination");
    }

    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

impl BlockingDestination {
    pub fn new(inner: Arc<dyn AnalyticsDestination>) -> (Self, BlockingControl) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            Self {
                inner,
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            },
            BlockingControl {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl AnalyticsDestination for BlockingDestination {
    fn write_batch(&self, batch: &EncodedBatch) -> Result<(), DestinationError> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
        self.inner.write_batch(batch)
    }
}

/// Runs `hook` once, right after the first successful write.
pub struct HookedDestination {
    inner: Arc<dyn AnalyticsDestination>,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl HookedDestination {
    pub fn new(inner: Arc<dyn AnalyticsDestination>, hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            hook: Mutex::new(Some(Box::new(hook))),
        }
    }
}

impl AnalyticsDestination for HookedDestination {
    fn write_batch(&self, batch: &EncodedBatch) -> Result<(), DestinationError> {
        self.inner.write_batch(batch)?;
        if let Some(hook) = self.hook.lock().unwrap().take() {
            hook();
        }
        Ok(())
    }
}

// =============================================================================
// Build records
// =============================================================================

/// Counts every bulk lookup issued against the source database.
pub struct CountingRecords {
    inner: Arc<dyn BuildRecords>,
    queries: AtomicUsize,
}

impl CountingRecords {
    pub fn new(inner: Arc<dyn BuildRecords>) -> Self {
        Self {
            inner,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

impl BuildRecords for CountingRecords {
    fn builds_by_ids(&self, ids: &[i64]) -> Result<Vec<BuildRecord>> {
        self.hit();
        self.inner.builds_by_ids(ids)
    }

    fn project_namespaces(&self, project_ids: &[i64]) -> Result<Vec<ProjectNamespace>> {
        self.hit();
        self.inner.project_namespaces(project_ids)
    }

    fn runners_by_ids(&self, ids: &[i64]) -> Result<Vec<RunnerRecord>> {
        self.hit();
        self.inner.runners_by_ids(ids)
    }

    fn runner_tags(&self, runner_ids: &[i64]) -> Result<Vec<RunnerTag>> {
        self.hit();
        self.inner.runner_tags(runner_ids)
    }

    fn runner_managers_by_ids(&self, ids: &[i64]) -> Result<Vec<RunnerManagerRecord>> {
        self.hit();
        self.inner.runner_managers_by_ids(ids)
    }

    fn retried_counts(&self, pipeline_ids: &[i64]) -> Result<Vec<RetryCount>> {
        self.hit();
        self.inner.retried_counts(pipeline_ids)
    }

    fn artifact_summaries(&self, build_ids: &[i64]) -> Result<Vec<ArtifactSummary>> {
        self.hit();
        self.inner.artifact_summaries(build_ids)
    }
}
