use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source, injectable so tests can drive the budget.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Wall time budget of a single run.
///
/// Only consulted between pages, so an in-flight flush always completes.
pub struct RuntimeLimiter {
    clock: Arc<dyn Clock>,
    started_at: Instant,
    max_runtime: Duration,
}

impl RuntimeLimiter {
    pub fn start(clock: Arc<dyn Clock>, max_runtime: Duration) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            started_at,
            max_runtime,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started_at)
    }

    pub fn over_time(&self) -> bool {
        self.elapsed() >= self.max_runtime
    }

    pub fn remaining(&self) -> Duration {
        self.max_runtime.saturating_sub(self.elapsed())
    }
}
