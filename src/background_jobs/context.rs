use crate::state_store::JobStateStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Job run history and audit log.
    pub state_store: Arc<dyn JobStateStore>,
}

impl JobContext {
    pub fn new(cancellation_token: CancellationToken, state_store: Arc<dyn JobStateStore>) -> Self {
        Self {
            cancellation_token,
            state_store,
        }
    }

    /// Derives a context for one execution, cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self {
            cancellation_token: self.cancellation_token.child_token(),
            state_store: Arc::clone(&self.state_store),
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
