//! Per-shard mutual exclusion on top of a [`LockService`].
//!
//! Acquisition is a single attempt: a run that finds its shard leased by
//! someone else gives up immediately and leaves the work to the holder.

use crate::source_store::ShardSpec;
use crate::state_store::LockService;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lease lifetime. Must exceed the run budget so a live run never
/// loses its lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

const LEASE_KEY_PREFIX: &str = "finished_builds_sync:shard";

pub fn lease_key(shard: &ShardSpec) -> String {
    format!("{}:{}", LEASE_KEY_PREFIX, shard.shard_id)
}

/// What to do when the lease is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquirePolicy {
    /// Give up after one attempt.
    #[default]
    FailFast,
}

pub struct LeaseCoordinator {
    lock_service: Arc<dyn LockService>,
    holder_id: String,
    ttl: Duration,
    policy: AcquirePolicy,
}

impl LeaseCoordinator {
    pub fn new(lock_service: Arc<dyn LockService>, ttl: Duration) -> Self {
        Self {
            lock_service,
            holder_id: uuid::Uuid::new_v4().to_string(),
            ttl,
            policy: AcquirePolicy::FailFast,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn policy(&self) -> AcquirePolicy {
        self.policy
    }

    /// Returns `None` when another holder owns an unexpired lease.
    pub fn try_acquire(&self, shard: &ShardSpec) -> Result<Option<LeaseGuard>> {
        let key = lease_key(shard);
        let acquired = match self.policy {
            AcquirePolicy::FailFast => {
                self.lock_service
                    .try_acquire(&key, &self.holder_id, self.ttl)?
            }
        };

        if !acquired {
            debug!("Lease {} is held by another worker", key);
            return Ok(None);
        }

        debug!("Acquired lease {} as {}", key, self.holder_id);
        Ok(Some(LeaseGuard {
            lock_service: self.lock_service.clone(),
            key,
            holder_id: self.holder_id.clone(),
            released: false,
        }))
    }
}

/// A held lease. Released explicitly with [`LeaseGuard::release`], or on a
/// best-effort basis when dropped.
pub struct LeaseGuard {
    lock_service: Arc<dyn LockService>,
    key: String,
    holder_id: String,
    released: bool,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns false if the lease had already expired and was taken over.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        let released = self.lock_service.release(&self.key, &self.holder_id)?;
        if !released {
            warn!(
                "Lease {} was no longer held by {} at release",
                self.key, self.holder_id
            );
        }
        Ok(released)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock_service.release(&self.key, &self.holder_id) {
            warn!("Failed to release lease {} on drop: {}", self.key, e);
        }
    }
}
