// src/coord/lock.rs

//! Distributed mutual exclusion built from the coordination primitives.
//!
//! Every contender creates an ephemeral sequential node under the lock path.
//! The contender owning the lowest sequence number holds the lock; everyone
//! else watches the deletion of its immediate predecessor, so a release wakes
//! exactly one waiter. Because the nodes are ephemeral, a holder whose session
//! dies releases the lock automatically.

use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::{join_path, with_retry, CoordError, Coordinator, CreateMode, RetryPolicy, WatchKind};

const LOCK_NODE_PREFIX: &str = "lock-";

/// A named distributed mutex.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    path: String,
}

/// Proof of lock ownership. Call [`LockGuard::release`] when done; a guard
/// that is dropped without release keeps the lock until the session ends.
#[derive(Debug)]
#[must_use = "the lock is held until `release` is called or the session ends"]
pub struct LockGuard {
    node: String,
}

impl DistributedLock {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Try to acquire the lock, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` when the wait elapses; the contender node is removed
    /// so that the attempt leaves no trace.
    pub async fn acquire(
        &self,
        coord: &dyn Coordinator,
        wait: Duration,
    ) -> Result<Option<LockGuard>, CoordError> {
        let deadline = Instant::now() + wait;
        let prefix = join_path(&self.path, LOCK_NODE_PREFIX);
        let node = coord
            .create_sequential(&prefix, coord.session_id().as_bytes(), CreateMode::Ephemeral)
            .await?;
        let own_name = node.rsplit('/').next().unwrap_or_default().to_string();

        match self.wait_for_turn(coord, &own_name, deadline).await {
            Ok(true) => {
                debug!(lock = %self.path, node = %node, "distributed lock acquired");
                Ok(Some(LockGuard { node }))
            }
            Ok(false) => {
                debug!(lock = %self.path, "timed out waiting for distributed lock");
                abandon(coord, &node).await;
                Ok(None)
            }
            Err(e) => {
                abandon(coord, &node).await;
                Err(e)
            }
        }
    }

    async fn wait_for_turn(
        &self,
        coord: &dyn Coordinator,
        own_name: &str,
        deadline: Instant,
    ) -> Result<bool, CoordError> {
        loop {
            let mut contenders: Vec<String> = coord
                .get_children(&self.path)
                .await?
                .into_iter()
                .filter(|c| c.starts_with(LOCK_NODE_PREFIX))
                .collect();
            contenders.sort();

            let position = contenders
                .iter()
                .position(|c| c == own_name)
                .ok_or_else(|| CoordError::NoNode(join_path(&self.path, own_name)))?;

            if position == 0 {
                return Ok(true);
            }

            let predecessor = join_path(&self.path, &contenders[position - 1]);
            let deleted = coord.watch(&predecessor, WatchKind::Deleted).await?;

            // The predecessor may have gone away before the watch was armed.
            if !coord.exists(&predecessor).await? {
                continue;
            }

            match timeout_at(deadline, deleted).await {
                Ok(_) => continue,
                Err(_elapsed) => return Ok(false),
            }
        }
    }
}

impl LockGuard {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn release(self, coord: &dyn Coordinator) -> Result<(), CoordError> {
        remove_node(coord, &self.node).await
    }
}

async fn abandon(coord: &dyn Coordinator, node: &str) {
    if let Err(e) = remove_node(coord, node).await {
        warn!(node = %node, error = %e, "failed to remove abandoned lock node");
    }
}

/// Delete a lock node, retrying transient errors. A stale node of a live
/// session blocks every later contender.
async fn remove_node(coord: &dyn Coordinator, node: &str) -> Result<(), CoordError> {
    match with_retry(&RetryPolicy::default(), "remove lock node", || coord.delete(node)).await {
        Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
