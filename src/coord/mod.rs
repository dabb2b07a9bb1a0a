// src/coord/mod.rs

//! Coordination client facade.
//!
//! Everything above this module talks to the shared coordination namespace
//! through the narrow [`Coordinator`] contract:
//!
//! - atomic create-if-absent (the only arbitration primitive),
//! - ephemeral nodes bound to the caller's session,
//! - single-shot watches on node creation/deletion and children changes.
//!
//! - [`memory`] is an in-process implementation of the contract, used for
//!   local mode and tests.
//! - [`lock`] builds a distributed mutex from sequential ephemeral nodes.
//! - [`retry`] retries transient errors with exponential backoff.
//! - [`paths`] holds the namespace layout.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod lock;
pub mod memory;
pub mod paths;
pub mod retry;

pub use lock::{DistributedLock, LockGuard};
pub use memory::{MemoryCoordinator, MemoryEnsemble};
pub use paths::Namespace;
pub use retry::{with_retry, RetryPolicy};

/// Shared, type-erased coordinator handle.
pub type SharedCoordinator = Arc<dyn Coordinator>;

/// Errors surfaced by the coordination kernel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("connection to the coordination service was lost")]
    ConnectionLoss,

    #[error("coordination operation timed out")]
    OperationTimeout,

    #[error("session has expired")]
    SessionExpired,

    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("ephemeral nodes cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("invalid path: {0}")]
    BadPath(String),
}

impl CoordError {
    /// Whether a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::ConnectionLoss | CoordError::OperationTimeout)
    }
}

/// Node lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed automatically when the creating session ends.
    Ephemeral,
}

/// Result of an atomic create-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

impl CreateOutcome {
    pub fn is_created(self) -> bool {
        matches!(self, CreateOutcome::Created)
    }
}

/// Condition a watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Created,
    Deleted,
    ChildrenChanged,
}

/// Notification delivered when a watched condition occurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
}

/// Metadata of an existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Position of the node's creation in the namespace-wide order of
    /// creations. Later creations have larger values.
    pub created_seq: u64,
}

/// Receiving half of a single-shot watch.
///
/// Resolves once; the watch must be re-armed to observe further changes.
/// Resolves with an error if the owning session ends first.
pub type WatchHandle = oneshot::Receiver<WatchEvent>;

/// The contract required of the coordination kernel.
#[async_trait]
pub trait Coordinator: Send + Sync + fmt::Debug {
    /// Identifier of the session this client is bound to.
    fn session_id(&self) -> &str;

    /// Atomically create `path` unless it already exists.
    ///
    /// Missing parent nodes are created as persistent, empty nodes.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<CreateOutcome, CoordError>;

    /// Create a node named `prefix` plus a monotonically increasing,
    /// zero-padded sequence number, returning the full path created.
    async fn create_sequential(
        &self,
        prefix: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordError>;

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError>;

    async fn stat(&self, path: &str) -> Result<Option<NodeStat>, CoordError>;

    /// Names (not full paths) of the direct children of `path`, sorted.
    /// A missing node has no children.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    /// Delete a leaf node.
    async fn delete(&self, path: &str) -> Result<(), CoordError>;

    /// Register a single-shot watch.
    async fn watch(&self, path: &str, kind: WatchKind) -> Result<WatchHandle, CoordError>;

    /// End the session, removing its ephemeral nodes.
    async fn close(&self) -> Result<(), CoordError>;
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of an absolute path, or `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Delete a node and everything beneath it, children first.
///
/// Nodes that disappear concurrently are ignored.
pub async fn delete_recursive(coord: &dyn Coordinator, path: &str) -> Result<(), CoordError> {
    let mut stack = vec![(path.to_string(), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            match coord.delete(&node).await {
                Ok(()) | Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
            continue;
        }

        stack.push((node.clone(), true));
        for child in coord.get_children(&node).await? {
            stack.push((join_path(&node, &child), false));
        }
    }

    Ok(())
}
