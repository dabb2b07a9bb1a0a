// src/coord/memory.rs

//! In-process implementation of the coordination contract.
//!
//! A [`MemoryEnsemble`] is the shared namespace (the "server"); every
//! [`MemoryEnsemble::connect`] call opens a new session and returns a
//! [`MemoryCoordinator`] bound to it. Closing or expiring a session removes
//! its ephemeral nodes and fires the matching watches, which is exactly the
//! mechanism crash recovery relies on.
//!
//! Workers in one process that share an ensemble behave like independent
//! processes sharing a real coordination service.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    parent_path, CoordError, Coordinator, CreateMode, CreateOutcome, NodeStat, WatchEvent,
    WatchHandle, WatchKind,
};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes.
    owner: Option<String>,
    children: BTreeSet<String>,
    next_sequence: u64,
    created_seq: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<String>, created_seq: u64) -> Self {
        Self {
            data,
            owner,
            children: BTreeSet::new(),
            next_sequence: 0,
            created_seq,
        }
    }
}

#[derive(Debug)]
struct Watcher {
    path: String,
    kind: WatchKind,
    session: String,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<String, Node>,
    watchers: Vec<Watcher>,
    live_sessions: HashSet<String>,
    injected_failures: u32,
    /// Creation order handed to the next node.
    next_created_seq: u64,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None, 0));
        Self {
            nodes,
            watchers: Vec::new(),
            live_sessions: HashSet::new(),
            injected_failures: 0,
            next_created_seq: 1,
        }
    }

    fn check_session(&mut self, session: &str) -> Result<(), CoordError> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(CoordError::ConnectionLoss);
        }
        if !self.live_sessions.contains(session) {
            return Err(CoordError::SessionExpired);
        }
        Ok(())
    }

    fn fire(&mut self, path: &str, kind: WatchKind) {
        let mut remaining = Vec::with_capacity(self.watchers.len());
        for watcher in self.watchers.drain(..) {
            if watcher.tx.is_closed() {
                continue;
            }
            if watcher.path == path && watcher.kind == kind {
                let _ = watcher.tx.send(WatchEvent {
                    path: path.to_string(),
                    kind,
                });
            } else {
                remaining.push(watcher);
            }
        }
        self.watchers = remaining;
    }

    /// Insert a node whose parent is known to exist.
    fn insert(&mut self, path: &str, data: Vec<u8>, owner: Option<String>) -> Result<(), CoordError> {
        let parent = parent_path(path).ok_or_else(|| CoordError::BadPath(path.to_string()))?;
        let name = &path[parent.len() + usize::from(parent != "/")..];

        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| CoordError::NoNode(parent.to_string()))?;
        if parent_node.owner.is_some() {
            return Err(CoordError::NoChildrenForEphemerals(parent.to_string()));
        }
        parent_node.children.insert(name.to_string());

        let created_seq = self.next_created_seq;
        self.next_created_seq += 1;
        self.nodes
            .insert(path.to_string(), Node::new(data, owner, created_seq));
        self.fire(path, WatchKind::Created);
        self.fire(parent, WatchKind::ChildrenChanged);
        Ok(())
    }

    fn ensure_parents(&mut self, path: &str) -> Result<(), CoordError> {
        let mut missing = Vec::new();
        let mut current = parent_path(path);
        while let Some(p) = current {
            if self.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            current = parent_path(p);
        }

        for p in missing.into_iter().rev() {
            self.insert(&p, Vec::new(), None)?;
        }
        Ok(())
    }

    fn create(
        &mut self,
        session: &str,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<CreateOutcome, CoordError> {
        validate_path(path)?;
        if path == "/" || self.nodes.contains_key(path) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        self.ensure_parents(path)?;
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session.to_string()),
        };
        self.insert(path, data.to_vec(), owner)?;
        Ok(CreateOutcome::Created)
    }

    fn create_sequential(
        &mut self,
        session: &str,
        prefix: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        validate_path(prefix)?;
        self.ensure_parents(prefix)?;

        let parent = parent_path(prefix).ok_or_else(|| CoordError::BadPath(prefix.to_string()))?;
        let sequence = {
            let node = self
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordError::NoNode(parent.to_string()))?;
            let seq = node.next_sequence;
            node.next_sequence += 1;
            seq
        };

        let path = format!("{prefix}{sequence:010}");
        match self.create(session, &path, data, mode)? {
            CreateOutcome::Created => Ok(path),
            // A caller created a node with a sequence-like name by hand.
            CreateOutcome::AlreadyExists => Err(CoordError::BadPath(path)),
        }
    }

    fn delete(&mut self, path: &str) -> Result<(), CoordError> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordError::BadPath(path.to_string()));
        }

        match self.nodes.get(path) {
            None => return Err(CoordError::NoNode(path.to_string())),
            Some(node) if !node.children.is_empty() => {
                return Err(CoordError::NotEmpty(path.to_string()));
            }
            Some(_) => {}
        }

        self.nodes.remove(path);
        if let Some(parent) = parent_path(path) {
            let name = &path[parent.len() + usize::from(parent != "/")..];
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.remove(name);
            }
            self.fire(path, WatchKind::Deleted);
            self.fire(parent, WatchKind::ChildrenChanged);
        }
        Ok(())
    }

    fn end_session(&mut self, session: &str) -> usize {
        if !self.live_sessions.remove(session) {
            return 0;
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner.as_deref() == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        let mut removed = 0;
        for path in owned {
            if self.delete(&path).is_ok() {
                removed += 1;
            }
        }

        self.watchers.retain(|w| w.session != session);
        removed
    }
}

fn validate_path(path: &str) -> Result<(), CoordError> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(CoordError::BadPath(path.to_string()))
    }
}

/// Shared in-memory namespace.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new session.
    pub fn connect(&self) -> MemoryCoordinator {
        let session = Uuid::new_v4().to_string();
        self.tree().live_sessions.insert(session.clone());
        debug!(session = %session, "coordination session opened");
        MemoryCoordinator {
            ensemble: self.clone(),
            session,
        }
    }

    /// Simulate the loss of a session (process crash, network partition).
    ///
    /// Returns the number of ephemeral nodes removed.
    pub fn expire_session(&self, session: &str) -> usize {
        let removed = self.tree().end_session(session);
        info!(session = %session, removed, "coordination session expired");
        removed
    }

    /// Make the next `count` operations, from any session, fail with
    /// [`CoordError::ConnectionLoss`].
    pub fn inject_connection_loss(&self, count: u32) {
        self.tree().injected_failures += count;
    }

    pub fn is_session_alive(&self, session: &str) -> bool {
        self.tree().live_sessions.contains(session)
    }

    /// Registered watches that have neither fired nor been dropped.
    pub fn pending_watches(&self) -> usize {
        self.tree()
            .watchers
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }
}

/// Session-bound client of a [`MemoryEnsemble`].
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    ensemble: MemoryEnsemble,
    session: String,
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    fn session_id(&self) -> &str {
        &self.session
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<CreateOutcome, CoordError> {
        let mut tree = self.ensemble.tree();
        tree.check_session(&self.session)?;
        tree.create(&self.session, path, data, mode)
    }

    async fn create_sequential(
        &self,
        prefix: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        let mut tree = self.ensemble.tree();
        tree.check_session(&self.session)?;
        tree.create_sequential(&self.session, prefix, data, mode)
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        let mut tree = self.ensemble.tree();
        tree.check_session(&self.session)?;
        validate_path(path)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError> {
        let mut tree = self.ensemble.tree();
        tree.check_session(&self.session)?;
        validate_path(path)?;
        Ok(tree.nodes.get(path).map(|n| n.data.clone()))
    }

    async fn stat(&self, path: &str) -> Result<Option<NodeStat>, CoordError> {
        let mut tree = self.ensemble.tree();
        tree.check_session(&self.session)?;
        validate_path(path)?;
        Ok(tree.nodes.get(path).map(|n| NodeStat {
            created_seq: n.created_seq,
        }))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        let mut tree = self.ensemble.tree();
        tree.check_session(&self.session)?;
        validate_path(path)?;
        Ok(tree
            .nodes
            .get(path)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        let mut tree = self.ensemble.tree();
        tree.check_session(&self.session)?;
        tree.delete(path)
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> Result<WatchHandle, CoordError> {
        let mut tree = self.ensemble.tree();
        tree.check_session(&self.session)?;
        validate_path(path)?;

        // Receivers dropped by their owner can never be notified.
        tree.watchers.retain(|w| !w.tx.is_closed());

        let (tx, rx) = oneshot::channel();
        tree.watchers.push(Watcher {
            path: path.to_string(),
            kind,
            session: self.session.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<(), CoordError> {
        let removed = self.ensemble.tree().end_session(&self.session);
        debug!(session = %self.session, removed, "coordination session closed");
        Ok(())
    }
}
